//! Transport builder.
//!
//! Fluent construction of [`Transport`] instances with clear separation
//! between the required driver and optional configuration.

use std::sync::Arc;

use crate::codec::{Codec, CodecPtr};
use crate::domain::{DriverPtr, FailedMessage};
use crate::metadata::{MetadataContext, MetadataPipeline};
use crate::transport::{Transport, TransportOptions};
use crate::{Error, Result};

/// Builder for [`Transport`] instances.
///
/// # Example
///
/// ```no_run
/// use polybus::{create_memory_driver, MemoryDriverOptions, TransportBuilder};
///
/// # async fn example() -> polybus::Result<()> {
/// let driver = create_memory_driver(MemoryDriverOptions::new("user-service")).await?;
///
/// let transport = TransportBuilder::new()
///     .driver(driver)
///     .metadata_rule("trace", polybus::rules::propagate(&["traceId"]))
///     .build()?;
///
/// transport.init().await?;
/// transport.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct TransportBuilder {
    driver: Option<DriverPtr>,
    metadata: MetadataPipeline,
    codec: Option<CodecPtr>,
    on_failed_message: Option<Arc<dyn Fn(FailedMessage) + Send + Sync>>,
}

impl TransportBuilder {
    pub fn new() -> Self {
        // ---
        Self {
            driver: None,
            metadata: MetadataPipeline::new(),
            codec: None,
            on_failed_message: None,
        }
    }

    /// Set the broker driver (required).
    pub fn driver(mut self, driver: DriverPtr) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Append a named metadata rule. Rules run in append order on every
    /// outbound send.
    pub fn metadata_rule<F>(mut self, name: impl Into<String>, rule: F) -> Self
    where
        F: Fn(&MetadataContext<'_>) -> Result<crate::domain::Metadata> + Send + Sync + 'static,
    {
        self.metadata = self.metadata.rule(name, rule);
        self
    }

    /// Override the payload codec. Defaults to JSON.
    pub fn codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Receive handler failures that have no reply channel to report on.
    pub fn on_failed_message<F>(mut self, hook: F) -> Self
    where
        F: Fn(FailedMessage) + Send + Sync + 'static,
    {
        self.on_failed_message = Some(Arc::new(hook));
        self
    }

    /// Build the transport (consumes self).
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingConfig`] if no driver was provided.
    pub fn build(self) -> Result<Transport> {
        // ---
        let driver = self
            .driver
            .ok_or_else(|| Error::MissingConfig("driver".into()))?;

        let mut options = TransportOptions {
            metadata: self.metadata,
            ..TransportOptions::default()
        };
        if let Some(codec) = self.codec {
            options.codec = codec;
        }
        options.on_failed_message = self.on_failed_message;

        Ok(Transport::new(driver, options))
    }
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}
