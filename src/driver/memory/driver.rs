// src/driver/memory/driver.rs

//! In-memory broker driver implementation.
//!
//! This file contains the concrete implementation of the domain-level
//! [`BrokerDriver`] trait using in-process data structures only.
//!
//! The memory driver is the **reference implementation** of driver
//! semantics. Broker-backed drivers are expected to approximate this
//! behavior as closely as their underlying systems allow and to document
//! any unavoidable deviations.
//!
//! ## Semantics
//!
//! - Messages loop back into the owning transport's inbound sink; there
//!   is no cross-process delivery.
//! - `send_message` is accepted only while the driver is started;
//!   replies keep flowing after `stop()` so in-flight RPC calls can
//!   still complete.
//! - Infrastructure is simulated through a [`MemoryResourceCatalog`]:
//!   `init()` provisions the module topic, a FIFO module queue with a
//!   FIFO dead-letter queue, and a per-instance response queue;
//!   `dispose()` deletes the response queue.
//!
//! ## Non-Goals
//!
//! - Persistence or durability
//! - Network behavior or failure simulation
//! - Exact emulation of any specific broker's semantics

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::correlation::IdSource;
use crate::domain::{
    //
    BrokerDriver,
    DriverContext,
    DriverPtr,
    ResourceProvisioner,
    ResourceRef,
    SendMessageProps,
    SendReplyMessageProps,
    TransportMessage,
};
use crate::rpc_tracker::lock_ignore_poison;
use crate::{Error, Result};

use super::catalog::MemoryResourceCatalog;

/// Configuration for the in-memory driver.
#[derive(Clone, Debug)]
pub struct MemoryDriverOptions {
    /// Logical module name; used for topic and queue naming.
    pub module_name: String,

    /// Timeout applied to `execute` calls that do not supply their own.
    pub default_rpc_timeout: Duration,

    /// Purge the module and dead-letter queues at `start()`.
    pub purge_on_start: bool,

    /// Generator for the per-instance response queue suffix.
    pub id_source: IdSource,
}

impl MemoryDriverOptions {
    pub fn new(module_name: impl Into<String>) -> Self {
        // ---
        Self {
            module_name: module_name.into(),
            default_rpc_timeout: Duration::from_secs(30),
            purge_on_start: false,
            id_source: IdSource::uuid(),
        }
    }

    pub fn default_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.default_rpc_timeout = timeout;
        self
    }

    pub fn purge_on_start(mut self, purge: bool) -> Self {
        self.purge_on_start = purge;
        self
    }

    pub fn id_source(mut self, id_source: IdSource) -> Self {
        self.id_source = id_source;
        self
    }
}

#[derive(Clone)]
struct ProvisionedResources {
    topic: ResourceRef,
    queue: ResourceRef,
    dead_letter: ResourceRef,
    response_queue: ResourceRef,
}

struct DriverState {
    resources: Option<ProvisionedResources>,
    ctx: Option<DriverContext>,
    delivering: bool,
}

/// In-memory broker driver.
struct MemoryBrokerDriver {
    options: MemoryDriverOptions,
    catalog: MemoryResourceCatalog,
    /// Name of this instance's private response queue, fixed at
    /// construction so repeated `init()` calls stay idempotent.
    response_queue_name: String,
    state: Mutex<DriverState>,
    /// Response-channel listener state, toggled by the tracker hooks.
    listening: AtomicBool,
}

impl MemoryBrokerDriver {
    fn new(options: MemoryDriverOptions) -> Self {
        // ---
        let response_queue_name = format!(
            "{}-response-{}",
            options.module_name,
            options.id_source.next_id()
        );

        Self {
            options,
            catalog: MemoryResourceCatalog::new(),
            response_queue_name,
            state: Mutex::new(DriverState {
                resources: None,
                ctx: None,
                delivering: false,
            }),
            listening: AtomicBool::new(false),
        }
    }

    async fn ensure_provisioned(&self) -> Result<ProvisionedResources> {
        // ---
        if let Some(resources) = lock_ignore_poison(&self.state).resources.clone() {
            return Ok(resources);
        }

        let module = &self.options.module_name;

        let topic = self.catalog.ensure_topic_exists(module).await?;

        let dead_letter = self
            .catalog
            .ensure_queue_exists(&format!("{module}-dl"), None, true)
            .await?;

        let queue = self
            .catalog
            .ensure_queue_exists(module, Some(&dead_letter), true)
            .await?;

        let response_queue = self
            .catalog
            .ensure_queue_exists(&self.response_queue_name, None, false)
            .await?;

        let resources = ProvisionedResources {
            topic,
            queue,
            dead_letter,
            response_queue,
        };

        lock_ignore_poison(&self.state).resources = Some(resources.clone());
        tracing::debug!(%module, "memory broker resources provisioned");

        Ok(resources)
    }

    fn deliver(&self, message: TransportMessage) -> Result<()> {
        // ---
        let sink = {
            let state = lock_ignore_poison(&self.state);
            state.ctx.as_ref().map(|ctx| ctx.inbound.clone())
        };

        match sink {
            Some(sink) => sink.deliver(message),
            None => Err(Error::Driver(
                "memory driver has no delivery context".into(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl BrokerDriver for MemoryBrokerDriver {
    fn default_rpc_timeout(&self) -> Duration {
        self.options.default_rpc_timeout
    }

    async fn init(&self) -> Result<()> {
        self.ensure_provisioned().await.map(|_| ())
    }

    async fn start(&self, ctx: DriverContext) -> Result<()> {
        // ---
        let resources = self.ensure_provisioned().await?;

        if self.options.purge_on_start {
            self.catalog.purge_queue(&resources.queue).await?;
            self.catalog.purge_queue(&resources.dead_letter).await?;
        }

        self.catalog
            .ensure_subscription_exists(
                &resources.topic,
                &resources.queue,
                Some(&resources.dead_letter),
                &ctx.patterns,
                false,
            )
            .await?;

        tracing::debug!(
            module = %self.options.module_name,
            patterns = ?ctx.patterns,
            "memory driver subscriptions configured"
        );

        let mut state = lock_ignore_poison(&self.state);
        state.ctx = Some(ctx);
        state.delivering = true;
        Ok(())
    }

    async fn send_message(&self, props: SendMessageProps) -> Result<()> {
        // ---
        if !lock_ignore_poison(&self.state).delivering {
            return Err(Error::Driver("memory driver is not started".into()));
        }

        let mut message = TransportMessage::new(
            props.route,
            props.payload,
            props.metadata,
            props.correlation_id,
        );

        if props.is_rpc {
            message = message.with_reply_to(self.response_queue_name.clone());
        }

        self.deliver(message)
    }

    async fn send_reply_message(&self, props: SendReplyMessageProps) -> Result<()> {
        // ---
        // Replies are accepted even after stop() so in-flight calls can
        // settle; only forward delivery is gated on the started state.
        if !self.listening.load(Ordering::SeqCst) {
            tracing::debug!(
                reply_to = %props.reply_to,
                "reply sent while response listener inactive"
            );
        }

        let mut message = TransportMessage::new(
            props.reply_to,
            props.payload,
            props.metadata,
            props.correlation_id,
        );

        if let Some(error_data) = props.error_data {
            message = message.with_error_data(error_data);
        }

        self.deliver(message)
    }

    async fn on_rpc_tracker_activated(&self) {
        // ---
        self.listening.store(true, Ordering::SeqCst);
        tracing::debug!(
            queue = %self.response_queue_name,
            "response listener started"
        );
    }

    async fn on_rpc_tracker_drained(&self) {
        // ---
        self.listening.store(false, Ordering::SeqCst);
        tracing::debug!(
            queue = %self.response_queue_name,
            "response listener stopped"
        );
    }

    async fn stop(&self) -> Result<()> {
        // ---
        lock_ignore_poison(&self.state).delivering = false;
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        // ---
        let resources = {
            let mut state = lock_ignore_poison(&self.state);
            state.delivering = false;
            state.ctx = None;
            state.resources.take()
        };

        if let Some(resources) = resources {
            self.catalog.delete_queue(&resources.response_queue).await?;
            tracing::debug!(
                queue = %self.response_queue_name,
                "response queue deleted"
            );
        }

        Ok(())
    }
}

/// Create a new in-memory broker driver.
///
/// Always available and requires no external resources. Messages loop
/// back into the owning transport only; for cross-module messaging use a
/// broker-backed driver.
pub async fn create_memory_driver(options: MemoryDriverOptions) -> Result<DriverPtr> {
    // ---
    Ok(Arc::new(MemoryBrokerDriver::new(options)))
}
