// src/domain/provision.rs

//! Broker resource provisioning boundary.
//!
//! Drivers that manage durable broker infrastructure (topics, queues,
//! subscriptions) consume these primitives from a backend-specific
//! provisioner. Every operation is idempotent: calling it when the
//! resource already exists succeeds and returns the same stable
//! reference. References are opaque strings usable by send primitives,
//! analogous to an ARN, queue URL, or subject name.

use std::sync::Arc;

use crate::Result;

/// Stable reference to a provisioned broker resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef(pub Arc<str>);

impl ResourceRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for ResourceRef
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        ResourceRef(value.into())
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Idempotent broker infrastructure primitives.
///
/// # Errors
///
/// All operations return [`crate::Error::Infrastructure`] on conflict or
/// backend failure; absence of a resource is never an error for the
/// `ensure_*` and `delete_*` operations.
#[async_trait::async_trait]
pub trait ResourceProvisioner: Send + Sync {
    /// Ensure a topic exists, returning its stable reference.
    async fn ensure_topic_exists(&self, name: &str) -> Result<ResourceRef>;

    /// Ensure a queue exists with the given dead-letter target and FIFO
    /// setting, returning its stable reference.
    ///
    /// Re-ensuring with a conflicting configuration is an infrastructure
    /// error; re-ensuring with the same configuration returns the
    /// existing reference.
    async fn ensure_queue_exists(
        &self,
        name: &str,
        dead_letter: Option<&ResourceRef>,
        fifo: bool,
    ) -> Result<ResourceRef>;

    /// Ensure a topic-to-queue subscription exists covering `patterns`.
    ///
    /// With `keep_existing_filters` the new patterns are unioned with any
    /// already-subscribed set; otherwise they replace it.
    async fn ensure_subscription_exists(
        &self,
        topic: &ResourceRef,
        queue: &ResourceRef,
        dead_letter: Option<&ResourceRef>,
        patterns: &[String],
        keep_existing_filters: bool,
    ) -> Result<()>;

    /// Drop any queued messages. No-op if the queue is already empty.
    async fn purge_queue(&self, queue: &ResourceRef) -> Result<()>;

    /// Delete a queue. Deleting an unknown queue is a no-op.
    async fn delete_queue(&self, queue: &ResourceRef) -> Result<()>;
}
