// src/driver/memory/catalog.rs

//! In-memory broker resource catalog.
//!
//! Bookkeeping-only implementation of the provisioning boundary: it
//! tracks which topics, queues, and subscriptions exist and enforces the
//! idempotency contract, without holding message data. The memory driver
//! delivers directly into the transport core, so queues never accumulate
//! a backlog; `purge_queue` validates the reference and is otherwise a
//! no-op.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::{ResourceProvisioner, ResourceRef};
use crate::rpc_tracker::lock_ignore_poison;
use crate::{Error, Result};

struct QueueRecord {
    reference: ResourceRef,
    dead_letter: Option<ResourceRef>,
    fifo: bool,
}

#[derive(Default)]
struct CatalogState {
    topics: HashMap<String, ResourceRef>,
    queues: HashMap<String, QueueRecord>,
    /// (topic ref, queue ref) -> subscribed patterns.
    subscriptions: HashMap<(ResourceRef, ResourceRef), Vec<String>>,
}

/// In-memory implementation of [`ResourceProvisioner`].
pub struct MemoryResourceCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryResourceCatalog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CatalogState::default()),
        }
    }

    /// Patterns currently subscribed between a topic and a queue.
    /// Empty when no subscription exists.
    pub fn subscribed_patterns(&self, topic: &ResourceRef, queue: &ResourceRef) -> Vec<String> {
        // ---
        lock_ignore_poison(&self.state)
            .subscriptions
            .get(&(topic.clone(), queue.clone()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn queue_exists(&self, queue: &ResourceRef) -> bool {
        lock_ignore_poison(&self.state)
            .queues
            .values()
            .any(|record| record.reference == *queue)
    }
}

impl Default for MemoryResourceCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ResourceProvisioner for MemoryResourceCatalog {
    async fn ensure_topic_exists(&self, name: &str) -> Result<ResourceRef> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        let reference = state
            .topics
            .entry(name.to_string())
            .or_insert_with(|| ResourceRef::from(format!("memory://topic/{name}")));

        Ok(reference.clone())
    }

    async fn ensure_queue_exists(
        &self,
        name: &str,
        dead_letter: Option<&ResourceRef>,
        fifo: bool,
    ) -> Result<ResourceRef> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        if let Some(existing) = state.queues.get(name) {
            // Idempotent only for an identical configuration.
            if existing.fifo != fifo || existing.dead_letter.as_ref() != dead_letter {
                return Err(Error::Infrastructure(format!(
                    "queue {name} already exists with a conflicting configuration"
                )));
            }
            return Ok(existing.reference.clone());
        }

        let reference = ResourceRef::from(format!("memory://queue/{name}"));
        state.queues.insert(
            name.to_string(),
            QueueRecord {
                reference: reference.clone(),
                dead_letter: dead_letter.cloned(),
                fifo,
            },
        );

        Ok(reference)
    }

    async fn ensure_subscription_exists(
        &self,
        topic: &ResourceRef,
        queue: &ResourceRef,
        _dead_letter: Option<&ResourceRef>,
        patterns: &[String],
        keep_existing_filters: bool,
    ) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        let key = (topic.clone(), queue.clone());
        let existing = state.subscriptions.entry(key).or_default();

        if keep_existing_filters {
            for pattern in patterns {
                if !existing.contains(pattern) {
                    existing.push(pattern.clone());
                }
            }
        } else {
            *existing = patterns.to_vec();
        }

        Ok(())
    }

    async fn purge_queue(&self, queue: &ResourceRef) -> Result<()> {
        // ---
        if !self.queue_exists(queue) {
            return Err(Error::Infrastructure(format!(
                "cannot purge unknown queue {queue}"
            )));
        }
        // The memory broker delivers directly, so there is never a
        // backlog to drop.
        Ok(())
    }

    async fn delete_queue(&self, queue: &ResourceRef) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        state
            .queues
            .retain(|_, record| record.reference != *queue);
        state
            .subscriptions
            .retain(|(_, subscribed_queue), _| subscribed_queue != queue);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn ensure_topic_is_idempotent() {
        // ---
        let catalog = MemoryResourceCatalog::new();

        let first = catalog.ensure_topic_exists("user-service").await.unwrap();
        let second = catalog.ensure_topic_exists("user-service").await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn ensure_queue_rejects_conflicting_config() {
        // ---
        let catalog = MemoryResourceCatalog::new();

        let queue = catalog
            .ensure_queue_exists("user-service", None, true)
            .await
            .unwrap();

        // Same configuration: same reference
        let again = catalog
            .ensure_queue_exists("user-service", None, true)
            .await
            .unwrap();
        assert_eq!(queue, again);

        // Different fifo setting: conflict
        let err = catalog
            .ensure_queue_exists("user-service", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Infrastructure(_)));
    }

    #[tokio::test]
    async fn subscription_replace_and_union() {
        // ---
        let catalog = MemoryResourceCatalog::new();

        let topic = catalog.ensure_topic_exists("bus").await.unwrap();
        let queue = catalog
            .ensure_queue_exists("user-service", None, true)
            .await
            .unwrap();

        let first = vec!["Event.User".to_string()];
        catalog
            .ensure_subscription_exists(&topic, &queue, None, &first, false)
            .await
            .unwrap();

        // keep_existing_filters unions instead of replacing
        let second = vec!["Command.User.Login".to_string()];
        catalog
            .ensure_subscription_exists(&topic, &queue, None, &second, true)
            .await
            .unwrap();

        let patterns = catalog.subscribed_patterns(&topic, &queue);
        assert_eq!(patterns.len(), 2);

        // Replace drops what came before
        catalog
            .ensure_subscription_exists(&topic, &queue, None, &second, false)
            .await
            .unwrap();
        assert_eq!(catalog.subscribed_patterns(&topic, &queue), second);
    }

    #[tokio::test]
    async fn delete_queue_is_idempotent() {
        // ---
        let catalog = MemoryResourceCatalog::new();

        let queue = catalog
            .ensure_queue_exists("response-1", None, false)
            .await
            .unwrap();
        assert!(catalog.queue_exists(&queue));

        catalog.delete_queue(&queue).await.unwrap();
        assert!(!catalog.queue_exists(&queue));

        // Deleting again is a no-op
        catalog.delete_queue(&queue).await.unwrap();
    }

    #[tokio::test]
    async fn purge_unknown_queue_fails() {
        // ---
        let catalog = MemoryResourceCatalog::new();
        let ghost = ResourceRef::from("memory://queue/ghost");

        assert!(matches!(
            catalog.purge_queue(&ghost).await,
            Err(Error::Infrastructure(_))
        ));
    }
}
