use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique correlation identifier linking an RPC request to its eventual reply.
///
/// Correlation ids are carried in-band inside the wire envelope and are
/// opaque to broker drivers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new unique correlation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the correlation id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the id, yielding the underlying string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Explicit id-generation capability handed to broker drivers.
///
/// Drivers need unique suffixes for transport-private resources such as
/// per-instance response queues. Rather than reaching for ambient state,
/// they are constructed with an `IdSource` value they own.
#[derive(Clone)]
pub struct IdSource(Arc<dyn Fn() -> String + Send + Sync>);

impl IdSource {
    /// UUID v4 based generator.
    pub fn uuid() -> Self {
        Self(Arc::new(|| Uuid::new_v4().to_string()))
    }

    /// Build a source from an arbitrary generator function.
    ///
    /// Useful in tests where deterministic names are wanted.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Produce the next identifier.
    pub fn next_id(&self) -> String {
        (self.0)()
    }
}

impl Default for IdSource {
    fn default() -> Self {
        Self::uuid()
    }
}

impl fmt::Debug for IdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdSource")
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn generate_unique() {
        // ---
        let id1 = CorrelationId::generate();
        let id2 = CorrelationId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn format() {
        // ---
        let id = CorrelationId::generate();
        assert_eq!(id.to_string().len(), 36); // Standard UUID format
    }

    #[test]
    fn id_source_from_fn() {
        // ---
        let source = IdSource::from_fn(|| "fixed".to_string());
        assert_eq!(source.next_id(), "fixed");
        assert_eq!(source.next_id(), "fixed");
    }
}
