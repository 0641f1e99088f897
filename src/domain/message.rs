// src/domain/message.rs

//! Wire and handler-facing message shapes.
//!
//! A [`TransportMessage`] is the unit carried over the wire: an opaque
//! encoded payload plus the routing and correlation fields the core needs.
//! Handlers never see it directly; dispatch narrows it down to a
//! [`TransportCompactMessage`] with the payload already decoded.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Message metadata: free-form string keyed map, opaque to drivers.
pub type Metadata = serde_json::Map<String, Value>;

/// Serializable projection of a handler failure.
///
/// Carried back over the wire in place of a successful result, and
/// reconstructed on the calling side as [`Error::Remote`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedError {
    /// Stable failure kind, e.g. `"HandlerError"`.
    pub kind: String,
    /// Human-readable failure message.
    pub message: String,
    /// Optional structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl NormalizedError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Project a handler failure into its wire-safe shape.
    ///
    /// [`Error::Handler`] keeps its raw message so the remote caller sees
    /// exactly what the handler reported; an already-remote error passes
    /// through unchanged instead of double-wrapping.
    pub fn from_error(err: &Error) -> Self {
        // ---
        match err {
            Error::Handler(message) => Self::new(err.kind(), message.clone()),
            Error::Remote(inner) => inner.clone(),
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

/// Wire message envelope.
///
/// Constructed by drivers on the inbound side and by the core on the
/// outbound side. The payload is opaque encoded bytes; the core inspects
/// only route, metadata and correlation fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Dot-segmented route, conventionally `<Kind>.<Namespace>.<Action>`.
    pub route: String,

    /// Opaque encoded payload.
    pub payload: Bytes,

    /// Message metadata, merged by the metadata pipeline on send.
    pub metadata: Metadata,

    /// Correlation identifier. Always present; only meaningful for
    /// matching when an RPC call is pending.
    pub correlation_id: String,

    /// Reply address. Present on RPC requests, never on replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Set on reply messages when the remote handler failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_data: Option<NormalizedError>,
}

impl TransportMessage {
    /// Create a forward-delivery envelope (no reply expected).
    pub fn new(
        route: impl Into<String>,
        payload: Bytes,
        metadata: Metadata,
        correlation_id: impl Into<String>,
    ) -> Self {
        // ---
        Self {
            route: route.into(),
            payload,
            metadata,
            correlation_id: correlation_id.into(),
            reply_to: None,
            error_data: None,
        }
    }

    /// Attach a reply address, turning this into an RPC request envelope.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Attach error data, turning this into a failed-reply envelope.
    pub fn with_error_data(mut self, error_data: NormalizedError) -> Self {
        self.error_data = Some(error_data);
        self
    }
}

/// Decoded message view passed to route handlers and prefix listeners.
#[derive(Debug, Clone)]
pub struct TransportCompactMessage {
    pub route: String,
    pub message: Value,
    pub metadata: Metadata,
}

/// Originating message context for metadata derivation.
///
/// When a handler publishes or executes as a consequence of an inbound
/// message, passing that message as the referrer lets metadata rules
/// carry values (trace ids, call stacks) across hops.
#[derive(Debug, Clone)]
pub struct Referrer {
    pub route: String,
    pub metadata: Metadata,
}

impl From<&TransportCompactMessage> for Referrer {
    fn from(item: &TransportCompactMessage) -> Self {
        // ---
        Self {
            route: item.route.clone(),
            metadata: item.metadata.clone(),
        }
    }
}

/// A message whose handler failed with no reply channel to report on.
///
/// Delivered to the transport's failed-message hook when one is
/// configured, otherwise logged and dropped.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    pub route: String,
    pub correlation_id: String,
    pub metadata: Metadata,
    pub error: NormalizedError,
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn normalize_handler_error_keeps_raw_message() {
        // ---
        let err = Error::handler("balance too low");
        let normalized = NormalizedError::from_error(&err);

        assert_eq!(normalized.kind, "HandlerError");
        assert_eq!(normalized.message, "balance too low");
    }

    #[test]
    fn normalize_remote_error_passes_through() {
        // ---
        let inner = NormalizedError::new("HandlerError", "X");
        let normalized = NormalizedError::from_error(&Error::Remote(inner.clone()));

        assert_eq!(normalized, inner);
    }

    #[test]
    fn envelope_serde_round_trip() {
        // ---
        let msg = TransportMessage::new(
            "Command.User.Login",
            Bytes::from_static(b"{\"v\":1}"),
            Metadata::new(),
            "corr-1",
        )
        .with_reply_to("svc-response-1");

        let encoded = serde_json::to_vec(&msg).unwrap();
        let decoded: TransportMessage = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(decoded.route, "Command.User.Login");
        assert_eq!(decoded.reply_to.as_deref(), Some("svc-response-1"));
        assert!(decoded.error_data.is_none());
    }
}
