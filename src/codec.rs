//! Pluggable wire encoding.
//!
//! The transport core treats payloads as opaque encoded bytes and only
//! crosses the value/bytes boundary through this seam. The default codec
//! is JSON; alternative encodings implement [`Codec`] without touching
//! the core or any driver.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::Result;

/// Encode/decode boundary between handler-facing values and wire bytes.
pub trait Codec: Send + Sync {
    /// Encode a value into payload bytes.
    fn encode(&self, value: &Value) -> Result<Bytes>;

    /// Decode payload bytes back into a value.
    fn decode(&self, payload: &[u8]) -> Result<Value>;
}

/// Shared codec pointer.
pub type CodecPtr = Arc<dyn Codec>;

/// JSON codec backed by `serde_json`. This is the crate default.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, payload: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(payload)?)
    }
}
