//! Broker-agnostic pub/sub and RPC transport.
//!
//! This library provides a uniform publish/subscribe and request/response
//! contract that runs unmodified over different message brokers. Service
//! modules exchange Commands, Queries, and Events addressed by
//! dot-segmented routes without knowing which broker technology is in
//! use; backend specifics live behind the narrow [`BrokerDriver`]
//! capability interface.
//!
//! The transport core handles route registration and wildcard-prefix
//! matching, outgoing metadata derivation, RPC correlation and timeouts,
//! and normalization of handler failures into a wire-safe error shape.

// Import all sub modules once...
mod builder;
mod codec;
mod correlation;
mod cqrs;
mod domain;
mod driver;
mod error;
mod metadata;
mod registry;
mod rpc_tracker;
mod transport;

// Re-export main types
pub use transport::{
    //
    ExecuteProps,
    FailedMessageHook,
    PublishProps,
    Transport,
    TransportOptions,
    TransportState,
};

pub use builder::TransportBuilder;

pub use correlation::{CorrelationId, IdSource};
pub use error::{Error, Result};

pub use codec::{Codec, CodecPtr, JsonCodec};
pub use cqrs::{handle_cqrs_api, CqrsApi};
pub use metadata::{rules, MetadataContext, MetadataPipeline, MetadataRule};
pub use registry::{wrap_handler, HandlerFuture, PrefixListenerFn, RouteHandlerFn};

// --- domain re-exports
pub use domain::{
    //
    BrokerDriver,
    DriverContext,
    DriverPtr,
    FailedMessage,
    InboundSink,
    Metadata,
    NormalizedError,
    Referrer,
    ResourceProvisioner,
    ResourceRef,
    RpcActivityProbe,
    SendMessageProps,
    SendReplyMessageProps,
    TransportCompactMessage,
    TransportMessage,
};

// --- driver re-exports
pub use driver::{create_memory_driver, MemoryDriverOptions, MemoryResourceCatalog};
