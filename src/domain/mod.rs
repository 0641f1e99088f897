//! Domain layer public interface.
//!
//! This module defines the broker-independent abstractions shared by the
//! transport core and driver implementations: wire message shapes, the
//! driver capability interface, and the resource provisioning boundary.
//!
//! All consumers must import symbols via this module, not by referencing
//! individual files directly.

mod driver;
mod message;
mod provision;

// --- Driver boundary re-exports ---

pub use driver::{
    //
    BrokerDriver,
    DriverContext,
    DriverPtr,
    InboundSink,
    RpcActivityProbe,
    SendMessageProps,
    SendReplyMessageProps,
};

// --- Message shape re-exports ---

pub use message::{
    //
    FailedMessage,
    Metadata,
    NormalizedError,
    Referrer,
    TransportCompactMessage,
    TransportMessage,
};

// --- Provisioning re-exports ---

pub use provision::{ResourceProvisioner, ResourceRef};
