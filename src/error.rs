use std::time::Duration;

use thiserror::Error;

use crate::domain::NormalizedError;

/// Errors that can occur during transport operations.
#[derive(Error, Debug)]
pub enum Error {
    /// `publish` or `execute` was attempted while the transport is stopped.
    #[error("transport is not started")]
    NotStarted,

    /// The transport has been disposed and must not be reused.
    ///
    /// Every RPC call still pending at `dispose()` time is rejected with
    /// this error so no caller awaits forever.
    #[error("transport has been disposed")]
    Disposed,

    /// Broker resource provisioning or connection failed.
    ///
    /// Fatal to `init`/`start`. The transport core never retries; retry
    /// policy is a driver concern.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    /// No reply arrived for an RPC call within its timeout budget.
    #[error("RPC call on {route} timed out after {timeout:?} (correlation id {correlation_id})")]
    RpcTimeout {
        route: String,
        correlation_id: String,
        timeout: Duration,
    },

    /// The remote handler failed; its failure was carried back over the
    /// wire as a [`NormalizedError`].
    #[error("remote handler failed: {}: {}", .0.kind, .0.message)]
    Remote(NormalizedError),

    /// An exact handler is already registered for this route.
    ///
    /// Re-registration must go through `off()` first.
    #[error("a handler is already registered for route {0}")]
    DuplicateRoute(String),

    /// A handler table could not be flattened into route registrations.
    #[error("handler registration failed: {0}")]
    HandlerRegistration(String),

    /// A metadata rule failed while deriving outgoing metadata.
    ///
    /// Rules are expected to be total; a failing rule aborts the send.
    #[error("metadata rule {rule} failed: {message}")]
    MetadataRule { rule: String, message: String },

    /// An application handler failed.
    ///
    /// This is the variant handlers return for their own domain failures.
    /// During dispatch it is normalized and, for messages expecting a
    /// reply, sent back to the caller in place of a result.
    #[error("{0}")]
    Handler(String),

    /// Payload encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A broker driver send or lifecycle primitive failed.
    #[error("driver error: {0}")]
    Driver(String),

    /// A required builder field was not provided.
    #[error("missing required configuration: {0}")]
    MissingConfig(String),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Construct an application-handler failure.
    pub fn handler(message: impl Into<String>) -> Self {
        Error::Handler(message.into())
    }

    /// Wire-safe kind label, used when normalizing a handler failure
    /// into a [`NormalizedError`].
    pub(crate) fn kind(&self) -> &'static str {
        // ---
        match self {
            Error::NotStarted => "NotStartedError",
            Error::Disposed => "TransportDisposedError",
            Error::Infrastructure(_) => "InfrastructureError",
            Error::RpcTimeout { .. } => "RpcTimeoutError",
            Error::Remote(_) => "RemoteError",
            Error::DuplicateRoute(_) => "DuplicateRouteError",
            Error::HandlerRegistration(_) => "HandlerRegistrationError",
            Error::MetadataRule { .. } => "MetadataRuleError",
            Error::Handler(_) => "HandlerError",
            Error::Codec(_) => "CodecError",
            Error::Driver(_) => "DriverError",
            Error::MissingConfig(_) => "MissingConfigError",
        }
    }
}
