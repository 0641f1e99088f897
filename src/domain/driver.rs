// src/domain/driver.rs

//! Broker driver abstraction.
//!
//! This module defines the narrow capability interface the transport core
//! requires from a broker backend. It intentionally avoids any reference
//! to concrete brokers or client libraries; drivers implement only the
//! send primitives and lifecycle hooks declared here, never the routing,
//! correlation, or timeout machinery.
//!
//! Inbound delivery is funneled through a single [`InboundSink`] handed to
//! the driver at `start()`. Whether the backend is pull-based (a polling
//! loop), push-based (subscription callbacks), or an in-process loopback
//! is invisible to the core: every delivery strategy ends at the same
//! sink, and the sink serializes deliveries into the core's dispatch loop,
//! so drivers running parallel I/O need no further synchronization before
//! calling back in.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::domain::{Metadata, NormalizedError, TransportMessage};
use crate::rpc_tracker::RpcCallTracker;
use crate::{Error, Result};

/// Outbound send request, produced by `publish`/`execute`.
#[derive(Debug, Clone)]
pub struct SendMessageProps {
    pub route: String,
    pub payload: Bytes,
    pub metadata: Metadata,
    pub correlation_id: String,
    /// When true the driver must attach a reply address that resolves
    /// back to this instance's private response channel.
    pub is_rpc: bool,
}

/// Outbound reply request, produced by dispatch after an exact handler
/// ran for a message that carried a reply address.
#[derive(Debug, Clone)]
pub struct SendReplyMessageProps {
    pub reply_to: String,
    pub correlation_id: String,
    pub payload: Bytes,
    pub metadata: Metadata,
    /// Present when the handler failed; the payload is then ignored by
    /// the receiving side.
    pub error_data: Option<NormalizedError>,
}

/// Single entry point for inbound deliveries.
///
/// Cheap to clone. Deliveries are queued into the core's dispatch loop
/// and processed in arrival order; `deliver` itself never blocks.
#[derive(Clone)]
pub struct InboundSink {
    tx: mpsc::UnboundedSender<TransportMessage>,
}

impl InboundSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<TransportMessage>) -> Self {
        Self { tx }
    }

    /// Hand an inbound message to the transport core.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the owning transport has been
    /// dropped or disposed.
    pub fn deliver(&self, message: TransportMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::Disposed)
    }
}

/// Read-only view of the RPC call tracker's pending-call count.
///
/// Pull-based drivers use this to decide how long their response-channel
/// poll loop should keep running after `on_rpc_tracker_activated` fires.
#[derive(Clone)]
pub struct RpcActivityProbe {
    tracker: Weak<RpcCallTracker>,
}

impl RpcActivityProbe {
    pub(crate) fn new(tracker: Weak<RpcCallTracker>) -> Self {
        Self { tracker }
    }

    /// Number of RPC calls currently awaiting replies.
    pub fn active_count(&self) -> usize {
        self.tracker
            .upgrade()
            .map(|t| t.active_count())
            .unwrap_or(0)
    }
}

/// Everything a driver needs to begin delivering messages.
///
/// Computed once at `start()`; route registrations made afterwards affect
/// local dispatch but not broker-level subscriptions.
#[derive(Clone)]
pub struct DriverContext {
    /// Exact routes with registered handlers.
    pub routes: Vec<String>,
    /// Registered wildcard prefixes.
    pub prefixes: Vec<String>,
    /// Deduplicated subscription set: every prefix plus each route not
    /// already covered by a prefix ancestor.
    pub patterns: Vec<String>,
    /// Inbound delivery entry point.
    pub inbound: InboundSink,
    /// Pending RPC call count probe.
    pub rpc_activity: RpcActivityProbe,
}

/// Broker driver capability interface.
///
/// One driver instance is owned by exactly one transport core and never
/// shared. Implementations provide best-effort delivery; ordering,
/// correlation, timeouts, and failure normalization live in the core.
///
/// The in-memory driver is the reference implementation of these
/// semantics; broker-backed drivers are expected to approximate its
/// behavior as closely as their underlying system allows.
#[async_trait::async_trait]
pub trait BrokerDriver: Send + Sync {
    /// Timeout applied to `execute` calls that do not supply their own.
    fn default_rpc_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Idempotent resource provisioning. Safe to retry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Infrastructure`] on unrecoverable provisioning
    /// failure.
    async fn init(&self) -> Result<()>;

    /// Begin delivering messages for the routes and prefixes in `ctx`.
    async fn start(&self, ctx: DriverContext) -> Result<()>;

    /// Fire a message at the broker.
    async fn send_message(&self, props: SendMessageProps) -> Result<()>;

    /// Deliver a reply to the originating caller's reply address.
    async fn send_reply_message(&self, props: SendReplyMessageProps) -> Result<()>;

    /// Pending RPC call count transitioned 0 to 1: start the
    /// response-channel listener.
    async fn on_rpc_tracker_activated(&self) {}

    /// Pending RPC call count returned to 0: the listener may stop.
    async fn on_rpc_tracker_drained(&self) {}

    /// Stop accepting new deliveries. Durable infrastructure survives.
    async fn stop(&self) -> Result<()>;

    /// Delete transport-private resources such as the per-instance
    /// response channel.
    async fn dispose(&self) -> Result<()>;
}

/// Shared driver pointer.
pub type DriverPtr = Arc<dyn BrokerDriver>;
