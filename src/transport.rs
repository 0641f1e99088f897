//! Transport core: state machine, public contract, and inbound dispatch.
//!
//! The core composes the route registry, metadata pipeline, RPC call
//! tracker, and a broker driver into the uniform publish/subscribe and
//! request/response contract. It owns the registry and tracker for its
//! lifetime; the driver is owned by exactly one core instance and never
//! shared.
//!
//! # Concurrency model
//!
//! All inbound deliveries, whatever delivery strategy the driver uses,
//! funnel through one [`InboundSink`] into a single dispatch task, so
//! registry lookups and tracker resolutions are processed in arrival
//! order. Handler executions are spawned off that task; a slow handler
//! never stalls dispatch. Exact handlers run once per delivery; prefix
//! listeners run inline and their failures are logged, never propagated.
//!
//! # Lifecycle
//!
//! STOPPED (initial) to STARTED via `start()`, back via `stop()`.
//! `dispose()` is terminal from either state: it tears down
//! transport-private driver resources and rejects every pending RPC call
//! so no caller awaits forever. `stop()` by contrast leaves in-flight
//! calls alone; they may still complete if the driver keeps its response
//! channel open.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{CodecPtr, JsonCodec};
use crate::correlation::CorrelationId;
use crate::domain::{
    //
    DriverContext,
    DriverPtr,
    FailedMessage,
    InboundSink,
    Metadata,
    NormalizedError,
    Referrer,
    RpcActivityProbe,
    SendMessageProps,
    SendReplyMessageProps,
    TransportCompactMessage,
    TransportMessage,
};
use crate::metadata::MetadataPipeline;
use crate::registry::{wrap_handler, PrefixListenerFn, RouteHandlerFn, RouteRegistry};
use crate::rpc_tracker::{lock_ignore_poison, RpcActivityHook, RpcCallTracker};
use crate::{Error, Result};

/// Publicly observable transport state.
///
/// `publish` and `execute` require [`Started`](TransportState::Started).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Started,
}

/// Internal lifecycle; disposal is tracked separately from the public
/// two-state view because a disposed instance refuses every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Started,
    Disposed,
}

/// Hook invoked when a handler fails on a message with no reply channel.
pub type FailedMessageHook = Arc<dyn Fn(FailedMessage) + Send + Sync>;

/// Transport construction options.
///
/// Prefer [`TransportBuilder`](crate::TransportBuilder) for the fluent
/// form; this struct is the explicit equivalent.
#[derive(Clone)]
pub struct TransportOptions {
    /// Ordered metadata derivation rules applied on every send.
    pub metadata: MetadataPipeline,
    /// Payload codec. Defaults to JSON.
    pub codec: CodecPtr,
    /// Failed-message hook for handler failures that cannot be replied.
    pub on_failed_message: Option<FailedMessageHook>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        // ---
        Self {
            metadata: MetadataPipeline::new(),
            codec: Arc::new(JsonCodec),
            on_failed_message: None,
        }
    }
}

/// Send parameters for `publish`.
#[derive(Clone)]
pub struct PublishProps {
    pub route: String,
    pub message: Value,
    pub metadata: Option<Metadata>,
    pub referrer: Option<Referrer>,
}

impl PublishProps {
    pub fn new(route: impl Into<String>, message: Value) -> Self {
        // ---
        Self {
            route: route.into(),
            message,
            metadata: None,
            referrer: None,
        }
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn referrer(mut self, referrer: Referrer) -> Self {
        self.referrer = Some(referrer);
        self
    }
}

/// Send parameters for `execute`.
#[derive(Clone)]
pub struct ExecuteProps {
    pub route: String,
    pub message: Value,
    pub metadata: Option<Metadata>,
    pub referrer: Option<Referrer>,
    /// Per-call timeout; the driver default applies when absent.
    pub rpc_timeout: Option<Duration>,
}

impl ExecuteProps {
    pub fn new(route: impl Into<String>, message: Value) -> Self {
        // ---
        Self {
            route: route.into(),
            message,
            metadata: None,
            referrer: None,
            rpc_timeout: None,
        }
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn referrer(mut self, referrer: Referrer) -> Self {
        self.referrer = Some(referrer);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }
}

/// Broker-agnostic messaging transport.
///
/// Cheap to clone (internally `Arc`-backed). Must be constructed inside
/// a tokio runtime; construction spawns the dispatch task.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    driver: DriverPtr,
    codec: CodecPtr,
    metadata: MetadataPipeline,
    registry: Mutex<RouteRegistry>,
    tracker: Arc<RpcCallTracker>,
    lifecycle: Mutex<Lifecycle>,
    inbound_tx: mpsc::UnboundedSender<TransportMessage>,
    on_failed_message: Option<FailedMessageHook>,

    /// Dispatch loop handle. Kept so the task is not dropped while the
    /// transport is alive; the loop exits when the inbound channel or
    /// the inner state goes away.
    _dispatch_task: JoinHandle<()>,
}

/// Bridges tracker count transitions onto the driver's async hooks.
struct DriverActivityBridge {
    driver: DriverPtr,
}

impl RpcActivityHook for DriverActivityBridge {
    fn on_first_call(&self) {
        // ---
        let driver = self.driver.clone();
        tokio::spawn(async move {
            driver.on_rpc_tracker_activated().await;
        });
    }

    fn on_last_call_settled(&self) {
        // ---
        let driver = self.driver.clone();
        tokio::spawn(async move {
            driver.on_rpc_tracker_drained().await;
        });
    }
}

impl Transport {
    /// Create a transport over the given driver.
    ///
    /// The transport starts STOPPED; call [`init`](Self::init) and then
    /// [`start`](Self::start) before publishing.
    pub fn new(driver: DriverPtr, options: TransportOptions) -> Self {
        // ---
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let tracker = RpcCallTracker::new();

        tracker.set_hook(Arc::new(DriverActivityBridge {
            driver: driver.clone(),
        }));

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            // ---
            let dispatch_task = tokio::spawn(dispatch_loop(weak.clone(), inbound_rx));

            Inner {
                driver,
                codec: options.codec,
                metadata: options.metadata,
                registry: Mutex::new(RouteRegistry::new()),
                tracker,
                lifecycle: Mutex::new(Lifecycle::Stopped),
                inbound_tx,
                on_failed_message: options.on_failed_message,
                _dispatch_task: dispatch_task,
            }
        });

        Self { inner }
    }

    /// Current state. A disposed transport reads as STOPPED.
    pub fn state(&self) -> TransportState {
        // ---
        match *lock_ignore_poison(&self.inner.lifecycle) {
            Lifecycle::Started => TransportState::Started,
            Lifecycle::Stopped | Lifecycle::Disposed => TransportState::Stopped,
        }
    }

    pub fn is_disposed(&self) -> bool {
        *lock_ignore_poison(&self.inner.lifecycle) == Lifecycle::Disposed
    }

    /// Provision driver infrastructure. Idempotent, safe to retry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Infrastructure`] on unrecoverable provisioning
    /// failure, [`Error::Disposed`] after disposal.
    pub async fn init(&self) -> Result<()> {
        // ---
        self.inner.ensure_not_disposed()?;
        self.inner.driver.init().await
    }

    /// Register a typed handler for an exact route.
    ///
    /// Legal in any non-disposed state. Registrations made after
    /// `start()` affect local dispatch immediately but do not create
    /// broker-level subscriptions until the next `start()`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRoute`] if the route already has a
    /// handler; call [`off`](Self::off) first to replace one.
    pub fn on<F, Fut, Req, Resp>(&self, route: &str, handler: F) -> Result<()>
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Resp>> + Send + 'static,
        Req: serde::de::DeserializeOwned + Send + 'static,
        Resp: serde::Serialize + Send + 'static,
    {
        self.on_route(route, wrap_handler(handler))
    }

    /// Register a type-erased handler for an exact route.
    pub fn on_route(&self, route: &str, handler: RouteHandlerFn) -> Result<()> {
        // ---
        self.inner.ensure_not_disposed()?;
        lock_ignore_poison(&self.inner.registry).register(route, handler)
    }

    /// Remove the handler for a route. Idempotent.
    pub fn off(&self, route: &str) {
        lock_ignore_poison(&self.inner.registry).unregister(route);
    }

    /// Register a fire-and-forget listener on every given prefix.
    ///
    /// A listener sees each message whose route is a dot-segment
    /// descendant of one of its prefixes. Listener failures are logged
    /// and never affect other listeners or the exact handler.
    pub fn on_every<F>(&self, prefixes: &[&str], listener: F) -> Result<()>
    where
        F: Fn(TransportCompactMessage) -> Result<()> + Send + Sync + 'static,
    {
        // ---
        self.inner.ensure_not_disposed()?;

        let listener: PrefixListenerFn = Arc::new(listener);
        let mut registry = lock_ignore_poison(&self.inner.registry);
        for prefix in prefixes {
            registry.register_prefix(prefix, listener.clone());
        }
        Ok(())
    }

    /// Start message delivery and transition to STARTED.
    ///
    /// The broker subscription set is computed once here from the
    /// registry; handlers registered afterwards do not widen it.
    pub async fn start(&self) -> Result<()> {
        // ---
        self.inner.ensure_not_disposed()?;
        if self.state() == TransportState::Started {
            return Ok(());
        }

        let ctx = {
            let registry = lock_ignore_poison(&self.inner.registry);
            DriverContext {
                routes: registry.routes(),
                prefixes: registry.prefixes(),
                patterns: registry.subscription_patterns(),
                inbound: InboundSink::new(self.inner.inbound_tx.clone()),
                rpc_activity: RpcActivityProbe::new(Arc::downgrade(&self.inner.tracker)),
            }
        };

        self.inner.driver.start(ctx).await?;
        *lock_ignore_poison(&self.inner.lifecycle) = Lifecycle::Started;

        tracing::debug!("transport started");
        Ok(())
    }

    /// Publish a message. No result is returned and no delivery is
    /// confirmed; completion means the driver accepted the send.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] unless the transport is STARTED.
    /// Driver send failures propagate synchronously and are not retried.
    pub async fn publish(&self, route: &str, message: Value) -> Result<()> {
        self.publish_with(PublishProps::new(route, message)).await
    }

    /// Publish with explicit metadata and referrer.
    pub async fn publish_with(&self, props: PublishProps) -> Result<()> {
        // ---
        self.inner.ensure_started()?;

        let metadata = self.inner.metadata.merge(
            props.referrer.as_ref(),
            props.metadata.as_ref(),
            &props.route,
            &props.message,
        )?;

        let payload = self.inner.codec.encode(&props.message)?;

        self.inner
            .driver
            .send_message(SendMessageProps {
                route: props.route,
                payload,
                metadata,
                correlation_id: CorrelationId::generate().into_string(),
                is_rpc: false,
            })
            .await
    }

    /// Execute an RPC call and await its result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] unless STARTED, [`Error::RpcTimeout`]
    /// when no reply arrives within the effective timeout,
    /// [`Error::Remote`] when the remote handler failed, and
    /// [`Error::Disposed`] when the transport is disposed mid-call.
    pub async fn execute(&self, route: &str, message: Value) -> Result<Value> {
        self.execute_with(ExecuteProps::new(route, message)).await
    }

    /// Execute with explicit metadata, referrer, or per-call timeout.
    pub async fn execute_with(&self, props: ExecuteProps) -> Result<Value> {
        // ---
        self.inner.ensure_started()?;

        let metadata = self.inner.metadata.merge(
            props.referrer.as_ref(),
            props.metadata.as_ref(),
            &props.route,
            &props.message,
        )?;

        let payload = self.inner.codec.encode(&props.message)?;

        let correlation_id = CorrelationId::generate().into_string();
        let timeout = props
            .rpc_timeout
            .unwrap_or_else(|| self.inner.driver.default_rpc_timeout());

        let handle = self
            .inner
            .tracker
            .register(&correlation_id, &props.route, timeout);

        let sent = self
            .inner
            .driver
            .send_message(SendMessageProps {
                route: props.route,
                payload,
                metadata,
                correlation_id: correlation_id.clone(),
                is_rpc: true,
            })
            .await;

        if let Err(err) = sent {
            // The caller gets the send failure; the entry must not
            // linger until its timer fires.
            self.inner.tracker.discard(&correlation_id);
            return Err(err);
        }

        handle.wait().await
    }

    /// Stop driver delivery and transition to STOPPED.
    ///
    /// In-flight RPC calls are left pending; they may still complete if
    /// the driver keeps its response channel open, or time out normally.
    pub async fn stop(&self) -> Result<()> {
        // ---
        self.inner.ensure_not_disposed()?;
        if self.state() == TransportState::Stopped {
            return Ok(());
        }

        self.inner.driver.stop().await?;
        *lock_ignore_poison(&self.inner.lifecycle) = Lifecycle::Stopped;

        tracing::debug!("transport stopped");
        Ok(())
    }

    /// Dispose the transport. Terminal; the instance must not be reused.
    ///
    /// Stops delivery if needed, deletes transport-private driver
    /// resources, and rejects every pending RPC call with
    /// [`Error::Disposed`].
    pub async fn dispose(&self) -> Result<()> {
        // ---
        if self.is_disposed() {
            return Ok(());
        }

        if self.state() == TransportState::Started {
            if let Err(err) = self.inner.driver.stop().await {
                tracing::warn!(error = %err, "driver stop failed during dispose");
            }
        }

        let disposed = self.inner.driver.dispose().await;

        // Pending calls are rejected regardless of driver teardown
        // succeeding, so no caller awaits forever.
        self.inner.tracker.dispose_all();
        *lock_ignore_poison(&self.inner.lifecycle) = Lifecycle::Disposed;

        tracing::debug!("transport disposed");
        disposed
    }
}

impl Inner {
    fn ensure_not_disposed(&self) -> Result<()> {
        // ---
        match *lock_ignore_poison(&self.lifecycle) {
            Lifecycle::Disposed => Err(Error::Disposed),
            _ => Ok(()),
        }
    }

    fn ensure_started(&self) -> Result<()> {
        // ---
        match *lock_ignore_poison(&self.lifecycle) {
            Lifecycle::Started => Ok(()),
            Lifecycle::Stopped => Err(Error::NotStarted),
            Lifecycle::Disposed => Err(Error::Disposed),
        }
    }

    /// Inbound dispatch.
    ///
    /// A message is an RPC reply when its correlation id matches a
    /// pending call, it carries no reply address of its own, and no
    /// local handler claims its route (replies arrive on a reply-only
    /// channel). Everything else is a forward delivery.
    async fn dispatch(self: Arc<Self>, msg: TransportMessage) {
        // ---
        let is_reply = msg.reply_to.is_none()
            && self.tracker.is_pending(&msg.correlation_id)
            && !lock_ignore_poison(&self.registry).has_route(&msg.route);

        if is_reply {
            let outcome = match msg.error_data {
                Some(error_data) => Err(Error::Remote(error_data)),
                None => self.codec.decode(&msg.payload),
            };
            self.tracker.resolve(&msg.correlation_id, outcome);
            return;
        }

        let matched = lock_ignore_poison(&self.registry).lookup(&msg.route);

        if matched.exact.is_none() && matched.prefix_listeners.is_empty() {
            // Over-broad broker subscriptions can legitimately deliver
            // messages no local party cares about.
            tracing::warn!(route = %msg.route, "dropping message with no matching handler");
            return;
        }

        let message = match self.codec.decode(&msg.payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(route = %msg.route, error = %err, "dropping undecodable message");
                return;
            }
        };

        let item = TransportCompactMessage {
            route: msg.route.clone(),
            message,
            metadata: msg.metadata.clone(),
        };

        if let Some(handler) = matched.exact {
            let inner = self.clone();
            let item = item.clone();
            let reply_to = msg.reply_to.clone();
            let correlation_id = msg.correlation_id.clone();
            let metadata = msg.metadata.clone();
            let route = msg.route.clone();

            tokio::spawn(async move {
                let result = handler(item).await;
                inner
                    .complete_exact(route, correlation_id, reply_to, metadata, result)
                    .await;
            });
        }

        for listener in matched.prefix_listeners {
            if let Err(err) = listener(item.clone()) {
                tracing::warn!(route = %msg.route, error = %err, "prefix listener failed");
            }
        }
    }

    /// Finish an exact-handler invocation: reply when the message asked
    /// for one, otherwise route failures to the failed-message hook.
    async fn complete_exact(
        &self,
        route: String,
        correlation_id: String,
        reply_to: Option<String>,
        metadata: Metadata,
        result: Result<Option<Value>>,
    ) {
        // ---
        match (reply_to, result) {
            (Some(reply_to), Ok(value)) => {
                let payload = match self.codec.encode(&value.unwrap_or(Value::Null)) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::error!(%route, error = %err, "failed to encode reply");
                        return;
                    }
                };

                let send = self
                    .driver
                    .send_reply_message(SendReplyMessageProps {
                        reply_to,
                        correlation_id,
                        payload,
                        metadata,
                        error_data: None,
                    })
                    .await;

                if let Err(err) = send {
                    tracing::warn!(%route, error = %err, "failed to send reply");
                }
            }

            (Some(reply_to), Err(err)) => {
                // Handler failures cross the wire as error data, never
                // as a crash.
                let error_data = NormalizedError::from_error(&err);
                tracing::debug!(%route, error = %err, "handler failed, replying with error data");

                let send = self
                    .driver
                    .send_reply_message(SendReplyMessageProps {
                        reply_to,
                        correlation_id,
                        payload: bytes::Bytes::new(),
                        metadata,
                        error_data: Some(error_data),
                    })
                    .await;

                if let Err(err) = send {
                    tracing::warn!(%route, error = %err, "failed to send error reply");
                }
            }

            (None, Ok(_)) => {}

            (None, Err(err)) => {
                let failed = FailedMessage {
                    route: route.clone(),
                    correlation_id,
                    metadata,
                    error: NormalizedError::from_error(&err),
                };

                match &self.on_failed_message {
                    Some(hook) => hook(failed),
                    None => {
                        tracing::warn!(%route, error = %err, "handler failed with no reply channel")
                    }
                }
            }
        }
    }
}

/// Serialized dispatch loop fed by the driver's inbound sink.
async fn dispatch_loop(
    inner: Weak<Inner>,
    mut inbound_rx: mpsc::UnboundedReceiver<TransportMessage>,
) {
    // ---
    while let Some(msg) = inbound_rx.recv().await {
        match inner.upgrade() {
            Some(inner) => inner.dispatch(msg).await,
            None => break,
        }
    }

    tracing::debug!("transport dispatch loop ended");
}
