//! Route handler registry.
//!
//! Stores exact-route handlers and wildcard-prefix listeners, and answers
//! two questions: what matches a given inbound route, and what is the
//! full set of routes and prefixes to subscribe to at start time.
//!
//! Exact handlers are one per route; prefix listeners are independently
//! interested parties, so any number may share a prefix and all ancestors
//! of a route are invoked, not just the longest.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::domain::TransportCompactMessage;
use crate::{Error, Result};

/// Boxed future returned by a type-erased route handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send>>;

/// Type-erased async route handler.
///
/// Returns the reply value for RPC-style messages, or `None` when the
/// handler has nothing to report. Wrapped in `Arc` for cheap cloning
/// when dispatch spawns handler tasks.
pub type RouteHandlerFn =
    Arc<dyn Fn(TransportCompactMessage) -> HandlerFuture + Send + Sync>;

/// Fire-and-forget prefix listener.
///
/// Listener failures are logged by dispatch and never propagated; a
/// throwing listener must not affect other listeners or the exact
/// handler.
pub type PrefixListenerFn =
    Arc<dyn Fn(TransportCompactMessage) -> Result<()> + Send + Sync>;

/// Result of matching an inbound route against the registry.
pub(crate) struct RouteMatch {
    pub exact: Option<RouteHandlerFn>,
    pub prefix_listeners: Vec<PrefixListenerFn>,
}

/// Registry of exact-route handlers and prefix listeners.
///
/// Owned exclusively by one transport core; mutations are serialized by
/// the core's lock, never by this type itself.
pub(crate) struct RouteRegistry {
    routes: HashMap<String, RouteHandlerFn>,
    prefixes: Vec<(String, PrefixListenerFn)>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        // ---
        Self {
            routes: HashMap::new(),
            prefixes: Vec::new(),
        }
    }

    /// Register an exact handler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRoute`] if a handler already exists for
    /// this route. Explicit re-registration must go through
    /// [`unregister`](Self::unregister) first.
    pub fn register(&mut self, route: &str, handler: RouteHandlerFn) -> Result<()> {
        // ---
        if self.routes.contains_key(route) {
            return Err(Error::DuplicateRoute(route.to_string()));
        }
        self.routes.insert(route.to_string(), handler);
        Ok(())
    }

    /// Append a prefix listener. Listeners per prefix run in
    /// registration order.
    pub fn register_prefix(&mut self, prefix: &str, listener: PrefixListenerFn) {
        self.prefixes.push((prefix.to_string(), listener));
    }

    /// Remove the exact handler for a route. Idempotent.
    pub fn unregister(&mut self, route: &str) {
        self.routes.remove(route);
    }

    pub fn has_route(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }

    /// Match a route: direct lookup for the exact handler, plus every
    /// listener whose prefix is a segment-aligned ancestor.
    pub fn lookup(&self, route: &str) -> RouteMatch {
        // ---
        let exact = self.routes.get(route).cloned();

        let prefix_listeners = self
            .prefixes
            .iter()
            .filter(|(prefix, _)| is_segment_prefix(prefix, route))
            .map(|(_, listener)| listener.clone())
            .collect();

        RouteMatch {
            exact,
            prefix_listeners,
        }
    }

    /// Exact routes with registered handlers.
    pub fn routes(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    /// Registered prefixes, deduplicated, in registration order.
    pub fn prefixes(&self) -> Vec<String> {
        // ---
        let mut seen = Vec::new();
        for (prefix, _) in &self.prefixes {
            if !seen.contains(prefix) {
                seen.push(prefix.clone());
            }
        }
        seen
    }

    /// Broker subscription set: every prefix plus each route not already
    /// covered by a prefix ancestor. Dropping covered routes avoids
    /// double delivery on backends with wildcard subscriptions.
    pub fn subscription_patterns(&self) -> Vec<String> {
        // ---
        let prefixes = self.prefixes();

        let mut patterns = prefixes.clone();
        patterns.extend(
            self.routes()
                .into_iter()
                .filter(|r| !prefixes.iter().any(|p| is_segment_prefix(p, r))),
        );
        patterns
    }
}

/// Dot-segment-aligned ancestry check.
///
/// `Event.User` is an ancestor of `Event.User.Joined` but not of
/// `Event.Username.Joined`; equality counts as ancestry.
pub(crate) fn is_segment_prefix(prefix: &str, route: &str) -> bool {
    // ---
    match route.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}

/// Wrap a typed async handler into a type-erased [`RouteHandlerFn`].
///
/// The inbound payload value is deserialized into `Req`; the handler's
/// `Resp` is serialized back into a value for the reply path. A payload
/// that does not deserialize fails the handler with a codec error, which
/// dispatch reports like any other handler failure.
pub fn wrap_handler<F, Fut, Req, Resp>(handler: F) -> RouteHandlerFn
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    // ---
    let handler = Arc::new(handler);

    Arc::new(move |item: TransportCompactMessage| {
        let handler = handler.clone();

        let fut = async move {
            let req: Req = serde_json::from_value(item.message)?;
            let resp = handler(req).await?;
            Ok(Some(serde_json::to_value(resp)?))
        };

        Box::pin(fut) as HandlerFuture
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::domain::Metadata;

    fn noop_handler() -> RouteHandlerFn {
        Arc::new(|_item| Box::pin(async { Ok(None) }) as HandlerFuture)
    }

    fn noop_listener() -> PrefixListenerFn {
        Arc::new(|_item| Ok(()))
    }

    #[test]
    fn segment_boundary_matching() {
        // ---
        assert!(is_segment_prefix("Event.User", "Event.User.Joined"));
        assert!(is_segment_prefix("Event.User", "Event.User"));
        assert!(is_segment_prefix("Event", "Event.User.Joined"));

        // Not a raw substring match
        assert!(!is_segment_prefix("Event.User", "Event.Username.Joined"));
        assert!(!is_segment_prefix("Event.User.Joined", "Event.User"));
    }

    #[test]
    fn duplicate_registration_rejected() {
        // ---
        let mut registry = RouteRegistry::new();

        registry.register("Command.User.Login", noop_handler()).unwrap();

        let err = registry
            .register("Command.User.Login", noop_handler())
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRoute(_)));

        // Re-registration is legal after unregister
        registry.unregister("Command.User.Login");
        registry.register("Command.User.Login", noop_handler()).unwrap();
    }

    #[test]
    fn unregister_is_idempotent() {
        // ---
        let mut registry = RouteRegistry::new();
        registry.unregister("Command.Missing");
        registry.unregister("Command.Missing");
    }

    #[test]
    fn lookup_returns_all_ancestor_listeners() {
        // ---
        let mut registry = RouteRegistry::new();
        registry.register("Event.User.Joined", noop_handler()).unwrap();
        registry.register_prefix("Event", noop_listener());
        registry.register_prefix("Event.User", noop_listener());
        registry.register_prefix("Event.Group", noop_listener());

        let m = registry.lookup("Event.User.Joined");
        assert!(m.exact.is_some());
        assert_eq!(m.prefix_listeners.len(), 2);

        let m = registry.lookup("Event.Username.Changed");
        assert!(m.exact.is_none());
        assert_eq!(m.prefix_listeners.len(), 1); // "Event" only
    }

    #[test]
    fn subscription_patterns_dedupe_covered_routes() {
        // ---
        let mut registry = RouteRegistry::new();
        registry.register("Event.User.Joined", noop_handler()).unwrap();
        registry.register("Command.User.Login", noop_handler()).unwrap();
        registry.register_prefix("Event.User", noop_listener());

        let patterns = registry.subscription_patterns();

        assert!(patterns.contains(&"Event.User".to_string()));
        assert!(patterns.contains(&"Command.User.Login".to_string()));
        // Covered by the Event.User prefix, so not listed separately
        assert!(!patterns.contains(&"Event.User.Joined".to_string()));
    }

    #[tokio::test]
    async fn wrap_handler_round_trips_typed_values() {
        // ---
        use serde::{Deserialize, Serialize};

        #[derive(Deserialize)]
        struct Req {
            a: i32,
            b: i32,
        }

        #[derive(Serialize)]
        struct Resp {
            sum: i32,
        }

        let handler = wrap_handler(|req: Req| async move { Ok(Resp { sum: req.a + req.b }) });

        let item = TransportCompactMessage {
            route: "Query.Math.Add".to_string(),
            message: serde_json::json!({"a": 2, "b": 3}),
            metadata: Metadata::new(),
        };

        let result = handler(item).await.unwrap();
        assert_eq!(result, Some(serde_json::json!({"sum": 5})));
    }
}
