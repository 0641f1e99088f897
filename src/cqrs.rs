//! CQRS handler registration surface.
//!
//! Service modules describe their API as a namespaced table of query and
//! command handlers; [`handle_cqrs_api`] flattens that table into
//! `<Kind>.<namespace>.<action>` route registrations on a transport.
//!
//! This is the only contract exposed toward handler-wiring layers: the
//! table is built statically by the caller before `start()`, and the
//! transport never resolves handlers by name at dispatch time.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::registry::{wrap_handler, RouteHandlerFn};
use crate::transport::Transport;
use crate::{Error, Result};

/// Namespaced query/command handler table.
pub struct CqrsApi {
    namespace: String,
    queries: Vec<(String, RouteHandlerFn)>,
    commands: Vec<(String, RouteHandlerFn)>,
}

impl CqrsApi {
    pub fn new(namespace: impl Into<String>) -> Self {
        // ---
        Self {
            namespace: namespace.into(),
            queries: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Add a query handler, registered as `Query.<namespace>.<action>`.
    pub fn query<F, Fut, Req, Resp>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.queries.push((action.into(), wrap_handler(handler)));
        self
    }

    /// Add a command handler, registered as `Command.<namespace>.<action>`.
    pub fn command<F, Fut, Req, Resp>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.commands.push((action.into(), wrap_handler(handler)));
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Flatten an API table into exact-route registrations.
///
/// # Errors
///
/// Returns [`Error::HandlerRegistration`] naming the colliding route if
/// any flattened route is already registered.
pub fn handle_cqrs_api(transport: &Transport, api: CqrsApi) -> Result<()> {
    // ---
    let CqrsApi {
        namespace,
        queries,
        commands,
    } = api;

    let kinds = [("Query", queries), ("Command", commands)];

    for (kind, handlers) in kinds {
        for (action, handler) in handlers {
            let route = format!("{kind}.{namespace}.{action}");

            transport.on_route(&route, handler).map_err(|err| {
                Error::HandlerRegistration(format!("route {route} could not be registered: {err}"))
            })?;
        }
    }

    Ok(())
}
