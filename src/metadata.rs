//! Outgoing metadata derivation.
//!
//! On every outbound `publish`/`execute` the transport folds an ordered
//! set of named rules over an initially-empty metadata map, then overlays
//! the caller-supplied metadata so explicit caller values always win over
//! derived ones. Rules are pure functions of the referrer message and the
//! current call context; a failing rule aborts the send.

use std::sync::Arc;

use serde_json::Value;

use crate::domain::{Metadata, Referrer};
use crate::{Error, Result};

/// Context visible to a metadata rule.
pub struct MetadataContext<'a> {
    /// Route of the referrer message, when the send happens inside a
    /// handler reacting to one.
    pub referrer_route: Option<&'a str>,
    /// Metadata of the referrer message.
    pub referrer_metadata: Option<&'a Metadata>,
    /// Metadata accumulated by rules that ran earlier in the pipeline.
    pub current_metadata: &'a Metadata,
    /// Route being sent to.
    pub current_route: &'a str,
    /// Payload value being sent.
    pub current_message: &'a Value,
}

/// A single derivation rule: context in, partial metadata out.
pub type MetadataRule = Arc<dyn Fn(&MetadataContext<'_>) -> Result<Metadata> + Send + Sync>;

/// Ordered pipeline of named metadata rules.
#[derive(Clone, Default)]
pub struct MetadataPipeline {
    rules: Vec<(String, MetadataRule)>,
}

impl MetadataPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named rule. Rules run left to right in append order.
    pub fn rule<F>(mut self, name: impl Into<String>, rule: F) -> Self
    where
        F: Fn(&MetadataContext<'_>) -> Result<Metadata> + Send + Sync + 'static,
    {
        self.rules.push((name.into(), Arc::new(rule)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Fold all rules over an empty map, then overlay `caller` values.
    ///
    /// # Errors
    ///
    /// A rule failure aborts with [`Error::MetadataRule`] naming the
    /// rule; no partial send happens.
    pub(crate) fn merge(
        &self,
        referrer: Option<&Referrer>,
        caller: Option<&Metadata>,
        route: &str,
        message: &Value,
    ) -> Result<Metadata> {
        // ---
        let mut merged = Metadata::new();

        for (name, rule) in &self.rules {
            let context = MetadataContext {
                referrer_route: referrer.map(|r| r.route.as_str()),
                referrer_metadata: referrer.map(|r| &r.metadata),
                current_metadata: &merged,
                current_route: route,
                current_message: message,
            };

            let partial = rule(&context).map_err(|err| Error::MetadataRule {
                rule: name.clone(),
                message: err.to_string(),
            })?;

            merged.extend(partial);
        }

        // Caller-supplied values win over derived ones.
        if let Some(caller) = caller {
            for (key, value) in caller {
                merged.insert(key.clone(), value.clone());
            }
        }

        Ok(merged)
    }
}

/// Stock metadata rules.
pub mod rules {
    use super::*;

    /// Copy the listed keys from the referrer's metadata when present.
    ///
    /// The usual vehicle for trace ids and similar cross-hop context.
    pub fn propagate(keys: &[&str]) -> impl Fn(&MetadataContext<'_>) -> Result<Metadata> {
        // ---
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();

        move |ctx: &MetadataContext<'_>| {
            let mut out = Metadata::new();
            if let Some(referrer) = ctx.referrer_metadata {
                for key in &keys {
                    if let Some(value) = referrer.get(key) {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            Ok(out)
        }
    }

    /// Stamp the send time as unix milliseconds under `createdAt`.
    pub fn created_at() -> impl Fn(&MetadataContext<'_>) -> Result<Metadata> {
        // ---
        |_ctx: &MetadataContext<'_>| {
            let millis = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);

            let mut out = Metadata::new();
            out.insert("createdAt".to_string(), Value::from(millis));
            Ok(out)
        }
    }
}
