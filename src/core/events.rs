//! Reply handlers and the conversation → handler bindings.
//!
//! Handlers are registered by name at startup. Only names are persisted,
//! so a binding written before a restart still resolves afterwards.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;

use super::mailroom::Mailroom;
use super::message::{InboundItem, ListenerBinding};
use crate::error::{Error, Result};
use crate::store::Store;

/// What a handler gets to work with besides the reply itself.
pub struct HandlerContext {
    pub mailroom: Mailroom,
    /// Name the handler was resolved under.
    pub handler: String,
    pub now: DateTime<Utc>,
}

/// Code invoked when a reply arrives in a bound conversation.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, item: &InboundItem) -> anyhow::Result<()>;
}

fn handler_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)+$")
            .expect("handler name pattern is valid")
    })
}

/// Check that `name` has the dotted `module.function` form.
pub fn validate_handler_name(name: &str) -> Result<()> {
    if handler_name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "handler name '{}' must look like 'module.function'",
            name
        )))
    }
}

/// Name → handler table, filled once at startup and shared read-only.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. Names are unique.
    pub fn register(&mut self, name: &str, handler: Arc<dyn Handler>) -> Result<()> {
        validate_handler_name(name)?;
        if self.handlers.contains_key(name) {
            return Err(Error::invalid(format!("handler '{}' is already registered", name)));
        }
        self.handlers.insert(name.to_string(), handler);
        tracing::debug!(handler = name, "Registered handler");
        Ok(())
    }

    pub fn with(mut self, name: &str, handler: Arc<dyn Handler>) -> Result<Self> {
        self.register(name, handler)?;
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Handler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::HandlerResolutionFailed(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Validate a handler reference before it gets persisted.
    pub fn check_reference(&self, name: &str) -> Result<()> {
        validate_handler_name(name)?;
        if !self.contains(name) {
            return Err(Error::invalid(format!(
                "handler '{}' is not registered; handlers must be registered by name at startup",
                name
            )));
        }
        Ok(())
    }
}

/// Persistent conversation → handler bindings.
#[derive(Clone)]
pub struct EventRegistry {
    store: Arc<Store>,
    handlers: Arc<HandlerRegistry>,
}

impl EventRegistry {
    pub fn new(store: Arc<Store>, handlers: Arc<HandlerRegistry>) -> Self {
        Self { store, handlers }
    }

    /// Bind a conversation to a handler. Re-registering overwrites.
    pub fn register_listener(
        &self,
        conversation_id: &str,
        handler: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if conversation_id.trim().is_empty() {
            return Err(Error::invalid("conversation id must not be empty"));
        }
        self.handlers.check_reference(handler)?;
        self.store.set_binding(conversation_id, handler, now)?;
        tracing::info!(
            conversation_id,
            handler,
            "Registered listener"
        );
        Ok(())
    }

    pub fn listener_for(&self, conversation_id: &str) -> Result<Option<ListenerBinding>> {
        self.store.binding(conversation_id)
    }

    pub fn listeners(&self) -> Result<Vec<ListenerBinding>> {
        self.store.list_bindings()
    }
}
