//! Process-wide typed publish/subscribe.
//!
//! The bus decouples session internals from document-level features:
//! completion, hover, diagnostics and the rest subscribe to named events and
//! receive a context seeded with the originating document and project.
//!
//! Listener failures are isolated: a failing listener records its error in
//! the context but never prevents the remaining listeners from running.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Well-known event names.
pub mod topics {
    pub const DOCUMENT_OPENED: &str = "document-opened";
    pub const DOCUMENT_CHANGED: &str = "document-changed";
    pub const DOCUMENT_SAVED: &str = "document-saved";
    pub const DOCUMENT_CLOSED: &str = "document-closed";
    pub const DIAGNOSTICS_UPDATED: &str = "diagnostics-updated";
    pub const SESSION_INITIALIZED: &str = "session-initialized";
    pub const SESSION_ERROR: &str = "session-error";

    // Feature consumers, dispatched by external code.
    pub const COMPLETION: &str = "completion";
    pub const HOVER: &str = "hover";
    pub const SIGNATURE_HELP: &str = "signature-help";
    pub const DIAGNOSTICS_QUERY: &str = "diagnostics-query";
    pub const FORMATTING: &str = "formatting";
    pub const CODE_ACTION: &str = "code-action";
    pub const WORKSPACE_EDIT: &str = "workspace-edit";
}

/// Well-known context keys.
pub mod ctx_keys {
    pub const DOCUMENT: &str = "document";
    pub const PROJECT_ROOT: &str = "project_root";
    pub const SERVER: &str = "server";
}

/// The payload carried through one emission: a value map plus the errors of
/// any listeners that failed.
#[derive(Debug, Default)]
pub struct EventContext {
    values: HashMap<String, Value>,
    errors: Vec<String>,
}

impl EventContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with the originating document URI and project root.
    pub fn for_document(document_uri: &str, project_root: &str) -> Self {
        let mut ctx = Self::new();
        ctx.insert(ctx_keys::DOCUMENT, Value::String(document_uri.to_string()));
        ctx.insert(
            ctx_keys::PROJECT_ROOT,
            Value::String(project_root.to_string()),
        );
        ctx
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Errors recorded by failing listeners during the emission.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

/// A listener for one event name.
///
/// `handle_async` defaults to the synchronous handler; override it when the
/// listener needs to perform protocol calls.
#[async_trait::async_trait]
pub trait EventListener: Send + Sync {
    fn handle(&self, event: &str, ctx: &mut EventContext) -> anyhow::Result<()>;

    async fn handle_async(&self, event: &str, ctx: &mut EventContext) -> anyhow::Result<()> {
        self.handle(event, ctx)
    }
}

/// Registry mapping event names to listeners, dispatched in registration
/// order within one name.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<Arc<dyn EventListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event: &str, listener: Arc<dyn EventListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.entry(event.to_string()).or_default().push(listener);
        }
    }

    /// Remove all listeners for an event name.
    pub fn unsubscribe(&self, event: &str) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.remove(event);
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .map(|l| l.get(event).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Dispatch synchronously; all listeners run before this returns.
    pub fn emit(&self, event: &str, mut ctx: EventContext) -> EventContext {
        for listener in self.snapshot(event) {
            if let Err(e) = listener.handle(event, &mut ctx) {
                tracing::warn!(event, error = %e, "event listener failed");
                ctx.record_error(e.to_string());
            }
        }
        ctx
    }

    /// Dispatch where listeners may await protocol calls. Returns once all
    /// listeners completed; suspends rather than blocking the caller's
    /// thread.
    pub async fn emit_async(&self, event: &str, mut ctx: EventContext) -> EventContext {
        for listener in self.snapshot(event) {
            if let Err(e) = listener.handle_async(event, &mut ctx).await {
                tracing::warn!(event, error = %e, "async event listener failed");
                ctx.record_error(e.to_string());
            }
        }
        ctx
    }

    fn snapshot(&self, event: &str) -> Vec<Arc<dyn EventListener>> {
        self.listeners
            .read()
            .map(|l| l.get(event).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}
