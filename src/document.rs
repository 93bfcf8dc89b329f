//! Per-open-file binding.
//!
//! A document resolves its session(s) through the project registry by file
//! extension, exposes connect/disconnect/open/save/close as
//! protocol-triggering operations, and forwards local editing events onto
//! the event bus. The visual surface it renders into is an explicit
//! attach/detach slot: the surface may detach at any time, and calls that
//! need one degrade to silent no-ops.

use crate::events::{topics, EventContext};
use crate::project::{ProjectShared, SessionTarget};
use crate::session::Session;
use crate::uri::language_id_for;
use lsp_types::{Diagnostic, ServerCapabilities, Uri};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// The visual surface a document is currently rendered into.
///
/// All methods default to no-ops; a detached document simply has nowhere to
/// render.
pub trait EditorSurface: Send + Sync {
    fn show_hover(&self, content: &str) {
        let _ = content;
    }

    fn show_diagnostics(&self, diagnostics: &[Diagnostic]) {
        let _ = diagnostics;
    }
}

struct DocumentState {
    text: String,
    version: i32,
    completion_triggers: Vec<String>,
    signature_triggers: Vec<String>,
    surface: Option<Arc<dyn EditorSurface>>,
    disposed: bool,
}

pub struct Document {
    uri: Uri,
    extension: String,
    language_id: String,
    project: Weak<ProjectShared>,
    state: Mutex<DocumentState>,
}

impl Document {
    pub(crate) fn new(
        project: Weak<ProjectShared>,
        uri: Uri,
        extension: String,
        text: String,
    ) -> Arc<Self> {
        let language_id = language_id_for(&extension);
        Arc::new(Self {
            uri,
            extension,
            language_id,
            project,
            state: Mutex::new(DocumentState {
                text,
                version: 1,
                completion_triggers: Vec::new(),
                signature_triggers: Vec::new(),
                surface: None,
                disposed: false,
            }),
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    pub fn text(&self) -> String {
        self.lock_state().text.clone()
    }

    pub fn version(&self) -> i32 {
        self.lock_state().version
    }

    /// Completion trigger characters negotiated for this document.
    pub fn completion_triggers(&self) -> Vec<String> {
        self.lock_state().completion_triggers.clone()
    }

    pub fn signature_triggers(&self) -> Vec<String> {
        self.lock_state().signature_triggers.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.lock_state().disposed
    }

    /// Connect to the session(s) claiming this document's extension.
    ///
    /// Returns `Ok(true)` once connected, `Ok(false)` when parked behind an
    /// in-flight negotiation. Never hangs: failed or timed-out sessions
    /// produce an error.
    pub async fn connect(self: &Arc<Self>) -> anyhow::Result<bool> {
        let project = self.project()?;
        match project.resolve(&self.extension) {
            None => anyhow::bail!(
                "no language server registered for extension '{}'",
                self.extension
            ),
            Some(SessionTarget::Single(session)) => Ok(session.connect(self).await?),
            Some(SessionTarget::Aggregated(aggregated)) => {
                aggregated.connect_all(self).await?;
                Ok(true)
            }
        }
    }

    /// Alias for [`connect`](Self::connect): opening a document for
    /// protocol-aware editing is what establishes the connection.
    pub async fn open(self: &Arc<Self>) -> anyhow::Result<bool> {
        self.connect().await
    }

    /// Disconnect from every session currently tracking this document.
    pub async fn disconnect(self: &Arc<Self>) -> bool {
        let mut any = false;
        for session in self.tracking_sessions() {
            any |= session.disconnect(self).await;
        }
        any
    }

    /// Whether any session tracks this document as connected.
    pub fn is_connected(&self) -> bool {
        !self.tracking_sessions().is_empty()
    }

    /// Replace the document text and notify connected sessions and bus
    /// listeners.
    pub fn change(self: &Arc<Self>, new_text: impl Into<String>) {
        let (version, text) = {
            let mut state = self.lock_state();
            state.text = new_text.into();
            state.version += 1;
            (state.version, state.text.clone())
        };
        for session in self.tracking_sessions() {
            session.notify(
                "textDocument/didChange",
                json!({
                    "textDocument": { "uri": self.uri.as_str(), "version": version },
                    "contentChanges": [{ "text": text }],
                }),
            );
        }
        self.emit(topics::DOCUMENT_CHANGED, |ctx| {
            ctx.insert("version", json!(version));
        });
    }

    /// Announce a save to connected sessions (willSave, then didSave).
    pub fn save(self: &Arc<Self>) {
        for session in self.tracking_sessions() {
            // Reason 1: manual save.
            session.notify(
                "textDocument/willSave",
                json!({ "textDocument": { "uri": self.uri.as_str() }, "reason": 1 }),
            );
            session.notify(
                "textDocument/didSave",
                json!({ "textDocument": { "uri": self.uri.as_str() } }),
            );
        }
        self.emit(topics::DOCUMENT_SAVED, |_| {});
    }

    /// Disconnect, then drop the document from the registry.
    pub async fn close(self: &Arc<Self>) {
        let was_tracked = self.disconnect().await;
        if !was_tracked {
            self.dispose();
        }
        if let Ok(project) = self.project() {
            project.remove_document(&self.uri);
        }
    }

    pub fn attach_surface(&self, surface: Arc<dyn EditorSurface>) {
        self.lock_state().surface = Some(surface);
    }

    pub fn detach_surface(&self) {
        self.lock_state().surface = None;
    }

    pub fn has_surface(&self) -> bool {
        self.lock_state().surface.is_some()
    }

    /// Render hover content, silently doing nothing when detached.
    pub fn show_hover(&self, content: &str) {
        let surface = self.lock_state().surface.clone();
        if let Some(surface) = surface {
            surface.show_hover(content);
        }
    }

    /// Render diagnostics, silently doing nothing when detached.
    pub fn show_diagnostics(&self, diagnostics: &[Diagnostic]) {
        let surface = self.lock_state().surface.clone();
        if let Some(surface) = surface {
            surface.show_diagnostics(diagnostics);
        }
    }

    /// Populate trigger-character sets from a (masked) capability object.
    pub(crate) fn populate_from_capabilities(&self, capabilities: &ServerCapabilities) {
        let completion = capabilities
            .completion_provider
            .as_ref()
            .and_then(|c| c.trigger_characters.clone())
            .unwrap_or_default();
        let signature = capabilities
            .signature_help_provider
            .as_ref()
            .and_then(|s| s.trigger_characters.clone())
            .unwrap_or_default();

        let mut state = self.lock_state();
        for trigger in completion {
            if !state.completion_triggers.contains(&trigger) {
                state.completion_triggers.push(trigger);
            }
        }
        for trigger in signature {
            if !state.signature_triggers.contains(&trigger) {
                state.signature_triggers.push(trigger);
            }
        }
    }

    /// Detach the surface and mark the binding unusable. Sessions call this
    /// as part of disconnect; the document must already be untracked.
    pub(crate) fn dispose(&self) {
        let mut state = self.lock_state();
        state.surface = None;
        state.disposed = true;
    }

    fn lock_state(&self) -> MutexGuard<'_, DocumentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn project(&self) -> anyhow::Result<Arc<ProjectShared>> {
        self.project
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("project was disposed"))
    }

    /// Sessions that currently track this document as connected.
    fn tracking_sessions(&self) -> Vec<Arc<Session>> {
        let Ok(project) = self.project() else {
            return Vec::new();
        };
        project
            .sessions_for_extension(&self.extension)
            .into_iter()
            .filter(|s| s.is_connected(&self.uri))
            .collect()
    }

    fn emit(&self, topic: &str, fill: impl FnOnce(&mut EventContext)) {
        let Ok(project) = self.project() else {
            return;
        };
        let mut ctx =
            EventContext::for_document(self.uri.as_str(), &project.root().display().to_string());
        fill(&mut ctx);
        project.bus().emit(topic, ctx);
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("uri", &self.uri.as_str())
            .field("extension", &self.extension)
            .field("version", &self.version())
            .finish()
    }
}
