//! Workspace-level registry.
//!
//! One project owns the event bus, the diagnostics store, the registered
//! server definitions, the live sessions (created lazily, never duplicated
//! for the same definition) and the open documents for one workspace root.

use crate::aggregated::AggregatedSession;
use crate::definition::ServerDefinition;
use crate::diagnostics::DiagnosticsStore;
use crate::document::Document;
use crate::events::EventBus;
use crate::session::Session;
use crate::timeouts::Timeouts;
use crate::uri::{extension_of, file_uri};
use lsp_types::Uri;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// What a document's extension resolves to: one session, or a façade over
/// several when more than one definition claims the extension.
pub enum SessionTarget {
    Single(Arc<Session>),
    Aggregated(Arc<AggregatedSession>),
}

pub(crate) struct ProjectShared {
    root: PathBuf,
    timeouts: Timeouts,
    bus: Arc<EventBus>,
    diagnostics: Arc<DiagnosticsStore>,
    /// Registration order is preserved; it decides aggregated fan-out order.
    definitions: RwLock<Vec<Arc<ServerDefinition>>>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    documents: Mutex<HashMap<Uri, Arc<Document>>>,
}

impl ProjectShared {
    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub(crate) fn definitions_for(&self, extension: &str) -> Vec<Arc<ServerDefinition>> {
        self.definitions
            .read()
            .map(|defs| {
                defs.iter()
                    .filter(|d| d.matches_extension(extension))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The session for a definition, created lazily exactly once.
    pub(crate) fn session_for(&self, definition: &Arc<ServerDefinition>) -> Arc<Session> {
        let mut sessions = self.lock_sessions();
        sessions
            .entry(definition.name().to_string())
            .or_insert_with(|| {
                Session::new(
                    definition.clone(),
                    self.root.clone(),
                    self.timeouts.clone(),
                    self.bus.clone(),
                    self.diagnostics.clone(),
                )
            })
            .clone()
    }

    /// Live sessions for every definition claiming the extension; does not
    /// create missing ones.
    pub(crate) fn sessions_for_extension(&self, extension: &str) -> Vec<Arc<Session>> {
        let sessions = self.lock_sessions();
        self.definitions_for(extension)
            .iter()
            .filter_map(|d| sessions.get(d.name()).cloned())
            .collect()
    }

    pub(crate) fn resolve(&self, extension: &str) -> Option<SessionTarget> {
        let definitions = self.definitions_for(extension);
        match definitions.len() {
            0 => None,
            1 => Some(SessionTarget::Single(self.session_for(&definitions[0]))),
            _ => {
                let entries = definitions
                    .into_iter()
                    .map(|d| {
                        let session = self.session_for(&d);
                        (d, session)
                    })
                    .collect();
                Some(SessionTarget::Aggregated(Arc::new(AggregatedSession::new(
                    entries,
                ))))
            }
        }
    }

    pub(crate) fn remove_document(&self, uri: &Uri) {
        if let Ok(mut documents) = self.documents.lock() {
            documents.remove(uri);
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_documents(&self) -> MutexGuard<'_, HashMap<Uri, Arc<Document>>> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one workspace's session-management state. Cheap to clone.
#[derive(Clone)]
pub struct Project {
    shared: Arc<ProjectShared>,
}

impl Project {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_timeouts(root, Timeouts::default())
    }

    pub fn with_timeouts(root: impl Into<PathBuf>, timeouts: Timeouts) -> Self {
        Self {
            shared: Arc::new(ProjectShared {
                root: root.into(),
                timeouts,
                bus: Arc::new(EventBus::new()),
                diagnostics: Arc::new(DiagnosticsStore::new()),
                definitions: RwLock::new(Vec::new()),
                sessions: Mutex::new(HashMap::new()),
                documents: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        self.shared.root()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticsStore> {
        &self.shared.diagnostics
    }

    /// Register a peer kind. Definitions registered earlier win ties in
    /// aggregated capability merges.
    pub fn register_definition(&self, definition: ServerDefinition) -> Arc<ServerDefinition> {
        let definition = Arc::new(definition);
        if let Ok(mut definitions) = self.shared.definitions.write() {
            definitions.push(definition.clone());
        }
        definition
    }

    /// Remove a definition and stop its session, if one was created.
    pub async fn unregister_definition(&self, name: &str) {
        if let Ok(mut definitions) = self.shared.definitions.write() {
            definitions.retain(|d| d.name() != name);
        }
        let session = self.shared.lock_sessions().remove(name);
        if let Some(session) = session {
            session.stop(true).await;
        }
    }

    /// Open a file for protocol-aware editing. Returns the existing binding
    /// when the URI is already open.
    pub fn open_document(
        &self,
        path: &Path,
        text: impl Into<String>,
    ) -> anyhow::Result<Arc<Document>> {
        let uri = file_uri(path)
            .ok_or_else(|| anyhow::anyhow!("not an absolute file path: {}", path.display()))?;
        let mut documents = self.shared.lock_documents();
        if let Some(existing) = documents.get(&uri) {
            return Ok(existing.clone());
        }
        let extension = extension_of(path).unwrap_or_default();
        let document = Document::new(
            Arc::downgrade(&self.shared),
            uri.clone(),
            extension,
            text.into(),
        );
        documents.insert(uri, document.clone());
        Ok(document)
    }

    pub fn document(&self, uri: &Uri) -> Option<Arc<Document>> {
        self.shared.lock_documents().get(uri).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.shared.lock_documents().len()
    }

    /// Resolve the target for an extension, lazily creating sessions.
    pub fn resolve(&self, extension: &str) -> Option<SessionTarget> {
        self.shared.resolve(extension)
    }

    /// The session for a registered definition name, if one exists yet.
    pub fn session(&self, name: &str) -> Option<Arc<Session>> {
        self.shared.lock_sessions().get(name).cloned()
    }

    /// Tear everything down.
    ///
    /// Documents are closed before their sessions stop so per-document close
    /// notifications still have a live channel to be sent over; then the
    /// remaining sessions are stopped and every map cleared.
    pub async fn dispose(&self) {
        let documents: Vec<Arc<Document>> =
            self.shared.lock_documents().drain().map(|(_, d)| d).collect();
        for document in documents {
            document.close().await;
        }

        let sessions: Vec<Arc<Session>> =
            self.shared.lock_sessions().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop(true).await;
        }

        if let Ok(mut definitions) = self.shared.definitions.write() {
            definitions.clear();
        }
        self.shared.diagnostics.clear_all();
        tracing::info!(root = %self.shared.root.display(), "project disposed");
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("root", &self.shared.root)
            .field("documents", &self.document_count())
            .finish()
    }
}
