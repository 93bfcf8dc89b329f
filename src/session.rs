//! The per-peer session: state machine and concurrency core.
//!
//! A session owns its channel exclusively, negotiates capabilities once, and
//! tracks which documents are connected. The negotiation is single-flight:
//! concurrent `start`/`connect`/`capabilities` callers collapse onto one
//! in-flight handshake and share its outcome (the same waiter-list shape the
//! editor uses to deduplicate concurrent directory reads).
//!
//! ```text
//! Stopped → Starting → Started → Initialized
//!    ↑          └─────────┴──────────┘
//!    └────────────── Stopping ←──────┘
//! ```

use crate::channel::ChannelProvider;
use crate::definition::{advertises, ServerDefinition};
use crate::diagnostics::DiagnosticsStore;
use crate::document::Document;
use crate::error::SessionError;
use crate::events::{ctx_keys, topics, EventBus, EventContext};
use crate::timeouts::{FeatureKind, Timeouts};
use crate::transport::{Incoming, Transport};
use crate::uri::file_uri;
use lsp_types::{InitializeResult, PublishDiagnosticsParams, ServerCapabilities, Uri};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};

/// Unexpected channel terminations tolerated before the session demands an
/// explicit `restart()`.
pub const CRASH_RETRY_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Stopped,
    Starting,
    Started,
    Initialized,
    Stopping,
}

type InitOutcome = Result<ServerCapabilities, SessionError>;

struct SessionState {
    status: SessionStatus,
    transport: Option<Arc<Transport>>,
    /// Negotiated capabilities, already masked by the definition's disabled
    /// set. Some iff status == Initialized.
    capabilities: Option<ServerCapabilities>,
    connected: HashMap<Uri, Arc<Document>>,
    /// Documents that asked to connect before negotiation finished.
    pending: Vec<Arc<Document>>,
    /// Callers awaiting the shared negotiation outcome.
    init_waiters: Vec<oneshot::Sender<InitOutcome>>,
    crash_count: u32,
    /// A recorded timeout or terminal crash pending acknowledgment; cleared
    /// by `restart()` (or an explicit `stop()`).
    fault: Option<SessionError>,
    /// Bumped on every start/stop so a negotiation that completes after its
    /// session was stopped cannot resurrect stale state.
    epoch: u64,
}

pub struct Session {
    definition: Arc<ServerDefinition>,
    root: PathBuf,
    root_uri: Option<Uri>,
    timeouts: Timeouts,
    bus: Arc<EventBus>,
    diagnostics: Arc<DiagnosticsStore>,
    provider: ChannelProvider,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        definition: Arc<ServerDefinition>,
        root: PathBuf,
        timeouts: Timeouts,
        bus: Arc<EventBus>,
        diagnostics: Arc<DiagnosticsStore>,
    ) -> Arc<Self> {
        let provider = ChannelProvider::new(definition.name(), definition.factory());
        let root_uri = file_uri(&root);
        Arc::new(Self {
            definition,
            root,
            root_uri,
            timeouts,
            bus,
            diagnostics,
            provider,
            state: Mutex::new(SessionState {
                status: SessionStatus::Stopped,
                transport: None,
                capabilities: None,
                connected: HashMap::new(),
                pending: Vec::new(),
                init_waiters: Vec::new(),
                crash_count: 0,
                fault: None,
                epoch: 0,
            }),
        })
    }

    pub fn definition(&self) -> &Arc<ServerDefinition> {
        &self.definition
    }

    pub fn status(&self) -> SessionStatus {
        self.lock_state().status
    }

    /// Cached capability view; `None` until initialized.
    pub fn capabilities_cached(&self) -> Option<ServerCapabilities> {
        self.lock_state().capabilities.clone()
    }

    /// Pure lookup over the connected set; never a channel round-trip.
    pub fn is_connected(&self, uri: &Uri) -> bool {
        self.lock_state().connected.contains_key(uri)
    }

    pub fn connected_count(&self) -> usize {
        self.lock_state().connected.len()
    }

    pub fn crash_count(&self) -> u32 {
        self.lock_state().crash_count
    }

    /// Kick off the session if it is stopped. Does not wait for negotiation;
    /// await `capabilities()` for that.
    ///
    /// No-op when already starting or started. Errors when a recorded
    /// timeout/crash is pending acknowledgment via `restart()`.
    pub fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        self.ensure_initializing()
    }

    /// The negotiated capability view, awaiting the shared in-flight
    /// handshake when necessary.
    ///
    /// Once a negotiation has succeeded this returns the cached result with
    /// no additional wait; the bounded wait only applies while a handshake
    /// is in flight.
    pub async fn capabilities(self: &Arc<Self>) -> Result<ServerCapabilities, SessionError> {
        self.ensure_initializing()?;
        let rx = {
            let mut state = self.lock_state();
            match state.status {
                SessionStatus::Initialized => {
                    return state
                        .capabilities
                        .clone()
                        .ok_or_else(|| self.inconsistent("initialized without capabilities"));
                }
                SessionStatus::Stopped => {
                    let error = state
                        .fault
                        .clone()
                        .unwrap_or_else(|| self.stopped_error());
                    return Err(error);
                }
                _ => {
                    let (tx, rx) = oneshot::channel();
                    state.init_waiters.push(tx);
                    rx
                }
            }
        };
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.stopped_error()),
        }
    }

    /// Connect a document, parking it while negotiation is in flight.
    ///
    /// Returns `Ok(true)` when the document is connected now, `Ok(false)`
    /// when it was parked and will be connected as soon as negotiation
    /// completes. Idempotent per document.
    pub async fn connect(self: &Arc<Self>, document: &Arc<Document>) -> Result<bool, SessionError> {
        let (transport, capabilities) = {
            let mut state = self.lock_state();
            if state.connected.contains_key(document.uri()) {
                return Ok(true);
            }
            match state.status {
                SessionStatus::Initialized => {
                    match (state.transport.clone(), state.capabilities.clone()) {
                        (Some(transport), Some(capabilities)) => {
                            state
                                .connected
                                .insert(document.uri().clone(), document.clone());
                            (transport, capabilities)
                        }
                        _ => return Err(self.inconsistent("initialized without transport")),
                    }
                }
                SessionStatus::Stopped => {
                    if let Some(fault) = state.fault.clone() {
                        return Err(fault);
                    }
                    park(&mut state.pending, document);
                    drop(state);
                    self.ensure_initializing()?;
                    return Ok(false);
                }
                SessionStatus::Starting | SessionStatus::Started | SessionStatus::Stopping => {
                    park(&mut state.pending, document);
                    return Ok(false);
                }
            }
        };

        document.populate_from_capabilities(&capabilities);
        let _ = transport.notify(
            "textDocument/didOpen",
            json!({
                "textDocument": {
                    "uri": document.uri().as_str(),
                    "languageId": document.language_id(),
                    "version": document.version(),
                    "text": document.text(),
                }
            }),
        );
        tracing::debug!(
            server = self.definition.name(),
            uri = document.uri().as_str(),
            "document connected"
        );
        self.bus.emit(
            topics::DOCUMENT_OPENED,
            self.document_context(document.uri()),
        );
        Ok(true)
    }

    /// Remove a document from tracking and dispose it. Stops the session
    /// when the last document disconnects; idle sessions are not kept alive.
    pub async fn disconnect(self: &Arc<Self>, document: &Arc<Document>) -> bool {
        let (removed, transport, now_empty) = {
            let mut state = self.lock_state();
            state.pending.retain(|d| d.uri() != document.uri());
            let removed = state.connected.remove(document.uri()).is_some();
            let now_empty = removed
                && state.connected.is_empty()
                && matches!(
                    state.status,
                    SessionStatus::Started | SessionStatus::Initialized
                );
            (removed, state.transport.clone(), now_empty)
        };
        if !removed {
            return false;
        }

        if let Some(transport) = transport {
            let _ = transport.notify(
                "textDocument/didClose",
                json!({ "textDocument": { "uri": document.uri().as_str() } }),
            );
        }
        document.dispose();
        self.bus.emit(
            topics::DOCUMENT_CLOSED,
            self.document_context(document.uri()),
        );

        if now_empty {
            tracing::debug!(
                server = self.definition.name(),
                "last document disconnected; stopping idle session"
            );
            self.stop(false).await;
        }
        true
    }

    /// Graceful teardown. Idempotent; clears every session-scoped cache so
    /// the session can be started again from scratch.
    pub async fn stop(self: &Arc<Self>, exit: bool) {
        self.stop_with(exit, None, true).await;
    }

    /// Record an unexpected channel termination.
    ///
    /// Below [`CRASH_RETRY_THRESHOLD`] the session merely stops and stays
    /// eligible for a later reconnect. At the threshold the definition's
    /// listener receives a terminal report, the counter resets, and further
    /// use requires an explicit `restart()`.
    pub async fn crashed(self: &Arc<Self>, reason: &str) {
        let count = {
            let mut state = self.lock_state();
            state.crash_count += 1;
            state.crash_count
        };
        tracing::warn!(
            server = self.definition.name(),
            count,
            reason,
            "channel terminated unexpectedly"
        );

        if count >= CRASH_RETRY_THRESHOLD {
            let error = SessionError::CrashThresholdExceeded {
                server: self.definition.name().to_string(),
                count,
            };
            self.definition.listener().session_error(&error);
            self.emit_session_error(&error);
            self.stop_with(false, Some(error), true).await;
        } else {
            self.stop_with(false, None, false).await;
        }
    }

    /// Clear a recorded timeout/crash and start again; or, when the session
    /// is healthy, cycle it with a full stop.
    pub async fn restart(self: &Arc<Self>) -> Result<(), SessionError> {
        let acknowledged = {
            let mut state = self.lock_state();
            if state.status == SessionStatus::Stopped && state.fault.is_some() {
                state.fault = None;
                true
            } else {
                false
            }
        };
        if !acknowledged {
            self.stop(false).await;
        }
        self.start()
    }

    /// Issue a feature request on behalf of a connected document, bounded by
    /// the feature's timeout from the shared table.
    ///
    /// The session only guarantees the document is connected and the budget
    /// is honored; interpreting the result is the feature consumer's job.
    pub async fn request_feature(
        &self,
        uri: &Uri,
        feature: FeatureKind,
        method: &str,
        params: Value,
    ) -> anyhow::Result<Value> {
        let transport = {
            let state = self.lock_state();
            if !state.connected.contains_key(uri) {
                anyhow::bail!("document not connected: {}", uri.as_str());
            }
            if let Some(capabilities) = state.capabilities.as_ref() {
                if !advertises(capabilities, feature) {
                    anyhow::bail!(
                        "'{}' does not advertise {feature:?}",
                        self.definition.name()
                    );
                }
            }
            state
                .transport
                .clone()
                .ok_or_else(|| anyhow::anyhow!("session has no live channel"))?
        };

        let budget = self.timeouts.for_feature(feature);
        match tokio::time::timeout(budget, transport.request(method, params)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => anyhow::bail!("{method} timed out after {budget:?}"),
        }
    }

    /// Best-effort notification on the live channel; dropped when stopped.
    pub(crate) fn notify(&self, method: &str, params: Value) {
        let transport = self.lock_state().transport.clone();
        match transport {
            Some(transport) => {
                if let Err(e) = transport.notify(method, params) {
                    tracing::debug!(
                        server = self.definition.name(),
                        method,
                        error = %e,
                        "notification dropped"
                    );
                }
            }
            None => tracing::trace!(
                server = self.definition.name(),
                method,
                "notification without live channel dropped"
            ),
        }
    }

    // ---- internals -------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stopped_error(&self) -> SessionError {
        SessionError::NegotiationFailed {
            server: self.definition.name().to_string(),
            reason: "session stopped".to_string(),
        }
    }

    fn inconsistent(&self, detail: &str) -> SessionError {
        SessionError::NegotiationFailed {
            server: self.definition.name().to_string(),
            reason: format!("inconsistent session state: {detail}"),
        }
    }

    /// Move a stopped session into Starting and spawn the negotiation task.
    /// The single-flight guarantee lives here: only the Stopped→Starting
    /// transition spawns, every other caller piggybacks on the in-flight
    /// attempt.
    fn ensure_initializing(self: &Arc<Self>) -> Result<(), SessionError> {
        let mut state = self.lock_state();
        match state.status {
            SessionStatus::Starting
            | SessionStatus::Started
            | SessionStatus::Initialized
            | SessionStatus::Stopping => Ok(()),
            SessionStatus::Stopped => {
                if let Some(fault) = state.fault.clone() {
                    return Err(fault);
                }
                state.status = SessionStatus::Starting;
                state.epoch += 1;
                let epoch = state.epoch;
                drop(state);

                let session = self.clone();
                tokio::spawn(async move {
                    session.run_negotiation(epoch).await;
                });
                Ok(())
            }
        }
    }

    async fn run_negotiation(self: Arc<Self>, epoch: u64) {
        tracing::debug!(server = self.definition.name(), "negotiation started");

        let shared = match self.provider.obtain(&self.root).await {
            Ok(shared) => shared,
            Err(error) => {
                self.finish_negotiation_err(epoch, error).await;
                return;
            }
        };
        let channel = shared.lock().await.take();
        let Some(channel) = channel else {
            // A stale entry from an abandoned attempt; drop it so the next
            // start spawns cleanly.
            self.provider.release(&self.root).await;
            let error = SessionError::ChannelStart {
                server: self.definition.name().to_string(),
                reason: "channel already claimed by another consumer".to_string(),
            };
            self.finish_negotiation_err(epoch, error).await;
            return;
        };

        let (transport, incoming) = Transport::start(channel);
        let stale = {
            let mut state = self.lock_state();
            if state.epoch != epoch || state.status != SessionStatus::Starting {
                true
            } else {
                state.transport = Some(transport.clone());
                state.status = SessionStatus::Started;
                false
            }
        };
        if stale {
            // Stopped while the channel was being obtained.
            transport.close().await;
            self.provider.release(&self.root).await;
            return;
        }
        tokio::spawn(self.clone().run_listener(incoming, epoch));

        let params = self.initialize_params();
        let server = self.definition.name().to_string();
        let outcome = match tokio::time::timeout(
            self.timeouts.initialize(),
            transport.request("initialize", params),
        )
        .await
        {
            Err(_) => Err(SessionError::NegotiationTimeout {
                server,
                timeout: self.timeouts.initialize(),
            }),
            Ok(Err(e)) => Err(SessionError::NegotiationFailed {
                server,
                reason: e.to_string(),
            }),
            Ok(Ok(value)) => match serde_json::from_value::<InitializeResult>(value) {
                Ok(result) => Ok(result),
                Err(e) => Err(SessionError::NegotiationFailed {
                    server,
                    reason: format!("malformed initialize result: {e}"),
                }),
            },
        };

        match outcome {
            Ok(result) => {
                // Mandatory post-initialization notification before anything
                // else flows on the channel.
                let _ = transport.notify("initialized", json!({}));
                self.finish_negotiation_ok(epoch, result).await;
            }
            Err(error) => self.finish_negotiation_err(epoch, error).await,
        }
    }

    async fn finish_negotiation_ok(self: &Arc<Self>, epoch: u64, result: InitializeResult) {
        let masked = self.definition.mask_capabilities(result.capabilities.clone());
        let (waiters, parked) = {
            let mut state = self.lock_state();
            if state.epoch != epoch || state.status != SessionStatus::Started {
                return; // stopped while the handshake was completing
            }
            state.status = SessionStatus::Initialized;
            state.capabilities = Some(masked.clone());
            (
                std::mem::take(&mut state.init_waiters),
                std::mem::take(&mut state.pending),
            )
        };

        tracing::info!(server = self.definition.name(), "session initialized");
        self.definition
            .listener()
            .initialized(self.definition.name(), &result);
        self.bus.emit(
            topics::SESSION_INITIALIZED,
            EventContext::new()
                .with(ctx_keys::SERVER, json!(self.definition.name()))
                .with(ctx_keys::PROJECT_ROOT, json!(self.root.display().to_string())),
        );

        for waiter in waiters {
            let _ = waiter.send(Ok(masked.clone()));
        }
        // Drain parked documents in insertion order; each goes through the
        // same idempotency check as a direct connect.
        for document in parked {
            if let Err(e) = self.connect(&document).await {
                tracing::warn!(
                    server = self.definition.name(),
                    uri = document.uri().as_str(),
                    error = %e,
                    "failed to connect parked document"
                );
            }
        }
    }

    async fn finish_negotiation_err(self: &Arc<Self>, epoch: u64, error: SessionError) {
        let waiters = {
            let mut state = self.lock_state();
            if state.epoch != epoch {
                return; // a stop already cleaned up and failed the waiters
            }
            std::mem::take(&mut state.init_waiters)
        };

        tracing::warn!(
            server = self.definition.name(),
            error = %error,
            "capability negotiation failed"
        );
        self.definition.listener().session_error(&error);
        self.emit_session_error(&error);
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }

        match &error {
            SessionError::ChannelStart { .. } => {
                // Never got off the ground; no teardown needed.
                let mut state = self.lock_state();
                if state.epoch == epoch {
                    state.status = SessionStatus::Stopped;
                    state.pending.clear();
                }
            }
            SessionError::NegotiationTimeout { .. } => {
                self.stop_with(false, Some(error), false).await;
            }
            _ => self.stop_with(false, None, false).await,
        }
    }

    async fn stop_with(
        self: &Arc<Self>,
        exit: bool,
        fault: Option<SessionError>,
        reset_crashes: bool,
    ) {
        let (transport, connected, waiters) = {
            let mut state = self.lock_state();
            if matches!(
                state.status,
                SessionStatus::Stopped | SessionStatus::Stopping
            ) {
                if fault.is_some() {
                    state.fault = fault;
                }
                return;
            }
            state.status = SessionStatus::Stopping;
            state.epoch += 1;
            state.pending.clear();
            (
                state.transport.take(),
                state.connected.drain().map(|(_, d)| d).collect::<Vec<_>>(),
                std::mem::take(&mut state.init_waiters),
            )
        };

        // Stopping cancels the in-flight negotiation for everyone awaiting.
        for waiter in waiters {
            let _ = waiter.send(Err(self.stopped_error()));
        }

        if let Some(transport) = transport {
            // Close notifications first, while the channel is still live.
            for document in &connected {
                let _ = transport.notify(
                    "textDocument/didClose",
                    json!({ "textDocument": { "uri": document.uri().as_str() } }),
                );
            }
            match tokio::time::timeout(
                self.timeouts.shutdown(),
                transport.request("shutdown", Value::Null),
            )
            .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    let failure = SessionError::ShutdownFailure {
                        server: self.definition.name().to_string(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(error = %failure, "teardown continues");
                }
                Err(_) => {
                    let failure = SessionError::ShutdownFailure {
                        server: self.definition.name().to_string(),
                        reason: format!("no acknowledgment within {:?}", self.timeouts.shutdown()),
                    };
                    tracing::warn!(error = %failure, "teardown continues");
                }
            }
            if exit && self.definition.wants_exit_notification() {
                let _ = transport.notify("exit", Value::Null);
            }
            transport.close().await;
        }

        for document in &connected {
            document.dispose();
        }
        self.provider.release(&self.root).await;

        {
            let mut state = self.lock_state();
            state.status = SessionStatus::Stopped;
            state.capabilities = None;
            state.transport = None;
            state.fault = fault;
            if reset_crashes {
                state.crash_count = 0;
            }
        }
        tracing::info!(server = self.definition.name(), "session stopped");
    }

    async fn run_listener(
        self: Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<Incoming>,
        epoch: u64,
    ) {
        while let Some(message) = incoming.recv().await {
            match message {
                Incoming::Notification { method, params } => {
                    self.handle_notification(&method, params);
                }
                Incoming::Request { id, method, .. } => {
                    let transport = self.lock_state().transport.clone();
                    if let Some(transport) = transport {
                        transport.reply_method_not_found(id, &method);
                    }
                }
                Incoming::Closed { reason } => {
                    let unexpected = {
                        let state = self.lock_state();
                        state.epoch == epoch
                            && !matches!(
                                state.status,
                                SessionStatus::Stopping | SessionStatus::Stopped
                            )
                    };
                    if unexpected {
                        self.crashed(&reason).await;
                    }
                    break;
                }
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Value) {
        match method {
            "textDocument/publishDiagnostics" => {
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(update) => {
                        let count = update.diagnostics.len();
                        self.diagnostics.set(&update.uri, update.diagnostics);
                        self.bus.emit(
                            topics::DIAGNOSTICS_UPDATED,
                            self.document_context(&update.uri).with("count", json!(count)),
                        );
                    }
                    Err(e) => tracing::warn!(
                        server = self.definition.name(),
                        error = %e,
                        "malformed diagnostics notification"
                    ),
                }
            }
            "window/logMessage" | "window/showMessage" => {
                tracing::debug!(server = self.definition.name(), ?params, "peer message");
            }
            other => {
                tracing::trace!(
                    server = self.definition.name(),
                    method = other,
                    "unhandled notification"
                );
            }
        }
    }

    fn initialize_params(&self) -> Value {
        json!({
            "processId": std::process::id(),
            "rootUri": self.root_uri.as_ref().map(|u| u.as_str()),
            "capabilities": {
                "textDocument": {
                    "synchronization": { "didSave": true, "willSave": true },
                    "publishDiagnostics": {}
                }
            },
            "initializationOptions": self
                .root_uri
                .as_ref()
                .and_then(|root| self.definition.initialization_options(root)),
        })
    }

    fn document_context(&self, uri: &Uri) -> EventContext {
        EventContext::for_document(uri.as_str(), &self.root.display().to_string())
            .with(ctx_keys::SERVER, json!(self.definition.name()))
    }

    fn emit_session_error(&self, error: &SessionError) {
        self.bus.emit(
            topics::SESSION_ERROR,
            EventContext::new()
                .with(ctx_keys::SERVER, json!(self.definition.name()))
                .with("error", json!(error.to_string())),
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.definition.name())
            .field("root", &self.root)
            .field("status", &self.status())
            .finish()
    }
}

fn park(pending: &mut Vec<Arc<Document>>, document: &Arc<Document>) {
    if !pending.iter().any(|d| d.uri() == document.uri()) {
        pending.push(document.clone());
    }
}
