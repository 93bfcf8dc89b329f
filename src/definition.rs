//! Declarative description of one peer kind.
//!
//! A [`ServerDefinition`] is pure data plus one factory method: which file
//! extensions it claims, how to create its channel, which capability areas
//! are disabled for it, and an optional listener observing session health.

use crate::channel::{ChannelFactory, ProcessChannelFactory};
use crate::error::SessionError;
use crate::timeouts::FeatureKind;
use lsp_types::{InitializeResult, OneOf, ServerCapabilities, TextDocumentSyncCapability, Uri};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Observer for session health, one per definition.
///
/// All methods default to no-ops so definitions that don't care about
/// session health omit the implementation entirely.
pub trait SessionEventListener: Send + Sync {
    /// The initialize handshake completed.
    fn initialized(&self, server: &str, result: &InitializeResult) {
        let _ = (server, result);
    }

    /// A handler failure: negotiation timeout, crash, IO failure.
    fn session_error(&self, error: &SessionError) {
        let _ = error;
    }
}

/// Listener used when a definition does not install one.
pub struct NoopSessionListener;

impl SessionEventListener for NoopSessionListener {}

pub type InitOptionsFn = Box<dyn Fn(&Uri) -> Option<Value> + Send + Sync>;

pub struct ServerDefinition {
    name: String,
    extensions: Vec<String>,
    factory: Arc<dyn ChannelFactory>,
    listener: Arc<dyn SessionEventListener>,
    disabled: HashSet<FeatureKind>,
    wants_exit_notification: bool,
    init_options: Option<InitOptionsFn>,
}

impl ServerDefinition {
    pub fn new(
        name: impl Into<String>,
        extensions: impl IntoIterator<Item = impl AsRef<str>>,
        factory: Arc<dyn ChannelFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            extensions: extensions
                .into_iter()
                .map(|e| normalize_extension(e.as_ref()))
                .collect(),
            factory,
            listener: Arc::new(NoopSessionListener),
            disabled: HashSet::new(),
            wants_exit_notification: true,
            init_options: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn SessionEventListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Mask out a capability area for this peer.
    pub fn disable(mut self, feature: FeatureKind) -> Self {
        self.disabled.insert(feature);
        self
    }

    /// Whether `stop` should follow the shutdown acknowledgment with a
    /// terminal `exit` notification.
    pub fn with_exit_notification(mut self, wants: bool) -> Self {
        self.wants_exit_notification = wants;
        self
    }

    /// Protocol-specific initialization options, derived from the root URI.
    pub fn with_init_options(mut self, f: InitOptionsFn) -> Self {
        self.init_options = Some(f);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn matches_extension(&self, extension: &str) -> bool {
        let normalized = normalize_extension(extension);
        self.extensions.iter().any(|e| *e == normalized)
    }

    pub fn is_disabled(&self, feature: FeatureKind) -> bool {
        self.disabled.contains(&feature)
    }

    pub fn wants_exit_notification(&self) -> bool {
        self.wants_exit_notification
    }

    pub fn factory(&self) -> Arc<dyn ChannelFactory> {
        self.factory.clone()
    }

    pub fn listener(&self) -> Arc<dyn SessionEventListener> {
        self.listener.clone()
    }

    pub fn initialization_options(&self, root: &Uri) -> Option<Value> {
        self.init_options.as_ref().and_then(|f| f(root))
    }

    /// Strip disabled capability areas from a negotiated capability object
    /// before any document binding consumes it.
    pub fn mask_capabilities(&self, mut caps: ServerCapabilities) -> ServerCapabilities {
        if self.is_disabled(FeatureKind::Completion) {
            caps.completion_provider = None;
        }
        if self.is_disabled(FeatureKind::Hover) {
            caps.hover_provider = None;
        }
        if self.is_disabled(FeatureKind::SignatureHelp) {
            caps.signature_help_provider = None;
        }
        if self.is_disabled(FeatureKind::Formatting) {
            caps.document_formatting_provider = None;
            caps.document_range_formatting_provider = None;
        }
        if self.is_disabled(FeatureKind::CodeAction) {
            caps.code_action_provider = None;
        }
        if self.is_disabled(FeatureKind::Diagnostics) {
            caps.diagnostic_provider = None;
        }
        if self.is_disabled(FeatureKind::WillSave) {
            if let Some(TextDocumentSyncCapability::Options(options)) =
                caps.text_document_sync.as_mut()
            {
                options.will_save = None;
                options.will_save_wait_until = None;
            }
        }
        caps
    }
}

impl std::fmt::Debug for ServerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDefinition")
            .field("name", &self.name)
            .field("extensions", &self.extensions)
            .field("disabled", &self.disabled)
            .finish()
    }
}

/// Whether a (masked) capability object advertises a feature area.
pub fn advertises(caps: &ServerCapabilities, feature: FeatureKind) -> bool {
    match feature {
        FeatureKind::Completion => caps.completion_provider.is_some(),
        FeatureKind::Hover => caps.hover_provider.is_some(),
        FeatureKind::SignatureHelp => caps.signature_help_provider.is_some(),
        FeatureKind::Formatting => !matches!(
            caps.document_formatting_provider,
            None | Some(OneOf::Left(false))
        ),
        FeatureKind::CodeAction => caps.code_action_provider.is_some(),
        FeatureKind::Diagnostics => caps.diagnostic_provider.is_some(),
        FeatureKind::WillSave => match caps.text_document_sync.as_ref() {
            Some(TextDocumentSyncCapability::Options(options)) => {
                options.will_save.unwrap_or(false) || options.will_save_wait_until.unwrap_or(false)
            }
            _ => false,
        },
    }
}

fn normalize_extension(extension: &str) -> String {
    extension.trim_start_matches('.').to_lowercase()
}

fn default_true() -> bool {
    true
}

/// On-disk configuration for a stdio-spawned server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Command to spawn the server.
    /// Required when enabled=true, ignored when enabled=false.
    #[serde(default)]
    pub command: String,

    /// Arguments to pass to the server
    #[serde(default)]
    pub args: Vec<String>,

    /// Whether the server is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Extra environment for the spawned process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Custom initialization options to send to the server
    #[serde(default)]
    pub initialization_options: Option<Value>,
}

impl ServerConfig {
    /// Merge this config with defaults, using default values for empty/unset
    /// fields. Used when loading configs where fields like `command` may be
    /// empty because they weren't specified in the user's config file.
    pub fn merge_with_defaults(self, defaults: &ServerConfig) -> ServerConfig {
        ServerConfig {
            command: if self.command.is_empty() {
                defaults.command.clone()
            } else {
                self.command
            },
            args: if self.args.is_empty() {
                defaults.args.clone()
            } else {
                self.args
            },
            enabled: self.enabled,
            env: if self.env.is_empty() {
                defaults.env.clone()
            } else {
                self.env
            },
            initialization_options: self
                .initialization_options
                .or_else(|| defaults.initialization_options.clone()),
        }
    }

    /// Build a process-spawning definition from this config.
    pub fn into_definition(
        self,
        name: impl Into<String>,
        extensions: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> ServerDefinition {
        let factory = Arc::new(ProcessChannelFactory {
            command: self.command,
            args: self.args,
            env: self.env,
        });
        let mut definition = ServerDefinition::new(name, extensions, factory);
        if let Some(options) = self.initialization_options {
            definition =
                definition.with_init_options(Box::new(move |_root| Some(options.clone())));
        }
        definition
    }
}
