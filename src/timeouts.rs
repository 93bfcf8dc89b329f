//! Named timeout table shared by every remote call.
//!
//! All bounded waits (the initialize handshake, shutdown acknowledgment,
//! per-feature requests) draw from this table instead of hard-coding a
//! duration at each call site, so budgets can be tuned uniformly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A capability area of the peer.
///
/// Keys both the per-feature timeout lookup and a server definition's
/// disabled-feature set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Completion,
    Hover,
    SignatureHelp,
    Diagnostics,
    Formatting,
    CodeAction,
    WillSave,
}

/// Timeout budgets in milliseconds.
///
/// Deserializable so user configuration can override individual entries;
/// unspecified fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Capability negotiation (the `initialize` round-trip).
    pub initialize_ms: u64,
    /// Graceful shutdown acknowledgment.
    pub shutdown_ms: u64,
    pub completion_ms: u64,
    pub hover_ms: u64,
    pub signature_help_ms: u64,
    pub diagnostics_ms: u64,
    pub formatting_ms: u64,
    pub code_action_ms: u64,
    pub will_save_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            initialize_ms: 10_000,
            shutdown_ms: 2_000,
            completion_ms: 3_000,
            hover_ms: 2_000,
            signature_help_ms: 2_000,
            diagnostics_ms: 3_000,
            formatting_ms: 5_000,
            code_action_ms: 3_000,
            will_save_ms: 1_500,
        }
    }
}

impl Timeouts {
    pub fn initialize(&self) -> Duration {
        Duration::from_millis(self.initialize_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }

    /// Budget for a single feature request issued on behalf of a document.
    pub fn for_feature(&self, kind: FeatureKind) -> Duration {
        let ms = match kind {
            FeatureKind::Completion => self.completion_ms,
            FeatureKind::Hover => self.hover_ms,
            FeatureKind::SignatureHelp => self.signature_help_ms,
            FeatureKind::Diagnostics => self.diagnostics_ms,
            FeatureKind::Formatting => self.formatting_ms,
            FeatureKind::CodeAction => self.code_action_ms,
            FeatureKind::WillSave => self.will_save_ms,
        };
        Duration::from_millis(ms)
    }
}
