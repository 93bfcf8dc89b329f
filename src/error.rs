//! Typed failures of the session layer.
//!
//! Variants are `Clone` because the outcome of the shared negotiation is
//! fanned out to every caller that awaited it.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    /// The transport could not be created (spawn or connect failure).
    /// Fatal to that `start()` attempt; the session stays stopped.
    #[error("failed to start channel for '{server}': {reason}")]
    ChannelStart { server: String, reason: String },

    /// Capability negotiation exceeded its budget.
    #[error("capability negotiation with '{server}' timed out after {timeout:?}")]
    NegotiationTimeout { server: String, timeout: Duration },

    /// The peer rejected or errored during the handshake.
    #[error("capability negotiation with '{server}' failed: {reason}")]
    NegotiationFailed { server: String, reason: String },

    /// The peer did not acknowledge shutdown in time, or the channel was
    /// already gone. Logged by teardown, never propagated out of it.
    #[error("shutdown of '{server}' did not complete cleanly: {reason}")]
    ShutdownFailure { server: String, reason: String },

    /// The channel terminated unexpectedly too many times; the session
    /// refuses further use until an explicit `restart()`.
    #[error("'{server}' crashed {count} times; explicit restart required")]
    CrashThresholdExceeded { server: String, count: u32 },
}

impl SessionError {
    /// The display name of the server definition this error belongs to.
    pub fn server(&self) -> &str {
        match self {
            SessionError::ChannelStart { server, .. }
            | SessionError::NegotiationTimeout { server, .. }
            | SessionError::NegotiationFailed { server, .. }
            | SessionError::ShutdownFailure { server, .. }
            | SessionError::CrashThresholdExceeded { server, .. } => server,
        }
    }
}
