//! Client-side session management for language analysis services.
//!
//! This crate owns the hard part of wiring an editor surface to external
//! language servers: starting and capability-negotiating a peer over an
//! abstract byte channel, multiplexing many open documents (and optionally
//! several peers claiming the same extension) onto shared sessions, and
//! keeping the session state machine consistent under concurrent
//! connect/disconnect/timeout/crash events.
//!
//! ```text
//! Document ──► Project (resolve by extension) ──► Session ──► peer process
//!     ▲                                              │
//!     └──── EventBus ◄── DiagnosticsStore ◄──────────┘
//! ```
//!
//! The visual editor, popup rendering and feature semantics (completion
//! ranking, formatting, ...) live outside; they subscribe to the event bus
//! and issue feature requests against connected documents.

pub mod aggregated;
pub mod channel;
pub mod definition;
pub mod diagnostics;
pub mod document;
pub mod error;
pub mod events;
pub mod project;
pub mod session;
pub mod timeouts;
pub mod transport;
pub mod uri;

pub use aggregated::AggregatedSession;
pub use channel::{Channel, ChannelFactory, ChannelProvider};
pub use definition::{ServerConfig, ServerDefinition, SessionEventListener};
pub use diagnostics::DiagnosticsStore;
pub use document::{Document, EditorSurface};
pub use error::SessionError;
pub use events::{EventBus, EventContext, EventListener};
pub use project::{Project, SessionTarget};
pub use session::{Session, SessionStatus, CRASH_RETRY_THRESHOLD};
pub use timeouts::{FeatureKind, Timeouts};
