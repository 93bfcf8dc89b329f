//! Abstract bidirectional byte channel to a peer process.
//!
//! A [`Channel`] is a pair of byte streams plus whatever resource keeps the
//! peer alive (typically a spawned subprocess). Concrete transports are
//! interchangeable: a stdio pipe to a child process, or an in-memory duplex
//! pair for in-process peers and tests.

use crate::error::SessionError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::Mutex;

pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Holds the resource backing a channel so closing the channel can tear it
/// down (e.g. kill the spawned server process).
#[async_trait]
pub trait ChannelGuard: Send {
    async fn close(&mut self);
}

/// A started bidirectional connection to a peer.
pub struct Channel {
    reader: ChannelReader,
    writer: ChannelWriter,
    guard: Option<Box<dyn ChannelGuard>>,
}

impl Channel {
    pub fn new(reader: ChannelReader, writer: ChannelWriter) -> Self {
        Self {
            reader,
            writer,
            guard: None,
        }
    }

    pub fn with_guard(
        reader: ChannelReader,
        writer: ChannelWriter,
        guard: Box<dyn ChannelGuard>,
    ) -> Self {
        Self {
            reader,
            writer,
            guard: Some(guard),
        }
    }

    /// Split into I/O halves and the teardown guard. The halves are claimed
    /// by exactly one consumer; the session layer enforces this by routing
    /// every channel through its own transport.
    pub fn into_parts(self) -> (ChannelReader, ChannelWriter, Option<Box<dyn ChannelGuard>>) {
        (self.reader, self.writer, self.guard)
    }

    /// Close without handing the halves to anyone.
    pub async fn close(mut self) {
        if let Some(guard) = self.guard.as_mut() {
            guard.close().await;
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("guard", &self.guard.is_some())
            .finish()
    }
}

struct ProcessGuard {
    child: tokio::process::Child,
}

#[async_trait]
impl ChannelGuard for ProcessGuard {
    async fn close(&mut self) {
        // start_kill + wait instead of kill() so a process that already
        // exited does not produce an error we would have to swallow twice.
        if self.child.start_kill().is_ok() {
            let _ = self.child.wait().await;
        }
    }
}

/// Spawn `command args...` in `working_dir` and wire its stdio as a channel.
pub fn spawn_process_channel(
    command: &str,
    args: &[String],
    working_dir: &Path,
    env: &HashMap<String, String>,
) -> std::io::Result<Channel> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("child stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;

    Ok(Channel::with_guard(
        Box::new(stdout),
        Box::new(stdin),
        Box::new(ProcessGuard { child }),
    ))
}

/// An in-memory channel pair: bytes written to one side are read from the
/// other. The second element plays the peer.
pub fn duplex_channel(capacity: usize) -> (Channel, Channel) {
    let (ours, theirs) = tokio::io::duplex(capacity);
    let (our_read, our_write) = tokio::io::split(ours);
    let (their_read, their_write) = tokio::io::split(theirs);
    (
        Channel::new(Box::new(our_read), Box::new(our_write)),
        Channel::new(Box::new(their_read), Box::new(their_write)),
    )
}

/// Produces a started channel for a working directory.
///
/// A server definition supplies one of these; the provider wraps it with
/// per-key idempotency.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn create(&self, working_dir: &Path) -> std::io::Result<Channel>;
}

/// Factory spawning a configured command over stdio.
pub struct ProcessChannelFactory {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[async_trait]
impl ChannelFactory for ProcessChannelFactory {
    async fn create(&self, working_dir: &Path) -> std::io::Result<Channel> {
        spawn_process_channel(&self.command, &self.args, working_dir, &self.env)
    }
}

/// A channel slot shared between the provider and its consumer. The consumer
/// takes the channel out to drive I/O; the slot stays registered so a second
/// `obtain` for the same key observes the already-started channel.
pub type SharedChannel = Arc<Mutex<Option<Channel>>>;

/// Idempotent channel factory keyed by working directory.
///
/// A second `obtain` with the same key returns the already-started entry
/// rather than spawning a new peer; concurrent first calls race on a single
/// map lock so exactly one spawn happens per key.
pub struct ChannelProvider {
    server: String,
    factory: Arc<dyn ChannelFactory>,
    channels: Mutex<HashMap<PathBuf, SharedChannel>>,
}

impl ChannelProvider {
    pub fn new(server: impl Into<String>, factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            server: server.into(),
            factory,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Return the channel for `working_dir`, starting it on first use.
    ///
    /// Construction failure surfaces as [`SessionError::ChannelStart`]; it is
    /// never swallowed, and no entry is recorded for the failed key.
    pub async fn obtain(&self, working_dir: &Path) -> Result<SharedChannel, SessionError> {
        let mut channels = self.channels.lock().await;
        if let Some(existing) = channels.get(working_dir) {
            tracing::debug!(server = %self.server, dir = %working_dir.display(), "reusing channel");
            return Ok(existing.clone());
        }

        let channel = self.factory.create(working_dir).await.map_err(|e| {
            SessionError::ChannelStart {
                server: self.server.clone(),
                reason: e.to_string(),
            }
        })?;
        tracing::info!(server = %self.server, dir = %working_dir.display(), "channel started");

        let shared: SharedChannel = Arc::new(Mutex::new(Some(channel)));
        channels.insert(working_dir.to_path_buf(), shared.clone());
        Ok(shared)
    }

    /// Close and forget the channel for `working_dir`, if any.
    pub async fn release(&self, working_dir: &Path) {
        let removed = self.channels.lock().await.remove(working_dir);
        if let Some(slot) = removed {
            if let Some(channel) = slot.lock().await.take() {
                channel.close().await;
            }
            tracing::debug!(server = %self.server, dir = %working_dir.display(), "channel released");
        }
    }
}
