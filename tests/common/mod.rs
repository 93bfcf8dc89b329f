//! Shared fixtures: an in-process fake language server speaking the framed
//! protocol over an in-memory channel, plus recording hooks.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use async_trait::async_trait;
use lsp_sessions::channel::{duplex_channel, Channel, ChannelFactory};
use lsp_sessions::definition::{ServerDefinition, SessionEventListener};
use lsp_sessions::error::SessionError;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

/// How the fake peer behaves.
#[derive(Clone)]
pub struct FakePeerConfig {
    /// Delay before answering `initialize`.
    pub init_delay: Duration,
    /// When false the peer never answers `initialize` (for timeout tests).
    pub respond_initialize: bool,
    /// Capability object returned from `initialize`.
    pub capabilities: Value,
    /// Drop the connection right after answering `initialize`.
    pub drop_after_init: bool,
    /// Diagnostics array to publish for every document the client opens.
    pub diagnostics_on_open: Option<Value>,
}

impl Default for FakePeerConfig {
    fn default() -> Self {
        Self {
            init_delay: Duration::from_millis(0),
            respond_initialize: true,
            capabilities: json!({
                "completionProvider": { "triggerCharacters": [".", ":"] },
                "signatureHelpProvider": { "triggerCharacters": ["("] },
                "hoverProvider": true,
            }),
            drop_after_init: false,
            diagnostics_on_open: None,
        }
    }
}

/// Channel factory spawning one fake peer task per created channel.
pub struct FakePeerFactory {
    config: FakePeerConfig,
    /// Every method received, in arrival order, across all spawned peers.
    pub methods: Arc<Mutex<Vec<String>>>,
    pub spawn_count: Arc<AtomicUsize>,
}

impl FakePeerFactory {
    pub fn new(config: FakePeerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            methods: Arc::new(Mutex::new(Vec::new())),
            spawn_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap().clone()
    }

    pub fn count_of(&self, method: &str) -> usize {
        self.methods().iter().filter(|m| *m == method).count()
    }
}

#[async_trait]
impl ChannelFactory for FakePeerFactory {
    async fn create(&self, _working_dir: &Path) -> std::io::Result<Channel> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        let (ours, theirs) = duplex_channel(64 * 1024);
        tokio::spawn(run_peer(theirs, self.config.clone(), self.methods.clone()));
        Ok(ours)
    }
}

async fn run_peer(channel: Channel, config: FakePeerConfig, methods: Arc<Mutex<Vec<String>>>) {
    let (reader, mut writer, _guard) = channel.into_parts();
    let mut reader = BufReader::new(reader);

    loop {
        let Some(message) = read_frame(&mut reader).await else {
            return;
        };
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        methods.lock().unwrap().push(method.clone());

        match method.as_str() {
            "initialize" => {
                if !config.respond_initialize {
                    continue;
                }
                tokio::time::sleep(config.init_delay).await;
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": message["id"],
                    "result": {
                        "capabilities": config.capabilities,
                        "serverInfo": { "name": "fake-peer" },
                    },
                });
                if write_frame(&mut writer, &response).await.is_err() {
                    return;
                }
                if config.drop_after_init {
                    return;
                }
            }
            "shutdown" => {
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": message["id"],
                    "result": null,
                });
                if write_frame(&mut writer, &response).await.is_err() {
                    return;
                }
            }
            "exit" => return,
            "textDocument/didOpen" => {
                if let Some(diagnostics) = &config.diagnostics_on_open {
                    let uri = message["params"]["textDocument"]["uri"].clone();
                    let note = json!({
                        "jsonrpc": "2.0",
                        "method": "textDocument/publishDiagnostics",
                        "params": { "uri": uri, "diagnostics": diagnostics },
                    });
                    if write_frame(&mut writer, &note).await.is_err() {
                        return;
                    }
                }
            }
            "textDocument/hover" => {
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": message["id"],
                    "result": { "contents": "fake docs" },
                });
                if write_frame(&mut writer, &response).await.is_err() {
                    return;
                }
            }
            _ => {
                // Answer any other request so clients never hang on us.
                if message.get("id").is_some() {
                    let response = json!({
                        "jsonrpc": "2.0",
                        "id": message["id"],
                        "result": null,
                    });
                    if write_frame(&mut writer, &response).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn read_frame(reader: &mut BufReader<impl tokio::io::AsyncRead + Unpin>) -> Option<Value> {
    let mut content_length: Option<usize> = None;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await.ok()?;
        if read == 0 {
            return None;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, rest)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                content_length = rest.trim().parse().ok();
            }
        }
    }
    let mut body = vec![0u8; content_length?];
    reader.read_exact(&mut body).await.ok()?;
    serde_json::from_slice(&body).ok()
}

async fn write_frame(
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
    message: &Value,
) -> std::io::Result<()> {
    let body = serde_json::to_vec(message)?;
    writer
        .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
        .await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Listener capturing session health reports.
#[derive(Default)]
pub struct RecordingListener {
    pub initialized: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<SessionError>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

impl SessionEventListener for RecordingListener {
    fn initialized(&self, server: &str, _result: &lsp_types::InitializeResult) {
        self.initialized.lock().unwrap().push(server.to_string());
    }

    fn session_error(&self, error: &SessionError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

/// A definition for `.lua` files backed by a fake peer.
pub fn lua_definition(factory: Arc<FakePeerFactory>) -> ServerDefinition {
    ServerDefinition::new("lua-ls", ["lua"], factory)
}

/// Initialize the global tracing subscriber once (used by tests that run
/// with `RUST_LOG`).
pub fn init_tracing_from_env() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stdout);
        let _ = subscriber.try_init();
    });
}

/// Poll until `predicate` holds, failing the test after `timeout`.
pub async fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
