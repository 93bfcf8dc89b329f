//! JSON-RPC framing and request correlation over a [`Channel`].
//!
//! This is the lower layer the session core sequences messages through.
//! Messages are JSON values framed by HTTP-like headers:
//!
//! ```text
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes of UTF-8 JSON>
//! ```
//!
//! The transport runs two tokio tasks: a writer draining an outgoing queue,
//! and a reader that routes responses to their waiting request futures and
//! forwards everything else (notifications, server-initiated requests,
//! channel termination) to the session's incoming stream.

use crate::channel::{Channel, ChannelGuard, ChannelReader};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    /// The channel is closed (or closed while the request was in flight).
    #[error("connection closed: {0}")]
    Closed(String),

    /// The peer answered with a JSON-RPC error object.
    #[error("peer error {code}: {message}")]
    Peer { code: i64, message: String },
}

/// A message arriving from the peer that is not a response to one of our
/// requests.
#[derive(Debug)]
pub enum Incoming {
    Notification { method: String, params: Value },
    Request { id: Value, method: String, params: Value },
    /// The read side of the channel terminated. Sent exactly once, last.
    Closed { reason: String },
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>>>;

pub struct Transport {
    next_id: AtomicI64,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    pending: PendingMap,
    guard: Mutex<Option<Box<dyn ChannelGuard>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Take over the channel's I/O halves and start the pump tasks.
    ///
    /// The returned receiver yields notifications and server-initiated
    /// requests, terminated by a single [`Incoming::Closed`].
    pub fn start(channel: Channel) -> (Arc<Transport>, mpsc::UnboundedReceiver<Incoming>) {
        let (reader, mut writer, guard) = channel.into_parts();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Incoming>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_task = tokio::spawn(async move {
            let reason = read_loop(reader, &reader_pending, &in_tx).await;
            fail_pending(&reader_pending, &reason);
            let _ = in_tx.send(Incoming::Closed { reason });
        });

        let transport = Arc::new(Transport {
            next_id: AtomicI64::new(1),
            outgoing: out_tx,
            pending,
            guard: Mutex::new(guard),
            reader_task: Mutex::new(Some(reader_task)),
            writer_task: Mutex::new(Some(writer_task)),
        });
        (transport, in_rx)
    }

    /// Send a request and await the correlated response.
    ///
    /// Callers bound this with a timeout from the shared table; the transport
    /// itself only fails when the channel closes or the peer errors.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        match self.pending.lock() {
            Ok(mut pending) => {
                pending.insert(id, tx);
            }
            Err(_) => return Err(RpcError::Closed("transport state poisoned".to_string())),
        }

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if self.send_frame(&message).is_err() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(RpcError::Closed("write queue closed".to_string()));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Closed("connection closed".to_string())),
        }
    }

    /// Send a notification (no response expected).
    pub fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.send_frame(&message)
    }

    /// Answer a server-initiated request with an error result.
    pub fn reply_method_not_found(&self, id: Value, method: &str) {
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": format!("method not supported: {method}") },
        });
        let _ = self.send_frame(&message);
    }

    fn send_frame(&self, message: &Value) -> Result<(), RpcError> {
        let body = match serde_json::to_vec(message) {
            Ok(body) => body,
            Err(e) => return Err(RpcError::Closed(e.to_string())),
        };
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);
        self.outgoing
            .send(frame)
            .map_err(|_| RpcError::Closed("write queue closed".to_string()))
    }

    /// Tear down the pump tasks and the underlying channel resource.
    pub async fn close(&self) {
        let reader = match self.reader_task.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(task) = reader {
            task.abort();
        }
        let writer = match self.writer_task.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(task) = writer {
            task.abort();
        }
        let guard = match self.guard.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(mut guard) = guard {
            guard.close().await;
        }
        fail_pending(&self.pending, "transport closed");
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish()
    }
}

/// Pump incoming messages until EOF or a framing error; returns the reason
/// the loop ended.
async fn read_loop(
    reader: ChannelReader,
    pending: &PendingMap,
    incoming: &mpsc::UnboundedSender<Incoming>,
) -> String {
    let mut reader = BufReader::new(reader);
    loop {
        let message = match read_message(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => return "peer closed the connection".to_string(),
            Err(e) => return format!("read failed: {e}"),
        };
        route_message(message, pending, incoming);
    }
}

fn route_message(
    message: Value,
    pending: &PendingMap,
    incoming: &mpsc::UnboundedSender<Incoming>,
) {
    let id = message.get("id").cloned();
    let method = message
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);

    match (id, method) {
        // Response to one of our requests.
        (Some(id), None) => {
            let Some(id) = id.as_i64() else {
                tracing::warn!(?id, "response with non-numeric id dropped");
                return;
            };
            let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
            let Some(waiter) = waiter else {
                tracing::debug!(id, "response without a waiting request");
                return;
            };
            let result = if let Some(error) = message.get("error") {
                Err(RpcError::Peer {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                })
            } else {
                Ok(message.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = waiter.send(result);
        }
        // Server-initiated request.
        (Some(id), Some(method)) => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            let _ = incoming.send(Incoming::Request { id, method, params });
        }
        // Notification.
        (None, Some(method)) => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            let _ = incoming.send(Incoming::Notification { method, params });
        }
        (None, None) => {
            tracing::warn!("malformed message without id or method dropped");
        }
    }
}

/// Read one framed message. `Ok(None)` on clean EOF.
async fn read_message(
    reader: &mut BufReader<ChannelReader>,
) -> std::io::Result<Option<Value>> {
    let mut content_length: Option<usize> = None;
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, rest)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                content_length = rest.trim().parse::<usize>().ok();
            }
        }
    }

    let len = content_length.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "missing Content-Length")
    })?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn fail_pending(pending: &PendingMap, reason: &str) {
    let waiters: Vec<_> = match pending.lock() {
        Ok(mut pending) => pending.drain().map(|(_, tx)| tx).collect(),
        Err(_) => return,
    };
    for waiter in waiters {
        let _ = waiter.send(Err(RpcError::Closed(reason.to_string())));
    }
}
