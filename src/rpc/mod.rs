//! Line-delimited JSON-RPC over a subprocess's stdio.
//!
//! The peer omits the `jsonrpc` version field. Messages are classified by
//! shape: `{id, result|error}` answers one of our requests, `{id, method}`
//! is a server request that needs an answer, `{method}` is a notification.
//! Anything else on stdout, and every stderr line, is surfaced as a log line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::RpcError;
use crate::ids::RequestId;
use crate::machine::RunHandle;

type PendingReply = oneshot::Sender<Result<Value, RpcError>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Line buffering
// ---------------------------------------------------------------------------

/// Reassembles newline-terminated lines from arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    /// Append `chunk` and return every completed, non-blank line (trimmed).
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Bytes received after the last newline.
    pub fn pending_len(&self) -> usize {
        self.partial.len()
    }
}

// ---------------------------------------------------------------------------
// Inbound messages
// ---------------------------------------------------------------------------

/// A server request or notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    obj: Map<String, Value>,
}

impl Incoming {
    pub fn id(&self) -> Option<RequestId> {
        self.obj.get("id").and_then(RequestId::from_json)
    }

    pub fn method(&self) -> &str {
        self.obj.get("method").and_then(Value::as_str).unwrap_or_default()
    }

    /// `params` when it is an object; empty otherwise.
    pub fn params(&self) -> Map<String, Value> {
        self.obj
            .get("params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.obj
    }
}

/// What a caller must handle after feeding output. Responses to our own
/// requests are resolved internally and never appear here.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(Incoming),
    Notification(Incoming),
    Log(String),
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct JsonRpcConnection {
    writer: Arc<dyn RunHandle>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, PendingReply>>,
    closed: AtomicBool,
    stdout: Mutex<LineBuffer>,
    stderr: Mutex<LineBuffer>,
}

impl JsonRpcConnection {
    pub fn new(writer: Arc<dyn RunHandle>) -> Self {
        Self {
            writer,
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            stdout: Mutex::new(LineBuffer::default()),
            stderr: Mutex::new(LineBuffer::default()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still awaiting an answer.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send `{id, method, params}` and wait for the matching response.
    ///
    /// Resolves with `RpcError::Closed` if the connection closes first.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let id = RequestId::Int(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        // close() may have drained the table between the check and insert.
        if self.is_closed() {
            lock(&self.pending).remove(&id);
            return Err(RpcError::Closed);
        }

        debug!(%id, method, "rpc request");
        let message = json!({ "id": id, "method": method, "params": params });
        if let Err(err) = self.write_message(&message).await {
            lock(&self.pending).remove(&id);
            return Err(err);
        }
        rx.await.unwrap_or(Err(RpcError::Closed))
    }

    /// Answer a server request with `{id, result}`.
    pub async fn respond(&self, id: &RequestId, result: Value) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        debug!(%id, "rpc respond");
        self.write_message(&json!({ "id": id, "result": result })).await
    }

    /// Feed raw stdout bytes. Responses resolve pending requests; everything
    /// else is returned in arrival order.
    pub fn feed_stdout(&self, chunk: &[u8]) -> Vec<Inbound> {
        let lines = lock(&self.stdout).feed(chunk);
        lines
            .into_iter()
            .filter_map(|line| self.classify_line(line))
            .collect()
    }

    /// Feed raw stderr bytes; every complete line is a log line.
    pub fn feed_stderr(&self, chunk: &[u8]) -> Vec<Inbound> {
        lock(&self.stderr)
            .feed(chunk)
            .into_iter()
            .map(Inbound::Log)
            .collect()
    }

    /// Reject every pending request and refuse further writes. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<PendingReply> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "rejecting pending rpc requests");
        }
        for tx in drained {
            let _ = tx.send(Err(RpcError::Closed));
        }
    }

    async fn write_message(&self, message: &Value) -> Result<(), RpcError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_stdin(&line).await?;
        Ok(())
    }

    fn classify_line(&self, line: String) -> Option<Inbound> {
        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(_) => return Some(Inbound::Log(line)),
        };
        let Value::Object(obj) = value else {
            trace!("ignoring non-object rpc line");
            return None;
        };

        let id = obj.get("id").and_then(RequestId::from_json);
        let has_method = obj.get("method").and_then(Value::as_str).is_some();
        match (id, has_method) {
            (Some(_), true) => Some(Inbound::Request(Incoming { obj })),
            (None, true) => Some(Inbound::Notification(Incoming { obj })),
            (Some(id), false) if obj.contains_key("result") || obj.contains_key("error") => {
                self.resolve(id, obj);
                None
            }
            _ => Some(Inbound::Log(line)),
        }
    }

    fn resolve(&self, id: RequestId, mut obj: Map<String, Value>) {
        let Some(tx) = lock(&self.pending).remove(&id) else {
            warn!(%id, "rpc response for unknown request");
            return;
        };
        let outcome = match obj.remove("error") {
            Some(error) if !error.is_null() => Err(RpcError::Remote(error)),
            _ => Ok(obj.remove("result").unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
    }
}
