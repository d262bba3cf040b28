//! Line protocol spoken with the worker over stdio.
//!
//! One JSON object per line in both directions:
//! - out: `{"id": "...", "cmd": "...", "payload": {...}}`
//! - in:  `{"type": "response", "id": "...", "ok": bool, "data": {...}}`
//!   or   `{"type": "<event>", "data": {...}}`
//!
//! Lines that are not JSON objects with a string `type` are not protocol
//! traffic; `decode_line` returns `None` for them and callers drop them.

use std::io;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::error::{EngineError, EngineResult};

pub const RESPONSE_TYPE: &str = "response";

pub const EVENT_READY: &str = "engine.ready";
pub const EVENT_STATUS: &str = "engine.status";
pub const EVENT_RUNTIME: &str = "engine.runtime";
pub const EVENT_ERROR: &str = "engine.error";
/// Synthesized from the worker's stderr; never sent by the worker itself.
pub const EVENT_STDERR: &str = "engine.stderr";

/// Commands understood by the worker.
pub mod commands {
    pub const ENGINE_START: &str = "engine.start";
    pub const ENGINE_STOP: &str = "engine.stop";
    pub const ENGINE_GET_STATE: &str = "engine.get_state";
    pub const ENGINE_HEALTH: &str = "engine.health";
    pub const ENGINE_UPDATE_SETTINGS: &str = "engine.update_settings";
    pub const ENGINE_UPDATE_MAPPING: &str = "engine.update_mapping";
    pub const TRAINING_START: &str = "training.start";
    pub const TRAINING_CANCEL: &str = "training.cancel";
    pub const TRAINING_COMPLETE: &str = "training.complete";
    pub const PING: &str = "ping";
}

#[derive(Debug, Serialize)]
struct RequestLine<'a> {
    id: &'a str,
    cmd: &'a str,
    payload: &'a Value,
}

/// Unsolicited message from the worker (or synthesized from its stderr).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerEvent {
    pub name: String,
    pub data: Value,
    /// The full message as received.
    pub raw: Value,
}

impl WorkerEvent {
    pub fn new(name: &str, data: Value) -> Self {
        let raw = serde_json::json!({"type": name, "data": data});
        Self {
            name: name.to_string(),
            data,
            raw,
        }
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response { id: String, ok: bool, data: Value },
    Event(WorkerEvent),
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn normalize_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn decode_line(line: &str) -> Option<InboundMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let raw: Value = serde_json::from_str(line).ok()?;
    let obj = raw.as_object()?;
    let kind = obj.get("type").and_then(Value::as_str)?;
    let data = match obj.get("data") {
        None | Some(Value::Null) => empty_object(),
        Some(v) => v.clone(),
    };

    if kind == RESPONSE_TYPE {
        // The worker answers unparseable input with an id-less response; it
        // cannot be correlated to anything.
        let id = obj.get("id").and_then(normalize_id)?;
        let ok = obj.get("ok").and_then(Value::as_bool).unwrap_or(false);
        return Some(InboundMessage::Response { id, ok, data });
    }

    Some(InboundMessage::Event(WorkerEvent {
        name: kind.to_string(),
        data,
        raw,
    }))
}

/// Encodes one request as a single `\n`-terminated line.
pub fn encode_request(id: &str, cmd: &str, payload: &Value) -> EngineResult<String> {
    let empty = empty_object();
    let payload = if payload.is_null() { &empty } else { payload };
    let mut line = serde_json::to_string(&RequestLine { id, cmd, payload })
        .map_err(|e| EngineError::Protocol(format!("encode request {cmd} failed: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Splits a byte stream into lines. Invalid UTF-8 is replaced rather than
/// reported, so one garbled line cannot stop the stream.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator; `None` at end of stream.
    ///
    /// Cancel safe: bytes of a partially read line stay buffered for the next call.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let n = self.inner.read_until(b'\n', &mut self.buf).await?;
        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let mut raw = std::mem::take(&mut self.buf);
        if raw.last() == Some(&b'\n') {
            raw.pop();
        }
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
    }
}

/// Reason carried by a rejected response: `data.error`, else a generic text.
pub fn rejection_reason(data: &Value) -> String {
    match data.get("error") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(v) if !v.is_null() && !v.is_string() => v.to_string(),
        _ => "Engine command failed".to_string(),
    }
}
