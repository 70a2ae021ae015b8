//! Unix socket JSON-RPC server: the host's door into the pipe.
//!
//! Listens on a local socket for newline-delimited JSON-RPC 2.0
//! requests. All communication is local-only; the socket is owner-only.
//!
//! Methods:
//! - `pipe.models`: model list for the host's picker
//! - `pipe.chat`: forward one chat request
//! - `pipe.keys`: per-key health (masked)
//! - `pipe.health`: readiness summary

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::adapters::ChatRequest;
use crate::error::PipeError;
use crate::pipe::Pipe;

// ── JSON-RPC Types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    params: Option<serde_json::Value>,
    id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

/// Per-request size bound.
const MAX_REQUEST_BYTES: usize = 1_048_576;

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const PIPE_ERROR: i32 = -32000;

impl JsonRpcResponse {
    fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self { jsonrpc: "2.0".into(), result: Some(result), error: None, id }
    }
    fn error(id: Option<serde_json::Value>, code: i32, message: String) -> Self {
        Self { jsonrpc: "2.0".into(), result: None, error: Some(JsonRpcError { code, message }), id }
    }
    fn from_result<T: Serialize>(id: Option<serde_json::Value>, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Self::success(id, v),
            Err(e) => Self::error(id, PIPE_ERROR, e.to_string()),
        }
    }
}

// ── Server ──────────────────────────────────────────────────────────

pub struct Server {
    socket_path: PathBuf,
    pipe: Arc<Pipe>,
}

impl Server {
    pub fn new(socket_path: PathBuf, pipe: Arc<Pipe>) -> Self {
        Self { socket_path, pipe }
    }

    pub async fn run(&self) -> Result<()> {
        // Remove stale socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(socket = %self.socket_path.display(), "🔌 Pipe server listening");

        // ── 15-minute key pool pulse ──
        {
            let pipe = Arc::clone(&self.pipe);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(15 * 60));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let health = pipe.health();
                    let status = pipe.key_status();
                    info!(
                        keys = health.keys,
                        available = health.available_keys,
                        selections = status.iter().map(|k| k.total_selections).sum::<u64>(),
                        failures = status.iter().map(|k| k.total_failures).sum::<u64>(),
                        "💓 Key pool pulse"
                    );
                }
            });
        }

        loop {
            let (stream, _) = listener.accept().await?;
            let pipe = Arc::clone(&self.pipe);

            tokio::spawn(serve_connection(stream, pipe));
        }
    }
}

/// Serve newline-delimited requests on one connection until EOF.
async fn serve_connection(stream: UnixStream, pipe: Arc<Pipe>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        let response = match read_request_line(&mut reader, &mut line, MAX_REQUEST_BYTES).await {
            Ok(LineRead::Eof) | Err(_) => break,
            Ok(LineRead::TooLong) => {
                warn!(limit = MAX_REQUEST_BYTES, "Oversized request dropped");
                JsonRpcResponse::error(
                    None,
                    INVALID_REQUEST,
                    format!("Request exceeds {} bytes", MAX_REQUEST_BYTES),
                )
            }
            Ok(LineRead::Line) => {
                let raw = match std::str::from_utf8(&line) {
                    Ok(raw) => raw,
                    Err(_) => {
                        let resp = JsonRpcResponse::error(
                            None,
                            PARSE_ERROR,
                            "Parse error: request is not valid UTF-8".into(),
                        );
                        if write_response(&mut writer, &resp).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };
                if raw.trim().is_empty() {
                    continue;
                }
                handle_request(raw, &pipe).await
            }
        };
        if write_response(&mut writer, &response).await.is_err() {
            break;
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &JsonRpcResponse,
) -> std::io::Result<()> {
    let resp_json = serde_json::to_string(response).unwrap_or_default();
    writer.write_all(resp_json.as_bytes()).await?;
    writer.write_all(b"\n").await
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    /// Line exceeded the limit; it was consumed and discarded.
    TooLong,
    Eof,
}

/// Read one `\n`-terminated line into `buf`, bounded per line.
///
/// An oversized line is drained up to its newline so the next request
/// on the connection starts cleanly.
async fn read_request_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<LineRead> {
    buf.clear();
    let mut too_long = false;
    let mut saw_bytes = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (too_long, saw_bytes) {
                (true, _) => LineRead::TooLong,
                (false, true) => LineRead::Line,
                (false, false) => LineRead::Eof,
            });
        }
        saw_bytes = true;

        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        if !too_long {
            let content = if done { &available[..used - 1] } else { &available[..used] };
            if buf.len() + content.len() > max {
                too_long = true;
                buf.clear();
            } else {
                buf.extend_from_slice(content);
            }
        }
        reader.consume(used);

        if done {
            return Ok(if too_long { LineRead::TooLong } else { LineRead::Line });
        }
    }
}

// ── Request Handling ────────────────────────────────────────────────

async fn handle_request(raw: &str, pipe: &Pipe) -> JsonRpcResponse {
    let req: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => return JsonRpcResponse::error(None, PARSE_ERROR, format!("Parse error: {}", e)),
    };

    let params = req.params.unwrap_or(serde_json::Value::Null);

    match req.method.as_str() {
        "pipe.models" => JsonRpcResponse::from_result(req.id, pipe.models()),
        "pipe.keys" => JsonRpcResponse::from_result(req.id, pipe.key_status()),
        "pipe.health" => JsonRpcResponse::from_result(req.id, pipe.health()),
        "pipe.chat" => handle_chat(req.id, params, pipe).await,
        other => {
            warn!(method = %other, "Unknown method");
            JsonRpcResponse::error(req.id, METHOD_NOT_FOUND, format!("Method not found: {}", other))
        }
    }
}

async fn handle_chat(
    id: Option<serde_json::Value>,
    params: serde_json::Value,
    pipe: &Pipe,
) -> JsonRpcResponse {
    let chat: ChatRequest = match serde_json::from_value(params) {
        Ok(c) => c,
        Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid params: {}", e)),
    };

    match pipe.chat(&chat).await {
        Ok(out) => JsonRpcResponse::from_result(id, out),
        Err(e) => JsonRpcResponse::error(id, PIPE_ERROR, user_message(&e)),
    }
}

/// Message shown to the end user when a chat fails.
fn user_message(err: &PipeError) -> String {
    match err {
        PipeError::Upstream { status, body } => {
            format!("Gateway returned HTTP {}. Details: {}", status, body)
        }
        other => other.to_string(),
    }
}
