//! TCP JSON-RPC 2.0 server
//!
//! Framing: newline-delimited JSON; a line holds either a single request
//! object or a batch array. Responses for one connection are written in
//! request order. A line exceeding the size limit closes the connection.
//!
//! Dispatch itself is synchronous and lives in [`dispatch_line`] so the
//! framing and batch semantics are testable without sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

use lfc_protocol::{codes, rpc_error, rpc_result, MAX_LINE_BYTES};

use crate::handlers::error_code;
use crate::registry::CommandRegistry;

/// Read one newline-terminated line without buffering past `max_len`.
/// Returns Ok(0) on EOF; an oversized line is an error.
async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(out.len());
        }

        let mut take_len = available.len();
        let mut found_newline = false;
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            take_len = pos + 1;
            found_newline = true;
        }

        if out.len() + take_len > max_len {
            let consume_len = take_len.min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "line too long",
            ));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

/// Dispatch one request object. Returns None for notifications (no `id`).
fn dispatch_one(registry: &CommandRegistry, request: &Value) -> Option<Value> {
    let Some(obj) = request.as_object() else {
        return Some(rpc_error(
            Value::Null,
            codes::INVALID_REQUEST,
            "Invalid Request",
        ));
    };

    let id = obj.get("id").cloned();
    let Some(method) = obj.get("method").and_then(Value::as_str) else {
        return Some(rpc_error(
            id.unwrap_or(Value::Null),
            codes::INVALID_REQUEST,
            "Invalid Request (method)",
        ));
    };

    let params = obj.get("params").cloned().unwrap_or(Value::Null);
    trace!(method = %method, notification = id.is_none(), "dispatch");
    let outcome = registry.call(method, &params);

    // Notifications execute for their side effects but produce no response.
    let id = id?;
    Some(match outcome {
        Ok(result) => rpc_result(id, result),
        Err(e) => rpc_error(id, error_code(&e), e.to_string()),
    })
}

/// Dispatch one wire line (object or batch). Returns the response line
/// without trailing newline, or None when nothing must be sent.
pub fn dispatch_line(registry: &CommandRegistry, line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => {
            return Some(
                rpc_error(Value::Null, codes::PARSE_ERROR, "Parse error").to_string(),
            )
        }
    };

    match parsed {
        Value::Array(items) => {
            if items.is_empty() {
                return Some(
                    rpc_error(Value::Null, codes::INVALID_REQUEST, "Invalid Request")
                        .to_string(),
                );
            }
            let responses: Vec<Value> = items
                .iter()
                .filter_map(|item| dispatch_one(registry, item))
                .collect();
            if responses.is_empty() {
                // a batch of only notifications produces no bytes
                None
            } else {
                serde_json::to_string(&responses).ok()
            }
        }
        other => dispatch_one(registry, &other).map(|v| v.to_string()),
    }
}

async fn handle_client(stream: TcpStream, registry: Arc<CommandRegistry>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    debug!(peer = %peer, "client connected");

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line: Vec<u8> = Vec::with_capacity(4096);

    loop {
        match read_line_bounded(&mut reader, &mut line, MAX_LINE_BYTES).await {
            Ok(0) => {
                debug!(peer = %peer, "client disconnected");
                break;
            }
            Ok(_) => {
                let Ok(text) = std::str::from_utf8(&line) else {
                    warn!(peer = %peer, "non-utf8 request, closing");
                    break;
                };
                if let Some(mut response) = dispatch_line(&registry, text) {
                    response.push('\n');
                    if write_half.write_all(response.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                // oversized line: close the connection
                warn!(peer = %peer, max = MAX_LINE_BYTES, "request line too long, closing");
                break;
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "read error");
                break;
            }
        }
    }
}

/// Accept loop. Runs until `stop` is raised; each connection gets its own
/// task with a sequential read/dispatch/write loop.
pub async fn run_server(
    host: &str,
    port: u16,
    registry: Arc<CommandRegistry>,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(host = %host, port = port, "rpc listening");

    let mut stop_poll = tokio::time::interval(Duration::from_millis(200));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let registry = registry.clone();
                        tokio::spawn(handle_client(stream, registry));
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
            _ = stop_poll.tick() => {
                if stop.load(Ordering::Acquire) {
                    info!("rpc server stopping");
                    break;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfc_error::LfcError;
    use serde_json::json;

    fn test_registry() -> CommandRegistry {
        let reg = CommandRegistry::new();
        reg.register("ping", "Health check", |_| Ok(json!({ "pong": true })));
        reg.register("echo", "Echo params", |params| Ok(params.clone()));
        reg.register("boom", "Always fails", |_| {
            Err(LfcError::invalid("bad input"))
        });
        reg
    }

    #[test]
    fn test_ping_roundtrip() {
        let reg = test_registry();
        let out = dispatch_line(&reg, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 1);
        assert_eq!(v["result"]["pong"], true);
        assert!(v.get("error").is_none());
    }

    #[test]
    fn test_parse_error() {
        let reg = test_registry();
        let out = dispatch_line(&reg, "{not json").unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["error"]["code"], -32700);
        assert!(v["id"].is_null());
    }

    #[test]
    fn test_invalid_request_non_object() {
        let reg = test_registry();
        let out = dispatch_line(&reg, "42").unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["error"]["code"], -32600);
    }

    #[test]
    fn test_method_not_found_keeps_id() {
        let reg = test_registry();
        let out =
            dispatch_line(&reg, r#"{"jsonrpc":"2.0","id":"x","method":"nope"}"#).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["error"]["code"], -32601);
        assert_eq!(v["id"], "x");
    }

    #[test]
    fn test_handler_error_maps_to_invalid_params() {
        let reg = test_registry();
        let out = dispatch_line(&reg, r#"{"jsonrpc":"2.0","id":7,"method":"boom"}"#).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["error"]["code"], -32602);
        assert!(v["error"]["message"]
            .as_str()
            .unwrap()
            .contains("bad input"));
    }

    #[test]
    fn test_notification_produces_no_response() {
        let reg = test_registry();
        assert!(dispatch_line(&reg, r#"{"jsonrpc":"2.0","method":"ping"}"#).is_none());
    }

    #[test]
    fn test_mixed_batch_omits_notifications() {
        let reg = test_registry();
        let out = dispatch_line(
            &reg,
            r#"[{"jsonrpc":"2.0","id":"a","method":"ping"},{"jsonrpc":"2.0","method":"ping"}]"#,
        )
        .unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        let arr = v.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["id"], "a");
    }

    #[test]
    fn test_notification_only_batch_is_silent() {
        let reg = test_registry();
        let line = r#"[{"jsonrpc":"2.0","method":"ping"},{"jsonrpc":"2.0","method":"ping"}]"#;
        assert!(dispatch_line(&reg, line).is_none());
    }

    #[test]
    fn test_batch_preserves_submission_order() {
        let reg = test_registry();
        let out = dispatch_line(
            &reg,
            r#"[{"id":2,"method":"echo","params":{"n":2}},{"id":1,"method":"echo","params":{"n":1}}]"#,
        )
        .unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        let arr = v.as_array().unwrap();
        assert_eq!(arr[0]["id"], 2);
        assert_eq!(arr[0]["result"]["n"], 2);
        assert_eq!(arr[1]["id"], 1);
    }

    #[test]
    fn test_empty_batch_is_invalid() {
        let reg = test_registry();
        let out = dispatch_line(&reg, "[]").unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["error"]["code"], -32600);
    }

    #[test]
    fn test_empty_line_ignored() {
        let reg = test_registry();
        assert!(dispatch_line(&reg, "").is_none());
        assert!(dispatch_line(&reg, "   ").is_none());
    }

    #[tokio::test]
    async fn test_read_line_bounded() {
        let data: &[u8] = b"first\nsecond\n";
        let mut reader = BufReader::new(data);
        let mut out = Vec::new();

        let n = read_line_bounded(&mut reader, &mut out, 64).await.unwrap();
        assert_eq!(n, 6);
        assert_eq!(out, b"first\n");

        let n = read_line_bounded(&mut reader, &mut out, 64).await.unwrap();
        assert_eq!(n, 7);
        assert_eq!(out, b"second\n");

        assert_eq!(read_line_bounded(&mut reader, &mut out, 64).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_line_bounded_rejects_oversized() {
        let big = vec![b'x'; 128];
        let mut reader = BufReader::new(&big[..]);
        let mut out = Vec::new();

        let err = read_line_bounded(&mut reader, &mut out, 64)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_request_with_null_id_gets_response() {
        // "id": null is present, so this is not a notification
        let reg = test_registry();
        let out =
            dispatch_line(&reg, r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert!(v["id"].is_null());
        assert_eq!(v["result"]["pong"], true);
    }
}
