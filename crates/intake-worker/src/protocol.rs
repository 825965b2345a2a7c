//! Wire format spoken with the automation worker.
//!
//! One UTF-8 JSON object per line in both directions:
//!
//! ```text
//! -> {"id":7,"payload":{"action":"append",...}}
//! <- {"id":7,"ok":true,"appendRow":42,...}
//! <- {"id":8,"ok":false,"error":"...","where":"...","detail":"...","line":12,"code":"..."}
//! ```

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound for a single response line.
pub const MAX_RESPONSE_LINE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct WorkerRequest<'a> {
    id: u64,
    payload: &'a Value,
}

/// Encode one request line, including the trailing newline.
pub fn encode_request(id: u64, payload: &Value) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(&WorkerRequest { id, payload })?;
    line.push(b'\n');
    Ok(line)
}

/// A correlated response. `body` holds every field except `id` and `ok`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub id: u64,
    pub ok: bool,
    pub body: Map<String, Value>,
}

impl WorkerResponse {
    pub fn into_result(self) -> Result<Map<String, Value>, RemoteFailure> {
        if self.ok {
            Ok(self.body)
        } else {
            Err(RemoteFailure::from_body(&self.body))
        }
    }
}

/// Parse a response line; anything that is not an object with a usable `id` is `None`.
pub fn parse_response_line(line: &str) -> Option<WorkerResponse> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Value::Object(mut body) = serde_json::from_str::<Value>(trimmed).ok()? else {
        return None;
    };
    let id = match body.remove("id")? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    let ok = body.remove("ok").and_then(|v| v.as_bool()).unwrap_or(false);
    Some(WorkerResponse { id, ok, body })
}

/// Diagnostics of a failed worker operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteFailure {
    pub error: String,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl RemoteFailure {
    pub fn from_body(body: &Map<String, Value>) -> RemoteFailure {
        RemoteFailure {
            error: text_field(body, "error").unwrap_or_else(|| "Worker error".to_string()),
            where_: text_field(body, "where"),
            detail: text_field(body, "detail"),
            line: text_field(body, "line"),
            code: text_field(body, "code"),
        }
    }

    /// `error | where=.. | detail=.. | line=.. | code=..`, present fields only.
    pub fn message(&self) -> String {
        let mut parts = vec![self.error.clone()];
        for (label, value) in [
            ("where", &self.where_),
            ("detail", &self.detail),
            ("line", &self.line),
            ("code", &self.code),
        ] {
            if let Some(value) = value {
                parts.push(format!("{label}={value}"));
            }
        }
        parts.join(" | ")
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

fn text_field(body: &Map<String, Value>, key: &str) -> Option<String> {
    let text = match body.get(key)? {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker protocol line exceeded maximum size ({max_bytes} bytes)")]
    LineTooLong { max_bytes: usize },
}

/// Read one line of at most `max_bytes` (excluding the line ending).
///
/// `Ok(None)` means end of stream. An over-long line is reported once; the
/// rest of it is returned by the next call and fails to parse as a response.
pub async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
    buf: &mut Vec<u8>,
) -> Result<Option<String>, ProtocolError> {
    buf.clear();
    // Room for `\r\n`.
    let limit = max_bytes.saturating_add(2);
    let read = (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }

    let had_newline = buf.last() == Some(&b'\n');
    if had_newline {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > max_bytes || (!had_newline && read == limit) {
        return Err(ProtocolError::LineTooLong { max_bytes });
    }

    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_is_a_single_line() {
        let line = encode_request(3, &json!({"action": "ping"})).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        let text = std::str::from_utf8(&line).unwrap();
        assert_eq!(text.matches('\n').count(), 1);
        let value: Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value, json!({"id": 3, "payload": {"action": "ping"}}));
    }

    #[test]
    fn parses_responses_and_drops_garbage() {
        let resp = parse_response_line(r#"{"id":4,"ok":true,"appendRow":12}"#).unwrap();
        assert_eq!(resp.id, 4);
        assert!(resp.ok);
        assert_eq!(resp.body.get("appendRow"), Some(&json!(12)));
        assert!(!resp.body.contains_key("id"));

        let resp = parse_response_line(r#" {"id":"5","ok":false} "#).unwrap();
        assert_eq!(resp.id, 5);
        assert!(!resp.ok);

        assert!(parse_response_line("").is_none());
        assert!(parse_response_line("worker ready").is_none());
        assert!(parse_response_line("[1,2]").is_none());
        assert!(parse_response_line(r#"{"ok":true}"#).is_none());
        assert!(parse_response_line(r#"{"id":-1,"ok":true}"#).is_none());
    }

    #[test]
    fn failure_message_lists_present_fields() {
        let body = json!({
            "error": "Speichern fehlgeschlagen",
            "where": "appendOrder",
            "line": 214,
            "code": "SAVE_FAILED",
            "detail": ""
        });
        let failure = RemoteFailure::from_body(body.as_object().unwrap());
        assert_eq!(
            failure.message(),
            "Speichern fehlgeschlagen | where=appendOrder | line=214 | code=SAVE_FAILED"
        );

        let failure = RemoteFailure::from_body(&Map::new());
        assert_eq!(failure.to_string(), "Worker error");
    }

    #[tokio::test]
    async fn bounded_reader_splits_lines_and_flags_overflow() {
        let input: &[u8] = b"{\"id\":1}\r\nabcdefghij\nlast";
        let mut reader = tokio::io::BufReader::new(input);
        let mut buf = Vec::new();

        let line = read_line_bounded(&mut reader, 8, &mut buf).await.unwrap();
        assert_eq!(line.as_deref(), Some("{\"id\":1}"));

        let err = read_line_bounded(&mut reader, 8, &mut buf).await.unwrap_err();
        assert!(matches!(err, ProtocolError::LineTooLong { max_bytes: 8 }));

        // Remainder of the long line.
        let line = read_line_bounded(&mut reader, 8, &mut buf).await.unwrap();
        assert_eq!(line.as_deref(), Some(""));

        let line = read_line_bounded(&mut reader, 8, &mut buf).await.unwrap();
        assert_eq!(line.as_deref(), Some("last"));
        assert!(read_line_bounded(&mut reader, 8, &mut buf).await.unwrap().is_none());
    }
}
