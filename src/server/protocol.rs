//! Wire framing for the RPC channel.
//!
//! Every frame is one JSON object: `{id, method, params}` requests,
//! `{id, result}` / `{id, error}` responses, and id-less notifications.
//! Results whose serialized body exceeds [`COMPRESSION_THRESHOLD`] bytes
//! are wrapped as `{compressed: true, data: <base64 gzip>}`; clients
//! detect and inflate transparently.

use std::io::Write;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};

use crate::error::AgentError;

/// Serialized-result size above which responses are gzip-wrapped.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// A parsed incoming frame carrying a method. `id` is `None` for
/// notifications.
#[derive(Debug)]
pub struct RpcRequest {
    pub id: Option<Value>,
    pub method: String,
    pub params: Value,
}

/// Parse one incoming text frame.
///
/// Returns `Ok(None)` for frames without a `method` — those are responses
/// to server-initiated requests and are not dispatched.
pub fn parse_frame(text: &str) -> Result<Option<RpcRequest>, AgentError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| AgentError::MalformedRequest(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| AgentError::MalformedRequest("frame is not an object".to_string()))?;

    let method = match obj.get("method") {
        None => return Ok(None),
        Some(Value::String(m)) => m.clone(),
        Some(_) => {
            return Err(AgentError::MalformedRequest(
                "`method` must be a string".to_string(),
            ))
        }
    };

    Ok(Some(RpcRequest {
        id: obj.get("id").cloned(),
        method,
        params: obj.get("params").cloned().unwrap_or(Value::Null),
    }))
}

/// Gzip + base64 a serialized result body.
fn compress_body(serialized: &str) -> std::io::Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(serialized.as_bytes())?;
    Ok(BASE64.encode(encoder.finish()?))
}

/// Apply the size-threshold compression rule to a result value.
pub fn maybe_compress(result: Value) -> Value {
    let serialized = result.to_string();
    if serialized.len() <= COMPRESSION_THRESHOLD {
        return result;
    }
    match compress_body(&serialized) {
        Ok(data) => json!({ "compressed": true, "data": data }),
        // Compression failing is no reason to drop the response.
        Err(_) => result,
    }
}

/// A `{id, result}` response frame, compression rule applied.
pub fn response_frame(id: &Value, result: Value) -> String {
    json!({ "id": id, "result": maybe_compress(result) }).to_string()
}

/// A `{id, error: {code, message, data?}}` response frame.
pub fn error_frame(id: Option<&Value>, error: &AgentError) -> String {
    let mut body = json!({
        "code": error.code(),
        "message": error.to_string(),
    });
    if let Some(data) = error.data() {
        body["data"] = data;
    }
    json!({ "id": id.cloned().unwrap_or(Value::Null), "error": body }).to_string()
}

/// An id-less `{method, params}` notification frame.
pub fn notification_frame(method: &str, params: Value) -> String {
    json!({ "method": method, "params": params }).to_string()
}

// ============================================================================
// Parameter extraction
// ============================================================================

pub fn require_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, AgentError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::InvalidParams(format!("missing string parameter `{name}`")))
}

pub fn opt_str<'a>(params: &'a Value, name: &str) -> Option<&'a str> {
    params.get(name).and_then(Value::as_str)
}

pub fn require_f64(params: &Value, name: &str) -> Result<f64, AgentError> {
    params
        .get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| AgentError::InvalidParams(format!("missing numeric parameter `{name}`")))
}

pub fn opt_f64(params: &Value, name: &str) -> Option<f64> {
    params.get(name).and_then(Value::as_f64)
}

pub fn require_u64(params: &Value, name: &str) -> Result<u64, AgentError> {
    params
        .get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| AgentError::InvalidParams(format!("missing integer parameter `{name}`")))
}

pub fn opt_u64(params: &Value, name: &str) -> Option<u64> {
    params.get(name).and_then(Value::as_u64)
}

// ============================================================================
// Test-side inflation
// ============================================================================

/// Inflate a `{compressed: true, data}` wrapper back to its JSON value.
#[cfg(test)]
pub(crate) fn decompress(wrapper: &Value) -> Value {
    use flate2::read::GzDecoder;
    use std::io::Read;

    assert_eq!(wrapper["compressed"], true, "wrapper is not compressed");
    let bytes = BASE64
        .decode(wrapper["data"].as_str().expect("data field"))
        .expect("valid base64");
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut out = String::new();
    decoder.read_to_string(&mut out).expect("valid gzip");
    serde_json::from_str(&out).expect("valid JSON")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_notification_and_response() {
        let req = parse_frame(r#"{"id": 1, "method": "ping", "params": {}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(req.id, Some(json!(1)));
        assert_eq!(req.method, "ping");

        let notif = parse_frame(r#"{"method": "hello"}"#).unwrap().unwrap();
        assert!(notif.id.is_none());

        // A response to a server-initiated request is not dispatched.
        assert!(parse_frame(r#"{"id": 3, "result": "ok"}"#).unwrap().is_none());
    }

    #[test]
    fn malformed_frames_error() {
        assert!(matches!(
            parse_frame("not json"),
            Err(AgentError::MalformedRequest(_))
        ));
        assert!(matches!(
            parse_frame("[1, 2]"),
            Err(AgentError::MalformedRequest(_))
        ));
        assert!(matches!(
            parse_frame(r#"{"method": 5}"#),
            Err(AgentError::MalformedRequest(_))
        ));
    }

    #[test]
    fn small_results_stay_uncompressed() {
        let result = json!({ "status": "ok" });
        assert_eq!(maybe_compress(result.clone()), result);
    }

    #[test]
    fn compression_threshold_is_exact() {
        // 1024 serialized bytes: `{"pad":"…"}` wraps the padding in 10
        // bytes of scaffolding.
        let body_of = |n: usize| json!({ "pad": "x".repeat(n) });
        let exactly = body_of(COMPRESSION_THRESHOLD - 10);
        assert_eq!(exactly.to_string().len(), COMPRESSION_THRESHOLD);
        assert_eq!(maybe_compress(exactly.clone()), exactly);

        let over = body_of(COMPRESSION_THRESHOLD - 9);
        let wrapped = maybe_compress(over.clone());
        assert_eq!(wrapped["compressed"], true);
        assert_eq!(decompress(&wrapped), over);
    }

    #[test]
    fn large_payload_round_trips() {
        let big = json!({
            "elements": (0..100)
                .map(|i| json!({ "id": format!("e{i}"), "label": format!("Item number {i}") }))
                .collect::<Vec<_>>()
        });
        let wrapped = maybe_compress(big.clone());
        assert_eq!(wrapped["compressed"], true);
        assert_eq!(decompress(&wrapped), big);
    }

    #[test]
    fn error_frame_shape() {
        let err = AgentError::ElementNotFound("Button[text=Nope]".into());
        let frame: Value = serde_json::from_str(&error_frame(Some(&json!(7)), &err)).unwrap();
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["error"]["code"], 100);
        assert_eq!(frame["error"]["data"]["selector"], "Button[text=Nope]");

        let frame: Value =
            serde_json::from_str(&error_frame(None, &AgentError::MalformedRequest("x".into())))
                .unwrap();
        assert_eq!(frame["id"], Value::Null);
        assert_eq!(frame["error"]["code"], -32600);
    }

    #[test]
    fn notification_frame_has_no_id() {
        let frame: Value =
            serde_json::from_str(&notification_frame("recording.event", json!({ "x": 1 })))
                .unwrap();
        assert!(frame.get("id").is_none());
        assert_eq!(frame["method"], "recording.event");
        assert_eq!(frame["params"]["x"], 1);
    }
}
