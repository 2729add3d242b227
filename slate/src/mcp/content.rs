//! MCP `tools/call` response content handling.
//!
//! A response's `content` items are flattened to one text blob plus an
//! attachment list. Image items are decoded from base64 and written to the
//! uploads directory under synthesized names; the text blob gets
//! human-readable markers so agents can reference the files later. Before a
//! response is stored in history it is sanitized: base64 payloads dropped,
//! image items reduced to `mimeType` + `saved_path`, oversized strings
//! truncated.

use std::path::Path;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under which the server's stderr preview rides along on a response.
pub const STDERR_KEY: &str = "_slate_stderr";

/// Default truncation cap for sanitized strings.
pub const DEFAULT_MAX_TEXT_CHARS: usize = 20_000;

/// Configured truncation cap: `SLATE_MCP_MAX_TEXT_CHARS` or the default.
pub fn content_max_chars() -> usize {
    std::env::var("SLATE_MCP_MAX_TEXT_CHARS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_TEXT_CHARS)
}

/// An image (or other file) a tool call produced, persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub original_filename: String,
    pub content_type: String,
    pub size_bytes: usize,
    pub source: String,
}

/// Flattened view of one `tools/call` response.
#[derive(Debug, Clone)]
pub struct CallContent {
    pub text: String,
    pub is_error: bool,
    pub attachments: Vec<Attachment>,
}

fn ext_from_mime(mime: &str) -> &'static str {
    match mime.trim().to_lowercase().as_str() {
        "image/png" => ".png",
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        _ => ".bin",
    }
}

fn item_mime(item: &Map<String, Value>) -> String {
    item.get("mimeType")
        .or_else(|| item.get("mime_type"))
        .or_else(|| item.get("mime"))
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream")
        .to_string()
}

fn persist_images(response: &Value, uploads_dir: &Path) -> Vec<Attachment> {
    let Some(items) = response
        .get("result")
        .and_then(|r| r.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut attachments = Vec::new();
    for item in items {
        let Some(obj) = item.as_object() else { continue };
        if obj.get("type").and_then(Value::as_str) != Some("image") {
            continue;
        }
        let Some(data_b64) = obj.get("data").and_then(Value::as_str) else {
            continue;
        };
        let raw = match base64::engine::general_purpose::STANDARD.decode(data_b64.trim()) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode MCP image base64");
                continue;
            }
        };
        let mime = item_mime(obj);
        let filename = format!("mcp_{}{}", uuid::Uuid::new_v4().simple(), ext_from_mime(&mime));
        let path = uploads_dir.join(&filename);
        if let Err(e) = std::fs::create_dir_all(uploads_dir) {
            tracing::warn!(error = %e, "failed to create uploads directory");
            continue;
        }
        if let Err(e) = std::fs::write(&path, &raw) {
            tracing::warn!(error = %e, path = %path.display(), "failed to write MCP image");
            continue;
        }
        attachments.push(Attachment {
            kind: "image".into(),
            path: path.to_string_lossy().into_owned(),
            original_filename: filename,
            content_type: mime,
            size_bytes: raw.len(),
            source: "mcp".into(),
        });
    }
    attachments
}

/// Converts a `tools/call` response into `(text, is_error, attachments)`,
/// persisting image items into `uploads_dir`.
pub fn format_call_response(response: &Value, uploads_dir: &Path) -> CallContent {
    let Some(result) = response.get("result").and_then(Value::as_object) else {
        // Protocol-level error shape: bubble it up as error text.
        let text = response
            .get("error")
            .map(|e| e.to_string())
            .unwrap_or_else(|| response.to_string());
        return CallContent {
            text,
            is_error: true,
            attachments: Vec::new(),
        };
    };

    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut parts: Vec<String> = Vec::new();
    if let Some(items) = result.get("content").and_then(Value::as_array) {
        for item in items {
            let Some(obj) = item.as_object() else { continue };
            match obj.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = obj.get("text").and_then(Value::as_str) {
                        if !text.trim().is_empty() {
                            parts.push(text.trim().to_string());
                        }
                    }
                }
                Some("image") => parts.push("[image]".into()),
                Some(other) => parts.push(format!("[{other}]")),
                None => {}
            }
        }
    }

    let attachments = persist_images(response, uploads_dir);
    for attachment in &attachments {
        parts.push(format!("[image attached: {}]", attachment.original_filename));
        parts.push(format!("[mcp_image_path: {}]", attachment.path));
    }

    let mut text = parts.join("\n\n").trim().to_string();
    if text.is_empty() {
        if let Some(structured) = result.get("structuredContent") {
            text = structured.to_string();
        }
    }

    if is_error {
        if let Some(stderr) = response.get(STDERR_KEY).and_then(Value::as_str) {
            if !stderr.trim().is_empty() {
                text = format!("{}\n\n[server stderr]\n{}", text, stderr.trim())
                    .trim()
                    .to_string();
            }
        }
    }

    CallContent {
        text,
        is_error,
        attachments,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...[truncated]");
    out
}

/// Sanitizes a `tools/call` response for history storage: no base64 image
/// bytes, image items reduced to `mimeType` + `saved_path`, strings capped at
/// `max_chars`.
pub fn sanitize_call_response(
    response: &Value,
    attachments: &[Attachment],
    max_chars: usize,
) -> Value {
    let mut out = Map::new();
    let Some(obj) = response.as_object() else {
        return response.clone();
    };

    for key in ["jsonrpc", "id", STDERR_KEY] {
        if let Some(v) = obj.get(key) {
            out.insert(key.to_string(), v.clone());
        }
    }

    if let Some(error) = obj.get("error").and_then(Value::as_object) {
        let mut err = error.clone();
        if let Some(message) = err.get("message").and_then(Value::as_str) {
            let truncated = truncate(message, max_chars);
            err.insert("message".into(), Value::String(truncated));
        }
        out.insert("error".into(), Value::Object(err));
    }

    let Some(result) = obj.get("result").and_then(Value::as_object) else {
        return Value::Object(out);
    };

    let mut sanitized_result = Map::new();
    if let Some(is_error) = result.get("isError") {
        sanitized_result.insert(
            "isError".into(),
            Value::Bool(is_error.as_bool().unwrap_or(false)),
        );
    }

    let mut sanitized_content: Vec<Value> = Vec::new();
    if let Some(items) = result.get("content").and_then(Value::as_array) {
        let mut image_index = 0usize;
        for item in items {
            let Some(obj) = item.as_object() else { continue };
            match obj.get("type").and_then(Value::as_str) {
                Some("image") => {
                    let mut entry = Map::new();
                    entry.insert("type".into(), Value::String("image".into()));
                    let mime = item_mime(obj);
                    if !mime.is_empty() {
                        entry.insert("mimeType".into(), Value::String(mime));
                    }
                    if let Some(attachment) = attachments.get(image_index) {
                        entry.insert(
                            "saved_path".into(),
                            Value::String(attachment.path.clone()),
                        );
                    }
                    image_index += 1;
                    sanitized_content.push(Value::Object(entry));
                }
                Some("text") => {
                    let text = obj.get("text").and_then(Value::as_str).unwrap_or_default();
                    sanitized_content.push(serde_json::json!({
                        "type": "text",
                        "text": truncate(text, max_chars),
                    }));
                }
                other_type => {
                    let mut entry = Map::new();
                    if let Some(t) = other_type {
                        entry.insert("type".into(), Value::String(t.to_string()));
                    }
                    for (key, value) in obj {
                        if key == "type" || key == "data" {
                            continue;
                        }
                        match value.as_str() {
                            Some(s) => {
                                entry.insert(key.clone(), Value::String(truncate(s, max_chars)))
                            }
                            None => entry.insert(key.clone(), value.clone()),
                        };
                    }
                    sanitized_content.push(Value::Object(entry));
                }
            }
        }
    }
    if !sanitized_content.is_empty() {
        sanitized_result.insert("content".into(), Value::Array(sanitized_content));
    }

    // Keep structuredContent only when already small.
    if let Some(structured) = result.get("structuredContent") {
        if structured.to_string().chars().count() <= max_chars {
            sanitized_result.insert("structuredContent".into(), structured.clone());
        }
    }

    out.insert("result".into(), Value::Object(sanitized_result));
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // 1x1 transparent PNG.
    const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    fn image_response() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {
                "isError": false,
                "content": [
                    {"type": "text", "text": "screenshot taken"},
                    {"type": "image", "data": PNG_B64, "mimeType": "image/png"}
                ]
            }
        })
    }

    /// **Scenario**: images land on disk and the text blob carries markers.
    #[test]
    fn images_are_persisted_with_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let content = format_call_response(&image_response(), tmp.path());
        assert!(!content.is_error);
        assert_eq!(content.attachments.len(), 1);
        let attachment = &content.attachments[0];
        assert!(attachment.original_filename.starts_with("mcp_"));
        assert!(attachment.original_filename.ends_with(".png"));
        assert!(std::path::Path::new(&attachment.path).exists());
        assert!(content.text.contains("screenshot taken"));
        assert!(content
            .text
            .contains(&format!("[image attached: {}]", attachment.original_filename)));
        assert!(content.text.contains("[mcp_image_path: "));
    }

    /// **Scenario**: sanitized responses keep no base64 and no oversized
    /// strings.
    #[test]
    fn sanitize_drops_base64_and_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        let mut response = image_response();
        let long_text = "x".repeat(50);
        response["result"]["content"][0]["text"] = json!(long_text);
        let content = format_call_response(&response, tmp.path());

        let sanitized = sanitize_call_response(&response, &content.attachments, 10);
        let items = sanitized["result"]["content"].as_array().unwrap();
        let text_item = &items[0];
        assert_eq!(text_item["text"], json!("xxxxxxxxxx...[truncated]"));
        let image_item = &items[1];
        assert!(image_item.get("data").is_none());
        assert_eq!(image_item["mimeType"], json!("image/png"));
        assert_eq!(
            image_item["saved_path"],
            json!(content.attachments[0].path)
        );
    }

    #[test]
    fn protocol_error_shape_becomes_error_text() {
        let tmp = tempfile::tempdir().unwrap();
        let response = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "bad"}});
        let content = format_call_response(&response, tmp.path());
        assert!(content.is_error);
        assert!(content.text.contains("bad"));
    }

    #[test]
    fn error_text_includes_stderr_preview() {
        let tmp = tempfile::tempdir().unwrap();
        let response = json!({
            "jsonrpc": "2.0",
            "id": 1,
            STDERR_KEY: "browser exploded",
            "result": {"isError": true, "content": [{"type": "text", "text": "launch failed"}]}
        });
        let content = format_call_response(&response, tmp.path());
        assert!(content.is_error);
        assert!(content.text.contains("[server stderr]"));
        assert!(content.text.contains("browser exploded"));
    }

    #[test]
    fn structured_content_fallback_when_no_text() {
        let tmp = tempfile::tempdir().unwrap();
        let response = json!({
            "jsonrpc": "2.0", "id": 1,
            "result": {"content": [], "structuredContent": {"answer": 42}}
        });
        let content = format_call_response(&response, tmp.path());
        assert!(content.text.contains("42"));
    }

    #[test]
    fn sanitize_preserves_error_shape() {
        let response = json!({"jsonrpc": "2.0", "id": 7, "error": {"code": 1, "message": "m"}});
        let sanitized = sanitize_call_response(&response, &[], 100);
        assert_eq!(sanitized["error"]["message"], json!("m"));
        assert_eq!(sanitized["id"], json!(7));
    }

    #[test]
    fn oversized_structured_content_is_dropped() {
        let response = json!({
            "jsonrpc": "2.0", "id": 1,
            "result": {"structuredContent": {"blob": "y".repeat(100)}}
        });
        let sanitized = sanitize_call_response(&response, &[], 20);
        assert!(sanitized["result"].get("structuredContent").is_none());
    }
}
