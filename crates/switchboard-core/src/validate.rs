// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Upstream response validation.
//!
//! Classifies every upstream response into network / business / format /
//! client-validation per the propagation policy, checks mandatory fields
//! per dialect, and validates SSE stream completeness.

use serde_json::Value;

use switchboard_wire::{sse, Dialect};

use crate::error::ProxyError;

/// Keyword combinations that mark an upstream as rejecting non-official
/// clients.  All words of one group must appear (case-insensitive).
const CLIENT_REJECT_GROUPS: &[&[&str]] = &[&["unauthorized", "client"], &["only", "cli"]];

fn is_client_rejection(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    CLIENT_REJECT_GROUPS.iter().any(|group| group.iter().all(|w| lower.contains(w)))
}

/// Correct an obviously wrong Content-Type header by sniffing the body.
/// Returns the overridden value for logging, `None` when the header fits.
pub fn sniff_content_type(header: &str, body: &str) -> Option<&'static str> {
    let trimmed = body.trim_start();
    let looks_json = trimmed.starts_with('{') || trimmed.starts_with('[');
    let looks_sse = trimmed.starts_with("data:") || trimmed.starts_with("event:");
    if header.contains("text/event-stream") && looks_json && !looks_sse {
        return Some("application/json");
    }
    if header.contains("application/json") && looks_sse {
        return Some("text/event-stream");
    }
    None
}

/// Required-field check for a complete (non-streaming) body.
fn validate_shape(dialect: Dialect, v: &Value) -> Result<(), ProxyError> {
    let missing = |what: &str| {
        Err(ProxyError::Format(format!("{} response missing {what}", dialect.as_str())))
    };
    match dialect {
        Dialect::Anthropic => {
            for field in ["id", "type", "content", "model"] {
                if v.get(field).is_none() {
                    return missing(field);
                }
            }
            if v["type"].as_str() != Some("message") {
                return Err(ProxyError::Format("anthropic response type is not \"message\"".into()));
            }
            Ok(())
        }
        Dialect::OpenaiChat => {
            if v.get("model").is_none() {
                return missing("model");
            }
            if !v["choices"].is_array() {
                return missing("choices");
            }
            Ok(())
        }
        Dialect::OpenaiResponses => {
            if v.get("output").is_none() {
                return missing("output");
            }
            Ok(())
        }
        Dialect::Gemini => {
            if !v["candidates"].is_array() {
                return missing("candidates");
            }
            Ok(())
        }
        Dialect::Unknown => Ok(()),
    }
}

/// Classify a complete upstream response.
///
/// Returns the parsed body when the response is usable, or the error that
/// decides retry and health consequences.
pub fn classify_http(
    dialect: Dialect,
    status: u16,
    body: &str,
) -> Result<Value, ProxyError> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();

    let Some(v) = parsed else {
        // HTML error pages from CDNs or gateways: a 403 page plus a JSON
        // parse failure is the canonical "official clients only" pattern.
        if body.trim_start().to_ascii_lowercase().starts_with("<html")
            || body.contains("<html")
            || is_client_rejection(body)
        {
            return Err(ProxyError::ClientValidation(format!(
                "upstream rejected the client with status {status}"
            )));
        }
        if status >= 500 {
            return Err(ProxyError::Network(format!("upstream {status} with unparseable body")));
        }
        return Err(ProxyError::Format(format!("unparseable upstream body (status {status})")));
    };

    if is_client_rejection(body) {
        return Err(ProxyError::ClientValidation(format!(
            "upstream rejected the client with status {status}"
        )));
    }

    if v.get("error").is_some_and(|e| !e.is_null()) {
        return Err(ProxyError::Business { status, body: v });
    }
    if status >= 400 {
        return Err(ProxyError::Business { status, body: v });
    }

    validate_shape(dialect, &v)?;
    Ok(v)
}

/// Stateful SSE completeness validator, fed every upstream `data:` payload
/// as the stream is copied.
pub struct SseValidator {
    strict: bool,
    saw_data_json: bool,
    saw_semantic_terminator: bool,
    saw_done: bool,
    malformed: Option<String>,
}

impl SseValidator {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            saw_data_json: false,
            saw_semantic_terminator: false,
            saw_done: false,
            malformed: None,
        }
    }

    /// Feed one raw upstream chunk; lines are split internally by the
    /// caller's framing, so this accepts whole frames too.
    pub fn observe_text(&mut self, text: &str) {
        for line in text.lines() {
            if let Some(payload) = sse::data_payload(line) {
                self.observe_payload(payload);
            }
        }
    }

    pub fn observe_payload(&mut self, payload: &str) {
        if payload == "[DONE]" {
            self.saw_done = true;
            return;
        }
        let Ok(v) = serde_json::from_str::<Value>(payload) else { return };
        self.saw_data_json = true;

        match v["type"].as_str().unwrap_or("") {
            "message_stop" => self.saw_semantic_terminator = true,
            "response.completed" | "response.incomplete" => self.saw_semantic_terminator = true,
            "message_start" => {
                // An all-zero usage triad in message_start marks a broken
                // converter upstream.
                if let Some(usage) = v["message"].get("usage") {
                    let zeros = ["prompt_tokens", "completion_tokens", "total_tokens"]
                        .iter()
                        .all(|k| usage.get(*k).is_some_and(|t| t.as_u64() == Some(0)));
                    if zeros {
                        self.malformed =
                            Some("message_start carries an all-zero usage triad".into());
                    }
                }
            }
            _ => {}
        }
        if v["choices"][0]["finish_reason"].as_str().is_some() {
            self.saw_semantic_terminator = true;
        }
        if v["candidates"][0]["finishReason"].as_str().is_some() {
            self.saw_semantic_terminator = true;
        }
    }

    /// Final verdict once the upstream stream ended.
    pub fn finish(&self) -> Result<(), ProxyError> {
        if let Some(reason) = &self.malformed {
            return Err(ProxyError::Format(reason.clone()));
        }
        if !self.saw_data_json {
            return Err(ProxyError::Format("stream carried no data events".into()));
        }
        if self.saw_semantic_terminator {
            return Ok(());
        }
        if self.saw_done && !self.strict {
            return Ok(());
        }
        if self.saw_done {
            return Err(ProxyError::Format(
                "stream ended with only [DONE], no semantic terminator".into(),
            ));
        }
        Err(ProxyError::Format("stream ended without a terminator".into()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn valid_anthropic_body_passes() {
        let body = json!({
            "id": "msg_1", "type": "message", "model": "claude-3-5-sonnet",
            "content": [{ "type": "text", "text": "hi" }],
        })
        .to_string();
        assert!(classify_http(Dialect::Anthropic, 200, &body).is_ok());
    }

    #[test]
    fn missing_field_is_format_error() {
        let body = json!({ "id": "m", "type": "message", "model": "x" }).to_string();
        let err = classify_http(Dialect::Anthropic, 200, &body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn wrong_type_tag_is_format_error() {
        let body = json!({
            "id": "m", "type": "completion", "model": "x", "content": [],
        })
        .to_string();
        assert_eq!(
            classify_http(Dialect::Anthropic, 200, &body).unwrap_err().kind(),
            ErrorKind::Format
        );
    }

    #[test]
    fn structured_error_is_business() {
        let body = json!({ "error": { "type": "overloaded_error", "message": "busy" } }).to_string();
        let err = classify_http(Dialect::Anthropic, 529, &body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Business);
        assert!(err.preview().contains("overloaded_error"));
    }

    #[test]
    fn html_403_is_client_validation() {
        let body = "<html><body>Forbidden</body></html>";
        let err = classify_http(Dialect::OpenaiChat, 403, body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientValidation);
    }

    #[test]
    fn keyword_combo_is_client_validation() {
        let body = json!({ "message": "Unauthorized client detected" }).to_string();
        let err = classify_http(Dialect::OpenaiChat, 403, &body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientValidation);
        let body = json!({ "message": "this API is for the official CLI only" }).to_string();
        let err = classify_http(Dialect::OpenaiChat, 403, &body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientValidation);
    }

    #[test]
    fn unparseable_5xx_is_network() {
        let err = classify_http(Dialect::OpenaiChat, 503, "Service Unavailable").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.preview().contains("503"), "{}", err.preview());
    }

    #[test]
    fn openai_chat_requires_model_and_choices() {
        let ok = json!({ "model": "gpt-5", "choices": [] }).to_string();
        assert!(classify_http(Dialect::OpenaiChat, 200, &ok).is_ok());
        let missing = json!({ "model": "gpt-5" }).to_string();
        assert_eq!(
            classify_http(Dialect::OpenaiChat, 200, &missing).unwrap_err().kind(),
            ErrorKind::Format
        );
    }

    #[test]
    fn responses_requires_output() {
        let ok = json!({ "output": [] }).to_string();
        assert!(classify_http(Dialect::OpenaiResponses, 200, &ok).is_ok());
        assert_eq!(
            classify_http(Dialect::OpenaiResponses, 200, "{}").unwrap_err().kind(),
            ErrorKind::Format
        );
    }

    // ── Content-type sniffing ─────────────────────────────────────────────────

    #[test]
    fn json_sent_as_event_stream_is_corrected() {
        assert_eq!(
            sniff_content_type("text/event-stream", "{\"model\":\"x\"}"),
            Some("application/json")
        );
    }

    #[test]
    fn sse_sent_as_json_is_corrected() {
        assert_eq!(
            sniff_content_type("application/json", "data: {\"a\":1}\n\n"),
            Some("text/event-stream")
        );
    }

    #[test]
    fn matching_content_type_is_untouched() {
        assert_eq!(sniff_content_type("application/json", "{}"), None);
        assert_eq!(sniff_content_type("text/event-stream", "data: {}\n\n"), None);
    }

    // ── SSE completeness ──────────────────────────────────────────────────────

    #[test]
    fn anthropic_stream_with_message_stop_is_complete() {
        let mut v = SseValidator::new(false);
        v.observe_text("data: {\"type\":\"content_block_delta\"}\n");
        v.observe_text("data: {\"type\":\"message_stop\"}\n");
        assert!(v.finish().is_ok());
    }

    #[test]
    fn openai_stream_with_finish_reason_is_complete() {
        let mut v = SseValidator::new(false);
        v.observe_text("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n");
        assert!(v.finish().is_ok());
    }

    #[test]
    fn bare_done_is_accepted_by_default_but_rejected_in_strict_mode() {
        let mut loose = SseValidator::new(false);
        loose.observe_text("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n");
        loose.observe_text("data: [DONE]\n");
        assert!(loose.finish().is_ok());

        let mut strict = SseValidator::new(true);
        strict.observe_text("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n");
        strict.observe_text("data: [DONE]\n");
        assert!(strict.finish().is_err());
    }

    #[test]
    fn stream_without_data_lines_is_rejected() {
        let v = SseValidator::new(false);
        assert!(v.finish().is_err());
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let mut v = SseValidator::new(false);
        v.observe_text("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n");
        assert!(v.finish().is_err());
    }

    #[test]
    fn zero_usage_triad_is_malformed() {
        let mut v = SseValidator::new(false);
        v.observe_text(
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"prompt_tokens\":0,\"completion_tokens\":0,\"total_tokens\":0}}}\n",
        );
        v.observe_text("data: {\"type\":\"message_stop\"}\n");
        let err = v.finish().unwrap_err();
        assert!(err.to_string().contains("usage"), "{err}");
    }

    #[test]
    fn anthropic_usage_shape_is_not_the_malformed_triad() {
        // Real anthropic usage uses input_tokens/output_tokens; only the
        // OpenAI-style triad of zeros marks a broken converter.
        let mut v = SseValidator::new(false);
        v.observe_text(
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":0,\"output_tokens\":0}}}\n",
        );
        v.observe_text("data: {\"type\":\"message_stop\"}\n");
        assert!(v.finish().is_ok());
    }
}
