// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Error taxonomy.
//!
//! Errors are values with a kind tag; classification never flows through
//! panics.  The kind decides endpoint-health consequences (§ propagation
//! policy) and which wire shape the client sees.

use serde_json::{json, Value};

use switchboard_wire::Dialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect / TLS / timeout / EOF before completion.
    Network,
    /// Upstream returned a structured error body.  Endpoint stays healthy.
    Business,
    /// Well-formed but missing mandatory fields.
    Format,
    /// Upstream rejects non-official clients.  Endpoint stays healthy.
    ClientValidation,
    Config,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream error {status}")]
    Business { status: u16, body: Value },
    #[error("format error: {0}")]
    Format(String),
    #[error("client validation: {0}")]
    ClientValidation(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Network(_) => ErrorKind::Network,
            ProxyError::Business { .. } => ErrorKind::Business,
            ProxyError::Format(_) => ErrorKind::Format,
            ProxyError::ClientValidation(_) => ErrorKind::ClientValidation,
            ProxyError::Config(_) => ErrorKind::Config,
            ProxyError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this outcome counts as a failure in the endpoint's ring
    /// buffer.  Business and client-validation errors do not: the endpoint
    /// answered, the request was the problem.
    pub fn counts_against_endpoint(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Format)
    }

    /// HTTP status for the client-facing error response.
    pub fn client_status(&self) -> u16 {
        match self {
            ProxyError::Business { status, .. } => *status,
            ProxyError::ClientValidation(_) => 403,
            ProxyError::Network(_) => 502,
            ProxyError::Format(_) => 502,
            ProxyError::Config(_) => 500,
            ProxyError::Internal(_) => 500,
        }
    }

    /// Text the retry rules substring-match against: the error message
    /// plus a preview of any upstream body.
    pub fn preview(&self) -> String {
        match self {
            ProxyError::Business { status, body } => {
                let text = body.to_string();
                let text = &text[..text.len().min(512)];
                format!("{status} {text}")
            }
            other => other.to_string(),
        }
    }
}

fn kind_str(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Network => "api_error",
        ErrorKind::Business => "invalid_request_error",
        ErrorKind::Format => "api_error",
        ErrorKind::ClientValidation => "permission_error",
        ErrorKind::Config => "api_error",
        ErrorKind::Internal => "api_error",
    }
}

/// Wrap an error message into the shape the client's dialect expects.
pub fn error_body(dialect: Dialect, status: u16, kind: ErrorKind, message: &str) -> Value {
    match dialect {
        Dialect::Anthropic => json!({
            "type": "error",
            "error": { "type": kind_str(kind), "message": message },
        }),
        Dialect::Gemini => json!({
            "error": {
                "code": status,
                "message": message,
                "status": if status >= 500 { "UNAVAILABLE" } else { "INVALID_ARGUMENT" },
            },
        }),
        // OpenAI shape doubles as the fallback for unknown dialects.
        _ => json!({
            "error": { "message": message, "type": kind_str(kind), "code": status },
        }),
    }
}

/// A mid-stream failure rendered as an SSE event in the client's dialect.
pub fn error_frame(dialect: Dialect, message: &str) -> String {
    let payload = match dialect {
        Dialect::Anthropic => json!({
            "type": "error",
            "error": { "type": "api_error", "message": message },
        }),
        Dialect::Gemini => json!({
            "error": { "code": 502, "message": message, "status": "UNAVAILABLE" },
        }),
        _ => json!({
            "error": { "message": message, "type": "api_error", "code": 502 },
        }),
    };
    if dialect == Dialect::Anthropic {
        format!("event: error\ndata: {payload}\n\n")
    } else {
        format!("data: {payload}\n\n")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_and_count_correctly() {
        assert!(ProxyError::Network("t".into()).counts_against_endpoint());
        assert!(ProxyError::Format("t".into()).counts_against_endpoint());
        assert!(!ProxyError::Business { status: 400, body: json!({}) }.counts_against_endpoint());
        assert!(!ProxyError::ClientValidation("t".into()).counts_against_endpoint());
        assert!(!ProxyError::Internal("t".into()).counts_against_endpoint());
    }

    #[test]
    fn business_preview_carries_status_and_body() {
        let e = ProxyError::Business { status: 503, body: json!({"error": "overloaded"}) };
        let p = e.preview();
        assert!(p.contains("503"), "{p}");
        assert!(p.contains("overloaded"), "{p}");
    }

    #[test]
    fn anthropic_error_shape() {
        let body = error_body(Dialect::Anthropic, 500, ErrorKind::Internal, "boom");
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "api_error");
        assert_eq!(body["error"]["message"], "boom");
    }

    #[test]
    fn openai_error_shape() {
        let body = error_body(Dialect::OpenaiChat, 502, ErrorKind::Network, "down");
        assert_eq!(body["error"]["code"], 502);
        assert_eq!(body["error"]["message"], "down");
    }

    #[test]
    fn gemini_error_shape() {
        let body = error_body(Dialect::Gemini, 503, ErrorKind::Network, "down");
        assert_eq!(body["error"]["code"], 503);
        assert_eq!(body["error"]["status"], "UNAVAILABLE");
    }

    #[test]
    fn anthropic_stream_error_uses_named_event() {
        let frame = error_frame(Dialect::Anthropic, "lost upstream");
        assert!(frame.starts_with("event: error\n"), "{frame}");
        assert!(frame.ends_with("\n\n"));
    }
}
