// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire-format handling: dialect detection, request conversion, streaming
//! response translation, and model rewriting.
//!
//! Four dialects are understood — Anthropic Messages, OpenAI Chat
//! Completions, OpenAI Responses, and Gemini GenerateContent.  Streaming
//! translation goes through a neutral event model: each upstream SSE chunk
//! is parsed into [`StreamEvent`]s, and a per-dialect renderer turns those
//! back into the client's framing.  That gives every directed pair without
//! a quadratic number of hand-written state machines.

pub mod adapter;
pub mod anthropic;
pub mod convert;
pub mod detect;
pub mod gemini;
pub mod openai;
pub mod responses;
pub mod rewrite;
pub mod sse;
pub mod stream;

use serde::{Deserialize, Serialize};

/// One of the four understood wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Anthropic,
    OpenaiChat,
    OpenaiResponses,
    Gemini,
    Unknown,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Anthropic => "anthropic",
            Dialect::OpenaiChat => "openai_chat",
            Dialect::OpenaiResponses => "openai_responses",
            Dialect::Gemini => "gemini",
            Dialect::Unknown => "unknown",
        }
    }
}

/// The classified caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    ClaudeCode,
    Codex,
    Gemini,
    Unknown,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::ClaudeCode => "claude_code",
            ClientKind::Codex => "codex",
            ClientKind::Gemini => "gemini",
            ClientKind::Unknown => "unknown",
        }
    }

    /// Matches an endpoint `client_type` restriction; the empty string is
    /// the universal bucket.
    pub fn matches_restriction(&self, restriction: &str) -> bool {
        restriction.is_empty() || restriction == self.as_str()
    }
}

/// Outcome of request classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionResult {
    pub format: Dialect,
    pub client: ClientKind,
    pub confidence: f64,
    pub detected_by: &'static str,
}

impl DetectionResult {
    pub fn unknown() -> Self {
        Self {
            format: Dialect::Unknown,
            client: ClientKind::Unknown,
            confidence: 0.0,
            detected_by: "none",
        }
    }
}

/// Why the model stopped, in neutral terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
}

impl FinishReason {
    pub fn openai_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
        }
    }

    pub fn anthropic_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "end_turn",
            FinishReason::Length => "max_tokens",
            FinishReason::ToolCalls => "tool_use",
        }
    }
}

/// A single streamed event in the neutral model.
///
/// Parsers may emit `Start` more than once (chat chunks repeat id/model on
/// every frame); renderers act on the first and ignore the rest.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start { id: String, model: String },
    TextDelta(String),
    ThinkingDelta(String),
    ToolCallStart { index: u32, id: String, name: String },
    ToolCallDelta { index: u32, arguments: String },
    Usage { input_tokens: u64, output_tokens: u64 },
    Finish(FinishReason),
    Done,
}

pub use detect::FormatDetector;
pub use rewrite::{ModelRewriter, RewriteRecord};
pub use stream::StreamTranslator;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_kind_universal_restriction_matches_all() {
        for k in [ClientKind::ClaudeCode, ClientKind::Codex, ClientKind::Gemini, ClientKind::Unknown] {
            assert!(k.matches_restriction(""));
        }
    }

    #[test]
    fn client_kind_specific_restriction() {
        assert!(ClientKind::Codex.matches_restriction("codex"));
        assert!(!ClientKind::Codex.matches_restriction("claude_code"));
    }

    #[test]
    fn finish_reason_mappings() {
        assert_eq!(FinishReason::Length.openai_str(), "length");
        assert_eq!(FinishReason::Length.anthropic_str(), "max_tokens");
        assert_eq!(FinishReason::ToolCalls.anthropic_str(), "tool_use");
    }
}
