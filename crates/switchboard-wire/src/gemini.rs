// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Gemini GenerateContent dialect: SSE parsing and rendering.
//!
//! # Endpoint pattern
//! `POST .../v1beta/models/{model}:streamGenerateContent?alt=sse` — the
//! model is a URL path segment, not a body field.

use serde_json::{json, Value};

use crate::{FinishReason, StreamEvent};

/// Parse one decoded Gemini stream chunk into neutral events.
pub fn parse_chunk(v: &Value) -> Vec<StreamEvent> {
    let mut out = Vec::new();

    if let Some(meta) = v.get("usageMetadata") {
        out.push(StreamEvent::Usage {
            input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0),
            output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0),
        });
    }

    let candidate = &v["candidates"][0];
    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            // Thinking parts carry `"thought": true` alongside the text.
            if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
                if let Some(text) = part["text"].as_str() {
                    out.push(StreamEvent::ThinkingDelta(text.to_string()));
                }
                continue;
            }
            if let Some(fc) = part.get("functionCall") {
                let name = fc["name"].as_str().unwrap_or("").to_string();
                let args = serde_json::to_string(&fc["args"]).unwrap_or_default();
                // Gemini has no call ids; the name doubles as the id and
                // arguments arrive whole.
                out.push(StreamEvent::ToolCallStart { index: 0, id: name.clone(), name });
                out.push(StreamEvent::ToolCallDelta { index: 0, arguments: args });
                continue;
            }
            if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    out.push(StreamEvent::TextDelta(text.to_string()));
                }
            }
        }
    }

    if let Some(reason) = candidate["finishReason"].as_str() {
        out.push(StreamEvent::Finish(match reason {
            "MAX_TOKENS" => FinishReason::Length,
            _ => FinishReason::Stop,
        }));
        out.push(StreamEvent::Done);
    }

    out
}

/// Render neutral events as Gemini stream chunks.
pub struct Renderer {
    model: String,
    finish: Option<FinishReason>,
    usage: Option<(u64, u64)>,
    done_emitted: bool,
    tool_name: Option<String>,
    tool_args: String,
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            model: String::new(),
            finish: None,
            usage: None,
            done_emitted: false,
            tool_name: None,
            tool_args: String::new(),
        }
    }

    fn text_chunk(text: &str) -> String {
        let payload = json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": text }] },
            }]
        });
        crate::sse::data_frame(&payload.to_string())
    }

    /// Gemini delivers whole functionCall parts, so buffered tool-call
    /// fragments are flushed as one part once complete.
    fn flush_tool_call(&mut self, out: &mut Vec<String>) {
        if let Some(name) = self.tool_name.take() {
            let args: Value =
                serde_json::from_str(&self.tool_args).unwrap_or_else(|_| json!({}));
            self.tool_args.clear();
            let payload = json!({
                "candidates": [{
                    "content": {
                        "role": "model",
                        "parts": [{ "functionCall": { "name": name, "args": args } }],
                    },
                }]
            });
            out.push(crate::sse::data_frame(&payload.to_string()));
        }
    }

    pub fn on_event(&mut self, ev: &StreamEvent) -> Vec<String> {
        let mut out = Vec::new();
        match ev {
            StreamEvent::Start { model, .. } => {
                if self.model.is_empty() {
                    self.model = model.clone();
                }
            }
            StreamEvent::TextDelta(text) => {
                self.flush_tool_call(&mut out);
                out.push(Self::text_chunk(text));
            }
            StreamEvent::ThinkingDelta(_) => {}
            StreamEvent::ToolCallStart { name, .. } => {
                self.flush_tool_call(&mut out);
                self.tool_name = Some(name.clone());
            }
            StreamEvent::ToolCallDelta { arguments, .. } => {
                self.tool_args.push_str(arguments);
            }
            StreamEvent::Usage { input_tokens, output_tokens } => {
                self.usage = Some((*input_tokens, *output_tokens));
            }
            StreamEvent::Finish(reason) => self.finish = Some(*reason),
            StreamEvent::Done => out.extend(self.finish_frames()),
        }
        out
    }

    pub fn finish_frames(&mut self) -> Vec<String> {
        if self.done_emitted {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.flush_tool_call(&mut out);
        let reason = match self.finish.take() {
            Some(FinishReason::Length) => "MAX_TOKENS",
            _ => "STOP",
        };
        let mut payload = json!({
            "candidates": [{ "content": { "role": "model", "parts": [] }, "finishReason": reason }]
        });
        if let Some((input, output)) = self.usage.take() {
            payload["usageMetadata"] = json!({
                "promptTokenCount": input,
                "candidatesTokenCount": output,
                "totalTokenCount": input + output,
            });
        }
        out.push(crate::sse::data_frame(&payload.to_string()));
        self.done_emitted = true;
        out
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
