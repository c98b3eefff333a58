// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI Chat Completions dialect: SSE parsing and rendering.

use serde_json::{json, Value};

use crate::{FinishReason, StreamEvent};

/// Parse one decoded chat-completions chunk into neutral events.
///
/// The `[DONE]` sentinel is handled by the caller at the line level; this
/// function only sees JSON payloads.
pub fn parse_chunk(v: &Value) -> Vec<StreamEvent> {
    let mut out = Vec::new();

    // Chat chunks repeat id/model on every frame; renderers keep the first.
    if let (Some(id), Some(model)) = (v["id"].as_str(), v["model"].as_str()) {
        out.push(StreamEvent::Start { id: id.to_string(), model: model.to_string() });
    }

    // Usage-only chunk (stream_options.include_usage).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        out.push(StreamEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        });
    }

    let choice = &v["choices"][0];
    let delta = &choice["delta"];

    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        for tc in tool_calls {
            let index = tc["index"].as_u64().unwrap_or(0) as u32;
            let id = tc["id"].as_str().unwrap_or("");
            let name = tc["function"]["name"].as_str().unwrap_or("");
            if !id.is_empty() || !name.is_empty() {
                out.push(StreamEvent::ToolCallStart {
                    index,
                    id: id.to_string(),
                    name: name.to_string(),
                });
            }
            let args = tc["function"]["arguments"].as_str().unwrap_or("");
            if !args.is_empty() {
                out.push(StreamEvent::ToolCallDelta { index, arguments: args.to_string() });
            }
        }
    } else if let Some(content) = delta["content"].as_str() {
        if !content.is_empty() {
            out.push(StreamEvent::TextDelta(content.to_string()));
        }
    }

    // DeepSeek-style reasoning text arrives under reasoning_content.
    if let Some(reasoning) = delta["reasoning_content"].as_str() {
        if !reasoning.is_empty() {
            out.push(StreamEvent::ThinkingDelta(reasoning.to_string()));
        }
    }

    if let Some(reason) = choice["finish_reason"].as_str() {
        out.push(StreamEvent::Finish(match reason {
            "length" => FinishReason::Length,
            "tool_calls" => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }));
    }

    out
}

/// Render neutral events as chat-completions SSE chunks ending in `[DONE]`.
pub struct Renderer {
    id: String,
    model: String,
    created: bool,
    finish: Option<FinishReason>,
    usage: Option<(u64, u64)>,
    done_emitted: bool,
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            id: String::new(),
            model: String::new(),
            created: false,
            finish: None,
            usage: None,
            done_emitted: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Value) -> String {
        let payload = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "model": self.model,
            "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
        });
        crate::sse::data_frame(&payload.to_string())
    }

    pub fn on_event(&mut self, ev: &StreamEvent) -> Vec<String> {
        let mut out = Vec::new();
        match ev {
            StreamEvent::Start { id, model } => {
                if !self.created {
                    self.id = if id.is_empty() {
                        format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
                    } else {
                        id.clone()
                    };
                    self.model = model.clone();
                    self.created = true;
                    out.push(self.chunk(json!({ "role": "assistant", "content": "" }), Value::Null));
                }
            }
            StreamEvent::TextDelta(text) => {
                self.ensure_created(&mut out);
                out.push(self.chunk(json!({ "content": text }), Value::Null));
            }
            StreamEvent::ThinkingDelta(text) => {
                self.ensure_created(&mut out);
                out.push(self.chunk(json!({ "reasoning_content": text }), Value::Null));
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.ensure_created(&mut out);
                let delta = json!({
                    "tool_calls": [{
                        "index": index,
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": "" },
                    }]
                });
                out.push(self.chunk(delta, Value::Null));
            }
            StreamEvent::ToolCallDelta { index, arguments } => {
                self.ensure_created(&mut out);
                let delta = json!({
                    "tool_calls": [{ "index": index, "function": { "arguments": arguments } }]
                });
                out.push(self.chunk(delta, Value::Null));
            }
            StreamEvent::Usage { input_tokens, output_tokens } => {
                self.usage = Some((*input_tokens, *output_tokens));
            }
            StreamEvent::Finish(reason) => {
                self.finish = Some(*reason);
            }
            StreamEvent::Done => out.extend(self.finish_frames()),
        }
        out
    }

    fn ensure_created(&mut self, out: &mut Vec<String>) {
        if !self.created {
            self.id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
            self.created = true;
            out.push(self.chunk(json!({ "role": "assistant", "content": "" }), Value::Null));
        }
    }

    pub fn finish_frames(&mut self) -> Vec<String> {
        if self.done_emitted {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_created(&mut out);
        let reason = self.finish.take().unwrap_or(FinishReason::Stop);
        out.push(self.chunk(json!({}), json!(reason.openai_str())));
        if let Some((input, output)) = self.usage.take() {
            let payload = json!({
                "id": self.id,
                "object": "chat.completion.chunk",
                "model": self.model,
                "choices": [],
                "usage": {
                    "prompt_tokens": input,
                    "completion_tokens": output,
                    "total_tokens": input + output,
                },
            });
            out.push(crate::sse::data_frame(&payload.to_string()));
        }
        out.push(crate::sse::data_frame("[DONE]"));
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
