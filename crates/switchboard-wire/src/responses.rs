// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI Responses dialect: SSE parsing and rendering.
//!
//! # Wire shape
//! Streaming responses are typed events: `response.created`,
//! `response.output_item.added`, `response.output_text.delta`,
//! `response.function_call_arguments.delta`, `response.completed`, then the
//! `[DONE]` sentinel.  Codex CLI consumes this format.

use serde_json::{json, Value};

use crate::{FinishReason, StreamEvent};

/// Parse one decoded Responses event payload into neutral events.
pub fn parse_event(v: &Value) -> Vec<StreamEvent> {
    match v["type"].as_str().unwrap_or("") {
        "response.created" => {
            let resp = &v["response"];
            vec![StreamEvent::Start {
                id: resp["id"].as_str().unwrap_or("").to_string(),
                model: resp["model"].as_str().unwrap_or("").to_string(),
            }]
        }
        "response.output_text.delta" => {
            let delta = v["delta"].as_str().unwrap_or("");
            if delta.is_empty() { vec![] } else { vec![StreamEvent::TextDelta(delta.into())] }
        }
        "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
            let delta = v["delta"].as_str().unwrap_or("");
            if delta.is_empty() { vec![] } else { vec![StreamEvent::ThinkingDelta(delta.into())] }
        }
        "response.output_item.added" => {
            let item = &v["item"];
            if item["type"].as_str() == Some("function_call") {
                let index = v["output_index"].as_u64().unwrap_or(0) as u32;
                vec![StreamEvent::ToolCallStart {
                    index,
                    id: item["call_id"]
                        .as_str()
                        .or_else(|| item["id"].as_str())
                        .unwrap_or("")
                        .to_string(),
                    name: item["name"].as_str().unwrap_or("").to_string(),
                }]
            } else {
                vec![]
            }
        }
        "response.function_call_arguments.delta" => {
            let index = v["output_index"].as_u64().unwrap_or(0) as u32;
            let delta = v["delta"].as_str().unwrap_or("");
            vec![StreamEvent::ToolCallDelta { index, arguments: delta.into() }]
        }
        "response.completed" | "response.incomplete" => {
            let resp = &v["response"];
            let mut out = Vec::new();
            if let Some(usage) = resp.get("usage") {
                out.push(StreamEvent::Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
                });
            }
            let status = resp["status"].as_str().unwrap_or("completed");
            out.push(StreamEvent::Finish(match status {
                "length" | "incomplete" => FinishReason::Length,
                "tool_calls" => FinishReason::ToolCalls,
                _ => FinishReason::Stop,
            }));
            out.push(StreamEvent::Done);
            out
        }
        "response.failed" => vec![StreamEvent::Done],
        _ => vec![],
    }
}

/// Render neutral events as Responses SSE frames.
///
/// This is the Chat-Completions → Responses direction of the converter:
/// `response.created` fires on the first event carrying id/model, text
/// accumulates through `response.output_text.delta`, and the terminal
/// `response.completed` carries a status derived from the finish reason,
/// followed by the `[DONE]` sentinel.
pub struct Renderer {
    id: String,
    model: String,
    created: bool,
    text: String,
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
            text: String::new(),
            finish: None,
            usage: None,
            done_emitted: false,
        }
    }

    fn ensure_created(&mut self, out: &mut Vec<String>) {
        if !self.created {
            if self.id.is_empty() {
                self.id = format!("resp_{}", uuid::Uuid::new_v4().simple());
            }
            self.created = true;
            let payload = json!({
                "type": "response.created",
                "response": { "id": self.id, "model": self.model, "status": "in_progress" },
            });
            out.push(crate::sse::data_frame(&payload.to_string()));
        }
    }

    pub fn on_event(&mut self, ev: &StreamEvent) -> Vec<String> {
        let mut out = Vec::new();
        match ev {
            StreamEvent::Start { id, model } => {
                if !self.created {
                    self.id = id.clone();
                    self.model = model.clone();
                    self.ensure_created(&mut out);
                }
            }
            StreamEvent::TextDelta(text) => {
                self.ensure_created(&mut out);
                self.text.push_str(text);
                let payload = json!({
                    "type": "response.output_text.delta",
                    "delta": text,
                });
                out.push(crate::sse::data_frame(&payload.to_string()));
            }
            StreamEvent::ThinkingDelta(text) => {
                self.ensure_created(&mut out);
                let payload = json!({
                    "type": "response.reasoning_text.delta",
                    "delta": text,
                });
                out.push(crate::sse::data_frame(&payload.to_string()));
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.ensure_created(&mut out);
                let payload = json!({
                    "type": "response.output_item.added",
                    "output_index": index,
                    "item": { "type": "function_call", "call_id": id, "name": name, "arguments": "" },
                });
                out.push(crate::sse::data_frame(&payload.to_string()));
            }
            StreamEvent::ToolCallDelta { index, arguments } => {
                let payload = json!({
                    "type": "response.function_call_arguments.delta",
                    "output_index": index,
                    "delta": arguments,
                });
                out.push(crate::sse::data_frame(&payload.to_string()));
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

    pub fn finish_frames(&mut self) -> Vec<String> {
        if self.done_emitted {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_created(&mut out);
        let status = match self.finish.take() {
            Some(FinishReason::Length) => "length",
            Some(FinishReason::ToolCalls) => "tool_calls",
            _ => "completed",
        };
        let (input, output) = self.usage.take().unwrap_or((0, 0));
        let payload = json!({
            "type": "response.completed",
            "response": {
                "id": self.id,
                "model": self.model,
                "status": status,
                "output": [{
                    "type": "message",
                    "role": "assistant",
                    "content": [{ "type": "output_text", "text": self.text }],
                }],
                "usage": {
                    "input_tokens": input,
                    "output_tokens": output,
                    "total_tokens": input + output,
                },
            },
        });
        out.push(crate::sse::data_frame(&payload.to_string()));
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
