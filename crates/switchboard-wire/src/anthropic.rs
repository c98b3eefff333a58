// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Anthropic Messages dialect: SSE parsing and rendering.
//!
//! # Wire shape
//! Streaming responses are named events (`event: <type>` + `data:`) in the
//! order `message_start`, `content_block_start/delta/stop`, `message_delta`,
//! `message_stop`.  Tool calls stream as `input_json_delta` fragments.

use serde_json::{json, Value};

use crate::{FinishReason, StreamEvent};

/// Parse one decoded `data:` payload into neutral events.
pub fn parse_event(v: &Value) -> Vec<StreamEvent> {
    let event_type = v["type"].as_str().unwrap_or("");
    match event_type {
        "message_start" => {
            let msg = &v["message"];
            let mut out = vec![StreamEvent::Start {
                id: msg["id"].as_str().unwrap_or("").to_string(),
                model: msg["model"].as_str().unwrap_or("").to_string(),
            }];
            if let Some(usage) = msg.get("usage") {
                out.push(StreamEvent::Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
                    output_tokens: 0,
                });
            }
            out
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                vec![StreamEvent::ToolCallStart {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                }]
            } else {
                vec![]
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("");
                    if text.is_empty() { vec![] } else { vec![StreamEvent::TextDelta(text.into())] }
                }
                "input_json_delta" => {
                    let partial = delta["partial_json"].as_str().unwrap_or("");
                    vec![StreamEvent::ToolCallDelta { index, arguments: partial.into() }]
                }
                "thinking_delta" => {
                    let t = delta["thinking"].as_str().unwrap_or("");
                    if t.is_empty() { vec![] } else { vec![StreamEvent::ThinkingDelta(t.into())] }
                }
                // signature_delta carries an opaque integrity blob; drop it.
                _ => vec![],
            }
        }
        "message_delta" => {
            let mut out = Vec::new();
            if let Some(stop) = v["delta"]["stop_reason"].as_str() {
                out.push(StreamEvent::Finish(match stop {
                    "max_tokens" => FinishReason::Length,
                    "tool_use" => FinishReason::ToolCalls,
                    _ => FinishReason::Stop,
                }));
            }
            if let Some(usage) = v.get("usage") {
                out.push(StreamEvent::Usage {
                    input_tokens: 0,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
                });
            }
            out
        }
        "message_stop" => vec![StreamEvent::Done],
        _ => vec![],
    }
}

/// Render neutral events as Anthropic SSE frames.
///
/// Block indexes are assigned in emit order: one text block, then one block
/// per tool call.  `finish` closes anything still open so a truncated
/// upstream still yields a well-formed Anthropic stream.
pub struct Renderer {
    started: bool,
    msg_id: String,
    model: String,
    input_tokens: u64,
    output_tokens: u64,
    text_block_open: Option<u32>,
    tool_block_open: Option<u32>,
    next_index: u32,
    finish: Option<FinishReason>,
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            started: false,
            msg_id: String::new(),
            model: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            text_block_open: None,
            tool_block_open: None,
            next_index: 0,
            finish: None,
        }
    }

    fn start_frame(&self) -> String {
        let payload = json!({
            "type": "message_start",
            "message": {
                "id": self.msg_id,
                "type": "message",
                "role": "assistant",
                "model": self.model,
                "content": [],
                "stop_reason": Value::Null,
                "usage": { "input_tokens": self.input_tokens, "output_tokens": 0 },
            }
        });
        crate::sse::event_frame("message_start", &payload.to_string())
    }

    fn ensure_started(&mut self, out: &mut Vec<String>) {
        if !self.started {
            if self.msg_id.is_empty() {
                self.msg_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
            }
            self.started = true;
            out.push(self.start_frame());
        }
    }

    fn close_open_block(&mut self, out: &mut Vec<String>) {
        for open in [self.text_block_open.take(), self.tool_block_open.take()]
            .into_iter()
            .flatten()
        {
            let payload = json!({ "type": "content_block_stop", "index": open });
            out.push(crate::sse::event_frame("content_block_stop", &payload.to_string()));
        }
    }

    pub fn on_event(&mut self, ev: &StreamEvent) -> Vec<String> {
        let mut out = Vec::new();
        match ev {
            StreamEvent::Start { id, model } => {
                if !self.started {
                    self.msg_id = id.clone();
                    self.model = model.clone();
                    self.ensure_started(&mut out);
                }
            }
            StreamEvent::Usage { input_tokens, output_tokens } => {
                if *input_tokens > 0 {
                    self.input_tokens = *input_tokens;
                }
                if *output_tokens > 0 {
                    self.output_tokens = *output_tokens;
                }
            }
            StreamEvent::TextDelta(text) => {
                self.ensure_started(&mut out);
                if self.text_block_open.is_none() {
                    if self.tool_block_open.is_some() {
                        self.close_open_block(&mut out);
                    }
                    let index = self.next_index;
                    self.next_index += 1;
                    self.text_block_open = Some(index);
                    let payload = json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": { "type": "text", "text": "" },
                    });
                    out.push(crate::sse::event_frame("content_block_start", &payload.to_string()));
                }
                let index = self.text_block_open.expect("text block open");
                let payload = json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": { "type": "text_delta", "text": text },
                });
                out.push(crate::sse::event_frame("content_block_delta", &payload.to_string()));
            }
            // Thinking has no anthropic rendering on the way *out* of a
            // foreign upstream; drop it rather than fabricating signatures.
            StreamEvent::ThinkingDelta(_) => {}
            StreamEvent::ToolCallStart { id, name, .. } => {
                self.ensure_started(&mut out);
                self.close_open_block(&mut out);
                let index = self.next_index;
                self.next_index += 1;
                self.tool_block_open = Some(index);
                let payload = json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": { "type": "tool_use", "id": id, "name": name, "input": {} },
                });
                out.push(crate::sse::event_frame("content_block_start", &payload.to_string()));
            }
            StreamEvent::ToolCallDelta { arguments, .. } => {
                if let Some(index) = self.tool_block_open {
                    let payload = json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": { "type": "input_json_delta", "partial_json": arguments },
                    });
                    out.push(crate::sse::event_frame("content_block_delta", &payload.to_string()));
                }
            }
            StreamEvent::Finish(reason) => {
                self.finish = Some(*reason);
            }
            StreamEvent::Done => {
                out.extend(self.finish_frames());
            }
        }
        out
    }

    /// Close the stream, emitting whatever terminal frames are still owed.
    pub fn finish_frames(&mut self) -> Vec<String> {
        if !self.started {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.close_open_block(&mut out);
        let reason = self.finish.take().unwrap_or(FinishReason::Stop);
        let payload = json!({
            "type": "message_delta",
            "delta": { "stop_reason": reason.anthropic_str(), "stop_sequence": Value::Null },
            "usage": { "output_tokens": self.output_tokens },
        });
        out.push(crate::sse::event_frame("message_delta", &payload.to_string()));
        out.push(crate::sse::event_frame("message_stop", &json!({"type": "message_stop"}).to_string()));
        self.started = false;
        out
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_start_yields_start_and_usage() {
        let v = json!({
            "type": "message_start",
            "message": {
                "id": "msg_01", "model": "claude-3-5-sonnet",
                "usage": { "input_tokens": 42, "output_tokens": 0 }
            }
        });
        let evs = parse_event(&v);
        assert_eq!(evs.len(), 2);
        assert!(matches!(&evs[0], StreamEvent::Start { id, model }
            if id == "msg_01" && model == "claude-3-5-sonnet"));
        assert!(matches!(evs[1], StreamEvent::Usage { input_tokens: 42, .. }));
    }

    #[test]
    fn text_delta_parsed() {
        let v = json!({
            "type": "content_block_delta",
            "delta": { "type": "text_delta", "text": "world" }
        });
        let evs = parse_event(&v);
        assert!(matches!(&evs[0], StreamEvent::TextDelta(t) if t == "world"));
    }

    #[test]
    fn tool_use_block_start_parsed() {
        let v = json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": { "type": "tool_use", "id": "toolu_01", "name": "shell" }
        });
        let evs = parse_event(&v);
        assert!(matches!(&evs[0], StreamEvent::ToolCallStart { index: 1, id, name }
            if id == "toolu_01" && name == "shell"));
    }

    #[test]
    fn signature_delta_is_discarded() {
        let v = json!({
            "type": "content_block_delta",
            "delta": { "type": "signature_delta", "signature": "EqRkLm" }
        });
        assert!(parse_event(&v).is_empty());
    }

    #[test]
    fn message_delta_max_tokens_maps_to_length() {
        let v = json!({
            "type": "message_delta",
            "delta": { "stop_reason": "max_tokens" },
            "usage": { "output_tokens": 88 }
        });
        let evs = parse_event(&v);
        assert!(matches!(evs[0], StreamEvent::Finish(FinishReason::Length)));
        assert!(matches!(evs[1], StreamEvent::Usage { output_tokens: 88, .. }));
    }

    #[test]
    fn message_stop_yields_done() {
        let evs = parse_event(&json!({ "type": "message_stop" }));
        assert_eq!(evs, vec![StreamEvent::Done]);
    }

    #[test]
    fn unknown_event_yields_nothing() {
        assert!(parse_event(&json!({ "type": "ping" })).is_empty());
    }

    // ── Renderer ──────────────────────────────────────────────────────────────

    fn render_all(events: &[StreamEvent]) -> String {
        let mut r = Renderer::new();
        let mut out = String::new();
        for ev in events {
            for frame in r.on_event(ev) {
                out.push_str(&frame);
            }
        }
        for frame in r.finish_frames() {
            out.push_str(&frame);
        }
        out
    }

    #[test]
    fn text_stream_renders_complete_anthropic_sequence() {
        let out = render_all(&[
            StreamEvent::Start { id: "chatcmpl-1".into(), model: "gpt-5".into() },
            StreamEvent::TextDelta("Hel".into()),
            StreamEvent::TextDelta("lo".into()),
            StreamEvent::Finish(FinishReason::Stop),
            StreamEvent::Done,
        ]);
        let order = [
            "event: message_start",
            "event: content_block_start",
            "event: content_block_delta",
            "event: content_block_stop",
            "event: message_delta",
            "event: message_stop",
        ];
        let mut pos = 0;
        for marker in order {
            let found = out[pos..].find(marker).unwrap_or_else(|| panic!("missing {marker}\n{out}"));
            pos += found;
        }
        assert!(out.contains("\"stop_reason\":\"end_turn\""), "{out}");
    }

    #[test]
    fn tool_call_renders_tool_use_block() {
        let out = render_all(&[
            StreamEvent::Start { id: "x".into(), model: "m".into() },
            StreamEvent::ToolCallStart { index: 0, id: "call_1".into(), name: "get_time".into() },
            StreamEvent::ToolCallDelta { index: 0, arguments: "{\"tz\":".into() },
            StreamEvent::ToolCallDelta { index: 0, arguments: "\"utc\"}".into() },
            StreamEvent::Finish(FinishReason::ToolCalls),
            StreamEvent::Done,
        ]);
        assert!(out.contains("\"type\":\"tool_use\""), "{out}");
        assert!(out.contains("input_json_delta"), "{out}");
        assert!(out.contains("\"stop_reason\":\"tool_use\""), "{out}");
    }

    #[test]
    fn duplicate_start_events_render_once() {
        let out = render_all(&[
            StreamEvent::Start { id: "a".into(), model: "m".into() },
            StreamEvent::Start { id: "b".into(), model: "m".into() },
            StreamEvent::TextDelta("x".into()),
            StreamEvent::Done,
        ]);
        assert_eq!(out.matches("event: message_start").count(), 1);
    }

    #[test]
    fn truncated_stream_still_closes_cleanly() {
        // No Finish/Done from upstream: finish_frames must synthesize the
        // terminal events anyway.
        let mut r = Renderer::new();
        let mut out = String::new();
        for ev in [
            StreamEvent::Start { id: "a".into(), model: "m".into() },
            StreamEvent::TextDelta("partial".into()),
        ] {
            for f in r.on_event(&ev) {
                out.push_str(&f);
            }
        }
        for f in r.finish_frames() {
            out.push_str(&f);
        }
        assert!(out.contains("event: message_stop"), "{out}");
    }
}
