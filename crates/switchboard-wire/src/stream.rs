// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming response translation.
//!
//! A translator pairs the upstream dialect's parser with the client
//! dialect's renderer.  Bytes go in as they arrive off the socket; complete
//! client-dialect SSE frames come out.  Buffering is bounded to the current
//! incomplete line — full responses are never held in memory.

use serde_json::Value;

use crate::{anthropic, gemini, openai, responses, sse, Dialect, StreamEvent};

enum RendererKind {
    Anthropic(anthropic::Renderer),
    Chat(openai::Renderer),
    Responses(responses::Renderer),
    Gemini(gemini::Renderer),
}

impl RendererKind {
    fn on_event(&mut self, ev: &StreamEvent) -> Vec<String> {
        match self {
            RendererKind::Anthropic(r) => r.on_event(ev),
            RendererKind::Chat(r) => r.on_event(ev),
            RendererKind::Responses(r) => r.on_event(ev),
            RendererKind::Gemini(r) => r.on_event(ev),
        }
    }

    fn finish(&mut self) -> Vec<String> {
        match self {
            RendererKind::Anthropic(r) => r.finish_frames(),
            RendererKind::Chat(r) => r.finish_frames(),
            RendererKind::Responses(r) => r.finish_frames(),
            RendererKind::Gemini(r) => r.finish_frames(),
        }
    }
}

/// Streaming state machine for one upstream response.
pub struct StreamTranslator {
    from: Dialect,
    line_buf: String,
    renderer: RendererKind,
    saw_done: bool,
}

impl StreamTranslator {
    pub fn new(from: Dialect, to: Dialect) -> Self {
        let renderer = match to {
            Dialect::Anthropic => RendererKind::Anthropic(anthropic::Renderer::new()),
            Dialect::OpenaiResponses => RendererKind::Responses(responses::Renderer::new()),
            Dialect::Gemini => RendererKind::Gemini(gemini::Renderer::new()),
            _ => RendererKind::Chat(openai::Renderer::new()),
        };
        Self { from, line_buf: String::new(), renderer, saw_done: false }
    }

    fn parse_payload(&self, data: &str) -> Vec<StreamEvent> {
        if data == "[DONE]" {
            return vec![StreamEvent::Done];
        }
        let Ok(v) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        match self.from {
            Dialect::Anthropic => anthropic::parse_event(&v),
            Dialect::OpenaiResponses => responses::parse_event(&v),
            Dialect::Gemini => gemini::parse_chunk(&v),
            _ => openai::parse_chunk(&v),
        }
    }

    /// Feed a raw upstream chunk; returns zero or more complete frames for
    /// the client.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.line_buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        for line in sse::drain_complete_lines(&mut self.line_buf) {
            let Some(data) = sse::data_payload(&line) else { continue };
            if data.is_empty() {
                continue;
            }
            for ev in self.parse_payload(data) {
                if ev == StreamEvent::Done {
                    if self.saw_done {
                        continue;
                    }
                    self.saw_done = true;
                }
                out.extend(self.renderer.on_event(&ev));
            }
        }
        out
    }

    /// Flush terminal frames.  Safe to call after a truncated upstream; the
    /// renderer closes whatever is still open.
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.saw_done {
            out.extend(self.renderer.on_event(&StreamEvent::Done));
            self.saw_done = true;
        }
        out.extend(self.renderer.finish());
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
