// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Request tagging: enrich inbound requests with routing labels.
//!
//! Taggers implement a small capability contract (`name`, `tag`,
//! `should_tag`) and run concurrently under one pipeline deadline.  The
//! request body is buffered once into a [`RequestView`]; taggers only get
//! read access.

mod builtin;
mod pipeline;
mod rule;

pub use builtin::{build_taggers, BuiltinMatcher, BuiltinTagger};
pub use pipeline::{TaggedRequest, TaggerOutcome, TaggingPipeline};
pub use rule::{RuleExpr, RuleTagger};

use std::sync::OnceLock;

use async_trait::async_trait;
use serde_json::Value;

/// The tagger contract.  Scripted and builtin variants both implement it.
#[async_trait]
pub trait Tagger: Send + Sync {
    fn name(&self) -> &str;
    /// The tag contributed on a match.
    fn tag(&self) -> &str;
    async fn should_tag(&self, req: &RequestView) -> anyhow::Result<bool>;
}

/// Read-only view of one buffered request, shared by every tagger.
///
/// The JSON parse happens at most once, on first access.
pub struct RequestView {
    method: String,
    path: String,
    query: String,
    /// Header names are lowercased at construction.
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    parsed: OnceLock<Option<Value>>,
}

impl RequestView {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        query: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Self {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self {
            method: method.into(),
            path: path.into(),
            query: query.into(),
            headers,
            body,
            parsed: OnceLock::new(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// The body parsed as JSON, or `None` for non-JSON bodies.
    pub fn json(&self) -> Option<&Value> {
        self.parsed
            .get_or_init(|| serde_json::from_slice(&self.body).ok())
            .as_ref()
    }

    pub fn json_pointer(&self, pointer: &str) -> Option<&Value> {
        self.json()?.pointer(pointer)
    }

    pub fn model(&self) -> Option<&str> {
        self.json()?["model"].as_str()
    }

    /// Whether the request asks for extended thinking.
    pub fn thinking_enabled(&self) -> bool {
        let Some(v) = self.json() else { return false };
        match &v["thinking"] {
            Value::Null => false,
            Value::Object(o) => o.get("type").and_then(|t| t.as_str()) != Some("disabled"),
            _ => true,
        }
    }

    /// Concatenated text of user turns across all dialect shapes.
    pub fn user_message_text(&self) -> String {
        let Some(v) = self.json() else { return String::new() };
        let mut out = String::new();
        // Anthropic / chat: messages[]; Responses: input[]; Gemini: contents[].
        for key in ["messages", "input", "contents"] {
            for item in v[key].as_array().unwrap_or(&Vec::new()) {
                let role = item["role"].as_str().unwrap_or("user");
                if role != "user" {
                    continue;
                }
                collect_text(&item["content"], &mut out);
                collect_text(&item["parts"], &mut out);
            }
        }
        if let Some(s) = v["input"].as_str() {
            out.push_str(s);
        }
        out
    }
}

fn collect_text(content: &Value, out: &mut String) {
    match content {
        Value::String(s) => out.push_str(s),
        Value::Array(parts) => {
            for p in parts {
                if let Some(t) = p["text"].as_str() {
                    out.push_str(t);
                }
            }
        }
        _ => {}
    }
}
