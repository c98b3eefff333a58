// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-call mapping cache for the prompt-injected tool-calling enhancer.
//!
//! The dispatcher records every tool call observed in a complete response
//! here; [`reattach_tool_context`] consumes the mappings on the
//! tool-result round trip, re-injecting call blocks that the client
//! dropped from its history.  One cache per endpoint — mappings never
//! leak across tenants.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::{json, Value};

use switchboard_wire::Dialect;

const DEFAULT_CAPACITY: usize = 1000;
const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct ToolCallMapping {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub description: String,
    pub created_at: Instant,
}

pub struct ToolCallCache {
    inner: Mutex<LruCache<String, ToolCallMapping>>,
    ttl: Duration,
}

impl Default for ToolCallCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl ToolCallCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity");
        Self { inner: Mutex::new(LruCache::new(cap)), ttl }
    }

    pub fn insert(&self, id: &str, name: &str, arguments: &str, description: &str) {
        let mapping = ToolCallMapping {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
            description: description.to_string(),
            created_at: Instant::now(),
        };
        self.inner.lock().expect("toolmap lock").put(mapping.id.clone(), mapping);
    }

    /// Lookup by call id; expired entries are dropped on access.
    pub fn get(&self, id: &str) -> Option<ToolCallMapping> {
        let mut inner = self.inner.lock().expect("toolmap lock");
        match inner.get(id) {
            Some(m) if m.created_at.elapsed() <= self.ttl => Some(m.clone()),
            Some(_) => {
                inner.pop(id);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("toolmap lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().expect("toolmap lock").clear();
    }
}

// ─── Context re-attachment ────────────────────────────────────────────────────

/// Re-attach tool-call context the client dropped.
///
/// Clients sometimes send a tool result without the assistant turn that
/// issued the call (history truncation, prompt-injection setups).  Native
/// upstreams tolerate this; converted ones do not — Gemini resolves a
/// `functionResponse` by function name and OpenAI rejects a `tool`
/// message with no preceding `tool_calls`.  Every orphan result whose
/// call id is still cached gets the originating call block re-injected
/// immediately before the result turn.  Returns the number of injected
/// calls.
pub fn reattach_tool_context(cache: &ToolCallCache, body: &mut Value, dialect: Dialect) -> usize {
    match dialect {
        Dialect::Anthropic => reattach_anthropic(cache, body),
        Dialect::OpenaiChat => reattach_chat(cache, body),
        Dialect::OpenaiResponses => reattach_responses(cache, body),
        _ => 0,
    }
}

/// Ids whose results lack a matching call turn, with their insert index.
fn orphans(
    items: &[Value],
    known: &HashSet<String>,
    result_id_of: impl Fn(&Value) -> Vec<String>,
    cache: &ToolCallCache,
) -> Vec<(usize, ToolCallMapping)> {
    let mut injected: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for (i, item) in items.iter().enumerate() {
        for id in result_id_of(item) {
            if known.contains(&id) || !injected.insert(id.clone()) {
                continue;
            }
            if let Some(mapping) = cache.get(&id) {
                out.push((i, mapping));
            }
        }
    }
    out
}

fn reattach_anthropic(cache: &ToolCallCache, body: &mut Value) -> usize {
    let Some(messages) = body["messages"].as_array() else { return 0 };
    let known: HashSet<String> = messages
        .iter()
        .flat_map(|m| m["content"].as_array().cloned().unwrap_or_default())
        .filter(|b| b["type"] == "tool_use")
        .filter_map(|b| b["id"].as_str().map(str::to_string))
        .collect();
    let injections = orphans(
        messages,
        &known,
        |m| {
            m["content"]
                .as_array()
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b["type"] == "tool_result")
                        .filter_map(|b| b["tool_use_id"].as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        },
        cache,
    );
    let messages = body["messages"].as_array_mut().expect("messages checked above");
    for (i, mapping) in injections.iter().rev() {
        let input: Value = serde_json::from_str(&mapping.arguments).unwrap_or_else(|_| json!({}));
        messages.insert(
            *i,
            json!({
                "role": "assistant",
                "content": [{
                    "type": "tool_use",
                    "id": mapping.id,
                    "name": mapping.name,
                    "input": input,
                }],
            }),
        );
    }
    injections.len()
}

fn reattach_chat(cache: &ToolCallCache, body: &mut Value) -> usize {
    let Some(messages) = body["messages"].as_array() else { return 0 };
    let known: HashSet<String> = messages
        .iter()
        .flat_map(|m| m["tool_calls"].as_array().cloned().unwrap_or_default())
        .filter_map(|tc| tc["id"].as_str().map(str::to_string))
        .collect();
    let injections = orphans(
        messages,
        &known,
        |m| {
            if m["role"] == "tool" {
                m["tool_call_id"].as_str().map(str::to_string).into_iter().collect()
            } else {
                Vec::new()
            }
        },
        cache,
    );
    let messages = body["messages"].as_array_mut().expect("messages checked above");
    for (i, mapping) in injections.iter().rev() {
        messages.insert(
            *i,
            json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": [{
                    "id": mapping.id,
                    "type": "function",
                    "function": { "name": mapping.name, "arguments": mapping.arguments },
                }],
            }),
        );
    }
    injections.len()
}

fn reattach_responses(cache: &ToolCallCache, body: &mut Value) -> usize {
    let Some(input) = body["input"].as_array() else { return 0 };
    let known: HashSet<String> = input
        .iter()
        .filter(|item| item["type"] == "function_call")
        .filter_map(|item| item["call_id"].as_str().map(str::to_string))
        .collect();
    let injections = orphans(
        input,
        &known,
        |item| {
            if item["type"] == "function_call_output" {
                item["call_id"].as_str().map(str::to_string).into_iter().collect()
            } else {
                Vec::new()
            }
        },
        cache,
    );
    let input = body["input"].as_array_mut().expect("input checked above");
    for (i, mapping) in injections.iter().rev() {
        input.insert(
            *i,
            json!({
                "type": "function_call",
                "call_id": mapping.id,
                "name": mapping.name,
                "arguments": mapping.arguments,
            }),
        );
    }
    injections.len()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
