// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Request classification: which dialect is this body, and which client
//! sent it.
//!
//! Body signals are scored first; a conclusive body (score > 0.7) wins over
//! the path.  Otherwise the path decides at 0.95 confidence, and a weak
//! body score (>= 0.3) is the last resort before `unknown`.
//!
//! Path-derived results are cached: an LRU holds the hot set and a bounded
//! flat map catches lookups that lose the LRU lock race.  Both are safe
//! under concurrent readers.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use dashmap::DashMap;
use lru::LruCache;
use serde_json::Value;

use crate::{ClientKind, DetectionResult, Dialect};

const DEFAULT_LRU_CAPACITY: usize = 500;
const FLAT_MAP_CAPACITY: usize = 1000;
const BODY_ACCEPT_SCORE: f64 = 0.7;
const BODY_WEAK_SCORE: f64 = 0.3;
const PATH_CONFIDENCE: f64 = 0.95;

pub struct FormatDetector {
    lru: Mutex<LruCache<String, DetectionResult>>,
    flat: DashMap<String, DetectionResult>,
}

impl Default for FormatDetector {
    fn default() -> Self {
        Self::new(DEFAULT_LRU_CAPACITY)
    }
}

impl FormatDetector {
    pub fn new(lru_capacity: usize) -> Self {
        let cap = NonZeroUsize::new(lru_capacity.max(1)).expect("nonzero capacity");
        Self { lru: Mutex::new(LruCache::new(cap)), flat: DashMap::new() }
    }

    /// Classify a request.  Deterministic for identical inputs.
    pub fn detect(&self, path: &str, body: Option<&[u8]>) -> DetectionResult {
        let parsed: Option<Value> = body.and_then(|b| serde_json::from_slice(b).ok());

        // 1. Conclusive body signals beat the path.
        if let Some(v) = &parsed {
            if let Some(hit) = score_body(v) {
                if hit.confidence > BODY_ACCEPT_SCORE || hit.detected_by == "body_hard" {
                    return hit;
                }
            }
        }

        // 2. Path rules, cached.
        if let Some(hit) = self.cached_path_result(path) {
            return hit;
        }
        if let Some(hit) = detect_by_path(path) {
            self.cache_path_result(path, hit);
            return hit;
        }

        // 3. Weak body score as last resort.
        if let Some(v) = &parsed {
            if let Some(hit) = score_body(v) {
                if hit.confidence >= BODY_WEAK_SCORE {
                    return hit;
                }
            }
        }

        DetectionResult::unknown()
    }

    fn cached_path_result(&self, path: &str) -> Option<DetectionResult> {
        if let Ok(mut lru) = self.lru.try_lock() {
            return lru.get(path).copied();
        }
        self.flat.get(path).map(|r| *r)
    }

    fn cache_path_result(&self, path: &str, result: DetectionResult) {
        if let Ok(mut lru) = self.lru.try_lock() {
            lru.put(path.to_string(), result);
            return;
        }
        if self.flat.len() < FLAT_MAP_CAPACITY {
            self.flat.insert(path.to_string(), result);
        }
    }
}

/// Score the parsed body for anthropic vs openai signals.
fn score_body(v: &Value) -> Option<DetectionResult> {
    // A top-level `instructions` string is a hard Codex signal.
    if v["instructions"].is_string() {
        return Some(DetectionResult {
            format: Dialect::OpenaiResponses,
            client: ClientKind::Codex,
            confidence: PATH_CONFIDENCE,
            detected_by: "body_hard",
        });
    }

    let model = v["model"].as_str().unwrap_or("");

    let mut anthropic: f64 = 0.0;
    if v.get("system").is_some() {
        anthropic += 0.3;
    }
    if v.get("thinking").is_some() {
        anthropic += 0.3;
    }
    if ["claude", "sonnet", "opus", "haiku"].iter().any(|s| model.contains(s)) {
        anthropic += 0.4;
    }
    if v.get("tools").is_some() {
        anthropic += 0.1;
    }

    let mut openai: f64 = 0.0;
    let first_role = v["messages"][0]["role"].as_str().unwrap_or("");
    if first_role == "system" || first_role == "developer" {
        openai += 0.3;
    }
    if v["tools"][0]["type"].as_str() == Some("function") {
        openai += 0.3;
    }
    if ["gpt", "o1", "o3", "o4"].iter().any(|s| model.starts_with(s)) {
        openai += 0.4;
    }
    if v.get("max_completion_tokens").is_some() {
        openai += 0.2;
    }
    if v.get("frequency_penalty").is_some() || v.get("presence_penalty").is_some() {
        openai += 0.2;
    }

    let (format, client, score) = if anthropic >= openai {
        (Dialect::Anthropic, ClientKind::ClaudeCode, anthropic)
    } else {
        (Dialect::OpenaiChat, ClientKind::Unknown, openai)
    };
    if score == 0.0 {
        return None;
    }
    Some(DetectionResult {
        format,
        client,
        confidence: score.min(1.0),
        detected_by: "body",
    })
}

fn detect_by_path(path: &str) -> Option<DetectionResult> {
    let hit = |format, client| {
        Some(DetectionResult { format, client, confidence: PATH_CONFIDENCE, detected_by: "path" })
    };
    if path.ends_with("/messages") || path.ends_with("/count_tokens") {
        return hit(Dialect::Anthropic, ClientKind::ClaudeCode);
    }
    if path.ends_with("/responses") {
        return hit(Dialect::OpenaiResponses, ClientKind::Codex);
    }
    if path.ends_with("/chat/completions")
        || path.ends_with("/completions")
        || path.ends_with("/embeddings")
    {
        return hit(Dialect::OpenaiChat, ClientKind::Unknown);
    }
    if path.contains("/models/") && (path.contains(":generateContent") || path.contains(":streamGenerateContent"))
    {
        return hit(Dialect::Gemini, ClientKind::Gemini);
    }
    None
}

/// Split a Gemini path segment `gemini-pro:streamGenerateContent` into the
/// model and action.
pub fn split_gemini_segment(segment: &str) -> Option<(&str, &str)> {
    segment.split_once(':')
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
