// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Model rewriting with response restoration.
//!
//! Endpoints can map requested model names onto the models they actually
//! host (`claude-3-*` → `claude-3-5-sonnet`).  The substitution is recorded
//! so the response restorer can put the original name back — the client
//! always observes the exact model it asked for.

use serde_json::Value;

use switchboard_config::ModelRewriteConfig;

use crate::{convert, Dialect};

/// A performed substitution, kept on the request context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRecord {
    pub original: String,
    pub rewritten: String,
}

/// Match `name` against a glob holding at most one `*`.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelRewriter {
    config: ModelRewriteConfig,
}

impl ModelRewriter {
    pub fn new(config: ModelRewriteConfig) -> Self {
        Self { config }
    }

    /// First matching rule's target, if any.
    fn target_for(&self, model: &str) -> Option<&str> {
        if !self.config.enabled {
            return None;
        }
        self.config
            .rules
            .iter()
            .find(|r| wildcard_match(&r.source_pattern, model))
            .map(|r| r.target_model.as_str())
    }

    /// Rewrite the model in a request body.  Returns the substitution made,
    /// or `None` when disabled or nothing matched.
    pub fn apply_body(&self, body: &mut Value, dialect: Dialect) -> Option<RewriteRecord> {
        let model = convert::model_of(body, dialect)?.to_string();
        let target = self.target_for(&model)?.to_string();
        convert::set_model(body, dialect, &target);
        Some(RewriteRecord { original: model, rewritten: target })
    }

    /// Rewrite a model carried in the URL (Gemini).  Returns the new model
    /// segment and the record.
    pub fn apply_url_model(&self, model: &str) -> Option<(String, RewriteRecord)> {
        let target = self.target_for(model)?.to_string();
        Some((
            target.clone(),
            RewriteRecord { original: model.to_string(), rewritten: target },
        ))
    }
}

/// Put the original model name back into a response body before the client
/// sees it.
pub fn restore_model(body: &mut Value, record: &RewriteRecord) {
    if let Some(obj) = body.as_object_mut() {
        if obj.contains_key("model") {
            obj.insert("model".into(), Value::String(record.original.clone()));
        }
        // Gemini responses carry modelVersion instead.
        if obj.contains_key("modelVersion") {
            obj.insert("modelVersion".into(), Value::String(record.original.clone()));
        }
    }
}

/// Restore the model inside one SSE frame payload, leaving non-JSON frames
/// (like `[DONE]`) untouched.
pub fn restore_model_in_frame(frame: &str, record: &RewriteRecord) -> String {
    // Cheap pre-filter: most frames carry no model field at all.
    if !frame.contains("\"model\"") {
        return frame.to_string();
    }
    let mut out = String::with_capacity(frame.len());
    for line in frame.split_inclusive('\n') {
        let stripped = line.strip_suffix('\n');
        let content = stripped.unwrap_or(line);
        if let Some(data) = content.strip_prefix("data: ") {
            if let Ok(mut v) = serde_json::from_str::<Value>(data.trim()) {
                restore_in_event_payload(&mut v, record);
                out.push_str("data: ");
                out.push_str(&v.to_string());
                if stripped.is_some() {
                    out.push('\n');
                }
                continue;
            }
        }
        out.push_str(line);
    }
    out
}

fn restore_in_event_payload(v: &mut Value, record: &RewriteRecord) {
    restore_model(v, record);
    // Nested carriers: anthropic message_start and responses events wrap
    // the model one level down.
    for key in ["message", "response"] {
        if let Some(inner) = v.get_mut(key) {
            restore_model(inner, record);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchboard_config::RewriteRule;

    fn rewriter(rules: &[(&str, &str)]) -> ModelRewriter {
        ModelRewriter::new(ModelRewriteConfig {
            enabled: true,
            rules: rules
                .iter()
                .map(|(p, t)| RewriteRule {
                    source_pattern: p.to_string(),
                    target_model: t.to_string(),
                })
                .collect(),
        })
    }

    #[test]
    fn wildcard_semantics() {
        assert!(wildcard_match("claude-3-*", "claude-3-opus"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("exact", "exact"));
        assert!(!wildcard_match("exact", "exactly"));
        assert!(!wildcard_match("claude-3-*", "claude-4"));
        assert!(wildcard_match("gpt-*-mini", "gpt-4o-mini"));
        assert!(!wildcard_match("gpt-*-mini", "gpt-mini"));
    }

    #[test]
    fn first_matching_rule_wins() {
        let r = rewriter(&[("claude-3-*", "first"), ("claude-*", "second")]);
        let mut body = json!({ "model": "claude-3-opus" });
        let rec = r.apply_body(&mut body, Dialect::Anthropic).unwrap();
        assert_eq!(body["model"], "first");
        assert_eq!(rec.original, "claude-3-opus");
        assert_eq!(rec.rewritten, "first");
    }

    #[test]
    fn disabled_rewriter_is_inert() {
        let mut cfg = ModelRewriteConfig::default();
        cfg.rules.push(RewriteRule { source_pattern: "*".into(), target_model: "x".into() });
        let r = ModelRewriter::new(cfg);
        let mut body = json!({ "model": "claude-3-opus" });
        assert!(r.apply_body(&mut body, Dialect::Anthropic).is_none());
        assert_eq!(body["model"], "claude-3-opus");
    }

    #[test]
    fn no_match_leaves_body_untouched() {
        let r = rewriter(&[("gpt-*", "g")]);
        let mut body = json!({ "model": "claude-3-opus" });
        assert!(r.apply_body(&mut body, Dialect::Anthropic).is_none());
    }

    #[test]
    fn url_model_rewrite_for_gemini() {
        let r = rewriter(&[("gemini-1.5-*", "gemini-2.0-flash")]);
        let (model, rec) = r.apply_url_model("gemini-1.5-pro").unwrap();
        assert_eq!(model, "gemini-2.0-flash");
        assert_eq!(rec.original, "gemini-1.5-pro");
    }

    #[test]
    fn restoration_puts_original_model_back() {
        // The client asked for claude-3-opus; the upstream served the
        // rewritten model; the response must name claude-3-opus again.
        let r = rewriter(&[("claude-3-*", "claude-3-5-sonnet")]);
        let mut req = json!({ "model": "claude-3-opus", "messages": [] });
        let rec = r.apply_body(&mut req, Dialect::Anthropic).unwrap();
        assert_eq!(req["model"], "claude-3-5-sonnet");

        let mut resp = json!({ "id": "msg_1", "model": "claude-3-5-sonnet", "content": [] });
        restore_model(&mut resp, &rec);
        assert_eq!(resp["model"], "claude-3-opus");
    }

    #[test]
    fn restoration_in_sse_frame_rewrites_nested_model() {
        let rec = RewriteRecord { original: "claude-3-opus".into(), rewritten: "claude-3-5-sonnet".into() };
        let frame = "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"m\",\"model\":\"claude-3-5-sonnet\"}}\n\n";
        let restored = restore_model_in_frame(frame, &rec);
        assert!(restored.contains("\"model\":\"claude-3-opus\""), "{restored}");
        assert!(restored.starts_with("event: message_start\n"));
    }

    #[test]
    fn done_sentinel_passes_restoration_untouched() {
        let rec = RewriteRecord { original: "a".into(), rewritten: "b".into() };
        assert_eq!(restore_model_in_frame("data: [DONE]\n\n", &rec), "data: [DONE]\n\n");
    }
}
