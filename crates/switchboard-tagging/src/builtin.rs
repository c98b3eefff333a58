// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Builtin tagger kinds: path, header, body-json, method, query,
//! user-message, model, thinking.

use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;

use switchboard_config::{TaggerConfig, TaggerKind, TaggingConfig};

use crate::rule::{RuleExpr, RuleTagger};
use crate::{RequestView, Tagger};

/// One matcher: a kind plus its key/value parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct BuiltinMatcher {
    pub kind: TaggerKind,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

/// Match `name` against a glob holding at most one `*`.
fn glob_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
    }
}

impl BuiltinMatcher {
    pub fn matches(&self, req: &RequestView) -> anyhow::Result<bool> {
        Ok(match self.kind {
            TaggerKind::Path => {
                let prefix = self.required_value()?;
                req.path().starts_with(prefix)
            }
            TaggerKind::Method => {
                let want = self.required_value()?;
                req.method().eq_ignore_ascii_case(want)
            }
            TaggerKind::Header => {
                let name = self.required_key()?;
                match (req.header(name), &self.value) {
                    (None, _) => false,
                    (Some(_), None) => true,
                    (Some(actual), Some(pattern)) => {
                        let re = regex::Regex::new(pattern)
                            .with_context(|| format!("invalid header pattern {pattern:?}"))?;
                        re.is_match(actual)
                    }
                }
            }
            TaggerKind::Query => {
                let key = self.required_key()?;
                match (req.query_param(key), &self.value) {
                    (None, _) => false,
                    (Some(_), None) => true,
                    (Some(actual), Some(want)) => actual == want,
                }
            }
            TaggerKind::BodyJson => {
                let pointer = self.required_key()?;
                match (req.json_pointer(pointer), &self.value) {
                    (None, _) => false,
                    (Some(_), None) => true,
                    (Some(actual), Some(want)) => json_scalar_eq(actual, want),
                }
            }
            TaggerKind::UserMessage => {
                let needle = self.required_value()?.to_ascii_lowercase();
                req.user_message_text().to_ascii_lowercase().contains(&needle)
            }
            TaggerKind::Model => {
                let pattern = self.required_value()?;
                req.model().is_some_and(|m| glob_match(pattern, m))
            }
            TaggerKind::Thinking => req.thinking_enabled(),
            TaggerKind::Rule => bail!("rule matcher cannot nest another rule"),
        })
    }

    fn required_value(&self) -> anyhow::Result<&str> {
        self.value.as_deref().with_context(|| format!("{:?} tagger needs a value", self.kind))
    }

    fn required_key(&self) -> anyhow::Result<&str> {
        self.key.as_deref().with_context(|| format!("{:?} tagger needs a key", self.kind))
    }
}

fn json_scalar_eq(actual: &serde_json::Value, want: &str) -> bool {
    match actual {
        serde_json::Value::String(s) => s == want,
        other => other.to_string() == want,
    }
}

pub struct BuiltinTagger {
    name: String,
    tag: String,
    matcher: BuiltinMatcher,
}

#[async_trait]
impl Tagger for BuiltinTagger {
    fn name(&self) -> &str {
        &self.name
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    async fn should_tag(&self, req: &RequestView) -> anyhow::Result<bool> {
        self.matcher.matches(req)
    }
}

/// Instantiate every enabled tagger from config.
pub fn build_taggers(config: &TaggingConfig) -> anyhow::Result<Vec<Arc<dyn Tagger>>> {
    config
        .taggers
        .iter()
        .filter(|t| t.enabled)
        .map(build_one)
        .collect()
}

fn build_one(cfg: &TaggerConfig) -> anyhow::Result<Arc<dyn Tagger>> {
    if cfg.kind == TaggerKind::Rule {
        let raw = cfg
            .rule
            .clone()
            .with_context(|| format!("tagger {} needs a rule block", cfg.name))?;
        let rule: RuleExpr = serde_json::from_value(raw)
            .with_context(|| format!("tagger {}: invalid rule", cfg.name))?;
        return Ok(Arc::new(RuleTagger::new(cfg.name.clone(), cfg.tag.clone(), rule)));
    }
    Ok(Arc::new(BuiltinTagger {
        name: cfg.name.clone(),
        tag: cfg.tag.clone(),
        matcher: BuiltinMatcher { kind: cfg.kind, key: cfg.key.clone(), value: cfg.value.clone() },
    }))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req() -> RequestView {
        RequestView::new(
            "POST",
            "/v1/messages",
            "stream=true",
            vec![("user-agent".into(), "claude-cli/1.0".into())],
            json!({
                "model": "claude-3-5-haiku",
                "thinking": { "type": "enabled" },
                "messages": [{ "role": "user", "content": "please review this diff" }],
            })
            .to_string()
            .into_bytes(),
        )
    }

    fn matcher(kind: TaggerKind, key: Option<&str>, value: Option<&str>) -> BuiltinMatcher {
        BuiltinMatcher {
            kind,
            key: key.map(String::from),
            value: value.map(String::from),
        }
    }

    #[test]
    fn path_prefix_matches() {
        assert!(matcher(TaggerKind::Path, None, Some("/v1/")).matches(&req()).unwrap());
        assert!(!matcher(TaggerKind::Path, None, Some("/v2/")).matches(&req()).unwrap());
    }

    #[test]
    fn method_is_case_insensitive() {
        assert!(matcher(TaggerKind::Method, None, Some("post")).matches(&req()).unwrap());
    }

    #[test]
    fn header_regex_matches() {
        let m = matcher(TaggerKind::Header, Some("user-agent"), Some("^claude-cli"));
        assert!(m.matches(&req()).unwrap());
        let m = matcher(TaggerKind::Header, Some("user-agent"), Some("^codex"));
        assert!(!m.matches(&req()).unwrap());
    }

    #[test]
    fn header_presence_only() {
        assert!(matcher(TaggerKind::Header, Some("user-agent"), None).matches(&req()).unwrap());
        assert!(!matcher(TaggerKind::Header, Some("x-missing"), None).matches(&req()).unwrap());
    }

    #[test]
    fn invalid_header_regex_is_an_error_not_a_match() {
        let m = matcher(TaggerKind::Header, Some("user-agent"), Some("("));
        assert!(m.matches(&req()).is_err());
    }

    #[test]
    fn body_json_pointer_equality() {
        let m = matcher(TaggerKind::BodyJson, Some("/thinking/type"), Some("enabled"));
        assert!(m.matches(&req()).unwrap());
        let m = matcher(TaggerKind::BodyJson, Some("/thinking/type"), Some("disabled"));
        assert!(!m.matches(&req()).unwrap());
        let m = matcher(TaggerKind::BodyJson, Some("/nope"), None);
        assert!(!m.matches(&req()).unwrap());
    }

    #[test]
    fn query_and_user_message_and_model() {
        assert!(matcher(TaggerKind::Query, Some("stream"), Some("true")).matches(&req()).unwrap());
        assert!(matcher(TaggerKind::UserMessage, None, Some("REVIEW")).matches(&req()).unwrap());
        assert!(matcher(TaggerKind::Model, None, Some("claude-3-5-*")).matches(&req()).unwrap());
        assert!(!matcher(TaggerKind::Model, None, Some("gpt-*")).matches(&req()).unwrap());
    }

    #[test]
    fn thinking_kind_reads_body() {
        assert!(matcher(TaggerKind::Thinking, None, None).matches(&req()).unwrap());
    }

    #[test]
    fn build_skips_disabled_taggers() {
        let cfg: TaggingConfig = serde_json::from_value(json!({
            "taggers": [
                { "name": "on",  "tag": "a", "kind": "method", "value": "POST" },
                { "name": "off", "tag": "b", "kind": "method", "value": "GET", "enabled": false },
            ]
        }))
        .unwrap();
        let taggers = build_taggers(&cfg).unwrap();
        assert_eq!(taggers.len(), 1);
        assert_eq!(taggers[0].name(), "on");
    }
}
