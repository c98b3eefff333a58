// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Data-driven rule taggers.
//!
//! The scripted-tagger surface: a declarative expression combining the
//! builtin matchers with `all` / `any` / `not`.  The host API exposed to a
//! rule is exactly the builtin matcher set (path, headers, body accessors)
//! — deliberately not a general-purpose language.
//!
//! ```yaml
//! rule:
//!   all:
//!     - { kind: path, value: "/v1/messages" }
//!     - any:
//!         - { kind: model, value: "claude-3-5-haiku*" }
//!         - { kind: body_json, key: "/max_tokens", value: "512" }
//! ```

use async_trait::async_trait;
use serde::Deserialize;

use crate::builtin::BuiltinMatcher;
use crate::{RequestView, Tagger};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RuleExpr {
    All { all: Vec<RuleExpr> },
    Any { any: Vec<RuleExpr> },
    Not { not: Box<RuleExpr> },
    Match(BuiltinMatcher),
}

impl RuleExpr {
    pub fn evaluate(&self, req: &RequestView) -> anyhow::Result<bool> {
        match self {
            RuleExpr::All { all } => {
                for expr in all {
                    if !expr.evaluate(req)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            RuleExpr::Any { any } => {
                for expr in any {
                    if expr.evaluate(req)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            RuleExpr::Not { not } => Ok(!not.evaluate(req)?),
            RuleExpr::Match(matcher) => matcher.matches(req),
        }
    }
}

pub struct RuleTagger {
    name: String,
    tag: String,
    rule: RuleExpr,
}

impl RuleTagger {
    pub fn new(name: String, tag: String, rule: RuleExpr) -> Self {
        Self { name, tag, rule }
    }
}

#[async_trait]
impl Tagger for RuleTagger {
    fn name(&self) -> &str {
        &self.name
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    async fn should_tag(&self, req: &RequestView) -> anyhow::Result<bool> {
        self.rule.evaluate(req)
    }
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
            "",
            vec![],
            json!({ "model": "claude-3-5-haiku", "messages": [] }).to_string().into_bytes(),
        )
    }

    fn parse(rule: serde_json::Value) -> RuleExpr {
        serde_json::from_value(rule).unwrap()
    }

    #[test]
    fn leaf_matcher_parses_and_evaluates() {
        let rule = parse(json!({ "kind": "model", "value": "claude-*" }));
        assert!(rule.evaluate(&req()).unwrap());
    }

    #[test]
    fn all_requires_every_branch() {
        let rule = parse(json!({
            "all": [
                { "kind": "path", "value": "/v1/" },
                { "kind": "model", "value": "gpt-*" },
            ]
        }));
        assert!(!rule.evaluate(&req()).unwrap());
    }

    #[test]
    fn any_takes_first_match() {
        let rule = parse(json!({
            "any": [
                { "kind": "model", "value": "gpt-*" },
                { "kind": "model", "value": "claude-*" },
            ]
        }));
        assert!(rule.evaluate(&req()).unwrap());
    }

    #[test]
    fn not_inverts() {
        let rule = parse(json!({ "not": { "kind": "model", "value": "gpt-*" } }));
        assert!(rule.evaluate(&req()).unwrap());
    }

    #[test]
    fn nested_combination() {
        let rule = parse(json!({
            "all": [
                { "kind": "path", "value": "/v1/messages" },
                { "not": { "any": [
                    { "kind": "model", "value": "gpt-*" },
                    { "kind": "model", "value": "gemini-*" },
                ] } },
            ]
        }));
        assert!(rule.evaluate(&req()).unwrap());
    }

    #[test]
    fn error_in_leaf_propagates() {
        // Missing required value makes the leaf error rather than match.
        let rule = parse(json!({ "kind": "model" }));
        assert!(rule.evaluate(&req()).is_err());
    }
}
