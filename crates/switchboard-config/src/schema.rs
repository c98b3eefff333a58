// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_bind() -> String {
    "0.0.0.0:8080".into()
}
fn default_flush_interval() -> u64 {
    30
}
fn default_max_dirty_time() -> u64 {
    300
}
fn default_check_interval() -> u64 {
    30
}
fn default_recovery_threshold() -> u32 {
    1
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_min_samples() -> usize {
    5
}
fn default_pipeline_timeout() -> u64 {
    5
}
fn default_failback_threshold() -> u32 {
    30
}
fn default_conversion_mode() -> ConversionMode {
    ConversionMode::Auto
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tagging: TaggingConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    /// Upstream endpoints in declaration order.  Declaration order is the
    /// final tie-breaker when the selector orders candidates.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the client-facing proxy, e.g. `0.0.0.0:8080`.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Minimum seconds between throttled background writes.
    /// Zero or negative values are clamped to the 30 s default.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    /// Upper bound on how long a dirty config may stay unwritten.  When
    /// exceeded the persister writes even inside the throttle window.
    /// Zero is clamped to the 5 min default.
    #[serde(default = "default_max_dirty_time")]
    pub max_dirty_time_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
            max_dirty_time_secs: default_max_dirty_time(),
        }
    }
}

impl PersistenceConfig {
    /// Flush interval with the zero-clamp applied.
    pub fn flush_interval(&self) -> std::time::Duration {
        let secs = if self.flush_interval_secs == 0 { default_flush_interval() } else { self.flush_interval_secs };
        std::time::Duration::from_secs(secs)
    }

    /// Max dirty time with the zero-clamp applied.
    pub fn max_dirty_time(&self) -> std::time::Duration {
        let secs = if self.max_dirty_time_secs == 0 { default_max_dirty_time() } else { self.max_dirty_time_secs };
        std::time::Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between scheduled health-check rounds.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Consecutive successful health checks required before an inactive
    /// endpoint is marked active again.
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
    /// Consecutive trailing failures inside the ring-buffer window that
    /// mark an endpoint inactive.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Minimum records inside the window before the inactive decision is
    /// considered at all.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            recovery_threshold: default_recovery_threshold(),
            failure_threshold: default_failure_threshold(),
            min_samples: default_min_samples(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// When true, an SSE stream that ends with only a `data: [DONE]`
    /// sentinel (no `finish_reason`, no `response.completed`, no
    /// `message_stop`) is rejected as incomplete.  Off by default: several
    /// OpenAI-compatible gateways terminate with the bare sentinel.
    #[serde(default)]
    pub strict_sse_terminator: bool,
}

/// Which conversion pipeline handles non-native requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMode {
    /// Direct conversion functions only.
    Legacy,
    /// Adapter-registry pipeline only.
    Unified,
    /// Prefer unified; fall back to legacy when the running failure ratio
    /// crosses `failback_threshold`.
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default = "default_conversion_mode")]
    pub mode: ConversionMode,
    /// Failure percentage (1–100) that triggers auto fallback to the
    /// legacy pipeline.  Measured over a sliding window of the last 200
    /// conversion outcomes.
    #[serde(default = "default_failback_threshold")]
    pub failback_threshold: u32,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            mode: default_conversion_mode(),
            failback_threshold: default_failback_threshold(),
        }
    }
}

/// What to do when an upstream error matches a retry rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAction {
    /// Retry the same endpoint up to `max_retries` times.
    RetryEndpoint,
    /// Skip to the next candidate endpoint.
    SwitchEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamErrorRule {
    /// Literal substring matched against the error / response preview.
    pub pattern: String,
    pub action: RetryAction,
    /// Same-endpoint retry budget for `retry_endpoint`.  0 means no retry.
    #[serde(default)]
    pub max_retries: u32,
    /// Match the pattern case-insensitively.
    #[serde(default)]
    pub case_insensitive: bool,
    /// A "safe" error never contributes to blacklisting even when the
    /// action switches endpoints.
    #[serde(default)]
    pub safe: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub upstream_errors: Vec<UpstreamErrorRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggingConfig {
    /// Shared deadline for one tagging round, in seconds.  Taggers that
    /// have not answered by then contribute no tag.
    #[serde(default = "default_pipeline_timeout")]
    pub pipeline_timeout_secs: u64,
    #[serde(default)]
    pub taggers: Vec<TaggerConfig>,
}

impl Default for TaggingConfig {
    fn default() -> Self {
        Self { pipeline_timeout_secs: default_pipeline_timeout(), taggers: Vec::new() }
    }
}

/// One tagger declaration.
///
/// ```yaml
/// taggers:
///   - name: thinking-requests
///     tag: thinking
///     kind: thinking
///   - name: haiku-models
///     tag: background
///     kind: model
///     value: "claude-3-5-haiku*"
///   - name: big-inputs
///     tag: heavy
///     kind: rule
///     rule:
///       any:
///         - { kind: header, key: x-large-request, value: "true" }
///         - { kind: body_json, key: /max_tokens, value: "32000" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggerConfig {
    pub name: String,
    /// The tag contributed when the tagger matches.
    pub tag: String,
    pub kind: TaggerKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Primary match value; meaning depends on `kind` (path prefix, header
    /// value pattern, model wildcard, substring, ...).
    #[serde(default)]
    pub value: Option<String>,
    /// Secondary key; header name, query parameter name, or JSON pointer.
    #[serde(default)]
    pub key: Option<String>,
    /// Declarative rule expression for `kind: rule` taggers.
    #[serde(default)]
    pub rule: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaggerKind {
    Path,
    Header,
    BodyJson,
    Method,
    Query,
    UserMessage,
    Model,
    Thinking,
    /// Data-driven rule expression (`all` / `any` / `not` over the builtin
    /// matchers).  This is the scripted-tagger surface.
    Rule,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Path of the JSON-lines statistics sink.  Unset disables recording.
    #[serde(default)]
    pub path: Option<String>,
}

// ─── Endpoints ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// `x-api-key` plus `Authorization: Bearer`.
    ApiKey,
    /// `Authorization: Bearer` only.
    AuthToken,
    /// Bearer access token with background refresh.
    #[serde(rename = "oauth")]
    OAuth,
    /// Both headers until the effective one is learned.
    #[default]
    Auto,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type", default)]
    pub kind: AuthType,
    /// API key / token value.  Ignored for `oauth`.
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Current access token; rewritten by the refresh watchdog.
    #[serde(default)]
    pub access_token: String,
    /// Unix seconds at which `access_token` expires.
    #[serde(default)]
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// `http://host:port` or `socks5://host:port`.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRule {
    /// Glob with at most one `*` wildcard, e.g. `claude-3-*`.
    pub source_pattern: String,
    pub target_model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRewriteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<RewriteRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OpenAiPreference {
    #[default]
    Auto,
    Responses,
    ChatCompletions,
}

/// How strictly SSE completeness is enforced for this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SseCompleteness {
    /// Any of the accepted terminators ends the stream cleanly.
    #[default]
    Loose,
    /// Require a semantic terminator in addition to `[DONE]`.
    Strict,
}

/// Capability flags discovered from observed upstream behaviour.  These are
/// written back to the config file by the persister so restarts keep what
/// was learned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearnedConfig {
    /// Endpoint natively understands the Codex (`/responses`) wire format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_codex_format: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_responses: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_tokens_support: Option<bool>,
    /// The auth header this upstream actually honours (`x-api-key` or
    /// `authorization`).  Empty until learned.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detected_auth_header: String,
    /// Request parameters the upstream rejects with 400.  Dropped from
    /// subsequent request bodies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsupported_params: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Display name.  The stable id is derived from it, so renaming an
    /// endpoint resets its runtime state on reload.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_anthropic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_openai: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_gemini: Option<String>,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Lower sorts earlier.  Renumbered at runtime by the dynamic sorter.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Restrict to one client type (`claude_code`, `codex`, `gemini`).
    /// Empty serves every client.
    #[serde(default)]
    pub client_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_rewrite: Option<ModelRewriteConfig>,
    /// Extra request headers.  Applied after the built-in headers; a header
    /// here wins except for authentication and content-type.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub headers: std::collections::BTreeMap<String, String>,
    /// JSON-merged into the outgoing body after conversion and rewrite.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Upstream-specific name of the max-tokens field, e.g.
    /// `max_completion_tokens`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_field_name: Option<String>,
    #[serde(default)]
    pub sse_completeness: SseCompleteness,
    #[serde(default)]
    pub openai_preference: OpenAiPreference,
    /// Soft-disable on official-Anthropic rate-limit warnings.
    #[serde(default)]
    pub enhanced_protection: bool,
    #[serde(default = "default_true")]
    pub count_tokens_enabled: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub learned: LearnedConfig,
}

impl Config {
    /// Structural validation beyond what serde enforces.
    ///
    /// Returns every problem found, not just the first, so a config with
    /// several mistakes can be fixed in one pass.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.conversion.failback_threshold < 1 || self.conversion.failback_threshold > 100 {
            problems.push(format!(
                "conversion.failback_threshold must be within [1,100], got {}",
                self.conversion.failback_threshold
            ));
        }

        let mut seen_names = std::collections::HashSet::new();
        for ep in &self.endpoints {
            if !seen_names.insert(ep.name.as_str()) {
                problems.push(format!("duplicate endpoint name: {}", ep.name));
            }
            let has_url = [&ep.url_anthropic, &ep.url_openai, &ep.url_gemini]
                .iter()
                .any(|u| u.as_deref().is_some_and(|s| !s.is_empty()));
            if !has_url {
                problems.push(format!("endpoint {} has no non-empty URL", ep.name));
            }
            if let Some(rw) = &ep.model_rewrite {
                let mut seen_patterns = std::collections::HashSet::new();
                for rule in &rw.rules {
                    if rule.source_pattern.matches('*').count() > 1 {
                        problems.push(format!(
                            "endpoint {}: rewrite pattern {:?} has more than one wildcard",
                            ep.name, rule.source_pattern
                        ));
                    }
                    if !seen_patterns.insert(rule.source_pattern.as_str()) {
                        problems.push(format!(
                            "endpoint {}: duplicate rewrite pattern {:?}",
                            ep.name, rule.source_pattern
                        ));
                    }
                }
            }
            if ep.auth.kind == AuthType::OAuth && ep.auth.oauth.is_none() {
                problems.push(format!("endpoint {}: auth type oauth needs an oauth block", ep.name));
            }
        }

        if problems.is_empty() { Ok(()) } else { Err(problems) }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
