// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! One upstream endpoint: static configuration plus volatile runtime state.
//!
//! # Locking
//! All hot-path state lives under a single RW lock; the blacklist reason
//! and learned capability fields have their own mutexes so learner updates
//! never contend with request recording.  Lock order is endpoint state →
//! blacklist, never the reverse.  Callers that release and reacquire must
//! not assume state is unchanged in between.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use switchboard_config::{AuthType, EndpointConfig, LearnedConfig, OAuthConfig};
use switchboard_wire::{convert, Dialect};

use crate::ring::{InactiveThresholds, RequestRecord, RequestRing};

/// How often a rate-limit skip may be logged, per endpoint.
const SKIP_LOG_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Active,
    Inactive,
    Checking,
    Recovering,
    Degraded,
    Blacklisted,
}

impl EndpointStatus {
    /// Selector ordering class: lower sorts earlier.
    pub fn rank(&self) -> u8 {
        match self {
            EndpointStatus::Active => 0,
            EndpointStatus::Recovering => 1,
            EndpointStatus::Degraded => 2,
            EndpointStatus::Checking => 2,
            EndpointStatus::Inactive => 3,
            EndpointStatus::Blacklisted => 4,
        }
    }
}

/// A status transition observed while recording an outcome.  The registry
/// turns these into re-sort triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    BecameActive,
    BecameInactive { reason: String },
}

#[derive(Debug)]
struct Volatile {
    status: EndpointStatus,
    current_priority: u32,
    last_check: Option<DateTime<Utc>>,
    failure_count: u32,
    successive_successes: u32,
    total_requests: u64,
    success_requests: u64,
    last_failure: Option<DateTime<Utc>>,
    ring: RequestRing,
    rate_limit_reset: Option<i64>,
    rate_limit_status: Option<String>,
    last_response_time: Duration,
    last_first_byte: Duration,
    /// Consecutive successful health checks while recovering.
    health_successes: u32,
    last_skip_log: Option<Instant>,
}

#[derive(Debug, Default, Clone)]
struct Learned {
    native_codex_format: Option<bool>,
    supports_responses: Option<bool>,
    detected_auth_header: String,
    unsupported_params: BTreeSet<String>,
}

pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub config: EndpointConfig,
    /// Declaration order in the config file; final selector tie-breaker.
    pub insertion_index: usize,
    enabled: AtomicBool,
    state: RwLock<Volatile>,
    blacklist_reason: Mutex<Option<String>>,
    learned: Mutex<Learned>,
    count_tokens_support: Mutex<Option<bool>>,
    oauth: tokio::sync::Mutex<Option<OAuthConfig>>,
}

/// Stable id derived from the endpoint name; survives reloads as long as
/// the name does.
pub fn stable_id(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    format!("ep-{}", &hex::encode(digest)[..12])
}

/// Key used by the external statistics store.
pub fn stats_key(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    format!("ep-name-{}", hex::encode(digest))
}

impl Endpoint {
    pub fn new(config: EndpointConfig, insertion_index: usize) -> Self {
        let learned = Learned {
            native_codex_format: config.learned.native_codex_format,
            supports_responses: config.learned.supports_responses,
            detected_auth_header: config.learned.detected_auth_header.clone(),
            unsupported_params: config.learned.unsupported_params.iter().cloned().collect(),
        };
        let count_tokens = config.learned.count_tokens_support;
        let oauth = config.auth.oauth.clone();
        Self {
            id: stable_id(&config.name),
            name: config.name.clone(),
            insertion_index,
            enabled: AtomicBool::new(config.enabled),
            state: RwLock::new(Volatile {
                status: if config.enabled { EndpointStatus::Active } else { EndpointStatus::Inactive },
                current_priority: config.priority,
                last_check: None,
                failure_count: 0,
                successive_successes: 0,
                total_requests: 0,
                success_requests: 0,
                last_failure: None,
                ring: RequestRing::default(),
                rate_limit_reset: None,
                rate_limit_status: None,
                last_response_time: Duration::ZERO,
                last_first_byte: Duration::ZERO,
                health_successes: 0,
                last_skip_log: None,
            }),
            blacklist_reason: Mutex::new(None),
            learned: Mutex::new(learned),
            count_tokens_support: Mutex::new(count_tokens),
            oauth: tokio::sync::Mutex::new(oauth),
            config,
        }
    }

    // ── Static lookups ────────────────────────────────────────────────────────

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Deep copy of the tag set.
    pub fn tags(&self) -> Vec<String> {
        self.config.tags.clone()
    }

    /// Deep copy of the header overrides.
    pub fn header_overrides(&self) -> BTreeMap<String, String> {
        self.config.headers.clone()
    }

    pub fn base_url(&self, dialect: Dialect) -> Option<&str> {
        let url = match dialect {
            Dialect::Anthropic => self.config.url_anthropic.as_deref(),
            Dialect::OpenaiChat | Dialect::OpenaiResponses => self.config.url_openai.as_deref(),
            Dialect::Gemini => self.config.url_gemini.as_deref(),
            Dialect::Unknown => None,
        };
        url.filter(|u| !u.is_empty())
    }

    /// The dialect this endpoint would serve a request in, preferring the
    /// client's own format when a URL for it exists.
    pub fn native_dialect_for(&self, requested: Dialect) -> Option<Dialect> {
        if self.base_url(requested).is_some() {
            match requested {
                // A `/responses` request needs the endpoint to actually
                // support the Responses API, not just have an OpenAI URL.
                Dialect::OpenaiResponses if self.supports_responses() == Some(false) => {}
                _ => return Some(requested),
            }
        }
        None
    }

    /// Upstream dialect chosen for a request, or `None` when no conversion
    /// path reaches any configured URL.
    pub fn upstream_dialect_for(&self, requested: Dialect) -> Option<Dialect> {
        if let Some(native) = self.native_dialect_for(requested) {
            return Some(native);
        }
        for candidate in [
            Dialect::Anthropic,
            Dialect::OpenaiChat,
            Dialect::OpenaiResponses,
            Dialect::Gemini,
        ] {
            if candidate == Dialect::OpenaiResponses && self.supports_responses() == Some(false) {
                continue;
            }
            if self.base_url(candidate).is_some() && convert::convertible(requested, candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub fn is_official_anthropic(&self) -> bool {
        self.config
            .url_anthropic
            .as_deref()
            .is_some_and(|u| u.trim_end_matches('/') == "https://api.anthropic.com")
    }

    // ── Volatile state ────────────────────────────────────────────────────────

    pub fn status(&self) -> EndpointStatus {
        self.state.read().expect("state lock").status
    }

    pub fn current_priority(&self) -> u32 {
        self.state.read().expect("state lock").current_priority
    }

    pub fn set_current_priority(&self, priority: u32) {
        self.state.write().expect("state lock").current_priority = priority;
    }

    pub fn success_rate(&self) -> f64 {
        let state = self.state.read().expect("state lock");
        if state.total_requests == 0 {
            // No data yet: sort as fully healthy rather than burying new
            // endpoints at the bottom.
            return 1.0;
        }
        state.success_requests as f64 / state.total_requests as f64
    }

    /// Last observed total response time; zero means unknown.
    pub fn last_response_time(&self) -> Duration {
        self.state.read().expect("state lock").last_response_time
    }

    pub fn counters(&self) -> (u64, u64) {
        let state = self.state.read().expect("state lock");
        (state.total_requests, state.success_requests)
    }

    pub fn failure_counters(&self) -> (u32, u32) {
        let state = self.state.read().expect("state lock");
        (state.failure_count, state.successive_successes)
    }

    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        self.state.read().expect("state lock").last_failure
    }

    pub fn blacklist_reason(&self) -> Option<String> {
        self.blacklist_reason.lock().expect("blacklist lock").clone()
    }

    pub fn mark_active(&self) -> Option<StatusChange> {
        let mut state = self.state.write().expect("state lock");
        let was = state.status;
        state.status = EndpointStatus::Active;
        state.health_successes = 0;
        drop(state);
        // Clearing a non-blacklisted status also clears the reason.
        *self.blacklist_reason.lock().expect("blacklist lock") = None;
        (was != EndpointStatus::Active).then_some(StatusChange::BecameActive)
    }

    pub fn mark_inactive(&self, reason: String) -> Option<StatusChange> {
        let mut state = self.state.write().expect("state lock");
        let was = state.status;
        state.status = EndpointStatus::Inactive;
        drop(state);
        *self.blacklist_reason.lock().expect("blacklist lock") = Some(reason.clone());
        (was != EndpointStatus::Inactive).then_some(StatusChange::BecameInactive { reason })
    }

    pub fn set_status(&self, status: EndpointStatus) {
        let mut state = self.state.write().expect("state lock");
        state.status = status;
        state.last_check = Some(Utc::now());
        drop(state);
        if status != EndpointStatus::Blacklisted && status != EndpointStatus::Inactive {
            *self.blacklist_reason.lock().expect("blacklist lock") = None;
        }
    }

    /// Record one request outcome.
    ///
    /// Exactly one of `failure_count` / `successive_successes` is
    /// incremented; the other resets to zero.  When the ring buffer trips
    /// the inactive rule, the endpoint transitions and the recent failure
    /// ids become the blacklist reason.
    pub fn record_request(
        &self,
        success: bool,
        request_id: &str,
        first_byte: Duration,
        total: Duration,
        thresholds: &InactiveThresholds,
    ) -> Option<StatusChange> {
        let now = Utc::now();
        let mut state = self.state.write().expect("state lock");
        state.total_requests += 1;
        if success {
            state.success_requests += 1;
            state.successive_successes += 1;
            state.failure_count = 0;
        } else {
            state.failure_count += 1;
            state.successive_successes = 0;
            state.last_failure = Some(now);
        }
        if total > Duration::ZERO {
            state.last_response_time = total;
        }
        if first_byte > Duration::ZERO {
            state.last_first_byte = first_byte;
        }
        state.ring.push(RequestRecord {
            timestamp: now,
            success,
            request_id: request_id.to_string(),
            first_byte_time: first_byte,
            response_time: total,
        });

        let was = state.status;
        if success {
            if was == EndpointStatus::Inactive || was == EndpointStatus::Recovering {
                state.status = EndpointStatus::Active;
                drop(state);
                *self.blacklist_reason.lock().expect("blacklist lock") = None;
                return Some(StatusChange::BecameActive);
            }
            return None;
        }

        if was == EndpointStatus::Active && state.ring.should_mark_inactive(now, thresholds) {
            state.status = EndpointStatus::Inactive;
            let failure_ids = state.ring.recent_failure_ids(now);
            drop(state);
            let reason = format!("request failures: {}", failure_ids.join(", "));
            *self.blacklist_reason.lock().expect("blacklist lock") = Some(reason.clone());
            return Some(StatusChange::BecameInactive { reason });
        }
        None
    }

    // ── Rate limiting ─────────────────────────────────────────────────────────

    pub fn update_rate_limit(&self, reset: Option<i64>, status: Option<String>) {
        let mut state = self.state.write().expect("state lock");
        state.rate_limit_reset = reset;
        state.rate_limit_status = status;
    }

    pub fn rate_limit(&self) -> (Option<i64>, Option<String>) {
        let state = self.state.read().expect("state lock");
        (state.rate_limit_reset, state.rate_limit_status.clone())
    }

    /// True while the advertised reset timestamp is still in the future.
    pub fn should_skip_health_check(&self, now_epoch: i64) -> bool {
        let state = self.state.read().expect("state lock");
        state.rate_limit_reset.is_some_and(|reset| reset > now_epoch)
    }

    /// Rate-limit skip logging is throttled to once per five minutes per
    /// endpoint; returns whether this skip should be logged.
    pub fn should_log_skip(&self) -> bool {
        let mut state = self.state.write().expect("state lock");
        let now = Instant::now();
        match state.last_skip_log {
            Some(prev) if now.duration_since(prev) < SKIP_LOG_INTERVAL => false,
            _ => {
                state.last_skip_log = Some(now);
                true
            }
        }
    }

    // ── Health checking ───────────────────────────────────────────────────────

    pub fn record_health_success(&self, recovery_threshold: u32) -> Option<StatusChange> {
        let mut state = self.state.write().expect("state lock");
        state.last_check = Some(Utc::now());
        state.health_successes += 1;
        if state.health_successes >= recovery_threshold {
            let was = state.status;
            state.status = EndpointStatus::Active;
            state.health_successes = 0;
            drop(state);
            *self.blacklist_reason.lock().expect("blacklist lock") = None;
            return (was != EndpointStatus::Active).then_some(StatusChange::BecameActive);
        }
        state.status = EndpointStatus::Recovering;
        None
    }

    pub fn record_health_failure(&self) {
        let mut state = self.state.write().expect("state lock");
        state.last_check = Some(Utc::now());
        state.health_successes = 0;
        if state.status != EndpointStatus::Blacklisted {
            state.status = EndpointStatus::Inactive;
        }
    }

    // ── Learned capabilities ──────────────────────────────────────────────────

    pub fn supports_responses(&self) -> Option<bool> {
        self.learned.lock().expect("learned lock").supports_responses
    }

    /// Returns true when the value actually changed.
    pub fn set_supports_responses(&self, supported: bool) -> bool {
        let mut learned = self.learned.lock().expect("learned lock");
        let changed = learned.supports_responses != Some(supported);
        learned.supports_responses = Some(supported);
        changed
    }

    pub fn native_codex_format(&self) -> Option<bool> {
        self.learned.lock().expect("learned lock").native_codex_format
    }

    pub fn set_native_codex_format(&self, native: bool) -> bool {
        let mut learned = self.learned.lock().expect("learned lock");
        let changed = learned.native_codex_format != Some(native);
        learned.native_codex_format = Some(native);
        changed
    }

    pub fn count_tokens_support(&self) -> Option<bool> {
        *self.count_tokens_support.lock().expect("count_tokens lock")
    }

    pub fn set_count_tokens_support(&self, supported: bool) -> bool {
        let mut guard = self.count_tokens_support.lock().expect("count_tokens lock");
        let changed = *guard != Some(supported);
        *guard = Some(supported);
        changed
    }

    pub fn detected_auth_header(&self) -> String {
        self.learned.lock().expect("learned lock").detected_auth_header.clone()
    }

    pub fn set_detected_auth_header(&self, header: &str) -> bool {
        let mut learned = self.learned.lock().expect("learned lock");
        let changed = learned.detected_auth_header != header;
        learned.detected_auth_header = header.to_string();
        changed
    }

    /// Deep copy of the learned unsupported parameter set.
    pub fn unsupported_params(&self) -> BTreeSet<String> {
        self.learned.lock().expect("learned lock").unsupported_params.clone()
    }

    /// Returns true when the parameter is new.
    pub fn learn_unsupported_param(&self, name: &str) -> bool {
        self.learned
            .lock()
            .expect("learned lock")
            .unsupported_params
            .insert(name.to_string())
    }

    /// Admin reset of every learned field.
    pub fn reset_learned(&self) {
        *self.learned.lock().expect("learned lock") = Learned::default();
        *self.count_tokens_support.lock().expect("count_tokens lock") = None;
    }

    /// Snapshot of learned fields in config form, for the persister.
    pub fn learned_snapshot(&self) -> LearnedConfig {
        let learned = self.learned.lock().expect("learned lock");
        LearnedConfig {
            native_codex_format: learned.native_codex_format,
            supports_responses: learned.supports_responses,
            count_tokens_support: *self.count_tokens_support.lock().expect("count_tokens lock"),
            detected_auth_header: learned.detected_auth_header.clone(),
            unsupported_params: learned.unsupported_params.iter().cloned().collect(),
        }
    }

    // ── OAuth ────────────────────────────────────────────────────────────────

    pub fn auth_type(&self) -> AuthType {
        self.config.auth.kind
    }

    pub(crate) fn oauth_material(&self) -> &tokio::sync::Mutex<Option<OAuthConfig>> {
        &self.oauth
    }

    /// Best-effort copy of the current OAuth material for persistence.
    /// Returns `None` when a refresh holds the lock; the next persistence
    /// pass picks the token up.
    pub fn oauth_snapshot(&self) -> Option<OAuthConfig> {
        self.oauth.try_lock().ok().and_then(|m| m.clone())
    }

    // ── Hot reload ───────────────────────────────────────────────────────────

    /// Carry volatile and learned state over from the previous incarnation
    /// of this endpoint (same stable id) across a config reload.
    pub fn adopt_runtime_from(&self, old: &Endpoint) {
        {
            let old_state = old.state.read().expect("state lock");
            let mut state = self.state.write().expect("state lock");
            state.status = old_state.status;
            state.failure_count = old_state.failure_count;
            state.successive_successes = old_state.successive_successes;
            state.total_requests = old_state.total_requests;
            state.success_requests = old_state.success_requests;
            state.last_failure = old_state.last_failure;
            state.ring = old_state.ring.clone();
            state.rate_limit_reset = old_state.rate_limit_reset;
            state.rate_limit_status = old_state.rate_limit_status.clone();
            state.last_response_time = old_state.last_response_time;
            state.last_first_byte = old_state.last_first_byte;
        }
        *self.blacklist_reason.lock().expect("blacklist lock") =
            old.blacklist_reason.lock().expect("blacklist lock").clone();
        *self.learned.lock().expect("learned lock") = old.learned.lock().expect("learned lock").clone();
        *self.count_tokens_support.lock().expect("count_tokens lock") =
            *old.count_tokens_support.lock().expect("count_tokens lock");
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
