// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The learner: turns every observed outcome into endpoint state.
//!
//! Runs after validation on each attempt.  Updates the ring buffer and
//! counters, learns capability flags from characteristic failures, tracks
//! Anthropic rate-limit headers, and soft-disables protected official
//! endpoints on `allowed_warning`.  Learned-field changes reach the config
//! persister through the registry's learned callback.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use switchboard_endpoint::{Endpoint, EndpointRegistry};
use switchboard_wire::Dialect;

use crate::error::{ErrorKind, ProxyError};
use crate::stats::StatsSink;

/// Everything the learner needs to know about one attempt.
pub struct AttemptReport {
    pub request_id: String,
    pub upstream: Dialect,
    /// Canonical upstream path kind, for the `/responses` learning rules.
    pub was_responses_call: bool,
    pub was_count_tokens_call: bool,
    pub status: u16,
    /// Top-level keys of the body that was sent, for 400-param learning.
    pub sent_params: Vec<String>,
    /// Anthropic rate-limit headers, when present.
    pub ratelimit_reset: Option<i64>,
    pub ratelimit_status: Option<String>,
    /// A matched retry rule declared this failure safe: the dispatcher
    /// may still switch endpoints, but the outcome never counts against
    /// the endpoint's ring buffer.
    pub safe_error: bool,
    pub first_byte: Duration,
    pub total: Duration,
}

pub struct Learner {
    registry: Arc<EndpointRegistry>,
    stats: Arc<dyn StatsSink>,
}

impl Learner {
    pub fn new(registry: Arc<EndpointRegistry>, stats: Arc<dyn StatsSink>) -> Self {
        Self { registry, stats }
    }

    /// Record one attempt outcome and learn from it.
    pub fn after_attempt(
        &self,
        ep: &Endpoint,
        report: &AttemptReport,
        outcome: Result<(), &ProxyError>,
    ) {
        // Business and client-validation errors leave the endpoint
        // healthy, as does any error a retry rule marked safe.
        let endpoint_success = match outcome {
            Ok(()) => true,
            Err(e) => report.safe_error || !e.counts_against_endpoint(),
        };

        self.registry.record_request(
            &ep.id,
            endpoint_success,
            &report.request_id,
            report.first_byte,
            report.total,
        );
        self.stats.record(&ep.name, endpoint_success, ep.last_failure());

        // ── Capability learning ──────────────────────────────────────────────
        if report.was_responses_call {
            match outcome {
                Ok(()) => {
                    self.registry.update_supports_responses(&ep.id, true);
                    self.registry.update_native_codex_support(&ep.id, true);
                }
                Err(_) if report.status == 404 => {
                    info!(endpoint = %ep.name, "/responses returned 404, preferring /chat/completions");
                    self.registry.update_supports_responses(&ep.id, false);
                }
                Err(_) => {}
            }
        }

        if report.was_count_tokens_call {
            match outcome {
                Ok(()) => self.registry.mark_count_tokens_support(&ep.id, true),
                Err(_) if report.status == 404 => {
                    self.registry.mark_count_tokens_support(&ep.id, false)
                }
                Err(_) => {}
            }
        }

        if let Err(e) = outcome {
            self.learn_from_error(ep, report, e);
        }

        // ── Rate limiting ────────────────────────────────────────────────────
        if report.ratelimit_reset.is_some() || report.ratelimit_status.is_some() {
            self.registry.update_rate_limit_state(
                &ep.id,
                report.ratelimit_reset,
                report.ratelimit_status.clone(),
            );
            if ep.config.enhanced_protection
                && ep.is_official_anthropic()
                && report.ratelimit_status.as_deref() == Some("allowed_warning")
            {
                warn!(endpoint = %ep.name, "rate-limit warning on protected endpoint, soft-disabling");
                self.registry
                    .mark_inactive_with_reason(&ep.id, "rate limit warning (enhanced protection)");
            }
        }
    }

    fn learn_from_error(&self, ep: &Endpoint, report: &AttemptReport, error: &ProxyError) {
        let preview = error.preview().to_ascii_lowercase();

        // 400 naming one of the parameters we sent: that parameter is
        // unsupported on this endpoint.
        if report.status == 400 && error.kind() == ErrorKind::Business {
            for param in &report.sent_params {
                // Core request fields are never "unsupported"; a 400 naming
                // them means the value was bad, not the parameter.
                if matches!(param.as_str(), "model" | "messages" | "input" | "contents") {
                    continue;
                }
                if preview.contains(&param.to_ascii_lowercase()) {
                    self.registry.learn_unsupported_param(&ep.id, param);
                }
            }
        }

        // 401 bodies that name the expected auth header teach us which one
        // this upstream honours.
        if report.status == 401 {
            if preview.contains("x-api-key") {
                self.registry.update_detected_auth_header(&ep.id, "x-api-key");
            } else if preview.contains("authorization") || preview.contains("bearer") {
                self.registry.update_detected_auth_header(&ep.id, "authorization");
            }
        }
    }
}

/// Pull Anthropic rate-limit headers out of an upstream response.
pub fn ratelimit_from_headers(headers: &reqwest::header::HeaderMap) -> (Option<i64>, Option<String>) {
    let reset = headers
        .get("anthropic-ratelimit-unified-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());
    let status = headers
        .get("anthropic-ratelimit-unified-status")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (reset, status)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
