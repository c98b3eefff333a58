// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Candidate selection: filter by client type, tag bucket, activity, and
//! capability, then order for dispatch.

use std::sync::Arc;

use tracing::debug;

use switchboard_endpoint::{Endpoint, EndpointStatus};
use switchboard_wire::{DetectionResult, Dialect};

/// Filter and order the endpoints a request may be dispatched to.  The
/// first candidate is used; the rest stay in line for fail-over.
pub fn select_candidates(
    endpoints: &[Arc<Endpoint>],
    tags: &[String],
    detection: &DetectionResult,
) -> Vec<Arc<Endpoint>> {
    let mut candidates: Vec<Arc<Endpoint>> = endpoints
        .iter()
        // 1. Client-type restriction; empty restriction is universal.
        .filter(|e| detection.client.matches_restriction(&e.config.client_type))
        // 2. Strict tag buckets: tagged requests need a shared tag,
        //    untagged requests only see untagged endpoints.
        .filter(|e| {
            if tags.is_empty() {
                e.config.tags.is_empty()
            } else {
                e.config.tags.iter().any(|t| tags.contains(t))
            }
        })
        // 3. Activity.
        .filter(|e| e.enabled() && e.status() != EndpointStatus::Blacklisted)
        // 4. Capability: some conversion path must reach a configured URL.
        .filter(|e| {
            detection.format == Dialect::Unknown
                || e.upstream_dialect_for(detection.format).is_some()
        })
        .cloned()
        .collect();

    // Stable sort; insertion order is the final tie-breaker by stability.
    let native = |e: &Endpoint| e.native_dialect_for(detection.format).is_some();
    let lat = |e: &Endpoint| {
        let t = e.last_response_time();
        if t.is_zero() { u128::MAX } else { t.as_millis() }
    };
    candidates.sort_by(|a, b| {
        let (a, b) = (a.as_ref(), b.as_ref());
        native(b)
            .cmp(&native(a))
            .then_with(|| a.current_priority().cmp(&b.current_priority()))
            .then_with(|| a.status().rank().cmp(&b.status().rank()))
            .then_with(|| lat(a).cmp(&lat(b)))
            .then_with(|| a.insertion_index.cmp(&b.insertion_index))
    });

    debug!(
        format = detection.format.as_str(),
        client = detection.client.as_str(),
        candidates = candidates.len(),
        "selection complete"
    );
    candidates
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switchboard_config::EndpointConfig;
    use switchboard_endpoint::InactiveThresholds;
    use switchboard_wire::ClientKind;

    fn ep(yaml: &str, index: usize) -> Arc<Endpoint> {
        let config: EndpointConfig = serde_yaml::from_str(yaml).unwrap();
        Arc::new(Endpoint::new(config, index))
    }

    fn anthropic_detection() -> DetectionResult {
        DetectionResult {
            format: Dialect::Anthropic,
            client: ClientKind::ClaudeCode,
            confidence: 0.95,
            detected_by: "path",
        }
    }

    #[test]
    fn client_type_restriction_filters() {
        let eps = vec![
            ep("name: universal\nurl_anthropic: https://a.example.com\n", 0),
            ep("name: codex-only\nclient_type: codex\nurl_anthropic: https://b.example.com\n", 1),
        ];
        let picked = select_candidates(&eps, &[], &anthropic_detection());
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "universal");
    }

    #[test]
    fn tag_buckets_are_strict_both_ways() {
        let eps = vec![
            ep("name: untagged\nurl_anthropic: https://a.example.com\n", 0),
            ep("name: tagged\ntags: [thinking]\nurl_anthropic: https://b.example.com\n", 1),
        ];
        let untagged = select_candidates(&eps, &[], &anthropic_detection());
        assert_eq!(untagged.len(), 1);
        assert_eq!(untagged[0].name, "untagged");

        let tagged = select_candidates(&eps, &["thinking".to_string()], &anthropic_detection());
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].name, "tagged");
    }

    #[test]
    fn blacklisted_and_disabled_are_dropped() {
        let eps = vec![
            ep("name: ok\nurl_anthropic: https://a.example.com\n", 0),
            ep("name: off\nurl_anthropic: https://b.example.com\n", 1),
            ep("name: listed\nurl_anthropic: https://c.example.com\n", 2),
        ];
        eps[1].set_enabled(false);
        eps[2].set_status(EndpointStatus::Blacklisted);
        let picked = select_candidates(&eps, &[], &anthropic_detection());
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "ok");
    }

    #[test]
    fn capability_filter_rejects_unreachable_formats() {
        // Chat request, but the endpoint only speaks Gemini: no pair exists.
        let eps = vec![ep("name: g\nurl_gemini: https://g.example.com\n", 0)];
        let det = DetectionResult {
            format: Dialect::OpenaiChat,
            client: ClientKind::Unknown,
            confidence: 0.95,
            detected_by: "path",
        };
        assert!(select_candidates(&eps, &[], &det).is_empty());
        // The same endpoint can serve Anthropic via conversion.
        assert_eq!(select_candidates(&eps, &[], &anthropic_detection()).len(), 1);
    }

    #[test]
    fn native_format_endpoints_sort_first() {
        let eps = vec![
            ep("name: convert\npriority: 1\nurl_openai: https://o.example.com\n", 0),
            ep("name: native\npriority: 9\nurl_anthropic: https://a.example.com\n", 1),
        ];
        let picked = select_candidates(&eps, &[], &anthropic_detection());
        assert_eq!(picked[0].name, "native", "native beats better priority");
        assert_eq!(picked[1].name, "convert");
    }

    #[test]
    fn priority_orders_within_native_class() {
        let eps = vec![
            ep("name: second\npriority: 5\nurl_anthropic: https://a.example.com\n", 0),
            ep("name: first\npriority: 1\nurl_anthropic: https://b.example.com\n", 1),
        ];
        for (i, e) in eps.iter().enumerate() {
            let _ = i;
            e.set_current_priority(e.config.priority);
        }
        let picked = select_candidates(&eps, &[], &anthropic_detection());
        assert_eq!(picked[0].name, "first");
    }

    #[test]
    fn status_class_breaks_priority_ties() {
        let eps = vec![
            ep("name: degraded\npriority: 1\nurl_anthropic: https://a.example.com\n", 0),
            ep("name: active\npriority: 1\nurl_anthropic: https://b.example.com\n", 1),
        ];
        eps[0].set_status(EndpointStatus::Degraded);
        let picked = select_candidates(&eps, &[], &anthropic_detection());
        assert_eq!(picked[0].name, "active");
    }

    #[test]
    fn measured_latency_breaks_remaining_ties() {
        let eps = vec![
            ep("name: slow\npriority: 1\nurl_anthropic: https://a.example.com\n", 0),
            ep("name: fast\npriority: 1\nurl_anthropic: https://b.example.com\n", 1),
        ];
        let t = InactiveThresholds::default();
        eps[0].record_request(true, "r", Duration::ZERO, Duration::from_millis(800), &t);
        eps[1].record_request(true, "r", Duration::ZERO, Duration::from_millis(30), &t);
        let picked = select_candidates(&eps, &[], &anthropic_detection());
        assert_eq!(picked[0].name, "fast");
    }

    #[test]
    fn insertion_order_is_final_tiebreak() {
        let eps = vec![
            ep("name: earlier\npriority: 1\nurl_anthropic: https://a.example.com\n", 0),
            ep("name: later\npriority: 1\nurl_anthropic: https://b.example.com\n", 1),
        ];
        let picked = select_candidates(&eps, &[], &anthropic_detection());
        assert_eq!(picked[0].name, "earlier");
    }
}
