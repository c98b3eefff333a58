// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The endpoint registry: owns every [`Endpoint`], serializes state
//! mutations, and fans out re-sort triggers and learned-field persistence.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use switchboard_config::EndpointConfig;

use crate::endpoint::{stable_id, Endpoint, StatusChange};
use crate::ring::InactiveThresholds;

/// Invoked whenever an endpoint's learned fields change, so the config
/// persister can copy them back and mark the file dirty.
pub type LearnedCallback = Arc<dyn Fn(&Endpoint) + Send + Sync>;

/// Invoked on status transitions; the dynamic sorter listens on this.
pub type ResortTrigger = Arc<dyn Fn() + Send + Sync>;

pub struct EndpointRegistry {
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    thresholds: InactiveThresholds,
    on_learned: Mutex<Option<LearnedCallback>>,
    on_resort: Mutex<Option<ResortTrigger>>,
}

impl EndpointRegistry {
    pub fn new(configs: Vec<EndpointConfig>, thresholds: InactiveThresholds) -> Self {
        let endpoints = configs
            .into_iter()
            .enumerate()
            .map(|(i, c)| Arc::new(Endpoint::new(c, i)))
            .collect();
        Self {
            endpoints: RwLock::new(endpoints),
            thresholds,
            on_learned: Mutex::new(None),
            on_resort: Mutex::new(None),
        }
    }

    pub fn set_learned_callback(&self, cb: LearnedCallback) {
        *self.on_learned.lock().expect("callback lock") = Some(cb);
    }

    pub fn set_resort_trigger(&self, cb: ResortTrigger) {
        *self.on_resort.lock().expect("callback lock") = Some(cb);
    }

    fn notify_learned(&self, ep: &Endpoint) {
        if let Some(cb) = self.on_learned.lock().expect("callback lock").clone() {
            cb(ep);
        }
    }

    fn trigger_resort(&self) {
        if let Some(cb) = self.on_resort.lock().expect("callback lock").clone() {
            cb();
        }
    }

    /// Fire a re-sort for a transition performed directly on an endpoint
    /// (health recovery, admin force update).
    pub fn request_resort(&self) {
        self.trigger_resort();
    }

    fn handle_change(&self, ep: &Endpoint, change: Option<StatusChange>) {
        match change {
            Some(StatusChange::BecameActive) => {
                info!(endpoint = %ep.name, "endpoint recovered");
                self.trigger_resort();
            }
            Some(StatusChange::BecameInactive { reason }) => {
                warn!(endpoint = %ep.name, reason = %reason, "endpoint marked inactive");
                self.trigger_resort();
            }
            None => {}
        }
    }

    // ── Lookups ──────────────────────────────────────────────────────────────

    /// All endpoints in insertion order.  The `Arc`s are cheap clones; the
    /// vector itself is a fresh copy per call.
    pub fn get_all(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.read().expect("endpoints lock").clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .expect("endpoints lock")
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub fn thresholds(&self) -> InactiveThresholds {
        self.thresholds
    }

    // ── State transitions ────────────────────────────────────────────────────

    pub fn mark_active(&self, id: &str) {
        if let Some(ep) = self.get(id) {
            let change = ep.mark_active();
            self.handle_change(&ep, change);
        }
    }

    pub fn mark_inactive_with_reason(&self, id: &str, reason: &str) {
        if let Some(ep) = self.get(id) {
            let change = ep.mark_inactive(reason.to_string());
            self.handle_change(&ep, change);
        }
    }

    pub fn record_request(
        &self,
        id: &str,
        success: bool,
        request_id: &str,
        first_byte: Duration,
        total: Duration,
    ) {
        if let Some(ep) = self.get(id) {
            let change = ep.record_request(success, request_id, first_byte, total, &self.thresholds);
            self.handle_change(&ep, change);
        }
    }

    pub fn update_rate_limit_state(&self, id: &str, reset: Option<i64>, status: Option<String>) {
        if let Some(ep) = self.get(id) {
            debug!(endpoint = %ep.name, ?reset, ?status, "rate limit state updated");
            ep.update_rate_limit(reset, status);
        }
    }

    pub fn should_skip_health_check_until_reset(&self, id: &str) -> bool {
        self.get(id)
            .map(|ep| ep.should_skip_health_check(chrono::Utc::now().timestamp()))
            .unwrap_or(false)
    }

    /// Refresh the endpoint's OAuth access token if it is expired or
    /// inside the skew window.  The refreshed material is persisted.
    pub async fn refresh_oauth_token(&self, id: &str, client: &reqwest::Client) -> anyhow::Result<()> {
        let ep = self.get(id).with_context(|| format!("unknown endpoint {id}"))?;
        crate::oauth::ensure_fresh_token(&ep, client, &|e: &Endpoint| self.persist_endpoint(e))
            .await
            .map(|_| ())
    }

    // ── Learning ─────────────────────────────────────────────────────────────

    pub fn learn_unsupported_param(&self, id: &str, name: &str) {
        if let Some(ep) = self.get(id) {
            if ep.learn_unsupported_param(name) {
                info!(endpoint = %ep.name, param = %name, "learned unsupported parameter");
                self.notify_learned(&ep);
            }
        }
    }

    pub fn mark_count_tokens_support(&self, id: &str, supported: bool) {
        if let Some(ep) = self.get(id) {
            if ep.set_count_tokens_support(supported) {
                self.notify_learned(&ep);
            }
        }
    }

    pub fn update_supports_responses(&self, id: &str, supported: bool) {
        if let Some(ep) = self.get(id) {
            if ep.set_supports_responses(supported) {
                info!(endpoint = %ep.name, supported, "learned /responses support");
                self.notify_learned(&ep);
            }
        }
    }

    pub fn update_native_codex_support(&self, id: &str, native: bool) {
        if let Some(ep) = self.get(id) {
            if ep.set_native_codex_format(native) {
                self.notify_learned(&ep);
            }
        }
    }

    pub fn update_detected_auth_header(&self, id: &str, header: &str) {
        if let Some(ep) = self.get(id) {
            if ep.set_detected_auth_header(header) {
                info!(endpoint = %ep.name, header = %header, "learned effective auth header");
                self.notify_learned(&ep);
            }
        }
    }

    /// Push this endpoint's learned fields through the persistence
    /// callback (admin hook, OAuth token refresh).
    pub fn persist_endpoint(&self, ep: &Endpoint) {
        self.notify_learned(ep);
    }

    /// Admin reset: clear learned state and reactivate.
    pub fn reset_endpoint(&self, id: &str) {
        if let Some(ep) = self.get(id) {
            ep.reset_learned();
            let change = ep.mark_active();
            self.handle_change(&ep, change);
            self.notify_learned(&ep);
        }
    }

    // ── Hot reload ───────────────────────────────────────────────────────────

    /// Rebuild endpoints from a reloaded config.  Runtime state survives
    /// for entries whose name (and therefore stable id) is unchanged.
    pub fn apply_config(&self, configs: Vec<EndpointConfig>) {
        let old = self.get_all();
        let new: Vec<Arc<Endpoint>> = configs
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                let ep = Arc::new(Endpoint::new(c, i));
                if let Some(prev) = old.iter().find(|o| o.id == stable_id(&ep.name)) {
                    ep.adopt_runtime_from(prev);
                }
                ep
            })
            .collect();
        *self.endpoints.write().expect("endpoints lock") = new;
        self.trigger_resort();
        info!("endpoint registry reloaded");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_with(names: &[&str]) -> EndpointRegistry {
        let configs = names
            .iter()
            .map(|n| {
                serde_yaml::from_str(&format!("name: {n}\nurl_openai: https://api.example.com\n"))
                    .unwrap()
            })
            .collect();
        EndpointRegistry::new(configs, InactiveThresholds { failure_threshold: 2, min_samples: 2 })
    }

    #[test]
    fn get_all_returns_fresh_vec() {
        let reg = registry_with(&["a", "b"]);
        let mut all = reg.get_all();
        all.clear();
        assert_eq!(reg.get_all().len(), 2);
    }

    #[test]
    fn record_request_trips_and_triggers_resort() {
        let reg = registry_with(&["a"]);
        let triggers = Arc::new(AtomicUsize::new(0));
        let t = triggers.clone();
        reg.set_resort_trigger(Arc::new(move || {
            t.fetch_add(1, Ordering::SeqCst);
        }));
        let id = reg.get_all()[0].id.clone();
        reg.record_request(&id, false, "r1", Duration::ZERO, Duration::ZERO);
        reg.record_request(&id, false, "r2", Duration::ZERO, Duration::ZERO);
        assert_eq!(triggers.load(Ordering::SeqCst), 1, "inactive transition fires one resort");
        reg.record_request(&id, true, "r3", Duration::ZERO, Duration::from_millis(5));
        assert_eq!(triggers.load(Ordering::SeqCst), 2, "recovery fires another");
    }

    #[test]
    fn learned_updates_invoke_callback_once_per_change() {
        let reg = registry_with(&["a"]);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        reg.set_learned_callback(Arc::new(move |_: &Endpoint| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let id = reg.get_all()[0].id.clone();
        reg.update_supports_responses(&id, false);
        reg.update_supports_responses(&id, false);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no-op updates stay silent");
        reg.learn_unsupported_param(&id, "logprobs");
        reg.learn_unsupported_param(&id, "logprobs");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn apply_config_preserves_state_by_name() {
        let reg = registry_with(&["keep", "drop"]);
        let keep_id = reg.get_all()[0].id.clone();
        reg.record_request(&keep_id, true, "r", Duration::ZERO, Duration::from_millis(7));
        reg.mark_inactive_with_reason(&keep_id, "manual");

        let new_configs: Vec<EndpointConfig> = ["keep", "added"]
            .iter()
            .map(|n| {
                serde_yaml::from_str(&format!("name: {n}\nurl_openai: https://api.example.com\n"))
                    .unwrap()
            })
            .collect();
        reg.apply_config(new_configs);

        let all = reg.get_all();
        assert_eq!(all.len(), 2);
        let kept = all.iter().find(|e| e.name == "keep").unwrap();
        assert_eq!(kept.counters().0, 1, "counters survive reload");
        assert_eq!(kept.blacklist_reason().as_deref(), Some("manual"));
        let added = all.iter().find(|e| e.name == "added").unwrap();
        assert_eq!(added.counters().0, 0);
    }

    #[test]
    fn unknown_id_operations_are_noops() {
        let reg = registry_with(&["a"]);
        reg.mark_active("ep-nonexistent");
        reg.record_request("ep-nonexistent", true, "r", Duration::ZERO, Duration::ZERO);
        assert!(!reg.should_skip_health_check_until_reset("ep-nonexistent"));
    }
}
