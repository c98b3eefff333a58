// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Background health checker.
//!
//! Probes non-active endpoints on a fixed cadence.  An endpoint under an
//! advertised rate-limit reset is skipped until the reset passes, with the
//! skip logged at most once per five minutes per endpoint.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use switchboard_config::HealthConfig;
use switchboard_wire::Dialect;

use crate::endpoint::{Endpoint, EndpointStatus};
use crate::registry::EndpointRegistry;

pub struct HealthChecker {
    registry: Arc<EndpointRegistry>,
    config: HealthConfig,
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(registry: Arc<EndpointRegistry>, config: HealthConfig, client: reqwest::Client) -> Self {
        Self { registry, config, client }
    }

    pub async fn run(self) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check_round().await;
        }
    }

    async fn check_round(&self) {
        let now_epoch = chrono::Utc::now().timestamp();
        for ep in self.registry.get_all() {
            if !ep.enabled() {
                continue;
            }
            match ep.status() {
                EndpointStatus::Active | EndpointStatus::Blacklisted => continue,
                _ => {}
            }
            if ep.should_skip_health_check(now_epoch) {
                if ep.should_log_skip() {
                    let (reset, status) = ep.rate_limit();
                    info!(
                        endpoint = %ep.name,
                        reset = reset.unwrap_or(0),
                        status = status.as_deref().unwrap_or(""),
                        "health check skipped until rate limit reset"
                    );
                }
                continue;
            }
            self.check_endpoint(&ep).await;
        }
    }

    async fn check_endpoint(&self, ep: &Arc<Endpoint>) {
        ep.set_status(EndpointStatus::Checking);
        let healthy = self.probe(ep.as_ref()).await;
        if healthy {
            if let Some(change) = ep.record_health_success(self.config.recovery_threshold.max(1)) {
                info!(endpoint = %ep.name, ?change, "endpoint recovered by health check");
                self.registry.request_resort();
            }
        } else {
            debug!(endpoint = %ep.name, "health probe failed");
            ep.record_health_failure();
        }
    }

    /// Cheap reachability probe against whichever URL the endpoint has.
    /// Any HTTP response below 500 (and not 429) counts as alive — auth
    /// failures still prove the endpoint is serving traffic.
    async fn probe(&self, ep: &Endpoint) -> bool {
        let url = if let Some(base) = ep.base_url(Dialect::OpenaiChat) {
            format!("{}/v1/models", base.trim_end_matches('/'))
        } else if let Some(base) = ep.base_url(Dialect::Anthropic) {
            format!("{}/v1/models", base.trim_end_matches('/'))
        } else if let Some(base) = ep.base_url(Dialect::Gemini) {
            format!("{}/v1beta/models", base.trim_end_matches('/'))
        } else {
            return false;
        };
        match self.client.get(&url).send().await {
            Ok(resp) => {
                let code = resp.status().as_u16();
                code < 500 && code != 429
            }
            Err(_) => false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::InactiveThresholds;
    use switchboard_config::EndpointConfig;

    fn registry_one(yaml: &str) -> Arc<EndpointRegistry> {
        let config: EndpointConfig = serde_yaml::from_str(yaml).unwrap();
        Arc::new(EndpointRegistry::new(vec![config], InactiveThresholds::default()))
    }

    fn checker(reg: Arc<EndpointRegistry>) -> HealthChecker {
        HealthChecker::new(reg, HealthConfig::default(), reqwest::Client::new())
    }

    #[tokio::test]
    async fn rate_limited_endpoint_is_skipped() {
        let reg = registry_one("name: rl\nurl_openai: http://127.0.0.1:1\n");
        let ep = reg.get_all()[0].clone();
        ep.mark_inactive("down".into());
        ep.update_rate_limit(Some(chrono::Utc::now().timestamp() + 120), Some("rate_limited".into()));

        checker(reg.clone()).check_round().await;
        // Still inactive, and never transitioned to checking: the probe was
        // skipped entirely.
        assert_eq!(ep.status(), EndpointStatus::Inactive);
    }

    #[tokio::test]
    async fn unreachable_endpoint_stays_inactive() {
        // Port 1 refuses connections, so the probe must fail fast.
        let reg = registry_one("name: down\nurl_openai: http://127.0.0.1:1\n");
        let ep = reg.get_all()[0].clone();
        ep.mark_inactive("down".into());

        checker(reg.clone()).check_round().await;
        assert_eq!(ep.status(), EndpointStatus::Inactive);
    }

    #[tokio::test]
    async fn active_endpoints_are_not_probed() {
        let reg = registry_one("name: up\nurl_openai: http://127.0.0.1:1\n");
        let ep = reg.get_all()[0].clone();
        assert_eq!(ep.status(), EndpointStatus::Active);
        checker(reg.clone()).check_round().await;
        // An unreachable URL would have demoted it if probed.
        assert_eq!(ep.status(), EndpointStatus::Active);
    }

    #[tokio::test]
    async fn disabled_endpoints_are_ignored() {
        let reg = registry_one("name: off\nurl_openai: http://127.0.0.1:1\n");
        let ep = reg.get_all()[0].clone();
        ep.set_enabled(false);
        ep.mark_inactive("off".into());
        checker(reg.clone()).check_round().await;
        assert_eq!(ep.status(), EndpointStatus::Inactive);
    }
}
