// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Dynamic priority sorter.
//!
//! A single cooperative task re-ranks endpoints whenever a status change
//! (or an admin force-update) fires the trigger.  It never holds endpoint
//! references across iterations — each pass re-reads the registry, so a
//! hot reload can swap the endpoint set out from under it safely.

use std::cmp::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::endpoint::{Endpoint, EndpointStatus};
use crate::registry::EndpointRegistry;

/// Invoked after each re-sort so renumbered priorities can be persisted.
pub type PersistCallback = Arc<dyn Fn() + Send + Sync>;

pub struct DynamicSorter {
    registry: Arc<EndpointRegistry>,
    rx: mpsc::UnboundedReceiver<()>,
    persist: Option<PersistCallback>,
}

impl DynamicSorter {
    /// Create the sorter and wire its trigger into the registry.
    pub fn new(
        registry: Arc<EndpointRegistry>,
        persist: Option<PersistCallback>,
    ) -> (Self, mpsc::UnboundedSender<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.set_resort_trigger({
            let tx = tx.clone();
            Arc::new(move || {
                let _ = tx.send(());
            })
        });
        (Self { registry, rx, persist }, tx)
    }

    /// Run until every trigger sender is dropped.
    pub async fn run(mut self) {
        while self.rx.recv().await.is_some() {
            // Coalesce bursts: a cascade of status changes needs one pass.
            while self.rx.try_recv().is_ok() {}
            resort(&self.registry);
            if let Some(persist) = &self.persist {
                persist();
            }
        }
    }
}

/// One sorting pass: partition, order, renumber.
pub fn resort(registry: &EndpointRegistry) {
    let all = registry.get_all();
    let (mut enabled, mut disabled): (Vec<Arc<Endpoint>>, Vec<Arc<Endpoint>>) =
        all.into_iter().partition(|e| e.enabled());

    enabled.sort_by(|a, b| compare(a.as_ref(), b.as_ref()));
    disabled.sort_by(|a, b| a.config.priority.cmp(&b.config.priority));

    let mut priority = 1u32;
    for ep in &enabled {
        ep.set_current_priority(priority);
        priority += 1;
    }
    for ep in &disabled {
        ep.set_current_priority(priority);
        priority += 1;
    }
    debug!(enabled = enabled.len(), disabled = disabled.len(), "endpoints re-sorted");
}

/// Availability desc, success rate desc, nonzero latency asc, original
/// priority asc.
fn compare(a: &Endpoint, b: &Endpoint) -> Ordering {
    let avail = |e: &Endpoint| e.status() == EndpointStatus::Active;
    avail(b)
        .cmp(&avail(a))
        .then_with(|| b.success_rate().total_cmp(&a.success_rate()))
        .then_with(|| {
            let lat = |e: &Endpoint| {
                let t = e.last_response_time();
                // Zero means "no observation yet" and sorts after any
                // measured latency.
                if t.is_zero() { u128::MAX } else { t.as_millis() }
            };
            lat(a).cmp(&lat(b))
        })
        .then_with(|| a.config.priority.cmp(&b.config.priority))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
