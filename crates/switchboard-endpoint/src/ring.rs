// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-endpoint request history ring buffer.
//!
//! Capacity 100 records inside a 140 s sliding window.  The buffer itself
//! is plain data; whether the endpoint should be marked inactive is a pure
//! function of its contents plus the configured thresholds, which keeps the
//! decision testable without any clock mocking.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub const RING_CAPACITY: usize = 100;
pub const RING_WINDOW: Duration = Duration::from_secs(140);

#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub request_id: String,
    pub first_byte_time: Duration,
    pub response_time: Duration,
}

/// Thresholds for the inactive decision, from `health` config.
#[derive(Debug, Clone, Copy)]
pub struct InactiveThresholds {
    /// Consecutive trailing failures that trip the endpoint inactive.
    pub failure_threshold: u32,
    /// Minimum records inside the window before the decision applies.
    pub min_samples: usize,
}

impl Default for InactiveThresholds {
    fn default() -> Self {
        Self { failure_threshold: 3, min_samples: 5 }
    }
}

#[derive(Debug, Clone)]
pub struct RequestRing {
    buf: VecDeque<RequestRecord>,
    capacity: usize,
    window: Duration,
}

impl Default for RequestRing {
    fn default() -> Self {
        Self::new(RING_CAPACITY, RING_WINDOW)
    }
}

impl RequestRing {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self { buf: VecDeque::with_capacity(capacity), capacity, window }
    }

    /// Append a record, evicting the oldest at capacity.
    pub fn push(&mut self, record: RequestRecord) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Records still inside the time window as of `now`.
    pub fn recent(&self, now: DateTime<Utc>) -> impl Iterator<Item = &RequestRecord> {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
        self.buf.iter().filter(move |r| now - r.timestamp <= window)
    }

    /// Request ids of recent failures, oldest first.  Used to build the
    /// blacklist reason.
    pub fn recent_failure_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        self.recent(now)
            .filter(|r| !r.success)
            .map(|r| r.request_id.clone())
            .collect()
    }

    /// Pure inactive decision: enough samples in the window, and the
    /// trailing run of failures has reached the threshold.
    pub fn should_mark_inactive(&self, now: DateTime<Utc>, thresholds: &InactiveThresholds) -> bool {
        let recent: Vec<&RequestRecord> = self.recent(now).collect();
        if recent.len() < thresholds.min_samples {
            return false;
        }
        let trailing_failures =
            recent.iter().rev().take_while(|r| !r.success).count() as u32;
        trailing_failures >= thresholds.failure_threshold
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(success: bool, age_secs: i64) -> RequestRecord {
        RequestRecord {
            timestamp: Utc::now() - chrono::Duration::seconds(age_secs),
            success,
            request_id: format!("req-{age_secs}-{success}"),
            first_byte_time: Duration::from_millis(10),
            response_time: Duration::from_millis(100),
        }
    }

    #[test]
    fn push_at_capacity_evicts_oldest() {
        let mut ring = RequestRing::new(3, RING_WINDOW);
        for i in 0..4 {
            let mut r = record(true, 0);
            r.request_id = format!("req-{i}");
            ring.push(r);
        }
        assert_eq!(ring.len(), 3);
        let ids: Vec<_> = ring.buf.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec!["req-1", "req-2", "req-3"]);
    }

    #[test]
    fn records_outside_window_are_ignored() {
        let mut ring = RequestRing::default();
        // Five old failures (outside 140 s), then one fresh success.
        for _ in 0..5 {
            ring.push(record(false, 200));
        }
        ring.push(record(true, 0));
        let now = Utc::now();
        assert_eq!(ring.recent(now).count(), 1);
        assert!(!ring.should_mark_inactive(now, &InactiveThresholds::default()));
    }

    #[test]
    fn trailing_failures_trip_inactive() {
        let mut ring = RequestRing::default();
        for _ in 0..3 {
            ring.push(record(true, 10));
        }
        for _ in 0..3 {
            ring.push(record(false, 5));
        }
        let now = Utc::now();
        assert!(ring.should_mark_inactive(now, &InactiveThresholds::default()));
    }

    #[test]
    fn success_breaks_the_trailing_run() {
        let mut ring = RequestRing::default();
        for _ in 0..4 {
            ring.push(record(false, 10));
        }
        ring.push(record(true, 1));
        let now = Utc::now();
        assert!(!ring.should_mark_inactive(now, &InactiveThresholds::default()));
    }

    #[test]
    fn too_few_samples_never_trip() {
        let mut ring = RequestRing::default();
        for _ in 0..4 {
            ring.push(record(false, 1));
        }
        // 4 records < min_samples 5.
        assert!(!ring.should_mark_inactive(Utc::now(), &InactiveThresholds::default()));
    }

    #[test]
    fn failure_ids_are_collected_in_order() {
        let mut ring = RequestRing::default();
        ring.push(record(true, 20));
        let mut f1 = record(false, 10);
        f1.request_id = "first".into();
        let mut f2 = record(false, 5);
        f2.request_id = "second".into();
        ring.push(f1);
        ring.push(f2);
        assert_eq!(ring.recent_failure_ids(Utc::now()), vec!["first", "second"]);
    }
}
