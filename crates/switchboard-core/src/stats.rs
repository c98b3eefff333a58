// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Statistics sink: the external statistics store boundary.
//!
//! The store schema is opaque to the core; endpoints are keyed by
//! `ep-name-<sha256(name)>`.  The default sink discards records; the
//! JSON-lines sink appends one record per outcome.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;

use switchboard_config::StatsConfig;

pub trait StatsSink: Send + Sync {
    fn record(&self, endpoint_name: &str, success: bool, last_failure: Option<DateTime<Utc>>);
}

pub struct NoopStats;

impl StatsSink for NoopStats {
    fn record(&self, _endpoint_name: &str, _success: bool, _last_failure: Option<DateTime<Utc>>) {}
}

pub struct JsonlStats {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl JsonlStats {
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file: Mutex::new(file) })
    }
}

impl StatsSink for JsonlStats {
    fn record(&self, endpoint_name: &str, success: bool, last_failure: Option<DateTime<Utc>>) {
        let line = json!({
            "key": switchboard_endpoint::stats_key(endpoint_name),
            "ts": Utc::now().to_rfc3339(),
            "success": success,
            "last_failure": last_failure.map(|t| t.to_rfc3339()),
        });
        let mut file = self.file.lock().expect("stats file lock");
        if let Err(e) = writeln!(file, "{line}") {
            warn!(path = %self.path.display(), error = %e, "stats append failed");
        }
    }
}

pub fn stats_sink_from_config(config: &StatsConfig) -> Arc<dyn StatsSink> {
    match &config.path {
        Some(path) => match JsonlStats::open(PathBuf::from(path)) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!(path = %path, error = %e, "stats sink unavailable, recording disabled");
                Arc::new(NoopStats)
            }
        },
        None => Arc::new(NoopStats),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
