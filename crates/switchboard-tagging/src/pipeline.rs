// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Concurrent tagger evaluation under a shared deadline.
//!
//! All enabled taggers run at once.  A tagger that errors or misses the
//! deadline contributes no tag but its outcome is still recorded — the
//! aggregator stops waiting, the tagger future is simply dropped, never
//! forcibly killed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, warn};

use switchboard_config::TaggingConfig;

use crate::builtin::build_taggers;
use crate::{RequestView, Tagger};

#[derive(Debug, Clone)]
pub struct TaggerOutcome {
    pub name: String,
    pub tag: String,
    pub matched: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct TaggedRequest {
    /// Union of matched tags, duplicates removed.
    pub tags: Vec<String>,
    pub results: Vec<TaggerOutcome>,
    pub tagging_time: Duration,
}

impl TaggedRequest {
    pub fn has_tags(&self) -> bool {
        !self.tags.is_empty()
    }
}

pub struct TaggingPipeline {
    taggers: Vec<Arc<dyn Tagger>>,
    deadline: Duration,
}

impl TaggingPipeline {
    pub fn new(taggers: Vec<Arc<dyn Tagger>>, deadline: Duration) -> Self {
        Self { taggers, deadline }
    }

    pub fn from_config(config: &TaggingConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            build_taggers(config)?,
            Duration::from_secs(config.pipeline_timeout_secs.max(1)),
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.taggers.is_empty()
    }

    pub async fn run(&self, req: &RequestView) -> TaggedRequest {
        let started = Instant::now();
        let evaluations = self.taggers.iter().map(|tagger| {
            let tagger = tagger.clone();
            async move {
                let t0 = Instant::now();
                let verdict = tokio::time::timeout(self.deadline, tagger.should_tag(req)).await;
                let duration = t0.elapsed();
                match verdict {
                    Ok(Ok(matched)) => TaggerOutcome {
                        name: tagger.name().to_string(),
                        tag: tagger.tag().to_string(),
                        matched,
                        error: None,
                        duration,
                    },
                    Ok(Err(e)) => {
                        warn!(tagger = tagger.name(), error = %e, "tagger failed");
                        TaggerOutcome {
                            name: tagger.name().to_string(),
                            tag: tagger.tag().to_string(),
                            matched: false,
                            error: Some(e.to_string()),
                            duration,
                        }
                    }
                    Err(_) => {
                        warn!(tagger = tagger.name(), "tagger missed the pipeline deadline");
                        TaggerOutcome {
                            name: tagger.name().to_string(),
                            tag: tagger.tag().to_string(),
                            matched: false,
                            error: Some("deadline exceeded".into()),
                            duration,
                        }
                    }
                }
            }
        });

        let results = join_all(evaluations).await;

        let mut tags: Vec<String> = Vec::new();
        for outcome in results.iter().filter(|o| o.matched) {
            if !tags.contains(&outcome.tag) {
                tags.push(outcome.tag.clone());
            }
        }
        let tagging_time = started.elapsed();
        debug!(tags = ?tags, elapsed_ms = tagging_time.as_millis() as u64, "tagging complete");
        TaggedRequest { tags, results, tagging_time }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
