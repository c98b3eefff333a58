// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Write-behind persistence for learned config fields.
//!
//! Many in-flight requests update learned endpoint capabilities; writing
//! the YAML file on every change would hammer the disk.  The persister
//! coalesces: [`Persister::mark_dirty`] is a cheap flag + nudge, and a
//! background task decides when the file is actually written.
//!
//! # Write policy
//!
//! ```text
//! dirty && since-last-write >= flush_interval   → write
//! dirty && dirty-for       >= max_dirty_time    → write (beats throttle)
//! dirty && inside throttle window               → skip, count throttle
//! flush_now()                                   → write unconditionally
//! stop()                                        → final flush_now()
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info};

use crate::{loader, Config, PersistenceConfig};

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PersisterStats {
    pub write_count: u64,
    /// Flush attempts skipped because the throttle window was still open.
    pub throttle_count: u64,
    pub error_count: u64,
    pub dirty: bool,
}

struct Shared {
    path: PathBuf,
    config: Mutex<Config>,
    dirty: AtomicBool,
    /// When the config first became dirty after the last write.
    dirty_since: Mutex<Option<Instant>>,
    /// Initialised to task start so the very first write also respects the
    /// throttle window.
    last_write: Mutex<Instant>,
    flush_interval: Duration,
    max_dirty_time: Duration,
    write_count: AtomicU64,
    throttle_count: AtomicU64,
    error_count: AtomicU64,
    stopped: Notify,
}

impl Shared {
    /// Unconditional write of the current snapshot.
    fn write_now(&self) {
        let snapshot = self.config.lock().expect("config lock").clone();
        match loader::save(&snapshot, &self.path) {
            Ok(()) => {
                self.write_count.fetch_add(1, Ordering::Relaxed);
                self.dirty.store(false, Ordering::Release);
                *self.dirty_since.lock().expect("dirty_since lock") = None;
                *self.last_write.lock().expect("last_write lock") = Instant::now();
                debug!(path = %self.path.display(), "config written");
            }
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                error!(path = %self.path.display(), error = %e, "config write failed");
            }
        }
    }

    /// Throttled write attempt used by the background loop.
    fn try_flush(&self) {
        if !self.dirty.load(Ordering::Acquire) {
            return;
        }
        let since_write = self.last_write.lock().expect("last_write lock").elapsed();
        if since_write >= self.flush_interval {
            self.write_now();
            return;
        }
        let dirty_for = self
            .dirty_since
            .lock()
            .expect("dirty_since lock")
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        if dirty_for >= self.max_dirty_time {
            // Dirty too long: the throttle window no longer applies.
            self.write_now();
            return;
        }
        self.throttle_count.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Persister {
    shared: Arc<Shared>,
    nudge: mpsc::Sender<()>,
    stop: mpsc::Sender<()>,
}

impl Persister {
    /// Spawn the background flush task and return the handle used by the
    /// rest of the system.
    pub fn spawn(config: Config, path: PathBuf, policy: &PersistenceConfig) -> Arc<Self> {
        let shared = Arc::new(Shared {
            path,
            config: Mutex::new(config),
            dirty: AtomicBool::new(false),
            dirty_since: Mutex::new(None),
            last_write: Mutex::new(Instant::now()),
            flush_interval: policy.flush_interval(),
            max_dirty_time: policy.max_dirty_time(),
            write_count: AtomicU64::new(0),
            throttle_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            stopped: Notify::new(),
        });

        let (nudge_tx, mut nudge_rx) = mpsc::channel::<()>(16);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let task_shared = shared.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(task_shared.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The interval fires immediately once; swallow that tick so the
            // first periodic check happens one full interval in.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => task_shared.try_flush(),
                    nudge = nudge_rx.recv() => match nudge {
                        Some(()) => task_shared.try_flush(),
                        // All handles dropped without stop(): shut down too.
                        None => break,
                    },
                    _ = stop_rx.recv() => break,
                }
            }
            // Final flush on shutdown keeps every learned field.
            if task_shared.dirty.load(Ordering::Acquire) {
                task_shared.write_now();
            }
            task_shared.stopped.notify_one();
        });

        Arc::new(Self { shared, nudge: nudge_tx, stop: stop_tx })
    }

    /// Flag the config as changed.  Never blocks and never writes; the
    /// background task coalesces the actual I/O.
    pub fn mark_dirty(&self) {
        if !self.shared.dirty.swap(true, Ordering::AcqRel) {
            let mut since = self.shared.dirty_since.lock().expect("dirty_since lock");
            if since.is_none() {
                *since = Some(Instant::now());
            }
        }
        let _ = self.nudge.try_send(());
    }

    /// Request a background flush without waiting for it.
    pub fn flush_async(&self) {
        let _ = self.nudge.try_send(());
    }

    /// Write the current snapshot unconditionally.
    pub fn flush_now(&self) {
        self.shared.write_now();
    }

    /// Replace the whole config snapshot (admin hot-reload path).
    pub fn update_config(&self, new: Config) {
        *self.shared.config.lock().expect("config lock") = new;
        self.mark_dirty();
    }

    /// Mutate the live config under the persister's lock.
    ///
    /// Used by the learner to copy learned endpoint fields back into the
    /// config entry before flagging it dirty.
    pub fn with_config<R>(&self, f: impl FnOnce(&mut Config) -> R) -> R {
        let mut cfg = self.shared.config.lock().expect("config lock");
        f(&mut cfg)
    }

    /// Consistent snapshot of the current config.
    pub fn snapshot(&self) -> Config {
        self.shared.config.lock().expect("config lock").clone()
    }

    pub fn stats(&self) -> PersisterStats {
        PersisterStats {
            write_count: self.shared.write_count.load(Ordering::Relaxed),
            throttle_count: self.shared.throttle_count.load(Ordering::Relaxed),
            error_count: self.shared.error_count.load(Ordering::Relaxed),
            dirty: self.shared.dirty.load(Ordering::Acquire),
        }
    }

    /// Stop the background task after one final unconditional flush.
    pub async fn stop(&self) {
        if self.stop.send(()).await.is_ok() {
            self.shared.stopped.notified().await;
        }
        info!(writes = self.shared.write_count.load(Ordering::Relaxed), "persister stopped");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy() -> PersistenceConfig {
        PersistenceConfig { flush_interval_secs: 1, max_dirty_time_secs: 2 }
    }

    fn temp_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("config.yaml")
    }

    #[tokio::test]
    async fn mark_dirty_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);
        let p = Persister::spawn(Config::default(), path.clone(), &fast_policy());
        p.mark_dirty();
        // Give the nudge a chance to be processed; it must be throttled.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!path.exists(), "mark_dirty alone must not write");
        assert_eq!(p.stats().write_count, 0);
        p.stop().await;
    }

    #[tokio::test]
    async fn flush_now_writes_unconditionally() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);
        let p = Persister::spawn(Config::default(), path.clone(), &fast_policy());
        p.flush_now();
        assert!(path.exists());
        assert_eq!(p.stats().write_count, 1);
        p.stop().await;
    }

    #[tokio::test]
    async fn flush_now_is_idempotent_across_marks() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);
        let p = Persister::spawn(Config::default(), path.clone(), &fast_policy());
        p.mark_dirty();
        p.flush_now();
        p.mark_dirty();
        p.flush_now();
        assert_eq!(p.stats().write_count, 2, "exactly two writes expected");
        p.stop().await;
    }

    #[tokio::test]
    async fn burst_of_marks_coalesces_into_one_write() {
        // flush_interval 200 ms, max_dirty 1 s: five marks within
        // 100 ms followed by a 250 ms wait must produce exactly one
        // write and at least four throttled attempts.
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);
        // Sub-second intervals are not expressible in the public config
        // (it uses whole seconds), so drive the shared state directly.
        let shared = Arc::new(Shared {
            path: path.clone(),
            config: Mutex::new(Config::default()),
            dirty: AtomicBool::new(false),
            dirty_since: Mutex::new(None),
            last_write: Mutex::new(Instant::now()),
            flush_interval: Duration::from_millis(200),
            max_dirty_time: Duration::from_secs(1),
            write_count: AtomicU64::new(0),
            throttle_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            stopped: Notify::new(),
        });

        for _ in 0..5 {
            shared.dirty.store(true, Ordering::Release);
            let mut since = shared.dirty_since.lock().unwrap();
            if since.is_none() {
                *since = Some(Instant::now());
            }
            drop(since);
            shared.try_flush();
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        shared.try_flush();

        assert_eq!(shared.write_count.load(Ordering::Relaxed), 1);
        assert!(shared.throttle_count.load(Ordering::Relaxed) >= 4);
    }

    #[tokio::test]
    async fn stop_performs_final_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);
        let p = Persister::spawn(Config::default(), path.clone(), &fast_policy());
        p.mark_dirty();
        p.stop().await;
        assert!(path.exists(), "stop must flush dirty state");
    }

    #[tokio::test]
    async fn update_config_replaces_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);
        let p = Persister::spawn(Config::default(), path.clone(), &fast_policy());
        let mut cfg = Config::default();
        cfg.server.bind = "10.0.0.1:9999".into();
        p.update_config(cfg);
        assert_eq!(p.snapshot().server.bind, "10.0.0.1:9999");
        p.flush_now();
        let on_disk: Config =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.server.bind, "10.0.0.1:9999");
        p.stop().await;
    }
}
