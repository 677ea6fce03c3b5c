//! Durable, capped queue of events whose writes exhausted their retries.
//!
//! The queue is one JSON array on disk. Every rewrite goes through a temp
//! file and a rename so a crash mid-write leaves the previous contents.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use quill_core::{FailureId, PersistError};

use crate::error::QueueError;
use crate::retry::{with_retry, RetryOutcome, RetryPolicy};

/// Which sink a queued write was meant for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sink {
    Store,
    Narrative,
}

impl std::fmt::Display for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store => write!(f, "store"),
            Self::Narrative => write!(f, "narrative"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEventRecord {
    pub id: FailureId,
    pub sink: Sink,
    /// Original hook payload, untouched.
    pub event: Value,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Transcript backup taken while the event was first processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub error: String,
    pub attempts: u32,
}

/// Result of [`FailureQueue::replay_all`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub succeeded: usize,
    pub still_failing: usize,
    /// Entries whose payload no longer parses. They are removed unreplayed.
    pub dropped: usize,
}

pub struct FailureQueue {
    path: PathBuf,
    capacity: usize,
}

impl FailureQueue {
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            capacity: capacity.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read the queue. A missing file is an empty queue; an unreadable one
    /// is renamed aside and treated as empty.
    pub fn load(&self) -> Result<Vec<FailedEventRecord>, QueueError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str(&content) {
            Ok(records) => Ok(records),
            Err(e) => {
                let aside = self.set_aside()?;
                warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "failure queue unreadable, starting a new one"
                );
                Ok(Vec::new())
            }
        }
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Append a record, evicting the oldest entries past capacity.
    /// Returns the number of evicted entries.
    pub fn enqueue(&self, record: FailedEventRecord) -> Result<usize, QueueError> {
        let mut records = self.load()?;
        info!(
            id = %record.id,
            sink = %record.sink,
            attempts = record.attempts,
            error = %record.error,
            "queueing failed write"
        );
        records.push(record);
        let evicted = records.len().saturating_sub(self.capacity);
        if evicted > 0 {
            let dropped: Vec<FailedEventRecord> = records.drain(..evicted).collect();
            for old in &dropped {
                warn!(id = %old.id, sink = %old.sink, "failure queue full, evicting oldest entry");
            }
        }
        self.save(&records)?;
        Ok(evicted)
    }

    /// Retry every queued write.
    ///
    /// Each entry runs under its own policy. Entries that now succeed are
    /// removed, as are entries rejected as malformed input. The rest stay
    /// with their attempt counts increased. Entries added by other
    /// processes while the replay ran are kept.
    pub fn replay_all<P, F>(&self, policy_for: P, mut apply: F) -> Result<ReplayReport, QueueError>
    where
        P: Fn(&FailedEventRecord) -> RetryPolicy,
        F: FnMut(&FailedEventRecord) -> Result<(), PersistError>,
    {
        let snapshot = self.load()?;
        if snapshot.is_empty() {
            return Ok(ReplayReport::default());
        }

        let mut report = ReplayReport::default();
        let mut resolved: HashSet<FailureId> = HashSet::new();
        let mut failing: Vec<FailedEventRecord> = Vec::new();

        for record in snapshot {
            let policy = policy_for(&record);
            match with_retry(&policy, |_| apply(&record)) {
                RetryOutcome::Succeeded { attempts, .. } => {
                    debug!(id = %record.id, sink = %record.sink, attempts, "replayed");
                    report.succeeded += 1;
                    let _ = resolved.insert(record.id.clone());
                }
                RetryOutcome::Exhausted {
                    error: error @ PersistError::MalformedInput(_),
                    ..
                } => {
                    warn!(id = %record.id, sink = %record.sink, %error, "dropping unreplayable entry");
                    report.dropped += 1;
                    let _ = resolved.insert(record.id.clone());
                }
                RetryOutcome::Exhausted { error, attempts } => {
                    warn!(id = %record.id, sink = %record.sink, %error, "replay still failing");
                    report.still_failing += 1;
                    failing.push(FailedEventRecord {
                        failed_at: Utc::now(),
                        error: error.to_string(),
                        attempts: record.attempts + attempts,
                        ..record
                    });
                }
            }
        }

        let merged: Vec<FailedEventRecord> = self
            .load()?
            .into_iter()
            .filter(|r| !resolved.contains(&r.id))
            .map(|r| match failing.iter().position(|f| f.id == r.id) {
                Some(idx) => failing.swap_remove(idx),
                None => r,
            })
            .collect();
        self.save(&merged)?;

        info!(
            succeeded = report.succeeded,
            still_failing = report.still_failing,
            dropped = report.dropped,
            "replay finished"
        );
        Ok(report)
    }

    fn save(&self, records: &[FailedEventRecord]) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(records)?;
        let tmp = sibling(&self.path, &format!(".tmp-{}", std::process::id()));
        fs::write(&tmp, json)?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn set_aside(&self) -> Result<PathBuf, QueueError> {
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let aside = sibling(&self.path, &format!(".corrupt-{stamp}"));
        fs::rename(&self.path, &aside)?;
        Ok(aside)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn record(n: u64) -> FailedEventRecord {
        FailedEventRecord {
            id: FailureId::new(),
            sink: Sink::Store,
            event: json!({"session_id": "s1", "n": n}),
            received_at: Utc::now(),
            project: Some("/p".into()),
            backup_path: None,
            failed_at: Utc::now(),
            error: "database busy".into(),
            attempts: 3,
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::new(2, Duration::ZERO)
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FailureQueue::new(dir.path().join("q.json"), 10);
        assert!(queue.load().unwrap().is_empty());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn enqueue_persists() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FailureQueue::new(dir.path().join("nested/q.json"), 10);
        let rec = record(1);
        assert_eq!(queue.enqueue(rec.clone()).unwrap(), 0);

        let loaded = FailureQueue::new(dir.path().join("nested/q.json"), 10).load().unwrap();
        assert_eq!(loaded, vec![rec]);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FailureQueue::new(dir.path().join("q.json"), 3);
        let records: Vec<_> = (0..5).map(record).collect();
        let mut evicted = 0;
        for rec in &records {
            evicted += queue.enqueue(rec.clone()).unwrap();
        }
        assert_eq!(evicted, 2);
        let loaded = queue.load().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].id, records[2].id);
        assert_eq!(loaded[2].id, records[4].id);
    }

    #[test]
    fn corrupt_file_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.json");
        fs::write(&path, "{ not an array").unwrap();
        let queue = FailureQueue::new(&path, 10);

        assert!(queue.load().unwrap().is_empty());
        assert!(!path.exists());
        let aside = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .any(|e| e.file_name().to_string_lossy().starts_with("q.json.corrupt-"));
        assert!(aside);

        queue.enqueue(record(1)).unwrap();
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn replay_removes_successes_and_keeps_failures() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FailureQueue::new(dir.path().join("q.json"), 10);
        let good = record(1);
        let bad = record(2);
        queue.enqueue(good.clone()).unwrap();
        queue.enqueue(bad.clone()).unwrap();

        let report = queue
            .replay_all(
                |_| fast(),
                |rec| {
                    if rec.id == good.id {
                        Ok(())
                    } else {
                        Err(PersistError::TransientStore("still busy".into()))
                    }
                },
            )
            .unwrap();

        assert_eq!(report, ReplayReport { succeeded: 1, still_failing: 1, dropped: 0 });
        let left = queue.load().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, bad.id);
        assert_eq!(left[0].attempts, 5);
        assert_eq!(left[0].error, "transient store error: still busy");
    }

    #[test]
    fn replay_drops_malformed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FailureQueue::new(dir.path().join("q.json"), 10);
        queue.enqueue(record(1)).unwrap();

        let mut calls = 0;
        let report = queue
            .replay_all(
                |_| fast(),
                |_| {
                    calls += 1;
                    Err(PersistError::MalformedInput("missing session_id".into()))
                },
            )
            .unwrap();

        assert_eq!(report, ReplayReport { succeeded: 0, still_failing: 0, dropped: 1 });
        assert_eq!(calls, 1);
        assert!(queue.load().unwrap().is_empty());
    }

    #[test]
    fn replay_of_empty_queue_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FailureQueue::new(dir.path().join("q.json"), 10);
        let report = queue.replay_all(|_| fast(), |_| Ok(())).unwrap();
        assert_eq!(report, ReplayReport::default());
        assert!(!queue.path().exists());
    }

    #[test]
    fn record_serializes_camel_case() {
        let value = serde_json::to_value(record(1)).unwrap();
        assert!(value.get("receivedAt").is_some());
        assert!(value.get("failedAt").is_some());
        assert_eq!(value["sink"], "store");
        assert!(value.get("backupPath").is_none());
    }
}
