//! In-process registry of pipeline runs started through the API.
//!
//! Running entries are always kept. Finished entries are kept up to the
//! registry's capacity; the oldest finished run is evicted first.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::pipeline::{PipelineResult, PipelineStatus};

/// Finished runs kept for lookup by default.
pub const DEFAULT_FINISHED_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct RunEntry {
    pub task_id: Uuid,
    pub niche: String,
    pub status: PipelineStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `PipelineResult::to_record()` once the run finished.
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Default)]
struct Runs {
    entries: HashMap<Uuid, RunEntry>,
    /// Cancellation handles of runs still in flight.
    active: HashMap<Uuid, CancellationToken>,
    /// Finished run ids, oldest first.
    finished: VecDeque<Uuid>,
    latest: Option<Uuid>,
}

#[derive(Debug)]
pub struct RunRegistry {
    runs: RwLock<Runs>,
    capacity: usize,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FINISHED_CAPACITY)
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` finished runs.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            runs: RwLock::new(Runs::default()),
            capacity,
        }
    }

    /// Register a new running entry and make it the latest. The returned
    /// token cancels the run.
    pub async fn start(&self, niche: &str) -> (RunEntry, CancellationToken) {
        let entry = RunEntry {
            task_id: Uuid::new_v4(),
            niche: niche.to_string(),
            status: PipelineStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            result: None,
        };
        let token = CancellationToken::new();

        let mut runs = self.runs.write().await;
        runs.entries.insert(entry.task_id, entry.clone());
        runs.active.insert(entry.task_id, token.clone());
        runs.latest = Some(entry.task_id);
        (entry, token)
    }

    pub async fn finish(&self, task_id: Uuid, result: &PipelineResult) {
        let mut runs = self.runs.write().await;
        runs.active.remove(&task_id);
        let Some(entry) = runs.entries.get_mut(&task_id) else {
            return;
        };
        entry.status = result.status;
        entry.finished_at = Some(result.end_time.unwrap_or_else(Utc::now));
        entry.result = Some(result.to_record());
        runs.finished.push_back(task_id);

        while runs.finished.len() > self.capacity {
            if let Some(evicted) = runs.finished.pop_front() {
                runs.entries.remove(&evicted);
                if runs.latest == Some(evicted) {
                    runs.latest = None;
                }
                tracing::debug!(task_id = %evicted, "Evicted finished run");
            }
        }
    }

    /// Cancel every run still in flight and return their ids.
    pub async fn cancel_all(&self) -> Vec<Uuid> {
        let runs = self.runs.read().await;
        runs.active
            .iter()
            .map(|(id, token)| {
                token.cancel();
                *id
            })
            .collect()
    }

    pub async fn get(&self, task_id: Uuid) -> Option<RunEntry> {
        self.runs.read().await.entries.get(&task_id).cloned()
    }

    pub async fn latest(&self) -> Option<RunEntry> {
        let runs = self.runs.read().await;
        runs.latest.and_then(|id| runs.entries.get(&id).cloned())
    }

    /// Number of entries currently held, running or finished.
    pub async fn len(&self) -> usize {
        self.runs.read().await.entries.len()
    }
}
