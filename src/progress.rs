//
// progress.rs
// Pacs-Bridge-rs
//
// Live state of in-flight retrievals: one writer handle per job, snapshot reads for pollers.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::association::Interrupter;
use crate::error::{PacsError, Result};
use crate::models::{RetrievalProgress, RetrievalStatus, SubOperationCounts};

/// Opaque identifier of a retrieval job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetrievalId(Uuid);

impl RetrievalId {
    fn generate() -> Self {
        RetrievalId(Uuid::new_v4())
    }
}

impl fmt::Display for RetrievalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RetrievalId {
    type Err = PacsError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(RetrievalId)
            .map_err(|_| PacsError::UnknownRetrieval(s.to_string()))
    }
}

struct JobCell {
    progress: RwLock<RetrievalProgress>,
    cancel_requested: AtomicBool,
    interrupter: Mutex<Option<Interrupter>>,
}

impl JobCell {
    fn snapshot(&self) -> RetrievalProgress {
        self.progress
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn interrupt(&self) {
        if let Some(interrupt) = self
            .interrupter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            interrupt();
        }
    }
}

/// Arena of retrieval jobs, shared between the move workers and pollers.
#[derive(Clone, Default)]
pub struct RetrievalTracker {
    jobs: Arc<RwLock<HashMap<RetrievalId, Arc<JobCell>>>>,
}

impl RetrievalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a PENDING job and returns its only writer.
    pub fn register(&self) -> RetrievalHandle {
        let id = RetrievalId::generate();
        let cell = Arc::new(JobCell {
            progress: RwLock::new(RetrievalProgress {
                retrieval_id: id.to_string(),
                status: RetrievalStatus::Pending,
                total: 0,
                completed: 0,
                failed: 0,
                warnings: 0,
                error_message: None,
                start_time: Utc::now(),
                end_time: None,
            }),
            cancel_requested: AtomicBool::new(false),
            interrupter: Mutex::new(None),
        });
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, cell.clone());
        debug!("Registered retrieval {}", id);
        RetrievalHandle { id, cell }
    }

    fn cell(&self, id: &RetrievalId) -> Result<Arc<JobCell>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| PacsError::UnknownRetrieval(id.to_string()))
    }

    pub fn snapshot(&self, id: &RetrievalId) -> Result<RetrievalProgress> {
        Ok(self.cell(id)?.snapshot())
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<RetrievalProgress> {
        let mut all: Vec<RetrievalProgress> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|cell| cell.snapshot())
            .collect();
        all.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        all
    }

    /// Asks the job's owner to stop and closes its connection if one is registered;
    /// the owner finalizes the job as CANCELLED.
    pub fn cancel(&self, id: &RetrievalId) -> Result<RetrievalProgress> {
        let cell = self.cell(id)?;
        let snapshot = cell.snapshot();
        if snapshot.status.is_terminal() {
            return Err(PacsError::RetrievalFinalized(id.to_string()));
        }
        cell.cancel_requested.store(true, Ordering::SeqCst);
        info!("Cancellation requested for retrieval {}", id);
        cell.interrupt();
        Ok(snapshot)
    }

    /// Drops finished jobs whose end time is older than `older_than`.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|_, cell| {
            let progress = cell.snapshot();
            !matches!(progress.end_time, Some(end) if progress.status.is_terminal() && end < cutoff)
        });
        before - jobs.len()
    }
}

/// Exclusive writer of one retrieval job.
pub struct RetrievalHandle {
    id: RetrievalId,
    cell: Arc<JobCell>,
}

impl RetrievalHandle {
    pub fn id(&self) -> RetrievalId {
        self.id
    }

    pub fn snapshot(&self) -> RetrievalProgress {
        self.cell.snapshot()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cell.cancel_requested.load(Ordering::SeqCst)
    }

    /// Registers the hook `cancel` uses to unblock a pending read.
    ///
    /// Runs it at once when the cancel came first.
    pub fn set_interrupter(&self, interrupter: Interrupter) {
        *self
            .cell
            .interrupter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(interrupter);
        if self.is_cancel_requested() {
            self.cell.interrupt();
        }
    }

    fn update<F>(&self, f: F) -> Result<RetrievalProgress>
    where
        F: FnOnce(&mut RetrievalProgress),
    {
        let mut progress = self
            .cell
            .progress
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if progress.status.is_terminal() {
            return Err(PacsError::RetrievalFinalized(self.id.to_string()));
        }
        f(&mut progress);
        Ok(progress.clone())
    }

    /// PENDING -> IN_PROGRESS.
    pub fn start(&self) -> Result<()> {
        self.update(|p| p.status = RetrievalStatus::InProgress)?;
        info!("Retrieval {} in progress", self.id);
        Ok(())
    }

    /// Applies cumulative sub-operation counts reported by the peer.
    ///
    /// Counters only move forward; `total` grows to cover every counted
    /// sub-operation so `completed + failed + warnings <= total` always holds.
    pub fn record_progress(&self, counts: SubOperationCounts) -> Result<RetrievalProgress> {
        let progress = self.update(|p| {
            p.completed = p.completed.max(counts.completed);
            p.failed = p.failed.max(counts.failed);
            p.warnings = p.warnings.max(counts.warning);
            let counted = p.completed + p.failed + p.warnings;
            let announced = counts.remaining.map(|r| r + counted).unwrap_or(0);
            p.total = p.total.max(announced).max(counted);
        })?;
        debug!(
            "Retrieval {}: {}/{} completed, {} failed, {} warning",
            self.id, progress.completed, progress.total, progress.failed, progress.warnings
        );
        Ok(progress)
    }

    /// Moves the job to a terminal status; the end time is fixed here.
    pub fn finish(&self, status: RetrievalStatus, error_message: Option<String>) -> Result<RetrievalProgress> {
        if !status.is_terminal() {
            return Err(PacsError::protocol(format!(
                "{:?} is not a terminal retrieval status",
                status
            )));
        }
        let progress = self.update(|p| {
            p.status = status;
            p.error_message = error_message;
            p.end_time = Some(Utc::now());
        })?;
        self.cell
            .interrupter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match status {
            RetrievalStatus::Completed => info!("Retrieval {} completed", self.id),
            _ => warn!(
                "Retrieval {} finished as {:?}: {}",
                self.id,
                status,
                progress.error_message.as_deref().unwrap_or("-")
            ),
        }
        Ok(progress)
    }
}

impl Drop for RetrievalHandle {
    fn drop(&mut self) {
        if !self.snapshot().status.is_terminal() {
            let _ = self.finish(
                RetrievalStatus::Failed,
                Some("retrieval abandoned before completion".to_string()),
            );
        }
    }
}
