// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};
use vmm_types::migrate::MigrationPhase;
use vmm_types::{Result, VmmError};

use crate::record::{is_tracked, AsyncJob, Job, JobMask, JobRecord, JobSnapshot};
use crate::stats::{JobStats, JobStatsStatus};

/// How long an acquisition may wait before failing with a timeout.
pub const DEFAULT_JOB_WAIT: Duration = Duration::from_secs(30);

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

fn next_owner() -> u64 {
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

/// Writes the job record out whenever a tracked transition happens, so a
/// restarted daemon can pick up where this one stopped.
#[async_trait::async_trait]
pub trait JobPersister: Send + Sync {
    async fn persist_job(&self, snapshot: &JobSnapshot) -> anyhow::Result<()>;
}

/// Proof of holding the short slot; surrender it through `end_job`.
#[derive(Debug)]
#[must_use = "a held job slot must be ended"]
pub struct JobTicket {
    job: Job,
    owner: u64,
}

impl JobTicket {
    pub fn job(&self) -> Job {
        self.job
    }
}

/// Proof of owning the async slot. Only the holder may open nested jobs,
/// advance the phase, or update the job statistics.
#[derive(Debug)]
#[must_use = "a held async job must be ended or discarded"]
pub struct AsyncJobTicket {
    kind: AsyncJob,
    owner: u64,
}

impl AsyncJobTicket {
    pub fn kind(&self) -> AsyncJob {
        self.kind
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }
}

enum BeginKind {
    Short(Job),
    Async(AsyncJob),
    Nested(AsyncJob),
}

pub struct JobCoordinator {
    record: Mutex<JobRecord>,
    /// Woken when the short slot frees up.
    job_cond: Notify,
    /// Woken when the async slot frees up or its mask widens.
    async_cond: Notify,
    max_queued: u32,
    wait_budget: Duration,
    persister: RwLock<Option<Weak<dyn JobPersister>>>,
}

impl JobCoordinator {
    pub fn new(max_queued: u32, wait_budget: Duration) -> Self {
        JobCoordinator {
            record: Mutex::new(JobRecord::new()),
            job_cond: Notify::new(),
            async_cond: Notify::new(),
            max_queued,
            wait_budget,
            persister: RwLock::new(None),
        }
    }

    /// Install the persistence hook. Held weakly: the persister (the domain)
    /// owns the coordinator, not the other way round.
    pub fn set_persister(&self, persister: Weak<dyn JobPersister>) {
        *self.persister.write().unwrap() = Some(persister);
    }

    /// Acquire the short slot for `job`. Waits until no other short job is
    /// active and, if an async job runs, until its mask admits `job`.
    pub async fn begin_job(&self, job: Job) -> Result<JobTicket> {
        if job == Job::None || job == Job::AsyncNested {
            return Err(VmmError::InternalError(format!(
                "invalid job kind {} for begin_job",
                job
            )));
        }
        let owner = self.begin_internal(BeginKind::Short(job)).await?;
        Ok(JobTicket { job, owner })
    }

    /// Release the short slot.
    pub async fn end_job(&self, ticket: JobTicket) {
        let (snapshot, tracked) = {
            let mut rec = self.record.lock().await;
            if rec.active != ticket.job || rec.owner != ticket.owner {
                warn!(
                    sl!(),
                    "ending job {} owned by {} but record shows {} owned by {}",
                    ticket.job,
                    ticket.owner,
                    rec.active,
                    rec.owner
                );
            }
            rec.reset_active();
            rec.queued = rec.queued.saturating_sub(1);
            (rec.snapshot(), is_tracked(ticket.job))
        };
        self.job_cond.notify_waiters();
        if tracked {
            self.persist(&snapshot).await;
        }
    }

    /// Place the domain into async mode. The default mask applies until the
    /// operation narrows it.
    pub async fn begin_async_job(&self, kind: AsyncJob) -> Result<AsyncJobTicket> {
        if kind == AsyncJob::None {
            return Err(VmmError::InternalError(
                "invalid async job kind none".to_string(),
            ));
        }
        let owner = self.begin_internal(BeginKind::Async(kind)).await?;
        Ok(AsyncJobTicket { kind, owner })
    }

    /// Release the async slot and wake everything blocked on it.
    pub async fn end_async_job(&self, ticket: AsyncJobTicket) {
        let snapshot = {
            let mut rec = self.record.lock().await;
            if rec.async_job != ticket.kind || rec.async_owner != ticket.owner {
                warn!(
                    sl!(),
                    "ending async job {} owned by {} but record shows {} owned by {}",
                    ticket.kind,
                    ticket.owner,
                    rec.async_job,
                    rec.async_owner
                );
            }
            rec.reset_async();
            rec.queued = rec.queued.saturating_sub(1);
            rec.snapshot()
        };
        self.async_cond.notify_waiters();
        self.job_cond.notify_waiters();
        self.persist(&snapshot).await;
    }

    /// Drop the async job without reporting completion. Used when the client
    /// that started the operation went away mid-flight.
    pub async fn discard_async_job(&self) {
        let snapshot = {
            let mut rec = self.record.lock().await;
            if rec.async_job == AsyncJob::None {
                return;
            }
            info!(sl!(), "discarding async job {}", rec.async_job);
            rec.reset_async();
            rec.queued = rec.queued.saturating_sub(1);
            rec.snapshot()
        };
        self.async_cond.notify_waiters();
        self.job_cond.notify_waiters();
        self.persist(&snapshot).await;
    }

    /// Open the nested short slot for one monitor interaction of the async
    /// owner.
    pub async fn begin_nested_job(&self, ticket: &AsyncJobTicket) -> Result<JobTicket> {
        let owner = self.begin_internal(BeginKind::Nested(ticket.kind)).await?;
        Ok(JobTicket {
            job: Job::AsyncNested,
            owner,
        })
    }

    /// Replace the nesting mask. Destroy stays admitted no matter what the
    /// caller passed.
    pub async fn set_async_mask(&self, ticket: &AsyncJobTicket, mask: JobMask) -> Result<()> {
        let mut rec = self.record.lock().await;
        self.check_async(&rec, ticket)?;
        rec.mask = mask.with(Job::Destroy);
        drop(rec);
        // Widening the mask may unblock short-job candidates.
        self.async_cond.notify_waiters();
        Ok(())
    }

    /// Record the async job's current phase. Phases only move forward.
    pub async fn set_phase(&self, ticket: &AsyncJobTicket, phase: MigrationPhase) -> Result<()> {
        let snapshot = {
            let mut rec = self.record.lock().await;
            self.check_async(&rec, ticket)?;
            if phase < rec.phase {
                warn!(
                    sl!(),
                    "refusing backwards phase transition {} -> {}", rec.phase, phase
                );
                return Err(VmmError::InternalError(format!(
                    "migration phase cannot move from {} back to {}",
                    rec.phase, phase
                )));
            }
            debug!(sl!(), "migration phase {} -> {}", rec.phase, phase);
            rec.phase = phase;
            rec.snapshot()
        };
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Ask the running async operation to cancel at its next poll point.
    pub async fn request_abort(&self) -> Result<()> {
        let mut rec = self.record.lock().await;
        if rec.async_job == AsyncJob::None {
            return Err(VmmError::OperationInvalid(
                "no async job is active on this domain".to_string(),
            ));
        }
        rec.abort_requested = true;
        Ok(())
    }

    pub async fn abort_requested(&self) -> bool {
        self.record.lock().await.abort_requested
    }

    pub async fn active_job(&self) -> Job {
        self.record.lock().await.active
    }

    pub async fn async_job(&self) -> AsyncJob {
        self.record.lock().await.async_job
    }

    pub async fn phase(&self) -> MigrationPhase {
        self.record.lock().await.phase
    }

    pub async fn snapshot(&self) -> JobSnapshot {
        self.record.lock().await.snapshot()
    }

    /// Mutate the current statistics under the record lock.
    pub async fn update_current<F>(&self, ticket: &AsyncJobTicket, f: F) -> Result<()>
    where
        F: FnOnce(&mut JobStats),
    {
        let mut rec = self.record.lock().await;
        self.check_async(&rec, ticket)?;
        if let Some(current) = rec.current.as_mut() {
            f(current);
        }
        Ok(())
    }

    pub async fn current_stats(&self) -> Option<JobStats> {
        self.record.lock().await.current.clone()
    }

    pub async fn completed_stats(&self) -> Option<JobStats> {
        self.record.lock().await.completed.clone()
    }

    /// Finish the statistics of the running async job and file them as the
    /// completed record.
    pub async fn complete_current(
        &self,
        ticket: &AsyncJobTicket,
        status: JobStatsStatus,
    ) -> Result<()> {
        let mut rec = self.record.lock().await;
        self.check_async(&rec, ticket)?;
        if let Some(mut stats) = rec.current.clone() {
            stats.status = status;
            rec.completed = Some(stats);
        }
        Ok(())
    }

    /// Install completed statistics wholesale (destination side receives
    /// them through the migration cookie).
    pub async fn store_completed(&self, stats: JobStats) {
        self.record.lock().await.completed = Some(stats);
    }

    /// Re-install a recovered async job after a daemon restart, bypassing
    /// the waiting rules: the restarted daemon is the only actor.
    pub async fn resume_async(&self, kind: AsyncJob, phase: MigrationPhase) -> Result<AsyncJobTicket> {
        let owner = next_owner();
        let mut rec = self.record.lock().await;
        if rec.async_job != AsyncJob::None || rec.active != Job::None {
            return Err(VmmError::InternalError(format!(
                "cannot resume async job {} over active job ({}, {})",
                kind, rec.active, rec.async_job
            )));
        }
        rec.reset_async();
        rec.async_job = kind;
        rec.async_owner = owner;
        rec.phase = phase;
        rec.current = Some(JobStats::active());
        rec.queued += 1;
        Ok(AsyncJobTicket { kind, owner })
    }

    fn check_async(&self, rec: &JobRecord, ticket: &AsyncJobTicket) -> Result<()> {
        if rec.async_job != ticket.kind {
            return Err(VmmError::InternalError(format!(
                "unexpected async job {} (record shows {})",
                ticket.kind, rec.async_job
            )));
        }
        if rec.async_owner != ticket.owner {
            warn!(
                sl!(),
                "this ticket does not belong to the async job owner: {} vs {}",
                ticket.owner,
                rec.async_owner
            );
        }
        Ok(())
    }

    async fn begin_internal(&self, kind: BeginKind) -> Result<u64> {
        let deadline = Instant::now() + self.wait_budget;
        let nested = matches!(kind, BeginKind::Nested(_));

        let mut rec = self.record.lock().await;
        rec.queued += 1;

        let outcome = 'retry: loop {
            if self.max_queued > 0 && rec.queued > self.max_queued {
                break Err(VmmError::OperationFailed(
                    "cannot acquire state change lock due to max_queued limit".to_string(),
                ));
            }

            // Wait for async admission first, then for the short slot.
            while !nested && !admitted(&rec, &kind) {
                let notified = self.async_cond.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                drop(rec);
                if timeout_at(deadline, notified).await.is_err() {
                    rec = self.record.lock().await;
                    break 'retry Err(timeout_error());
                }
                rec = self.record.lock().await;
            }

            while rec.active != Job::None {
                let notified = self.job_cond.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                drop(rec);
                if timeout_at(deadline, notified).await.is_err() {
                    rec = self.record.lock().await;
                    break 'retry Err(timeout_error());
                }
                rec = self.record.lock().await;
            }

            // No short job is active, but a new async job could have begun
            // while the record was unlocked.
            if !nested && !admitted(&rec, &kind) {
                continue;
            }
            break Ok(());
        };

        if let Err(e) = outcome {
            rec.queued = rec.queued.saturating_sub(1);
            return Err(e);
        }

        let owner = next_owner();
        let (snapshot, tracked) = match kind {
            BeginKind::Short(job) => {
                rec.active = job;
                rec.owner = owner;
                debug!(sl!(), "started job"; "job" => job.to_string(), "owner" => owner);
                (rec.snapshot(), is_tracked(job))
            }
            BeginKind::Nested(expected) => {
                if rec.async_job != expected {
                    rec.queued = rec.queued.saturating_sub(1);
                    return Err(VmmError::InternalError(format!(
                        "unexpected async job {} while opening nested job",
                        rec.async_job
                    )));
                }
                rec.active = Job::AsyncNested;
                rec.owner = owner;
                (rec.snapshot(), false)
            }
            BeginKind::Async(async_kind) => {
                rec.reset_async();
                rec.async_job = async_kind;
                rec.async_owner = owner;
                rec.current = Some(JobStats::active());
                debug!(sl!(), "started async job"; "async" => async_kind.to_string(), "owner" => owner);
                (rec.snapshot(), true)
            }
        };
        drop(rec);

        if tracked {
            self.persist(&snapshot).await;
        }
        Ok(owner)
    }

    async fn persist(&self, snapshot: &JobSnapshot) {
        let persister = self
            .persister
            .read()
            .unwrap()
            .as_ref()
            .and_then(|weak| weak.upgrade());
        if let Some(persister) = persister {
            if let Err(e) = persister.persist_job(snapshot).await {
                warn!(sl!(), "failed to persist job state: {:#}", e);
            }
        }
    }
}

fn admitted(rec: &JobRecord, kind: &BeginKind) -> bool {
    match kind {
        BeginKind::Short(job) => rec.nested_allowed(*job),
        BeginKind::Async(_) => rec.async_job == AsyncJob::None,
        BeginKind::Nested(_) => true,
    }
}

fn timeout_error() -> VmmError {
    VmmError::OperationTimeout("cannot acquire state change lock".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn coordinator() -> Arc<JobCoordinator> {
        Arc::new(JobCoordinator::new(0, DEFAULT_JOB_WAIT))
    }

    #[tokio::test]
    async fn test_short_jobs_exclude_each_other() {
        let jobs = coordinator();

        let first = jobs.begin_job(Job::Modify).await.unwrap();
        assert_eq!(jobs.active_job().await, Job::Modify);

        let contender = {
            let jobs = jobs.clone();
            tokio::spawn(async move {
                let t = jobs.begin_job(Job::Query).await.unwrap();
                let got_at = Instant::now();
                jobs.end_job(t).await;
                got_at
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(jobs.active_job().await, Job::Modify);
        let released_at = Instant::now();
        jobs.end_job(first).await;

        let got_at = contender.await.unwrap();
        assert!(got_at >= released_at);
        assert_eq!(jobs.active_job().await, Job::None);
    }

    #[tokio::test]
    async fn test_async_mask_blocks_unlisted_jobs() {
        let jobs = coordinator();

        let ticket = jobs.begin_async_job(AsyncJob::MigrationOut).await.unwrap();
        jobs.set_async_mask(
            &ticket,
            JobMask::NONE.with(Job::Query).with(Job::MigrationOp),
        )
        .await
        .unwrap();

        // Suspend is outside the mask: it must still be pending when the
        // async job ends, and complete afterwards.
        let blocked = {
            let jobs = jobs.clone();
            tokio::spawn(async move {
                let t = jobs.begin_job(Job::Suspend).await.unwrap();
                jobs.end_job(t).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // Query is inside the mask and proceeds immediately.
        let t = jobs.begin_job(Job::Query).await.unwrap();
        jobs.end_job(t).await;

        // Destroy is always admitted.
        let t = jobs.begin_job(Job::Destroy).await.unwrap();
        jobs.end_job(t).await;

        jobs.end_async_job(ticket).await;
        blocked.await.unwrap();
    }

    #[tokio::test]
    async fn test_acquisition_times_out() {
        let jobs = Arc::new(JobCoordinator::new(0, Duration::from_millis(100)));

        let held = jobs.begin_job(Job::Modify).await.unwrap();
        let err = jobs.begin_job(Job::Query).await.unwrap_err();
        assert_eq!(err.code(), "operation-timeout");
        jobs.end_job(held).await;
    }

    #[tokio::test]
    async fn test_queue_cap_rejects() {
        let jobs = Arc::new(JobCoordinator::new(1, Duration::from_secs(5)));

        let held = jobs.begin_job(Job::Modify).await.unwrap();
        let err = jobs.begin_job(Job::Query).await.unwrap_err();
        assert_eq!(err.code(), "operation-failed");
        jobs.end_job(held).await;
    }

    #[tokio::test]
    async fn test_nested_job_within_async() {
        let jobs = coordinator();

        let async_ticket = jobs.begin_async_job(AsyncJob::Save).await.unwrap();
        let nested = jobs.begin_nested_job(&async_ticket).await.unwrap();
        assert_eq!(jobs.active_job().await, Job::AsyncNested);
        jobs.end_job(nested).await;
        jobs.end_async_job(async_ticket).await;
    }

    #[tokio::test]
    async fn test_phase_only_moves_forward() {
        let jobs = coordinator();

        let ticket = jobs.begin_async_job(AsyncJob::MigrationOut).await.unwrap();
        jobs.set_phase(&ticket, MigrationPhase::Begin3).await.unwrap();
        jobs.set_phase(&ticket, MigrationPhase::Perform3)
            .await
            .unwrap();
        let err = jobs
            .set_phase(&ticket, MigrationPhase::Begin3)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "internal-error");
        assert_eq!(jobs.phase().await, MigrationPhase::Perform3);
        jobs.end_async_job(ticket).await;
    }

    #[tokio::test]
    async fn test_abort_flag() {
        let jobs = coordinator();
        assert!(jobs.request_abort().await.is_err());

        let ticket = jobs.begin_async_job(AsyncJob::MigrationOut).await.unwrap();
        assert!(!jobs.abort_requested().await);
        jobs.request_abort().await.unwrap();
        assert!(jobs.abort_requested().await);
        jobs.end_async_job(ticket).await;
        assert!(!jobs.abort_requested().await);
    }

    #[tokio::test]
    async fn test_discard_async_job() {
        let jobs = coordinator();
        let _ticket = jobs.begin_async_job(AsyncJob::MigrationOut).await.unwrap();
        jobs.discard_async_job().await;
        assert_eq!(jobs.async_job().await, AsyncJob::None);

        // The domain is free for new work afterwards.
        let t = jobs.begin_job(Job::Modify).await.unwrap();
        jobs.end_job(t).await;
    }

    #[tokio::test]
    async fn test_async_excludes_async() {
        let jobs = coordinator();

        let ticket = jobs.begin_async_job(AsyncJob::Snapshot).await.unwrap();
        let waiter = {
            let jobs = jobs.clone();
            tokio::spawn(async move {
                let t = jobs.begin_async_job(AsyncJob::Save).await.unwrap();
                jobs.end_async_job(t).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        jobs.end_async_job(ticket).await;
        waiter.await.unwrap();
    }
}
