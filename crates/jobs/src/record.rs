// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};
use vmm_types::migrate::MigrationPhase;

use crate::stats::JobStats;

/// Short, mutually exclusive jobs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Job {
    None,
    Query,
    Destroy,
    Suspend,
    Modify,
    Abort,
    MigrationOp,
    /// Set for the duration of a monitor interaction performed by the owner
    /// of the active async job.
    AsyncNested,
}

impl Job {
    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Long-running jobs holding the async slot.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum AsyncJob {
    None,
    MigrationIn,
    MigrationOut,
    Save,
    Dump,
    Snapshot,
}

/// Which short jobs may start while an async job is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMask(u32);

impl JobMask {
    pub const NONE: JobMask = JobMask(0);

    /// Jobs an async operation admits unless it narrows the mask itself.
    pub fn default_mask() -> JobMask {
        JobMask::NONE
            .with(Job::Query)
            .with(Job::Destroy)
            .with(Job::Modify)
            .with(Job::Abort)
            .with(Job::MigrationOp)
    }

    pub const fn with(self, job: Job) -> JobMask {
        JobMask(self.0 | 1 << (job as u32))
    }

    pub fn allows(self, job: Job) -> bool {
        self.0 & job.bit() != 0
    }
}

/// Jobs whose transitions are written to the status file so a restarted
/// daemon can recover them.
pub(crate) fn is_tracked(job: Job) -> bool {
    matches!(
        job,
        Job::Destroy | Job::Suspend | Job::Modify | Job::MigrationOp
    )
}

/// Point-in-time copy of the record, for logging and persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub active: Job,
    pub owner: u64,
    pub async_job: AsyncJob,
    pub async_owner: u64,
    pub phase: MigrationPhase,
}

#[derive(Debug)]
pub(crate) struct JobRecord {
    pub active: Job,
    pub owner: u64,
    pub async_job: AsyncJob,
    pub async_owner: u64,
    pub phase: MigrationPhase,
    pub mask: JobMask,
    /// Tasks holding or waiting for any slot.
    pub queued: u32,
    pub abort_requested: bool,
    pub current: Option<JobStats>,
    pub completed: Option<JobStats>,
}

impl JobRecord {
    pub fn new() -> Self {
        JobRecord {
            active: Job::None,
            owner: 0,
            async_job: AsyncJob::None,
            async_owner: 0,
            phase: MigrationPhase::None,
            mask: JobMask::default_mask(),
            queued: 0,
            abort_requested: false,
            current: None,
            completed: None,
        }
    }

    /// A short job may start if no async job runs, or the mask admits it.
    pub fn nested_allowed(&self, job: Job) -> bool {
        self.async_job == AsyncJob::None || self.mask.allows(job)
    }

    pub fn reset_active(&mut self) {
        self.active = Job::None;
        self.owner = 0;
    }

    pub fn reset_async(&mut self) {
        self.async_job = AsyncJob::None;
        self.async_owner = 0;
        self.phase = MigrationPhase::None;
        self.mask = JobMask::default_mask();
        self.abort_requested = false;
        self.current = None;
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            active: self.active,
            owner: self.owner,
            async_job: self.async_job,
            async_owner: self.async_owner,
            phase: self.phase,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_always_carries_destroy_after_with() {
        let mask = JobMask::NONE.with(Job::Destroy);
        assert!(mask.allows(Job::Destroy));
        assert!(!mask.allows(Job::Modify));
    }

    #[test]
    fn test_default_mask() {
        let mask = JobMask::default_mask();
        for job in [
            Job::Query,
            Job::Destroy,
            Job::Modify,
            Job::Abort,
            Job::MigrationOp,
        ] {
            assert!(mask.allows(job), "{} missing from default mask", job);
        }
        assert!(!mask.allows(Job::Suspend));
    }

    #[test]
    fn test_job_names() {
        assert_eq!(Job::MigrationOp.to_string(), "migration-op");
        assert_eq!(AsyncJob::MigrationOut.to_string(), "migration-out");
    }
}
