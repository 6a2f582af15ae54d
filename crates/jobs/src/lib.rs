// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Per-domain job coordination.
//!
//! Every API call that mutates a domain first acquires a job slot here.
//! Short jobs exclude each other; a long-running async job (migration,
//! save, dump, snapshot) holds the async slot for its whole lifetime while
//! selectively admitting short jobs through its mask, and the async owner
//! itself re-enters through nested jobs for each monitor interaction.

#[macro_use]
extern crate slog;

logging::logger_with_subsystem!(sl, "jobs");

mod coordinator;
mod record;
mod stats;

pub use coordinator::{AsyncJobTicket, JobCoordinator, JobPersister, JobTicket};
pub use record::{AsyncJob, Job, JobMask, JobSnapshot};
pub use stats::{JobStats, JobStatsStatus};
