// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Deciding what to do with an interrupted migration after a daemon
//! restart, based on the persisted async job and phase.

use jobs::AsyncJob;
use vmm_types::migrate::MigrationPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Drop the job record; the guest keeps running untouched.
    Discard,
    /// Tell the hypervisor to cancel the half-done stream, then discard
    /// the job; the guest keeps running here.
    CancelAndDiscard,
    /// The stream finished before the restart; run the terminal phase
    /// (confirm on the source, finish on the destination).
    Finalize,
    /// An incoming guest never completed its arrival; kill the process.
    Kill,
}

/// Map a recovered (job, phase) pair onto the action the daemon takes.
pub fn decide_recovery(job: AsyncJob, phase: MigrationPhase) -> RecoveryAction {
    match job {
        AsyncJob::MigrationOut => match phase {
            // Nothing had left this host yet.
            MigrationPhase::None | MigrationPhase::Begin3 => RecoveryAction::Discard,
            // The stream may still be moving; stop it before letting the
            // guest run on.
            MigrationPhase::Perform2 | MigrationPhase::Perform3 => {
                RecoveryAction::CancelAndDiscard
            }
            // The guest-visible state fully left; only the handshake tail
            // is missing.
            MigrationPhase::Perform3Done | MigrationPhase::Confirm3 => RecoveryAction::Finalize,
            MigrationPhase::Confirm3Cancelled => RecoveryAction::CancelAndDiscard,
            // Destination-side phases make no sense on an outbound job.
            _ => RecoveryAction::Discard,
        },
        AsyncJob::MigrationIn => match phase {
            // The guest never fully arrived.
            MigrationPhase::None | MigrationPhase::Prepare => RecoveryAction::Kill,
            MigrationPhase::Finish2 | MigrationPhase::Finish3 => RecoveryAction::Finalize,
            _ => RecoveryAction::Kill,
        },
        // Other async jobs just lose their progress.
        AsyncJob::Save | AsyncJob::Dump | AsyncJob::Snapshot => RecoveryAction::CancelAndDiscard,
        AsyncJob::None => RecoveryAction::Discard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_recovery_matrix() {
        assert_eq!(
            decide_recovery(AsyncJob::MigrationOut, MigrationPhase::Begin3),
            RecoveryAction::Discard
        );
        assert_eq!(
            decide_recovery(AsyncJob::MigrationOut, MigrationPhase::Perform3),
            RecoveryAction::CancelAndDiscard
        );
        assert_eq!(
            decide_recovery(AsyncJob::MigrationOut, MigrationPhase::Perform3Done),
            RecoveryAction::Finalize
        );
    }

    #[test]
    fn test_inbound_recovery_matrix() {
        assert_eq!(
            decide_recovery(AsyncJob::MigrationIn, MigrationPhase::Prepare),
            RecoveryAction::Kill
        );
        assert_eq!(
            decide_recovery(AsyncJob::MigrationIn, MigrationPhase::Finish3),
            RecoveryAction::Finalize
        );
    }

    #[test]
    fn test_other_async_jobs_cancel() {
        assert_eq!(
            decide_recovery(AsyncJob::Save, MigrationPhase::None),
            RecoveryAction::CancelAndDiscard
        );
        assert_eq!(
            decide_recovery(AsyncJob::None, MigrationPhase::None),
            RecoveryAction::Discard
        );
    }
}
