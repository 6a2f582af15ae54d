// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Domain runtime state and the lifecycle events the daemon emits when the
//! state changes.

use serde::{Deserialize, Serialize};

/// The coarse runtime state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DomainState {
    Shutoff,
    Starting,
    Running,
    Paused,
    MigratingIn,
    MigratingOut,
    Stopping,
}

impl DomainState {
    pub fn is_active(self) -> bool {
        !matches!(self, DomainState::Shutoff)
    }
}

/// Why the domain is in its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum StateReason {
    Unknown,
    User,
    Booted,
    Migration,
    Save,
    Dump,
    Snapshot,
    IoError,
    Watchdog,
    Crashed,
    Destroyed,
    Failed,
    Shutdown,
    FromSnapshot,
}

/// Lifecycle edges reported to event listeners registered with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainEvent {
    Started { reason: StartedReason },
    Suspended { reason: SuspendedReason },
    Resumed { reason: ResumedReason },
    Stopped { reason: StoppedReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartedReason {
    Booted,
    Migrated,
    Restored,
    FromSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendedReason {
    Paused,
    Migrated,
    IoError,
    Watchdog,
    Dump,
    Save,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumedReason {
    Unpaused,
    Migrated,
    FromSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppedReason {
    Shutdown,
    Destroyed,
    Crashed,
    Migrated,
    Saved,
    Failed,
    FromSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(DomainState::MigratingOut.to_string(), "migrating-out");
        assert!(DomainState::Paused.is_active());
        assert!(!DomainState::Shutoff.is_active());
    }
}
