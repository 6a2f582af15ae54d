// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Migration feature flags and the persisted phase identifiers of the
//! multi-step migration protocol.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Feature flags consumed by the migration entry points.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MigrateFlags: u32 {
        const LIVE              = 1 << 0;
        const PEER2PEER         = 1 << 1;
        const TUNNELLED         = 1 << 2;
        const PERSIST_DEST      = 1 << 3;
        const UNDEFINE_SOURCE   = 1 << 4;
        const PAUSED            = 1 << 5;
        const NON_SHARED_DISK   = 1 << 6;
        const NON_SHARED_INC    = 1 << 7;
        const CHANGE_PROTECTION = 1 << 8;
        const UNSAFE            = 1 << 9;
        const OFFLINE           = 1 << 10;
        const COMPRESSED        = 1 << 11;
        const ABORT_ON_ERROR    = 1 << 12;
        const AUTO_CONVERGE     = 1 << 13;
        const RDMA_PIN_ALL      = 1 << 14;
    }
}

/// Persisted sub-state of a migration async job. The numeric order is
/// meaningful: a phase may never move backwards within one job.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    None,
    Perform2,
    Begin3,
    Perform3,
    Perform3Done,
    Confirm3Cancelled,
    Confirm3,
    Prepare,
    Finish2,
    Finish3,
}

impl Default for MigrationPhase {
    fn default() -> Self {
        MigrationPhase::None
    }
}

/// Default TCP port window from which migration listeners are allocated.
pub const MIGRATION_PORT_MIN: u16 = 49152;
pub const MIGRATION_PORT_MAX: u16 = 49215;

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_phase_names_are_stable() {
        let names: Vec<String> = [
            MigrationPhase::None,
            MigrationPhase::Perform2,
            MigrationPhase::Begin3,
            MigrationPhase::Perform3,
            MigrationPhase::Perform3Done,
            MigrationPhase::Confirm3Cancelled,
            MigrationPhase::Confirm3,
            MigrationPhase::Prepare,
            MigrationPhase::Finish2,
            MigrationPhase::Finish3,
        ]
        .iter()
        .map(|p| p.to_string())
        .collect();

        assert_eq!(
            names,
            vec![
                "none",
                "perform2",
                "begin3",
                "perform3",
                "perform3_done",
                "confirm3_cancelled",
                "confirm3",
                "prepare",
                "finish2",
                "finish3",
            ]
        );
    }

    #[test]
    fn test_phase_round_trip() {
        let p = MigrationPhase::from_str("perform3_done").unwrap();
        assert_eq!(p, MigrationPhase::Perform3Done);
        assert!(MigrationPhase::Begin3 < MigrationPhase::Perform3);
    }

    #[test]
    fn test_flags() {
        let flags = MigrateFlags::LIVE | MigrateFlags::NON_SHARED_DISK;
        assert!(flags.contains(MigrateFlags::NON_SHARED_DISK));
        assert!(!flags.contains(MigrateFlags::TUNNELLED));
    }
}
