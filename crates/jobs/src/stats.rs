// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatsStatus {
    None,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl Default for JobStatsStatus {
    fn default() -> Self {
        JobStatsStatus::None
    }
}

/// Progress counters of an async job. Updated by the operation itself from
/// hypervisor reports; the completed copy is kept after the job ends and
/// travels in the migration cookie's statistics block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub status: JobStatsStatus,

    pub elapsed_ms: u64,
    #[serde(default)]
    pub downtime_ms: Option<u64>,
    #[serde(default)]
    pub setup_time_ms: Option<u64>,

    pub data_total: u64,
    pub data_processed: u64,
    pub data_remaining: u64,

    pub mem_total: u64,
    pub mem_processed: u64,
    pub mem_remaining: u64,
    pub mem_bps: u64,
    /// Pages unchanged since the last pass.
    pub mem_constant: u64,
    pub mem_normal: u64,
    pub mem_normal_bytes: u64,

    pub disk_total: u64,
    pub disk_processed: u64,
    pub disk_remaining: u64,
    pub disk_bps: u64,

    pub xbzrle_cache_size: u64,
    pub xbzrle_bytes: u64,
    pub xbzrle_pages: u64,
    pub xbzrle_cache_miss: u64,
    pub xbzrle_overflow: u64,
}

impl JobStats {
    pub fn active() -> Self {
        JobStats {
            status: JobStatsStatus::Active,
            ..Default::default()
        }
    }

    /// Fold the memory and disk counters into the aggregate data counters.
    pub fn update_totals(&mut self) {
        self.data_total = self.mem_total + self.disk_total;
        self.data_processed = self.mem_processed + self.disk_processed;
        self.data_remaining = self.mem_remaining + self.disk_remaining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_totals() {
        let mut stats = JobStats::active();
        stats.mem_total = 100;
        stats.mem_processed = 40;
        stats.mem_remaining = 60;
        stats.disk_total = 10;
        stats.disk_remaining = 10;
        stats.update_totals();
        assert_eq!(stats.data_total, 110);
        assert_eq!(stats.data_processed, 40);
        assert_eq!(stats.data_remaining, 70);
    }
}
