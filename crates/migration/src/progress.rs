// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The source-side progress loop: poll the hypervisor every 50 ms, keep
//! the job statistics fresh, and react to cancellation, guest I/O errors
//! and a vanished destination.

use std::sync::Arc;
use std::time::Duration;

use hypervisor::Domain;
use jobs::{AsyncJobTicket, JobStatsStatus};
use monitor::MigrateInfo;
use vmm_types::migrate::MigrateFlags;
use vmm_types::state::{DomainState, StateReason};
use vmm_types::{Result, VmmError};

use crate::peer::DestinationPeer;

const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SPICE_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn fold_into_stats(stats: &mut jobs::JobStats, info: &MigrateInfo) {
    stats.elapsed_ms = info.total_time_ms;
    stats.downtime_ms = info.downtime_ms;
    stats.setup_time_ms = info.setup_time_ms;
    if let Some(ram) = &info.ram {
        stats.mem_total = ram.total;
        stats.mem_processed = ram.transferred;
        stats.mem_remaining = ram.remaining;
        stats.mem_constant = ram.duplicate;
        stats.mem_normal = ram.normal;
        stats.mem_normal_bytes = ram.normal_bytes;
        stats.mem_bps = (ram.mbps * 1_000_000.0 / 8.0) as u64;
    }
    if let Some(disk) = &info.disk {
        stats.disk_total = disk.total;
        stats.disk_processed = disk.transferred;
        stats.disk_remaining = disk.remaining;
    }
    if let Some(cache) = &info.xbzrle_cache {
        stats.xbzrle_cache_size = cache.cache_size;
        stats.xbzrle_bytes = cache.bytes;
        stats.xbzrle_pages = cache.pages;
        stats.xbzrle_cache_miss = cache.cache_miss;
        stats.xbzrle_overflow = cache.overflow;
    }
    stats.update_totals();
}

/// Drive the migration to a terminal status. Ok(()) means the hypervisor
/// reported completion.
pub(crate) async fn wait_for_completion(
    domain: &Arc<Domain>,
    ticket: &AsyncJobTicket,
    flags: MigrateFlags,
    peer: Option<&dyn DestinationPeer>,
) -> Result<()> {
    loop {
        tokio::time::sleep(PROGRESS_POLL_INTERVAL).await;

        // Cooperative cancel wins over everything else.
        if domain.jobs.abort_requested().await {
            let mon = domain.enter_monitor_async(ticket).await?;
            let _ = mon.migrate_cancel().await;
            let _ = domain.exit_monitor(mon).await;
            let _ = domain
                .jobs
                .complete_current(ticket, JobStatsStatus::Cancelled)
                .await;
            return Err(VmmError::OperationAborted(
                "migration job: canceled by client".to_string(),
            ));
        }

        // A guest that stopped on I/O error cannot migrate consistently.
        if flags.contains(MigrateFlags::ABORT_ON_ERROR) {
            let inner = domain.lock().await;
            if inner.state == DomainState::Paused && inner.reason == StateReason::IoError {
                drop(inner);
                let mon = domain.enter_monitor_async(ticket).await?;
                let _ = mon.migrate_cancel().await;
                let _ = domain.exit_monitor(mon).await;
                return Err(VmmError::OperationFailed(
                    "migration job: failed due to I/O error".to_string(),
                ));
            }
        }

        if let Some(peer) = peer {
            if !peer.alive().await {
                let mon = domain.enter_monitor_async(ticket).await?;
                let _ = mon.migrate_cancel().await;
                let _ = domain.exit_monitor(mon).await;
                return Err(VmmError::OperationFailed(
                    "migration job: lost connection to destination host".to_string(),
                ));
            }
        }

        let mon = domain.enter_monitor_async(ticket).await?;
        let info = mon.query_migrate().await.map_err(VmmError::from);
        domain.exit_monitor(mon).await?;
        let info = info?;

        let _ = domain
            .jobs
            .update_current(ticket, |stats| fold_into_stats(stats, &info))
            .await;

        match info.status.as_str() {
            "completed" => {
                let _ = domain
                    .jobs
                    .complete_current(ticket, JobStatsStatus::Completed)
                    .await;
                return Ok(());
            }
            "active" | "setup" => continue,
            "inactive" => {
                let _ = domain
                    .jobs
                    .complete_current(ticket, JobStatsStatus::Failed)
                    .await;
                return Err(VmmError::OperationFailed(
                    "migration job: is not active".to_string(),
                ));
            }
            "cancelled" => {
                let _ = domain
                    .jobs
                    .complete_current(ticket, JobStatsStatus::Cancelled)
                    .await;
                return Err(VmmError::OperationAborted(
                    "migration job: canceled by client".to_string(),
                ));
            }
            other => {
                debug!(sl!(), "terminal migration status"; "status" => other);
                let _ = domain
                    .jobs
                    .complete_current(ticket, JobStatsStatus::Failed)
                    .await;
                return Err(VmmError::OperationFailed(
                    "migration job: unexpectedly failed".to_string(),
                ));
            }
        }
    }
}

/// With seamless SPICE relocation, wait until the server reports its
/// client moved before the CPUs stop for good.
pub(crate) async fn wait_for_spice(domain: &Arc<Domain>, ticket: &AsyncJobTicket) -> Result<()> {
    loop {
        let mon = domain.enter_monitor_async(ticket).await?;
        let info = mon.query_spice_migration().await;
        domain.exit_monitor(mon).await?;
        match info {
            Ok(info) if info.migrated => return Ok(()),
            Ok(_) => {}
            Err(e) if e.is_command_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if domain.jobs.abort_requested().await {
            return Err(VmmError::OperationAborted(
                "migration job: canceled by client".to_string(),
            ));
        }
        tokio::time::sleep(SPICE_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_into_stats() {
        let mut stats = jobs::JobStats::active();
        let info: MigrateInfo = serde_json::from_value(serde_json::json!({
            "status": "active",
            "ram": {
                "total": 1000, "remaining": 400, "transferred": 600,
                "duplicate": 12, "normal": 500, "normal-bytes": 2048000,
                "mbps": 8.0
            },
            "disk": { "total": 100, "remaining": 0, "transferred": 100 },
            "total-time": 2500,
            "downtime": 12
        }))
        .unwrap();
        fold_into_stats(&mut stats, &info);
        assert_eq!(stats.mem_remaining, 400);
        assert_eq!(stats.data_total, 1100);
        assert_eq!(stats.mem_bps, 1_000_000);
        assert_eq!(stats.downtime_ms, Some(12));
    }
}
