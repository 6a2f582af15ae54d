// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The NBD side channel for non-shared disks.
//!
//! The destination starts the hypervisor's NBD server and exports every
//! writable disk; the source mirrors each of those disks into the exports
//! and only then runs the main migrate with the block flags cleared.

use std::sync::Arc;
use std::time::Duration;

use hypervisor::Domain;
use jobs::AsyncJobTicket;
use vmm_types::config::{DiskConfig, StorageSource};
use vmm_types::{Result, VmmError};

use crate::cookie::{CookieNbd, CookieNbdDisk};

const MIRROR_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Disks that travel through the NBD channel: writable, with a source.
pub(crate) fn nbd_disks(disks: &[DiskConfig]) -> Vec<&DiskConfig> {
    disks
        .iter()
        .filter(|d| d.is_writable() && d.source.is_some())
        .collect()
}

/// Destination side: start the NBD server on a freshly allocated port and
/// export every eligible disk. The chosen port travels back in the cookie.
pub(crate) async fn start_nbd_server(
    domain: &Arc<Domain>,
    ticket: &AsyncJobTicket,
    listen_address: &str,
    ports: &resource::PortAllocator,
) -> Result<u16> {
    let port = ports.acquire()?;

    let exports: Vec<String> = {
        let inner = domain.lock().await;
        nbd_disks(&inner.def.disks)
            .iter()
            .filter_map(|d| d.drive_id())
            .collect()
    };

    let result = async {
        let mon = domain.enter_monitor_async(ticket).await?;
        let outcome = async {
            mon.nbd_server_start(listen_address, port)
                .await
                .map_err(VmmError::from)?;
            for drive_id in &exports {
                mon.nbd_server_add(drive_id, true)
                    .await
                    .map_err(VmmError::from)?;
            }
            Ok(())
        }
        .await;
        domain.exit_monitor(mon).await?;
        outcome
    }
    .await;

    match result {
        Ok(()) => {
            domain.lock().await.nbd_port = Some(port);
            Ok(port)
        }
        Err(e) => {
            // Unpublished port: the acquire must be undone here.
            ports.release(port);
            Err(e)
        }
    }
}

pub(crate) async fn stop_nbd_server(domain: &Arc<Domain>, ticket: &AsyncJobTicket) {
    let port = domain.lock().await.nbd_port.take();
    if port.is_none() {
        return;
    }
    if let Ok(mon) = domain.enter_monitor_async(ticket).await {
        if let Err(e) = mon.nbd_server_stop().await {
            debug!(sl!(), "nbd-server-stop failed"; "error" => e.to_string());
        }
        let _ = domain.exit_monitor(mon).await;
    }
}

/// Destination side: pre-create local images for disks the source will
/// copy, using the capacities reported in the cookie. Only plain files and
/// pool volumes with a resolved path can be materialized here.
pub(crate) fn precreate_disks(def: &vmm_types::config::DomainConfig, nbd: &CookieNbd) -> Result<()> {
    for entry in &nbd.disks {
        let disk = def.disk_by_target(&entry.target).ok_or_else(|| {
            VmmError::OperationFailed(format!(
                "source wants to copy unknown disk {}",
                entry.target
            ))
        })?;
        let source = match &disk.source {
            Some(source) => source,
            None => continue,
        };
        match source {
            StorageSource::File { path } => {
                if path.exists() {
                    continue;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(path)
                    .map_err(|e| {
                        VmmError::OperationFailed(format!(
                            "pre-creating {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                file.set_len(entry.capacity).map_err(|e| {
                    VmmError::OperationFailed(format!(
                        "sizing {} to {} bytes: {}",
                        path.display(),
                        entry.capacity,
                        e
                    ))
                })?;
            }
            StorageSource::Volume {
                path: Some(path), ..
            } => {
                if !path.exists() {
                    return Err(VmmError::OperationFailed(format!(
                        "volume for disk {} must be created by the pool driver at {}",
                        entry.target,
                        path.display()
                    )));
                }
            }
            other => {
                return Err(VmmError::ConfigUnsupported(format!(
                    "pre-creation of {} storage is not supported for disk {}",
                    other.kind_name(),
                    entry.target
                )));
            }
        }
    }
    Ok(())
}

/// Build the cookie section advertising the NBD port and the disks worth
/// copying.
pub(crate) async fn nbd_cookie_section(domain: &Arc<Domain>, port: u16) -> CookieNbd {
    let inner = domain.lock().await;
    CookieNbd {
        port,
        disks: nbd_disks(&inner.def.disks)
            .iter()
            .map(|d| CookieNbdDisk {
                target: d.dst.clone(),
                capacity: d.capacity_bytes.unwrap_or(0),
            })
            .collect(),
    }
}

/// Source side: mirror every eligible disk into the destination's NBD
/// exports and wait until all mirrors are fully synchronized. Writes then
/// reach both sides until the main migrate takes over.
pub(crate) async fn mirror_to_nbd(
    domain: &Arc<Domain>,
    ticket: &AsyncJobTicket,
    dest_host: &str,
    nbd: &CookieNbd,
    speed: u64,
) -> Result<()> {
    // The cookie names the destination's listen port; which disks travel
    // is decided by the same eligibility rule both sides share.
    let drives: Vec<String> = {
        let inner = domain.lock().await;
        nbd_disks(&inner.def.disks)
            .iter()
            .filter_map(|d| d.drive_id())
            .collect()
    };

    let result = async {
        for drive_id in &drives {
            let target = format!("nbd:{}:{}:exportname={}", dest_host, nbd.port, drive_id);
            let mon = domain.enter_monitor_async(ticket).await?;
            let started = mon
                .drive_mirror(drive_id, &target, None, speed)
                .await
                .map_err(VmmError::from);
            domain.exit_monitor(mon).await?;
            started?;
            domain.lock().await.mirror_active.insert(drive_id.clone());
        }

        // Poll until every mirror has caught up.
        loop {
            if domain.jobs.abort_requested().await {
                return Err(VmmError::OperationAborted(
                    "migration job: canceled by client".to_string(),
                ));
            }

            let mon = domain.enter_monitor_async(ticket).await?;
            let jobs_info = mon.query_block_jobs().await.map_err(VmmError::from);
            domain.exit_monitor(mon).await?;
            let jobs_info = jobs_info?;

            let mut pending = false;
            {
                let mut inner = domain.lock().await;
                for drive_id in &drives {
                    if !inner.mirror_active.contains(drive_id) {
                        continue;
                    }
                    match jobs_info.iter().find(|j| &j.device == drive_id) {
                        Some(job) if job.offset == job.len && job.len > 0 => {
                            // Fully copied; writes now go to both sides.
                            inner.mirror_active.remove(drive_id);
                        }
                        Some(_) => pending = true,
                        None => {
                            return Err(VmmError::OperationFailed(format!(
                                "mirror job for {} disappeared",
                                drive_id
                            )));
                        }
                    }
                }
            }
            if !pending {
                break;
            }
            tokio::time::sleep(MIRROR_POLL_INTERVAL).await;
        }
        Ok(())
    }
    .await;

    if result.is_err() {
        cancel_all_mirrors(domain, ticket).await;
    }
    result
}

/// Best-effort cancellation of every outstanding mirror; the first error
/// that got us here is what the caller reports.
pub(crate) async fn cancel_all_mirrors(domain: &Arc<Domain>, ticket: &AsyncJobTicket) {
    let drives: Vec<String> = {
        let mut inner = domain.lock().await;
        inner.mirror_active.drain().collect()
    };
    if drives.is_empty() {
        return;
    }
    if let Ok(mon) = domain.enter_monitor_async(ticket).await {
        for drive_id in &drives {
            if let Err(e) = mon.block_job_cancel(drive_id).await {
                debug!(sl!(), "cancelling mirror failed";
                    "drive" => drive_id, "error" => e.to_string());
            }
        }
        let _ = domain.exit_monitor(mon).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use vmm_types::config::{CacheMode, DiskBus, DiskDevice, DiskFormat};

    fn disk(dst: &str, readonly: bool) -> DiskConfig {
        DiskConfig {
            dst: dst.to_string(),
            bus: DiskBus::Virtio,
            device: DiskDevice::Disk,
            source: Some(StorageSource::File {
                path: PathBuf::from(format!("/var/vm/{}.qcow2", dst)),
            }),
            format: DiskFormat::Qcow2,
            readonly,
            shared: false,
            cache: CacheMode::None,
            backing: vec![],
            alias: None,
            address: None,
            capacity_bytes: Some(10_737_418_240),
            controller: None,
            unit: None,
        }
    }

    #[test]
    fn test_only_writable_sourced_disks_are_exported() {
        let mut cdrom = disk("hdc", true);
        cdrom.device = DiskDevice::Cdrom;
        cdrom.source = None;
        let disks = vec![disk("vda", false), disk("vdb", true), cdrom];
        let eligible = nbd_disks(&disks);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].dst, "vda");
    }

    #[test]
    fn test_precreate_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.qcow2");
        let mut def = serde_json::from_value::<vmm_types::config::DomainConfig>(
            serde_json::json!({
                "name": "vm1",
                "uuid": uuid::Uuid::new_v4().to_string(),
                "vcpus": 1, "iothreads": 0, "memory_kib": 1024
            }),
        )
        .unwrap();
        let mut d = disk("vda", false);
        d.source = Some(StorageSource::File { path: path.clone() });
        def.disks.push(d);

        precreate_disks(
            &def,
            &CookieNbd {
                port: 49152,
                disks: vec![CookieNbdDisk {
                    target: "vda".into(),
                    capacity: 4096,
                }],
            },
        )
        .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn test_precreate_refuses_block_targets() {
        let mut def = serde_json::from_value::<vmm_types::config::DomainConfig>(
            serde_json::json!({
                "name": "vm1",
                "uuid": uuid::Uuid::new_v4().to_string(),
                "vcpus": 1, "iothreads": 0, "memory_kib": 1024
            }),
        )
        .unwrap();
        let mut d = disk("vda", false);
        d.source = Some(StorageSource::Block {
            path: PathBuf::from("/dev/vg0/lv0"),
        });
        def.disks.push(d);

        let err = precreate_disks(
            &def,
            &CookieNbd {
                port: 49152,
                disks: vec![CookieNbdDisk {
                    target: "vda".into(),
                    capacity: 4096,
                }],
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "config-unsupported");
    }
}
