// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Disk-only snapshots via an atomic hypervisor transaction, with
//! per-VM metadata under `<snapshot-dir>/<name>/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use jobs::{AsyncJob, JobStatsStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use vmm_types::config::{BackingChainNode, DiskFormat, StorageSource};
use vmm_types::state::DomainState;
use vmm_types::{Result, VmmError};

use crate::capabilities::CapFlags;
use crate::domain::Domain;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDiskMeta {
    pub dst: String,
    pub overlay: PathBuf,
    pub backing: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub name: String,
    pub created_unix: u64,
    pub domain_state: DomainState,
    pub disks: Vec<SnapshotDiskMeta>,
}

/// Metadata files of one VM's snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    base: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(snapshot_dir: P) -> Self {
        SnapshotStore {
            base: snapshot_dir.as_ref().to_path_buf(),
        }
    }

    fn vm_dir(&self, vm_name: &str) -> PathBuf {
        self.base.join(vm_name)
    }

    fn meta_path(&self, vm_name: &str, snap_name: &str) -> PathBuf {
        self.vm_dir(vm_name).join(format!("{}.json", snap_name))
    }

    pub fn save(&self, vm_name: &str, meta: &SnapshotMeta) -> Result<()> {
        let dir = self.vm_dir(vm_name);
        std::fs::create_dir_all(&dir)
            .map_err(|e| VmmError::OperationFailed(format!("creating snapshot dir: {}", e)))?;
        let data = serde_json::to_vec_pretty(meta)
            .map_err(|e| VmmError::InternalError(format!("encoding snapshot meta: {}", e)))?;
        std::fs::write(self.meta_path(vm_name, &meta.name), data)
            .map_err(|e| VmmError::OperationFailed(format!("writing snapshot meta: {}", e)))
    }

    pub fn load(&self, vm_name: &str, snap_name: &str) -> Result<SnapshotMeta> {
        let path = self.meta_path(vm_name, snap_name);
        let data = std::fs::read(&path).map_err(|e| {
            VmmError::OperationInvalid(format!("no snapshot {} for {}: {}", snap_name, vm_name, e))
        })?;
        serde_json::from_slice(&data)
            .map_err(|e| VmmError::InternalError(format!("corrupt snapshot meta: {}", e)))
    }

    pub fn list(&self, vm_name: &str) -> Result<Vec<String>> {
        let dir = self.vm_dir(vm_name);
        let mut names = vec![];
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => {
                return Err(VmmError::OperationFailed(format!(
                    "reading snapshot dir: {}",
                    e
                )))
            }
        };
        for entry in entries {
            let path = entry
                .map_err(|e| VmmError::OperationFailed(format!("reading snapshot dir: {}", e)))?
                .path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn remove(&self, vm_name: &str, snap_name: &str) -> Result<()> {
        match std::fs::remove_file(self.meta_path(vm_name, snap_name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VmmError::OperationFailed(format!(
                "removing snapshot meta: {}",
                e
            ))),
        }
    }
}

impl Domain {
    /// Take a disk-only snapshot of every local qcow2 disk, atomically.
    pub async fn snapshot_disks(self: &Arc<Self>, snap_name: &str) -> Result<()> {
        let ticket = self.jobs.begin_async_job(AsyncJob::Snapshot).await?;
        let result = self.snapshot_disks_locked(&ticket, snap_name).await;
        let status = if result.is_ok() {
            JobStatsStatus::Completed
        } else {
            JobStatsStatus::Failed
        };
        let _ = self.jobs.complete_current(&ticket, status).await;
        self.jobs.end_async_job(ticket).await;
        result
    }

    async fn snapshot_disks_locked(
        self: &Arc<Self>,
        ticket: &jobs::AsyncJobTicket,
        snap_name: &str,
    ) -> Result<()> {
        let (name, state, targets) = {
            let inner = self.lock().await;
            inner.require_active()?;
            if !inner.caps.contains(CapFlags::TRANSACTION) {
                return Err(VmmError::OperationUnsupported(
                    "this hypervisor cannot take atomic multi-disk snapshots".to_string(),
                ));
            }
            let mut targets = vec![];
            for disk in &inner.def.disks {
                if disk.format != DiskFormat::Qcow2 {
                    continue;
                }
                let path = match disk.source.as_ref().and_then(StorageSource::path) {
                    Some(path) => path.to_path_buf(),
                    None => continue,
                };
                let drive_id = match disk.drive_id() {
                    Some(id) => id,
                    None => continue,
                };
                let overlay = PathBuf::from(format!("{}.{}", path.display(), snap_name));
                targets.push((disk.dst.clone(), drive_id, path, overlay));
            }
            (inner.def.name.clone(), inner.state, targets)
        };

        if targets.is_empty() {
            return Err(VmmError::ConfigUnsupported(
                "domain has no snapshottable qcow2 disks".to_string(),
            ));
        }

        let actions: Vec<serde_json::Value> = targets
            .iter()
            .map(|(_, drive_id, _, overlay)| {
                json!({
                    "type": "blockdev-snapshot-sync",
                    "data": {
                        "device": drive_id,
                        "snapshot-file": overlay.to_string_lossy(),
                        "format": "qcow2",
                    }
                })
            })
            .collect();

        let mon = self.enter_monitor_async(ticket).await?;
        let taken = mon.transaction(actions).await.map_err(VmmError::from);
        self.exit_monitor(mon).await?;
        taken?;

        // The overlays are now the live top nodes; the old tops become
        // read-only backing entries.
        {
            let mut inner = self.lock().await;
            for (dst, _, old_path, overlay) in &targets {
                if let Some(index) = inner.def.disk_index_by_target(dst) {
                    let disk = &mut inner.def.disks[index];
                    disk.backing.insert(
                        0,
                        BackingChainNode {
                            source: StorageSource::File {
                                path: old_path.clone(),
                            },
                            format: DiskFormat::Qcow2,
                            readonly: true,
                        },
                    );
                    disk.source = Some(StorageSource::File {
                        path: overlay.clone(),
                    });
                }
            }
        }

        let meta = SnapshotMeta {
            name: snap_name.to_string(),
            created_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            domain_state: state,
            disks: targets
                .iter()
                .map(|(dst, _, old_path, overlay)| SnapshotDiskMeta {
                    dst: dst.clone(),
                    overlay: overlay.clone(),
                    backing: old_path.clone(),
                })
                .collect(),
        };
        SnapshotStore::new(&self.ctx.snapshot_dir).save(&name, &meta)?;
        let _ = self.save_status().await;
        info!(sl!(), "disk snapshot taken"; "name" => snap_name, "ok" => true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let meta = SnapshotMeta {
            name: "before-upgrade".into(),
            created_unix: 1700000000,
            domain_state: DomainState::Running,
            disks: vec![SnapshotDiskMeta {
                dst: "vda".into(),
                overlay: PathBuf::from("/var/vm/a.qcow2.before-upgrade"),
                backing: PathBuf::from("/var/vm/a.qcow2"),
            }],
        };
        store.save("vm1", &meta).unwrap();
        let loaded = store.load("vm1", "before-upgrade").unwrap();
        assert_eq!(loaded.disks[0].dst, "vda");
        assert_eq!(store.list("vm1").unwrap(), vec!["before-upgrade".to_string()]);
        store.remove("vm1", "before-upgrade").unwrap();
        assert!(store.list("vm1").unwrap().is_empty());
    }

    #[test]
    fn test_list_missing_vm_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store.list("ghost").unwrap().is_empty());
    }
}
