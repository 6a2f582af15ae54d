// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Per-VM status persistence.
//!
//! For every running domain the daemon keeps one status document in the
//! state directory, atomically rewritten on every tracked job transition.
//! After a daemon restart the document is all that is needed to reattach to
//! the hypervisor process and decide how to resume or roll back an
//! interrupted operation.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vmm_types::config::DomainConfig;

#[derive(thiserror::Error, Debug)]
pub enum PersistError {
    #[error("no status recorded for domain {0}")]
    NotFound(String),

    #[error("corrupt status document {0}: {1}")]
    Corrupt(PathBuf, serde_json::Error),

    #[error("state directory I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("serializing status: {0}")]
    Serialize(serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PersistError>;

/// Job fields carried in the status document. Plain strings so that the
/// document layer stays decoupled from the coordinator types.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatusRecord {
    pub active: String,
    pub async_job: String,
    pub phase: String,
    #[serde(default)]
    pub owner: u64,
    #[serde(default)]
    pub async_owner: u64,
}

/// The persisted per-VM status document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainStatus {
    pub def: DomainConfig,
    pub monitor_path: PathBuf,
    pub monitor_type: String,
    pub pid: i32,
    #[serde(default)]
    pub vcpu_pids: Vec<i32>,
    #[serde(default)]
    pub iothread_pids: Vec<i32>,
    /// Negotiated capability flags, as raw bits.
    #[serde(default)]
    pub caps: u64,
    #[serde(default)]
    pub lock_state: Option<String>,
    #[serde(default)]
    pub job: JobStatusRecord,
    #[serde(default)]
    pub fake_reboot: bool,
    #[serde(default)]
    pub device_aliases: Vec<String>,
}

/// Disk-backed store of status documents, one per domain name.
#[derive(Debug, Clone)]
pub struct StatusStore {
    state_dir: PathBuf,
}

impl StatusStore {
    pub fn new<P: AsRef<Path>>(state_dir: P) -> Result<Self> {
        fs::create_dir_all(state_dir.as_ref())?;
        Ok(StatusStore {
            state_dir: state_dir.as_ref().to_path_buf(),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn status_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", name))
    }

    /// Atomically replace the status document: write a temporary sibling,
    /// flush it to stable storage, then rename over the old document.
    pub fn save(&self, status: &DomainStatus) -> Result<()> {
        let path = self.status_path(&status.def.name);
        let tmp = path.with_extension("json.new");

        let data = serde_json::to_vec_pretty(status).map_err(PersistError::Serialize)?;

        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        File::open(&self.state_dir)?.sync_all()?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<DomainStatus> {
        let path = self.status_path(name);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|e| PersistError::Corrupt(path, e))
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.status_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all domains with a persisted status, for the reconnect sweep.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = vec![];
        for entry in fs::read_dir(&self.state_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use vmm_types::config::*;

    fn status(name: &str) -> DomainStatus {
        DomainStatus {
            def: DomainConfig {
                name: name.to_string(),
                uuid: Uuid::new_v4(),
                vcpus: 1,
                iothreads: 0,
                memory_kib: 524288,
                mem_tune: MemTune::default(),
                cpu_tune: CpuTune::default(),
                blkio_tune: BlkioTune::default(),
                numa_tune: None,
                disks: vec![],
                controllers: vec![],
                nets: vec![],
                graphics: vec![],
                sounds: vec![],
                hostdevs: vec![],
                chardevs: vec![],
                rngs: vec![],
                tpm: None,
                require_invtsc: false,
            },
            monitor_path: PathBuf::from("/run/vmmd/test.monitor"),
            monitor_type: "unix".into(),
            pid: 4242,
            vcpu_pids: vec![4243, 4244],
            iothread_pids: vec![],
            caps: 0,
            lock_state: None,
            job: JobStatusRecord {
                active: "none".into(),
                async_job: "migration-out".into(),
                phase: "perform3".into(),
                owner: 0,
                async_owner: 7,
            },
            fake_reboot: false,
            device_aliases: vec!["virtio-disk0".into()],
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path()).unwrap();

        let st = status("vm1");
        store.save(&st).unwrap();

        let loaded = store.load("vm1").unwrap();
        assert_eq!(loaded.def.uuid, st.def.uuid);
        assert_eq!(loaded.job.phase, "perform3");
        assert_eq!(loaded.device_aliases, vec!["virtio-disk0".to_string()]);
    }

    #[test]
    fn test_save_is_atomic_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path()).unwrap();

        let mut st = status("vm1");
        store.save(&st).unwrap();
        st.job.phase = "perform3_done".into();
        store.save(&st).unwrap();

        // No temporary residue, and the second write wins.
        assert!(!store.status_path("vm1").with_extension("json.new").exists());
        assert_eq!(store.load("vm1").unwrap().job.phase, "perform3_done");
    }

    #[test]
    fn test_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.load("nope"),
            Err(PersistError::NotFound(_))
        ));
        store.remove("nope").unwrap();
    }

    #[test]
    fn test_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path()).unwrap();
        store.save(&status("b")).unwrap();
        store.save(&status("a")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
