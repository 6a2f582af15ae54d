// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Daemon configuration, loaded from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use vmm_types::migrate::{MIGRATION_PORT_MAX, MIGRATION_PORT_MIN};
use vmm_types::{Result, VmmError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub run_dir: PathBuf,
    pub qemu_binary: PathBuf,

    /// Partition the per-VM machine cgroups live under.
    pub cgroup_partition: String,
    /// Override of the default device node allow-list.
    pub cgroup_device_acl: Option<Vec<String>>,
    pub allow_host_audio_without_graphics: bool,
    pub allow_host_audio_vnc: bool,
    pub privileged: bool,

    /// 0 means unlimited.
    pub max_queued_jobs: u32,
    pub job_wait_seconds: u64,

    pub migration_port_min: u16,
    pub migration_port_max: u16,
    pub migration_listen: String,
    /// Our FQDN as advertised to migration peers. Empty means "ask the
    /// kernel".
    pub hostname: String,
    /// Host memory nodes, used to restore cpuset.mems after a restart.
    pub host_nodeset: String,

    pub log_level: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            state_dir: PathBuf::from("/run/vmmd"),
            log_dir: PathBuf::from("/var/log/vmmd"),
            snapshot_dir: PathBuf::from("/var/lib/vmmd/snapshots"),
            run_dir: PathBuf::from("/run/vmmd/sockets"),
            qemu_binary: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            cgroup_partition: resource::DEFAULT_PARTITION.to_string(),
            cgroup_device_acl: None,
            allow_host_audio_without_graphics: false,
            allow_host_audio_vnc: false,
            privileged: true,
            max_queued_jobs: 0,
            job_wait_seconds: 30,
            migration_port_min: MIGRATION_PORT_MIN,
            migration_port_max: MIGRATION_PORT_MAX,
            migration_listen: "0.0.0.0".to_string(),
            hostname: String::new(),
            host_nodeset: "0".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl DriverConfig {
    pub fn load(path: &Path) -> Result<DriverConfig> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VmmError::OperationFailed(format!("reading config {}: {}", path.display(), e))
        })?;
        toml::from_str(&text).map_err(|e| {
            VmmError::ConfigUnsupported(format!("parsing config {}: {}", path.display(), e))
        })
    }

    pub fn job_wait(&self) -> Duration {
        Duration::from_secs(self.job_wait_seconds)
    }

    /// The hostname advertised in cookies and default URIs.
    pub fn effective_hostname(&self) -> String {
        if !self.hostname.is_empty() {
            return self.hostname.clone();
        }
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.migration_port_min, 49152);
        assert_eq!(cfg.migration_port_max, 49215);
        assert_eq!(cfg.cgroup_partition, "/machine");
        assert_eq!(cfg.job_wait(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_partial_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "hostname = \"host-a.example.com\"").unwrap();
        writeln!(f, "max_queued_jobs = 12").unwrap();
        let cfg = DriverConfig::load(f.path()).unwrap();
        assert_eq!(cfg.effective_hostname(), "host-a.example.com");
        assert_eq!(cfg.max_queued_jobs, 12);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.migration_listen, "0.0.0.0");
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "no_such_knob = true").unwrap();
        let err = DriverConfig::load(f.path()).unwrap_err();
        assert_eq!(err.code(), "config-unsupported");
    }
}
