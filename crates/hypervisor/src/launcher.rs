// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The seam to the hypervisor launcher. Building the full command line is
//! the job of a collaborator outside the core; the trait fixes what the
//! core needs back from it.

use std::path::PathBuf;
use std::process::Stdio;

use vmm_types::config::DomainConfig;
use vmm_types::{Result, VmmError};

/// What a successful launch hands back to the core.
#[derive(Debug, Clone)]
pub struct LaunchedVm {
    pub pid: i32,
    pub monitor_path: PathBuf,
}

#[async_trait::async_trait]
pub trait VmLauncher: Send + Sync {
    /// Start the hypervisor for `def`, paused, with its monitor socket at a
    /// path of the launcher's choosing. `incoming` carries the migration
    /// listen directive for destination-side starts.
    async fn launch(
        &self,
        def: &DomainConfig,
        log_path: &std::path::Path,
        incoming: Option<&str>,
    ) -> Result<LaunchedVm>;

    /// Terminate the hypervisor process.
    async fn kill(&self, pid: i32) -> Result<()>;
}

/// Minimal launcher driving a QEMU-family binary directly. Production
/// deployments plug in their own command builder.
pub struct ProcessLauncher {
    pub binary: PathBuf,
    pub run_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(binary: PathBuf, run_dir: PathBuf) -> Self {
        ProcessLauncher { binary, run_dir }
    }

    fn monitor_path(&self, def: &DomainConfig) -> PathBuf {
        self.run_dir.join(format!("{}.monitor", def.name))
    }
}

#[async_trait::async_trait]
impl VmLauncher for ProcessLauncher {
    async fn launch(
        &self,
        def: &DomainConfig,
        log_path: &std::path::Path,
        incoming: Option<&str>,
    ) -> Result<LaunchedVm> {
        std::fs::create_dir_all(&self.run_dir)
            .map_err(|e| VmmError::OperationFailed(format!("creating run dir: {}", e)))?;
        let monitor_path = self.monitor_path(def);

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| VmmError::OperationFailed(format!("opening VM log: {}", e)))?;
        let log_err = log
            .try_clone()
            .map_err(|e| VmmError::OperationFailed(format!("cloning VM log fd: {}", e)))?;

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("-name")
            .arg(&def.name)
            .arg("-uuid")
            .arg(def.uuid.to_string())
            .arg("-smp")
            .arg(def.vcpus.to_string())
            .arg("-m")
            .arg((def.memory_kib / 1024).to_string())
            .arg("-qmp")
            .arg(format!(
                "unix:{},server,nowait",
                monitor_path.to_string_lossy()
            ))
            .arg("-S")
            .arg("-nodefaults")
            .arg("-nographic")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        if let Some(incoming) = incoming {
            cmd.arg("-incoming").arg(incoming);
        }

        let child = cmd
            .spawn()
            .map_err(|e| VmmError::OperationFailed(format!("launching hypervisor: {}", e)))?;
        let pid = child
            .id()
            .ok_or_else(|| VmmError::InternalError("spawned hypervisor has no pid".to_string()))?
            as i32;

        info!(sl!(), "launched hypervisor"; "name" => &def.name, "pid" => pid);
        Ok(LaunchedVm {
            pid,
            monitor_path,
        })
    }

    async fn kill(&self, pid: i32) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let target = Pid::from_raw(pid);
        if kill(target, Signal::SIGTERM).is_err() {
            // Already gone.
            return Ok(());
        }
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            if kill(target, None).is_err() {
                return Ok(());
            }
        }
        let _ = kill(target, Signal::SIGKILL);
        Ok(())
    }
}
