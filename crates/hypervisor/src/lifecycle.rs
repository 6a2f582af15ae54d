// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Domain lifecycle operations: start, stop, pause, resume, reset,
//! powerdown, wakeup, plus the save and dump async jobs.

use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jobs::{AsyncJob, AsyncJobTicket, Job, JobStatsStatus};
use monitor::{MonitorConfig, MonitorTransportKind, QmpChannel};
use vmm_types::state::{
    DomainEvent, DomainState, StartedReason, StateReason, StoppedReason, SuspendedReason,
};
use vmm_types::{Result, VmmError};

use crate::capabilities;
use crate::domain::Domain;
use crate::events::DomainMonitorHandler;
use crate::vmlog::VmLogFile;

const MIGRATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl Domain {
    /// Boot the domain. `paused` leaves the vCPUs stopped.
    pub async fn start(self: &Arc<Self>, paused: bool) -> Result<()> {
        let ticket = self.jobs.begin_job(Job::Modify).await?;
        let result = self.start_locked(paused).await;
        self.jobs.end_job(ticket).await;
        result
    }

    async fn start_locked(self: &Arc<Self>, paused: bool) -> Result<()> {
        let def = {
            let mut inner = self.lock().await;
            if inner.state.is_active() {
                return Err(VmmError::OperationInvalid(format!(
                    "domain {} is already running",
                    inner.def.name
                )));
            }
            inner.set_state(DomainState::Starting, StateReason::Booted);
            inner.def.clone()
        };

        match self.boot_process(&def, paused, None).await {
            Ok(()) => {
                self.save_status().await?;
                self.emit_event(DomainEvent::Started {
                    reason: StartedReason::Booted,
                })
                .await;
                Ok(())
            }
            Err(e) => {
                // The process may already be up; never leak it.
                let pid = self.lock().await.pid;
                if let Some(pid) = pid {
                    let _ = self.ctx.launcher.kill(pid).await;
                }
                self.teardown_process(StateReason::Failed).await;
                Err(e)
            }
        }
    }

    /// Launch the hypervisor and bring the domain object up around it.
    /// Shared between fresh boots and migration-destination starts (which
    /// pass an incoming directive and always stay paused). The caller owns
    /// the job bracket.
    pub async fn boot_process(
        self: &Arc<Self>,
        def: &vmm_types::config::DomainConfig,
        paused: bool,
        incoming: Option<&str>,
    ) -> Result<()> {
        let log = VmLogFile::open(&self.ctx.log_dir, &def.name, true)?;
        let launched = self.ctx.launcher.launch(def, log.path(), incoming).await?;
        {
            // Record the pid right away so error paths can reap it.
            let mut inner = self.lock().await;
            inner.pid = Some(launched.pid);
        }

        // Resource isolation before the guest starts computing.
        let cgroup = if self.ctx.privileged {
            match resource::CgroupController::new_machine(
                &self.ctx.cgroup_partition,
                &def.name,
                launched.pid,
            ) {
                Ok(cgroup) => Some(Arc::new(cgroup)),
                Err(e) => {
                    warn!(sl!(), "cgroups unavailable, running without isolation";
                        "error" => e.to_string());
                    None
                }
            }
        } else {
            None
        };
        {
            // Stored immediately: teardown on a failed start must see it.
            let mut inner = self.lock().await;
            inner.cgroup = cgroup.clone();
        }
        if let Some(cgroup) = &cgroup {
            cgroup.setup_devices(def, &self.ctx.device_policy, |_| None)?;
            cgroup.setup_blkio(&def.blkio_tune)?;
            cgroup.setup_memory(&def.mem_tune)?;
            cgroup.setup_cpu_shares(&def.cpu_tune)?;
        }

        let handler = Arc::new(DomainMonitorHandler {
            domain: Arc::downgrade(self),
        });
        let mon = QmpChannel::open(
            MonitorConfig {
                path: launched.monitor_path.clone(),
                kind: MonitorTransportKind::Unix,
                pid: launched.pid,
                log_path: Some(log.path().to_path_buf()),
            },
            handler,
        )
        .await
        .map_err(VmmError::from)?;

        let caps = capabilities::probe(&mon).await?;
        // One-shot balloon discovery; the path is cached on the channel.
        match mon.find_balloon_path().await {
            Ok(Some(path)) => debug!(sl!(), "balloon device"; "path" => path),
            Ok(None) => {}
            Err(e) => debug!(sl!(), "balloon discovery failed"; "error" => e.to_string()),
        }
        let vcpu_pids: Vec<i32> = mon
            .query_cpus()
            .await
            .map_err(VmmError::from)?
            .iter()
            .map(|c| c.thread_id)
            .collect();
        let iothread_pids: Vec<i32> = match mon.query_iothreads().await {
            Ok(threads) => threads.iter().map(|t| t.thread_id).collect(),
            Err(e) if e.is_command_not_found() => vec![],
            Err(e) => return Err(e.into()),
        };

        if let Some(cgroup) = &cgroup {
            cgroup.place_emulator(launched.pid)?;
            cgroup.place_vcpus(&vcpu_pids, launched.pid)?;
            cgroup.place_iothreads(&iothread_pids)?;
            for pin in &def.cpu_tune.vcpupin {
                cgroup.setup_cpuset_cpus(&[(pin.id, true, pin.cpuset.clone())], None)?;
            }
            for pin in &def.cpu_tune.iothreadpin {
                cgroup.setup_cpuset_cpus(&[(pin.id, false, pin.cpuset.clone())], None)?;
            }
            if let Some(emulatorpin) = &def.cpu_tune.emulatorpin {
                cgroup.setup_cpuset_cpus(&[], Some(emulatorpin))?;
            }
            for index in 0..vcpu_pids.len() as u32 {
                cgroup.setup_vcpu_bandwidth(
                    index,
                    def.cpu_tune.period_us,
                    def.cpu_tune.quota_us,
                )?;
            }
            cgroup.setup_emulator_bandwidth(
                def.cpu_tune.emulator_period_us,
                def.cpu_tune.emulator_quota_us,
            )?;
            if let Some(numa) = &def.numa_tune {
                if numa.mode == vmm_types::config::NumaMode::Strict {
                    if let Some(nodeset) = &numa.nodeset {
                        cgroup.setup_cpuset_mems(nodeset)?;
                    }
                }
            }
        }

        self.ctx.lock_manager.acquire_all(def).await?;
        self.ctx.security.set_process_label(def).await?;

        {
            let mut inner = self.lock().await;
            inner.pid = Some(launched.pid);
            inner.monitor_path = Some(launched.monitor_path);
            inner.monitor_kind = MonitorTransportKind::Unix;
            inner.monitor_dead = false;
            inner.mon = Some(mon.clone());
            inner.caps = caps;
            inner.vcpu_pids = vcpu_pids;
            inner.iothread_pids = iothread_pids;
            inner.cgroup = cgroup;
            inner.lock_state = self.ctx.lock_manager.lease_state(def);
            let mut new_aliases = Vec::new();
            for disk in &mut inner.def.disks {
                if disk.alias.is_none() {
                    disk.alias = disk.default_alias();
                }
                if let Some(alias) = disk.alias.clone() {
                    new_aliases.push(alias);
                }
            }
            for alias in new_aliases {
                inner.aliases.insert(alias);
            }
        }

        if incoming.is_none() && !paused {
            let mon_guard = self.enter_monitor().await?;
            let started = mon_guard.cont().await.map_err(VmmError::from);
            self.exit_monitor(mon_guard).await?;
            started?;
            let mut inner = self.lock().await;
            inner.set_state(DomainState::Running, StateReason::Booted);
        } else {
            let mut inner = self.lock().await;
            let state = if incoming.is_some() {
                DomainState::MigratingIn
            } else {
                DomainState::Paused
            };
            let reason = if incoming.is_some() {
                StateReason::Migration
            } else {
                StateReason::User
            };
            inner.set_state(state, reason);
        }
        Ok(())
    }

    /// Forcefully stop the hypervisor process and take the domain object
    /// back to shutoff.
    pub async fn destroy(self: &Arc<Self>) -> Result<()> {
        let ticket = self.jobs.begin_job(Job::Destroy).await?;
        let result = self.stop_process(StoppedReason::Destroyed).await;
        self.jobs.end_job(ticket).await;
        result
    }

    /// Kill the process and revert the domain to shutoff. The caller owns
    /// whatever job bracket applies (destroy job, migration async job).
    pub async fn stop_process(self: &Arc<Self>, why: StoppedReason) -> Result<()> {
        let (pid, mon, def) = {
            let mut inner = self.lock().await;
            inner.require_active()?;
            inner.set_state(DomainState::Stopping, StateReason::Destroyed);
            (inner.pid, inner.mon.take(), inner.def.clone())
        };

        if let Some(mon) = mon {
            mon.close();
        }
        if let Some(pid) = pid {
            self.ctx.launcher.kill(pid).await?;
        }

        self.run_cleanup_callbacks().await;
        if let Err(e) = self.ctx.lock_manager.release_all(&def).await {
            warn!(sl!(), "releasing leases on stop failed"; "error" => e.to_string());
        }

        let reason = match why {
            StoppedReason::Shutdown => StateReason::Shutdown,
            StoppedReason::Migrated => StateReason::Migration,
            StoppedReason::Saved => StateReason::Save,
            StoppedReason::Crashed => StateReason::Crashed,
            StoppedReason::Failed => StateReason::Failed,
            _ => StateReason::Destroyed,
        };
        self.teardown_process(reason).await;
        self.remove_status().await?;
        self.emit_event(DomainEvent::Stopped { reason: why }).await;
        Ok(())
    }

    /// Drop all runtime state after the process is gone.
    async fn teardown_process(&self, reason: StateReason) {
        let cgroup = {
            let mut inner = self.lock().await;
            inner.set_state(DomainState::Shutoff, reason);
            inner.pid = None;
            inner.mon = None;
            inner.monitor_path = None;
            inner.monitor_dead = false;
            inner.vcpu_pids.clear();
            inner.iothread_pids.clear();
            inner.caps = crate::capabilities::CapFlags::empty();
            inner.aliases.clear();
            inner.mirror_active.clear();
            inner.tray_open.clear();
            inner.nbd_port = None;
            inner.premigration_state = None;
            inner.cgroup.take()
        };
        if let Some(cgroup) = cgroup {
            if let Err(e) = cgroup.remove() {
                warn!(sl!(), "removing machine cgroup failed"; "error" => e.to_string());
            }
        }
    }

    /// Pause the vCPUs.
    pub async fn pause(self: &Arc<Self>) -> Result<()> {
        let ticket = self.jobs.begin_job(Job::Suspend).await?;
        let result = async {
            {
                let inner = self.lock().await;
                inner.require_active()?;
                if inner.state == DomainState::Paused {
                    return Err(VmmError::OperationInvalid(
                        "domain is already paused".to_string(),
                    ));
                }
            }
            let mon = self.enter_monitor().await?;
            let stopped = mon.stop_cpus().await.map_err(VmmError::from);
            self.exit_monitor(mon).await?;
            stopped?;
            let mut inner = self.lock().await;
            inner.set_state(DomainState::Paused, StateReason::User);
            Ok(())
        }
        .await;
        self.jobs.end_job(ticket).await;
        if result.is_ok() {
            self.save_status().await?;
            self.emit_event(DomainEvent::Suspended {
                reason: SuspendedReason::Paused,
            })
            .await;
        }
        result
    }

    /// Resume paused vCPUs.
    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        let ticket = self.jobs.begin_job(Job::Modify).await?;
        let result = async {
            {
                let inner = self.lock().await;
                inner.require_active()?;
                if inner.state != DomainState::Paused {
                    return Err(VmmError::OperationInvalid(
                        "domain is not paused".to_string(),
                    ));
                }
            }
            let mon = self.enter_monitor().await?;
            let started = mon.cont().await.map_err(VmmError::from);
            self.exit_monitor(mon).await?;
            started?;
            let mut inner = self.lock().await;
            inner.set_state(DomainState::Running, StateReason::User);
            Ok(())
        }
        .await;
        self.jobs.end_job(ticket).await;
        if result.is_ok() {
            self.save_status().await?;
            self.emit_event(DomainEvent::Resumed {
                reason: vmm_types::state::ResumedReason::Unpaused,
            })
            .await;
        }
        result
    }

    /// Hard reset without guest involvement.
    pub async fn reset(self: &Arc<Self>) -> Result<()> {
        self.simple_monitor_op(Job::Modify, |mon| Box::pin(async move {
            mon.system_reset().await
        }))
        .await
    }

    /// Ask the guest to power down via ACPI.
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        self.simple_monitor_op(Job::Modify, |mon| Box::pin(async move {
            mon.system_powerdown().await
        }))
        .await
    }

    /// Wake a guest from S3/S4.
    pub async fn wakeup(self: &Arc<Self>) -> Result<()> {
        self.simple_monitor_op(Job::Modify, |mon| Box::pin(async move {
            mon.system_wakeup().await
        }))
        .await
    }

    async fn simple_monitor_op<F>(self: &Arc<Self>, job: Job, op: F) -> Result<()>
    where
        F: for<'a> FnOnce(
            &'a crate::domain::MonitorGuard,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = std::result::Result<(), monitor::MonitorError>>
                + Send
                + 'a>,
        >,
    {
        let ticket = self.jobs.begin_job(job).await?;
        let result = async {
            self.lock().await.require_active()?;
            let mon = self.enter_monitor().await?;
            let outcome = op(&mon).await.map_err(VmmError::from);
            self.exit_monitor(mon).await?;
            outcome
        }
        .await;
        self.jobs.end_job(ticket).await;
        result
    }

    /// Save the guest memory image to `path` and stop the VM.
    pub async fn save_to_file(self: &Arc<Self>, path: &Path) -> Result<()> {
        let ticket = self.jobs.begin_async_job(AsyncJob::Save).await?;
        let result = self
            .migrate_to_file(&ticket, path, "save", StateReason::Save)
            .await;
        match &result {
            Ok(()) => {
                let _ = self.jobs.complete_current(&ticket, JobStatsStatus::Completed).await;
            }
            Err(_) => {
                let _ = self.jobs.complete_current(&ticket, JobStatsStatus::Failed).await;
            }
        }
        let stop = if result.is_ok() {
            self.stop_process(StoppedReason::Saved).await
        } else {
            Ok(())
        };
        self.jobs.end_async_job(ticket).await;
        result.and(stop)
    }

    /// Dump guest memory to `path`; the guest keeps running (resumed if it
    /// was running before).
    pub async fn dump_to_file(self: &Arc<Self>, path: &Path) -> Result<()> {
        let ticket = self.jobs.begin_async_job(AsyncJob::Dump).await?;
        let was_running = self.lock().await.state == DomainState::Running;
        let result = self
            .migrate_to_file(&ticket, path, "dump", StateReason::Dump)
            .await;
        if was_running {
            if let Ok(mon) = self.enter_monitor_async(&ticket).await {
                let resumed = mon.cont().await;
                let _ = self.exit_monitor(mon).await;
                if resumed.is_ok() {
                    let mut inner = self.lock().await;
                    inner.set_state(DomainState::Running, StateReason::User);
                }
            }
        }
        let status = if result.is_ok() {
            JobStatsStatus::Completed
        } else {
            JobStatsStatus::Failed
        };
        let _ = self.jobs.complete_current(&ticket, status).await;
        self.jobs.end_async_job(ticket).await;
        result
    }

    /// Stream guest memory into a host file through a passed descriptor.
    async fn migrate_to_file(
        self: &Arc<Self>,
        ticket: &AsyncJobTicket,
        path: &Path,
        fdname: &str,
        pause_reason: StateReason,
    ) -> Result<()> {
        {
            let inner = self.lock().await;
            inner.require_active()?;
        }

        // Stop the CPUs so the image is consistent.
        let was_running = {
            let inner = self.lock().await;
            inner.state == DomainState::Running
        };
        if was_running {
            let mon = self.enter_monitor_async(ticket).await?;
            let stopped = mon.stop_cpus().await.map_err(VmmError::from);
            self.exit_monitor(mon).await?;
            stopped?;
            let mut inner = self.lock().await;
            inner.set_state(DomainState::Paused, pause_reason);
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                VmmError::OperationFailed(format!("opening {}: {}", path.display(), e))
            })?;

        let mon = self.enter_monitor_async(ticket).await?;
        let kicked = async {
            mon.getfd(fdname, file.as_raw_fd())
                .await
                .map_err(VmmError::from)?;
            mon.migrate_to_fd(fdname).await.map_err(VmmError::from)
        }
        .await;
        self.exit_monitor(mon).await?;
        kicked?;

        // Poll until the stream finishes, honoring cooperative abort.
        loop {
            tokio::time::sleep(MIGRATE_POLL_INTERVAL).await;

            if self.jobs.abort_requested().await {
                let mon = self.enter_monitor_async(ticket).await?;
                let _ = mon.migrate_cancel().await;
                let _ = self.exit_monitor(mon).await;
                return Err(VmmError::OperationAborted(format!(
                    "{} job: canceled by client",
                    fdname
                )));
            }

            let mon = self.enter_monitor_async(ticket).await?;
            let info = mon.query_migrate().await.map_err(VmmError::from);
            self.exit_monitor(mon).await?;
            let info = info?;

            let _ = self
                .jobs
                .update_current(ticket, |stats| {
                    stats.elapsed_ms = info.total_time_ms;
                    if let Some(ram) = &info.ram {
                        stats.mem_total = ram.total;
                        stats.mem_processed = ram.transferred;
                        stats.mem_remaining = ram.remaining;
                    }
                    stats.update_totals();
                })
                .await;

            match info.status.as_str() {
                "completed" => break,
                "active" | "setup" => continue,
                "cancelled" => {
                    return Err(VmmError::OperationAborted(format!(
                        "{} job: canceled by client",
                        fdname
                    )))
                }
                "inactive" => {
                    return Err(VmmError::OperationFailed(format!(
                        "{} job: is not active",
                        fdname
                    )))
                }
                _ => {
                    return Err(VmmError::OperationFailed(format!(
                        "{} job: unexpectedly failed",
                        fdname
                    )))
                }
            }
        }

        let mon = self.enter_monitor_async(ticket).await?;
        if let Err(e) = mon.closefd(fdname).await {
            debug!(sl!(), "closefd after stream"; "name" => fdname, "error" => e.to_string());
        }
        let _ = self.exit_monitor(mon).await;
        Ok(())
    }
}
