// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Reattaching to running VMs after a daemon restart.
//!
//! For every persisted status document: rebuild the domain object, reopen
//! the monitor against the stored path, find the existing machine cgroup,
//! and decide from the recovered job phase whether the interrupted
//! operation is discarded, cancelled, or finalized.

use std::str::FromStr;
use std::sync::Arc;

use hypervisor::Domain;
use jobs::AsyncJob;
use migration::{decide_recovery, RecoveryAction};
use monitor::{MonitorConfig, MonitorTransportKind, QmpChannel};
use persist::DomainStatus;
use vmm_types::migrate::MigrationPhase;
use vmm_types::state::{DomainState, StateReason, StoppedReason};
use vmm_types::{Result, VmmError};

use crate::driver::VmmDriver;

/// Sweep the state directory and recover every domain recorded there.
pub async fn reconnect_all(driver: &VmmDriver) {
    let names = match driver.context().store.list() {
        Ok(names) => names,
        Err(e) => {
            error!(sl!(), "cannot scan state directory: {}", e);
            return;
        }
    };

    for name in names {
        match reconnect_one(driver, &name).await {
            Ok(true) => info!(sl!(), "reconnected to domain"; "name" => &name),
            Ok(false) => info!(sl!(), "domain is gone, dropped its state"; "name" => &name),
            Err(e) => {
                warn!(sl!(), "failed to reconnect"; "name" => &name, "error" => e.to_string());
            }
        }
    }
}

/// Returns Ok(true) when the VM is alive and adopted, Ok(false) when its
/// process has exited and the state was cleaned up.
async fn reconnect_one(driver: &VmmDriver, name: &str) -> Result<bool> {
    let status = driver
        .context()
        .store
        .load(name)
        .map_err(|e| VmmError::OperationFailed(format!("loading status: {}", e)))?;

    if !process_alive(status.pid) {
        driver
            .context()
            .store
            .remove(name)
            .map_err(|e| VmmError::OperationFailed(format!("dropping status: {}", e)))?;
        return Ok(false);
    }

    let domain = rebuild_domain(driver, &status).await?;

    // Reopen the control channel; a VM we cannot talk to is unusable and
    // gets killed rather than leaked.
    let handler = hypervisor::monitor_handler(&domain);
    let channel = QmpChannel::open(
        MonitorConfig {
            path: status.monitor_path.clone(),
            kind: if status.monitor_type == "pty" {
                MonitorTransportKind::Pty
            } else {
                MonitorTransportKind::Unix
            },
            pid: status.pid,
            log_path: Some(hypervisor::VmLogFile::log_path(
                &driver.context().log_dir,
                name,
            )),
        },
        handler,
    )
    .await;
    let channel = match channel {
        Ok(channel) => channel,
        Err(e) => {
            warn!(sl!(), "monitor unreachable, killing stale hypervisor";
                "name" => name, "error" => e.to_string());
            let _ = driver.context().launcher.kill(status.pid).await;
            let _ = driver.context().store.remove(name);
            return Ok(false);
        }
    };

    {
        let mut inner = domain.lock().await;
        inner.mon = Some(channel.clone());
    }

    // The guest's current run state comes from the hypervisor itself.
    let running = channel
        .query_status()
        .await
        .map(|s| s.running)
        .unwrap_or(false);
    {
        let mut inner = domain.lock().await;
        let state = if running {
            DomainState::Running
        } else {
            DomainState::Paused
        };
        inner.set_state(state, StateReason::Unknown);
    }

    // Rediscover the machine cgroup and heal an emptied cpuset.
    if driver.context().privileged {
        match resource::CgroupController::attach_existing(
            &driver.context().cgroup_partition,
            name,
        ) {
            Ok(cgroup) => {
                if let Err(e) = cgroup.restore_cpuset_mems(&driver.config.host_nodeset) {
                    warn!(sl!(), "restoring cpuset.mems failed"; "error" => e.to_string());
                }
                domain.lock().await.cgroup = Some(Arc::new(cgroup));
            }
            Err(e) => {
                warn!(sl!(), "cannot reattach machine cgroup"; "error" => e.to_string());
            }
        }
    }

    recover_job(&domain, &status).await?;

    driver.adopt(domain.clone())?;
    let _ = domain.save_status().await;
    Ok(true)
}

async fn rebuild_domain(driver: &VmmDriver, status: &DomainStatus) -> Result<Arc<Domain>> {
    let domain = Domain::new(status.def.clone(), true, driver.context());
    {
        let mut inner = domain.lock().await;
        inner.pid = Some(status.pid);
        inner.monitor_path = Some(status.monitor_path.clone());
        inner.monitor_kind = if status.monitor_type == "pty" {
            MonitorTransportKind::Pty
        } else {
            MonitorTransportKind::Unix
        };
        inner.vcpu_pids = status.vcpu_pids.clone();
        inner.iothread_pids = status.iothread_pids.clone();
        inner.caps = hypervisor::CapFlags::from_bits_persisted(status.caps);
        inner.lock_state = status.lock_state.clone();
        inner.fake_reboot = status.fake_reboot;
        for alias in &status.device_aliases {
            inner.aliases.insert(alias.clone());
        }
        // Restore the device address reservations from the definition.
        for disk in &inner.def.disks {
            if let Some(vmm_types::config::DeviceAddress::Pci(addr)) = disk.address {
                let _ = domain.pci.reserve(addr);
            }
        }
        for net in &inner.def.nets {
            if let Some(vmm_types::config::DeviceAddress::Pci(addr)) = net.address {
                let _ = domain.pci.reserve(addr);
            }
        }
        inner.set_state(DomainState::Running, StateReason::Unknown);
    }
    Ok(domain)
}

/// Act on the persisted in-flight job.
async fn recover_job(domain: &Arc<Domain>, status: &DomainStatus) -> Result<()> {
    let async_job = AsyncJob::from_str(&status.job.async_job).unwrap_or(AsyncJob::None);
    let phase = MigrationPhase::from_str(&status.job.phase).unwrap_or(MigrationPhase::None);
    if async_job == AsyncJob::None {
        return Ok(());
    }

    let action = decide_recovery(async_job, phase);
    info!(sl!(), "recovering interrupted job";
        "job" => status.job.async_job.clone(),
        "phase" => status.job.phase.clone(),
        "action" => format!("{:?}", action));

    match action {
        RecoveryAction::Discard => {}
        RecoveryAction::CancelAndDiscard => {
            if let Ok(mon) = domain.enter_monitor().await {
                let _ = mon.migrate_cancel().await;
                let _ = domain.exit_monitor(mon).await;
            }
            // The guest stays on this host; let it run again if the
            // interrupted operation had paused it.
            let paused = domain.lock().await.state == DomainState::Paused;
            if paused {
                if let Ok(mon) = domain.enter_monitor().await {
                    if mon.cont().await.is_ok() {
                        let mut inner = domain.lock().await;
                        inner.set_state(DomainState::Running, StateReason::Unknown);
                    }
                    let _ = domain.exit_monitor(mon).await;
                }
            }
        }
        RecoveryAction::Finalize => {
            // The stream completed but the closing handshake is gone with
            // the peer connection. Whether the destination resumed the
            // guest cannot be decided from here alone; keep our copy
            // paused for the operator instead of risking a split brain.
            warn!(sl!(), "migration was past the point of no return; leaving domain paused");
        }
        RecoveryAction::Kill => {
            domain.stop_process(StoppedReason::Failed).await?;
            return Err(VmmError::OperationFailed(
                "incoming migration did not survive the restart".to_string(),
            ));
        }
    }
    Ok(())
}

fn process_alive(pid: i32) -> bool {
    pid > 0 && nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
