// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Transactional device hotplug.
//!
//! Every attach is a transaction: lease, security label and cgroup rules go
//! onto a rollback stack before the hypervisor sees the device, and the
//! stack unwinds in reverse on any failure from that point on. Detach waits
//! for the peer's DEVICE_DELETED notification (bounded), then tears the
//! same state down.

mod disk;
mod graphics;
mod net;

pub use disk::{attach_disk, change_disk_media, detach_disk};
pub use graphics::update_graphics;
pub use net::{attach_net, classify_net_update, detach_net, update_net, NetUpdateAction};

use std::time::Duration;

use vmm_types::config::{DiskConfig, PciAddress};
use vmm_types::Result;

use crate::domain::Domain;

/// How long a detach waits for the peer's deletion notification.
pub(crate) const DEVICE_REMOVAL_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const TRAY_POLL_ATTEMPTS: u32 = 10;
pub(crate) const TRAY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One undo step of an attach transaction.
pub(crate) enum Rollback {
    ReleaseLease(Box<DiskConfig>),
    RestoreLabel(Box<DiskConfig>),
    TeardownCgroup(Box<DiskConfig>),
    ReleasePci(PciAddress),
}

/// Undo stack run in reverse order; errors during rollback are logged, the
/// original failure is what the caller reports.
pub(crate) struct RollbackStack {
    steps: Vec<Rollback>,
}

impl RollbackStack {
    pub fn new() -> Self {
        RollbackStack { steps: vec![] }
    }

    pub fn push(&mut self, step: Rollback) {
        self.steps.push(step);
    }

    /// Forget the steps: the transaction committed.
    pub fn commit(mut self) {
        self.steps.clear();
    }

    pub async fn unwind(mut self, domain: &Domain) {
        let def = domain.lock().await.def.clone();
        let cgroup = domain.lock().await.cgroup.clone();
        while let Some(step) = self.steps.pop() {
            let result: Result<()> = match step {
                Rollback::ReleaseLease(disk) => {
                    domain.ctx.lock_manager.release_disk(&def, &disk).await
                }
                Rollback::RestoreLabel(disk) => {
                    domain.ctx.security.restore_disk_label(&def, &disk).await
                }
                Rollback::TeardownCgroup(disk) => match &cgroup {
                    Some(cgroup) => cgroup.teardown_disk(&disk),
                    None => Ok(()),
                },
                Rollback::ReleasePci(addr) => {
                    domain.pci.release(addr);
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!(sl!(), "rollback step failed"; "error" => e.to_string());
            }
        }
    }
}

/// Deferred cleanup driven by a DEVICE_DELETED event that arrived without
/// an armed waiter (timed-out detach or guest-initiated unplug).
pub async fn remove_device_by_alias(domain: &Domain, alias: &str) -> Result<()> {
    let dst = {
        let inner = domain.lock().await;
        inner
            .def
            .disks
            .iter()
            .find(|d| d.alias.as_deref() == Some(alias))
            .map(|d| d.dst.clone())
    };
    if let Some(dst) = dst {
        return disk::complete_disk_detach(domain, &dst).await;
    }

    let mac = {
        let inner = domain.lock().await;
        inner
            .def
            .nets
            .iter()
            .find(|n| n.alias.as_deref() == Some(alias))
            .map(|n| n.mac.clone())
    };
    if let Some(mac) = mac {
        return net::complete_net_detach(domain, &mac).await;
    }

    debug!(sl!(), "deletion notice for unknown alias"; "alias" => alias);
    Ok(())
}

/// Hot-unplug of one function of a populated multifunction slot would rip
/// the siblings out with it.
pub(crate) fn check_multifunction(
    domain: &Domain,
    address: Option<&vmm_types::config::DeviceAddress>,
    dst: &str,
) -> Result<()> {
    if let Some(vmm_types::config::DeviceAddress::Pci(addr)) = address {
        if domain.pci.functions_in_slot(*addr) > 1 {
            return Err(vmm_types::VmmError::OperationFailed(format!(
                "cannot hot unplug multifunction PCI device: {}",
                dst
            )));
        }
    }
    Ok(())
}
