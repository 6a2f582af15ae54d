// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Disk attach, detach and removable-media change.

use serde_json::json;
use vmm_types::config::{
    ControllerConfig, ControllerKind, DeviceAddress, DiskBus, DiskConfig, DiskDevice,
    StorageSource,
};
use vmm_types::{Result, VmmError};

use crate::capabilities::CapFlags;
use crate::domain::Domain;
use crate::hotplug::{
    check_multifunction, Rollback, RollbackStack, DEVICE_REMOVAL_TIMEOUT, TRAY_POLL_ATTEMPTS,
    TRAY_POLL_INTERVAL,
};

fn device_driver(disk: &DiskConfig) -> &'static str {
    match disk.bus {
        DiskBus::Virtio => "virtio-blk-pci",
        DiskBus::Scsi => "scsi-hd",
        DiskBus::Usb => "usb-storage",
        DiskBus::Ide | DiskBus::Sata => "ide-hd",
        DiskBus::Ccw => "virtio-blk-ccw",
    }
}

fn drive_props(disk: &DiskConfig, drive_id: &str) -> Result<serde_json::Value> {
    let path = disk
        .source
        .as_ref()
        .and_then(StorageSource::path)
        .ok_or_else(|| {
            VmmError::ConfigUnsupported(format!(
                "disk {} has no host path to attach",
                disk.dst
            ))
        })?;
    let mut props = json!({
        "id": drive_id,
        "file": path.to_string_lossy(),
        "format": disk.format.to_string(),
    });
    if disk.cache != vmm_types::config::CacheMode::Default {
        props["cache"] = json!(disk.cache.to_string());
    }
    if disk.readonly {
        props["readonly"] = json!(true);
    }
    Ok(props)
}

fn device_props(disk: &DiskConfig, alias: &str, drive_id: &str) -> serde_json::Value {
    let mut props = json!({
        "driver": device_driver(disk),
        "drive": drive_id,
        "id": alias,
    });
    match (disk.bus, &disk.address) {
        (DiskBus::Virtio, Some(DeviceAddress::Pci(addr))) => {
            props["bus"] = json!("pci.0");
            props["addr"] = json!(format!("0x{:x}", addr.slot));
        }
        (DiskBus::Scsi, _) => {
            if let Some(controller) = disk.controller {
                props["bus"] = json!(format!("scsi{}.0", controller));
            }
            if let Some(unit) = disk.unit {
                props["lun"] = json!(unit);
            }
        }
        _ => {}
    }
    props
}

/// Hot-add one disk. The caller holds a modify job.
pub async fn attach_disk(domain: &Domain, mut disk: DiskConfig) -> Result<()> {
    let def = {
        let inner = domain.lock().await;
        inner.require_active()?;
        if inner.def.disk_by_target(&disk.dst).is_some() {
            return Err(VmmError::OperationFailed(format!(
                "target {} already exists",
                disk.dst
            )));
        }
        inner.def.clone()
    };

    let mut rollback = RollbackStack::new();

    // Host-side preparation: lease, label, cgroup. Tracked for rollback.
    domain.ctx.lock_manager.acquire_disk(&def, &disk).await?;
    rollback.push(Rollback::ReleaseLease(Box::new(disk.clone())));

    if let Err(e) = domain.ctx.security.set_disk_label(&def, &disk).await {
        rollback.unwind(domain).await;
        return Err(e);
    }
    rollback.push(Rollback::RestoreLabel(Box::new(disk.clone())));

    {
        let cgroup = domain.lock().await.cgroup.clone();
        if let Some(cgroup) = cgroup {
            if let Err(e) = cgroup.setup_disk(&disk) {
                rollback.unwind(domain).await;
                return Err(e);
            }
            rollback.push(Rollback::TeardownCgroup(Box::new(disk.clone())));
        }
    }

    // Bus address: assign or honor the requested one. Released on failure.
    match disk.bus {
        DiskBus::Virtio => {
            let addr = match disk.address {
                Some(DeviceAddress::Pci(addr)) => {
                    if let Err(e) = domain.pci.reserve(addr) {
                        rollback.unwind(domain).await;
                        return Err(e);
                    }
                    addr
                }
                _ => match domain.pci.assign() {
                    Ok(addr) => addr,
                    Err(e) => {
                        rollback.unwind(domain).await;
                        return Err(e);
                    }
                },
            };
            disk.address = Some(DeviceAddress::Pci(addr));
            rollback.push(Rollback::ReleasePci(addr));
        }
        DiskBus::Scsi => {
            let controller = disk.controller.unwrap_or(0);
            if let Err(e) = ensure_scsi_controller(domain, controller).await {
                rollback.unwind(domain).await;
                return Err(e);
            }
            disk.controller = Some(controller);
        }
        _ => {}
    }

    let alias = match disk.alias.clone().or_else(|| disk.default_alias()) {
        Some(alias) => alias,
        None => {
            rollback.unwind(domain).await;
            return Err(VmmError::InternalError(format!(
                "cannot derive an alias for target {}",
                disk.dst
            )));
        }
    };
    disk.alias = Some(alias.clone());
    let drive_id = format!("{}{}", vmm_types::config::DRIVE_HOST_PREFIX, alias);

    let drive = match drive_props(&disk, &drive_id) {
        Ok(v) => v,
        Err(e) => {
            rollback.unwind(domain).await;
            return Err(e);
        }
    };
    let device = device_props(&disk, &alias, &drive_id);

    // Hypervisor side: drive first, then device; on device failure the
    // drive is deleted best-effort and the original error is preserved.
    let result = async {
        let mon = domain.enter_monitor().await?;
        let outcome = async {
            mon.drive_add(drive).await.map_err(VmmError::from)?;
            if let Err(device_err) = mon.device_add(device).await {
                if let Err(del_err) = mon.drive_del(&drive_id).await {
                    warn!(sl!(), "cannot roll back drive after device_add failure";
                        "drive" => &drive_id, "error" => del_err.to_string());
                }
                return Err(VmmError::from(device_err));
            }
            Ok(())
        }
        .await;
        domain.exit_monitor(mon).await?;
        outcome
    }
    .await;

    if let Err(e) = result {
        rollback.unwind(domain).await;
        info!(sl!(), "disk attach failed";
            "target" => &disk.dst, "ok" => false, "error" => e.to_string());
        return Err(e);
    }

    rollback.commit();
    {
        let mut inner = domain.lock().await;
        inner.aliases.insert(alias.clone());
        inner.def.disks.push(disk);
    }
    let _ = domain.save_status().await;
    info!(sl!(), "disk attached"; "alias" => &alias, "ok" => true);
    Ok(())
}

/// Make sure the SCSI controller with `index` exists, synthesizing and
/// hot-adding one when it does not.
pub async fn ensure_scsi_controller(domain: &Domain, index: u32) -> Result<()> {
    {
        let inner = domain.lock().await;
        if inner
            .def
            .controllers
            .iter()
            .any(|c| c.kind == ControllerKind::Scsi && c.index == index)
        {
            return Ok(());
        }
    }

    let addr = domain.pci.assign()?;
    let alias = format!("scsi{}", index);
    let props = json!({
        "driver": "virtio-scsi-pci",
        "id": alias,
        "bus": "pci.0",
        "addr": format!("0x{:x}", addr.slot),
    });

    let result = async {
        let mon = domain.enter_monitor().await?;
        let outcome = mon.device_add(props).await.map_err(VmmError::from);
        domain.exit_monitor(mon).await?;
        outcome
    }
    .await;

    if let Err(e) = result {
        domain.pci.release(addr);
        return Err(e);
    }

    let mut inner = domain.lock().await;
    inner.aliases.insert(alias.clone());
    inner.def.controllers.push(ControllerConfig {
        kind: ControllerKind::Scsi,
        index,
        model: Some("virtio-scsi-pci".to_string()),
        alias: Some(alias),
        address: Some(DeviceAddress::Pci(addr)),
    });
    Ok(())
}

/// Hot-remove one disk by target name. The caller holds a modify job.
pub async fn detach_disk(domain: &Domain, dst: &str) -> Result<()> {
    let (alias, has_event) = {
        let inner = domain.lock().await;
        inner.require_active()?;
        let disk = inner.def.disk_by_target(dst).ok_or_else(|| {
            VmmError::OperationInvalid(format!("disk {} not found in domain", dst))
        })?;
        let alias = disk.alias.clone().ok_or_else(|| {
            VmmError::InternalError(format!("disk {} has no device alias", dst))
        })?;
        check_multifunction(domain, disk.address.as_ref(), dst)?;
        (alias, inner.caps.contains(CapFlags::DEVICE_DELETED_EVENT))
    };

    if has_event {
        domain.removal_start(&alias);
    }

    let result = async {
        let mon = domain.enter_monitor().await?;
        let outcome = mon.device_del(&alias).await.map_err(VmmError::from);
        domain.exit_monitor(mon).await?;
        outcome
    }
    .await;

    if let Err(e) = result {
        if has_event {
            domain.removal_cancel();
        }
        return Err(e);
    }

    if has_event && !domain.removal_wait(DEVICE_REMOVAL_TIMEOUT).await {
        // The peer has not confirmed yet; cleanup happens when (if) the
        // deletion notice arrives.
        info!(sl!(), "detach not finished in time, deferring cleanup";
            "alias" => &alias);
        return Ok(());
    }

    complete_disk_detach(domain, dst).await
}

/// Second half of a detach: delete the host drive and revert leases,
/// labels, cgroup rules and the address reservation.
pub(crate) async fn complete_disk_detach(domain: &Domain, dst: &str) -> Result<()> {
    let (disk, def) = {
        let mut inner = domain.lock().await;
        let index = match inner.def.disk_index_by_target(dst) {
            Some(index) => index,
            None => return Ok(()),
        };
        let disk = inner.def.disks.remove(index);
        if let Some(alias) = &disk.alias {
            inner.aliases.remove(alias);
        }
        let def = inner.def.clone();
        (disk, def)
    };

    if let Some(drive_id) = disk.drive_id() {
        if let Ok(mon) = domain.enter_monitor().await {
            if let Err(e) = mon.drive_del(&drive_id).await {
                debug!(sl!(), "drive_del after unplug"; "drive" => &drive_id,
                    "error" => e.to_string());
            }
            let _ = domain.exit_monitor(mon).await;
        }
    }

    if let Some(DeviceAddress::Pci(addr)) = disk.address {
        domain.pci.release(addr);
    }
    if let Err(e) = domain.ctx.security.restore_disk_label(&def, &disk).await {
        warn!(sl!(), "restoring disk label failed"; "error" => e.to_string());
    }
    {
        let cgroup = domain.lock().await.cgroup.clone();
        if let Some(cgroup) = cgroup {
            if let Err(e) = cgroup.teardown_disk(&disk) {
                warn!(sl!(), "tearing down disk cgroup rules failed";
                    "error" => e.to_string());
            }
        }
    }
    if let Err(e) = domain.ctx.lock_manager.release_disk(&def, &disk).await {
        warn!(sl!(), "releasing disk lease failed"; "error" => e.to_string());
    }

    let _ = domain.save_status().await;
    info!(sl!(), "disk detached"; "target" => dst, "ok" => true);
    Ok(())
}

/// Swap the medium of a removable drive: eject, wait for the tray, insert.
pub async fn change_disk_media(
    domain: &Domain,
    dst: &str,
    new_source: Option<StorageSource>,
) -> Result<()> {
    let (alias, drive_id, format) = {
        let inner = domain.lock().await;
        inner.require_active()?;
        let disk = inner.def.disk_by_target(dst).ok_or_else(|| {
            VmmError::OperationInvalid(format!("disk {} not found in domain", dst))
        })?;
        if !matches!(disk.device, DiskDevice::Cdrom | DiskDevice::Floppy) {
            return Err(VmmError::OperationInvalid(format!(
                "disk {} does not accept media changes",
                dst
            )));
        }
        let alias = disk.alias.clone().ok_or_else(|| {
            VmmError::InternalError(format!("disk {} has no device alias", dst))
        })?;
        let drive_id = disk.drive_id().unwrap_or_else(|| {
            format!("{}{}", vmm_types::config::DRIVE_HOST_PREFIX, alias)
        });
        (alias, drive_id, disk.format.to_string())
    };

    let mon = domain.enter_monitor().await?;
    let ejected = mon.eject(&drive_id, false).await.map_err(VmmError::from);
    domain.exit_monitor(mon).await?;
    ejected?;

    // Poll the tray. The domain lock is free across each sleep; the caller
    // keeps the object alive through its reference.
    let mut open = false;
    for _ in 0..TRAY_POLL_ATTEMPTS {
        if domain.lock().await.tray_open.contains(&alias) {
            open = true;
            break;
        }
        tokio::time::sleep(TRAY_POLL_INTERVAL).await;
    }

    if let Some(source) = new_source {
        if !open {
            return Err(VmmError::OperationFailed(format!(
                "timed out waiting for tray of disk {} to open",
                dst
            )));
        }
        let path = source.path().ok_or_else(|| {
            VmmError::ConfigUnsupported("new media has no host path".to_string())
        })?;
        let path = path.to_string_lossy().to_string();

        let mon = domain.enter_monitor().await?;
        let changed = mon
            .change_media(&drive_id, &path, Some(&format))
            .await
            .map_err(VmmError::from);
        domain.exit_monitor(mon).await?;
        changed?;

        let mut inner = domain.lock().await;
        if let Some(index) = inner.def.disk_index_by_target(dst) {
            // The replaced source is dropped here.
            inner.def.disks[index].source = Some(source);
        }
        info!(sl!(), "media changed"; "target" => dst, "ok" => true);
    } else {
        let mut inner = domain.lock().await;
        if let Some(index) = inner.def.disk_index_by_target(dst) {
            inner.def.disks[index].source = None;
        }
        info!(sl!(), "media ejected"; "target" => dst, "ok" => true);
    }

    let _ = domain.save_status().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use vmm_types::config::{CacheMode, DiskFormat, PciAddress};

    fn disk(dst: &str) -> DiskConfig {
        DiskConfig {
            dst: dst.to_string(),
            bus: DiskBus::Virtio,
            device: DiskDevice::Disk,
            source: Some(StorageSource::File {
                path: PathBuf::from("/var/vm/a.qcow2"),
            }),
            format: DiskFormat::Qcow2,
            readonly: false,
            shared: false,
            cache: CacheMode::None,
            backing: vec![],
            alias: None,
            address: None,
            capacity_bytes: None,
            controller: None,
            unit: None,
        }
    }

    #[test]
    fn test_drive_props_shape() {
        let mut d = disk("vda");
        d.alias = Some("virtio-disk0".into());
        let props = drive_props(&d, "drive-virtio-disk0").unwrap();
        assert_eq!(props["id"], "drive-virtio-disk0");
        assert_eq!(props["file"], "/var/vm/a.qcow2");
        assert_eq!(props["format"], "qcow2");
        assert_eq!(props["cache"], "none");
    }

    #[test]
    fn test_device_props_carry_pci_address() {
        let mut d = disk("vda");
        d.address = Some(DeviceAddress::Pci(PciAddress::new(0, 0, 4, 0)));
        let props = device_props(&d, "virtio-disk0", "drive-virtio-disk0");
        assert_eq!(props["driver"], "virtio-blk-pci");
        assert_eq!(props["addr"], "0x4");
        assert_eq!(props["id"], "virtio-disk0");
    }

    #[test]
    fn test_sourceless_disk_cannot_build_drive() {
        let mut d = disk("vda");
        d.source = None;
        assert!(drive_props(&d, "drive-virtio-disk0").is_err());
    }
}
