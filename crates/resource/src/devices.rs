// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The device allow/deny policy of a VM's cgroup.
//!
//! Everything is denied up front, then allowed in a fixed order: disk
//! chains, the pseudo-TTY major, conditionally the sound major, the default
//! host node list, configured character devices and the TPM, host device
//! assignments, and RNG backends. Teardown denies symmetrically with rwm.

use std::path::Path;

use cgroups_rs::devices::{DevicePermissions, DeviceType, DevicesController};
use cgroups_rs::Controller;
use nix::sys::stat::SFlag;
use vmm_types::config::{
    ChardevBackend, DiskConfig, DomainConfig, GraphicsKind, HostdevConfig, RngBackend,
    StorageSource, TpmBackend,
};
use vmm_types::{Result, VmmError};

use crate::cgroup::CgroupController;

/// Pseudo-TTY slave major.
const PTY_MAJOR: i64 = 136;
/// OSS/ALSA sound major.
const SOUND_MAJOR: i64 = 116;

/// Host device nodes every VM may use when they exist on the host.
const DEFAULT_DEVICE_ACL: &[&str] = &[
    "/dev/null",
    "/dev/full",
    "/dev/zero",
    "/dev/random",
    "/dev/urandom",
    "/dev/ptmx",
    "/dev/kvm",
    "/dev/kqemu",
    "/dev/rtc",
    "/dev/hpet",
    "/dev/vfio/vfio",
];

/// Host policy knobs affecting which devices the guest may reach.
#[derive(Debug, Clone, Default)]
pub struct DevicePolicy {
    /// Override of the default host node list.
    pub device_acl: Option<Vec<String>>,
    /// Permit host audio when the VM has no graphics at all.
    pub allow_host_audio_without_graphics: bool,
    /// Permit host audio alongside VNC graphics.
    pub allow_host_audio_vnc: bool,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Perms: u8 {
        const R = 1;
        const W = 2;
        const M = 4;
    }
}

impl Perms {
    fn to_controller(self) -> Vec<DevicePermissions> {
        let mut out = vec![];
        if self.contains(Perms::R) {
            out.push(DevicePermissions::Read);
        }
        if self.contains(Perms::W) {
            out.push(DevicePermissions::Write);
        }
        if self.contains(Perms::M) {
            out.push(DevicePermissions::MkNod);
        }
        out
    }

    fn audit_str(self) -> &'static str {
        match (
            self.contains(Perms::R),
            self.contains(Perms::W),
            self.contains(Perms::M),
        ) {
            (true, true, true) => "rwm",
            (true, true, false) => "rw",
            (true, false, false) => "r",
            (false, true, false) => "w",
            _ => "?",
        }
    }
}

/// Resolve a path to its device identity; regular files resolve to `None`
/// and are skipped by the rules (they are not device nodes).
fn device_number(path: &Path) -> Result<Option<(DeviceType, i64, i64)>> {
    let st = match nix::sys::stat::stat(path) {
        Ok(st) => st,
        Err(nix::errno::Errno::ENOENT) => return Ok(None),
        Err(e) => {
            return Err(VmmError::OperationFailed(format!(
                "stat {}: {}",
                path.display(),
                e
            )))
        }
    };
    let fmt = st.st_mode & SFlag::S_IFMT.bits();
    let dev_type = if fmt == SFlag::S_IFCHR.bits() {
        DeviceType::Char
    } else if fmt == SFlag::S_IFBLK.bits() {
        DeviceType::Block
    } else {
        return Ok(None);
    };
    Ok(Some((
        dev_type,
        nix::sys::stat::major(st.st_rdev) as i64,
        nix::sys::stat::minor(st.st_rdev) as i64,
    )))
}

/// EACCES means the controller is not really there (a read-only or absent
/// hierarchy); the rule is skipped silently.
fn ignore_eacces<T>(result: std::result::Result<T, cgroups_rs::error::Error>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) => {
            let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(&e);
            while let Some(err) = cause {
                if let Some(io) = err.downcast_ref::<std::io::Error>() {
                    if io.kind() == std::io::ErrorKind::PermissionDenied {
                        return Ok(None);
                    }
                }
                cause = err.source();
            }
            Err(VmmError::OperationFailed(format!("cgroup device rule: {}", e)))
        }
    }
}

impl CgroupController {
    fn devices(&self) -> Option<&DevicesController> {
        self.base.controller_of::<DevicesController>()
    }

    fn allow(&self, dev_type: DeviceType, major: i64, minor: i64, perms: Perms) -> Result<()> {
        if let Some(devices) = self.devices() {
            let done = ignore_eacces(devices.allow_device(
                dev_type,
                major,
                minor,
                &perms.to_controller(),
            ))?;
            info!(sl!(), "cgroup allow";
                "major" => major, "minor" => minor,
                "perms" => perms.audit_str(), "applied" => done.is_some());
        }
        Ok(())
    }

    fn deny(&self, dev_type: DeviceType, major: i64, minor: i64, perms: Perms) -> Result<()> {
        if let Some(devices) = self.devices() {
            let done = ignore_eacces(devices.deny_device(
                dev_type,
                major,
                minor,
                &perms.to_controller(),
            ))?;
            info!(sl!(), "cgroup deny";
                "major" => major, "minor" => minor,
                "perms" => perms.audit_str(), "applied" => done.is_some());
        }
        Ok(())
    }

    fn allow_path(&self, path: &Path, perms: Perms) -> Result<()> {
        if let Some((dev_type, major, minor)) = device_number(path)? {
            self.allow(dev_type, major, minor, perms)?;
        }
        Ok(())
    }

    fn deny_path(&self, path: &Path, perms: Perms) -> Result<()> {
        if let Some((dev_type, major, minor)) = device_number(path)? {
            self.deny(dev_type, major, minor, perms)?;
        }
        Ok(())
    }

    /// Allow a disk's whole backing chain: read everywhere, write only on a
    /// writable top node. Non-local sources carry no host node and are
    /// skipped.
    pub fn setup_disk(&self, disk: &DiskConfig) -> Result<()> {
        let mut top = true;
        for (source, node_readonly) in disk.chain() {
            if let Some(path) = local_path(source) {
                let mut perms = Perms::R;
                if top && !node_readonly && !disk.readonly {
                    perms |= Perms::W;
                }
                self.allow_path(path, perms)?;
            }
            top = false;
        }
        Ok(())
    }

    /// Symmetric teardown after detach: deny the chain with rwm.
    pub fn teardown_disk(&self, disk: &DiskConfig) -> Result<()> {
        for (source, _) in disk.chain() {
            if let Some(path) = local_path(source) {
                self.deny_path(path, Perms::R | Perms::W | Perms::M)?;
            }
        }
        Ok(())
    }

    pub fn setup_hostdev(&self, dev: &HostdevConfig, iommu_group: Option<u32>) -> Result<()> {
        match dev {
            HostdevConfig::PciVfio { .. } => {
                if let Some(group) = iommu_group {
                    let node = format!("/dev/vfio/{}", group);
                    self.allow_path(Path::new(&node), Perms::R | Perms::W)?;
                }
            }
            HostdevConfig::Usb { .. } => {
                for node in dev.host_nodes() {
                    self.allow_path(&node, Perms::R | Perms::W)?;
                }
            }
            HostdevConfig::ScsiHost { path, readonly, .. } => {
                let perms = if *readonly {
                    Perms::R
                } else {
                    Perms::R | Perms::W
                };
                self.allow_path(path, perms)?;
            }
            HostdevConfig::Iscsi { .. } => {}
        }
        Ok(())
    }

    pub fn teardown_hostdev(&self, dev: &HostdevConfig, iommu_group: Option<u32>) -> Result<()> {
        match dev {
            HostdevConfig::PciVfio { .. } => {
                if let Some(group) = iommu_group {
                    let node = format!("/dev/vfio/{}", group);
                    self.deny_path(Path::new(&node), Perms::R | Perms::W | Perms::M)?;
                }
            }
            _ => {
                for node in dev.host_nodes() {
                    self.deny_path(&node, Perms::R | Perms::W | Perms::M)?;
                }
            }
        }
        Ok(())
    }

    /// Whether host audio is reachable given the graphics configuration.
    fn sound_allowed(def: &DomainConfig, policy: &DevicePolicy) -> bool {
        if !def.has_sound() {
            return false;
        }
        if def.graphics.is_empty() {
            return policy.allow_host_audio_without_graphics;
        }
        def.graphics.iter().any(|g| match g.kind {
            GraphicsKind::Vnc => policy.allow_host_audio_vnc,
            GraphicsKind::Sdl => true,
            GraphicsKind::Spice => false,
        })
    }

    /// Apply the full allow/deny matrix for a starting VM.
    pub fn setup_devices(
        &self,
        def: &DomainConfig,
        policy: &DevicePolicy,
        iommu_group_of: impl Fn(&HostdevConfig) -> Option<u32>,
    ) -> Result<()> {
        if self.devices().is_none() {
            debug!(sl!(), "no devices controller, skipping device policy");
            return Ok(());
        }

        // Deny the world, then allow piecemeal.
        self.deny(DeviceType::All, -1, -1, Perms::R | Perms::W | Perms::M)?;

        for disk in &def.disks {
            self.setup_disk(disk)?;
        }

        self.allow(DeviceType::Char, PTY_MAJOR, -1, Perms::R | Perms::W)?;

        if Self::sound_allowed(def, policy) {
            self.allow(DeviceType::Char, SOUND_MAJOR, -1, Perms::R | Perms::W)?;
        }

        let default_acl: Vec<String> = match &policy.device_acl {
            Some(acl) => acl.clone(),
            None => DEFAULT_DEVICE_ACL.iter().map(|s| s.to_string()).collect(),
        };
        for node in &default_acl {
            let path = Path::new(node);
            if !path.exists() {
                debug!(sl!(), "ignoring non-existent device {}", node);
                continue;
            }
            self.allow_path(path, Perms::R | Perms::W)?;
        }

        for chardev in &def.chardevs {
            if let ChardevBackend::Dev { path } = &chardev.backend {
                self.allow_path(path, Perms::R | Perms::W)?;
            }
        }
        if let Some(tpm) = &def.tpm {
            let TpmBackend::Passthrough { path } = &tpm.backend;
            self.allow_path(path, Perms::R | Perms::W)?;
        }

        for hostdev in &def.hostdevs {
            self.setup_hostdev(hostdev, iommu_group_of(hostdev))?;
        }

        for rng in &def.rngs {
            if let RngBackend::Random { path } = &rng.backend {
                self.allow_path(path, Perms::R | Perms::W)?;
            }
        }

        Ok(())
    }
}

fn local_path(source: &StorageSource) -> Option<&Path> {
    if source.is_local() {
        source.path()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_types::config::{GraphicsConfig, PasswordConnected, SoundConfig};

    fn base_def() -> DomainConfig {
        serde_json::from_value::<DomainConfig>(serde_json::json!({
            "name": "snd",
            "uuid": "2fd2e77c-51b2-45b8-9f5c-f179020ba727",
            "vcpus": 1,
            "iothreads": 0,
            "memory_kib": 1024
        }))
        .unwrap()
    }

    fn graphics(kind: GraphicsKind) -> GraphicsConfig {
        GraphicsConfig {
            kind,
            port: 5900,
            tls_port: 0,
            autoport: false,
            listen: None,
            keymap: None,
            passwd: None,
            passwd_valid_to: None,
            connected: PasswordConnected::Keep,
            tls_subject: None,
        }
    }

    #[test]
    fn test_sound_policy_matrix() {
        let policy = DevicePolicy {
            allow_host_audio_without_graphics: true,
            allow_host_audio_vnc: false,
            ..Default::default()
        };

        let mut def = base_def();
        assert!(!CgroupController::sound_allowed(&def, &policy));

        def.sounds.push(SoundConfig {
            model: "ich6".into(),
        });
        // No graphics at all: governed by the headless knob.
        assert!(CgroupController::sound_allowed(&def, &policy));

        // VNC without the vnc knob: denied.
        def.graphics.push(graphics(GraphicsKind::Vnc));
        assert!(!CgroupController::sound_allowed(&def, &policy));

        // SDL always reaches host audio.
        def.graphics.push(graphics(GraphicsKind::Sdl));
        assert!(CgroupController::sound_allowed(&def, &policy));

        // SPICE routes audio through the protocol instead.
        def.graphics.clear();
        def.graphics.push(graphics(GraphicsKind::Spice));
        assert!(!CgroupController::sound_allowed(&def, &policy));
    }

    #[test]
    fn test_device_number_of_regular_file_is_none() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(device_number(f.path()).unwrap().is_none());
    }

    #[test]
    fn test_device_number_of_missing_path_is_none() {
        assert!(device_number(Path::new("/dev/does-not-exist-here"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_device_number_of_null() {
        if let Some((dev_type, major, _minor)) = device_number(Path::new("/dev/null")).unwrap() {
            assert!(matches!(dev_type, DeviceType::Char));
            assert_eq!(major, 1);
        }
    }

    #[test]
    fn test_perms_audit_strings() {
        assert_eq!((Perms::R | Perms::W | Perms::M).audit_str(), "rwm");
        assert_eq!((Perms::R | Perms::W).audit_str(), "rw");
        assert_eq!(Perms::R.audit_str(), "r");
    }
}
