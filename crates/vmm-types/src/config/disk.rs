// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Disks, their storage sources and backing chains.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::DeviceAddress;

/// Prefix turning a device alias into the hypervisor's drive id.
pub const DRIVE_HOST_PREFIX: &str = "drive-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Virtio,
    Scsi,
    Ide,
    Sata,
    Usb,
    Ccw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskDevice {
    Disk,
    Cdrom,
    Floppy,
    Lun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    Qcow2,
    Qed,
    Vmdk,
    Vdi,
    Vpc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Default,
    None,
    Writethrough,
    Writeback,
    Directsync,
    Unsafe,
}

impl Default for CacheMode {
    fn default() -> Self {
        CacheMode::Default
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageHost {
    pub name: String,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    Nbd,
    Rbd,
    Sheepdog,
    Gluster,
    Iscsi,
    Http,
    Https,
    Ftp,
    Ftps,
    Tftp,
    Ssh,
}

/// Where the bytes of a disk (or one node of its backing chain) live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum StorageSource {
    File {
        path: PathBuf,
    },
    Block {
        path: PathBuf,
    },
    Dir {
        path: PathBuf,
    },
    Network {
        protocol: NetworkProtocol,
        name: String,
        #[serde(default)]
        hosts: Vec<StorageHost>,
        #[serde(default)]
        auth: Option<String>,
    },
    Volume {
        pool: String,
        volume: String,
        /// Filled in once the pool driver has resolved the volume.
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl StorageSource {
    /// Local sources have a host path that cgroup and security rules can
    /// name; network sources do not.
    pub fn is_local(&self) -> bool {
        !matches!(self, StorageSource::Network { .. })
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            StorageSource::File { path }
            | StorageSource::Block { path }
            | StorageSource::Dir { path } => Some(path),
            StorageSource::Volume { path, .. } => path.as_deref(),
            StorageSource::Network { .. } => None,
        }
    }

    pub fn protocol(&self) -> Option<NetworkProtocol> {
        match self {
            StorageSource::Network { protocol, .. } => Some(*protocol),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            StorageSource::File { .. } => "file",
            StorageSource::Block { .. } => "block",
            StorageSource::Dir { .. } => "dir",
            StorageSource::Network { .. } => "network",
            StorageSource::Volume { .. } => "volume",
        }
    }
}

/// One node below the top of a disk's backing chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackingChainNode {
    pub source: StorageSource,
    pub format: DiskFormat,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Guest-visible target, e.g. "vda".
    pub dst: String,
    pub bus: DiskBus,
    pub device: DiskDevice,
    /// Removable media may have no source at all.
    pub source: Option<StorageSource>,
    pub format: DiskFormat,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub cache: CacheMode,
    /// Backing chain below the top node, ordered top-down.
    #[serde(default)]
    pub backing: Vec<BackingChainNode>,
    /// Device alias in the hypervisor namespace, assigned at start/attach.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub address: Option<DeviceAddress>,
    /// Virtual size; used to pre-create images on a migration destination.
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
    /// SCSI addressing, when bus is scsi.
    #[serde(default)]
    pub controller: Option<u32>,
    #[serde(default)]
    pub unit: Option<u32>,
}

impl DiskConfig {
    /// The alias the device carries in the hypervisor's namespace,
    /// e.g. "virtio-disk0" for "vda".
    pub fn default_alias(&self) -> Option<String> {
        let idx = disk_target_to_index(&self.dst)?;
        let stem = match self.bus {
            DiskBus::Virtio => "virtio-disk",
            DiskBus::Scsi => "scsi-disk",
            DiskBus::Ide => "ide-disk",
            DiskBus::Sata => "sata-disk",
            DiskBus::Usb => "usb-disk",
            DiskBus::Ccw => "virtio-disk",
        };
        Some(format!("{}{}", stem, idx))
    }

    /// The hypervisor drive id for this disk, e.g. "drive-virtio-disk0".
    pub fn drive_id(&self) -> Option<String> {
        let alias = self
            .alias
            .clone()
            .or_else(|| self.default_alias())?;
        Some(format!("{}{}", DRIVE_HOST_PREFIX, alias))
    }

    /// Whether guest writes reach the disk.
    pub fn is_writable(&self) -> bool {
        !self.readonly && self.device != DiskDevice::Cdrom
    }

    /// Walk the chain top-down: the top source first, then every backing
    /// node. Source-less disks yield nothing.
    pub fn chain(&self) -> impl Iterator<Item = (&StorageSource, bool)> {
        self.source
            .iter()
            .map(move |s| (s, self.readonly))
            .chain(self.backing.iter().map(|n| (&n.source, n.readonly)))
    }
}

/// Map a disk target name to its index on the bus: "vda" -> 0, "vdz" -> 25,
/// "vdaa" -> 26. The one- or two-letter prefix is ignored.
pub fn disk_target_to_index(dst: &str) -> Option<u32> {
    // Strip the bus prefix ("vd", "sd", "hd", "xvd", "fd"); what remains
    // must be the a-z ordinal part.
    let ord = &dst[prefix_len(dst)?..];
    if ord.is_empty() {
        return None;
    }
    let mut idx: u32 = 0;
    for c in ord.chars() {
        if !c.is_ascii_lowercase() {
            return None;
        }
        idx = idx.checked_mul(26)?.checked_add((c as u32) - ('a' as u32) + 1)?;
    }
    Some(idx - 1)
}

fn prefix_len(dst: &str) -> Option<usize> {
    for p in &["xvd", "vd", "sd", "hd", "fd"] {
        if dst.starts_with(p) && dst.len() > p.len() {
            return Some(p.len());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_disk(dst: &str) -> DiskConfig {
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
    fn test_target_to_index() {
        assert_eq!(disk_target_to_index("vda"), Some(0));
        assert_eq!(disk_target_to_index("vdb"), Some(1));
        assert_eq!(disk_target_to_index("sdz"), Some(25));
        assert_eq!(disk_target_to_index("vdaa"), Some(26));
        assert_eq!(disk_target_to_index("vd"), None);
        assert_eq!(disk_target_to_index("hdA"), None);
    }

    #[test]
    fn test_alias_and_drive_id() {
        let disk = file_disk("vda");
        assert_eq!(disk.default_alias().unwrap(), "virtio-disk0");
        assert_eq!(disk.drive_id().unwrap(), "drive-virtio-disk0");
    }

    #[test]
    fn test_chain_walk() {
        let mut disk = file_disk("vda");
        disk.backing.push(BackingChainNode {
            source: StorageSource::File {
                path: PathBuf::from("/var/vm/base.qcow2"),
            },
            format: DiskFormat::Qcow2,
            readonly: true,
        });
        let nodes: Vec<_> = disk.chain().collect();
        assert_eq!(nodes.len(), 2);
        assert!(!nodes[0].1);
        assert!(nodes[1].1);
    }

    #[test]
    fn test_network_source_is_not_local() {
        let src = StorageSource::Network {
            protocol: NetworkProtocol::Rbd,
            name: "pool/image".into(),
            hosts: vec![],
            auth: None,
        };
        assert!(!src.is_local());
        assert!(src.path().is_none());
    }
}
