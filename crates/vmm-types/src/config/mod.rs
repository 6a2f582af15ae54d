// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The domain configuration model. This is the live snapshot the daemon
//! carries for every defined or discovered VM; parsing it from the public
//! definition format happens outside the core.

mod address;
mod chardev;
mod disk;
mod graphics;
mod hostdev;
mod net;
mod tune;

pub use address::{CcwAddress, DeviceAddress, PciAddress, UsbPort};
pub use chardev::{ChardevBackend, ChardevConfig, RngBackend, RngConfig, SoundConfig, TpmBackend, TpmConfig};
pub use disk::{
    disk_target_to_index, BackingChainNode, CacheMode, DiskBus, DiskConfig, DiskDevice,
    DiskFormat, NetworkProtocol, StorageHost, StorageSource, DRIVE_HOST_PREFIX,
};
pub use graphics::{GraphicsConfig, GraphicsKind, PasswordConnected};
pub use hostdev::HostdevConfig;
pub use net::{NetBandwidth, NetConfig, NetKind, VportProfile};
pub use tune::{BlkioDeviceTune, BlkioTune, CpuPin, CpuTune, MemTune, NumaMode, NumaPlacement, NumaTune};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    Scsi,
    Usb,
    Ide,
    VirtioSerial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub kind: ControllerKind,
    pub index: u32,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub address: Option<DeviceAddress>,
}

/// One virtual machine definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    pub uuid: Uuid,

    pub vcpus: u32,
    pub iothreads: u32,
    pub memory_kib: u64,

    #[serde(default)]
    pub mem_tune: MemTune,
    #[serde(default)]
    pub cpu_tune: CpuTune,
    #[serde(default)]
    pub blkio_tune: BlkioTune,
    #[serde(default)]
    pub numa_tune: Option<NumaTune>,

    #[serde(default)]
    pub disks: Vec<DiskConfig>,
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
    #[serde(default)]
    pub nets: Vec<NetConfig>,
    #[serde(default)]
    pub graphics: Vec<GraphicsConfig>,
    #[serde(default)]
    pub sounds: Vec<SoundConfig>,
    #[serde(default)]
    pub hostdevs: Vec<HostdevConfig>,
    #[serde(default)]
    pub chardevs: Vec<ChardevConfig>,
    #[serde(default)]
    pub rngs: Vec<RngConfig>,
    #[serde(default)]
    pub tpm: Option<TpmConfig>,

    /// The guest was configured to require the invariant-TSC CPU feature.
    /// Such guests cannot be migrated.
    #[serde(default)]
    pub require_invtsc: bool,
}

impl DomainConfig {
    pub fn disk_by_target(&self, dst: &str) -> Option<&DiskConfig> {
        self.disks.iter().find(|d| d.dst == dst)
    }

    pub fn disk_index_by_target(&self, dst: &str) -> Option<usize> {
        self.disks.iter().position(|d| d.dst == dst)
    }

    pub fn net_by_mac(&self, mac: &str) -> Option<&NetConfig> {
        self.nets.iter().find(|n| n.mac == mac)
    }

    pub fn has_sound(&self) -> bool {
        !self.sounds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn minimal_config(name: &str) -> DomainConfig {
        DomainConfig {
            name: name.to_string(),
            uuid: Uuid::new_v4(),
            vcpus: 2,
            iothreads: 0,
            memory_kib: 1048576,
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
        }
    }

    #[test]
    fn test_round_trip() {
        let cfg = minimal_config("round");
        let text = serde_json::to_string(&cfg).unwrap();
        let back: DomainConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.name, "round");
        assert_eq!(back.uuid, cfg.uuid);
        assert_eq!(back.memory_kib, 1048576);
    }
}
