// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::PciAddress;

/// A host device assigned into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum HostdevConfig {
    /// PCI passthrough through the vfio driver.
    PciVfio {
        /// Host-side address of the assigned function.
        host_address: PciAddress,
        #[serde(default)]
        alias: Option<String>,
    },
    /// A USB device identified by bus and device number.
    Usb {
        bus: u32,
        device: u32,
        #[serde(default)]
        alias: Option<String>,
    },
    /// SCSI host passthrough of a generic device node.
    ScsiHost {
        path: PathBuf,
        #[serde(default)]
        readonly: bool,
        #[serde(default)]
        alias: Option<String>,
    },
    /// iSCSI-backed SCSI device; no host node to manage.
    Iscsi {
        name: String,
        #[serde(default)]
        hosts: Vec<super::StorageHost>,
        #[serde(default)]
        alias: Option<String>,
    },
}

impl HostdevConfig {
    pub fn alias(&self) -> Option<&str> {
        match self {
            HostdevConfig::PciVfio { alias, .. }
            | HostdevConfig::Usb { alias, .. }
            | HostdevConfig::ScsiHost { alias, .. }
            | HostdevConfig::Iscsi { alias, .. } => alias.as_deref(),
        }
    }

    /// Host nodes the guest process must be allowed to open for this device.
    pub fn host_nodes(&self) -> Vec<PathBuf> {
        match self {
            HostdevConfig::PciVfio { .. } => vec![],
            HostdevConfig::Usb { bus, device, .. } => {
                vec![PathBuf::from(format!(
                    "/dev/bus/usb/{:03}/{:03}",
                    bus, device
                ))]
            }
            HostdevConfig::ScsiHost { path, .. } => vec![path.clone()],
            HostdevConfig::Iscsi { .. } => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_node_path() {
        let dev = HostdevConfig::Usb {
            bus: 1,
            device: 23,
            alias: None,
        };
        assert_eq!(
            dev.host_nodes(),
            vec![PathBuf::from("/dev/bus/usb/001/023")]
        );
    }
}
