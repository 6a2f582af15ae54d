// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The capability set negotiated with one hypervisor process.
//!
//! Every monitor call that depends on a hypervisor feature checks its flag
//! first and fails with operation-unsupported instead of falling back
//! silently.

use monitor::QmpChannel;
use vmm_types::Result;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CapFlags: u64 {
        /// The peer emits DEVICE_DELETED after unplug completes.
        const DEVICE_DELETED_EVENT  = 1 << 0;
        const DRIVE_MIRROR          = 1 << 1;
        const NBD_SERVER            = 1 << 2;
        const BLOCK_COMMIT          = 1 << 3;
        const TRANSACTION           = 1 << 4;
        const ADD_FD                = 1 << 5;
        const MIGRATE_CAPABILITIES  = 1 << 6;
        const MIGRATE_XBZRLE        = 1 << 7;
        const MIGRATE_AUTO_CONVERGE = 1 << 8;
        const MIGRATE_RDMA_PIN_ALL  = 1 << 9;
        const MIGRATE_RDMA          = 1 << 10;
        const SPICE_SEAMLESS        = 1 << 11;
        /// Listening on IPv6 incoming addresses works.
        const IPV6_MIGRATION        = 1 << 12;
        const NETDEV                = 1 << 13;
        const CHARDEV               = 1 << 14;
    }
}

impl CapFlags {
    pub fn to_bits_persisted(self) -> u64 {
        self.bits()
    }

    pub fn from_bits_persisted(bits: u64) -> Self {
        CapFlags::from_bits_truncate(bits)
    }
}

/// Interrogate a freshly-opened monitor for what this hypervisor can do.
pub async fn probe(chan: &QmpChannel) -> Result<CapFlags> {
    let mut caps = CapFlags::empty();

    let commands = chan.query_commands().await.map_err(vmm_types::VmmError::from)?;
    for name in &commands {
        match name.as_str() {
            "drive-mirror" => caps |= CapFlags::DRIVE_MIRROR,
            "nbd-server-start" => caps |= CapFlags::NBD_SERVER,
            "block-commit" => caps |= CapFlags::BLOCK_COMMIT,
            "transaction" => caps |= CapFlags::TRANSACTION,
            "add-fd" => caps |= CapFlags::ADD_FD,
            "migrate-set-capabilities" => caps |= CapFlags::MIGRATE_CAPABILITIES,
            "netdev_add" => caps |= CapFlags::NETDEV,
            "chardev-add" => caps |= CapFlags::CHARDEV,
            _ => {}
        }
    }

    if let Ok(events) = chan.query_events().await {
        for name in &events {
            match name.as_str() {
                "DEVICE_DELETED" => caps |= CapFlags::DEVICE_DELETED_EVENT,
                "SPICE_MIGRATE_COMPLETED" => caps |= CapFlags::SPICE_SEAMLESS,
                _ => {}
            }
        }
    }

    if caps.contains(CapFlags::MIGRATE_CAPABILITIES) {
        if let Ok(names) = chan.query_migrate_capabilities().await {
            for name in &names {
                match name.as_str() {
                    "xbzrle" => caps |= CapFlags::MIGRATE_XBZRLE,
                    "auto-converge" => caps |= CapFlags::MIGRATE_AUTO_CONVERGE,
                    "rdma-pin-all" => {
                        caps |= CapFlags::MIGRATE_RDMA_PIN_ALL | CapFlags::MIGRATE_RDMA
                    }
                    _ => {}
                }
            }
        }
    }

    // IPv6 incoming listeners arrived together with the 1.6 monitor
    // vocabulary.
    if let Ok(version) = chan.query_version().await {
        if (version.qemu.major, version.qemu.minor) >= (1, 6) {
            caps |= CapFlags::IPV6_MIGRATION;
        }
    }

    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_round_trip() {
        let caps = CapFlags::DRIVE_MIRROR | CapFlags::NBD_SERVER | CapFlags::SPICE_SEAMLESS;
        let restored = CapFlags::from_bits_persisted(caps.to_bits_persisted());
        assert_eq!(caps, restored);
    }

    #[test]
    fn test_unknown_bits_are_dropped() {
        let restored = CapFlags::from_bits_persisted(u64::MAX);
        assert!(restored.contains(CapFlags::DEVICE_DELETED_EVENT));
    }
}
