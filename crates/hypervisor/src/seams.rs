// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Boundaries to the collaborators the core does not implement: the lock
//! manager plugin and the security-label driver. Null implementations keep
//! hosts without either feature working.

use vmm_types::config::{DiskConfig, DomainConfig};
use vmm_types::Result;

/// Lease management for disk contents. Every acquire is paired with a
/// release on success and on failure paths.
#[async_trait::async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire_disk(&self, def: &DomainConfig, disk: &DiskConfig) -> Result<()>;
    async fn release_disk(&self, def: &DomainConfig, disk: &DiskConfig) -> Result<()>;

    /// Opaque lease state carried through migration cookies; must match the
    /// receiving daemon's driver name.
    fn driver_name(&self) -> &str;
    fn lease_state(&self, def: &DomainConfig) -> Option<String>;

    /// Drop every lease before the guest CPUs stop owning the disks.
    async fn release_all(&self, def: &DomainConfig) -> Result<()>;
    async fn acquire_all(&self, def: &DomainConfig) -> Result<()>;
}

pub struct NullLockManager;

#[async_trait::async_trait]
impl LockManager for NullLockManager {
    async fn acquire_disk(&self, _def: &DomainConfig, _disk: &DiskConfig) -> Result<()> {
        Ok(())
    }

    async fn release_disk(&self, _def: &DomainConfig, _disk: &DiskConfig) -> Result<()> {
        Ok(())
    }

    fn driver_name(&self) -> &str {
        "nop"
    }

    fn lease_state(&self, _def: &DomainConfig) -> Option<String> {
        None
    }

    async fn release_all(&self, _def: &DomainConfig) -> Result<()> {
        Ok(())
    }

    async fn acquire_all(&self, _def: &DomainConfig) -> Result<()> {
        Ok(())
    }
}

/// Security labeling of VM resources (image files, device nodes).
#[async_trait::async_trait]
pub trait SecurityManager: Send + Sync {
    async fn set_disk_label(&self, def: &DomainConfig, disk: &DiskConfig) -> Result<()>;
    async fn restore_disk_label(&self, def: &DomainConfig, disk: &DiskConfig) -> Result<()>;
    async fn set_process_label(&self, def: &DomainConfig) -> Result<()>;
}

pub struct NullSecurityManager;

#[async_trait::async_trait]
impl SecurityManager for NullSecurityManager {
    async fn set_disk_label(&self, _def: &DomainConfig, _disk: &DiskConfig) -> Result<()> {
        Ok(())
    }

    async fn restore_disk_label(&self, _def: &DomainConfig, _disk: &DiskConfig) -> Result<()> {
        Ok(())
    }

    async fn set_process_label(&self, _def: &DomainConfig) -> Result<()> {
        Ok(())
    }
}
