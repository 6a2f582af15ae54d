// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The source half of a migration.

use std::sync::Arc;

use hypervisor::{CapFlags, Domain, SnapshotStore};
use jobs::{AsyncJob, AsyncJobTicket, Job, JobMask};
use vmm_types::config::{CacheMode, HostdevConfig, NetworkProtocol, StorageSource};
use vmm_types::migrate::{MigrateFlags, MigrationPhase};
use vmm_types::state::{DomainEvent, DomainState, ResumedReason, StateReason, StoppedReason};
use vmm_types::{Result, VmmError};

use crate::cookie::MigrationCookie;
use crate::nbd;
use crate::peer::DestinationPeer;
use crate::progress;
use crate::sharedfs;
use crate::uri::MigrateUri;
use crate::MigrationContext;

const GIB: u64 = 1024 * 1024 * 1024;

/// A migration-out job holding the domain's async slot. With change
/// protection the object (and the slot) survives across separate API
/// calls; a vanished client must `abandon` it.
pub struct SourceMigration {
    domain: Arc<Domain>,
    ctx: Arc<MigrationContext>,
    ticket: AsyncJobTicket,
    flags: MigrateFlags,
}

impl SourceMigration {
    /// Validate the request and take the migration-out async slot.
    pub async fn start(
        domain: Arc<Domain>,
        ctx: Arc<MigrationContext>,
        flags: MigrateFlags,
    ) -> Result<SourceMigration> {
        check_allowed(&domain, flags).await?;

        if flags.contains(MigrateFlags::UNSAFE) {
            domain.taint("unsafe migration forced by the client").await;
        }

        let ticket = domain.jobs.begin_async_job(AsyncJob::MigrationOut).await?;
        // Modify and suspend must not interleave while the guest is in
        // transit; queries, aborts and migration tuning may.
        domain
            .jobs
            .set_async_mask(
                &ticket,
                JobMask::NONE
                    .with(Job::Query)
                    .with(Job::Destroy)
                    .with(Job::Abort)
                    .with(Job::MigrationOp),
            )
            .await?;

        {
            let mut inner = domain.lock().await;
            inner.premigration_state = Some(inner.state);
        }

        Ok(SourceMigration {
            domain,
            ctx,
            ticket,
            flags,
        })
    }

    pub fn ticket(&self) -> &AsyncJobTicket {
        &self.ticket
    }

    pub(crate) fn context(&self) -> &Arc<MigrationContext> {
        &self.ctx
    }

    pub fn flags(&self) -> MigrateFlags {
        self.flags
    }

    /// Phase begin3: produce the cookie seeding the exchange.
    pub async fn begin(&self, dname: Option<&str>) -> Result<MigrationCookie> {
        self.domain
            .jobs
            .set_phase(&self.ticket, MigrationPhase::Begin3)
            .await?;

        let inner = self.domain.lock().await;
        let name = dname.unwrap_or(&inner.def.name);
        let mut cookie =
            MigrationCookie::new(name, inner.def.uuid, &self.ctx.hostname, self.ctx.host_uuid);

        if let Some(graphics) = MigrationCookie::graphics_from_def(&inner.def) {
            cookie.set_graphics(graphics);
        }

        let lock_manager = &self.domain.ctx.lock_manager;
        let lease = lock_manager.lease_state(&inner.def);
        if lease.is_some() || lock_manager.driver_name() != "nop" {
            cookie.set_lockstate(lock_manager.driver_name(), lease);
        }

        if self.flags.contains(MigrateFlags::PERSIST_DEST) {
            cookie.set_persistent(inner.def.clone());
        }

        if self
            .flags
            .intersects(MigrateFlags::NON_SHARED_DISK | MigrateFlags::NON_SHARED_INC)
        {
            drop(inner);
            let section = nbd::nbd_cookie_section(&self.domain, 0).await;
            cookie.set_nbd(section);
        }

        Ok(cookie)
    }

    /// Phase perform3: push the guest to the destination described by the
    /// prepare-cookie, then stop the CPUs and report perform3_done.
    pub async fn perform(
        &self,
        cookie_in: &MigrationCookie,
        uri: &MigrateUri,
        peer: Option<&dyn DestinationPeer>,
    ) -> Result<MigrationCookie> {
        cookie_in.check_remote_host(&self.ctx.hostname, self.ctx.host_uuid)?;
        self.domain
            .jobs
            .set_phase(&self.ticket, MigrationPhase::Perform3)
            .await?;

        self.relocate_graphics_clients(cookie_in).await;
        self.apply_capabilities(uri).await?;

        // Non-shared disks go through the NBD channel first; the main
        // migrate must then not copy them again.
        let mut used_nbd = false;
        if self
            .flags
            .intersects(MigrateFlags::NON_SHARED_DISK | MigrateFlags::NON_SHARED_INC)
        {
            if let Some(nbd_section) = &cookie_in.nbd {
                let dest_host = uri.host().unwrap_or(&cookie_in.remote_hostname).to_string();
                nbd::mirror_to_nbd(&self.domain, &self.ticket, &dest_host, nbd_section, 0).await?;
                used_nbd = true;
            }
        }

        let blk = self.flags.contains(MigrateFlags::NON_SHARED_DISK) && !used_nbd;
        let inc = self.flags.contains(MigrateFlags::NON_SHARED_INC) && !used_nbd;

        let result = async {
            let mon = self.domain.enter_monitor_async(&self.ticket).await?;
            let kicked = mon
                .migrate(&uri.to_hypervisor_uri(), blk, inc)
                .await
                .map_err(VmmError::from);
            self.domain.exit_monitor(mon).await?;
            kicked?;

            progress::wait_for_completion(&self.domain, &self.ticket, self.flags, peer).await?;

            let spice_seamless = {
                let inner = self.domain.lock().await;
                inner.caps.contains(CapFlags::SPICE_SEAMLESS)
                    && MigrationCookie::graphics_from_def(&inner.def).is_some()
            };
            if spice_seamless {
                progress::wait_for_spice(&self.domain, &self.ticket).await?;
            }

            // Stop the CPUs (unless the guest was already paused) so the
            // lease state can be handed over safely.
            let running = self.domain.lock().await.state == DomainState::Running;
            if running {
                let mon = self.domain.enter_monitor_async(&self.ticket).await?;
                let stopped = mon.stop_cpus().await.map_err(VmmError::from);
                self.domain.exit_monitor(mon).await?;
                stopped?;
                let mut inner = self.domain.lock().await;
                inner.set_state(DomainState::Paused, StateReason::Migration);
            }
            let def = self.domain.lock().await.def.clone();
            self.domain.ctx.lock_manager.release_all(&def).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            nbd::cancel_all_mirrors(&self.domain, &self.ticket).await;
            return Err(e);
        }

        self.domain
            .jobs
            .set_phase(&self.ticket, MigrationPhase::Perform3Done)
            .await?;
        let _ = self.domain.save_status().await;

        let mut cookie_out = {
            let inner = self.domain.lock().await;
            MigrationCookie::new(
                &inner.def.name,
                inner.def.uuid,
                &self.ctx.hostname,
                self.ctx.host_uuid,
            )
        };
        if let Some(stats) = self.domain.jobs.completed_stats().await {
            cookie_out.set_statistics(stats);
        }
        Ok(cookie_out)
    }

    /// The legacy protocol: perform directly after the checks, and kill
    /// the guest at the end because there is no confirm round.
    pub async fn perform2(
        &self,
        cookie_in: &MigrationCookie,
        uri: &MigrateUri,
        peer: Option<&dyn DestinationPeer>,
    ) -> Result<()> {
        cookie_in.check_remote_host(&self.ctx.hostname, self.ctx.host_uuid)?;
        self.domain
            .jobs
            .set_phase(&self.ticket, MigrationPhase::Perform2)
            .await?;

        self.apply_capabilities(uri).await?;
        let result = async {
            let mon = self.domain.enter_monitor_async(&self.ticket).await?;
            let kicked = mon
                .migrate(
                    &uri.to_hypervisor_uri(),
                    self.flags.contains(MigrateFlags::NON_SHARED_DISK),
                    self.flags.contains(MigrateFlags::NON_SHARED_INC),
                )
                .await
                .map_err(VmmError::from);
            self.domain.exit_monitor(mon).await?;
            kicked?;
            progress::wait_for_completion(&self.domain, &self.ticket, self.flags, peer).await
        }
        .await;
        result?;

        self.domain.stop_process(StoppedReason::Migrated).await?;
        Ok(())
    }

    /// Phase confirm3 / confirm3_cancelled: either the guest now runs on
    /// the destination (kill our copy), or the migration failed and the
    /// pre-migration run state comes back.
    pub async fn confirm(&self, cancelled: bool) -> Result<()> {
        let phase = if cancelled {
            MigrationPhase::Confirm3Cancelled
        } else {
            MigrationPhase::Confirm3
        };
        self.domain.jobs.set_phase(&self.ticket, phase).await?;

        if !cancelled {
            self.domain.stop_process(StoppedReason::Migrated).await?;
            return Ok(());
        }

        // Rollback: drop mirrors, reclaim leases, resume the CPUs only if
        // the guest ran before the migration started.
        nbd::cancel_all_mirrors(&self.domain, &self.ticket).await;
        let def = self.domain.lock().await.def.clone();
        if let Err(e) = self.domain.ctx.lock_manager.acquire_all(&def).await {
            warn!(sl!(), "re-acquiring leases after cancel failed"; "error" => e.to_string());
        }

        let was_running = {
            let inner = self.domain.lock().await;
            inner.premigration_state == Some(DomainState::Running)
                && inner.state == DomainState::Paused
        };
        if was_running {
            let mon = self.domain.enter_monitor_async(&self.ticket).await?;
            let resumed = mon.cont().await.map_err(VmmError::from);
            self.domain.exit_monitor(mon).await?;
            resumed?;
            {
                let mut inner = self.domain.lock().await;
                inner.set_state(DomainState::Running, StateReason::Migration);
            }
            self.domain
                .emit_event(DomainEvent::Resumed {
                    reason: ResumedReason::Migrated,
                })
                .await;
        }
        let _ = self.domain.save_status().await;
        Ok(())
    }

    /// Release the async slot; the migration reached a terminal state.
    pub async fn finish(self) {
        {
            let mut inner = self.domain.lock().await;
            inner.premigration_state = None;
        }
        self.domain.jobs.end_async_job(self.ticket).await;
    }

    /// The client that drove this migration went away; drop the job
    /// without declaring an outcome.
    pub async fn abandon(self) {
        info!(sl!(), "client vanished mid-migration, discarding job");
        let SourceMigration { domain, ticket, .. } = self;
        drop(ticket);
        domain.jobs.discard_async_job().await;
    }

    /// Point connected SPICE clients at the destination before the switch.
    async fn relocate_graphics_clients(&self, cookie_in: &MigrationCookie) {
        let graphics = match &cookie_in.graphics {
            Some(graphics) if graphics.kind == "spice" => graphics.clone(),
            // VNC relocation is unsupported; silently a no-op.
            _ => return,
        };
        let hostname = graphics
            .listen
            .clone()
            .unwrap_or_else(|| cookie_in.remote_hostname.clone());

        match self.domain.enter_monitor_async(&self.ticket).await {
            Ok(mon) => {
                if let Err(e) = mon
                    .client_migrate_info(
                        "spice",
                        &hostname,
                        graphics.port,
                        graphics.tls_port,
                        graphics.tls_subject.as_deref(),
                    )
                    .await
                {
                    warn!(sl!(), "relocating graphics clients failed"; "error" => e.to_string());
                }
                let _ = self.domain.exit_monitor(mon).await;
            }
            Err(e) => {
                warn!(sl!(), "relocating graphics clients failed"; "error" => e.to_string());
            }
        }
    }

    /// Enable the optional migration capabilities the flags ask for. Every
    /// enable is gated on the probed capability set.
    async fn apply_capabilities(&self, uri: &MigrateUri) -> Result<()> {
        let caps = self.domain.lock().await.caps;
        let mut enables: Vec<(&str, bool)> = vec![];

        if self.flags.contains(MigrateFlags::COMPRESSED) {
            if !caps.contains(CapFlags::MIGRATE_XBZRLE) {
                return Err(VmmError::OperationUnsupported(
                    "compressed migration is not supported by this hypervisor".to_string(),
                ));
            }
            enables.push(("xbzrle", true));
        }
        if self.flags.contains(MigrateFlags::AUTO_CONVERGE) {
            if !caps.contains(CapFlags::MIGRATE_AUTO_CONVERGE) {
                return Err(VmmError::OperationUnsupported(
                    "auto-converge is not supported by this hypervisor".to_string(),
                ));
            }
            enables.push(("auto-converge", true));
        }
        if uri.is_rdma() {
            if !caps.contains(CapFlags::MIGRATE_RDMA) {
                return Err(VmmError::OperationUnsupported(
                    "RDMA migration is not supported by this hypervisor".to_string(),
                ));
            }
            let hard_limit_kib = {
                let inner = self.domain.lock().await;
                inner.def.mem_tune.hard_limit_kib.unwrap_or(0)
            };
            if hard_limit_kib == 0 {
                return Err(VmmError::ConfigUnsupported(
                    "RDMA migration needs a memory hard limit so guest pages can be locked"
                        .to_string(),
                ));
            }
            // Lock budget: all guest pages plus headroom for I/O buffers.
            let bytes = hard_limit_kib * 1024 + GIB;
            nix::sys::resource::setrlimit(nix::sys::resource::Resource::RLIMIT_MEMLOCK, bytes, bytes)
                .map_err(|e| {
                    VmmError::OperationFailed(format!("raising locked-memory limit: {}", e))
                })?;
            if self.flags.contains(MigrateFlags::RDMA_PIN_ALL) {
                if !caps.contains(CapFlags::MIGRATE_RDMA_PIN_ALL) {
                    return Err(VmmError::OperationUnsupported(
                        "rdma-pin-all is not supported by this hypervisor".to_string(),
                    ));
                }
                enables.push(("rdma-pin-all", true));
            }
        }

        if enables.is_empty() {
            return Ok(());
        }
        let mon = self.domain.enter_monitor_async(&self.ticket).await?;
        let set = mon
            .migrate_set_capabilities(&enables)
            .await
            .map_err(VmmError::from);
        self.domain.exit_monitor(mon).await?;
        set
    }
}

/// The begin-time preconditions.
async fn check_allowed(domain: &Arc<Domain>, flags: MigrateFlags) -> Result<()> {
    if flags.contains(MigrateFlags::OFFLINE) {
        if !flags.contains(MigrateFlags::PERSIST_DEST) {
            return Err(VmmError::OperationInvalid(
                "offline migration must persist the definition on the destination".to_string(),
            ));
        }
        if flags.contains(MigrateFlags::TUNNELLED) {
            return Err(VmmError::OperationInvalid(
                "offline migration cannot be tunnelled".to_string(),
            ));
        }
    }

    let inner = domain.lock().await;

    if !flags.contains(MigrateFlags::OFFLINE) {
        inner.require_active()?;
    }

    if domain.is_autodestroy() {
        return Err(VmmError::OperationInvalid(
            "domain is marked for auto destroy".to_string(),
        ));
    }

    for hostdev in &inner.def.hostdevs {
        if !matches!(hostdev, HostdevConfig::Usb { .. }) {
            return Err(VmmError::ConfigUnsupported(
                "domain has assigned non-USB host devices".to_string(),
            ));
        }
    }

    if !inner.mirror_active.is_empty() {
        return Err(VmmError::BlockCopyActive(
            "domain has an active block copy job".to_string(),
        ));
    }

    if !SnapshotStore::new(&domain.ctx.snapshot_dir)
        .list(&inner.def.name)
        .unwrap_or_default()
        .is_empty()
    {
        return Err(VmmError::OperationInvalid(
            "cannot migrate a domain with snapshots".to_string(),
        ));
    }

    if flags.contains(MigrateFlags::ABORT_ON_ERROR)
        && inner.state == DomainState::Paused
        && inner.reason == StateReason::IoError
    {
        return Err(VmmError::OperationInvalid(
            "domain is paused after an I/O error".to_string(),
        ));
    }

    if inner.def.require_invtsc {
        return Err(VmmError::ConfigUnsupported(
            "domain requires the invariant TSC and cannot be migrated".to_string(),
        ));
    }

    if !flags.contains(MigrateFlags::UNSAFE) {
        for disk in &inner.def.disks {
            // Shared disks are elsewhere guaranteed to be readonly or run
            // cache-none, and readonly disks have no dirty cache to lose.
            if !disk.is_writable() || disk.shared {
                continue;
            }
            let source = match &disk.source {
                Some(source) => source,
                None => continue,
            };
            if disk.cache == CacheMode::None {
                continue;
            }

            // The corruption risk is two hosts caching the same image:
            // a file on a non-shared filesystem is not reachable from the
            // peer at all, a cluster filesystem keeps its caches coherent,
            // and RBD coordinates its own caching. Anything else with a
            // writable cache cannot survive the switchover.
            let safe = match source {
                StorageSource::File { path }
                | StorageSource::Volume {
                    path: Some(path), ..
                } => {
                    !sharedfs::is_shared_filesystem(path)
                        || sharedfs::is_cluster_filesystem(path)
                }
                StorageSource::Network { .. } => {
                    source.protocol() == Some(NetworkProtocol::Rbd)
                }
                _ => false,
            };
            if !safe {
                return Err(VmmError::MigrateUnsafe(format!(
                    "disk {} uses cache mode {} which may lead to data corruption on migration",
                    disk.dst, disk.cache
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use vmm_types::config::{
        DiskBus, DiskConfig, DiskDevice, DiskFormat, PciAddress, StorageSource,
    };

    fn test_domain(dir: &std::path::Path) -> Arc<Domain> {
        hypervisor::testhooks::domain_for_tests("mig-src", dir)
    }

    fn writable_disk(source: StorageSource, cache: CacheMode) -> DiskConfig {
        DiskConfig {
            dst: "vda".into(),
            bus: DiskBus::Virtio,
            device: DiskDevice::Disk,
            source: Some(source),
            format: DiskFormat::Qcow2,
            readonly: false,
            shared: false,
            cache,
            backing: vec![],
            alias: None,
            address: None,
            capacity_bytes: None,
            controller: None,
            unit: None,
        }
    }

    async fn activate(domain: &Arc<Domain>) {
        let mut inner = domain.lock().await;
        inner.set_state(DomainState::Running, StateReason::Booted);
    }

    #[tokio::test]
    async fn test_inactive_domain_cannot_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let domain = test_domain(dir.path());
        let err = check_allowed(&domain, MigrateFlags::LIVE).await.unwrap_err();
        assert_eq!(err.code(), "operation-invalid");
    }

    #[tokio::test]
    async fn test_offline_needs_persist_dest() {
        let dir = tempfile::tempdir().unwrap();
        let domain = test_domain(dir.path());
        let err = check_allowed(&domain, MigrateFlags::OFFLINE)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "operation-invalid");
        check_allowed(&domain, MigrateFlags::OFFLINE | MigrateFlags::PERSIST_DEST)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unsafe_cache_mode_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let domain = test_domain(dir.path());
        activate(&domain).await;

        // A writable block device with a host cache cannot migrate safely.
        {
            let mut inner = domain.lock().await;
            inner.def.disks.push(writable_disk(
                StorageSource::Block {
                    path: PathBuf::from("/dev/vg0/lv0"),
                },
                CacheMode::Writeback,
            ));
        }
        let err = check_allowed(&domain, MigrateFlags::LIVE).await.unwrap_err();
        assert_eq!(err.code(), "migrate-unsafe");

        // cache=none makes the same disk acceptable.
        {
            let mut inner = domain.lock().await;
            inner.def.disks[0].cache = CacheMode::None;
        }
        check_allowed(&domain, MigrateFlags::LIVE).await.unwrap();

        // The unsafe override disables the check entirely.
        {
            let mut inner = domain.lock().await;
            inner.def.disks[0].cache = CacheMode::Writeback;
        }
        check_allowed(&domain, MigrateFlags::LIVE | MigrateFlags::UNSAFE)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cache_is_allowed_on_non_shared_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let domain = test_domain(dir.path());
        activate(&domain).await;

        // A file on a plain local filesystem is unreachable from the peer,
        // so its host cache cannot be corrupted by the switchover.
        let image = dir.path().join("a.qcow2");
        std::fs::write(&image, b"").unwrap();
        {
            let mut inner = domain.lock().await;
            inner.def.disks.push(writable_disk(
                StorageSource::File { path: image },
                CacheMode::Writeback,
            ));
        }
        check_allowed(&domain, MigrateFlags::LIVE).await.unwrap();
    }

    #[tokio::test]
    async fn test_rbd_disks_manage_their_own_cache() {
        let dir = tempfile::tempdir().unwrap();
        let domain = test_domain(dir.path());
        activate(&domain).await;

        {
            let mut inner = domain.lock().await;
            inner.def.disks.push(writable_disk(
                StorageSource::Network {
                    protocol: NetworkProtocol::Rbd,
                    name: "pool/image".into(),
                    hosts: vec![],
                    auth: None,
                },
                CacheMode::Writeback,
            ));
        }
        check_allowed(&domain, MigrateFlags::LIVE).await.unwrap();

        // Other network protocols with a writable cache stay refused.
        {
            let mut inner = domain.lock().await;
            inner.def.disks[0].source = Some(StorageSource::Network {
                protocol: NetworkProtocol::Gluster,
                name: "vol/image".into(),
                hosts: vec![],
                auth: None,
            });
        }
        let err = check_allowed(&domain, MigrateFlags::LIVE).await.unwrap_err();
        assert_eq!(err.code(), "migrate-unsafe");
    }

    #[tokio::test]
    async fn test_non_usb_hostdev_blocks_migration() {
        let dir = tempfile::tempdir().unwrap();
        let domain = test_domain(dir.path());
        activate(&domain).await;
        {
            let mut inner = domain.lock().await;
            inner.def.hostdevs.push(HostdevConfig::PciVfio {
                host_address: PciAddress::new(0, 2, 0, 0),
                alias: None,
            });
        }
        let err = check_allowed(&domain, MigrateFlags::LIVE).await.unwrap_err();
        assert_eq!(err.code(), "config-unsupported");

        {
            let mut inner = domain.lock().await;
            inner.def.hostdevs.clear();
            inner.def.hostdevs.push(HostdevConfig::Usb {
                bus: 1,
                device: 4,
                alias: None,
            });
        }
        check_allowed(&domain, MigrateFlags::LIVE).await.unwrap();
    }

    #[tokio::test]
    async fn test_invtsc_blocks_migration() {
        let dir = tempfile::tempdir().unwrap();
        let domain = test_domain(dir.path());
        activate(&domain).await;
        domain.lock().await.def.require_invtsc = true;
        let err = check_allowed(&domain, MigrateFlags::LIVE).await.unwrap_err();
        assert_eq!(err.code(), "config-unsupported");
    }

    #[tokio::test]
    async fn test_active_block_copy_blocks_migration() {
        let dir = tempfile::tempdir().unwrap();
        let domain = test_domain(dir.path());
        activate(&domain).await;
        domain
            .lock()
            .await
            .mirror_active
            .insert("drive-virtio-disk0".into());
        let err = check_allowed(&domain, MigrateFlags::LIVE).await.unwrap_err();
        assert_eq!(err.code(), "block-copy-active");
    }
}
