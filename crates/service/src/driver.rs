// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The driver: one table of domain objects keyed by uuid, plus the
//! process-wide collaborators every operation needs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use hypervisor::{
    hotplug, Domain, DomainContext, LifecycleSink, NullLockManager, NullSecurityManager,
    ProcessLauncher,
};
use jobs::Job;
use migration::{migrate_to_peer, DestinationPeer, MigrationContext};
use resource::{DevicePolicy, PortAllocator};
use uuid::Uuid;
use vmm_types::config::{DiskConfig, DomainConfig, GraphicsConfig, NetConfig, StorageSource};
use vmm_types::migrate::MigrateFlags;
use vmm_types::state::DomainEvent;
use vmm_types::{Result, VmmError};

use crate::config::DriverConfig;

struct LogLifecycleSink;

impl LifecycleSink for LogLifecycleSink {
    fn emit(&self, name: &str, uuid: Uuid, event: DomainEvent) {
        info!(sl!(), "lifecycle event";
            "domain" => name, "uuid" => uuid.to_string(),
            "event" => format!("{:?}", event));
    }
}

/// Identity of one API client connection. The RPC surface asks for one per
/// accepted connection and reports it back when the connection closes; the
/// core never sees the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

pub struct VmmDriver {
    pub config: DriverConfig,
    ctx: Arc<DomainContext>,
    migration: Arc<MigrationContext>,
    domains: RwLock<HashMap<Uuid, Arc<Domain>>>,
    next_client: AtomicU64,
    /// Domains to kill when their owning connection goes away.
    autodestroy: RwLock<HashMap<Uuid, ClientId>>,
}

impl VmmDriver {
    pub fn new(config: DriverConfig) -> Result<VmmDriver> {
        let store = persist::StatusStore::new(&config.state_dir)
            .map_err(|e| VmmError::OperationFailed(format!("opening state dir: {}", e)))?;

        let ctx = Arc::new(DomainContext {
            store,
            launcher: Arc::new(ProcessLauncher::new(
                config.qemu_binary.clone(),
                config.run_dir.clone(),
            )),
            lock_manager: Arc::new(NullLockManager),
            security: Arc::new(NullSecurityManager),
            device_policy: DevicePolicy {
                device_acl: config.cgroup_device_acl.clone(),
                allow_host_audio_without_graphics: config.allow_host_audio_without_graphics,
                allow_host_audio_vnc: config.allow_host_audio_vnc,
            },
            cgroup_partition: config.cgroup_partition.clone(),
            log_dir: config.log_dir.clone(),
            snapshot_dir: config.snapshot_dir.clone(),
            privileged: config.privileged,
            max_queued_jobs: config.max_queued_jobs,
            job_wait: config.job_wait(),
            lifecycle: RwLock::new(Some(Arc::new(LogLifecycleSink) as Arc<dyn LifecycleSink>)),
        });

        let migration = Arc::new(MigrationContext {
            hostname: config.effective_hostname(),
            host_uuid: host_uuid(&config),
            listen_address: config.migration_listen.clone(),
            ports: Arc::new(PortAllocator::new(
                config.migration_port_min,
                config.migration_port_max,
            )),
        });

        Ok(VmmDriver {
            config,
            ctx,
            migration,
            domains: RwLock::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            autodestroy: RwLock::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> Arc<DomainContext> {
        self.ctx.clone()
    }

    pub fn migration_context(&self) -> Arc<MigrationContext> {
        self.migration.clone()
    }

    // ------------------------------------------------------------------
    // Domain table
    // ------------------------------------------------------------------

    /// Define a new domain. Exactly one object may exist per uuid.
    pub fn define(&self, def: DomainConfig) -> Result<Arc<Domain>> {
        let mut domains = self.domains.write().unwrap();
        if domains.contains_key(&def.uuid) {
            return Err(VmmError::OperationInvalid(format!(
                "domain with uuid {} already exists",
                def.uuid
            )));
        }
        if domains
            .values()
            .any(|d| d.uuid != def.uuid && domain_name_nonblocking(d) == def.name)
        {
            return Err(VmmError::OperationInvalid(format!(
                "domain name {} is already taken",
                def.name
            )));
        }
        let uuid = def.uuid;
        let domain = Domain::new(def, true, self.ctx.clone());
        domains.insert(uuid, domain.clone());
        Ok(domain)
    }

    /// Insert a recovered or incoming domain object directly.
    pub fn adopt(&self, domain: Arc<Domain>) -> Result<()> {
        let mut domains = self.domains.write().unwrap();
        if domains.contains_key(&domain.uuid) {
            return Err(VmmError::OperationInvalid(format!(
                "domain with uuid {} already exists",
                domain.uuid
            )));
        }
        domains.insert(domain.uuid, domain);
        Ok(())
    }

    pub fn lookup(&self, uuid: Uuid) -> Result<Arc<Domain>> {
        self.domains
            .read()
            .unwrap()
            .get(&uuid)
            .cloned()
            .ok_or_else(|| VmmError::OperationInvalid(format!("no domain with uuid {}", uuid)))
    }

    pub fn list(&self) -> Vec<Arc<Domain>> {
        self.domains.read().unwrap().values().cloned().collect()
    }

    /// Forget a domain that is both inactive and non-persistent; its
    /// lifetime is over.
    pub async fn reap(&self, uuid: Uuid) -> Result<()> {
        let domain = self.lookup(uuid)?;
        if domain.is_active().await || domain.is_persistent() {
            return Ok(());
        }
        self.domains.write().unwrap().remove(&uuid);
        Ok(())
    }

    pub async fn undefine(&self, uuid: Uuid) -> Result<()> {
        let domain = self.lookup(uuid)?;
        domain.set_persistent(false);
        if !domain.is_active().await {
            self.domains.write().unwrap().remove(&uuid);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Auto-destroy registry
    // ------------------------------------------------------------------

    /// Hand out an identity for a newly accepted API connection.
    pub fn register_client(&self) -> ClientId {
        ClientId(self.next_client.fetch_add(1, Ordering::Relaxed))
    }

    /// Tie the domain's lifetime to `client`: when that connection closes,
    /// the domain is destroyed.
    pub fn mark_autodestroy(&self, uuid: Uuid, client: ClientId) -> Result<()> {
        let domain = self.lookup(uuid)?;
        domain.set_autodestroy(true);
        self.autodestroy.write().unwrap().insert(uuid, client);
        Ok(())
    }

    /// Detach the domain from its owning connection (e.g. an incoming
    /// migration completed).
    pub fn unmark_autodestroy(&self, uuid: Uuid) {
        if let Ok(domain) = self.lookup(uuid) {
            domain.set_autodestroy(false);
        }
        self.autodestroy.write().unwrap().remove(&uuid);
    }

    /// The RPC surface reports a closed connection here: every domain the
    /// client owned is torn down, transient ones disappear from the table.
    pub async fn client_closed(&self, client: ClientId) {
        let owned: Vec<Uuid> = {
            let registry = self.autodestroy.read().unwrap();
            registry
                .iter()
                .filter(|(_, owner)| **owner == client)
                .map(|(uuid, _)| *uuid)
                .collect()
        };

        for uuid in owned {
            self.autodestroy.write().unwrap().remove(&uuid);
            let domain = match self.lookup(uuid) {
                Ok(domain) => domain,
                Err(_) => continue,
            };
            domain.set_autodestroy(false);
            if domain.is_active().await {
                info!(sl!(), "auto-destroying domain of closed connection";
                    "uuid" => uuid.to_string());
                if let Err(e) = domain.destroy().await {
                    warn!(sl!(), "auto-destroy failed";
                        "uuid" => uuid.to_string(), "error" => e.to_string());
                }
            }
            let _ = self.reap(uuid).await;
        }
    }

    // ------------------------------------------------------------------
    // Device hotplug entry points (each one owns a job slot)
    // ------------------------------------------------------------------

    pub async fn attach_disk(&self, uuid: Uuid, disk: DiskConfig) -> Result<()> {
        let domain = self.lookup(uuid)?;
        let ticket = domain.jobs.begin_job(Job::Modify).await?;
        let result = hotplug::attach_disk(&domain, disk).await;
        domain.jobs.end_job(ticket).await;
        result
    }

    pub async fn detach_disk(&self, uuid: Uuid, dst: &str) -> Result<()> {
        let domain = self.lookup(uuid)?;
        let ticket = domain.jobs.begin_job(Job::Modify).await?;
        let result = hotplug::detach_disk(&domain, dst).await;
        domain.jobs.end_job(ticket).await;
        result
    }

    pub async fn change_media(
        &self,
        uuid: Uuid,
        dst: &str,
        source: Option<StorageSource>,
    ) -> Result<()> {
        let domain = self.lookup(uuid)?;
        let ticket = domain.jobs.begin_job(Job::Modify).await?;
        let result = hotplug::change_disk_media(&domain, dst, source).await;
        domain.jobs.end_job(ticket).await;
        result
    }

    pub async fn attach_net(&self, uuid: Uuid, net: NetConfig) -> Result<()> {
        let domain = self.lookup(uuid)?;
        let ticket = domain.jobs.begin_job(Job::Modify).await?;
        let result = hotplug::attach_net(&domain, net).await;
        domain.jobs.end_job(ticket).await;
        result
    }

    pub async fn detach_net(&self, uuid: Uuid, mac: &str) -> Result<()> {
        let domain = self.lookup(uuid)?;
        let ticket = domain.jobs.begin_job(Job::Modify).await?;
        let result = hotplug::detach_net(&domain, mac).await;
        domain.jobs.end_job(ticket).await;
        result
    }

    pub async fn update_net(&self, uuid: Uuid, net: NetConfig) -> Result<()> {
        let domain = self.lookup(uuid)?;
        let ticket = domain.jobs.begin_job(Job::Modify).await?;
        let result = hotplug::update_net(&domain, net).await;
        domain.jobs.end_job(ticket).await;
        result
    }

    pub async fn update_graphics(&self, uuid: Uuid, graphics: GraphicsConfig) -> Result<()> {
        let domain = self.lookup(uuid)?;
        let ticket = domain.jobs.begin_job(Job::Modify).await?;
        let result = hotplug::update_graphics(&domain, graphics).await;
        domain.jobs.end_job(ticket).await;
        result
    }

    /// Tune the bandwidth of a running migration. Nests as a
    /// migration-op job inside the active async job.
    pub async fn migrate_set_max_speed(&self, uuid: Uuid, bps: u64) -> Result<()> {
        self.migration_op(uuid, |mon| {
            Box::pin(async move { mon.migrate_set_speed(bps).await })
        })
        .await
    }

    /// Tune the maximum tolerated downtime of a running migration.
    pub async fn migrate_set_max_downtime(&self, uuid: Uuid, seconds: f64) -> Result<()> {
        self.migration_op(uuid, |mon| {
            Box::pin(async move { mon.migrate_set_downtime(seconds).await })
        })
        .await
    }

    /// Resize the compression cache of a running migration.
    pub async fn migrate_set_cache_size(&self, uuid: Uuid, bytes: u64) -> Result<()> {
        self.migration_op(uuid, |mon| {
            Box::pin(async move { mon.migrate_set_cache_size(bytes).await })
        })
        .await
    }

    async fn migration_op<F>(&self, uuid: Uuid, op: F) -> Result<()>
    where
        F: for<'a> FnOnce(
            &'a hypervisor::MonitorGuard,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<
                        Output = std::result::Result<(), monitor::MonitorError>,
                    > + Send
                    + 'a,
            >,
        >,
    {
        let domain = self.lookup(uuid)?;
        let ticket = domain.jobs.begin_job(Job::MigrationOp).await?;
        let result = async {
            let mon = domain.enter_monitor().await?;
            let outcome = op(&mon).await.map_err(VmmError::from);
            domain.exit_monitor(mon).await?;
            outcome
        }
        .await;
        domain.jobs.end_job(ticket).await;
        result
    }

    /// Ask the active async job of a domain to cancel.
    pub async fn abort_job(&self, uuid: Uuid) -> Result<()> {
        let domain = self.lookup(uuid)?;
        let ticket = domain.jobs.begin_job(Job::Abort).await?;
        let result = domain.jobs.request_abort().await;
        domain.jobs.end_job(ticket).await;
        result
    }

    /// Peer-to-peer migration: this daemon drives the whole exchange.
    pub async fn migrate(
        &self,
        uuid: Uuid,
        peer: &dyn DestinationPeer,
        flags: MigrateFlags,
        dname: Option<&str>,
    ) -> Result<()> {
        let domain = self.lookup(uuid)?;
        let result = migrate_to_peer(
            domain.clone(),
            self.migration.clone(),
            peer,
            flags,
            dname,
        )
        .await;
        if result.is_ok() && flags.contains(MigrateFlags::UNDEFINE_SOURCE) {
            self.undefine(uuid).await?;
        }
        result
    }
}

/// Stable host identity advertised in migration cookies. Persisted beside
/// the state directory so it survives restarts.
fn host_uuid(config: &DriverConfig) -> Uuid {
    let path = config.state_dir.join("host-uuid");
    if let Ok(text) = std::fs::read_to_string(&path) {
        if let Ok(uuid) = text.trim().parse() {
            return uuid;
        }
    }
    let uuid = Uuid::new_v4();
    let _ = std::fs::create_dir_all(&config.state_dir);
    let _ = std::fs::write(&path, uuid.to_string());
    uuid
}

// Domain names sit behind an async lock; the define-time duplicate check
// runs from sync context, so peek without blocking.
fn domain_name_nonblocking(domain: &Arc<Domain>) -> String {
    domain.try_name().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(dir: &std::path::Path) -> VmmDriver {
        let mut config = DriverConfig::default();
        config.state_dir = dir.join("state");
        config.log_dir = dir.join("log");
        config.snapshot_dir = dir.join("snap");
        config.run_dir = dir.join("run");
        config.privileged = false;
        config.hostname = "host-a.example.com".into();
        VmmDriver::new(config).unwrap()
    }

    fn def(name: &str) -> DomainConfig {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "uuid": Uuid::new_v4().to_string(),
            "vcpus": 1,
            "iothreads": 0,
            "memory_kib": 524288
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_define_enforces_unique_uuid_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());

        let a = def("vm1");
        let uuid = a.uuid;
        driver.define(a.clone()).unwrap();
        assert!(driver.define(a).is_err());

        let mut b = def("vm1");
        b.uuid = Uuid::new_v4();
        assert!(driver.define(b).is_err());

        assert_eq!(driver.lookup(uuid).unwrap().uuid, uuid);
        assert_eq!(driver.list().len(), 1);
    }

    #[tokio::test]
    async fn test_undefine_inactive_removes_domain() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let a = def("vm1");
        let uuid = a.uuid;
        driver.define(a).unwrap();
        driver.undefine(uuid).await.unwrap();
        assert!(driver.lookup(uuid).is_err());
    }

    #[tokio::test]
    async fn test_client_close_destroys_owned_domains() {
        use vmm_types::state::{DomainState, StateReason};

        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let a = def("vm1");
        let uuid = a.uuid;
        let domain = driver.define(a).unwrap();

        // Pretend the guest is up; no pid means nothing is really killed.
        {
            let mut inner = domain.lock().await;
            inner.set_state(DomainState::Running, StateReason::Booted);
        }

        let client = driver.register_client();
        let other = driver.register_client();
        assert_ne!(client, other);
        driver.mark_autodestroy(uuid, client).unwrap();
        assert!(domain.is_autodestroy());

        // A different connection closing leaves the domain alone.
        driver.client_closed(other).await;
        assert!(domain.is_active().await);

        driver.client_closed(client).await;
        assert!(!domain.is_active().await);
        assert!(!domain.is_autodestroy());

        // Closing again is a no-op: the registration is gone.
        driver.client_closed(client).await;
    }

    #[tokio::test]
    async fn test_unmark_autodestroy_detaches_from_connection() {
        use vmm_types::state::{DomainState, StateReason};

        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let a = def("vm1");
        let uuid = a.uuid;
        let domain = driver.define(a).unwrap();
        {
            let mut inner = domain.lock().await;
            inner.set_state(DomainState::Running, StateReason::Booted);
        }

        let client = driver.register_client();
        driver.mark_autodestroy(uuid, client).unwrap();
        driver.unmark_autodestroy(uuid);

        // The connection may die; the domain survives it.
        driver.client_closed(client).await;
        assert!(domain.is_active().await);
        assert!(!domain.is_autodestroy());
    }

    #[tokio::test]
    async fn test_host_uuid_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DriverConfig::default();
        config.state_dir = dir.path().to_path_buf();
        let first = host_uuid(&config);
        let second = host_uuid(&config);
        assert_eq!(first, second);
    }
}
