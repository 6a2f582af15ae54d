// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The domain object and its private runtime data.
//!
//! Exactly one object exists per VM uuid inside a daemon. All mutable
//! runtime state sits behind one async lock; the monitor is entered through
//! a bracket that drops that lock for the duration of the blocking call and
//! re-checks liveness afterwards.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use jobs::{AsyncJobTicket, JobCoordinator, JobPersister, JobSnapshot, JobTicket};
use monitor::{MonitorTransportKind, QmpChannel};
use persist::{DomainStatus, JobStatusRecord, StatusStore};
use resource::{CgroupController, DevicePolicy};
use tokio::sync::{Mutex, MutexGuard, Notify};
use uuid::Uuid;
use vmm_types::config::DomainConfig;
use vmm_types::state::{DomainEvent, DomainState, StateReason};
use vmm_types::{Result, VmmError};

use crate::address::PciAddressAllocator;
use crate::capabilities::CapFlags;
use crate::launcher::VmLauncher;
use crate::seams::{LockManager, SecurityManager};

/// Receives lifecycle edges (started, suspended, resumed, stopped) for the
/// layers above the core.
pub trait LifecycleSink: Send + Sync {
    fn emit(&self, name: &str, uuid: Uuid, event: DomainEvent);
}

/// Process-wide collaborators handed to every domain.
pub struct DomainContext {
    pub store: StatusStore,
    pub launcher: Arc<dyn VmLauncher>,
    pub lock_manager: Arc<dyn LockManager>,
    pub security: Arc<dyn SecurityManager>,
    pub device_policy: DevicePolicy,
    pub cgroup_partition: String,
    pub log_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    /// Cgroups are only touched when running privileged.
    pub privileged: bool,
    pub max_queued_jobs: u32,
    pub job_wait: Duration,
    pub lifecycle: RwLock<Option<Arc<dyn LifecycleSink>>>,
}

impl DomainContext {
    pub fn emit(&self, name: &str, uuid: Uuid, event: DomainEvent) {
        let sink = self.lifecycle.read().unwrap().clone();
        if let Some(sink) = sink {
            sink.emit(name, uuid, event);
        }
    }
}

/// Deferred teardown steps accumulated by operations that must not undo
/// their work before the VM actually stops.
pub type CleanupFn = Box<dyn FnOnce(&mut DomainInner) + Send>;

pub struct DomainInner {
    pub def: DomainConfig,
    /// Next-boot configuration, when it differs from the live one.
    pub new_def: Option<DomainConfig>,
    pub state: DomainState,
    pub reason: StateReason,
    pub pid: Option<i32>,
    pub mon: Option<Arc<QmpChannel>>,
    pub monitor_path: Option<PathBuf>,
    pub monitor_kind: MonitorTransportKind,
    /// The channel hit EOF while the VM looked alive; housekeeping acts on
    /// it.
    pub monitor_dead: bool,
    pub cgroup: Option<Arc<CgroupController>>,
    pub vcpu_pids: Vec<i32>,
    pub iothread_pids: Vec<i32>,
    pub caps: CapFlags,
    pub lock_state: Option<String>,
    pub fake_reboot: bool,
    /// NBD server port while a non-shared-disk migration is inbound.
    pub nbd_port: Option<u16>,
    /// Run state before migration started, for rollback on cancel.
    pub premigration_state: Option<DomainState>,
    pub aliases: HashSet<String>,
    /// Drive ids with an active block mirror.
    pub mirror_active: HashSet<String>,
    /// Drive aliases whose tray is currently open.
    pub tray_open: HashSet<String>,
    pub cleanup: Vec<CleanupFn>,
}

impl DomainInner {
    pub fn set_state(&mut self, state: DomainState, reason: StateReason) {
        debug!(sl!(), "domain state change";
            "name" => &self.def.name,
            "from" => self.state.to_string(), "to" => state.to_string(),
            "reason" => reason.to_string());
        self.state = state;
        self.reason = reason;
    }

    pub fn require_active(&self) -> Result<()> {
        if !self.state.is_active() {
            return Err(VmmError::OperationInvalid(format!(
                "domain {} is not running",
                self.def.name
            )));
        }
        Ok(())
    }
}

enum RemovalState {
    Idle,
    Waiting(String),
    Finished(String),
}

/// The bracket around one blocking monitor interaction. Holds the channel
/// reference and, inside an async job, the nested job slot.
pub struct MonitorGuard {
    chan: Arc<QmpChannel>,
    nested: Option<JobTicket>,
}

impl std::fmt::Debug for MonitorGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorGuard").finish_non_exhaustive()
    }
}

impl std::ops::Deref for MonitorGuard {
    type Target = QmpChannel;

    fn deref(&self) -> &QmpChannel {
        &self.chan
    }
}

pub struct Domain {
    pub uuid: Uuid,
    pub jobs: JobCoordinator,
    pub ctx: Arc<DomainContext>,
    pub pci: PciAddressAllocator,
    inner: Mutex<DomainInner>,
    removal: StdMutex<RemovalState>,
    removal_cond: Notify,
    pub(crate) tray_cond: Notify,
    persistent: AtomicBool,
    autodestroy: AtomicBool,
}

impl Domain {
    pub fn new(def: DomainConfig, persistent: bool, ctx: Arc<DomainContext>) -> Arc<Domain> {
        let uuid = def.uuid;
        let jobs = JobCoordinator::new(ctx.max_queued_jobs, ctx.job_wait);
        let domain = Arc::new(Domain {
            uuid,
            jobs,
            ctx,
            pci: PciAddressAllocator::new(),
            inner: Mutex::new(DomainInner {
                def,
                new_def: None,
                state: DomainState::Shutoff,
                reason: StateReason::Unknown,
                pid: None,
                mon: None,
                monitor_path: None,
                monitor_kind: MonitorTransportKind::Unix,
                monitor_dead: false,
                cgroup: None,
                vcpu_pids: vec![],
                iothread_pids: vec![],
                caps: CapFlags::empty(),
                lock_state: None,
                fake_reboot: false,
                nbd_port: None,
                premigration_state: None,
                aliases: HashSet::new(),
                mirror_active: HashSet::new(),
                tray_open: HashSet::new(),
                cleanup: vec![],
            }),
            removal: StdMutex::new(RemovalState::Idle),
            removal_cond: Notify::new(),
            tray_cond: Notify::new(),
            persistent: AtomicBool::new(persistent),
            autodestroy: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&(domain.clone() as Arc<dyn JobPersister>));
        domain.jobs.set_persister(weak);
        domain
    }

    pub async fn lock(&self) -> MutexGuard<'_, DomainInner> {
        self.inner.lock().await
    }

    pub async fn name(&self) -> String {
        self.inner.lock().await.def.name.clone()
    }

    /// Non-blocking name read for sync contexts (table lookups). None when
    /// the domain lock is held elsewhere right now.
    pub fn try_name(&self) -> Option<String> {
        self.inner.try_lock().ok().map(|inner| inner.def.name.clone())
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.state.is_active()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::SeqCst)
    }

    pub fn set_persistent(&self, value: bool) {
        self.persistent.store(value, Ordering::SeqCst);
    }

    pub fn is_autodestroy(&self) -> bool {
        self.autodestroy.load(Ordering::SeqCst)
    }

    pub fn set_autodestroy(&self, value: bool) {
        self.autodestroy.store(value, Ordering::SeqCst);
    }

    pub async fn emit_event(&self, event: DomainEvent) {
        let name = self.name().await;
        self.ctx.emit(&name, self.uuid, event);
    }

    // ------------------------------------------------------------------
    // Monitor bracket
    // ------------------------------------------------------------------

    /// Take the monitor for one interaction outside any async job. The
    /// domain lock must NOT be held by the caller; the guard carries a
    /// channel reference so the object stays alive.
    pub async fn enter_monitor(&self) -> Result<MonitorGuard> {
        let inner = self.inner.lock().await;
        inner.require_active()?;
        let chan = inner
            .mon
            .clone()
            .ok_or_else(|| VmmError::OperationInvalid("monitor is not connected".to_string()))?;
        drop(inner);
        Ok(MonitorGuard { chan, nested: None })
    }

    /// Take the monitor from inside an async job: opens the nested job slot
    /// first so concurrent short jobs stay excluded.
    pub async fn enter_monitor_async(&self, ticket: &AsyncJobTicket) -> Result<MonitorGuard> {
        let nested = self.jobs.begin_nested_job(ticket).await?;
        let inner = self.inner.lock().await;
        let chan = match inner.mon.clone() {
            Some(chan) => chan,
            None => {
                drop(inner);
                self.jobs.end_job(nested).await;
                return Err(VmmError::OperationInvalid(
                    "monitor is not connected".to_string(),
                ));
            }
        };
        drop(inner);
        Ok(MonitorGuard {
            chan,
            nested: Some(nested),
        })
    }

    /// Close the bracket: release the nested slot and verify the domain
    /// survived the blocking call.
    pub async fn exit_monitor(&self, guard: MonitorGuard) -> Result<()> {
        let MonitorGuard { chan, nested } = guard;
        drop(chan);
        if let Some(ticket) = nested {
            self.jobs.end_job(ticket).await;
        }
        let inner = self.inner.lock().await;
        if !inner.state.is_active() {
            return Err(VmmError::OperationFailed(format!(
                "domain {} is no longer running",
                inner.def.name
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Device-removal handshake
    // ------------------------------------------------------------------

    /// Arm the unplug waiter before issuing device_del.
    pub(crate) fn removal_start(&self, alias: &str) {
        *self.removal.lock().unwrap() = RemovalState::Waiting(alias.to_string());
    }

    /// Called by the DEVICE_DELETED handler. True when a waiter was armed
    /// for exactly this alias and has been woken; false means the caller
    /// owns the cleanup.
    pub(crate) fn removal_notify(&self, alias: &str) -> bool {
        let mut state = self.removal.lock().unwrap();
        match &*state {
            RemovalState::Waiting(waiting) if waiting == alias => {
                *state = RemovalState::Finished(alias.to_string());
                drop(state);
                self.removal_cond.notify_waiters();
                true
            }
            _ => false,
        }
    }

    /// Disarm the unplug waiter without waiting (device_del failed).
    pub(crate) fn removal_cancel(&self) {
        *self.removal.lock().unwrap() = RemovalState::Idle;
    }

    /// Wait for the armed removal to finish. Returns true when the event
    /// arrived in time; false leaves cleanup to a later event arrival.
    pub(crate) async fn removal_wait(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.removal_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.removal.lock().unwrap();
                match &*state {
                    RemovalState::Finished(_) => {
                        *state = RemovalState::Idle;
                        return true;
                    }
                    RemovalState::Idle => return false,
                    RemovalState::Waiting(_) => {}
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                *self.removal.lock().unwrap() = RemovalState::Idle;
                return false;
            }
        }
    }

    // ------------------------------------------------------------------
    // Status persistence
    // ------------------------------------------------------------------

    /// Build and atomically rewrite the status document.
    pub async fn save_status(&self) -> Result<()> {
        let job = self.jobs.snapshot().await;
        let inner = self.inner.lock().await;
        if !inner.state.is_active() {
            return Ok(());
        }
        let status = build_status(&inner, &job);
        drop(inner);
        self.ctx
            .store
            .save(&status)
            .map_err(|e| VmmError::OperationFailed(format!("saving domain status: {}", e)))
    }

    pub async fn remove_status(&self) -> Result<()> {
        let name = self.name().await;
        self.ctx
            .store
            .remove(&name)
            .map_err(|e| VmmError::OperationFailed(format!("removing domain status: {}", e)))
    }

    /// Record a taint notice in the per-VM log: the host did something to
    /// this guest that support tooling should know about.
    pub async fn taint(&self, reason: &str) {
        let name = self.name().await;
        warn!(sl!(), "domain tainted"; "name" => &name, "reason" => reason);
        match crate::vmlog::VmLogFile::open(&self.ctx.log_dir, &name, false) {
            Ok(mut log) => log.append_taint(&name, reason),
            Err(e) => warn!(sl!(), "cannot record taint notice: {}", e),
        }
    }

    /// Run and drop all pending cleanup callbacks; used at VM stop.
    pub async fn run_cleanup_callbacks(&self) {
        let mut inner = self.inner.lock().await;
        let callbacks = std::mem::take(&mut inner.cleanup);
        for callback in callbacks {
            callback(&mut inner);
        }
    }
}

fn build_status(inner: &DomainInner, job: &JobSnapshot) -> DomainStatus {
    DomainStatus {
        def: inner.def.clone(),
        monitor_path: inner.monitor_path.clone().unwrap_or_default(),
        monitor_type: inner.monitor_kind.as_str().to_string(),
        pid: inner.pid.unwrap_or(0),
        vcpu_pids: inner.vcpu_pids.clone(),
        iothread_pids: inner.iothread_pids.clone(),
        caps: inner.caps.to_bits_persisted(),
        lock_state: inner.lock_state.clone(),
        job: JobStatusRecord {
            active: job.active.to_string(),
            async_job: job.async_job.to_string(),
            phase: job.phase.to_string(),
            owner: job.owner,
            async_owner: job.async_owner,
        },
        fake_reboot: inner.fake_reboot,
        device_aliases: {
            let mut aliases: Vec<String> = inner.aliases.iter().cloned().collect();
            aliases.sort();
            aliases
        },
    }
}

#[async_trait::async_trait]
impl JobPersister for Domain {
    async fn persist_job(&self, _snapshot: &JobSnapshot) -> anyhow::Result<()> {
        self.save_status().await.map_err(anyhow::Error::from)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::launcher::ProcessLauncher;
    use crate::seams::{NullLockManager, NullSecurityManager};

    pub fn context(dir: &std::path::Path) -> Arc<DomainContext> {
        Arc::new(DomainContext {
            store: StatusStore::new(dir.join("state")).unwrap(),
            launcher: Arc::new(ProcessLauncher::new(
                PathBuf::from("/usr/bin/qemu-system-x86_64"),
                dir.join("run"),
            )),
            lock_manager: Arc::new(NullLockManager),
            security: Arc::new(NullSecurityManager),
            device_policy: DevicePolicy::default(),
            cgroup_partition: "/machine".to_string(),
            log_dir: dir.join("log"),
            snapshot_dir: dir.join("snapshots"),
            privileged: false,
            max_queued_jobs: 0,
            job_wait: Duration::from_secs(30),
            lifecycle: RwLock::new(None),
        })
    }

    pub fn domain_config(name: &str) -> DomainConfig {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "uuid": Uuid::new_v4().to_string(),
            "vcpus": 2,
            "iothreads": 0,
            "memory_kib": 1048576
        }))
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[tokio::test]
    async fn test_one_domain_per_uuid_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let def = domain_config("vm1");
        let uuid = def.uuid;
        let domain = Domain::new(def, true, ctx);
        assert_eq!(domain.uuid, uuid);
        assert_eq!(domain.name().await, "vm1");
        assert!(!domain.is_active().await);
    }

    #[tokio::test]
    async fn test_enter_monitor_requires_running() {
        let dir = tempfile::tempdir().unwrap();
        let domain = Domain::new(domain_config("vm1"), true, context(dir.path()));
        let err = domain.enter_monitor().await.unwrap_err();
        assert_eq!(err.code(), "operation-invalid");
    }

    #[tokio::test]
    async fn test_removal_handshake_alias_must_match() {
        let dir = tempfile::tempdir().unwrap();
        let domain = Domain::new(domain_config("vm1"), true, context(dir.path()));

        domain.removal_start("virtio-disk0");
        // An event for a different alias does not wake the waiter.
        assert!(!domain.removal_notify("virtio-disk1"));
        assert!(domain.removal_notify("virtio-disk0"));
        assert!(domain.removal_wait(Duration::from_millis(100)).await);

        // Late events with no armed waiter fall through to direct cleanup.
        assert!(!domain.removal_notify("virtio-disk0"));
    }

    #[tokio::test]
    async fn test_removal_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let domain = Domain::new(domain_config("vm1"), true, context(dir.path()));
        domain.removal_start("virtio-disk0");
        let started = tokio::time::Instant::now();
        assert!(!domain.removal_wait(Duration::from_millis(120)).await);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_tracked_job_persists_status_only_when_active() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let domain = Domain::new(domain_config("vm1"), true, ctx.clone());

        // Inactive: tracked transitions do not write a status file.
        let ticket = domain.jobs.begin_job(jobs::Job::Modify).await.unwrap();
        domain.jobs.end_job(ticket).await;
        assert!(ctx.store.load("vm1").is_err());

        {
            let mut inner = domain.lock().await;
            inner.set_state(DomainState::Running, StateReason::Booted);
            inner.pid = Some(1234);
            inner.monitor_path = Some(PathBuf::from("/run/vmmd/vm1.monitor"));
        }
        let ticket = domain.jobs.begin_job(jobs::Job::Modify).await.unwrap();
        domain.jobs.end_job(ticket).await;
        let status = ctx.store.load("vm1").unwrap();
        assert_eq!(status.pid, 1234);
        assert_eq!(status.job.active, "none");
    }
}
