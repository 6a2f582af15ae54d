// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Device unplug against a scripted in-process QMP peer: the full path
//! from device_del through the DEVICE_DELETED notification to host-side
//! cleanup.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use hypervisor::{
    hotplug, Domain, DomainContext, NullLockManager, NullSecurityManager, ProcessLauncher,
};
use monitor::QmpChannel;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use uuid::Uuid;
use vmm_types::config::{
    CacheMode, DeviceAddress, DiskBus, DiskConfig, DiskDevice, DiskFormat, PciAddress,
    StorageSource,
};
use vmm_types::state::{DomainState, StateReason};

fn context(dir: &std::path::Path) -> Arc<DomainContext> {
    Arc::new(DomainContext {
        store: persist::StatusStore::new(dir.join("state")).unwrap(),
        launcher: Arc::new(ProcessLauncher::new(
            PathBuf::from("/usr/bin/qemu-system-x86_64"),
            dir.join("run"),
        )),
        lock_manager: Arc::new(NullLockManager),
        security: Arc::new(NullSecurityManager),
        device_policy: resource::DevicePolicy::default(),
        cgroup_partition: "/machine".to_string(),
        log_dir: dir.join("log"),
        snapshot_dir: dir.join("snapshots"),
        privileged: false,
        max_queued_jobs: 0,
        job_wait: Duration::from_secs(30),
        lifecycle: RwLock::new(None),
    })
}

fn disk_vda() -> DiskConfig {
    DiskConfig {
        dst: "vda".to_string(),
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
        alias: Some("virtio-disk0".to_string()),
        address: Some(DeviceAddress::Pci(PciAddress::new(0, 0, 4, 0))),
        capacity_bytes: None,
        controller: None,
        unit: None,
    }
}

/// Answer every request with an empty return; optionally emit the deletion
/// notice after device_del. Records the commands seen.
fn fake_qmp_peer(
    stream: UnixStream,
    emit_deleted: bool,
    commands: Arc<Mutex<Vec<String>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (rx, mut tx) = stream.into_split();
        let mut reader = BufReader::new(rx);
        tx.write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let req: Value = serde_json::from_str(&line).unwrap();
            let cmd = req["execute"].as_str().unwrap().to_string();
            let id = req["id"].as_str().unwrap().to_string();
            commands.lock().unwrap().push(cmd.clone());
            tx.write_all(format!("{{\"return\": {{}}, \"id\": \"{}\"}}\n", id).as_bytes())
                .await
                .unwrap();
            if cmd == "device_del" && emit_deleted {
                tx.write_all(
                    b"{\"event\": \"DEVICE_DELETED\", \"data\": {\"device\": \"virtio-disk0\", \"path\": \"/machine/peripheral/virtio-disk0\"}}\n",
                )
                .await
                .unwrap();
            }
        }
    })
}

async fn running_domain_with_disk(
    dir: &std::path::Path,
    emit_deleted: bool,
) -> (Arc<Domain>, Arc<Mutex<Vec<String>>>, tokio::task::JoinHandle<()>) {
    let def = serde_json::from_value(serde_json::json!({
        "name": "unplug-vm",
        "uuid": Uuid::new_v4().to_string(),
        "vcpus": 1,
        "iothreads": 0,
        "memory_kib": 524288
    }))
    .unwrap();
    let domain = Domain::new(def, true, context(dir));

    let (ours, theirs) = UnixStream::pair().unwrap();
    let commands = Arc::new(Mutex::new(Vec::new()));
    let peer = fake_qmp_peer(theirs, emit_deleted, commands.clone());

    let handler = hypervisor::monitor_handler(&domain);
    let channel = QmpChannel::connect_stream(ours, None, handler);
    channel.handshake().await.unwrap();

    {
        let mut inner = domain.lock().await;
        inner.set_state(DomainState::Running, StateReason::Booted);
        inner.pid = Some(1);
        inner.monitor_path = Some(dir.join("monitor"));
        inner.mon = Some(channel);
        inner.caps = hypervisor::CapFlags::DEVICE_DELETED_EVENT;
        inner.def.disks.push(disk_vda());
        inner.aliases.insert("virtio-disk0".to_string());
    }
    domain
        .pci
        .reserve(PciAddress::new(0, 0, 4, 0))
        .unwrap();

    (domain, commands, peer)
}

#[tokio::test]
async fn test_unplug_with_deletion_event() {
    let dir = tempfile::tempdir().unwrap();
    let (domain, commands, peer) = running_domain_with_disk(dir.path(), true).await;

    hotplug::detach_disk(&domain, "vda").await.unwrap();

    {
        let inner = domain.lock().await;
        assert!(inner.def.disks.is_empty());
        assert!(!inner.aliases.contains("virtio-disk0"));
    }
    assert!(!domain.pci.in_use(PciAddress::new(0, 0, 4, 0)));

    let seen = commands.lock().unwrap().clone();
    assert!(seen.contains(&"device_del".to_string()));
    assert!(seen.contains(&"drive_del".to_string()));

    peer.abort();
}

#[tokio::test]
async fn test_unplug_without_event_defers_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let (domain, commands, peer) = running_domain_with_disk(dir.path(), false).await;

    // The peer never confirms; after the bounded wait the call succeeds
    // with no observable device change.
    hotplug::detach_disk(&domain, "vda").await.unwrap();

    {
        let inner = domain.lock().await;
        assert_eq!(inner.def.disks.len(), 1);
        assert!(inner.aliases.contains("virtio-disk0"));
    }
    assert!(domain.pci.in_use(PciAddress::new(0, 0, 4, 0)));

    let seen = commands.lock().unwrap().clone();
    assert!(seen.contains(&"device_del".to_string()));
    assert!(!seen.contains(&"drive_del".to_string()));

    // A deletion notice for an unrelated alias must not clean this disk up.
    hotplug::remove_device_by_alias(&domain, "virtio-disk9")
        .await
        .unwrap();
    assert_eq!(domain.lock().await.def.disks.len(), 1);

    peer.abort();
}

#[tokio::test]
async fn test_multifunction_unplug_is_refused_before_any_monitor_call() {
    let dir = tempfile::tempdir().unwrap();
    let (domain, commands, peer) = running_domain_with_disk(dir.path(), true).await;

    // A second function appears in the same slot.
    domain
        .pci
        .reserve(PciAddress::new(0, 0, 4, 1))
        .unwrap();

    let err = hotplug::detach_disk(&domain, "vda").await.unwrap_err();
    assert_eq!(err.code(), "operation-failed");
    assert_eq!(
        err.to_string(),
        "operation failed: cannot hot unplug multifunction PCI device: vda"
    );

    // The hypervisor was never asked to do anything beyond the handshake.
    let seen = commands.lock().unwrap().clone();
    assert_eq!(seen, vec!["qmp_capabilities".to_string()]);

    peer.abort();
}
