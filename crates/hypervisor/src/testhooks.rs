// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Construction helpers for tests in dependent crates. Only compiled with
//! the `test-harness` feature, which the dependents enable from their
//! dev-dependencies.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use persist::StatusStore;
use resource::DevicePolicy;
use uuid::Uuid;

use crate::domain::{Domain, DomainContext};
use crate::launcher::ProcessLauncher;
use crate::seams::{NullLockManager, NullSecurityManager};

pub fn context_for_tests(dir: &Path) -> Arc<DomainContext> {
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

pub fn domain_for_tests(name: &str, dir: &Path) -> Arc<Domain> {
    let def = serde_json::from_value(serde_json::json!({
        "name": name,
        "uuid": Uuid::new_v4().to_string(),
        "vcpus": 2,
        "iothreads": 0,
        "memory_kib": 1048576
    }))
    .unwrap();
    Domain::new(def, true, context_for_tests(dir))
}
