// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The domain aggregate: one object per VM, carrying the monitor channel,
//! the cgroup handle, the job coordinator and the negotiated capability
//! set, plus the lifecycle and hotplug operations built on top of them.

#[macro_use]
extern crate slog;

logging::logger_with_subsystem!(sl, "hypervisor");

mod address;
mod capabilities;
mod domain;
mod events;
pub mod hotplug;
mod launcher;
mod lifecycle;
mod seams;
mod snapshot;
#[cfg(feature = "test-harness")]
pub mod testhooks;
mod vmlog;

pub use address::PciAddressAllocator;
pub use capabilities::CapFlags;
pub use domain::{Domain, DomainContext, DomainInner, LifecycleSink, MonitorGuard};
pub use launcher::{LaunchedVm, ProcessLauncher, VmLauncher};
pub use seams::{LockManager, NullLockManager, NullSecurityManager, SecurityManager};
pub use snapshot::{SnapshotDiskMeta, SnapshotMeta, SnapshotStore};
pub use vmlog::VmLogFile;

use std::sync::Arc;

/// The event handler wiring a monitor channel back into `domain`.
pub fn monitor_handler(domain: &Arc<Domain>) -> Arc<dyn monitor::DomainEventHandler> {
    Arc::new(events::DomainMonitorHandler {
        domain: Arc::downgrade(domain),
    })
}
