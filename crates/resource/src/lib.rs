// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host resource isolation for domains.
//!
//! Maps a VM's disks, host devices and thread classes onto kernel control
//! groups with strict allow/deny device policies, and owns the daemon-wide
//! migration port window.

#[macro_use]
extern crate slog;

logging::logger_with_subsystem!(sl, "resource");

mod cgroup;
mod devices;
mod ports;
mod tuning;

pub use cgroup::{CgroupController, DEFAULT_PARTITION, SCOPE_SUFFIX};
pub use devices::DevicePolicy;
pub use ports::PortAllocator;
