// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The monitor channel to one hypervisor process.
//!
//! Offers a synchronous request/reply API over the inherently asynchronous
//! control socket while demultiplexing unsolicited events to registered
//! callbacks. Exactly one request is in flight at a time; channel faults are
//! fatal and sticky. On UNIX-socket transports a request may carry one file
//! descriptor as ancillary data.

#[macro_use]
extern crate slog;

logging::logger_with_subsystem!(sl, "monitor");

mod channel;
mod commands;
mod error;
mod events;
mod logfile;

pub use channel::{MonitorConfig, MonitorTransportKind, QmpChannel};
pub use commands::{
    BlockJobInfo, CpuInfo, IoThreadInfo, MigrateInfo, MigrateRamInfo, MigrateDiskInfo,
    MigrateXbzrleInfo, SpiceMigrationInfo, StatusInfo, VersionInfo,
};
pub use error::MonitorError;
pub use events::{DomainEventHandler, QmpEvent};
pub use logfile::read_log_error;
