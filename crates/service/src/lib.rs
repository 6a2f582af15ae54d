// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The daemon glue: configuration, the driver owning the domain table and
//! the process-wide allocators, and the reconnect sweep after a restart.

#[macro_use]
extern crate slog;

logging::logger_with_subsystem!(sl, "service");

mod config;
mod driver;
mod reconnect;

pub use config::DriverConfig;
pub use driver::{ClientId, VmmDriver};
pub use reconnect::reconnect_all;
