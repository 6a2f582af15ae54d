// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Daemon entry point: logger, configuration, driver, reconnect sweep,
//! then wait for a termination signal.

use std::path::PathBuf;

use anyhow::{Context, Result};
use slog::{error, info, o};

const DEFAULT_CONFIG: &str = "/etc/vmmd/vmmd.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let config = if config_path.exists() {
        service::DriverConfig::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        service::DriverConfig::default()
    };

    let level =
        logging::level_from_string(&config.log_level).unwrap_or(slog::Level::Info);
    let (logger, _guard) = logging::create_term_logger(level);
    let _scope_guard = slog_scope::set_global_logger(logger.new(o!("name" => "vmmd")));

    info!(slog_scope::logger(), "vmmd starting";
        "config" => config_path.display().to_string());

    let driver = service::VmmDriver::new(config).context("initializing driver")?;

    // Pick running VMs back up before accepting any new work.
    service::reconnect_all(&driver).await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(slog_scope::logger(), "signal handling failed: {}", e);
    }

    info!(slog_scope::logger(), "vmmd shutting down";
        "domains" => driver.list().len());
    Ok(())
}
