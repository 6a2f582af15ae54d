// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Resource tuning blocks applied through the host control groups.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemTune {
    #[serde(default)]
    pub hard_limit_kib: Option<u64>,
    #[serde(default)]
    pub soft_limit_kib: Option<u64>,
    #[serde(default)]
    pub swap_hard_limit_kib: Option<u64>,
}

/// Pinning of one vcpu or iothread onto a host cpu set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuPin {
    pub id: u32,
    /// Host cpu list in kernel list format, e.g. "0-3,8".
    pub cpuset: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTune {
    #[serde(default)]
    pub shares: Option<u64>,
    #[serde(default)]
    pub period_us: Option<u64>,
    #[serde(default)]
    pub quota_us: Option<i64>,
    #[serde(default)]
    pub emulator_period_us: Option<u64>,
    #[serde(default)]
    pub emulator_quota_us: Option<i64>,
    #[serde(default)]
    pub vcpupin: Vec<CpuPin>,
    #[serde(default)]
    pub iothreadpin: Vec<CpuPin>,
    #[serde(default)]
    pub emulatorpin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlkioDeviceTune {
    pub path: PathBuf,
    #[serde(default)]
    pub weight: Option<u16>,
    #[serde(default)]
    pub read_iops: Option<u64>,
    #[serde(default)]
    pub write_iops: Option<u64>,
    #[serde(default)]
    pub read_bps: Option<u64>,
    #[serde(default)]
    pub write_bps: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlkioTune {
    #[serde(default)]
    pub weight: Option<u16>,
    #[serde(default)]
    pub devices: Vec<BlkioDeviceTune>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumaMode {
    Strict,
    Preferred,
    Interleave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumaPlacement {
    Static,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaTune {
    pub mode: NumaMode,
    #[serde(default)]
    pub nodeset: Option<String>,
    pub placement: NumaPlacement,
}
