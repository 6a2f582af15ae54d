// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Resource tunables: blkio weights and throttles, memory limits, CPU
//! shares and bandwidth, and cpuset placement.

use cgroups_rs::blkio::BlkIoController;
use cgroups_rs::cpu::CpuController;
use cgroups_rs::cpuset::CpuSetController;
use cgroups_rs::memory::MemController;
use vmm_types::config::{BlkioTune, CpuTune, MemTune};
use vmm_types::{Result, VmmError};

use crate::cgroup::{CgroupController, ThreadClass};

const KIB: u64 = 1024;

fn tune_err(what: &str, e: impl std::fmt::Display) -> VmmError {
    VmmError::OperationFailed(format!("applying {}: {}", what, e))
}

impl CgroupController {
    /// blkio weight, per-device weights and per-device throttles.
    pub fn setup_blkio(&self, tune: &BlkioTune) -> Result<()> {
        let blkio = match self.base.controller_of::<BlkIoController>() {
            Some(c) => c,
            None => {
                if tune.weight.is_some() || !tune.devices.is_empty() {
                    return Err(VmmError::ConfigUnsupported(
                        "blkio tuning requested but the blkio controller is not mounted"
                            .to_string(),
                    ));
                }
                return Ok(());
            }
        };

        if let Some(weight) = tune.weight {
            blkio
                .set_weight(weight as u64)
                .map_err(|e| tune_err("blkio weight", e))?;
        }

        for dev in &tune.devices {
            let (major, minor) = match block_device_number(&dev.path)? {
                Some(numbers) => numbers,
                None => {
                    return Err(VmmError::ConfigUnsupported(format!(
                        "blkio tuning target {} is not a block device",
                        dev.path.display()
                    )))
                }
            };
            if let Some(weight) = dev.weight {
                blkio
                    .set_weight_for_device(major, minor, weight as u64)
                    .map_err(|e| tune_err("blkio device weight", e))?;
            }
            if let Some(iops) = dev.read_iops {
                blkio
                    .throttle_read_iops_for_device(major, minor, iops)
                    .map_err(|e| tune_err("blkio read iops", e))?;
            }
            if let Some(iops) = dev.write_iops {
                blkio
                    .throttle_write_iops_for_device(major, minor, iops)
                    .map_err(|e| tune_err("blkio write iops", e))?;
            }
            if let Some(bps) = dev.read_bps {
                blkio
                    .throttle_read_bps_for_device(major, minor, bps)
                    .map_err(|e| tune_err("blkio read bps", e))?;
            }
            if let Some(bps) = dev.write_bps {
                blkio
                    .throttle_write_bps_for_device(major, minor, bps)
                    .map_err(|e| tune_err("blkio write bps", e))?;
            }
        }
        Ok(())
    }

    /// Memory hard limit, soft limit and swap hard limit.
    pub fn setup_memory(&self, tune: &MemTune) -> Result<()> {
        let mem = match self.base.controller_of::<MemController>() {
            Some(c) => c,
            None => {
                if tune.hard_limit_kib.is_some()
                    || tune.soft_limit_kib.is_some()
                    || tune.swap_hard_limit_kib.is_some()
                {
                    return Err(VmmError::ConfigUnsupported(
                        "memory tuning requested but the memory controller is not mounted"
                            .to_string(),
                    ));
                }
                return Ok(());
            }
        };

        if let Some(limit) = tune.hard_limit_kib {
            mem.set_limit((limit * KIB) as i64)
                .map_err(|e| tune_err("memory hard limit", e))?;
        }
        if let Some(limit) = tune.soft_limit_kib {
            mem.set_soft_limit((limit * KIB) as i64)
                .map_err(|e| tune_err("memory soft limit", e))?;
        }
        if let Some(limit) = tune.swap_hard_limit_kib {
            mem.set_memswap_limit((limit * KIB) as i64)
                .map_err(|e| tune_err("swap hard limit", e))?;
        }
        Ok(())
    }

    /// CPU shares on the machine scope.
    pub fn setup_cpu_shares(&self, tune: &CpuTune) -> Result<()> {
        if let Some(shares) = tune.shares {
            let cpu = self
                .base
                .controller_of::<CpuController>()
                .ok_or_else(|| {
                    VmmError::ConfigUnsupported(
                        "cpu shares requested but the cpu controller is not mounted".to_string(),
                    )
                })?;
            cpu.set_shares(shares).map_err(|e| tune_err("cpu shares", e))?;
        }
        Ok(())
    }

    /// CFS bandwidth on one thread sub-group. If the quota write fails
    /// after the period was already changed, the prior period is restored.
    fn set_bandwidth(cpu: &CpuController, period: Option<u64>, quota: Option<i64>) -> Result<()> {
        let prior_period = if period.is_some() && quota.is_some() {
            cpu.cfs_period().ok()
        } else {
            None
        };

        if let Some(period) = period {
            cpu.set_cfs_period(period)
                .map_err(|e| tune_err("cfs period", e))?;
        }
        if let Some(quota) = quota {
            if let Err(e) = cpu.set_cfs_quota(quota) {
                if let Some(prior) = prior_period {
                    let _ = cpu.set_cfs_period(prior);
                }
                return Err(tune_err("cfs quota", e));
            }
        }
        Ok(())
    }

    pub fn setup_vcpu_bandwidth(
        &self,
        index: u32,
        period: Option<u64>,
        quota: Option<i64>,
    ) -> Result<()> {
        if period.is_none() && quota.is_none() {
            return Ok(());
        }
        let cg = self.subgroup(ThreadClass::Vcpu(index))?;
        let cpu = cg.controller_of::<CpuController>().ok_or_else(|| {
            VmmError::ConfigUnsupported(
                "cpu bandwidth requested but the cpu controller is not mounted".to_string(),
            )
        })?;
        Self::set_bandwidth(cpu, period, quota)
    }

    pub fn setup_iothread_bandwidth(
        &self,
        index: u32,
        period: Option<u64>,
        quota: Option<i64>,
    ) -> Result<()> {
        if period.is_none() && quota.is_none() {
            return Ok(());
        }
        let cg = self.subgroup(ThreadClass::IoThread(index))?;
        let cpu = cg.controller_of::<CpuController>().ok_or_else(|| {
            VmmError::ConfigUnsupported(
                "cpu bandwidth requested but the cpu controller is not mounted".to_string(),
            )
        })?;
        Self::set_bandwidth(cpu, period, quota)
    }

    pub fn setup_emulator_bandwidth(&self, period: Option<u64>, quota: Option<i64>) -> Result<()> {
        if period.is_none() && quota.is_none() {
            return Ok(());
        }
        let cg = self.subgroup(ThreadClass::Emulator)?;
        let cpu = cg.controller_of::<CpuController>().ok_or_else(|| {
            VmmError::ConfigUnsupported(
                "cpu bandwidth requested but the cpu controller is not mounted".to_string(),
            )
        })?;
        Self::set_bandwidth(cpu, period, quota)
    }

    /// Apply a memory nodeset to the emulator sub-group and every
    /// per-thread sub-group. Idempotent: re-applying the same nodeset is a
    /// no-op at the kernel level.
    pub fn setup_cpuset_mems(&self, nodeset: &str) -> Result<()> {
        let groups = {
            let map = self.subgroups.lock().unwrap();
            map.values().cloned().collect::<Vec<_>>()
        };
        for cg in std::iter::once(&self.base).chain(groups.iter().map(|g| g.as_ref())) {
            if let Some(cpuset) = cg.controller_of::<CpuSetController>() {
                cpuset
                    .set_mems(nodeset)
                    .map_err(|e| tune_err("cpuset mems", e))?;
            }
        }
        Ok(())
    }

    /// Pin one thread class to a host cpu list.
    pub fn setup_cpuset_cpus(&self, class_cpus: &[(u32, bool, String)], emulator: Option<&str>) -> Result<()> {
        for (index, is_vcpu, cpus) in class_cpus {
            let class = if *is_vcpu {
                ThreadClass::Vcpu(*index)
            } else {
                ThreadClass::IoThread(*index)
            };
            let cg = self.subgroup(class)?;
            if let Some(cpuset) = cg.controller_of::<CpuSetController>() {
                cpuset
                    .set_cpus(cpus)
                    .map_err(|e| tune_err("cpuset cpus", e))?;
            }
        }
        if let Some(cpus) = emulator {
            let cg = self.subgroup(ThreadClass::Emulator)?;
            if let Some(cpuset) = cg.controller_of::<CpuSetController>() {
                cpuset
                    .set_cpus(cpus)
                    .map_err(|e| tune_err("cpuset cpus", e))?;
            }
        }
        Ok(())
    }

    /// After a daemon restart, an emptied cpuset sub-tree may have lost its
    /// mems value; hand it the full host nodeset again.
    pub fn restore_cpuset_mems(&self, host_nodeset: &str) -> Result<()> {
        if let Some(cpuset) = self.base.controller_of::<CpuSetController>() {
            let current = cpuset.cpuset();
            if current.mems.is_empty() {
                info!(sl!(), "restoring cpuset.mems"; "nodeset" => host_nodeset);
                self.setup_cpuset_mems(host_nodeset)?;
            }
        }
        Ok(())
    }
}

fn block_device_number(path: &std::path::Path) -> Result<Option<(u64, u64)>> {
    let st = match nix::sys::stat::stat(path) {
        Ok(st) => st,
        Err(nix::errno::Errno::ENOENT) => return Ok(None),
        Err(e) => {
            return Err(VmmError::OperationFailed(format!(
                "stat {}: {}",
                path.display(),
                e
            )))
        }
    };
    let fmt = st.st_mode & nix::sys::stat::SFlag::S_IFMT.bits();
    if fmt != nix::sys::stat::SFlag::S_IFBLK.bits() {
        return Ok(None);
    }
    Ok(Some((
        nix::sys::stat::major(st.st_rdev),
        nix::sys::stat::minor(st.st_rdev),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_device_number_of_regular_file() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(block_device_number(f.path()).unwrap().is_none());
    }
}
