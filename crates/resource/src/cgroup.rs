// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Creation and layout of the per-VM control groups.
//!
//! Layout: `<partition>/<name><SCOPE_SUFFIX>` for the machine scope, with
//! sub-groups `vcpu<N>`, `iothread<N>` (1-indexed) and `emulator`. A thread
//! placed in a vcpu/iothread sub-group stays there until teardown; the
//! emulator sub-group exists whenever any per-thread sub-group exists.

use std::collections::HashMap;
use std::sync::Mutex;

use std::sync::Arc;

use cgroups_rs::{Cgroup, CgroupPid};
use vmm_types::{Result, VmmError};

pub const DEFAULT_PARTITION: &str = "/machine";
pub const SCOPE_SUFFIX: &str = ".libvirt-qemu";

/// Per-thread-class sub-group names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ThreadClass {
    Vcpu(u32),
    IoThread(u32),
    Emulator,
}

impl ThreadClass {
    fn dir_name(self) -> String {
        match self {
            ThreadClass::Vcpu(n) => format!("vcpu{}", n),
            ThreadClass::IoThread(n) => format!("iothread{}", n),
            ThreadClass::Emulator => "emulator".to_string(),
        }
    }
}

pub struct CgroupController {
    pub(crate) base: Cgroup,
    /// Hierarchy-relative path of the machine scope.
    pub(crate) path: String,
    pub(crate) subgroups: Mutex<HashMap<String, Arc<Cgroup>>>,
}

fn scope_path(partition: &str, vm_name: &str) -> Result<String> {
    if !partition.starts_with('/') {
        return Err(VmmError::ConfigUnsupported(format!(
            "cgroup partition {} must be an absolute path",
            partition
        )));
    }
    Ok(format!(
        "{}/{}{}",
        partition.trim_start_matches('/'),
        vm_name,
        SCOPE_SUFFIX
    ))
}

impl CgroupController {
    /// Create the machine scope under `partition` and move the hypervisor
    /// process into it.
    pub fn new_machine(partition: &str, vm_name: &str, pid: i32) -> Result<Self> {
        let path = scope_path(partition, vm_name)?;
        let base = Cgroup::new(cgroups_rs::hierarchies::auto(), path.as_str())
            .map_err(|e| VmmError::OperationFailed(format!("creating cgroup {}: {}", path, e)))?;
        base.add_task(CgroupPid::from(pid as u64)).map_err(|e| {
            VmmError::OperationFailed(format!("moving pid {} into cgroup {}: {}", pid, path, e))
        })?;
        info!(sl!(), "created machine cgroup"; "path" => &path, "pid" => pid);
        Ok(CgroupController {
            base,
            path,
            subgroups: Mutex::new(HashMap::new()),
        })
    }

    /// Reattach to an existing machine scope after a daemon restart. Does
    /// not create anything.
    pub fn attach_existing(partition: &str, vm_name: &str) -> Result<Self> {
        let path = scope_path(partition, vm_name)?;
        let base = Cgroup::load(cgroups_rs::hierarchies::auto(), path.as_str());
        Ok(CgroupController {
            base,
            path,
            subgroups: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn subgroup(&self, class: ThreadClass) -> Result<Arc<Cgroup>> {
        let dir = class.dir_name();
        let mut groups = self.subgroups.lock().unwrap();
        if let Some(cg) = groups.get(&dir) {
            return Ok(cg.clone());
        }
        let full = format!("{}/{}", self.path, dir);
        let cg = Arc::new(
            Cgroup::new(cgroups_rs::hierarchies::auto(), full.as_str()).map_err(|e| {
                VmmError::OperationFailed(format!("creating cgroup {}: {}", full, e))
            })?,
        );
        groups.insert(dir, cg.clone());
        Ok(cg)
    }

    /// Place one vcpu thread into its sub-group, creating it on demand.
    /// The emulator sub-group is materialized alongside the first
    /// per-thread group.
    pub fn place_vcpu(&self, index: u32, tid: i32) -> Result<()> {
        self.subgroup(ThreadClass::Emulator)?;
        let cg = self.subgroup(ThreadClass::Vcpu(index))?;
        cg.add_task(CgroupPid::from(tid as u64)).map_err(|e| {
            VmmError::OperationFailed(format!(
                "moving vcpu {} thread {} into cgroup: {}",
                index, tid, e
            ))
        })?;
        Ok(())
    }

    /// IO threads are 1-indexed in their sub-group names.
    pub fn place_iothread(&self, index: u32, tid: i32) -> Result<()> {
        self.subgroup(ThreadClass::Emulator)?;
        let cg = self.subgroup(ThreadClass::IoThread(index))?;
        cg.add_task(CgroupPid::from(tid as u64)).map_err(|e| {
            VmmError::OperationFailed(format!(
                "moving iothread {} thread {} into cgroup: {}",
                index, tid, e
            ))
        })?;
        Ok(())
    }

    /// Move the emulator (main) thread into the emulator sub-group.
    pub fn place_emulator(&self, pid: i32) -> Result<()> {
        let cg = self.subgroup(ThreadClass::Emulator)?;
        cg.add_task(CgroupPid::from(pid as u64)).map_err(|e| {
            VmmError::OperationFailed(format!("moving emulator pid {} into cgroup: {}", pid, e))
        })?;
        Ok(())
    }

    /// Place all vcpu threads. A single-threaded hypervisor reports either
    /// no vcpu tids or tids equal to the main pid; in that case per-vcpu
    /// groups cannot exist.
    pub fn place_vcpus(&self, vcpu_tids: &[i32], emulator_pid: i32) -> Result<()> {
        if vcpu_tids.is_empty() || vcpu_tids.iter().all(|&tid| tid == emulator_pid) {
            warn!(
                sl!(),
                "hypervisor is single-threaded, skipping per-vcpu cgroup placement"
            );
            return Ok(());
        }
        for (index, &tid) in vcpu_tids.iter().enumerate() {
            self.place_vcpu(index as u32, tid)?;
        }
        Ok(())
    }

    pub fn place_iothreads(&self, iothread_tids: &[i32]) -> Result<()> {
        for (index, &tid) in iothread_tids.iter().enumerate() {
            self.place_iothread(index as u32 + 1, tid)?;
        }
        Ok(())
    }

    /// Tear the whole scope down, sub-groups first.
    pub fn remove(&self) -> Result<()> {
        let groups: Vec<Arc<Cgroup>> = {
            let mut map = self.subgroups.lock().unwrap();
            map.drain().map(|(_, cg)| cg).collect()
        };
        for cg in groups {
            if let Err(e) = cg.delete() {
                warn!(sl!(), "failed to delete cgroup sub-group: {}", e);
            }
        }
        self.base
            .delete()
            .map_err(|e| VmmError::OperationFailed(format!("deleting cgroup {}: {}", self.path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_path_layout() {
        let path = scope_path("/machine", "vm1").unwrap();
        assert_eq!(path, "machine/vm1.libvirt-qemu");
    }

    #[test]
    fn test_partition_must_be_absolute() {
        let err = scope_path("machine", "vm1").unwrap_err();
        assert_eq!(err.code(), "config-unsupported");
    }

    #[test]
    fn test_thread_class_names() {
        assert_eq!(ThreadClass::Vcpu(0).dir_name(), "vcpu0");
        assert_eq!(ThreadClass::IoThread(1).dir_name(), "iothread1");
        assert_eq!(ThreadClass::Emulator.dir_name(), "emulator");
    }
}
