// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The append-only per-VM log file at `<log-dir>/<name>.log`.
//!
//! Always opened with O_APPEND so restrictive security contexts keep
//! working; truncation on fresh starts happens through an explicit
//! ftruncate instead of O_TRUNC.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use vmm_types::{Result, VmmError};

pub struct VmLogFile {
    path: PathBuf,
    file: File,
}

impl VmLogFile {
    pub fn log_path(log_dir: &Path, vm_name: &str) -> PathBuf {
        log_dir.join(format!("{}.log", vm_name))
    }

    /// Open (creating if needed) the VM's log. With `truncate` the existing
    /// content is dropped via ftruncate after the append-mode open.
    pub fn open(log_dir: &Path, vm_name: &str, truncate: bool) -> Result<VmLogFile> {
        std::fs::create_dir_all(log_dir)
            .map_err(|e| VmmError::OperationFailed(format!("creating log dir: {}", e)))?;
        let path = Self::log_path(log_dir, vm_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                VmmError::OperationFailed(format!("opening log {}: {}", path.display(), e))
            })?;
        if truncate {
            file.set_len(0).map_err(|e| {
                VmmError::OperationFailed(format!("truncating log {}: {}", path.display(), e))
            })?;
        }
        Ok(VmLogFile { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that the host tainted the guest in some way (custom monitor
    /// commands, unsafe migration overrides, host-modified images).
    pub fn append_taint(&mut self, vm_name: &str, reason: &str) {
        let line = format!("vmmd: domain {} tainted: {}\n", vm_name, reason);
        if let Err(e) = self.file.write_all(line.as_bytes()) {
            warn!(sl!(), "cannot append taint notice: {}", e);
        }
    }

    pub fn append_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.file, "{}", line) {
            warn!(sl!(), "cannot append to VM log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_on_create() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = VmLogFile::open(dir.path(), "vm1", false).unwrap();
            log.append_line("old content");
        }
        let log = VmLogFile::open(dir.path(), "vm1", true).unwrap();
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.is_empty());
    }

    #[test]
    fn test_taint_notice_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = VmLogFile::open(dir.path(), "vm1", false).unwrap();
        log.append_taint("vm1", "custom monitor command");
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("tainted: custom monitor command"));
    }
}
