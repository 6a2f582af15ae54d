// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Mining the hypervisor's log file for a useful error message.
//!
//! When the monitor connection dies the OS error is rarely informative; the
//! real cause is usually the last thing the hypervisor printed before
//! exiting. Read the tail of the per-VM log and pick an error-looking
//! excerpt.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Upper bound on how much of the log tail is examined.
const LOG_TAIL_MAX: u64 = 4096;

/// Returns the most recent error-looking excerpt from the log file, if any.
pub fn read_log_error(path: &Path) -> Option<String> {
    let mut file = std::fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let start = len.saturating_sub(LOG_TAIL_MAX);
    file.seek(SeekFrom::Start(start)).ok()?;

    let mut buf = Vec::with_capacity(LOG_TAIL_MAX as usize);
    file.take(LOG_TAIL_MAX).read_to_end(&mut buf).ok()?;
    let text = String::from_utf8_lossy(&buf);

    // Prefer the last line mentioning an error; fall back to the last
    // non-empty line of the tail.
    let mut last_error = None;
    let mut last_line = None;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        last_line = Some(trimmed);
        let lower = trimmed.to_lowercase();
        if lower.contains("error") || lower.contains("failed") {
            last_error = Some(trimmed);
        }
    }
    last_error.or(last_line).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_picks_error_line() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "starting up").unwrap();
        writeln!(f, "qemu-system-x86_64: -drive bogus: Could not open: error no such file").unwrap();
        writeln!(f, "shutting down").unwrap();
        let found = read_log_error(f.path()).unwrap();
        assert!(found.contains("Could not open"));
    }

    #[test]
    fn test_falls_back_to_last_line() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "one").unwrap();
        writeln!(f, "two").unwrap();
        assert_eq!(read_log_error(f.path()).unwrap(), "two");
    }

    #[test]
    fn test_missing_file() {
        assert!(read_log_error(Path::new("/nonexistent/vm.log")).is_none());
    }
}
