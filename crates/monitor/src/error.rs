// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;
use vmm_types::VmmError;

/// Channel-level and command-level monitor failures.
///
/// The variants are cheap to clone: a fatal channel fault becomes the sticky
/// error returned verbatim by every later send.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// The channel failed or was closed; carries the best available
    /// explanation (hypervisor log excerpt or the OS error).
    #[error("monitor channel closed: {0}")]
    Closed(String),

    #[error("monitor I/O error: {0}")]
    Io(String),

    #[error("monitor protocol violation: {0}")]
    Protocol(String),

    /// The hypervisor rejected a command. Not sticky.
    #[error("{desc}")]
    Qmp { class: String, desc: String },

    #[error("{0}")]
    Unsupported(String),

    #[error("failed to connect to monitor: {0}")]
    Connect(String),
}

impl MonitorError {
    /// Whether this error poisons the channel for all later senders.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MonitorError::Closed(_)
                | MonitorError::Io(_)
                | MonitorError::Protocol(_)
                | MonitorError::Connect(_)
        )
    }

    /// The hypervisor did not recognize the command.
    pub fn is_command_not_found(&self) -> bool {
        matches!(self, MonitorError::Qmp { class, .. } if class == "CommandNotFound")
    }
}

impl From<MonitorError> for VmmError {
    fn from(e: MonitorError) -> Self {
        match &e {
            MonitorError::Unsupported(msg) => VmmError::OperationUnsupported(msg.clone()),
            MonitorError::Qmp { .. } if e.is_command_not_found() => {
                VmmError::OperationUnsupported(e.to_string())
            }
            _ => VmmError::OperationFailed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(MonitorError::Closed("gone".into()).is_fatal());
        assert!(!MonitorError::Qmp {
            class: "GenericError".into(),
            desc: "nope".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_command_not_found_maps_to_unsupported() {
        let e = MonitorError::Qmp {
            class: "CommandNotFound".into(),
            desc: "The command drive-mirror has not been found".into(),
        };
        assert_eq!(VmmError::from(e).code(), "operation-unsupported");
    }
}
