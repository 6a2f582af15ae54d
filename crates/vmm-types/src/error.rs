// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The error taxonomy surfaced by every public operation. Helpers deeper in
//! the stack use `anyhow` for cause chains; API boundaries classify into one
//! of these variants so callers can react to the kind of failure.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmmError {
    /// The domain is in the wrong state for the requested operation.
    #[error("operation invalid: {0}")]
    OperationInvalid(String),

    /// The operation was attempted and failed at runtime.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// A required hypervisor or host capability is missing.
    #[error("operation unsupported: {0}")]
    OperationUnsupported(String),

    /// The operation was cancelled on request of a client.
    #[error("operation aborted: {0}")]
    OperationAborted(String),

    /// A job slot or device wait exceeded its time budget.
    #[error("operation timed out: {0}")]
    OperationTimeout(String),

    /// The requested configuration cannot be realized on this host.
    #[error("unsupported configuration: {0}")]
    ConfigUnsupported(String),

    /// The caller passed a value this hypervisor version does not accept.
    #[error("argument unsupported: {0}")]
    ArgumentUnsupported(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    InternalError(String),

    /// The guest agent did not answer within its deadline.
    #[error("guest agent is not responding: {0}")]
    AgentUnresponsive(String),

    /// Migrating would risk data corruption on shared storage.
    #[error("migration is not safe: {0}")]
    MigrateUnsafe(String),

    /// A bandwidth or similar numeric bound does not fit the wire type.
    #[error("numeric overflow: {0}")]
    Overflow(String),

    /// A block copy job is still active on one of the disks.
    #[error("block copy still active: {0}")]
    BlockCopyActive(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VmmError {
    /// The stable identifier for the variant, used in logs and audits.
    pub fn code(&self) -> &'static str {
        match self {
            VmmError::OperationInvalid(_) => "operation-invalid",
            VmmError::OperationFailed(_) => "operation-failed",
            VmmError::OperationUnsupported(_) => "operation-unsupported",
            VmmError::OperationAborted(_) => "operation-aborted",
            VmmError::OperationTimeout(_) => "operation-timeout",
            VmmError::ConfigUnsupported(_) => "config-unsupported",
            VmmError::ArgumentUnsupported(_) => "argument-unsupported",
            VmmError::InternalError(_) => "internal-error",
            VmmError::AgentUnresponsive(_) => "agent-unresponsive",
            VmmError::MigrateUnsafe(_) => "migrate-unsafe",
            VmmError::Overflow(_) => "overflow",
            VmmError::BlockCopyActive(_) => "block-copy-active",
            VmmError::Other(_) => "internal-error",
        }
    }
}

pub type Result<T> = std::result::Result<T, VmmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let e = VmmError::OperationTimeout("cannot acquire state change lock".into());
        assert_eq!(e.code(), "operation-timeout");
        assert!(e.to_string().contains("state change lock"));

        let e: VmmError = anyhow::anyhow!("boom").into();
        assert_eq!(e.code(), "internal-error");
    }
}
