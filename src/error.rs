//! Error types for a single offload run.
//!
//! Every stage of the host orchestration returns
//! `Result<_, OffloadError>`.  Errors are fatal to the run: there is no
//! partial result and nothing is retried.  Each variant knows which
//! [`Stage`] produced it and which process exit code the binary uses for
//! it.

use std::fmt;

use thiserror::Error;

use crate::config::DeviceKind;

/// The orchestration step an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configure,
    Select,
    Build,
    Transfer,
    Dispatch,
    Retrieve,
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Configure => "configure",
            Stage::Select => "select device",
            Stage::Build => "build kernel",
            Stage::Transfer => "transfer inputs",
            Stage::Dispatch => "dispatch",
            Stage::Retrieve => "retrieve result",
            Stage::Verify => "verify",
        };
        f.write_str(name)
    }
}

/// Errors that can abort an offload.
#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("no {kind} device is available")]
    DeviceUnavailable { kind: DeviceKind },

    #[error("failed to create device on adapter {adapter}: {reason}")]
    DeviceRequest { adapter: String, reason: String },

    #[error("kernel compilation failed:\n{log}")]
    Compilation { log: String },

    #[error("invalid partition: {reason}")]
    InvalidPartition { reason: String },

    #[error("shape mismatch: A has {a_cols} columns but B has {b_rows} rows")]
    ShapeMismatch { a_cols: usize, b_rows: usize },

    #[error("buffer for {what} holds {actual} elements, expected {expected}")]
    BufferLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("allocation of {bytes} bytes for {what} failed: {reason}")]
    Allocation {
        what: &'static str,
        bytes: u64,
        reason: String,
    },

    #[error("dispatch failed: {reason}")]
    Dispatch { reason: String },

    #[error("readback failed: {reason}")]
    Readback { reason: String },

    #[error("{mismatches} cells differ from the host reference (max relative error {max_relative_error:e})")]
    Verification {
        mismatches: usize,
        max_relative_error: f32,
    },

    #[error("failed to read device choice: {0}")]
    Io(#[from] std::io::Error),
}

impl OffloadError {
    /// The stage this error aborted.
    pub fn stage(&self) -> Stage {
        match self {
            OffloadError::InvalidPartition { .. }
            | OffloadError::ShapeMismatch { .. }
            | OffloadError::BufferLength { .. }
            | OffloadError::Io(_) => Stage::Configure,
            OffloadError::DeviceUnavailable { .. } | OffloadError::DeviceRequest { .. } => {
                Stage::Select
            }
            OffloadError::Compilation { .. } => Stage::Build,
            OffloadError::Allocation { .. } => Stage::Transfer,
            OffloadError::Dispatch { .. } => Stage::Dispatch,
            OffloadError::Readback { .. } => Stage::Retrieve,
            OffloadError::Verification { .. } => Stage::Verify,
        }
    }

    /// Process exit code used by the `matmul-offload` binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            OffloadError::Io(_) => 1,
            OffloadError::InvalidPartition { .. }
            | OffloadError::ShapeMismatch { .. }
            | OffloadError::BufferLength { .. } => 2,
            OffloadError::DeviceUnavailable { .. } | OffloadError::DeviceRequest { .. } => 3,
            OffloadError::Compilation { .. } => 4,
            OffloadError::Allocation { .. } => 5,
            OffloadError::Dispatch { .. } | OffloadError::Readback { .. } => 6,
            OffloadError::Verification { .. } => 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stage_specific() {
        let unavailable = OffloadError::DeviceUnavailable {
            kind: DeviceKind::Gpu,
        };
        let compile = OffloadError::Compilation {
            log: "error: expected ';'".into(),
        };
        let partition = OffloadError::InvalidPartition {
            reason: "10 is not divisible by 4".into(),
        };
        let alloc = OffloadError::Allocation {
            what: "matrix A",
            bytes: 1 << 40,
            reason: "exceeds max_buffer_size".into(),
        };
        assert_eq!(unavailable.exit_code(), 3);
        assert_eq!(compile.exit_code(), 4);
        assert_eq!(partition.exit_code(), 2);
        assert_eq!(alloc.exit_code(), 5);
        assert_eq!(unavailable.stage(), Stage::Select);
        assert_eq!(compile.stage(), Stage::Build);
        assert_eq!(alloc.stage(), Stage::Transfer);
    }

    #[test]
    fn compilation_error_carries_the_log() {
        let err = OffloadError::Compilation {
            log: "1:5 unknown identifier `foo`".into(),
        };
        assert!(err.to_string().contains("unknown identifier `foo`"));
    }
}
