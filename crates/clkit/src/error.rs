//! Error type shared by the buffer, kernel, program and core layers.

use std::path::PathBuf;

use thiserror::Error;

use crate::driver::{DriverError, Status};

/// Errors produced above the driver layer.
#[derive(Debug, Error)]
pub enum ClkitError {
    /// A driver call failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("memory flags {flags:#x} contain host-pointer bits reserved for buffer bookkeeping")]
    ReservedMemFlags { flags: u64 },

    #[error("unsupported kernel argument type `{type_name}`")]
    UnsupportedArgType { type_name: String },

    #[error("length mismatch: expected {expected} elements, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("{operation} requires {required} placement")]
    PlacementRequired {
        operation: &'static str,
        required: &'static str,
    },

    #[error("buffer has no device allocation to bind")]
    MissingDeviceAllocation,

    #[error("invalid N-D range: {0}")]
    InvalidRange(String),

    #[error("compute core is not initialized")]
    NotInitialized,

    #[error("compute core is already initialized")]
    AlreadyInitialized,

    #[error("cannot tear down the compute core while {count} mapped view(s) are alive")]
    MappedViewsAlive { count: usize },

    #[error("no compute platforms found")]
    NoPlatforms,

    #[error("no GPU device found (requested index {index})")]
    NoDevice { index: usize },

    #[error("kernel argument {index}: device expects {expected}, got {actual}")]
    ArgTypeMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("program build failed with {status}:\n{log}")]
    Build { status: Status, log: String },

    #[error("failed to read program source {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ClkitError {
    /// Raw driver status, for errors that carry one.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Driver(err) => Some(err.status),
            Self::Build { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, ClkitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_keep_operation_and_status() {
        let err: ClkitError = DriverError::new("clEnqueueReadBuffer", Status::INVALID_VALUE).into();
        assert_eq!(err.status(), Some(Status::INVALID_VALUE));
        assert_eq!(
            err.to_string(),
            "clEnqueueReadBuffer failed: CL_INVALID_VALUE (-30)"
        );
    }

    #[test]
    fn mismatch_names_both_types() {
        let err = ClkitError::ArgTypeMismatch {
            index: 2,
            expected: "f32".into(),
            actual: "i32".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("argument 2"));
        assert!(msg.contains("f32") && msg.contains("i32"));
        assert_eq!(err.status(), None);
    }
}
