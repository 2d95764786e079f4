//! Driver status codes and the error carried by every failing driver call.

use std::fmt;

use thiserror::Error;

/// Raw status code returned by a driver call.
///
/// Values follow the OpenCL numbering so the same code means the same thing
/// whichever [`Driver`](super::Driver) produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const DEVICE_NOT_FOUND: Status = Status(-1);
    pub const OUT_OF_RESOURCES: Status = Status(-5);
    pub const OUT_OF_HOST_MEMORY: Status = Status(-6);
    pub const PROFILING_INFO_NOT_AVAILABLE: Status = Status(-7);
    pub const MEM_COPY_OVERLAP: Status = Status(-8);
    pub const BUILD_PROGRAM_FAILURE: Status = Status(-11);
    pub const MAP_FAILURE: Status = Status(-12);
    pub const KERNEL_ARG_INFO_NOT_AVAILABLE: Status = Status(-19);
    pub const INVALID_VALUE: Status = Status(-30);
    pub const INVALID_DEVICE_TYPE: Status = Status(-31);
    pub const INVALID_PLATFORM: Status = Status(-32);
    pub const INVALID_DEVICE: Status = Status(-33);
    pub const INVALID_CONTEXT: Status = Status(-34);
    pub const INVALID_QUEUE_PROPERTIES: Status = Status(-35);
    pub const INVALID_COMMAND_QUEUE: Status = Status(-36);
    pub const INVALID_HOST_PTR: Status = Status(-37);
    pub const INVALID_MEM_OBJECT: Status = Status(-38);
    pub const INVALID_BUILD_OPTIONS: Status = Status(-43);
    pub const INVALID_PROGRAM: Status = Status(-44);
    pub const INVALID_PROGRAM_EXECUTABLE: Status = Status(-45);
    pub const INVALID_KERNEL_NAME: Status = Status(-46);
    pub const INVALID_KERNEL: Status = Status(-48);
    pub const INVALID_ARG_INDEX: Status = Status(-49);
    pub const INVALID_ARG_VALUE: Status = Status(-50);
    pub const INVALID_ARG_SIZE: Status = Status(-51);
    pub const INVALID_KERNEL_ARGS: Status = Status(-52);
    pub const INVALID_WORK_DIMENSION: Status = Status(-53);
    pub const INVALID_WORK_GROUP_SIZE: Status = Status(-54);
    pub const INVALID_GLOBAL_OFFSET: Status = Status(-56);
    pub const INVALID_EVENT_WAIT_LIST: Status = Status(-57);
    pub const INVALID_EVENT: Status = Status(-58);
    pub const INVALID_BUFFER_SIZE: Status = Status(-61);
    pub const INVALID_GLOBAL_WORK_SIZE: Status = Status(-63);

    /// Symbolic name of the code, if it is one we know.
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0 => "CL_SUCCESS",
            -1 => "CL_DEVICE_NOT_FOUND",
            -5 => "CL_OUT_OF_RESOURCES",
            -6 => "CL_OUT_OF_HOST_MEMORY",
            -7 => "CL_PROFILING_INFO_NOT_AVAILABLE",
            -8 => "CL_MEM_COPY_OVERLAP",
            -11 => "CL_BUILD_PROGRAM_FAILURE",
            -12 => "CL_MAP_FAILURE",
            -19 => "CL_KERNEL_ARG_INFO_NOT_AVAILABLE",
            -30 => "CL_INVALID_VALUE",
            -31 => "CL_INVALID_DEVICE_TYPE",
            -32 => "CL_INVALID_PLATFORM",
            -33 => "CL_INVALID_DEVICE",
            -34 => "CL_INVALID_CONTEXT",
            -35 => "CL_INVALID_QUEUE_PROPERTIES",
            -36 => "CL_INVALID_COMMAND_QUEUE",
            -37 => "CL_INVALID_HOST_PTR",
            -38 => "CL_INVALID_MEM_OBJECT",
            -43 => "CL_INVALID_BUILD_OPTIONS",
            -44 => "CL_INVALID_PROGRAM",
            -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
            -46 => "CL_INVALID_KERNEL_NAME",
            -48 => "CL_INVALID_KERNEL",
            -49 => "CL_INVALID_ARG_INDEX",
            -50 => "CL_INVALID_ARG_VALUE",
            -51 => "CL_INVALID_ARG_SIZE",
            -52 => "CL_INVALID_KERNEL_ARGS",
            -53 => "CL_INVALID_WORK_DIMENSION",
            -54 => "CL_INVALID_WORK_GROUP_SIZE",
            -56 => "CL_INVALID_GLOBAL_OFFSET",
            -57 => "CL_INVALID_EVENT_WAIT_LIST",
            -58 => "CL_INVALID_EVENT",
            -61 => "CL_INVALID_BUFFER_SIZE",
            -63 => "CL_INVALID_GLOBAL_WORK_SIZE",
            _ => return None,
        };
        Some(name)
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "unknown status ({})", self.0),
        }
    }
}

/// A driver call returned a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {status}")]
pub struct DriverError {
    /// Name of the driver operation that failed.
    pub operation: &'static str,
    /// Raw status reported by the driver.
    pub status: Status,
}

impl DriverError {
    pub fn new(operation: &'static str, status: Status) -> Self {
        Self { operation, status }
    }
}

/// Convenience result alias for driver calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Turn a raw status into a result, tagging failures with `operation`.
pub fn check_status(status: i32, operation: &'static str) -> DriverResult<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(DriverError::new(operation, Status(status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_render_symbolically() {
        assert_eq!(Status::INVALID_VALUE.to_string(), "CL_INVALID_VALUE (-30)");
        assert_eq!(
            Status::BUILD_PROGRAM_FAILURE.to_string(),
            "CL_BUILD_PROGRAM_FAILURE (-11)"
        );
    }

    #[test]
    fn unknown_code_keeps_raw_value() {
        assert_eq!(Status(-9999).to_string(), "unknown status (-9999)");
        assert!(Status(-9999).name().is_none());
    }

    #[test]
    fn check_status_tags_operation() {
        assert!(check_status(0, "clFinish").is_ok());
        let err = check_status(-36, "clFinish").unwrap_err();
        assert_eq!(err.operation, "clFinish");
        assert_eq!(err.status, Status::INVALID_COMMAND_QUEUE);
        assert_eq!(err.to_string(), "clFinish failed: CL_INVALID_COMMAND_QUEUE (-36)");
    }
}
