//! Host-side compute buffers and typed kernel binding over an OpenCL-style
//! driver.
//!
//! This crate provides:
//! - [`Core`]: one device, context and in-order queue, with ordered teardown
//!   and optional per-event timing
//! - [`ComputeBuffer`]: typed buffers with a host copy, a device copy, or
//!   both, explicit transfers between them and scoped mapped views
//! - [`ComputeProgram`] and [`Kernel`]: program builds with readable failure
//!   logs, and argument binding checked against the device-reported
//!   signature
//! - [`driver`]: the [`Driver`] seam, the in-process [`HostDriver`] and,
//!   with the `opencl` feature, `OpenClDriver`
//!
//! Everything here is single-threaded: handles are reference counted with
//! `Rc` and are neither `Send` nor `Sync`.

pub mod buffer;
pub mod config;
pub mod core;
pub mod driver;
pub mod element;
pub mod error;
pub mod event;
pub mod kernel;
pub mod program;

// Re-export primary public types.
pub use buffer::{Accessor, ComputeBuffer, PendingAccessor, Placement};
pub use config::{ConfigError, CoreConfig};
pub use crate::core::{Core, TimingReport};
#[cfg(feature = "opencl")]
pub use driver::OpenClDriver;
pub use driver::{
    Driver, DriverError, DriverStats, HostDriver, HostLaunch, MapFlags, MemFlags, Status,
};
pub use element::{DataType, Element, ScalarValue};
pub use error::{ClkitError, Result};
pub use event::Event;
pub use kernel::{ArgInfo, Kernel, KernelArg, NdRange, PREFERRED_LOCAL_1D};
pub use program::{ComputeProgram, ARG_INFO_OPTION};
