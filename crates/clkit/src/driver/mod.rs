//! The driver binding consumed by the core.
//!
//! [`Driver`] is the seam between the buffer/kernel layer and whatever
//! actually talks to the hardware. Every handle it hands out is an opaque id;
//! the core never looks inside one, it only passes ids back and releases
//! them. Two implementations ship with the crate:
//!
//! - [`HostDriver`]: an in-order queue emulated over host memory, with kernels
//!   implemented as registered Rust closures. Always available.
//! - `OpenClDriver` (feature `opencl`): the system OpenCL runtime through
//!   `opencl3`.

pub mod host;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod status;

use std::fmt;
use std::ops::BitOr;

use crate::element::ScalarValue;

pub use host::{DriverStats, HostDriver, HostDriverBuilder, HostLaunch, KernelFn};
#[cfg(feature = "opencl")]
pub use opencl::OpenClDriver;
pub use status::{check_status, DriverError, DriverResult, Status};

macro_rules! handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}#{}", stringify!($name), self.0)
                }
            }
        )*
    };
}

handle! {
    /// Opaque platform handle.
    PlatformId,
    /// Opaque device handle.
    DeviceId,
    /// Opaque context handle.
    ContextId,
    /// Opaque command-queue handle.
    QueueId,
    /// Opaque memory-object handle.
    MemId,
    /// Opaque program handle.
    ProgramId,
    /// Opaque kernel handle.
    KernelId,
    /// Opaque event handle.
    EventId,
}

/// Memory-object allocation flags (OpenCL `cl_mem_flags` bit values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemFlags(u64);

impl MemFlags {
    pub const READ_WRITE: MemFlags = MemFlags(1 << 0);
    pub const WRITE_ONLY: MemFlags = MemFlags(1 << 1);
    pub const READ_ONLY: MemFlags = MemFlags(1 << 2);
    pub const USE_HOST_PTR: MemFlags = MemFlags(1 << 3);
    pub const ALLOC_HOST_PTR: MemFlags = MemFlags(1 << 4);
    pub const COPY_HOST_PTR: MemFlags = MemFlags(1 << 5);

    /// Flags that describe where the host pointer comes from.
    pub const HOST_PTR_MASK: MemFlags =
        MemFlags(Self::USE_HOST_PTR.0 | Self::ALLOC_HOST_PTR.0 | Self::COPY_HOST_PTR.0);

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: MemFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: MemFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn without(self, other: MemFlags) -> Self {
        Self(self.0 & !other.0)
    }
}

impl Default for MemFlags {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

impl BitOr for MemFlags {
    type Output = MemFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        MemFlags(self.0 | rhs.0)
    }
}

/// Buffer mapping flags (OpenCL `cl_map_flags` bit values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapFlags(u64);

impl MapFlags {
    pub const READ: MapFlags = MapFlags(1 << 0);
    pub const WRITE: MapFlags = MapFlags(1 << 1);
    pub const WRITE_INVALIDATE_REGION: MapFlags = MapFlags(1 << 2);
    pub const READ_WRITE: MapFlags = MapFlags((1 << 0) | (1 << 1));

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: MapFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MapFlags {
    type Output = MapFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        MapFlags(self.0 | rhs.0)
    }
}

/// Address space of a kernel parameter, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressQualifier {
    Global,
    Local,
    Constant,
    Private,
}

impl AddressQualifier {
    /// Decode an OpenCL `cl_kernel_arg_address_qualifier` value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x119B => Some(Self::Global),
            0x119C => Some(Self::Local),
            0x119D => Some(Self::Constant),
            0x119E => Some(Self::Private),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::Global => 0x119B,
            Self::Local => 0x119C,
            Self::Constant => 0x119D,
            Self::Private => 0x119E,
        }
    }
}

impl fmt::Display for AddressQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "__global"),
            Self::Local => write!(f, "__local"),
            Self::Constant => write!(f, "__constant"),
            Self::Private => write!(f, "__private"),
        }
    }
}

/// Value bound to a kernel argument slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgValue {
    /// A by-value scalar.
    Scalar(ScalarValue),
    /// A memory object.
    Mem(MemId),
    /// Local memory of the given size in bytes, no payload.
    Local(usize),
}

/// Event timestamps available when the queue has profiling enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilingInfo {
    Queued,
    Start,
    End,
}

/// Identifying strings of a platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub id: PlatformId,
    pub name: String,
    pub version: String,
}

/// The driver surface the core is written against.
///
/// Every method maps onto one driver primitive and reports failure as a
/// [`DriverError`] naming the primitive and its raw status. Implementations
/// must honor in-order execution on a queue.
///
/// A pointer returned by [`Driver::enqueue_map`] may only be dereferenced
/// between completion of the map and the matching [`Driver::enqueue_unmap`].
/// Drivers reject unmap pointers they did not hand out.
pub trait Driver: fmt::Debug {
    /// Short backend name for diagnostics.
    fn name(&self) -> &str;

    fn platforms(&self) -> DriverResult<Vec<PlatformInfo>>;

    fn gpu_devices(&self, platform: PlatformId) -> DriverResult<Vec<DeviceId>>;

    fn device_name(&self, device: DeviceId) -> DriverResult<String>;

    /// Whether host and device share one physical memory.
    fn host_unified_memory(&self, device: DeviceId) -> DriverResult<bool>;

    fn create_context(&self, device: DeviceId) -> DriverResult<ContextId>;

    /// Create an in-order queue on `device`.
    fn create_queue(
        &self,
        context: ContextId,
        device: DeviceId,
        profiling: bool,
    ) -> DriverResult<QueueId>;

    /// Allocate `size` bytes, copying `init` into the allocation when given.
    fn create_buffer(
        &self,
        context: ContextId,
        flags: MemFlags,
        size: usize,
        init: Option<&[u8]>,
    ) -> DriverResult<MemId>;

    fn enqueue_read(
        &self,
        queue: QueueId,
        mem: MemId,
        blocking: bool,
        offset: usize,
        dst: &mut [u8],
        wait_list: &[EventId],
    ) -> DriverResult<EventId>;

    fn enqueue_write(
        &self,
        queue: QueueId,
        mem: MemId,
        blocking: bool,
        offset: usize,
        src: &[u8],
        wait_list: &[EventId],
    ) -> DriverResult<EventId>;

    #[allow(clippy::too_many_arguments)]
    fn enqueue_copy(
        &self,
        queue: QueueId,
        src: MemId,
        dst: MemId,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        wait_list: &[EventId],
    ) -> DriverResult<EventId>;

    /// Map `size` bytes at `offset` into host address space.
    ///
    /// For a non-blocking map the pointer is only valid once the returned
    /// event has completed.
    #[allow(clippy::too_many_arguments)]
    fn enqueue_map(
        &self,
        queue: QueueId,
        mem: MemId,
        blocking: bool,
        flags: MapFlags,
        offset: usize,
        size: usize,
        wait_list: &[EventId],
    ) -> DriverResult<(*mut u8, EventId)>;

    fn enqueue_unmap(
        &self,
        queue: QueueId,
        mem: MemId,
        mapped: *mut u8,
        wait_list: &[EventId],
    ) -> DriverResult<EventId>;

    fn create_program(&self, context: ContextId, source: &str) -> DriverResult<ProgramId>;

    fn build_program(
        &self,
        program: ProgramId,
        device: DeviceId,
        options: &str,
    ) -> DriverResult<()>;

    fn build_log(&self, program: ProgramId, device: DeviceId) -> DriverResult<String>;

    fn program_binaries(&self, program: ProgramId) -> DriverResult<Vec<Vec<u8>>>;

    fn create_kernel(&self, program: ProgramId, name: &str) -> DriverResult<KernelId>;

    fn kernel_arg_type_name(&self, kernel: KernelId, index: u32) -> DriverResult<String>;

    fn kernel_arg_address_qualifier(
        &self,
        kernel: KernelId,
        index: u32,
    ) -> DriverResult<AddressQualifier>;

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, value: ArgValue) -> DriverResult<()>;

    /// Enqueue `kernel` over an N-D range. Empty `offset`/`local` mean
    /// "unspecified"; `global.len()` is the work dimension.
    fn enqueue_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        offset: &[usize],
        global: &[usize],
        local: &[usize],
        wait_list: &[EventId],
    ) -> DriverResult<EventId>;

    fn wait_for_events(&self, events: &[EventId]) -> DriverResult<()>;

    /// Device timestamp in nanoseconds.
    fn event_profiling(&self, event: EventId, info: ProfilingInfo) -> DriverResult<u64>;

    fn finish(&self, queue: QueueId) -> DriverResult<()>;

    fn release_device(&self, device: DeviceId) -> DriverResult<()>;

    fn release_context(&self, context: ContextId) -> DriverResult<()>;

    fn release_queue(&self, queue: QueueId) -> DriverResult<()>;

    fn release_mem(&self, mem: MemId) -> DriverResult<()>;

    fn release_program(&self, program: ProgramId) -> DriverResult<()>;

    fn release_kernel(&self, kernel: KernelId) -> DriverResult<()>;

    fn release_event(&self, event: EventId) -> DriverResult<()>;
}
