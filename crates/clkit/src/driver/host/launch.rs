//! What a host kernel implementation sees while it runs.

use std::collections::HashMap;
use std::rc::Rc;

use bytemuck::Pod;

use super::MemObject;
use crate::driver::{DriverError, DriverResult, Status};

/// A host kernel body. Registered by name on a [`HostDriver`](super::HostDriver)
/// and invoked once per enqueue with the whole N-D range.
pub type KernelFn = Rc<dyn Fn(&mut HostLaunch<'_>) -> DriverResult<()>>;

const OP: &str = "clEnqueueNDRangeKernel";

/// Argument as stored on a host kernel object.
#[derive(Debug, Clone)]
pub(super) enum BoundArg {
    Scalar(Vec<u8>),
    Mem(u64),
    Local(usize),
}

/// One kernel execution over the host memory objects.
pub struct HostLaunch<'a> {
    pub(super) args: &'a [BoundArg],
    pub(super) mems: &'a mut HashMap<u64, MemObject>,
    pub(super) offset: [usize; 3],
    pub(super) global: [usize; 3],
}

impl HostLaunch<'_> {
    /// Every global id in the range, first dimension fastest, offsets applied.
    pub fn global_ids(&self) -> impl Iterator<Item = [usize; 3]> {
        let [gx, gy, gz] = self.global;
        let [ox, oy, oz] = self.offset;
        (0..gz).flat_map(move |z| {
            (0..gy).flat_map(move |y| (0..gx).map(move |x| [x + ox, y + oy, z + oz]))
        })
    }

    fn arg(&self, index: u32) -> DriverResult<&BoundArg> {
        self.args
            .get(index as usize)
            .ok_or_else(|| DriverError::new(OP, Status::INVALID_ARG_INDEX))
    }

    fn mem_index(&self, index: u32) -> DriverResult<u64> {
        match self.arg(index)? {
            BoundArg::Mem(id) => Ok(*id),
            _ => Err(DriverError::new(OP, Status::INVALID_ARG_VALUE)),
        }
    }

    /// Scalar argument `index` reinterpreted as `T`.
    pub fn scalar<T: Pod>(&self, index: u32) -> DriverResult<T> {
        match self.arg(index)? {
            BoundArg::Scalar(bytes) => bytemuck::try_pod_read_unaligned(bytes)
                .map_err(|_| DriverError::new(OP, Status::INVALID_ARG_SIZE)),
            _ => Err(DriverError::new(OP, Status::INVALID_ARG_VALUE)),
        }
    }

    /// Size in bytes of the `__local` argument `index`.
    pub fn local_bytes(&self, index: u32) -> DriverResult<usize> {
        match self.arg(index)? {
            BoundArg::Local(size) => Ok(*size),
            _ => Err(DriverError::new(OP, Status::INVALID_ARG_VALUE)),
        }
    }

    fn buffer<T: Pod>(&self, index: u32) -> DriverResult<&[T]> {
        let id = self.mem_index(index)?;
        let mem = self
            .mems
            .get(&id)
            .ok_or_else(|| DriverError::new(OP, Status::INVALID_MEM_OBJECT))?;
        bytemuck::try_cast_slice(mem.bytes())
            .map_err(|_| DriverError::new(OP, Status::INVALID_ARG_SIZE))
    }

    /// Memory argument `index` viewed as a mutable slice of `T`.
    pub fn buffer_mut<T: Pod>(&mut self, index: u32) -> DriverResult<&mut [T]> {
        let id = self.mem_index(index)?;
        let mem = self
            .mems
            .get_mut(&id)
            .ok_or_else(|| DriverError::new(OP, Status::INVALID_MEM_OBJECT))?;
        bytemuck::try_cast_slice_mut(mem.bytes_mut())
            .map_err(|_| DriverError::new(OP, Status::INVALID_ARG_SIZE))
    }

    /// Copy of memory argument `index`, for kernels that read one buffer
    /// while writing another.
    pub fn read_buffer<T: Pod>(&self, index: u32) -> DriverResult<Vec<T>> {
        Ok(self.buffer::<T>(index)?.to_vec())
    }
}
