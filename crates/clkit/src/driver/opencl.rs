//! [`Driver`] over the system OpenCL runtime, via `opencl3`.
//!
//! Platforms and devices are identified by their raw OpenCL handles. Every
//! other object lives in a registry keyed by a locally allocated id; removing
//! an entry drops the `opencl3` wrapper, which releases the OpenCL object.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::ptr;

use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_GPU};
use opencl3::error_codes::ClError;
use opencl3::event::Event as ClEvent;
use opencl3::kernel::Kernel as ClKernel;
use opencl3::memory::{Buffer, ClMem};
use opencl3::platform::{get_platforms, Platform};
use opencl3::program::Program;
use opencl3::types::{cl_device_id, cl_event, cl_mem, cl_platform_id, CL_BLOCKING, CL_NON_BLOCKING};
use tracing::debug;

use super::{
    AddressQualifier, ArgValue, ContextId, DeviceId, Driver, DriverError, DriverResult, EventId,
    KernelId, MapFlags, MemFlags, MemId, PlatformId, PlatformInfo, ProfilingInfo, ProgramId,
    QueueId, Status,
};
use crate::element::ScalarValue;

fn cl_err(operation: &'static str) -> impl Fn(ClError) -> DriverError {
    move |e| DriverError::new(operation, Status(e.0))
}

fn fail<T>(operation: &'static str, status: Status) -> DriverResult<T> {
    Err(DriverError::new(operation, status))
}

fn blocking_flag(blocking: bool) -> u32 {
    if blocking {
        CL_BLOCKING
    } else {
        CL_NON_BLOCKING
    }
}

fn raw_platform(id: PlatformId) -> cl_platform_id {
    id.0 as usize as cl_platform_id
}

fn raw_device(id: DeviceId) -> cl_device_id {
    id.0 as usize as cl_device_id
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    contexts: HashMap<u64, Context>,
    queues: HashMap<u64, CommandQueue>,
    mems: HashMap<u64, Buffer<u8>>,
    programs: HashMap<u64, Program>,
    kernels: HashMap<u64, ClKernel>,
    events: HashMap<u64, ClEvent>,
}

impl Registry {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn add_event(&mut self, event: ClEvent) -> EventId {
        let id = self.alloc_id();
        self.events.insert(id, event);
        EventId(id)
    }

    fn wait_list(&self, ids: &[EventId], op: &'static str) -> DriverResult<Vec<cl_event>> {
        ids.iter()
            .map(|id| {
                self.events
                    .get(&id.0)
                    .map(|e| e.get())
                    .ok_or(DriverError::new(op, Status::INVALID_EVENT_WAIT_LIST))
            })
            .collect()
    }

    fn queue(&self, id: QueueId, op: &'static str) -> DriverResult<&CommandQueue> {
        self.queues
            .get(&id.0)
            .ok_or(DriverError::new(op, Status::INVALID_COMMAND_QUEUE))
    }

    fn mem(&self, id: MemId, op: &'static str) -> DriverResult<&Buffer<u8>> {
        self.mems
            .get(&id.0)
            .ok_or(DriverError::new(op, Status::INVALID_MEM_OBJECT))
    }

    fn kernel(&self, id: KernelId, op: &'static str) -> DriverResult<&ClKernel> {
        self.kernels
            .get(&id.0)
            .ok_or(DriverError::new(op, Status::INVALID_KERNEL))
    }

    fn program(&self, id: ProgramId, op: &'static str) -> DriverResult<&Program> {
        self.programs
            .get(&id.0)
            .ok_or(DriverError::new(op, Status::INVALID_PROGRAM))
    }
}

/// Driver backed by the installed OpenCL ICD.
#[derive(Default)]
pub struct OpenClDriver {
    registry: RefCell<Registry>,
}

impl fmt::Debug for OpenClDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.registry.borrow();
        f.debug_struct("OpenClDriver")
            .field("buffers", &reg.mems.len())
            .field("kernels", &reg.kernels.len())
            .field("events", &reg.events.len())
            .finish_non_exhaustive()
    }
}

impl OpenClDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Driver for OpenClDriver {
    fn name(&self) -> &str {
        "opencl"
    }

    fn platforms(&self) -> DriverResult<Vec<PlatformInfo>> {
        let op = "clGetPlatformIDs";
        let platforms = get_platforms().map_err(cl_err(op))?;
        platforms
            .iter()
            .map(|p| {
                Ok(PlatformInfo {
                    id: PlatformId(p.id() as usize as u64),
                    name: p.name().map_err(cl_err("clGetPlatformInfo"))?,
                    version: p.version().map_err(cl_err("clGetPlatformInfo"))?,
                })
            })
            .collect()
    }

    fn gpu_devices(&self, platform: PlatformId) -> DriverResult<Vec<DeviceId>> {
        let devices = Platform::new(raw_platform(platform))
            .get_devices(CL_DEVICE_TYPE_GPU)
            .map_err(cl_err("clGetDeviceIDs"))?;
        Ok(devices
            .into_iter()
            .map(|d| DeviceId(d as usize as u64))
            .collect())
    }

    fn device_name(&self, device: DeviceId) -> DriverResult<String> {
        Device::new(raw_device(device))
            .name()
            .map_err(cl_err("clGetDeviceInfo"))
    }

    fn host_unified_memory(&self, device: DeviceId) -> DriverResult<bool> {
        Device::new(raw_device(device))
            .host_unified_memory()
            .map_err(cl_err("clGetDeviceInfo"))
    }

    fn create_context(&self, device: DeviceId) -> DriverResult<ContextId> {
        let context = Context::from_device(&Device::new(raw_device(device)))
            .map_err(cl_err("clCreateContext"))?;
        let mut reg = self.registry.borrow_mut();
        let id = reg.alloc_id();
        reg.contexts.insert(id, context);
        Ok(ContextId(id))
    }

    fn create_queue(
        &self,
        context: ContextId,
        device: DeviceId,
        profiling: bool,
    ) -> DriverResult<QueueId> {
        let op = "clCreateCommandQueueWithProperties";
        let mut reg = self.registry.borrow_mut();
        let ctx = reg
            .contexts
            .get(&context.0)
            .ok_or(DriverError::new(op, Status::INVALID_CONTEXT))?;
        if ctx.default_device() != raw_device(device) {
            return fail(op, Status::INVALID_DEVICE);
        }
        let props = if profiling { CL_QUEUE_PROFILING_ENABLE } else { 0 };
        let queue = CommandQueue::create_default_with_properties(ctx, props, 0)
            .map_err(cl_err(op))?;
        let id = reg.alloc_id();
        reg.queues.insert(id, queue);
        Ok(QueueId(id))
    }

    fn create_buffer(
        &self,
        context: ContextId,
        flags: MemFlags,
        size: usize,
        init: Option<&[u8]>,
    ) -> DriverResult<MemId> {
        let op = "clCreateBuffer";
        let mut reg = self.registry.borrow_mut();
        let ctx = reg
            .contexts
            .get(&context.0)
            .ok_or(DriverError::new(op, Status::INVALID_CONTEXT))?;
        if init.is_some_and(|bytes| bytes.len() < size) {
            return fail(op, Status::INVALID_HOST_PTR);
        }
        let host_ptr = init.map_or(ptr::null_mut(), |bytes| bytes.as_ptr() as *mut c_void);
        // SAFETY: `host_ptr` is null or points at `size` readable bytes that
        // outlive the call; with COPY_HOST_PTR the runtime copies them here.
        let buffer = unsafe { Buffer::<u8>::create(ctx, flags.bits(), size, host_ptr) }
            .map_err(cl_err(op))?;
        let id = reg.alloc_id();
        reg.mems.insert(id, buffer);
        Ok(MemId(id))
    }

    fn enqueue_read(
        &self,
        queue: QueueId,
        mem: MemId,
        blocking: bool,
        offset: usize,
        dst: &mut [u8],
        wait_list: &[EventId],
    ) -> DriverResult<EventId> {
        let op = "clEnqueueReadBuffer";
        let mut reg = self.registry.borrow_mut();
        let wait = reg.wait_list(wait_list, op)?;
        let q = reg.queue(queue, op)?;
        let buf = reg.mem(mem, op)?;
        // SAFETY: `dst` stays borrowed for the call; callers only pass
        // `blocking = false` for memory they keep alive until the event ends.
        let event = unsafe { q.enqueue_read_buffer(buf, blocking_flag(blocking), offset, dst, &wait) }
            .map_err(cl_err(op))?;
        Ok(reg.add_event(event))
    }

    fn enqueue_write(
        &self,
        queue: QueueId,
        mem: MemId,
        blocking: bool,
        offset: usize,
        src: &[u8],
        wait_list: &[EventId],
    ) -> DriverResult<EventId> {
        let op = "clEnqueueWriteBuffer";
        let mut reg = self.registry.borrow_mut();
        let wait = reg.wait_list(wait_list, op)?;
        let mut buf = reg
            .mems
            .remove(&mem.0)
            .ok_or(DriverError::new(op, Status::INVALID_MEM_OBJECT))?;
        let result = match reg.queue(queue, op) {
            // SAFETY: as for reads, `src` outlives a blocking write.
            Ok(q) => unsafe {
                q.enqueue_write_buffer(&mut buf, blocking_flag(blocking), offset, src, &wait)
            }
            .map_err(cl_err(op)),
            Err(e) => Err(e),
        };
        reg.mems.insert(mem.0, buf);
        Ok(reg.add_event(result?))
    }

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
    ) -> DriverResult<EventId> {
        let op = "clEnqueueCopyBuffer";
        if src == dst {
            // opencl3 cannot borrow one buffer as both source and destination.
            let overlap = src_offset < dst_offset + size && dst_offset < src_offset + size;
            let status = if overlap {
                Status::MEM_COPY_OVERLAP
            } else {
                Status::INVALID_VALUE
            };
            return fail(op, status);
        }
        let mut reg = self.registry.borrow_mut();
        let wait = reg.wait_list(wait_list, op)?;
        let mut dst_buf = reg
            .mems
            .remove(&dst.0)
            .ok_or(DriverError::new(op, Status::INVALID_MEM_OBJECT))?;
        let result = (|| {
            let q = reg.queue(queue, op)?;
            let src_buf = reg.mem(src, op)?;
            // SAFETY: both buffers are live registry entries.
            unsafe {
                q.enqueue_copy_buffer(src_buf, &mut dst_buf, src_offset, dst_offset, size, &wait)
            }
            .map_err(cl_err(op))
        })();
        reg.mems.insert(dst.0, dst_buf);
        Ok(reg.add_event(result?))
    }

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
    ) -> DriverResult<(*mut u8, EventId)> {
        let op = "clEnqueueMapBuffer";
        let mut reg = self.registry.borrow_mut();
        let wait = reg.wait_list(wait_list, op)?;
        let mut buf = reg
            .mems
            .remove(&mem.0)
            .ok_or(DriverError::new(op, Status::INVALID_MEM_OBJECT))?;
        let mut mapped: cl_mem = ptr::null_mut();
        let result = match reg.queue(queue, op) {
            // SAFETY: the runtime writes the mapped address into `mapped`.
            Ok(q) => unsafe {
                q.enqueue_map_buffer(
                    &mut buf,
                    blocking_flag(blocking),
                    flags.bits(),
                    offset,
                    size,
                    &mut mapped,
                    &wait,
                )
            }
            .map_err(cl_err(op)),
            Err(e) => Err(e),
        };
        reg.mems.insert(mem.0, buf);
        let event = reg.add_event(result?);
        Ok((mapped.cast::<u8>(), event))
    }

    fn enqueue_unmap(
        &self,
        queue: QueueId,
        mem: MemId,
        mapped: *mut u8,
        wait_list: &[EventId],
    ) -> DriverResult<EventId> {
        let op = "clEnqueueUnmapMemObject";
        let mut reg = self.registry.borrow_mut();
        let wait = reg.wait_list(wait_list, op)?;
        let q = reg.queue(queue, op)?;
        let buf = reg.mem(mem, op)?;
        // SAFETY: the runtime validates `mapped` against its own mappings.
        let event = unsafe { q.enqueue_unmap_mem_object(buf.get(), mapped.cast::<c_void>(), &wait) }
            .map_err(cl_err(op))?;
        Ok(reg.add_event(event))
    }

    fn create_program(&self, context: ContextId, source: &str) -> DriverResult<ProgramId> {
        let op = "clCreateProgramWithSource";
        let mut reg = self.registry.borrow_mut();
        let ctx = reg
            .contexts
            .get(&context.0)
            .ok_or(DriverError::new(op, Status::INVALID_CONTEXT))?;
        let program = Program::create_from_source(ctx, source).map_err(cl_err(op))?;
        let id = reg.alloc_id();
        reg.programs.insert(id, program);
        Ok(ProgramId(id))
    }

    fn build_program(
        &self,
        program: ProgramId,
        device: DeviceId,
        options: &str,
    ) -> DriverResult<()> {
        let op = "clBuildProgram";
        let mut reg = self.registry.borrow_mut();
        let prog = reg
            .programs
            .get_mut(&program.0)
            .ok_or(DriverError::new(op, Status::INVALID_PROGRAM))?;
        debug!("building OpenCL program with options '{options}'");
        prog.build(&[raw_device(device)], options).map_err(cl_err(op))
    }

    fn build_log(&self, program: ProgramId, device: DeviceId) -> DriverResult<String> {
        let op = "clGetProgramBuildInfo";
        let reg = self.registry.borrow();
        reg.program(program, op)?
            .get_build_log(raw_device(device))
            .map_err(cl_err(op))
    }

    fn program_binaries(&self, program: ProgramId) -> DriverResult<Vec<Vec<u8>>> {
        let op = "clGetProgramInfo";
        let reg = self.registry.borrow();
        reg.program(program, op)?.get_binaries().map_err(cl_err(op))
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> DriverResult<KernelId> {
        let op = "clCreateKernel";
        let mut reg = self.registry.borrow_mut();
        let kernel = ClKernel::create(reg.program(program, op)?, name).map_err(cl_err(op))?;
        let id = reg.alloc_id();
        reg.kernels.insert(id, kernel);
        Ok(KernelId(id))
    }

    fn kernel_arg_type_name(&self, kernel: KernelId, index: u32) -> DriverResult<String> {
        let op = "clGetKernelArgInfo";
        let reg = self.registry.borrow();
        reg.kernel(kernel, op)?
            .get_arg_type_name(index)
            .map_err(cl_err(op))
    }

    fn kernel_arg_address_qualifier(
        &self,
        kernel: KernelId,
        index: u32,
    ) -> DriverResult<AddressQualifier> {
        let op = "clGetKernelArgInfo";
        let reg = self.registry.borrow();
        let raw = reg
            .kernel(kernel, op)?
            .get_arg_address_qualifier(index)
            .map_err(cl_err(op))?;
        AddressQualifier::from_raw(raw).ok_or(DriverError::new(op, Status::INVALID_VALUE))
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, value: ArgValue) -> DriverResult<()> {
        let op = "clSetKernelArg";
        let reg = self.registry.borrow();
        let k = reg.kernel(kernel, op)?;
        // SAFETY: every payload is a plain value of the size the runtime
        // reads; memory arguments are live registry handles.
        let result = unsafe {
            match value {
                ArgValue::Scalar(ScalarValue::F32(v)) => k.set_arg(index, &v),
                ArgValue::Scalar(ScalarValue::F64(v)) => k.set_arg(index, &v),
                ArgValue::Scalar(ScalarValue::I32(v)) => k.set_arg(index, &v),
                ArgValue::Scalar(ScalarValue::U32(v)) => k.set_arg(index, &v),
                ArgValue::Scalar(ScalarValue::U8(v)) => k.set_arg(index, &v),
                ArgValue::Scalar(ScalarValue::I64(v)) => k.set_arg(index, &v),
                ArgValue::Mem(mem) => k.set_arg(index, &reg.mem(mem, op)?.get()),
                ArgValue::Local(size) => k.set_arg_local_buffer(index, size),
            }
        };
        result.map_err(cl_err(op))
    }

    fn enqueue_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        offset: &[usize],
        global: &[usize],
        local: &[usize],
        wait_list: &[EventId],
    ) -> DriverResult<EventId> {
        let op = "clEnqueueNDRangeKernel";
        let dim = global.len();
        if !(1..=3).contains(&dim) {
            return fail(op, Status::INVALID_WORK_DIMENSION);
        }
        if !offset.is_empty() && offset.len() != dim {
            return fail(op, Status::INVALID_GLOBAL_OFFSET);
        }
        if !local.is_empty() && local.len() != dim {
            return fail(op, Status::INVALID_WORK_GROUP_SIZE);
        }
        let as_ptr = |s: &[usize]| if s.is_empty() { ptr::null() } else { s.as_ptr() };

        let mut reg = self.registry.borrow_mut();
        let wait = reg.wait_list(wait_list, op)?;
        let q = reg.queue(queue, op)?;
        let k = reg.kernel(kernel, op)?;
        // SAFETY: every non-null range pointer covers exactly `dim` entries,
        // checked above.
        let event = unsafe {
            q.enqueue_nd_range_kernel(
                k.get(),
                dim as u32,
                as_ptr(offset),
                global.as_ptr(),
                as_ptr(local),
                &wait,
            )
        }
        .map_err(cl_err(op))?;
        Ok(reg.add_event(event))
    }

    fn wait_for_events(&self, events: &[EventId]) -> DriverResult<()> {
        let op = "clWaitForEvents";
        if events.is_empty() {
            return fail(op, Status::INVALID_VALUE);
        }
        let reg = self.registry.borrow();
        for id in events {
            reg.events
                .get(&id.0)
                .ok_or(DriverError::new(op, Status::INVALID_EVENT))?
                .wait()
                .map_err(cl_err(op))?;
        }
        Ok(())
    }

    fn event_profiling(&self, event: EventId, info: ProfilingInfo) -> DriverResult<u64> {
        let op = "clGetEventProfilingInfo";
        let reg = self.registry.borrow();
        let ev = reg
            .events
            .get(&event.0)
            .ok_or(DriverError::new(op, Status::INVALID_EVENT))?;
        match info {
            ProfilingInfo::Queued => ev.profiling_command_queued(),
            ProfilingInfo::Start => ev.profiling_command_start(),
            ProfilingInfo::End => ev.profiling_command_end(),
        }
        .map_err(cl_err(op))
    }

    fn finish(&self, queue: QueueId) -> DriverResult<()> {
        let op = "clFinish";
        let reg = self.registry.borrow();
        reg.queue(queue, op)?.finish().map_err(cl_err(op))
    }

    fn release_device(&self, _device: DeviceId) -> DriverResult<()> {
        // Root devices from clGetDeviceIDs are not reference counted.
        Ok(())
    }

    fn release_context(&self, context: ContextId) -> DriverResult<()> {
        match self.registry.borrow_mut().contexts.remove(&context.0) {
            Some(_) => Ok(()),
            None => fail("clReleaseContext", Status::INVALID_CONTEXT),
        }
    }

    fn release_queue(&self, queue: QueueId) -> DriverResult<()> {
        match self.registry.borrow_mut().queues.remove(&queue.0) {
            Some(_) => Ok(()),
            None => fail("clReleaseCommandQueue", Status::INVALID_COMMAND_QUEUE),
        }
    }

    fn release_mem(&self, mem: MemId) -> DriverResult<()> {
        match self.registry.borrow_mut().mems.remove(&mem.0) {
            Some(_) => Ok(()),
            None => fail("clReleaseMemObject", Status::INVALID_MEM_OBJECT),
        }
    }

    fn release_program(&self, program: ProgramId) -> DriverResult<()> {
        match self.registry.borrow_mut().programs.remove(&program.0) {
            Some(_) => Ok(()),
            None => fail("clReleaseProgram", Status::INVALID_PROGRAM),
        }
    }

    fn release_kernel(&self, kernel: KernelId) -> DriverResult<()> {
        match self.registry.borrow_mut().kernels.remove(&kernel.0) {
            Some(_) => Ok(()),
            None => fail("clReleaseKernel", Status::INVALID_KERNEL),
        }
    }

    fn release_event(&self, event: EventId) -> DriverResult<()> {
        match self.registry.borrow_mut().events.remove(&event.0) {
            Some(_) => Ok(()),
            None => fail("clReleaseEvent", Status::INVALID_EVENT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires OpenCL runtime"]
    fn enumerates_platforms() {
        let driver = OpenClDriver::new();
        let platforms = driver.platforms().unwrap();
        assert!(!platforms.is_empty());
        for p in &platforms {
            assert!(!p.name.is_empty());
        }
    }

    #[test]
    #[ignore = "requires OpenCL runtime"]
    fn write_read_round_trip_on_first_gpu() {
        let driver = OpenClDriver::new();
        let platform = driver.platforms().unwrap()[0].id;
        let device = driver.gpu_devices(platform).unwrap()[0];
        let ctx = driver.create_context(device).unwrap();
        let queue = driver.create_queue(ctx, device, true).unwrap();
        let mem = driver.create_buffer(ctx, MemFlags::READ_WRITE, 4, None).unwrap();
        driver.enqueue_write(queue, mem, true, 0, &[1, 2, 3, 4], &[]).unwrap();
        let mut out = [0u8; 4];
        driver.enqueue_read(queue, mem, true, 0, &mut out, &[]).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        driver.release_mem(mem).unwrap();
        driver.release_queue(queue).unwrap();
        driver.release_context(ctx).unwrap();
    }
}
