//! In-process reference driver.
//!
//! [`HostDriver`] emulates one in-order command queue per device over plain
//! host memory. Commands execute synchronously at enqueue time, so every
//! returned event is already complete. Programs are "built" by reading their
//! kernel signatures; the kernel bodies are Rust closures registered with
//! [`HostDriver::register_kernel`] under the kernel's name.
//!
//! Failures report the same status codes an OpenCL runtime would, which makes
//! this driver the backbone of the crate's tests.

mod launch;
mod signature;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, trace};

pub use launch::{HostLaunch, KernelFn};
pub use signature::{parse_kernels, KernelDecl, ParamDecl, SignatureError};

use self::launch::BoundArg;
use super::{
    AddressQualifier, ArgValue, ContextId, DeviceId, Driver, DriverError, DriverResult, EventId,
    KernelId, MapFlags, MemFlags, MemId, PlatformId, PlatformInfo, ProfilingInfo, ProgramId,
    QueueId, Status,
};

const DEFAULT_PLATFORM: &str = "clkit host";
const PLATFORM_VERSION: &str = "OpenCL 1.2 clkit-host";
const DEFAULT_MAX_WORK_GROUP_SIZE: usize = 1024;
const DEVICE_ID_BASE: u64 = 0x100;
const ARG_INFO_OPTION: &str = "-cl-kernel-arg-info";

fn fail<T>(operation: &'static str, status: Status) -> DriverResult<T> {
    Err(DriverError::new(operation, status))
}

/// Counters describing what a [`HostDriver`] has been asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub reads: usize,
    pub writes: usize,
    pub copies: usize,
    pub maps: usize,
    pub unmaps: usize,
    pub kernel_launches: usize,
    pub arg_sets: usize,
    pub live_contexts: usize,
    pub live_queues: usize,
    pub live_buffers: usize,
    pub live_programs: usize,
    pub live_kernels: usize,
    pub live_events: usize,
}

impl DriverStats {
    /// Transfers enqueued so far, kernel launches excluded.
    pub fn transfers(&self) -> usize {
        self.reads + self.writes + self.copies
    }
}

#[derive(Debug, Clone)]
struct HostPlatform {
    id: u64,
    name: String,
    version: String,
    devices: Vec<u64>,
}

#[derive(Debug)]
struct MappedRegion {
    ptr: usize,
    flags: MapFlags,
}

/// Backing store of one memory object. `u64` words keep every allocation
/// aligned for the widest element type.
#[derive(Debug)]
struct MemObject {
    context: u64,
    size: usize,
    storage: Vec<u64>,
    mapped: Vec<MappedRegion>,
}

impl MemObject {
    fn new(context: u64, size: usize) -> Self {
        Self {
            context,
            size,
            storage: vec![0u64; size.div_ceil(8)],
            mapped: Vec::new(),
        }
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.storage)[..self.size]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.storage)[..self.size]
    }

    fn range(&self, offset: usize, len: usize, op: &'static str) -> DriverResult<Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if len > 0 && end <= self.size => Ok(offset..end),
            _ => fail(op, Status::INVALID_VALUE),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QueueObj {
    context: u64,
    profiling: bool,
}

#[derive(Debug)]
struct BuiltProgram {
    kernels: Vec<KernelDecl>,
    arg_info: bool,
}

#[derive(Debug)]
struct ProgramObj {
    source: String,
    log: String,
    built: Option<BuiltProgram>,
}

struct KernelObj {
    decl: KernelDecl,
    arg_info: bool,
    args: Vec<Option<BoundArg>>,
    body: KernelFn,
}

#[derive(Debug, Clone, Copy)]
struct EventObj {
    queued: u64,
    start: u64,
    end: u64,
    profiling: bool,
}

#[derive(Default)]
struct HostState {
    next_id: u64,
    /// context -> device
    contexts: HashMap<u64, u64>,
    queues: HashMap<u64, QueueObj>,
    mems: HashMap<u64, MemObject>,
    programs: HashMap<u64, ProgramObj>,
    kernels: HashMap<u64, KernelObj>,
    events: HashMap<u64, EventObj>,
    stats: DriverStats,
}

impl HostState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn queue(&self, queue: QueueId, op: &'static str) -> DriverResult<QueueObj> {
        self.queues
            .get(&queue.0)
            .copied()
            .ok_or(DriverError::new(op, Status::INVALID_COMMAND_QUEUE))
    }

    fn check_wait_list(&self, wait_list: &[EventId], op: &'static str) -> DriverResult<()> {
        if wait_list.iter().all(|e| self.events.contains_key(&e.0)) {
            Ok(())
        } else {
            fail(op, Status::INVALID_EVENT_WAIT_LIST)
        }
    }

    fn mem(&self, mem: MemId, context: u64, op: &'static str) -> DriverResult<&MemObject> {
        let obj = self
            .mems
            .get(&mem.0)
            .ok_or(DriverError::new(op, Status::INVALID_MEM_OBJECT))?;
        if obj.context != context {
            return fail(op, Status::INVALID_CONTEXT);
        }
        Ok(obj)
    }

    fn mem_mut(&mut self, mem: MemId, context: u64, op: &'static str) -> DriverResult<&mut MemObject> {
        let obj = self
            .mems
            .get_mut(&mem.0)
            .ok_or(DriverError::new(op, Status::INVALID_MEM_OBJECT))?;
        if obj.context != context {
            return fail(op, Status::INVALID_CONTEXT);
        }
        Ok(obj)
    }

    fn kernel_param(
        &self,
        kernel: KernelId,
        index: u32,
        op: &'static str,
    ) -> DriverResult<&ParamDecl> {
        let obj = self
            .kernels
            .get(&kernel.0)
            .ok_or(DriverError::new(op, Status::INVALID_KERNEL))?;
        let param = obj
            .decl
            .params
            .get(index as usize)
            .ok_or(DriverError::new(op, Status::INVALID_ARG_INDEX))?;
        if !obj.arg_info {
            return fail(op, Status::KERNEL_ARG_INFO_NOT_AVAILABLE);
        }
        Ok(param)
    }
}

/// Byte size of a by-value parameter of a type the binder understands.
fn scalar_size(type_name: &str) -> Option<usize> {
    match type_name {
        "uchar" => Some(1),
        "int" | "uint" | "float" | "uchar4" => Some(4),
        "long" | "double" => Some(8),
        "float4" => Some(16),
        _ => None,
    }
}

/// Builder for [`HostDriver`].
#[derive(Debug, Clone)]
pub struct HostDriverBuilder {
    platforms: Vec<(String, String, usize)>,
    unified_memory: bool,
    max_work_group_size: usize,
}

impl Default for HostDriverBuilder {
    fn default() -> Self {
        Self {
            platforms: Vec::new(),
            unified_memory: false,
            max_work_group_size: DEFAULT_MAX_WORK_GROUP_SIZE,
        }
    }
}

impl HostDriverBuilder {
    /// Add a platform exposing `gpu_devices` GPU devices. Platforms are
    /// enumerated in the order they are added.
    pub fn platform(self, name: impl Into<String>, gpu_devices: usize) -> Self {
        self.platform_with_version(name, PLATFORM_VERSION, gpu_devices)
    }

    pub fn platform_with_version(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        gpu_devices: usize,
    ) -> Self {
        self.platforms.push((name.into(), version.into(), gpu_devices));
        self
    }

    /// Report devices as sharing memory with the host.
    pub fn unified_memory(mut self, unified: bool) -> Self {
        self.unified_memory = unified;
        self
    }

    pub fn max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self
    }

    pub fn build(self) -> HostDriver {
        let specs = if self.platforms.is_empty() {
            vec![(DEFAULT_PLATFORM.to_string(), PLATFORM_VERSION.to_string(), 1)]
        } else {
            self.platforms
        };

        let mut platforms = Vec::with_capacity(specs.len());
        let mut device_names = HashMap::new();
        let mut next_device = DEVICE_ID_BASE;
        for (idx, (name, version, gpus)) in specs.into_iter().enumerate() {
            let devices: Vec<u64> = (0..gpus)
                .map(|n| {
                    let id = next_device;
                    next_device += 1;
                    device_names.insert(id, format!("{name} device {n}"));
                    id
                })
                .collect();
            platforms.push(HostPlatform {
                id: idx as u64 + 1,
                name,
                version,
                devices,
            });
        }

        HostDriver {
            platforms,
            device_names,
            unified_memory: self.unified_memory,
            max_work_group_size: self.max_work_group_size,
            bodies: RefCell::new(HashMap::new()),
            state: RefCell::new(HostState::default()),
            epoch: Instant::now(),
        }
    }
}

/// Reference driver executing over host memory.
pub struct HostDriver {
    platforms: Vec<HostPlatform>,
    device_names: HashMap<u64, String>,
    unified_memory: bool,
    max_work_group_size: usize,
    bodies: RefCell<HashMap<String, KernelFn>>,
    state: RefCell<HostState>,
    epoch: Instant,
}

impl fmt::Debug for HostDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kernels: Vec<String> = self.bodies.borrow().keys().cloned().collect();
        kernels.sort();
        f.debug_struct("HostDriver")
            .field("platforms", &self.platforms)
            .field("unified_memory", &self.unified_memory)
            .field("kernels", &kernels)
            .finish_non_exhaustive()
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDriver {
    /// One platform with one GPU device and discrete memory.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HostDriverBuilder {
        HostDriverBuilder::default()
    }

    /// Register the body of the kernel called `name`. Programs declaring a
    /// kernel with no registered body fail to build.
    pub fn register_kernel<F>(&self, name: impl Into<String>, body: F)
    where
        F: Fn(&mut HostLaunch<'_>) -> DriverResult<()> + 'static,
    {
        let name = name.into();
        debug!(kernel = %name, "registered host kernel");
        self.bodies.borrow_mut().insert(name, Rc::new(body));
    }

    /// Snapshot of enqueue counters and live object counts.
    pub fn stats(&self) -> DriverStats {
        let state = self.state.borrow();
        DriverStats {
            live_contexts: state.contexts.len(),
            live_queues: state.queues.len(),
            live_buffers: state.mems.len(),
            live_programs: state.programs.len(),
            live_kernels: state.kernels.len(),
            live_events: state.events.len(),
            ..state.stats.clone()
        }
    }

    fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn check_device(&self, device: DeviceId, op: &'static str) -> DriverResult<()> {
        if self.device_names.contains_key(&device.0) {
            Ok(())
        } else {
            fail(op, Status::INVALID_DEVICE)
        }
    }

    /// Record a finished command and hand out its event.
    fn complete(&self, state: &mut HostState, profiling: bool, queued: u64) -> EventId {
        let end = self.now_ns();
        let id = state.alloc_id();
        state.events.insert(
            id,
            EventObj {
                queued,
                start: queued,
                end,
                profiling,
            },
        );
        EventId(id)
    }

    #[allow(clippy::type_complexity)]
    fn work_ranges(
        &self,
        offset: &[usize],
        global: &[usize],
        local: &[usize],
        op: &'static str,
    ) -> DriverResult<([usize; 3], [usize; 3], [usize; 3])> {
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
        if global.contains(&0) {
            return fail(op, Status::INVALID_GLOBAL_WORK_SIZE);
        }

        let mut o = [0usize; 3];
        let mut g = [1usize; 3];
        let mut l = [1usize; 3];
        g[..dim].copy_from_slice(global);
        if !offset.is_empty() {
            if offset.iter().zip(global).any(|(o, g)| o.checked_add(*g).is_none()) {
                return fail(op, Status::INVALID_GLOBAL_OFFSET);
            }
            o[..dim].copy_from_slice(offset);
        }
        if !local.is_empty() {
            let divides = local.iter().zip(global).all(|(l, g)| *l != 0 && g % l == 0);
            if !divides || local.iter().product::<usize>() > self.max_work_group_size {
                return fail(op, Status::INVALID_WORK_GROUP_SIZE);
            }
            l[..dim].copy_from_slice(local);
        }
        Ok((o, g, l))
    }
}

impl Driver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn platforms(&self) -> DriverResult<Vec<PlatformInfo>> {
        Ok(self
            .platforms
            .iter()
            .map(|p| PlatformInfo {
                id: PlatformId(p.id),
                name: p.name.clone(),
                version: p.version.clone(),
            })
            .collect())
    }

    fn gpu_devices(&self, platform: PlatformId) -> DriverResult<Vec<DeviceId>> {
        let op = "clGetDeviceIDs";
        let p = self
            .platforms
            .iter()
            .find(|p| p.id == platform.0)
            .ok_or(DriverError::new(op, Status::INVALID_PLATFORM))?;
        if p.devices.is_empty() {
            return fail(op, Status::DEVICE_NOT_FOUND);
        }
        Ok(p.devices.iter().copied().map(DeviceId).collect())
    }

    fn device_name(&self, device: DeviceId) -> DriverResult<String> {
        self.device_names
            .get(&device.0)
            .cloned()
            .ok_or(DriverError::new("clGetDeviceInfo", Status::INVALID_DEVICE))
    }

    fn host_unified_memory(&self, device: DeviceId) -> DriverResult<bool> {
        self.check_device(device, "clGetDeviceInfo")?;
        Ok(self.unified_memory)
    }

    fn create_context(&self, device: DeviceId) -> DriverResult<ContextId> {
        self.check_device(device, "clCreateContext")?;
        let mut state = self.state.borrow_mut();
        let id = state.alloc_id();
        state.contexts.insert(id, device.0);
        Ok(ContextId(id))
    }

    fn create_queue(
        &self,
        context: ContextId,
        device: DeviceId,
        profiling: bool,
    ) -> DriverResult<QueueId> {
        let op = "clCreateCommandQueue";
        let mut state = self.state.borrow_mut();
        let ctx_device = *state
            .contexts
            .get(&context.0)
            .ok_or(DriverError::new(op, Status::INVALID_CONTEXT))?;
        if ctx_device != device.0 {
            return fail(op, Status::INVALID_DEVICE);
        }
        let id = state.alloc_id();
        state.queues.insert(
            id,
            QueueObj {
                context: context.0,
                profiling,
            },
        );
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
        let mut state = self.state.borrow_mut();
        if !state.contexts.contains_key(&context.0) {
            return fail(op, Status::INVALID_CONTEXT);
        }
        if size == 0 {
            return fail(op, Status::INVALID_BUFFER_SIZE);
        }
        let access = [MemFlags::READ_WRITE, MemFlags::WRITE_ONLY, MemFlags::READ_ONLY]
            .iter()
            .filter(|f| flags.contains(**f))
            .count();
        if access > 1 {
            return fail(op, Status::INVALID_VALUE);
        }
        if flags.contains(MemFlags::USE_HOST_PTR)
            && flags.intersects(MemFlags::ALLOC_HOST_PTR | MemFlags::COPY_HOST_PTR)
        {
            return fail(op, Status::INVALID_VALUE);
        }
        let wants_host_ptr = flags.intersects(MemFlags::USE_HOST_PTR | MemFlags::COPY_HOST_PTR);
        if wants_host_ptr != init.is_some() {
            return fail(op, Status::INVALID_HOST_PTR);
        }

        let mut obj = MemObject::new(context.0, size);
        if let Some(init) = init {
            if init.len() < size {
                return fail(op, Status::INVALID_HOST_PTR);
            }
            obj.bytes_mut().copy_from_slice(&init[..size]);
        }
        let id = state.alloc_id();
        state.mems.insert(id, obj);
        trace!(mem = id, size, flags = flags.bits(), "host buffer created");
        Ok(MemId(id))
    }

    fn enqueue_read(
        &self,
        queue: QueueId,
        mem: MemId,
        _blocking: bool,
        offset: usize,
        dst: &mut [u8],
        wait_list: &[EventId],
    ) -> DriverResult<EventId> {
        let op = "clEnqueueReadBuffer";
        let queued = self.now_ns();
        let mut state = self.state.borrow_mut();
        let q = state.queue(queue, op)?;
        state.check_wait_list(wait_list, op)?;
        let obj = state.mem(mem, q.context, op)?;
        let range = obj.range(offset, dst.len(), op)?;
        dst.copy_from_slice(&obj.bytes()[range]);
        state.stats.reads += 1;
        Ok(self.complete(&mut state, q.profiling, queued))
    }

    fn enqueue_write(
        &self,
        queue: QueueId,
        mem: MemId,
        _blocking: bool,
        offset: usize,
        src: &[u8],
        wait_list: &[EventId],
    ) -> DriverResult<EventId> {
        let op = "clEnqueueWriteBuffer";
        let queued = self.now_ns();
        let mut state = self.state.borrow_mut();
        let q = state.queue(queue, op)?;
        state.check_wait_list(wait_list, op)?;
        let obj = state.mem_mut(mem, q.context, op)?;
        let range = obj.range(offset, src.len(), op)?;
        obj.bytes_mut()[range].copy_from_slice(src);
        state.stats.writes += 1;
        Ok(self.complete(&mut state, q.profiling, queued))
    }

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
        let queued = self.now_ns();
        let mut state = self.state.borrow_mut();
        let q = state.queue(queue, op)?;
        state.check_wait_list(wait_list, op)?;

        let src_obj = state.mem(src, q.context, op)?;
        let src_range = src_obj.range(src_offset, size, op)?;
        let data = src_obj.bytes()[src_range].to_vec();

        let dst_obj = state.mem_mut(dst, q.context, op)?;
        let dst_range = dst_obj.range(dst_offset, size, op)?;
        if src == dst && src_offset < dst_offset + size && dst_offset < src_offset + size {
            return fail(op, Status::MEM_COPY_OVERLAP);
        }
        dst_obj.bytes_mut()[dst_range].copy_from_slice(&data);
        state.stats.copies += 1;
        Ok(self.complete(&mut state, q.profiling, queued))
    }

    fn enqueue_map(
        &self,
        queue: QueueId,
        mem: MemId,
        _blocking: bool,
        flags: MapFlags,
        offset: usize,
        size: usize,
        wait_list: &[EventId],
    ) -> DriverResult<(*mut u8, EventId)> {
        let op = "clEnqueueMapBuffer";
        let queued = self.now_ns();
        let mut state = self.state.borrow_mut();
        let q = state.queue(queue, op)?;
        state.check_wait_list(wait_list, op)?;
        let obj = state.mem_mut(mem, q.context, op)?;
        let range = obj.range(offset, size, op)?;
        let ptr = obj.bytes_mut()[range].as_mut_ptr();
        obj.mapped.push(MappedRegion {
            ptr: ptr as usize,
            flags,
        });
        state.stats.maps += 1;
        Ok((ptr, self.complete(&mut state, q.profiling, queued)))
    }

    fn enqueue_unmap(
        &self,
        queue: QueueId,
        mem: MemId,
        mapped: *mut u8,
        wait_list: &[EventId],
    ) -> DriverResult<EventId> {
        let op = "clEnqueueUnmapMemObject";
        let queued = self.now_ns();
        let mut state = self.state.borrow_mut();
        let q = state.queue(queue, op)?;
        state.check_wait_list(wait_list, op)?;
        let obj = state.mem_mut(mem, q.context, op)?;
        let pos = obj
            .mapped
            .iter()
            .position(|r| r.ptr == mapped as usize)
            .ok_or(DriverError::new(op, Status::INVALID_VALUE))?;
        let region = obj.mapped.remove(pos);
        trace!(mem = mem.0, flags = region.flags.bits(), "host buffer unmapped");
        state.stats.unmaps += 1;
        Ok(self.complete(&mut state, q.profiling, queued))
    }

    fn create_program(&self, context: ContextId, source: &str) -> DriverResult<ProgramId> {
        let op = "clCreateProgramWithSource";
        let mut state = self.state.borrow_mut();
        if !state.contexts.contains_key(&context.0) {
            return fail(op, Status::INVALID_CONTEXT);
        }
        let id = state.alloc_id();
        state.programs.insert(
            id,
            ProgramObj {
                source: source.to_string(),
                log: String::new(),
                built: None,
            },
        );
        Ok(ProgramId(id))
    }

    fn build_program(
        &self,
        program: ProgramId,
        device: DeviceId,
        options: &str,
    ) -> DriverResult<()> {
        let op = "clBuildProgram";
        self.check_device(device, op)?;
        let bodies = self.bodies.borrow();
        let mut state = self.state.borrow_mut();
        let prog = state
            .programs
            .get_mut(&program.0)
            .ok_or(DriverError::new(op, Status::INVALID_PROGRAM))?;

        let mut errors = Vec::new();
        for (idx, line) in prog.source.lines().enumerate() {
            let directive = line.trim_start().strip_prefix('#').map(str::trim_start);
            if let Some(msg) = directive.and_then(|d| d.strip_prefix("error")) {
                errors.push(format!("<source>:{}: error: {}", idx + 1, msg.trim()));
            }
        }
        let kernels = match parse_kernels(&prog.source) {
            Ok(kernels) => kernels,
            Err(errs) => {
                errors.extend(
                    errs.into_iter()
                        .map(|e| format!("<source>:{}: error: {}", e.line, e.message)),
                );
                Vec::new()
            }
        };
        for k in &kernels {
            if !bodies.contains_key(&k.name) {
                errors.push(format!(
                    "<source>:{}: error: no host implementation registered for kernel `{}`",
                    k.line, k.name
                ));
            }
        }

        if !errors.is_empty() {
            prog.log = errors.join("\n");
            prog.built = None;
            return fail(op, Status::BUILD_PROGRAM_FAILURE);
        }

        let arg_info = options.split_whitespace().any(|o| o == ARG_INFO_OPTION);
        debug!(program = program.0, kernels = kernels.len(), arg_info, "host program built");
        prog.log.clear();
        prog.built = Some(BuiltProgram { kernels, arg_info });
        Ok(())
    }

    fn build_log(&self, program: ProgramId, device: DeviceId) -> DriverResult<String> {
        let op = "clGetProgramBuildInfo";
        self.check_device(device, op)?;
        let state = self.state.borrow();
        state
            .programs
            .get(&program.0)
            .map(|p| p.log.clone())
            .ok_or(DriverError::new(op, Status::INVALID_PROGRAM))
    }

    fn program_binaries(&self, program: ProgramId) -> DriverResult<Vec<Vec<u8>>> {
        let op = "clGetProgramInfo";
        let state = self.state.borrow();
        let prog = state
            .programs
            .get(&program.0)
            .ok_or(DriverError::new(op, Status::INVALID_PROGRAM))?;
        if prog.built.is_none() {
            return fail(op, Status::INVALID_PROGRAM_EXECUTABLE);
        }
        Ok(vec![format!("clkit-host-binary\n{}", prog.source).into_bytes()])
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> DriverResult<KernelId> {
        let op = "clCreateKernel";
        let bodies = self.bodies.borrow();
        let mut state = self.state.borrow_mut();
        let prog = state
            .programs
            .get(&program.0)
            .ok_or(DriverError::new(op, Status::INVALID_PROGRAM))?;
        let built = prog
            .built
            .as_ref()
            .ok_or(DriverError::new(op, Status::INVALID_PROGRAM_EXECUTABLE))?;
        let decl = built
            .kernels
            .iter()
            .find(|k| k.name == name)
            .cloned()
            .ok_or(DriverError::new(op, Status::INVALID_KERNEL_NAME))?;
        let body = bodies
            .get(name)
            .cloned()
            .ok_or(DriverError::new(op, Status::INVALID_KERNEL_NAME))?;
        let arg_info = built.arg_info;

        let id = state.alloc_id();
        state.kernels.insert(
            id,
            KernelObj {
                args: vec![None; decl.params.len()],
                decl,
                arg_info,
                body,
            },
        );
        Ok(KernelId(id))
    }

    fn kernel_arg_type_name(&self, kernel: KernelId, index: u32) -> DriverResult<String> {
        let state = self.state.borrow();
        let param = state.kernel_param(kernel, index, "clGetKernelArgInfo")?;
        Ok(param.type_name.clone())
    }

    fn kernel_arg_address_qualifier(
        &self,
        kernel: KernelId,
        index: u32,
    ) -> DriverResult<AddressQualifier> {
        let state = self.state.borrow();
        let param = state.kernel_param(kernel, index, "clGetKernelArgInfo")?;
        Ok(param.qualifier)
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, value: ArgValue) -> DriverResult<()> {
        let op = "clSetKernelArg";
        let mut state = self.state.borrow_mut();
        let mem_exists = match value {
            ArgValue::Mem(mem) => state.mems.contains_key(&mem.0),
            _ => true,
        };
        let obj = state
            .kernels
            .get_mut(&kernel.0)
            .ok_or(DriverError::new(op, Status::INVALID_KERNEL))?;
        let param = obj
            .decl
            .params
            .get(index as usize)
            .ok_or(DriverError::new(op, Status::INVALID_ARG_INDEX))?;

        let bound = match value {
            ArgValue::Scalar(v) => {
                if param.is_pointer {
                    return fail(op, Status::INVALID_ARG_SIZE);
                }
                if scalar_size(param.base_type()).is_some_and(|s| s != v.data_type().size()) {
                    return fail(op, Status::INVALID_ARG_SIZE);
                }
                BoundArg::Scalar(v.to_ne_bytes())
            }
            ArgValue::Mem(mem) => {
                if !param.is_pointer || param.qualifier == AddressQualifier::Local {
                    return fail(op, Status::INVALID_ARG_VALUE);
                }
                if !mem_exists {
                    return fail(op, Status::INVALID_MEM_OBJECT);
                }
                BoundArg::Mem(mem.0)
            }
            ArgValue::Local(size) => {
                if param.qualifier != AddressQualifier::Local {
                    return fail(op, Status::INVALID_ARG_VALUE);
                }
                if size == 0 {
                    return fail(op, Status::INVALID_ARG_SIZE);
                }
                BoundArg::Local(size)
            }
        };
        obj.args[index as usize] = Some(bound);
        state.stats.arg_sets += 1;
        Ok(())
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
        let queued = self.now_ns();
        let mut state = self.state.borrow_mut();
        let q = state.queue(queue, op)?;
        let obj = state
            .kernels
            .get(&kernel.0)
            .ok_or(DriverError::new(op, Status::INVALID_KERNEL))?;
        let name = obj.decl.name.clone();
        let body = Rc::clone(&obj.body);
        let args = obj
            .args
            .iter()
            .cloned()
            .collect::<Option<Vec<_>>>()
            .ok_or(DriverError::new(op, Status::INVALID_KERNEL_ARGS))?;
        state.check_wait_list(wait_list, op)?;
        let (o, g, _) = self.work_ranges(offset, global, local, op)?;
        let released_mem = args
            .iter()
            .any(|a| matches!(a, BoundArg::Mem(id) if !state.mems.contains_key(id)));
        if released_mem {
            return fail(op, Status::INVALID_KERNEL_ARGS);
        }

        trace!(kernel = %name, ?global, ?local, "host kernel launch");
        // The body runs without the state borrowed so it may call back into
        // the driver. Allocations it could reach are lent out meanwhile.
        let mut mems = std::mem::take(&mut state.mems);
        drop(state);
        let mut launch = HostLaunch {
            args: &args,
            mems: &mut mems,
            offset: o,
            global: g,
        };
        let result = body(&mut launch);

        let mut state = self.state.borrow_mut();
        let created = std::mem::replace(&mut state.mems, mems);
        state.mems.extend(created);
        result?;
        state.stats.kernel_launches += 1;
        Ok(self.complete(&mut state, q.profiling, queued))
    }

    fn wait_for_events(&self, events: &[EventId]) -> DriverResult<()> {
        let op = "clWaitForEvents";
        if events.is_empty() {
            return fail(op, Status::INVALID_VALUE);
        }
        let state = self.state.borrow();
        if events.iter().all(|e| state.events.contains_key(&e.0)) {
            Ok(())
        } else {
            fail(op, Status::INVALID_EVENT)
        }
    }

    fn event_profiling(&self, event: EventId, info: ProfilingInfo) -> DriverResult<u64> {
        let op = "clGetEventProfilingInfo";
        let state = self.state.borrow();
        let ev = state
            .events
            .get(&event.0)
            .ok_or(DriverError::new(op, Status::INVALID_EVENT))?;
        if !ev.profiling {
            return fail(op, Status::PROFILING_INFO_NOT_AVAILABLE);
        }
        Ok(match info {
            ProfilingInfo::Queued => ev.queued,
            ProfilingInfo::Start => ev.start,
            ProfilingInfo::End => ev.end,
        })
    }

    fn finish(&self, queue: QueueId) -> DriverResult<()> {
        self.state.borrow().queue(queue, "clFinish").map(|_| ())
    }

    fn release_device(&self, device: DeviceId) -> DriverResult<()> {
        // Root devices are not reference counted.
        self.check_device(device, "clReleaseDevice")
    }

    fn release_context(&self, context: ContextId) -> DriverResult<()> {
        match self.state.borrow_mut().contexts.remove(&context.0) {
            Some(_) => Ok(()),
            None => fail("clReleaseContext", Status::INVALID_CONTEXT),
        }
    }

    fn release_queue(&self, queue: QueueId) -> DriverResult<()> {
        match self.state.borrow_mut().queues.remove(&queue.0) {
            Some(_) => Ok(()),
            None => fail("clReleaseCommandQueue", Status::INVALID_COMMAND_QUEUE),
        }
    }

    fn release_mem(&self, mem: MemId) -> DriverResult<()> {
        match self.state.borrow_mut().mems.remove(&mem.0) {
            Some(_) => Ok(()),
            None => fail("clReleaseMemObject", Status::INVALID_MEM_OBJECT),
        }
    }

    fn release_program(&self, program: ProgramId) -> DriverResult<()> {
        match self.state.borrow_mut().programs.remove(&program.0) {
            Some(_) => Ok(()),
            None => fail("clReleaseProgram", Status::INVALID_PROGRAM),
        }
    }

    fn release_kernel(&self, kernel: KernelId) -> DriverResult<()> {
        match self.state.borrow_mut().kernels.remove(&kernel.0) {
            Some(_) => Ok(()),
            None => fail("clReleaseKernel", Status::INVALID_KERNEL),
        }
    }

    fn release_event(&self, event: EventId) -> DriverResult<()> {
        match self.state.borrow_mut().events.remove(&event.0) {
            Some(_) => Ok(()),
            None => fail("clReleaseEvent", Status::INVALID_EVENT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;

    const ADD_ONE: &str = "__kernel void add_one(__global int* data, int amount) { }";

    fn setup() -> (HostDriver, ContextId, DeviceId, QueueId) {
        let driver = HostDriver::new();
        let platform = driver.platforms().unwrap()[0].id;
        let device = driver.gpu_devices(platform).unwrap()[0];
        let ctx = driver.create_context(device).unwrap();
        let queue = driver.create_queue(ctx, device, true).unwrap();
        (driver, ctx, device, queue)
    }

    fn add_one_body(launch: &mut HostLaunch<'_>) -> DriverResult<()> {
        let amount: i32 = launch.scalar(1)?;
        let ids: Vec<usize> = launch.global_ids().map(|id| id[0]).collect();
        let data = launch.buffer_mut::<i32>(0)?;
        for i in ids {
            data[i] += amount;
        }
        Ok(())
    }

    #[test]
    fn write_then_read_round_trips_bytes() {
        let (driver, ctx, _, queue) = setup();
        let mem = driver.create_buffer(ctx, MemFlags::READ_WRITE, 8, None).unwrap();
        driver
            .enqueue_write(queue, mem, true, 0, &[1, 2, 3, 4, 5, 6, 7, 8], &[])
            .unwrap();
        let mut out = [0u8; 4];
        driver.enqueue_read(queue, mem, true, 2, &mut out, &[]).unwrap();
        assert_eq!(out, [3, 4, 5, 6]);
        assert_eq!(driver.stats().transfers(), 2);
    }

    #[test]
    fn out_of_range_read_is_invalid_value() {
        let (driver, ctx, _, queue) = setup();
        let mem = driver.create_buffer(ctx, MemFlags::READ_WRITE, 8, None).unwrap();
        let mut out = [0u8; 4];
        let err = driver.enqueue_read(queue, mem, true, 6, &mut out, &[]).unwrap_err();
        assert_eq!(err.status, Status::INVALID_VALUE);
        assert_eq!(err.operation, "clEnqueueReadBuffer");
    }

    #[test]
    fn buffer_creation_validates_flags_and_size() {
        let (driver, ctx, _, _) = setup();
        let zero = driver.create_buffer(ctx, MemFlags::READ_WRITE, 0, None).unwrap_err();
        assert_eq!(zero.status, Status::INVALID_BUFFER_SIZE);
        let both = driver
            .create_buffer(ctx, MemFlags::READ_ONLY | MemFlags::WRITE_ONLY, 4, None)
            .unwrap_err();
        assert_eq!(both.status, Status::INVALID_VALUE);
        let missing_ptr = driver
            .create_buffer(ctx, MemFlags::COPY_HOST_PTR, 4, None)
            .unwrap_err();
        assert_eq!(missing_ptr.status, Status::INVALID_HOST_PTR);
        let copied = driver
            .create_buffer(ctx, MemFlags::COPY_HOST_PTR, 4, Some(&[9, 9, 9, 9]))
            .unwrap();
        assert_eq!(driver.stats().live_buffers, 1);
        driver.release_mem(copied).unwrap();
        assert_eq!(driver.stats().live_buffers, 0);
    }

    #[test]
    fn overlapping_self_copy_is_rejected() {
        let (driver, ctx, _, queue) = setup();
        let mem = driver.create_buffer(ctx, MemFlags::READ_WRITE, 16, None).unwrap();
        let err = driver.enqueue_copy(queue, mem, mem, 0, 4, 8, &[]).unwrap_err();
        assert_eq!(err.status, Status::MEM_COPY_OVERLAP);
        driver.enqueue_copy(queue, mem, mem, 0, 8, 8, &[]).unwrap();
    }

    #[test]
    fn map_unmap_tracks_regions() {
        let (driver, ctx, _, queue) = setup();
        let mem = driver.create_buffer(ctx, MemFlags::READ_WRITE, 8, None).unwrap();
        let (ptr, _) = driver
            .enqueue_map(queue, mem, true, MapFlags::READ_WRITE, 0, 8, &[])
            .unwrap();
        assert!(!ptr.is_null());
        driver.enqueue_unmap(queue, mem, ptr, &[]).unwrap();
        let again = driver.enqueue_unmap(queue, mem, ptr, &[]).unwrap_err();
        assert_eq!(again.status, Status::INVALID_VALUE);
    }

    #[test]
    fn build_fails_without_registered_body() {
        let (driver, ctx, device, _) = setup();
        let program = driver.create_program(ctx, ADD_ONE).unwrap();
        let err = driver.build_program(program, device, ARG_INFO_OPTION).unwrap_err();
        assert_eq!(err.status, Status::BUILD_PROGRAM_FAILURE);
        let log = driver.build_log(program, device).unwrap();
        assert!(log.contains("add_one"), "log was: {log}");
    }

    #[test]
    fn error_directive_fails_the_build() {
        let (driver, ctx, device, _) = setup();
        let program = driver.create_program(ctx, "#error unsupported device\n").unwrap();
        assert!(driver.build_program(program, device, "").is_err());
        let log = driver.build_log(program, device).unwrap();
        assert_eq!(log, "<source>:1: error: unsupported device");
    }

    #[test]
    fn arg_info_requires_build_option() {
        let (driver, ctx, device, _) = setup();
        driver.register_kernel("add_one", add_one_body);
        let program = driver.create_program(ctx, ADD_ONE).unwrap();
        driver.build_program(program, device, "").unwrap();
        let kernel = driver.create_kernel(program, "add_one").unwrap();
        let err = driver.kernel_arg_type_name(kernel, 0).unwrap_err();
        assert_eq!(err.status, Status::KERNEL_ARG_INFO_NOT_AVAILABLE);
    }

    #[test]
    fn kernel_runs_over_global_range() {
        let (driver, ctx, device, queue) = setup();
        driver.register_kernel("add_one", add_one_body);
        let program = driver.create_program(ctx, ADD_ONE).unwrap();
        driver.build_program(program, device, ARG_INFO_OPTION).unwrap();
        let kernel = driver.create_kernel(program, "add_one").unwrap();
        assert_eq!(driver.kernel_arg_type_name(kernel, 0).unwrap(), "int*");
        assert_eq!(
            driver.kernel_arg_address_qualifier(kernel, 1).unwrap(),
            AddressQualifier::Private
        );

        let init: Vec<i32> = (0..8).collect();
        let mem = driver
            .create_buffer(
                ctx,
                MemFlags::READ_WRITE | MemFlags::COPY_HOST_PTR,
                32,
                Some(bytemuck::cast_slice(&init)),
            )
            .unwrap();

        let unset = driver.enqueue_kernel(queue, kernel, &[], &[8], &[], &[]).unwrap_err();
        assert_eq!(unset.status, Status::INVALID_KERNEL_ARGS);

        driver.set_kernel_arg(kernel, 0, ArgValue::Mem(mem)).unwrap();
        driver
            .set_kernel_arg(kernel, 1, ArgValue::Scalar(10i32.into_scalar()))
            .unwrap();
        let wrong_size = driver
            .set_kernel_arg(kernel, 1, ArgValue::Scalar(1i64.into_scalar()))
            .unwrap_err();
        assert_eq!(wrong_size.status, Status::INVALID_ARG_SIZE);

        let ev = driver.enqueue_kernel(queue, kernel, &[4], &[4], &[2], &[]).unwrap();
        let mut out = vec![0u8; 32];
        driver.enqueue_read(queue, mem, true, 0, &mut out, &[ev]).unwrap();
        let out: &[i32] = bytemuck::cast_slice(&out);
        assert_eq!(out, &[0, 1, 2, 3, 14, 15, 16, 17]);

        let start = driver.event_profiling(ev, ProfilingInfo::Start).unwrap();
        let end = driver.event_profiling(ev, ProfilingInfo::End).unwrap();
        assert!(end >= start);
    }

    #[test]
    fn work_sizes_are_validated() {
        let driver = HostDriver::new();
        let op = "clEnqueueNDRangeKernel";
        let status = |o: &[usize], g: &[usize], l: &[usize]| {
            driver.work_ranges(o, g, l, op).unwrap_err().status
        };
        assert_eq!(status(&[], &[], &[]), Status::INVALID_WORK_DIMENSION);
        assert_eq!(status(&[], &[1, 1, 1, 1], &[]), Status::INVALID_WORK_DIMENSION);
        assert_eq!(status(&[], &[0], &[]), Status::INVALID_GLOBAL_WORK_SIZE);
        assert_eq!(status(&[], &[10], &[3]), Status::INVALID_WORK_GROUP_SIZE);
        assert_eq!(status(&[], &[8, 8], &[8]), Status::INVALID_WORK_GROUP_SIZE);
        assert_eq!(status(&[0, 0], &[8], &[]), Status::INVALID_GLOBAL_OFFSET);
        assert_eq!(status(&[], &[2048], &[2048]), Status::INVALID_WORK_GROUP_SIZE);
        let (o, g, l) = driver.work_ranges(&[1, 2], &[4, 8], &[2, 2], op).unwrap();
        assert_eq!((o, g, l), ([1, 2, 0], [4, 8, 1], [2, 2, 1]));
    }

    #[test]
    fn empty_platform_reports_device_not_found() {
        let driver = HostDriver::builder()
            .platform("Clover", 0)
            .platform("Other", 2)
            .build();
        let platforms = driver.platforms().unwrap();
        assert_eq!(platforms.len(), 2);
        let err = driver.gpu_devices(platforms[0].id).unwrap_err();
        assert_eq!(err.status, Status::DEVICE_NOT_FOUND);
        assert_eq!(driver.gpu_devices(platforms[1].id).unwrap().len(), 2);
    }

    #[test]
    fn scalar_sizes_cover_vectors() {
        assert_eq!(scalar_size("int"), Some(4));
        assert_eq!(scalar_size("float4"), Some(16));
        assert_eq!(scalar_size("uchar4"), Some(4));
        assert_eq!(scalar_size("image2d_t"), None);
    }
}
