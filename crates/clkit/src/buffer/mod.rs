//! Buffers that may live on the host, on the device, or in both places.
//!
//! A [`ComputeBuffer`] owns up to two driver allocations: a host-visible one
//! (allocated with `ALLOC_HOST_PTR` so it can be mapped cheaply) and a
//! device-resident one. Callers move data between them explicitly with
//! [`ComputeBuffer::to_device`] and [`ComputeBuffer::to_host`]. When the device
//! shares memory with the host a single allocation plays both roles and the
//! transfers become no-ops.

mod accessor;

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::rc::Rc;

use bytemuck::Zeroable;
use tracing::{debug, warn};

pub use accessor::{Accessor, PendingAccessor};

use crate::core::{Active, Core, EventKind, Releasable};
use crate::driver::{Driver, DriverError, EventId, MapFlags, MemFlags, MemId, Status};
use crate::element::Element;
use crate::error::{ClkitError, Result};
use crate::event::Event;

/// Where a buffer keeps its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    HostOnly,
    DeviceOnly,
    HostAndDevice,
}

impl Placement {
    pub fn has_host(self) -> bool {
        matches!(self, Self::HostOnly | Self::HostAndDevice)
    }

    pub fn has_device(self) -> bool {
        matches!(self, Self::DeviceOnly | Self::HostAndDevice)
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostOnly => write!(f, "host-only"),
            Self::DeviceOnly => write!(f, "device-only"),
            Self::HostAndDevice => write!(f, "host-and-device"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    Split {
        host: Option<MemId>,
        device: Option<MemId>,
    },
    /// One allocation serving as both host and device copy.
    Unified(MemId),
}

impl Storage {
    fn host(self) -> Option<MemId> {
        match self {
            Self::Split { host, .. } => host,
            Self::Unified(mem) => Some(mem),
        }
    }

    fn device(self) -> Option<MemId> {
        match self {
            Self::Split { device, .. } => device,
            Self::Unified(mem) => Some(mem),
        }
    }

    /// Each allocation once.
    fn allocations(self) -> Vec<MemId> {
        match self {
            Self::Split { host, device } => host.into_iter().chain(device).collect(),
            Self::Unified(mem) => vec![mem],
        }
    }
}

struct BufferHandles {
    core: Core,
    generation: u64,
    storage: Cell<Option<Storage>>,
}

impl BufferHandles {
    fn release(&self) -> Result<()> {
        let Some(storage) = self.storage.take() else {
            return Ok(());
        };
        let mut first_err = None;
        for mem in storage.allocations() {
            let result = self
                .core
                .release_handle(self.generation, "buffer", |d| d.release_mem(mem));
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Releasable for BufferHandles {
    fn release_for_deinit(&self, driver: &dyn Driver) {
        let Some(storage) = self.storage.take() else {
            return;
        };
        for mem in storage.allocations() {
            if let Err(e) = driver.release_mem(mem) {
                warn!("failed to release buffer allocation {mem}: {e}");
            }
        }
    }
}

impl Drop for BufferHandles {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to release buffer: {e}");
        }
    }
}

/// Which allocation an operation targets.
#[derive(Debug, Clone, Copy)]
enum Role {
    Host,
    Device,
}

impl Role {
    fn name(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Device => "device",
        }
    }
}

/// A typed buffer with optional host and device allocations.
pub struct ComputeBuffer<T: Element> {
    handles: Rc<BufferHandles>,
    len: usize,
    placement: Placement,
    _marker: PhantomData<T>,
}

impl<T: Element> fmt::Debug for ComputeBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeBuffer")
            .field("type", &T::DATA_TYPE)
            .field("len", &self.len)
            .field("placement", &self.placement)
            .field("storage", &self.handles.storage.get())
            .finish()
    }
}

impl<T: Element> ComputeBuffer<T> {
    /// Allocate `len` uninitialized elements.
    pub fn new(core: &Core, len: usize, placement: Placement, flags: MemFlags) -> Result<Self> {
        Self::allocate(core, len, placement, flags, None)
    }

    /// Allocate a buffer holding a copy of `data` in every requested location.
    pub fn from_slice(
        core: &Core,
        data: &[T],
        placement: Placement,
        flags: MemFlags,
    ) -> Result<Self> {
        Self::allocate(core, data.len(), placement, flags, Some(data))
    }

    fn allocate(
        core: &Core,
        len: usize,
        placement: Placement,
        flags: MemFlags,
        init: Option<&[T]>,
    ) -> Result<Self> {
        if flags.intersects(MemFlags::HOST_PTR_MASK) {
            return Err(ClkitError::ReservedMemFlags { flags: flags.bits() });
        }
        let active = core.active()?;
        let driver = core.driver();
        let size = len
            .checked_mul(size_of::<T>())
            .ok_or(DriverError::new("clCreateBuffer", Status::INVALID_BUFFER_SIZE))?;
        let bytes: Option<&[u8]> = init.map(bytemuck::cast_slice);
        let create = |extra: MemFlags| {
            let flags = match bytes {
                Some(_) => flags | extra | MemFlags::COPY_HOST_PTR,
                None => flags | extra,
            };
            driver.create_buffer(active.context, flags, size, bytes)
        };

        let storage = if active.unified {
            Storage::Unified(create(MemFlags::ALLOC_HOST_PTR)?)
        } else {
            let host = if placement.has_host() {
                Some(create(MemFlags::ALLOC_HOST_PTR)?)
            } else {
                None
            };
            let device = if placement.has_device() {
                match create(MemFlags::from_bits(0)) {
                    Ok(mem) => Some(mem),
                    Err(e) => {
                        if let Some(host) = host {
                            if let Err(release) = driver.release_mem(host) {
                                warn!("failed to release host allocation: {release}");
                            }
                        }
                        return Err(e.into());
                    }
                }
            } else {
                None
            };
            Storage::Split { host, device }
        };
        debug!(
            "allocated {placement} buffer of {len} x {} ({size} bytes, unified={})",
            T::DATA_TYPE,
            active.unified
        );

        let handles = Rc::new(BufferHandles {
            core: core.clone(),
            generation: active.generation,
            storage: Cell::new(Some(storage)),
        });
        let weak = Rc::downgrade(&handles);
        core.track(weak);
        Ok(Self {
            handles,
            len,
            placement,
            _marker: PhantomData,
        })
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_size(&self) -> usize {
        self.len * size_of::<T>()
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Whether one allocation serves as both host and device copy.
    pub fn is_unified(&self) -> bool {
        matches!(self.handles.storage.get(), Some(Storage::Unified(_)))
    }

    pub fn core(&self) -> &Core {
        &self.handles.core
    }

    /// Active handles plus this buffer's storage, if both are still valid.
    fn live(&self) -> Result<(Active, Storage)> {
        let active = self.handles.core.active()?;
        match self.handles.storage.get() {
            Some(storage) if active.generation == self.handles.generation => {
                Ok((active, storage))
            }
            _ => Err(ClkitError::NotInitialized),
        }
    }

    fn require(&self, role: Role, operation: &'static str) -> Result<()> {
        let ok = match role {
            Role::Host => self.placement.has_host(),
            Role::Device => self.placement.has_device(),
        };
        if ok {
            Ok(())
        } else {
            Err(ClkitError::PlacementRequired {
                operation,
                required: role.name(),
            })
        }
    }

    fn require_both(&self, operation: &'static str) -> Result<()> {
        if self.placement == Placement::HostAndDevice {
            Ok(())
        } else {
            Err(ClkitError::PlacementRequired {
                operation,
                required: "host-and-device",
            })
        }
    }

    fn mem(&self, storage: Storage, role: Role) -> Result<MemId> {
        let mem = match role {
            Role::Host => storage.host(),
            Role::Device => storage.device(),
        };
        mem.ok_or(ClkitError::PlacementRequired {
            operation: "buffer access",
            required: role.name(),
        })
    }

    fn check_len(&self, actual: usize) -> Result<()> {
        if actual == self.len {
            Ok(())
        } else {
            Err(ClkitError::LengthMismatch {
                expected: self.len,
                actual,
            })
        }
    }

    fn event(&self, active: &Active, id: EventId, kind: EventKind) -> Event {
        Event::track(&self.handles.core, active.generation, id, kind)
    }

    /// Device allocation bound to kernel arguments.
    pub(crate) fn device_mem(&self) -> Result<MemId> {
        let (_, storage) = self.live()?;
        storage.device().ok_or(ClkitError::MissingDeviceAllocation)
    }

    fn transfer(
        &self,
        from: Role,
        to: Role,
        blocking: bool,
        wait_list: &[Event],
        operation: &'static str,
    ) -> Result<Option<Event>> {
        self.require_both(operation)?;
        let (active, storage) = self.live()?;
        if let Storage::Unified(_) = storage {
            return Ok(None);
        }
        let src = self.mem(storage, from)?;
        let dst = self.mem(storage, to)?;
        let wait = Event::ids(wait_list)?;
        let id = self.handles.core.driver().enqueue_copy(
            active.queue,
            src,
            dst,
            0,
            0,
            self.byte_size(),
            &wait,
        )?;
        let event = self.event(&active, id, EventKind::Io);
        if blocking {
            event.wait()?;
        }
        Ok(Some(event))
    }

    /// Copy the host allocation into the device allocation.
    ///
    /// Returns `None` when storage is unified and there is nothing to copy.
    pub fn to_device(&self, blocking: bool, wait_list: &[Event]) -> Result<Option<Event>> {
        self.transfer(Role::Host, Role::Device, blocking, wait_list, "to_device")
    }

    /// Copy the device allocation into the host allocation.
    pub fn to_host(&self, blocking: bool, wait_list: &[Event]) -> Result<Option<Event>> {
        self.transfer(Role::Device, Role::Host, blocking, wait_list, "to_host")
    }

    fn read_into(&self, role: Role, offset: usize, dst: &mut [T]) -> Result<()> {
        let (active, storage) = self.live()?;
        let mem = self.mem(storage, role)?;
        let id = self.handles.core.driver().enqueue_read(
            active.queue,
            mem,
            true,
            offset * size_of::<T>(),
            bytemuck::cast_slice_mut(dst),
            &[],
        )?;
        self.event(&active, id, EventKind::Io);
        Ok(())
    }

    fn write_from(&self, role: Role, src: &[T]) -> Result<()> {
        let (active, storage) = self.live()?;
        let mem = self.mem(storage, role)?;
        let id = self.handles.core.driver().enqueue_write(
            active.queue,
            mem,
            true,
            0,
            bytemuck::cast_slice(src),
            &[],
        )?;
        self.event(&active, id, EventKind::Io);
        Ok(())
    }

    /// Blocking read of the host allocation into `dst`.
    pub fn host_read_to(&self, dst: &mut [T]) -> Result<()> {
        self.require(Role::Host, "host_read_to")?;
        self.check_len(dst.len())?;
        self.read_into(Role::Host, 0, dst)
    }

    /// Blocking read of the device allocation into `dst`.
    pub fn device_read_to(&self, dst: &mut [T]) -> Result<()> {
        self.require(Role::Device, "device_read_to")?;
        self.check_len(dst.len())?;
        self.read_into(Role::Device, 0, dst)
    }

    /// Blocking write of `src` into the host allocation.
    pub fn host_write_from(&self, src: &[T]) -> Result<()> {
        self.require(Role::Host, "host_write_from")?;
        self.check_len(src.len())?;
        self.write_from(Role::Host, src)
    }

    /// Blocking write of `src` into the device allocation.
    pub fn device_write_from(&self, src: &[T]) -> Result<()> {
        self.require(Role::Device, "device_write_from")?;
        self.check_len(src.len())?;
        self.write_from(Role::Device, src)
    }

    /// Read the device copy into a fresh vector.
    pub fn device_to_vec(&self) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); self.len];
        self.device_read_to(&mut out)?;
        Ok(out)
    }

    /// Read the host copy into a fresh vector.
    pub fn host_to_vec(&self) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); self.len];
        self.host_read_to(&mut out)?;
        Ok(out)
    }

    /// Up to `count` leading elements of the device copy, with their indices.
    pub fn first_elements(&self, count: usize) -> Result<Vec<(usize, T)>> {
        self.require(Role::Device, "first_elements")?;
        let count = count.min(self.len);
        self.peek(0, count)
    }

    /// Up to `count` trailing elements of the device copy, with their indices.
    pub fn last_elements(&self, count: usize) -> Result<Vec<(usize, T)>> {
        self.require(Role::Device, "last_elements")?;
        let count = count.min(self.len);
        self.peek(self.len - count, count)
    }

    fn peek(&self, start: usize, count: usize) -> Result<Vec<(usize, T)>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut values = vec![T::zeroed(); count];
        self.read_into(Role::Device, start, &mut values)?;
        Ok((start..).zip(values).collect())
    }

    fn copy_to(
        &self,
        dst: &ComputeBuffer<T>,
        role: Role,
        blocking: bool,
        wait_list: &[Event],
        operation: &'static str,
    ) -> Result<Event> {
        self.require(role, operation)?;
        dst.require(role, operation)?;
        dst.check_len(self.len)?;
        let (active, storage) = self.live()?;
        let (_, dst_storage) = dst.live()?;
        let src_mem = self.mem(storage, role)?;
        let dst_mem = dst.mem(dst_storage, role)?;
        let wait = Event::ids(wait_list)?;
        let id = self.handles.core.driver().enqueue_copy(
            active.queue,
            src_mem,
            dst_mem,
            0,
            0,
            self.byte_size(),
            &wait,
        )?;
        let event = self.event(&active, id, EventKind::Kernel);
        if blocking {
            event.wait()?;
        }
        Ok(event)
    }

    /// Copy this buffer's host allocation into `dst`'s host allocation.
    pub fn copy_host_to(
        &self,
        dst: &ComputeBuffer<T>,
        blocking: bool,
        wait_list: &[Event],
    ) -> Result<Event> {
        self.copy_to(dst, Role::Host, blocking, wait_list, "copy_host_to")
    }

    /// Copy this buffer's device allocation into `dst`'s device allocation.
    pub fn copy_device_to(
        &self,
        dst: &ComputeBuffer<T>,
        blocking: bool,
        wait_list: &[Event],
    ) -> Result<Event> {
        self.copy_to(dst, Role::Device, blocking, wait_list, "copy_device_to")
    }

    fn map(
        &mut self,
        flags: MapFlags,
        blocking: bool,
        wait_list: &[Event],
    ) -> Result<(*mut u8, Event)> {
        self.require(Role::Host, "map_host")?;
        let (active, storage) = self.live()?;
        let mem = self.mem(storage, Role::Host)?;
        let wait = Event::ids(wait_list)?;
        let (ptr, id) = self.handles.core.driver().enqueue_map(
            active.queue,
            mem,
            blocking,
            flags,
            0,
            self.byte_size(),
            &wait,
        )?;
        Ok((ptr, self.event(&active, id, EventKind::Io)))
    }

    /// Map the host allocation and return a scoped view of it.
    pub fn map_host(&mut self, flags: MapFlags) -> Result<Accessor<'_, T>> {
        let (ptr, _) = self.map(flags, true, &[])?;
        Accessor::new(self, ptr)
    }

    /// Start mapping the host allocation without blocking. The view becomes
    /// usable through [`PendingAccessor::wait`].
    pub fn map_host_nonblocking(
        &mut self,
        flags: MapFlags,
        wait_list: &[Event],
    ) -> Result<PendingAccessor<'_, T>> {
        let (ptr, event) = self.map(flags, false, wait_list)?;
        Ok(PendingAccessor::new(Accessor::new(self, ptr)?, event))
    }

    /// Unmap a pointer returned by `map`.
    fn unmap_host(&self, ptr: *mut u8) -> Result<Event> {
        let (active, storage) = self.live()?;
        let mem = self.mem(storage, Role::Host)?;
        let id = self
            .handles
            .core
            .driver()
            .enqueue_unmap(active.queue, mem, ptr, &[])?;
        Ok(self.event(&active, id, EventKind::Io))
    }

    /// Release every allocation once. Later calls do nothing.
    pub fn release(&mut self) -> Result<()> {
        self.handles.release()
    }

    /// Whether the allocations have been released.
    pub fn is_released(&self) -> bool {
        self.handles.storage.get().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_roles() {
        assert!(Placement::HostOnly.has_host());
        assert!(!Placement::HostOnly.has_device());
        assert!(Placement::DeviceOnly.has_device());
        assert!(Placement::HostAndDevice.has_host() && Placement::HostAndDevice.has_device());
    }

    #[test]
    fn unified_storage_serves_both_roles_once() {
        let storage = Storage::Unified(MemId(4));
        assert_eq!(storage.host(), Some(MemId(4)));
        assert_eq!(storage.device(), Some(MemId(4)));
        assert_eq!(storage.allocations(), vec![MemId(4)]);
    }

    #[test]
    fn split_storage_lists_present_allocations() {
        let storage = Storage::Split {
            host: None,
            device: Some(MemId(9)),
        };
        assert_eq!(storage.host(), None);
        assert_eq!(storage.allocations(), vec![MemId(9)]);
    }
}
