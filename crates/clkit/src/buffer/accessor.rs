//! Scoped views of a mapped host allocation.

use std::fmt;
use std::mem::{align_of, size_of};
use std::ops::{Index, IndexMut};

use tracing::warn;

use super::ComputeBuffer;
use crate::driver::{DriverError, Status};
use crate::element::Element;
use crate::error::Result;
use crate::event::Event;

/// A mapped view of a buffer's host allocation.
///
/// The view holds the buffer borrowed for its whole life, so at most one
/// accessor per buffer exists at a time. It unmaps when dropped; after
/// [`Accessor::unmap`] it is empty.
pub struct Accessor<'a, T: Element> {
    buffer: &'a ComputeBuffer<T>,
    ptr: *mut T,
    len: usize,
    mapped: bool,
}

impl<'a, T: Element> Accessor<'a, T> {
    pub(super) fn new(buffer: &'a ComputeBuffer<T>, ptr: *mut u8) -> Result<Self> {
        let mut accessor = Self {
            buffer,
            ptr: ptr.cast::<T>(),
            len: buffer.len(),
            mapped: true,
        };
        buffer.core().view_mapped();
        if ptr.is_null() || (ptr as usize) % align_of::<T>() != 0 {
            // Give the mapping back before reporting the bad pointer.
            accessor.len = 0;
            if let Err(e) = accessor.unmap() {
                warn!("failed to unmap rejected mapping: {e}");
            }
            return Err(DriverError::new("clEnqueueMapBuffer", Status::MAP_FAILURE).into());
        }
        Ok(accessor)
    }

    /// Number of visible elements; zero once unmapped.
    pub fn len(&self) -> usize {
        if self.mapped {
            self.len
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn as_slice(&self) -> &[T] {
        if !self.mapped || self.len == 0 {
            return &[];
        }
        // SAFETY: the driver mapped `len * size_of::<T>()` bytes at `ptr`,
        // alignment was checked in `new`, and the mapping stays valid until
        // `unmap`, which clears `mapped`. The buffer is borrowed for 'a and
        // the core refuses to tear down while a view is mapped.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if !self.mapped || self.len == 0 {
            return &mut [];
        }
        // SAFETY: as in `as_slice`; `&mut self` makes this the only live
        // reference into the mapping.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.as_slice().get(index).copied()
    }

    /// Store `value` at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn set(&mut self, index: usize, value: T) {
        self.as_mut_slice()[index] = value;
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Unmap the view. Returns the unmap event the first time and `None`
    /// afterwards.
    pub fn unmap(&mut self) -> Result<Option<Event>> {
        if !self.mapped {
            return Ok(None);
        }
        self.mapped = false;
        self.buffer.core().view_unmapped();
        let event = self.buffer.unmap_host(self.ptr.cast::<u8>())?;
        Ok(Some(event))
    }

    /// Size of the view in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * size_of::<T>()
    }
}

impl<T: Element> Drop for Accessor<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            warn!("failed to unmap buffer view: {e}");
        }
    }
}

impl<T: Element> Index<usize> for Accessor<'_, T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<T: Element> IndexMut<usize> for Accessor<'_, T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}

impl<T: Element> fmt::Debug for Accessor<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("len", &self.len())
            .field("mapped", &self.mapped)
            .finish()
    }
}

/// A mapping still in flight. [`PendingAccessor::wait`] blocks until it
/// completes and hands out the view. Dropping it unmaps.
#[derive(Debug)]
pub struct PendingAccessor<'a, T: Element> {
    accessor: Accessor<'a, T>,
    event: Event,
}

impl<'a, T: Element> PendingAccessor<'a, T> {
    pub(super) fn new(accessor: Accessor<'a, T>, event: Event) -> Self {
        Self { accessor, event }
    }

    /// The map operation's event, for use in wait lists.
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn wait(self) -> Result<Accessor<'a, T>> {
        self.event.wait()?;
        Ok(self.accessor)
    }
}
