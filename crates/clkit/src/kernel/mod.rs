//! Typed kernel argument binding and dispatch.
//!
//! Every argument is checked against the signature the device reports for
//! that slot before anything reaches the driver: the element type must match
//! and a buffer may only go where the kernel expects a pointer. The signature
//! is re-queried on every set, never cached.

mod arg_info;

use std::cell::Cell;
use std::fmt;
use std::mem::size_of;
use std::rc::Rc;

use tracing::{debug, warn};

pub use arg_info::{lookup_type, ArgInfo};

use crate::buffer::ComputeBuffer;
use crate::core::{Core, EventKind, Releasable};
use crate::driver::{ArgValue, Driver, DriverError, KernelId, ProgramId, Status};
use crate::element::Element;
use crate::error::{ClkitError, Result};
use crate::event::Event;

/// Work-group size that suits most 1-D kernels.
pub const PREFERRED_LOCAL_1D: usize = 32;

/// Global size, work-group size and offset of a launch, 1 to 3 dimensions.
///
/// Empty `local` or `offset` lets the driver choose. The dimensions of the
/// three parts are not cross-checked here; the driver reports mismatches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NdRange {
    pub global: Vec<usize>,
    pub local: Vec<usize>,
    pub offset: Vec<usize>,
}

impl NdRange {
    pub fn new(global: &[usize]) -> Self {
        Self {
            global: global.to_vec(),
            ..Self::default()
        }
    }

    /// 1-D range rounded up to a multiple of `local`.
    pub fn linear(len: usize, local: usize) -> Self {
        let local = local.max(1);
        Self {
            global: vec![len.div_ceil(local) * local],
            local: vec![local],
            offset: Vec::new(),
        }
    }

    pub fn with_local(mut self, local: &[usize]) -> Self {
        self.local = local.to_vec();
        self
    }

    pub fn with_offset(mut self, offset: &[usize]) -> Self {
        self.offset = offset.to_vec();
        self
    }

    pub fn work_dim(&self) -> usize {
        self.global.len()
    }

    /// Check each part has at most three dimensions and a global size exists.
    pub fn validate(&self) -> Result<()> {
        if self.global.is_empty() || self.global.len() > 3 {
            return Err(ClkitError::InvalidRange(format!(
                "global range must have 1 to 3 dimensions, got {}",
                self.global.len()
            )));
        }
        if self.local.len() > 3 {
            return Err(ClkitError::InvalidRange(format!(
                "local range has {} dimensions",
                self.local.len()
            )));
        }
        if self.offset.len() > 3 {
            return Err(ClkitError::InvalidRange(format!(
                "offset has {} dimensions",
                self.offset.len()
            )));
        }
        Ok(())
    }
}

/// A value that can be bound to a kernel parameter.
pub trait KernelArg {
    /// Check this value against the parameter at `index` and produce the
    /// driver payload.
    fn to_arg_value(&self, info: &ArgInfo, index: u32) -> Result<ArgValue>;
}

fn mismatch(info: &ArgInfo, index: u32, actual: String) -> ClkitError {
    ClkitError::ArgTypeMismatch {
        index,
        expected: info.device_spelling(),
        actual,
    }
}

macro_rules! impl_scalar_arg {
    ($($ty:ty),* $(,)?) => {
        $(
            impl KernelArg for $ty {
                fn to_arg_value(&self, info: &ArgInfo, index: u32) -> Result<ArgValue> {
                    if info.is_pointer || info.data_type != <$ty as Element>::DATA_TYPE {
                        return Err(mismatch(info, index, <$ty as Element>::DATA_TYPE.to_string()));
                    }
                    Ok(ArgValue::Scalar(self.into_scalar()))
                }
            }
        )*
    };
}

impl_scalar_arg!(f32, f64, i32, u32, u8, i64);

impl<T: Element> KernelArg for &ComputeBuffer<T> {
    fn to_arg_value(&self, info: &ArgInfo, index: u32) -> Result<ArgValue> {
        if !info.is_pointer || info.is_local() || info.data_type != T::DATA_TYPE {
            return Err(mismatch(info, index, format!("buffer of {}", T::DATA_TYPE)));
        }
        Ok(ArgValue::Mem(self.device_mem()?))
    }
}

struct KernelHandle {
    core: Core,
    generation: u64,
    id: Cell<Option<KernelId>>,
}

impl KernelHandle {
    fn release(&self) -> Result<()> {
        match self.id.take() {
            Some(id) => self
                .core
                .release_handle(self.generation, "kernel", |d| d.release_kernel(id)),
            None => Ok(()),
        }
    }
}

impl Releasable for KernelHandle {
    fn release_for_deinit(&self, driver: &dyn Driver) {
        if let Some(id) = self.id.take() {
            if let Err(e) = driver.release_kernel(id) {
                warn!("failed to release kernel: {e}");
            }
        }
    }
}

impl Drop for KernelHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to release kernel: {e}");
        }
    }
}

/// A kernel with a launch range and an argument cursor.
pub struct Kernel {
    handle: Rc<KernelHandle>,
    name: String,
    range: NdRange,
    cursor: u32,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("id", &self.handle.id.get())
            .field("range", &self.range)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl Kernel {
    pub(crate) fn create(
        core: &Core,
        generation: u64,
        program: ProgramId,
        name: &str,
        range: NdRange,
    ) -> Result<Self> {
        range.validate()?;
        let id = core.driver().create_kernel(program, name)?;
        let handle = Rc::new(KernelHandle {
            core: core.clone(),
            generation,
            id: Cell::new(Some(id)),
        });
        let weak = Rc::downgrade(&handle);
        core.track(weak);
        debug!("created kernel '{name}' over {:?}", range.global);
        Ok(Self {
            handle,
            name: name.to_string(),
            range,
            cursor: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn range(&self) -> &NdRange {
        &self.range
    }

    pub fn set_range(&mut self, range: NdRange) -> Result<()> {
        range.validate()?;
        self.range = range;
        Ok(())
    }

    fn live_id(&self) -> Result<KernelId> {
        match self.handle.id.get() {
            Some(id) if self.handle.core.is_current(self.handle.generation) => Ok(id),
            _ => Err(ClkitError::NotInitialized),
        }
    }

    /// Query the device's signature for parameter `index`.
    pub fn arg_info(&self, index: u32) -> Result<ArgInfo> {
        let id = self.live_id()?;
        let driver = self.handle.core.driver();
        let type_name = driver.kernel_arg_type_name(id, index)?;
        let qualifier = driver.kernel_arg_address_qualifier(id, index)?;
        ArgInfo::parse(&type_name, qualifier)
    }

    /// Bind `value` to parameter `index` after checking it against the
    /// device-reported signature.
    pub fn set_arg<A: KernelArg>(&mut self, index: u32, value: A) -> Result<()> {
        let info = self.arg_info(index)?;
        let arg = value.to_arg_value(&info, index)?;
        self.handle
            .core
            .driver()
            .set_kernel_arg(self.live_id()?, index, arg)?;
        Ok(())
    }

    /// Reserve `count` elements of `__local` memory for parameter `index`.
    pub fn set_local<T: Element>(&mut self, index: u32, count: usize) -> Result<()> {
        let info = self.arg_info(index)?;
        if !info.is_pointer || !info.is_local() || info.data_type != T::DATA_TYPE {
            return Err(mismatch(
                &info,
                index,
                format!("__local *{}", T::DATA_TYPE),
            ));
        }
        let bytes = count
            .checked_mul(size_of::<T>())
            .ok_or(DriverError::new("clSetKernelArg", Status::INVALID_ARG_SIZE))?;
        self.handle
            .core
            .driver()
            .set_kernel_arg(self.live_id()?, index, ArgValue::Local(bytes))?;
        Ok(())
    }

    /// Bind `value` at the cursor and advance it. Returns the new cursor.
    /// The cursor stays put when binding fails.
    pub fn push_arg<A: KernelArg>(&mut self, value: A) -> Result<u32> {
        self.set_arg(self.cursor, value)?;
        self.cursor += 1;
        Ok(self.cursor)
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    /// Enqueue the kernel over its range.
    pub fn execute(&self, blocking: bool, wait_list: &[Event]) -> Result<Event> {
        let id = self.live_id()?;
        let core = &self.handle.core;
        let active = core.active()?;
        let wait = Event::ids(wait_list)?;
        let event_id = core.driver().enqueue_kernel(
            active.queue,
            id,
            &self.range.offset,
            &self.range.global,
            &self.range.local,
            &wait,
        )?;
        let event = Event::track(core, active.generation, event_id, EventKind::Kernel);
        if blocking {
            event.wait()?;
        }
        Ok(event)
    }

    /// Release the driver kernel. Later calls do nothing.
    pub fn release(&mut self) -> Result<()> {
        self.handle.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::AddressQualifier;

    fn info(type_name: &str, qualifier: AddressQualifier) -> ArgInfo {
        ArgInfo::parse(type_name, qualifier).unwrap()
    }

    #[test]
    fn scalar_must_match_element_type() {
        let uint = info("uint", AddressQualifier::Private);
        assert!(matches!(7u32.to_arg_value(&uint, 0), Ok(ArgValue::Scalar(_))));
        let err = 7i32.to_arg_value(&uint, 3).unwrap_err();
        match err {
            ClkitError::ArgTypeMismatch {
                index,
                expected,
                actual,
            } => {
                assert_eq!(index, 3);
                assert_eq!(expected, "uint");
                assert_eq!(actual, "i32");
            }
            other => panic!("expected ArgTypeMismatch, got {other}"),
        }
    }

    #[test]
    fn scalar_cannot_fill_pointer_slot() {
        let ptr = info("float*", AddressQualifier::Global);
        assert!(matches!(
            1.0f32.to_arg_value(&ptr, 0),
            Err(ClkitError::ArgTypeMismatch { .. })
        ));
    }

    #[test]
    fn linear_range_rounds_up() {
        let range = NdRange::linear(1000, PREFERRED_LOCAL_1D);
        assert_eq!(range.global, vec![1024]);
        assert_eq!(range.local, vec![32]);
        assert_eq!(range.work_dim(), 1);
    }

    #[test]
    fn range_dimensions_are_bounded() {
        assert!(NdRange::new(&[]).validate().is_err());
        assert!(NdRange::new(&[1, 1, 1, 1]).validate().is_err());
        assert!(NdRange::new(&[8]).with_local(&[1, 1, 1, 1]).validate().is_err());
        // Mismatched but bounded dimensions are left to the driver.
        assert!(NdRange::new(&[8, 8]).with_local(&[8]).validate().is_ok());
    }
}
