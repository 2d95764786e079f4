//! The device context every buffer, kernel and program hangs off.
//!
//! A [`Core`] owns one device, one context and one in-order command queue.
//! It is a cheap reference-counted handle: buffers, kernels and programs keep
//! a clone, so the context outlives them unless torn down explicitly with
//! [`Core::deinit`]. Events only hold it weakly, since recorded events live
//! in the core's own timing sets. Teardown releases every live resource
//! first, then the queue, the context and the device.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::driver::{ContextId, DeviceId, Driver, DriverResult, PlatformInfo, QueueId, Status};
use crate::error::{ClkitError, Result};
use crate::event::Event;

/// Something holding driver handles that must be released before its
/// context goes away.
pub(crate) trait Releasable {
    fn release_for_deinit(&self, driver: &dyn Driver);
}

enum Hook {
    User(Box<dyn FnOnce()>),
    Resource(Weak<dyn Releasable>),
}

impl Hook {
    fn is_live(&self) -> bool {
        match self {
            Self::User(_) => true,
            Self::Resource(weak) => weak.strong_count() > 0,
        }
    }
}

const MIN_PRUNE_THRESHOLD: usize = 64;

/// Handles of the initialized device.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Active {
    pub device: DeviceId,
    pub context: ContextId,
    pub queue: QueueId,
    pub unified: bool,
    pub generation: u64,
}

#[derive(Debug)]
struct DeviceState {
    platform: PlatformInfo,
    device_name: String,
    active: Active,
}

/// Which timing set an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    /// Host/device transfers, reads, writes, maps and unmaps.
    Io,
    /// Kernel launches and buffer-to-buffer copies.
    Kernel,
}

#[derive(Default)]
struct TimingSets {
    io: Vec<Event>,
    kernel: Vec<Event>,
}

/// Device time spent per event set since the last measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingReport {
    pub io_ns: u64,
    pub kernel_ns: u64,
}

impl TimingReport {
    pub fn total_ns(&self) -> u64 {
        self.io_ns.saturating_add(self.kernel_ns)
    }
}

impl fmt::Display for TimingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "io {:.3} ms, kernels {:.3} ms",
            self.io_ns as f64 / 1e6,
            self.kernel_ns as f64 / 1e6
        )
    }
}

struct CoreInner {
    driver: Rc<dyn Driver>,
    config: CoreConfig,
    state: RefCell<Option<DeviceState>>,
    hooks: RefCell<Vec<Hook>>,
    prune_at: Cell<usize>,
    timing: RefCell<TimingSets>,
    generation: Cell<u64>,
    mapped_views: Cell<usize>,
}

impl CoreInner {
    fn deinit(&self) -> Result<()> {
        if self.state.borrow().is_none() {
            return Ok(());
        }
        let count = self.mapped_views.get();
        if count > 0 {
            return Err(ClkitError::MappedViewsAlive { count });
        }

        // Hooks may touch the core, so no borrow is held while they run.
        let hooks = std::mem::take(&mut *self.hooks.borrow_mut());
        self.prune_at.set(MIN_PRUNE_THRESHOLD);
        let count = hooks.len();
        for hook in hooks {
            match hook {
                Hook::User(f) => f(),
                Hook::Resource(weak) => {
                    if let Some(resource) = weak.upgrade() {
                        resource.release_for_deinit(self.driver.as_ref());
                    }
                }
            }
        }
        debug!("ran {count} deinit hook(s)");

        let timing = std::mem::take(&mut *self.timing.borrow_mut());
        drop(timing);

        let Some(state) = self.state.borrow_mut().take() else {
            return Ok(());
        };
        let active = state.active;
        let results = [
            self.driver.release_queue(active.queue),
            self.driver.release_context(active.context),
            self.driver.release_device(active.device),
        ];
        info!("released compute device '{}'", state.device_name);
        for result in results {
            result?;
        }
        Ok(())
    }
}

impl Drop for CoreInner {
    fn drop(&mut self) {
        if let Err(e) = self.deinit() {
            warn!("compute core teardown failed: {e}");
        }
    }
}

/// Handle to the compute device context.
#[derive(Clone)]
pub struct Core {
    inner: Rc<CoreInner>,
}

/// Non-owning [`Core`] handle, for things the core itself keeps alive.
#[derive(Clone)]
pub(crate) struct WeakCore(Weak<CoreInner>);

impl WeakCore {
    pub(crate) fn upgrade(&self) -> Option<Core> {
        self.0.upgrade().map(|inner| Core { inner })
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Core")
            .field("driver", &self.inner.driver.name())
            .field("device", &state.as_ref().map(|s| s.device_name.as_str()))
            .field("generation", &self.inner.generation.get())
            .finish()
    }
}

impl Core {
    /// Create an uninitialized core. Nothing touches the driver until
    /// [`Core::init`].
    pub fn new(driver: Rc<dyn Driver>, config: CoreConfig) -> Self {
        Self {
            inner: Rc::new(CoreInner {
                driver,
                config,
                state: RefCell::new(None),
                hooks: RefCell::new(Vec::new()),
                prune_at: Cell::new(MIN_PRUNE_THRESHOLD),
                timing: RefCell::new(TimingSets::default()),
                generation: Cell::new(0),
                mapped_views: Cell::new(0),
            }),
        }
    }

    /// Create and initialize a core.
    pub fn open(driver: Rc<dyn Driver>, config: CoreConfig) -> Result<Self> {
        let core = Self::new(driver, config);
        core.init()?;
        Ok(core)
    }

    /// Select a platform and device, then create the context and queue.
    pub fn init(&self) -> Result<()> {
        if self.is_initialized() {
            warn!("compute core already initialized; keeping the existing context");
            return Err(ClkitError::AlreadyInitialized);
        }

        let driver = &self.inner.driver;
        let config = &self.inner.config;

        let start = Instant::now();
        let (platform, device) = self.select_device()?;
        debug!("device selection took {:?}", start.elapsed());

        let device_name = driver.device_name(device)?;
        let unified = driver.host_unified_memory(device)?;

        let start = Instant::now();
        let context = driver.create_context(device)?;
        debug!("context creation took {:?}", start.elapsed());

        let start = Instant::now();
        let queue = match driver.create_queue(context, device, config.collect_time) {
            Ok(queue) => queue,
            Err(e) => {
                if let Err(release) = driver.release_context(context) {
                    warn!("failed to release context after queue error: {release}");
                }
                return Err(e.into());
            }
        };
        debug!("queue creation took {:?}", start.elapsed());

        let generation = self.inner.generation.get() + 1;
        self.inner.generation.set(generation);
        info!(
            platform = %platform.name,
            device = %device_name,
            unified,
            profiling = config.collect_time,
            "compute core initialized"
        );
        *self.inner.state.borrow_mut() = Some(DeviceState {
            platform,
            device_name,
            active: Active {
                device,
                context,
                queue,
                unified,
                generation,
            },
        });
        Ok(())
    }

    fn select_device(&self) -> Result<(PlatformInfo, DeviceId)> {
        let driver = &self.inner.driver;
        let config = &self.inner.config;
        let platforms = driver.platforms()?;
        if platforms.is_empty() {
            return Err(ClkitError::NoPlatforms);
        }

        let (preferred, avoided): (Vec<_>, Vec<_>) = platforms
            .into_iter()
            .partition(|p| !config.is_avoided(&p.name));
        for platform in preferred.into_iter().chain(avoided) {
            debug!("scanning platform '{}' ({})", platform.name, platform.version);
            let devices = match driver.gpu_devices(platform.id) {
                Ok(devices) => devices,
                Err(e) if e.status == Status::DEVICE_NOT_FOUND => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            if let Some(device) = devices.get(config.device_index) {
                if config.is_avoided(&platform.name) {
                    warn!("using avoided platform '{}': no alternative has a GPU", platform.name);
                }
                return Ok((platform, *device));
            }
        }
        Err(ClkitError::NoDevice {
            index: config.device_index,
        })
    }

    /// Release every live resource, then the queue, context and device.
    /// A no-op when not initialized. Fails while any mapped accessor is
    /// alive, since its memory would be freed under it.
    pub fn deinit(&self) -> Result<()> {
        self.inner.deinit()
    }

    /// Register a callback run once by the next [`Core::deinit`], in
    /// registration order.
    pub fn on_deinit(&self, hook: impl FnOnce() + 'static) {
        self.inner.hooks.borrow_mut().push(Hook::User(Box::new(hook)));
    }

    pub(crate) fn downgrade(&self) -> WeakCore {
        WeakCore(Rc::downgrade(&self.inner))
    }

    pub(crate) fn track(&self, resource: Weak<dyn Releasable>) {
        let mut hooks = self.inner.hooks.borrow_mut();
        if hooks.len() >= self.inner.prune_at.get() {
            hooks.retain(Hook::is_live);
            self.inner
                .prune_at
                .set((hooks.len() * 2).max(MIN_PRUNE_THRESHOLD));
        }
        hooks.push(Hook::Resource(resource));
    }

    /// Block until everything enqueued so far has completed.
    pub fn wait_queue(&self) -> Result<()> {
        let active = self.active()?;
        self.inner.driver.finish(active.queue)?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.borrow().is_some()
    }

    pub fn device_name(&self) -> Result<String> {
        self.with_state(|s| s.device_name.clone())
    }

    pub fn platform_name(&self) -> Result<String> {
        self.with_state(|s| s.platform.name.clone())
    }

    pub fn platform_version(&self) -> Result<String> {
        self.with_state(|s| s.platform.version.clone())
    }

    /// Whether the device shares physical memory with the host.
    pub fn is_unified_memory(&self) -> Result<bool> {
        self.with_state(|s| s.active.unified)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn driver(&self) -> &dyn Driver {
        self.inner.driver.as_ref()
    }

    /// Sum device time of the recorded events, then forget them.
    ///
    /// Waits for the queue first so every recorded event has timestamps.
    /// On error the recorded events are kept.
    pub fn measure_time(&self) -> Result<TimingReport> {
        self.wait_queue()?;
        let (io, kernel) = {
            let sets = self.inner.timing.borrow();
            (sets.io.clone(), sets.kernel.clone())
        };
        let sum = |events: &[Event]| -> Result<u64> {
            events
                .iter()
                .try_fold(0u64, |acc, e| Ok(acc.saturating_add(e.elapsed_ns()?)))
        };
        let report = TimingReport {
            io_ns: sum(&io)?,
            kernel_ns: sum(&kernel)?,
        };
        self.reset_time();
        debug!(
            io_events = io.len(),
            kernel_events = kernel.len(),
            "measured {report}"
        );
        Ok(report)
    }

    /// Forget recorded events without measuring them.
    pub fn reset_time(&self) {
        let mut sets = self.inner.timing.borrow_mut();
        sets.io.clear();
        sets.kernel.clear();
    }

    pub(crate) fn record(&self, kind: EventKind, event: &Event) {
        if !self.inner.config.collect_time {
            return;
        }
        let mut sets = self.inner.timing.borrow_mut();
        match kind {
            EventKind::Io => sets.io.push(event.clone()),
            EventKind::Kernel => sets.kernel.push(event.clone()),
        }
    }

    pub(crate) fn active(&self) -> Result<Active> {
        self.with_state(|s| s.active)
    }

    fn with_state<R>(&self, f: impl FnOnce(&DeviceState) -> R) -> Result<R> {
        self.inner
            .state
            .borrow()
            .as_ref()
            .map(f)
            .ok_or(ClkitError::NotInitialized)
    }

    /// Whether handles created under `generation` are still valid.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.inner
            .state
            .borrow()
            .as_ref()
            .is_some_and(|s| s.active.generation == generation)
    }

    /// Run a release call if `generation` is still live; otherwise the
    /// handle died with its context and is left alone.
    pub(crate) fn release_handle(
        &self,
        generation: u64,
        what: &str,
        release: impl FnOnce(&dyn Driver) -> DriverResult<()>,
    ) -> Result<()> {
        if self.is_current(generation) {
            release(self.driver())?;
        } else {
            warn!("{what} outlived its compute context; skipping release");
        }
        Ok(())
    }

    pub(crate) fn view_mapped(&self) {
        self.inner.mapped_views.set(self.inner.mapped_views.get() + 1);
    }

    pub(crate) fn view_unmapped(&self) {
        let count = self.inner.mapped_views.get();
        self.inner.mapped_views.set(count.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{EventId, HostDriver};

    #[test]
    fn uninitialized_core_reports_not_initialized() {
        let core = Core::new(Rc::new(HostDriver::new()), CoreConfig::default());
        assert!(!core.is_initialized());
        assert!(matches!(core.device_name(), Err(ClkitError::NotInitialized)));
        assert!(matches!(core.wait_queue(), Err(ClkitError::NotInitialized)));
        assert!(core.deinit().is_ok());
    }

    #[test]
    fn timing_report_display_in_milliseconds() {
        let report = TimingReport {
            io_ns: 1_500_000,
            kernel_ns: 250_000,
        };
        assert_eq!(report.to_string(), "io 1.500 ms, kernels 0.250 ms");
        assert_eq!(report.total_ns(), 1_750_000);
    }

    #[test]
    fn failed_measurement_keeps_recorded_events() {
        let config = CoreConfig {
            collect_time: true,
            ..CoreConfig::default()
        };
        let core = Core::open(Rc::new(HostDriver::new()), config).unwrap();
        let generation = core.active().unwrap().generation;
        let bogus = Event::track(&core, generation, EventId(u64::MAX), EventKind::Kernel);

        let err = core.measure_time().unwrap_err();
        assert_eq!(err.status(), Some(Status::INVALID_EVENT));
        assert_eq!(core.inner.timing.borrow().kernel.len(), 1);

        core.reset_time();
        drop(bogus);
        assert_eq!(core.measure_time().unwrap(), TimingReport::default());
    }

    #[test]
    fn dead_resources_are_pruned() {
        struct Dummy;
        impl Releasable for Dummy {
            fn release_for_deinit(&self, _driver: &dyn Driver) {}
        }

        let core = Core::open(Rc::new(HostDriver::new()), CoreConfig::default()).unwrap();
        for _ in 0..(MIN_PRUNE_THRESHOLD * 3) {
            let dummy: Rc<dyn Releasable> = Rc::new(Dummy);
            core.track(Rc::downgrade(&dummy));
        }
        assert!(core.inner.hooks.borrow().len() <= MIN_PRUNE_THRESHOLD + 1);
    }
}
