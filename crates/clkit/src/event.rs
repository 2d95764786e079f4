//! Completion tokens for enqueued device work.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use tracing::warn;

use crate::core::{Core, EventKind, Releasable, WeakCore};
use crate::driver::{Driver, EventId, ProfilingInfo};
use crate::error::{ClkitError, Result};

/// Events hold the core weakly: the core's timing sets hold events.
struct EventInner {
    core: WeakCore,
    generation: u64,
    id: Cell<Option<EventId>>,
}

impl EventInner {
    fn release(&self) -> Result<()> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        match self.core.upgrade() {
            Some(core) => core.release_handle(self.generation, "event", |d| d.release_event(id)),
            None => Ok(()),
        }
    }
}

impl Releasable for EventInner {
    fn release_for_deinit(&self, driver: &dyn Driver) {
        if let Some(id) = self.id.take() {
            if let Err(e) = driver.release_event(id) {
                warn!("failed to release event: {e}");
            }
        }
    }
}

impl Drop for EventInner {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to release event: {e}");
        }
    }
}

/// A pending or finished device operation.
///
/// Clones share one driver event, released when the last clone drops.
#[derive(Clone)]
pub struct Event {
    inner: Rc<EventInner>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Event").field(&self.inner.id.get()).finish()
    }
}

impl Event {
    /// Wrap a driver event created under `generation` and record it in the
    /// core's timing set for `kind`.
    pub(crate) fn track(core: &Core, generation: u64, id: EventId, kind: EventKind) -> Self {
        let inner = Rc::new(EventInner {
            core: core.downgrade(),
            generation,
            id: Cell::new(Some(id)),
        });
        let weak = Rc::downgrade(&inner);
        core.track(weak);
        let event = Self { inner };
        core.record(kind, &event);
        event
    }

    /// The driver handle, while the owning context is alive.
    pub fn id(&self) -> Option<EventId> {
        self.inner.id.get()
    }

    /// The owning core and the driver handle, if both are still valid.
    fn live(&self) -> Result<(Core, EventId)> {
        let core = self.inner.core.upgrade().ok_or(ClkitError::NotInitialized)?;
        match self.inner.id.get() {
            Some(id) if core.is_current(self.inner.generation) => Ok((core, id)),
            _ => Err(ClkitError::NotInitialized),
        }
    }

    /// Block until the operation completes.
    pub fn wait(&self) -> Result<()> {
        let (core, id) = self.live()?;
        core.driver().wait_for_events(&[id])?;
        Ok(())
    }

    /// Device time between start and end of the operation, in nanoseconds.
    /// Requires a profiling-enabled queue.
    pub fn elapsed_ns(&self) -> Result<u64> {
        let (core, id) = self.live()?;
        let driver = core.driver();
        let start = driver.event_profiling(id, ProfilingInfo::Start)?;
        let end = driver.event_profiling(id, ProfilingInfo::End)?;
        Ok(end.saturating_sub(start))
    }

    /// Block until every event in `events` completes.
    pub fn wait_all(events: &[Event]) -> Result<()> {
        let Some(first) = events.first() else {
            return Ok(());
        };
        let (core, _) = first.live()?;
        let ids = Self::ids(events)?;
        core.driver().wait_for_events(&ids)?;
        Ok(())
    }

    /// Driver ids of a wait list.
    pub(crate) fn ids(events: &[Event]) -> Result<Vec<EventId>> {
        events.iter().map(|e| e.live().map(|(_, id)| id)).collect()
    }
}
