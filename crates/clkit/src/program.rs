//! Program loading and building.

use std::cell::Cell;
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::core::{Core, Releasable};
use crate::driver::{Driver, ProgramId};
use crate::error::{ClkitError, Result};
use crate::kernel::{Kernel, NdRange};

/// Build option that makes drivers keep kernel argument metadata.
pub const ARG_INFO_OPTION: &str = "-cl-kernel-arg-info";

const BUILD_BANNER: &str = "=============== OpenCL Program Build Info ================";

struct ProgramHandle {
    core: Core,
    generation: u64,
    id: Cell<Option<ProgramId>>,
}

impl ProgramHandle {
    fn release(&self) -> Result<()> {
        match self.id.take() {
            Some(id) => self
                .core
                .release_handle(self.generation, "program", |d| d.release_program(id)),
            None => Ok(()),
        }
    }
}

impl Releasable for ProgramHandle {
    fn release_for_deinit(&self, driver: &dyn Driver) {
        if let Some(id) = self.id.take() {
            if let Err(e) = driver.release_program(id) {
                warn!("failed to release program: {e}");
            }
        }
    }
}

impl Drop for ProgramHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to release program: {e}");
        }
    }
}

/// A program built for the core's device.
pub struct ComputeProgram {
    handle: Rc<ProgramHandle>,
}

impl fmt::Debug for ComputeProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ComputeProgram")
            .field(&self.handle.id.get())
            .finish()
    }
}

impl ComputeProgram {
    /// Build `source` with kernel argument info plus the configured extra
    /// options.
    pub fn from_source(core: &Core, source: &str) -> Result<Self> {
        let active = core.active()?;
        let driver = core.driver();
        let id = driver.create_program(active.context, source)?;
        let handle = Rc::new(ProgramHandle {
            core: core.clone(),
            generation: active.generation,
            id: Cell::new(Some(id)),
        });
        let weak = Rc::downgrade(&handle);
        core.track(weak);

        let options = core.config().build_options();
        let start = Instant::now();
        if let Err(e) = driver.build_program(id, active.device, &options) {
            let log = driver
                .build_log(id, active.device)
                .unwrap_or_else(|log_err| format!("<build log unavailable: {log_err}>"));
            eprintln!("{BUILD_BANNER}");
            eprintln!("{log}");
            eprintln!("{BUILD_BANNER}");
            error!("program build failed with {}:\n{log}", e.status);
            return Err(ClkitError::Build {
                status: e.status,
                log,
            });
        }
        debug!("program built in {:?} with options '{options}'", start.elapsed());
        Ok(Self { handle })
    }

    /// Read `path`, prepend `prefix` and a newline, and build the result.
    /// The prefix is the place for `#define`s.
    pub fn from_file(core: &Core, path: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path).map_err(|source| ClkitError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("loaded program source {}", path.display());
        Self::from_source(core, &format!("{prefix}\n{body}"))
    }

    fn live_id(&self) -> Result<ProgramId> {
        match self.handle.id.get() {
            Some(id) if self.handle.core.is_current(self.handle.generation) => Ok(id),
            _ => Err(ClkitError::NotInitialized),
        }
    }

    /// Create kernel `name` launching over `global` with work-group `local`
    /// (empty for driver choice).
    pub fn kernel(&self, name: &str, global: &[usize], local: &[usize]) -> Result<Kernel> {
        let id = self.live_id()?;
        Kernel::create(
            &self.handle.core,
            self.handle.generation,
            id,
            name,
            NdRange::new(global).with_local(local),
        )
    }

    /// Device binaries of the built program, one per device.
    pub fn binaries(&self) -> Result<Vec<Vec<u8>>> {
        let id = self.live_id()?;
        Ok(self.handle.core.driver().program_binaries(id)?)
    }

    /// Release the driver program. Later calls do nothing.
    pub fn release(&mut self) -> Result<()> {
        self.handle.release()
    }
}
