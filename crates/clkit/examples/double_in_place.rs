//! Doubles 1024 integers on the first GPU and prints both ends of the result.
//!
//! Runs on the host reference driver by default. Build with
//! `--features opencl` to use the system OpenCL runtime instead.
//!
//! ```text
//! RUST_LOG=clkit=debug CLKIT_COLLECT_TIME=1 cargo run --example double_in_place
//! ```

use std::path::Path;
use std::rc::Rc;

use anyhow::Context;
use clkit::{
    ComputeBuffer, ComputeProgram, Core, CoreConfig, Driver, MemFlags, Placement,
    PREFERRED_LOCAL_1D,
};

const LEN: usize = 1024;

#[cfg(not(feature = "opencl"))]
fn driver() -> Rc<dyn Driver> {
    let driver = clkit::HostDriver::new();
    driver.register_kernel("double_in_place", |launch| {
        let n = launch.scalar::<u32>(1)? as usize;
        let ids: Vec<usize> = launch.global_ids().map(|id| id[0]).collect();
        let data = launch.buffer_mut::<i32>(0)?;
        for i in ids.into_iter().filter(|i| *i < n) {
            data[i] *= 2;
        }
        Ok(())
    });
    Rc::new(driver)
}

#[cfg(feature = "opencl")]
fn driver() -> Rc<dyn Driver> {
    Rc::new(clkit::OpenClDriver::new())
}

fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = CoreConfig::from_env().context("invalid CLKIT_* configuration")?;
    let core = Core::open(driver(), config).context("no usable compute device")?;
    println!(
        "device: {} on {} ({})",
        core.device_name()?,
        core.platform_name()?,
        core.platform_version()?
    );

    let input: Vec<i32> = (0..LEN as i32).collect();
    let buf = ComputeBuffer::from_slice(&core, &input, Placement::HostAndDevice, MemFlags::READ_WRITE)?;

    let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("kernels/double.cl");
    let program = ComputeProgram::from_file(&core, &source, "#define FACTOR 2")?;
    let mut kernel = program.kernel("double_in_place", &[LEN], &[PREFERRED_LOCAL_1D])?;
    kernel.push_arg(&buf)?;
    kernel.push_arg(LEN as u32)?;
    let done = kernel.execute(false, &[])?;

    buf.to_host(true, &[done])?;
    println!("first: {:?}", buf.first_elements(4)?);
    println!("last:  {:?}", buf.last_elements(4)?);

    if core.config().collect_time {
        println!("timing: {}", core.measure_time()?);
    }
    Ok(())
}
