//! Tests for device selection, teardown ordering and event timing.

use std::cell::RefCell;
use std::rc::Rc;

use clkit::{
    ClkitError, ComputeBuffer, Core, CoreConfig, Event, HostDriver, MapFlags, MemFlags, Placement,
    Status, TimingReport,
};

// ── Test helpers ─────────────────────────────────────────────────────────────

fn open(driver: &Rc<HostDriver>, config: CoreConfig) -> clkit::Result<Core> {
    Core::open(driver.clone(), config)
}

fn timed() -> CoreConfig {
    CoreConfig {
        collect_time: true,
        ..CoreConfig::default()
    }
}

fn buffer(core: &Core, data: &[u32]) -> ComputeBuffer<u32> {
    ComputeBuffer::from_slice(core, data, Placement::HostAndDevice, MemFlags::READ_WRITE).unwrap()
}

// ── Initialization ───────────────────────────────────────────────────────────

#[test]
fn init_reports_the_selected_device() {
    let driver = Rc::new(
        HostDriver::builder()
            .platform_with_version("Acme", "OpenCL 3.0 Acme 1.2", 1)
            .build(),
    );
    let core = open(&driver, CoreConfig::default()).unwrap();
    assert!(core.is_initialized());
    assert_eq!(core.platform_name().unwrap(), "Acme");
    assert_eq!(core.platform_version().unwrap(), "OpenCL 3.0 Acme 1.2");
    assert_eq!(core.device_name().unwrap(), "Acme device 0");
    assert!(!core.is_unified_memory().unwrap());
    let stats = driver.stats();
    assert_eq!(stats.live_contexts, 1);
    assert_eq!(stats.live_queues, 1);
}

#[test]
fn second_init_is_rejected() {
    let driver = Rc::new(HostDriver::new());
    let core = open(&driver, CoreConfig::default()).unwrap();
    assert!(matches!(core.init(), Err(ClkitError::AlreadyInitialized)));
    assert_eq!(driver.stats().live_contexts, 1);
}

#[test]
fn avoided_platform_is_skipped_when_another_has_a_gpu() {
    let driver = Rc::new(
        HostDriver::builder()
            .platform("Clover", 1)
            .platform("rusticl", 1)
            .build(),
    );
    let core = open(&driver, CoreConfig::default()).unwrap();
    assert_eq!(core.platform_name().unwrap(), "rusticl");
}

#[test]
fn avoided_platform_is_used_as_last_resort() {
    let driver = Rc::new(
        HostDriver::builder()
            .platform("Clover", 1)
            .platform("NoGpu", 0)
            .build(),
    );
    let core = open(&driver, CoreConfig::default()).unwrap();
    assert_eq!(core.platform_name().unwrap(), "Clover");
}

#[test]
fn avoid_list_comes_from_config() {
    let driver = Rc::new(
        HostDriver::builder()
            .platform("First", 1)
            .platform("Second", 1)
            .build(),
    );
    let config = CoreConfig {
        avoid_platforms: vec!["First".into()],
        ..CoreConfig::default()
    };
    let core = open(&driver, config).unwrap();
    assert_eq!(core.platform_name().unwrap(), "Second");
}

#[test]
fn device_index_picks_among_gpus() {
    let driver = Rc::new(HostDriver::builder().platform("Multi", 3).build());
    let config = CoreConfig {
        device_index: 2,
        ..CoreConfig::default()
    };
    let core = open(&driver, config).unwrap();
    assert_eq!(core.device_name().unwrap(), "Multi device 2");

    let config = CoreConfig {
        device_index: 3,
        ..CoreConfig::default()
    };
    let err = open(&driver, config).unwrap_err();
    assert!(matches!(err, ClkitError::NoDevice { index: 3 }));
}

#[test]
fn platforms_without_gpus_give_no_device() {
    let driver = Rc::new(HostDriver::builder().platform("Empty", 0).build());
    let err = open(&driver, CoreConfig::default()).unwrap_err();
    assert!(matches!(err, ClkitError::NoDevice { index: 0 }));
    assert_eq!(driver.stats().live_contexts, 0);
}

#[test]
fn unified_memory_is_detected() {
    let driver = Rc::new(HostDriver::builder().unified_memory(true).build());
    let core = open(&driver, CoreConfig::default()).unwrap();
    assert!(core.is_unified_memory().unwrap());
}

// ── Teardown ─────────────────────────────────────────────────────────────────

#[test]
fn deinit_runs_hooks_in_order_before_releasing_the_context() {
    let driver = Rc::new(HostDriver::new());
    let core = open(&driver, CoreConfig::default()).unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let (d, s) = (driver.clone(), seen.clone());
    core.on_deinit(move || {
        let stats = d.stats();
        s.borrow_mut().push(("first", stats.live_buffers, stats.live_contexts));
    });
    let _buf = buffer(&core, &[1, 2, 3]);
    let (d, s) = (driver.clone(), seen.clone());
    core.on_deinit(move || {
        let stats = d.stats();
        s.borrow_mut().push(("second", stats.live_buffers, stats.live_contexts));
    });

    core.deinit().unwrap();
    assert_eq!(
        *seen.borrow(),
        vec![("first", 2, 1), ("second", 0, 1)]
    );
    let stats = driver.stats();
    assert_eq!(stats.live_contexts, 0);
    assert_eq!(stats.live_queues, 0);
    assert!(!core.is_initialized());

    core.deinit().unwrap();
    assert_eq!(seen.borrow().len(), 2);
}

#[test]
fn deinit_is_refused_while_a_view_is_mapped() {
    let driver = Rc::new(HostDriver::new());
    let core = open(&driver, CoreConfig::default()).unwrap();
    let mut buf = buffer(&core, &[4, 5]);

    let view = buf.map_host(MapFlags::READ).unwrap();
    let err = core.deinit().unwrap_err();
    assert!(matches!(err, ClkitError::MappedViewsAlive { count: 1 }));
    assert!(core.is_initialized());
    assert_eq!(view.as_slice(), &[4, 5]);

    drop(view);
    core.deinit().unwrap();
    assert_eq!(driver.stats().live_buffers, 0);
}

#[test]
fn core_can_be_initialized_again_after_deinit() {
    let driver = Rc::new(HostDriver::new());
    let core = open(&driver, CoreConfig::default()).unwrap();
    let buf = buffer(&core, &[1]);
    let old = buf.to_device(false, &[]).unwrap().unwrap();

    core.deinit().unwrap();
    core.init().unwrap();
    assert!(matches!(old.wait(), Err(ClkitError::NotInitialized)));
    assert!(matches!(buf.to_device(true, &[]), Err(ClkitError::NotInitialized)));

    let fresh = buffer(&core, &[2]);
    assert_eq!(fresh.device_to_vec().unwrap(), vec![2]);
}

#[test]
fn dropping_the_last_handle_tears_down() {
    let driver = Rc::new(HostDriver::new());
    {
        let core = open(&driver, CoreConfig::default()).unwrap();
        let _buf = buffer(&core, &[1, 2]);
        assert_eq!(driver.stats().live_contexts, 1);
    }
    let stats = driver.stats();
    assert_eq!(stats.live_buffers, 0);
    assert_eq!(stats.live_contexts, 0);
}

#[test]
fn unmeasured_events_do_not_keep_the_core_alive() {
    let driver = Rc::new(HostDriver::new());
    {
        let core = open(&driver, timed()).unwrap();
        let buf = buffer(&core, &[1, 2]);
        buf.to_device(true, &[]).unwrap();
        assert_eq!(driver.stats().live_events, 1);
    }
    let stats = driver.stats();
    assert_eq!(stats.live_events, 0);
    assert_eq!(stats.live_contexts, 0);
}

#[test]
fn uninitialized_core_rejects_work() {
    let core = Core::new(Rc::new(HostDriver::new()), CoreConfig::default());
    assert!(matches!(core.platform_name(), Err(ClkitError::NotInitialized)));
    assert!(matches!(core.measure_time(), Err(ClkitError::NotInitialized)));
    core.deinit().unwrap();
}

// ── Timing ───────────────────────────────────────────────────────────────────

#[test]
fn measure_time_consumes_recorded_events() {
    let driver = Rc::new(HostDriver::new());
    let core = open(&driver, timed()).unwrap();
    let buf = buffer(&core, &[1, 2, 3, 4]);
    buf.to_device(true, &[]).unwrap();
    buf.to_host(true, &[]).unwrap();
    buf.device_to_vec().unwrap();
    assert_eq!(driver.stats().live_events, 3);

    let report = core.measure_time().unwrap();
    assert_eq!(report.total_ns(), report.io_ns + report.kernel_ns);
    assert_eq!(driver.stats().live_events, 0);
    assert_eq!(core.measure_time().unwrap(), TimingReport::default());
}

#[test]
fn reset_time_forgets_events() {
    let driver = Rc::new(HostDriver::new());
    let core = open(&driver, timed()).unwrap();
    let src = buffer(&core, &[1, 2]);
    let dst = buffer(&core, &[0, 0]);
    src.copy_device_to(&dst, true, &[]).unwrap();
    assert_eq!(driver.stats().live_events, 1);
    core.reset_time();
    assert_eq!(driver.stats().live_events, 0);
    assert_eq!(core.measure_time().unwrap(), TimingReport::default());
}

#[test]
fn events_are_not_kept_without_collect_time() {
    let driver = Rc::new(HostDriver::new());
    let core = open(&driver, CoreConfig::default()).unwrap();
    let buf = buffer(&core, &[1]);
    let event = buf.to_device(true, &[]).unwrap().unwrap();
    assert_eq!(driver.stats().live_events, 1);
    let err = event.elapsed_ns().unwrap_err();
    assert_eq!(err.status(), Some(Status::PROFILING_INFO_NOT_AVAILABLE));
    drop(event);
    assert_eq!(driver.stats().live_events, 0);
    assert_eq!(core.measure_time().unwrap(), TimingReport::default());
}

#[test]
fn profiled_event_reports_elapsed_time() {
    let driver = Rc::new(HostDriver::new());
    let core = open(&driver, timed()).unwrap();
    let buf = buffer(&core, &[7; 16]);
    let event = buf.to_device(false, &[]).unwrap().unwrap();
    Event::wait_all(&[event.clone()]).unwrap();
    assert!(event.elapsed_ns().is_ok());
    assert!(Event::wait_all(&[]).is_ok());
    core.wait_queue().unwrap();
}
