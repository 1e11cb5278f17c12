use crashreporter::{
    CrashReporter, Error, HandlerConfig, HandlerState, LoopAction, Monitor, MonitorConfig,
    ProcessDumper, RemoteEndpoint, Server, ServerHandler, Signal, keys, read_extra_file,
};
use std::{
    fs::File,
    io::Write as _,
    sync::{Arc, atomic},
};

/// The fault hook is process wide
static HOOK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

fn capture_output() {
    static SUB: std::sync::Once = std::sync::Once::new();

    SUB.call_once(|| {
        tracing_subscriber::fmt().with_test_writer().init();
    });
}

#[test]
fn lifecycle() {
    let _hook = HOOK.lock();
    capture_output();

    let dir = tempfile::tempdir().unwrap();
    let reporter = CrashReporter::new();
    assert_eq!(reporter.state(), HandlerState::Unarmed);

    // Nothing to remove yet
    reporter.remove();
    assert_eq!(reporter.state(), HandlerState::Unarmed);
    assert!(matches!(reporter.take_minidump(false), Err(Error::NotArmed)));
    assert!(matches!(
        reporter.set_minidump_path(dir.path()),
        Err(Error::NotArmed)
    ));

    assert!(matches!(
        reporter.install(dir.path().join("missing"), false),
        Err(Error::Configuration(_))
    ));
    assert_eq!(reporter.state(), HandlerState::Unarmed);

    reporter.install(dir.path(), false).unwrap();
    assert!(reporter.enabled());
    assert_eq!(reporter.minidump_path().as_deref(), Some(dir.path()));

    assert!(matches!(
        reporter.install(dir.path(), false),
        Err(Error::AlreadyArmed)
    ));

    // A bad directory leaves the armed handler alone, even when forced
    assert!(matches!(
        reporter.install(dir.path().join("missing"), true),
        Err(Error::Configuration(_))
    ));
    assert_eq!(reporter.state(), HandlerState::Armed);

    let other = tempfile::tempdir().unwrap();
    reporter.install(other.path(), true).unwrap();
    assert_eq!(reporter.state(), HandlerState::Armed);
    assert_eq!(reporter.minidump_path().as_deref(), Some(other.path()));

    reporter.thread_annotations().set_current_thread_name("lifecycle");
    assert!(!reporter.thread_annotations().is_empty());

    reporter.remove();
    assert_eq!(reporter.state(), HandlerState::Removed);
    assert!(!crashreporter_hook::CrashHandler::is_attached());

    // Removing also shuts the thread registry down for good
    let threads = reporter.thread_annotations();
    assert!(!threads.is_active());
    assert!(threads.is_empty());
    threads.set_current_thread_name("after-remove");
    assert!(threads.is_empty());

    // Removed is terminal
    reporter.remove();
    assert_eq!(reporter.state(), HandlerState::Removed);
    assert!(matches!(
        reporter.install(dir.path(), true),
        Err(Error::HandlerRemoved)
    ));
    assert_eq!(reporter.minidump_path(), None);
}

#[test]
fn crash_writes_annotations() {
    let _hook = HOOK.lock();
    capture_output();

    let dir = tempfile::tempdir().unwrap();
    let reporter = CrashReporter::new();
    reporter.annotations().set("BuildID", "20240101");
    reporter.install(dir.path(), false).unwrap();
    reporter.thread_annotations().set_current_thread_name("reporter-test");

    let dump = reporter.simulate_crash(Signal::Segv).unwrap().unwrap();
    assert_eq!(dump.pid(), std::process::id());
    assert_eq!(dump.path().parent(), Some(dir.path()));

    let extra = read_extra_file(&dump.extra_path()).unwrap();
    assert_eq!(extra.get("BuildID"), Some("20240101"));
    assert!(extra.get(keys::CRASH_TIME).is_some());
    assert_eq!(
        extra.get(keys::THREAD_ID_NAME_MAPPING),
        Some(format!("{}:\"reporter-test\"", crashreporter::current_thread_id()).as_str())
    );

    let md = minidump::Minidump::read_path(dump.path()).unwrap();
    let exc: minidump::MinidumpException<'_> = md.get_stream().unwrap();
    assert_eq!(exc.raw.exception_record.exception_code, libc::SIGSEGV as u32);

    // Later annotations show up in later dumps only
    reporter.annotations().set("BuildID", "20240102");
    let second = reporter.simulate_crash(Signal::Abort).unwrap().unwrap();
    assert_ne!(second.id(), dump.id());
    let extra = read_extra_file(&second.extra_path()).unwrap();
    assert_eq!(extra.get("BuildID"), Some("20240102"));
}

#[test]
fn take_minidump_to_pending() {
    let _hook = HOOK.lock();
    capture_output();

    let dir = tempfile::tempdir().unwrap();
    let pending = tempfile::tempdir().unwrap();
    let reporter = CrashReporter::new();
    reporter
        .install_with(
            HandlerConfig::new(dir.path())
                .pending_dir(pending.path())
                .capture_stack(false),
            false,
        )
        .unwrap();
    reporter.set_server_url("https://crash-reports.example.com/submit");

    let dump = reporter.take_minidump(true).unwrap();
    assert_eq!(dump.path().parent(), Some(pending.path()));
    assert!(dump.extra_path().exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    let extra = read_extra_file(&dump.extra_path()).unwrap();
    assert_eq!(
        extra.get(keys::SERVER_URL),
        Some("https://crash-reports.example.com/submit")
    );

    let moved = tempfile::tempdir().unwrap();
    reporter.set_minidump_path(moved.path()).unwrap();
    let dump = reporter.take_minidump(false).unwrap();
    assert_eq!(dump.path().parent(), Some(moved.path()));
}

#[test]
fn install_time_is_kept() {
    let app_data = tempfile::tempdir().unwrap();
    let reporter = CrashReporter::new();

    reporter.setup_extra_data(app_data.path(), "20240101").unwrap();
    let first = reporter.annotations().get(keys::INSTALL_TIME).unwrap();
    assert_eq!(
        std::fs::read_to_string(app_data.path().join("InstallTime20240101")).unwrap(),
        first
    );

    std::fs::write(app_data.path().join("InstallTime20240101"), "1700000000").unwrap();
    reporter.setup_extra_data(app_data.path(), "20240101").unwrap();
    assert_eq!(
        reporter.annotations().get(keys::INSTALL_TIME).as_deref(),
        Some("1700000000")
    );
    assert_eq!(
        reporter.annotations().get(keys::BUILD_ID).as_deref(),
        Some("20240101")
    );

    assert!(matches!(
        reporter.setup_extra_data(app_data.path(), ""),
        Err(Error::Configuration(_))
    ));
}

struct FakeDumper;

impl ProcessDumper for FakeDumper {
    fn dump(
        &self,
        pid: u32,
        _tid: u32,
        context: Option<crashreporter::CrashContext>,
        file: &mut File,
    ) -> Result<(), Error> {
        let signo = context.map_or(0, |cc| cc.siginfo.ssi_signo);
        write!(file, "{pid} {signo}")?;
        Ok(())
    }
}

struct Quiet;

impl ServerHandler for Quiet {
    fn on_child_dump(
        &self,
        _pid: u32,
        _result: Result<(crashreporter::Dump, u32), Error>,
    ) -> LoopAction {
        LoopAction::Continue
    }

    fn on_message(&self, _kind: u32, _buffer: Vec<u8>) {}
}

#[test]
fn remote_handler_falls_back_locally() {
    let _hook = HOOK.lock();
    capture_output();

    let local = tempfile::tempdir().unwrap();
    let reporter = CrashReporter::new();
    reporter.annotations().set("BuildID", "20240101");
    reporter.install(local.path(), false).unwrap();

    // Nobody listening, crashes stay local
    assert!(!reporter.setup_remote_handler(&RemoteEndpoint::Abstract(
        "crashreporter-reporter-nobody".to_owned()
    )));
    assert!(!reporter.has_remote_handler());
    assert!(!reporter.send_annotations_to_monitor().unwrap());
    assert!(reporter.simulate_crash(Signal::Trap).unwrap().is_some());

    let endpoint = RemoteEndpoint::Abstract("crashreporter-reporter-monitor".to_owned());
    let mut server = Server::bind(&endpoint).unwrap();
    let remote = tempfile::tempdir().unwrap();
    let monitor =
        Monitor::new(MonitorConfig::new(remote.path()).dumper(Arc::new(FakeDumper))).unwrap();

    let shutdown = Arc::new(atomic::AtomicBool::new(false));
    let server_loop = {
        let monitor = monitor.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || server.run(&monitor, Box::new(Quiet), &shutdown, None))
    };

    assert!(reporter.setup_remote_handler(&endpoint));

    // The monitor wrote this one
    assert!(reporter.simulate_crash(Signal::Illegal).unwrap().is_none());

    let (dump, sequence) = monitor
        .take_minidump_for_child(std::process::id())
        .unwrap();
    assert_eq!(sequence, 0);
    assert_eq!(
        std::fs::read_to_string(dump.path()).unwrap(),
        format!("{} {}", std::process::id(), libc::SIGILL)
    );
    let extra = read_extra_file(&dump.extra_path()).unwrap();
    assert_eq!(extra.get("BuildID"), Some("20240101"));

    // Back to local dumps
    reporter.unset_remote_handler();
    assert!(reporter.simulate_crash(Signal::Abort).unwrap().is_some());

    shutdown.store(true, atomic::Ordering::Relaxed);
    server_loop.join().unwrap().unwrap();
}

/// The monitor's extra file has the annotations as they were at the time of
/// the crash, not as they were when the remote handler was set up
#[test]
fn remote_crash_uses_current_annotations() {
    let _hook = HOOK.lock();
    capture_output();

    let endpoint = RemoteEndpoint::Abstract("crashreporter-reporter-late-annotations".to_owned());
    let mut server = Server::bind(&endpoint).unwrap();
    let remote = tempfile::tempdir().unwrap();
    let monitor =
        Monitor::new(MonitorConfig::new(remote.path()).dumper(Arc::new(FakeDumper))).unwrap();

    let shutdown = Arc::new(atomic::AtomicBool::new(false));
    let server_loop = {
        let monitor = monitor.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || server.run(&monitor, Box::new(Quiet), &shutdown, None))
    };

    let local = tempfile::tempdir().unwrap();
    let reporter = CrashReporter::new();
    reporter.annotations().set("ProductName", "Example");
    reporter.install(local.path(), false).unwrap();
    reporter.thread_annotations().set_current_thread_name("late-annotations");
    assert!(reporter.setup_remote_handler(&endpoint));

    // Set after the handler sent its annotations, and never sent explicitly
    reporter.annotations().set("BuildID", "20240101");

    assert!(reporter.simulate_crash(Signal::Segv).unwrap().is_none());

    let (dump, _sequence) = monitor
        .take_minidump_for_child(std::process::id())
        .unwrap();
    let extra = read_extra_file(&dump.extra_path()).unwrap();
    assert_eq!(extra.get("BuildID"), Some("20240101"));
    assert_eq!(extra.get("ProductName"), Some("Example"));
    assert_eq!(
        extra.get(keys::THREAD_ID_NAME_MAPPING),
        Some(format!("{}:\"late-annotations\"", crashreporter::current_thread_id()).as_str())
    );

    reporter.remove();
    shutdown.store(true, atomic::Ordering::Relaxed);
    server_loop.join().unwrap().unwrap();
}
