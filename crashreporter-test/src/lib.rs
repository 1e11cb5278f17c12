use crashreporter::{
    Dump, Error, LoopAction, Monitor, MonitorConfig, RemoteEndpoint, ServerHandler,
};
use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
};

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Signal {
    Abort,
    Fpe,
    Illegal,
    Segv,
    StackOverflow,
    Trap,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Illegal => "illegal",
            Self::Trap => "trap",
            Self::Abort => "abort",
            Self::Fpe => "fpe",
            Self::Segv => "segv",
            Self::StackOverflow => "stack-overflow",
        })
    }
}

#[inline]
pub fn capture_output() {
    static SUB: std::sync::Once = std::sync::Once::new();

    SUB.call_once(|| {
        tracing_subscriber::fmt().with_test_writer().init();
    });
}

/// The value the client annotates its `BuildID` with, unique per run
#[inline]
pub fn build_id(id: &str) -> String {
    format!("test-{id}")
}

type DumpResult = (u32, Result<(Dump, u32), Error>);

/// A monitor serving crash notices on its own thread
pub struct MonitorServer {
    pub endpoint: RemoteEndpoint,
    pub monitor: Monitor,
    pub dump_rx: mpsc::Receiver<DumpResult>,
    exit_run_loop: Arc<AtomicBool>,
    run_loop: Option<std::thread::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl Drop for MonitorServer {
    fn drop(&mut self) {
        self.exit_run_loop.store(true, Ordering::Relaxed);
        if let Some(jh) = self.run_loop.take() {
            jh.join().expect("failed to join server thread");
        }
    }
}

pub fn spinup_monitor(id: &str) -> MonitorServer {
    struct Inner {
        dump_tx: mpsc::Sender<DumpResult>,
    }

    impl ServerHandler for Inner {
        fn on_child_dump(&self, pid: u32, result: Result<(Dump, u32), Error>) -> LoopAction {
            self.dump_tx
                .send((pid, result))
                .expect("couldn't send minidump result");
            LoopAction::Continue
        }

        fn on_message(&self, _kind: u32, _buffer: Vec<u8>) {
            unimplemented!();
        }
    }

    let endpoint = RemoteEndpoint::Abstract(format!("crashreporter-test-{id}"));
    let mut server = crashreporter::Server::bind(&endpoint).expect("failed to start server");

    let dir = tempfile::tempdir().expect("failed to create dump directory");
    let monitor = Monitor::new(MonitorConfig::new(dir.path())).expect("failed to create monitor");

    let (tx, rx) = mpsc::channel();

    let exit = Arc::new(AtomicBool::new(false));
    let exit_run_loop = exit.clone();

    let run_loop = {
        let monitor = monitor.clone();
        std::thread::spawn(move || {
            server
                .run(&monitor, Box::new(Inner { dump_tx: tx }), &exit, None)
                .expect("failed to run server loop");
        })
    };

    MonitorServer {
        endpoint,
        monitor,
        dump_rx: rx,
        exit_run_loop,
        run_loop: Some(run_loop),
        _dir: dir,
    }
}

/// The command line for one crash-client run
pub struct ClientArgs<'a> {
    pub id: &'a str,
    pub dump_dir: &'a Path,
    pub signal: Signal,
    pub use_thread: bool,
    pub endpoint: Option<&'a RemoteEndpoint>,
}

fn client_command(args: &ClientArgs<'_>) -> std::process::Command {
    use std::env;

    // Adapted from
    // https://github.com/rust-lang/cargo/blob/485670b3983b52289a2f353d589c57fae2f60f82/tests/testsuite/support/mod.rs#L507
    let mut cmd_path = env::current_exe().expect("failed to get exe path");
    cmd_path.pop();
    if cmd_path.ends_with("deps") {
        cmd_path.pop();
    }

    cmd_path.push("crash-client");

    let mut cmd = std::process::Command::new(&cmd_path);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.arg("--dump-dir")
        .arg(args.dump_dir)
        .args(["--signal", &args.signal.to_string()])
        .arg("--annotate")
        .arg(format!("BuildID={}", build_id(args.id)));

    if let Some(endpoint) = args.endpoint {
        cmd.arg("--endpoint").arg(endpoint.to_string());
    }

    if args.use_thread {
        cmd.arg("--use-thread");
    }

    cmd
}

/// Runs the client to its crash, returning its pid
pub fn run_client(args: &ClientArgs<'_>) -> u32 {
    let child = client_command(args)
        .spawn()
        .expect("failed to run crash-client");
    let pid = child.id();
    let output = child.wait_with_output().expect("failed to wait for output");

    let stdout = std::str::from_utf8(&output.stdout).expect("invalid stdout");
    let stderr = std::str::from_utf8(&output.stderr).expect("invalid stderr");

    println!("{stdout}");
    eprintln!("{stderr}");

    // Ensure it was interrupted and did not exit properly
    assert!(output.status.code().is_none());

    pid
}

/// Spawns a client that connects to the monitor and then waits to be killed
pub fn spawn_hung_client(id: &str, dump_dir: &Path, endpoint: &RemoteEndpoint) -> std::process::Child {
    use std::io::BufRead as _;

    let mut cmd = client_command(&ClientArgs {
        id,
        dump_dir,
        signal: Signal::Segv,
        use_thread: false,
        endpoint: Some(endpoint),
    });
    cmd.stderr(Stdio::inherit()).arg("--hang");

    let mut child = cmd.spawn().expect("failed to run crash-client");

    let stdout = child.stdout.take().expect("stdout is piped");
    let mut lines = std::io::BufReader::new(stdout).lines();
    loop {
        let line = lines
            .next()
            .expect("crash-client exited before it was ready")
            .expect("invalid stdout");
        if line == "ready" {
            break;
        }
    }

    child
}

/// Finds the single minidump the client wrote for itself
pub fn find_local_dump(dir: &Path) -> PathBuf {
    let mut dumps: Vec<_> = std::fs::read_dir(dir)
        .expect("failed to read dump directory")
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            (path.extension()? == "dmp").then_some(path)
        })
        .collect();

    assert_eq!(dumps.len(), 1, "expected exactly one minidump in {dumps:?}");
    dumps.remove(0)
}

pub fn assert_extra(minidump: &Path, id: &str) {
    let extra = crashreporter::read_extra_file(&crashreporter::extra_file_for_minidump(minidump))
        .expect("failed to read extra file");
    assert_eq!(
        extra.get(crashreporter::keys::BUILD_ID),
        Some(build_id(id).as_str())
    );
}

/// Crashes a client that writes its own minidump
pub fn run_test(signal: Signal, counter: u32, use_thread: bool) -> Vec<u8> {
    capture_output();

    let id = format!(
        "{signal}-{counter}-{}",
        if use_thread { "threaded" } else { "simple" }
    );

    let dir = tempfile::tempdir().expect("failed to create dump directory");
    run_client(&ClientArgs {
        id: &id,
        dump_dir: dir.path(),
        signal,
        use_thread,
        endpoint: None,
    });

    let dump_path = find_local_dump(dir.path());
    assert_extra(&dump_path, &id);

    let md = std::fs::read(&dump_path).expect("failed to read minidump");
    assert_minidump(&md, signal);
    md
}

/// Crashes a client that hands its crash to a monitor process
pub fn run_remote_test(signal: Signal, use_thread: bool) -> Vec<u8> {
    capture_output();

    let id = format!(
        "remote-{signal}-{}",
        if use_thread { "threaded" } else { "simple" }
    );

    let server = spinup_monitor(&id);
    let local = tempfile::tempdir().expect("failed to create dump directory");
    let pid = run_client(&ClientArgs {
        id: &id,
        dump_dir: local.path(),
        signal,
        use_thread,
        endpoint: Some(&server.endpoint),
    });

    let (crashed, result) = server
        .dump_rx
        .recv_timeout(std::time::Duration::from_secs(5))
        .expect("failed to receive minidump");
    assert_eq!(crashed, pid);

    let (dump, sequence) = result.expect("failed to write minidump");
    assert_eq!(sequence, 0);
    assert_extra(dump.path(), &id);

    // The monitor handled it, so nothing was written locally
    assert_eq!(
        std::fs::read_dir(local.path())
            .expect("failed to read dump directory")
            .count(),
        0
    );

    let md = std::fs::read(dump.path()).expect("failed to read minidump");
    assert_minidump(&md, signal);
    md
}

pub use minidump::system_info::{Cpu, Os};

#[inline]
pub fn get_native_os() -> Os {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            Os::Linux
        } else {
            compile_error!("implement me");
        }
    }
}

#[inline]
pub fn get_native_cpu() -> Cpu {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            Cpu::X86_64
        } else if #[cfg(target_arch = "x86")] {
            Cpu::X86
        } else if #[cfg(target_arch = "aarch64")] {
            Cpu::Arm64
        } else if #[cfg(target_arch = "arm")] {
            Cpu::Arm
        } else {
            compile_error!("implement me");
        }
    }
}

pub fn assert_minidump(md_buf: &[u8], signal: Signal) {
    use minidump::CrashReason;
    use minidump_common::errors;

    let md = minidump::Minidump::read(md_buf).expect("failed to parse minidump");

    let exc: minidump::MinidumpException<'_> =
        md.get_stream().expect("unable to find exception stream");

    let crash_reason = exc.get_crash_reason(get_native_os(), get_native_cpu());

    match signal {
        Signal::Abort => {
            assert!(matches!(
                crash_reason,
                CrashReason::LinuxGeneral(errors::ExceptionCodeLinux::SIGABRT, _)
            ));
        }
        Signal::Fpe => {
            assert!(matches!(
                crash_reason,
                CrashReason::LinuxSigfpe(errors::ExceptionCodeLinuxSigfpeKind::FPE_INTDIV)
            ));
        }
        Signal::Illegal => {
            assert!(matches!(
                crash_reason,
                CrashReason::LinuxSigill(errors::ExceptionCodeLinuxSigillKind::ILL_ILLOPN)
            ));
        }
        Signal::Segv => {
            assert!(matches!(
                crash_reason,
                CrashReason::LinuxSigsegv(errors::ExceptionCodeLinuxSigsegvKind::SEGV_MAPERR)
            ));
        }
        Signal::StackOverflow => {
            // A stack overflow on the main thread shows up as SEGV_MAPERR
            // rather than SEGV_ACCERR, so accept either
            assert!(matches!(
                crash_reason,
                CrashReason::LinuxSigsegv(
                    errors::ExceptionCodeLinuxSigsegvKind::SEGV_ACCERR
                        | errors::ExceptionCodeLinuxSigsegvKind::SEGV_MAPERR
                )
            ));
        }
        Signal::Trap => {
            assert!(matches!(
                crash_reason,
                CrashReason::LinuxGeneral(errors::ExceptionCodeLinux::SIGTRAP, _)
            ));
        }
    }
}

pub fn run_threaded_test(signal: Signal, count: u32) {
    use rayon::prelude::*;

    (0..count).into_par_iter().for_each(|i| {
        run_test(signal, i, true);
    });
}
