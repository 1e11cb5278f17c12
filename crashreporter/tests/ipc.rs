use crashreporter::{
    Client, CrashNotice, Dump, Error, LoopAction, Monitor, MonitorConfig,
    ProcessDumper, RemoteEndpoint, Server, ServerHandler,
};
use std::{
    fs::File,
    io::Write as _,
    os::fd::IntoRawFd,
    sync::{Arc, atomic, mpsc},
    time::Duration,
};

fn capture_output() {
    static SUB: std::sync::Once = std::sync::Once::new();

    SUB.call_once(|| {
        tracing_subscriber::fmt().with_test_writer().init();
    });
}

/// Writes a stand-in minidump naming the process and thread it was asked for
struct FakeDumper;

impl ProcessDumper for FakeDumper {
    fn dump(
        &self,
        pid: u32,
        tid: u32,
        context: Option<crashreporter::CrashContext>,
        file: &mut File,
    ) -> Result<(), Error> {
        write!(file, "MDMP {pid} {tid} {}", context.is_some())?;
        Ok(())
    }
}

struct Handler {
    dumps: mpsc::Sender<(u32, Result<(Dump, u32), Error>)>,
    messages: Arc<parking_lot::Mutex<Vec<(u32, String)>>>,
}

impl ServerHandler for Handler {
    fn on_child_dump(&self, pid: u32, result: Result<(Dump, u32), Error>) -> LoopAction {
        self.dumps.send((pid, result)).unwrap();
        LoopAction::Continue
    }

    fn on_message(&self, kind: u32, buffer: Vec<u8>) {
        self.messages
            .lock()
            .push((kind, String::from_utf8(buffer).unwrap()));
    }
}

struct Running {
    monitor: Monitor,
    dumps: mpsc::Receiver<(u32, Result<(Dump, u32), Error>)>,
    messages: Arc<parking_lot::Mutex<Vec<(u32, String)>>>,
    shutdown: Arc<atomic::AtomicBool>,
    server_loop: std::thread::JoinHandle<Result<(), Error>>,
    _dir: tempfile::TempDir,
}

impl Running {
    fn stop(self) -> Vec<(u32, String)> {
        self.shutdown.store(true, atomic::Ordering::Relaxed);
        self.server_loop.join().unwrap().unwrap();
        std::mem::take(&mut *self.messages.lock())
    }
}

fn run_server(mut server: Server) -> Running {
    capture_output();

    let dir = tempfile::tempdir().unwrap();
    let monitor =
        Monitor::new(MonitorConfig::new(dir.path()).dumper(Arc::new(FakeDumper))).unwrap();

    let (tx, dumps) = mpsc::channel();
    let messages = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let handler = Handler {
        dumps: tx,
        messages: messages.clone(),
    };

    let shutdown = Arc::new(atomic::AtomicBool::new(false));
    let is_shutdown = shutdown.clone();
    let server_monitor = monitor.clone();
    let server_loop = std::thread::spawn(move || {
        server.run(&server_monitor, Box::new(handler), &is_shutdown, None)
    });

    Running {
        monitor,
        dumps,
        messages,
        shutdown,
        server_loop,
        _dir: dir,
    }
}

/// Tests that the user can send and receive their own messages over IPC
#[test]
fn ipc_messages() {
    let endpoint = RemoteEndpoint::Abstract("crashreporter-ipc-messages".to_owned());
    let running = run_server(Server::bind(&endpoint).unwrap());

    let client = Client::connect(&endpoint).unwrap();

    for i in 0..1000 {
        assert!(client.send_message(i, format!("msg #{i}")).is_ok(), "{i}");
    }

    // The monitor answers pings in order, so every message before this has
    // been delivered once it returns
    client.ping().unwrap();

    let messages = running.stop();
    assert_eq!(messages.len(), 1000);
    for (i, (kind, msg)) in (0..1000).zip(messages.iter()) {
        assert_eq!(i, *kind);
        assert_eq!(&format!("msg #{i}"), msg);
    }
}

/// A crash notice on a child's notification pipe is dumped by the monitor
/// before the child is released
#[test]
fn crash_notice_over_pipe() {
    let server = Server::pipes_only();
    let registrar = server.registrar();
    let running = run_server(server);

    let (monitor_end, child_end) = crashreporter::create_notification_pipe_for_child().unwrap();
    registrar.register(monitor_end, 1234).unwrap();

    let client =
        Client::connect(&RemoteEndpoint::Inherited(child_end.into_raw_fd())).unwrap();

    client
        .send_annotations(&[("BuildID", "20240101")].into_iter().collect())
        .unwrap();
    client.ping().unwrap();

    client
        .request_dump(
            &CrashNotice {
                pid: 1234,
                tid: 5,
                fault_kind: libc::SIGSEGV,
                fault_code: 1,
                fault_address: 0,
            },
            None,
        )
        .unwrap();

    // The ack is only sent once the dump has been reported
    let (pid, result) = running.dumps.try_recv().unwrap();
    assert_eq!(pid, 1234);
    let (d1, sequence) = result.unwrap();
    assert_eq!(sequence, 0);
    assert_eq!(std::fs::read_to_string(d1.path()).unwrap(), "MDMP 1234 5 false");

    let extra = crashreporter::read_extra_file(&d1.extra_path()).unwrap();
    assert_eq!(extra.get("BuildID"), Some("20240101"));

    let (taken, sequence) = running.monitor.take_minidump_for_child(1234).unwrap();
    assert_eq!(taken.id(), d1.id());
    assert_eq!(sequence, 0);

    running.stop();
}

/// The pid in a crash notice has to match the connection it arrived on
#[test]
fn rejects_spoofed_pid() {
    let endpoint = RemoteEndpoint::Abstract("crashreporter-spoofed-pid".to_owned());
    let running = run_server(Server::bind(&endpoint).unwrap());

    let client = Client::connect(&endpoint).unwrap();

    // The child is still released
    client
        .request_dump(
            &CrashNotice {
                pid: std::process::id() + 1,
                tid: 1,
                fault_kind: libc::SIGABRT,
                fault_code: 0,
                fault_address: 0,
            },
            None,
        )
        .unwrap();

    assert!(running.dumps.try_recv().is_err());
    assert!(matches!(
        running.monitor.take_minidump_for_child(std::process::id() + 1),
        Err(Error::UnknownChild(_))
    ));

    running.stop();
}

/// Connections are reaped once they go stale, and the handler can stop the
/// loop
#[test]
fn stale_connections_are_dropped() {
    capture_output();

    struct Exiter;

    impl ServerHandler for Exiter {
        fn on_child_dump(&self, _pid: u32, _result: Result<(Dump, u32), Error>) -> LoopAction {
            LoopAction::Continue
        }

        fn on_message(&self, _kind: u32, _buffer: Vec<u8>) {}

        fn on_client_disconnected(&self, num_clients: usize) -> LoopAction {
            assert_eq!(num_clients, 0);
            LoopAction::Exit
        }
    }

    let endpoint = RemoteEndpoint::Abstract("crashreporter-stale".to_owned());
    let mut server = Server::bind(&endpoint).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let monitor = Monitor::new(MonitorConfig::new(dir.path())).unwrap();
    let shutdown = atomic::AtomicBool::new(false);

    let _client = Client::connect(&endpoint).unwrap();

    // Returns on its own once the quiet client is reaped
    server
        .run(
            &monitor,
            Box::new(Exiter),
            &shutdown,
            Some(std::time::Duration::from_millis(50)),
        )
        .unwrap();
}

/// A header announcing more than the monitor accepts gets the client
/// disconnected, everyone else is still served
#[test]
fn oversized_message_disconnects() {
    let name = "crashreporter-oversized";
    let endpoint = RemoteEndpoint::Abstract(name.to_owned());
    let running = run_server(Server::bind(&endpoint).unwrap());

    let addr = uds::UnixSocketAddr::from_abstract(name).unwrap();
    let raw = uds::UnixSeqpacketConn::connect_unix_addr(&addr).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // A user message header, `kind` then `size`
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&5u32.to_ne_bytes());
    header[4..].copy_from_slice(&u32::MAX.to_ne_bytes());
    raw.send(&header).unwrap();

    // The monitor hung up rather than trying to read the payload
    let mut reply = [0u8; 8];
    assert_eq!(raw.recv(&mut reply).unwrap(), 0);

    let client = Client::connect(&endpoint).unwrap();
    client.send_message(1, "still here").unwrap();
    client.ping().unwrap();

    assert!(matches!(
        client.send_message(2, vec![0u8; crashreporter::MAX_PAYLOAD + 1]),
        Err(Error::Protocol(_))
    ));

    let messages = running.stop();
    assert_eq!(messages, vec![(1, "still here".to_owned())]);
}

/// Holds the dump of one child until the test lets it go
struct BlockingDumper {
    blocked_pid: u32,
    started: parking_lot::Mutex<mpsc::Sender<()>>,
    release: parking_lot::Mutex<mpsc::Receiver<()>>,
}

impl ProcessDumper for BlockingDumper {
    fn dump(
        &self,
        pid: u32,
        tid: u32,
        _context: Option<crashreporter::CrashContext>,
        file: &mut File,
    ) -> Result<(), Error> {
        if pid == self.blocked_pid {
            self.started.lock().send(()).unwrap();
            self.release.lock().recv().unwrap();
        }
        write!(file, "MDMP {pid} {tid}")?;
        Ok(())
    }
}

/// A slow dump of one child doesn't hold up the crash of another
#[test]
fn crashes_are_dumped_concurrently() {
    capture_output();

    let (started_tx, started) = mpsc::channel();
    let (release, release_rx) = mpsc::channel();
    let dir = tempfile::tempdir().unwrap();
    let monitor = Monitor::new(MonitorConfig::new(dir.path()).dumper(Arc::new(BlockingDumper {
        blocked_pid: 1001,
        started: parking_lot::Mutex::new(started_tx),
        release: parking_lot::Mutex::new(release_rx),
    })))
    .unwrap();

    let mut server = Server::pipes_only();
    let registrar = server.registrar();
    let (tx, dumps) = mpsc::channel();
    let handler = Handler {
        dumps: tx,
        messages: Arc::new(parking_lot::Mutex::new(Vec::new())),
    };

    let shutdown = Arc::new(atomic::AtomicBool::new(false));
    let server_loop = {
        let monitor = monitor.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || server.run(&monitor, Box::new(handler), &shutdown, None))
    };

    let connect = |pid: u32| {
        let (monitor_end, child_end) =
            crashreporter::create_notification_pipe_for_child().unwrap();
        registrar.register(monitor_end, pid).unwrap();
        Client::connect(&RemoteEndpoint::Inherited(child_end.into_raw_fd())).unwrap()
    };

    let crash = |client: Client, pid: u32| {
        std::thread::spawn(move || {
            client
                .request_dump(
                    &CrashNotice {
                        pid,
                        tid: pid,
                        fault_kind: libc::SIGSEGV,
                        fault_code: 1,
                        fault_address: 0,
                    },
                    None,
                )
                .unwrap();
        })
    };

    let slow = crash(connect(1001), 1001);
    started.recv_timeout(Duration::from_secs(5)).unwrap();

    // Acked while the first dump is still being written
    let (acked_tx, acked) = mpsc::channel();
    let fast_client = connect(1002);
    let fast = std::thread::spawn(move || {
        crash(fast_client, 1002).join().unwrap();
        acked_tx.send(()).unwrap();
    });
    acked.recv_timeout(Duration::from_secs(5)).unwrap();
    fast.join().unwrap();

    let (pid, result) = dumps.recv().unwrap();
    assert_eq!(pid, 1002);
    assert_eq!(result.unwrap().1, 0);
    assert!(monitor.take_minidump_for_child(1001).is_err());

    release.send(()).unwrap();
    slow.join().unwrap();

    let (pid, result) = dumps.recv().unwrap();
    assert_eq!(pid, 1001);
    let (dump, _sequence) = result.unwrap();
    assert_eq!(std::fs::read_to_string(dump.path()).unwrap(), "MDMP 1001 1001");

    shutdown.store(true, atomic::Ordering::Relaxed);
    server_loop.join().unwrap().unwrap();
}

#[test]
fn unreachable_endpoints() {
    assert!(matches!(
        Client::connect(&RemoteEndpoint::Abstract(
            "crashreporter-nobody-listens".to_owned()
        )),
        Err(Error::Io(_))
    ));

    // Not a socket
    let file = tempfile::tempfile().unwrap();
    assert!(matches!(
        Client::connect(&RemoteEndpoint::Inherited(file.into_raw_fd())),
        Err(Error::InvalidEndpoint)
    ));
}
