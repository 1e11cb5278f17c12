//! Runs a monitor in a second process and reports a simulated crash to it.
//!
//! `cargo run --example diskwrite` writes the minidump and its extra file to
//! `./dumps`.

const SOCKET_NAME: &str = "crashreporter-disk-example";

use crashreporter::{
    CrashReporter, Dump, Error, LoopAction, Monitor, MonitorConfig, RemoteEndpoint, Server,
    ServerHandler, Signal,
};

struct Handler;

impl ServerHandler for Handler {
    fn on_child_dump(&self, pid: u32, result: Result<(Dump, u32), Error>) -> LoopAction {
        match result {
            Ok((dump, sequence)) => {
                log::info!(
                    "wrote minidump #{sequence} of {pid} to '{}'",
                    dump.path().display()
                );
            }
            Err(e) => {
                log::error!("failed to write minidump of {pid}: {e:#}");
            }
        }

        // The child exits right after crashing
        LoopAction::Exit
    }

    fn on_message(&self, kind: u32, buffer: Vec<u8>) {
        log::info!("kind: {kind}, message: {}", String::from_utf8_lossy(&buffer));
    }
}

fn main() {
    tracing_subscriber::fmt().init();

    let endpoint = RemoteEndpoint::Abstract(SOCKET_NAME.to_owned());

    if std::env::args().any(|a| a == "--monitor") {
        let mut server = Server::bind(&endpoint).expect("failed to create server");
        let monitor = Monitor::new(MonitorConfig::new("dumps")).expect("failed to create monitor");

        let shutdown = std::sync::atomic::AtomicBool::new(false);
        server
            .run(&monitor, Box::new(Handler), &shutdown, None)
            .expect("failed to run server");

        return;
    }

    std::fs::create_dir_all("dumps").expect("failed to create dump directory");

    let reporter = CrashReporter::new();
    reporter.annotations().set("BuildID", "20240101");
    reporter.install("dumps", false).expect("failed to install crash handler");

    let mut _monitor_proc = None;

    // Start the monitor if it isn't running yet
    while !reporter.setup_remote_handler(&endpoint) {
        if _monitor_proc.is_none() {
            let exe = std::env::current_exe().expect("unable to find ourselves");

            _monitor_proc = Some(
                std::process::Command::new(exe)
                    .arg("--monitor")
                    .spawn()
                    .expect("unable to spawn monitor process"),
            );
        }

        // Give it time to start
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    reporter.annotations().append_app_notes("mistakes will be made");
    reporter
        .send_annotations_to_monitor()
        .expect("failed to send annotations");

    match reporter.simulate_crash(Signal::Segv) {
        Ok(None) => log::info!("the monitor wrote the minidump"),
        Ok(Some(dump)) => log::warn!("wrote the minidump locally to '{}'", dump.path().display()),
        Err(e) => log::error!("failed to simulate crash: {e}"),
    }
}
