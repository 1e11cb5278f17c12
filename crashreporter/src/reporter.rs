//! The process-wide crash reporting context.
//!
//! A [`CrashReporter`] owns the annotations and thread annotations of the
//! process, and arms the fault hook with everything the crash path needs
//! prepared up front. Initialization order is: create the reporter, set the
//! initial annotations, [`CrashReporter::install`], then (in child processes)
//! [`CrashReporter::setup_remote_handler`]. Teardown is the reverse, and
//! dropping an armed reporter removes the hook.

use crate::{
    AnnotationStore, AnnotationTable, Error, HandlerConfig, ThreadAnnotations,
    config,
    crash_view::CrashView,
    dump::{self, Dump},
    keys,
    minidump::{self, SelfDumpWriter},
    raw::{self, CrashLog, JsonObject},
    remote::{Client, CrashNotice, RemoteEndpoint},
};
use crashreporter_hook::{CrashContext, CrashEventResult, CrashHandler, Signal};
use parking_lot::Mutex;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Room for the annotations sent to the monitor along with a crash notice
const CRASH_ANNOTATIONS_CAPACITY: usize = 64 * 1024;

/// Whether crash capture is active
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandlerState {
    Unarmed,
    Armed,
    /// Terminal, the handler can't be armed again
    Removed,
}

/// Everything the crash hook touches, prepared before the hook is attached
struct CrashCapture {
    writer: SelfDumpWriter,
    annotations: Arc<AnnotationStore>,
    threads: Arc<ThreadAnnotations>,
    remote: Arc<CrashView<Client>>,
    /// Scratch space the annotations are serialized into for the monitor
    payload: Mutex<Box<[u8]>>,
    log: CrashLog,
}

impl CrashCapture {
    /// Runs in the crash hook. Failures are logged to the crash log and
    /// swallowed, the process is terminating either way.
    fn on_crash(&self, cc: &CrashContext) -> CrashEventResult {
        if let Some(client) = self.remote.read() {
            self.send_annotations(&client);

            let notice = CrashNotice::from_crash_context(cc);
            match client.request_dump(&notice, Some(cc)) {
                Ok(()) => {
                    self.log.line(&["crashreporter: the monitor wrote the minidump"]);
                    return CrashEventResult::Handled(true);
                }
                Err(_err) => {
                    self.log
                        .line(&["crashreporter: the monitor did not respond, writing the minidump locally"]);
                }
            }
        }

        let snapshot = self.annotations.crash_snapshot();
        let empty = AnnotationTable::new();
        let annotations = snapshot.as_deref().unwrap_or(&empty);

        if self
            .writer
            .write(cc, annotations, &self.threads, &self.log)
            .is_ok()
        {
            self.log.line(&["crashreporter: minidump written"]);
        }

        CrashEventResult::Handled(true)
    }

    /// Sends the annotations as they are at the time of the crash, so the
    /// monitor's extra file doesn't depend on the last explicit send
    fn send_annotations(&self, client: &Client) {
        let Some(mut payload) = self.payload.try_lock() else {
            return;
        };
        let Some(annotations) = self.annotations.crash_snapshot() else {
            return;
        };

        match serialize_annotations(&mut payload, &annotations, &self.threads) {
            Ok(len) => {
                if client.send_serialized_annotations(&payload[..len]).is_err() {
                    self.log
                        .line(&["crashreporter: failed to send annotations to the monitor"]);
                }
            }
            Err(_err) => {
                self.log.line(&[
                    "crashreporter: annotations are too large to send, the monitor uses the last ones sent",
                ]);
            }
        }
    }
}

fn serialize_annotations(
    buf: &mut [u8],
    annotations: &AnnotationTable,
    threads: &ThreadAnnotations,
) -> io::Result<usize> {
    let mut json = JsonObject::begin(io::Cursor::new(buf))?;
    minidump::write_annotations(&mut json, annotations, threads)?;
    Ok(json.finish()?.position() as usize)
}

struct Armed {
    handler: CrashHandler,
    capture: Arc<CrashCapture>,
    config: HandlerConfig,
}

struct Controller {
    state: HandlerState,
    armed: Option<Armed>,
}

/// Crash reporting for one process
pub struct CrashReporter {
    annotations: Arc<AnnotationStore>,
    threads: Arc<ThreadAnnotations>,
    remote: Arc<CrashView<Client>>,
    controller: Mutex<Controller>,
}

impl Default for CrashReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashReporter {
    pub fn new() -> Self {
        Self {
            annotations: Arc::new(AnnotationStore::new()),
            threads: Arc::new(ThreadAnnotations::new()),
            remote: Arc::new(CrashView::empty()),
            controller: Mutex::new(Controller {
                state: HandlerState::Unarmed,
                armed: None,
            }),
        }
    }

    /// Arms crash capture, writing dumps into `dump_dir`, with the
    /// environment overrides of [`HandlerConfig::from_env`] applied
    pub fn install(&self, dump_dir: impl Into<PathBuf>, force: bool) -> Result<(), Error> {
        self.install_with(HandlerConfig::from_env(dump_dir), force)
    }

    /// Arms crash capture.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyArmed`] if already armed and `force` is not set,
    ///   with `force` the hook is removed and installed again
    /// - [`Error::HandlerRemoved`] once [`Self::remove`] has been called
    /// - [`Error::Configuration`] if the dump directory is not writable or
    ///   crash reporting is disabled by the environment
    pub fn install_with(&self, config: HandlerConfig, force: bool) -> Result<(), Error> {
        if config::disabled_by_env() {
            return Err(Error::Configuration(format!(
                "crash reporting is disabled by {}",
                config::DISABLE_ENV
            )));
        }

        let mut controller = self.controller.lock();
        match controller.state {
            HandlerState::Removed => return Err(Error::HandlerRemoved),
            HandlerState::Armed if !force => return Err(Error::AlreadyArmed),
            HandlerState::Armed | HandlerState::Unarmed => {}
        }

        config::ensure_writable(&config.dump_dir)?;
        let log = match &config.crash_log {
            Some(path) => CrashLog::open(path).map_err(|err| {
                Error::Configuration(format!(
                    "unable to open crash log '{}': {err}",
                    path.display()
                ))
            })?,
            None => CrashLog::stderr(),
        };

        if let Some(previous) = controller.armed.take() {
            log::info!("re-arming crash handler");
            previous.handler.detach();
            controller.state = HandlerState::Unarmed;
        }

        self.threads.initialize();

        let capture = Arc::new(CrashCapture {
            writer: SelfDumpWriter::new(&config.dump_dir, config.capture_stack),
            annotations: self.annotations.clone(),
            threads: self.threads.clone(),
            remote: self.remote.clone(),
            payload: Mutex::new(vec![0; CRASH_ANNOTATIONS_CAPACITY].into_boxed_slice()),
            log,
        });

        let event_capture = capture.clone();
        // SAFETY: CrashCapture::on_crash only uses buffers prepared above
        #[allow(unsafe_code)]
        let event = unsafe {
            crashreporter_hook::make_crash_event(move |cc: &CrashContext| event_capture.on_crash(cc))
        };

        let handler = CrashHandler::attach(event)?;
        handler.set_ptracer(config.ptracer);

        log::info!(
            "crash handler armed, writing minidumps to '{}'",
            config.dump_dir.display()
        );

        controller.armed = Some(Armed {
            handler,
            capture,
            config,
        });
        controller.state = HandlerState::Armed;
        Ok(())
    }

    /// Removes the hook, restoring the handlers it displaced, and shuts the
    /// thread annotation registry down. Crash capture can't be armed again
    /// afterwards. Does nothing unless armed.
    pub fn remove(&self) {
        let mut controller = self.controller.lock();
        if let Some(armed) = controller.armed.take() {
            armed.handler.detach();
            self.threads.shutdown();
            controller.state = HandlerState::Removed;
            log::info!("crash handler removed");
        }
    }

    #[inline]
    pub fn state(&self) -> HandlerState {
        self.controller.lock().state
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.state() == HandlerState::Armed
    }

    /// Where minidumps are currently written, if armed
    pub fn minidump_path(&self) -> Option<PathBuf> {
        self.controller
            .lock()
            .armed
            .as_ref()
            .map(|armed| armed.capture.writer.directory())
    }

    /// Changes where minidumps are written
    pub fn set_minidump_path(&self, dir: impl Into<PathBuf>) -> Result<(), Error> {
        let dir = dir.into();
        let mut controller = self.controller.lock();
        let armed = controller.armed.as_mut().ok_or(Error::NotArmed)?;

        config::ensure_writable(&dir)?;
        armed.capture.writer.set_directory(&dir);
        armed.config.dump_dir = dir;
        Ok(())
    }

    /// The process' annotations
    #[inline]
    pub fn annotations(&self) -> &AnnotationStore {
        &self.annotations
    }

    /// The process' thread names and thread annotations
    #[inline]
    pub fn thread_annotations(&self) -> &ThreadAnnotations {
        &self.threads
    }

    #[inline]
    pub fn set_server_url(&self, url: &str) {
        self.annotations.set(keys::SERVER_URL, url);
    }

    #[inline]
    pub fn server_url(&self) -> Option<String> {
        self.annotations.get(keys::SERVER_URL)
    }

    #[inline]
    pub fn set_telemetry_session_id(&self, id: &str) {
        self.annotations.set(keys::TELEMETRY_SESSION_ID, id);
    }

    /// Records the build id, and the time this build was first run which is
    /// kept in `InstallTime<build id>` in `app_data_dir`
    pub fn setup_extra_data(&self, app_data_dir: &Path, build_id: &str) -> Result<(), Error> {
        if build_id.is_empty() {
            return Err(Error::Configuration("the build id is empty".to_owned()));
        }

        self.annotations.set(keys::BUILD_ID, build_id);

        let install_file = app_data_dir.join(format!("InstallTime{build_id}"));
        let install_time = match std::fs::read_to_string(&install_file) {
            Ok(contents) if !contents.trim().is_empty() => contents.trim().to_owned(),
            _ => {
                std::fs::create_dir_all(app_data_dir)?;
                let now = raw::unix_time().to_string();
                std::fs::write(&install_file, &now)?;
                now
            }
        };

        self.annotations.set(keys::INSTALL_TIME, install_time);
        Ok(())
    }

    /// Writes a minidump of this process without crashing it, optionally
    /// moving it to the pending directory
    pub fn take_minidump(&self, move_to_pending: bool) -> Result<Dump, Error> {
        let controller = self.controller.lock();
        let armed = controller.armed.as_ref().ok_or(Error::NotArmed)?;
        let writer = &armed.capture.writer;

        let context = minidump::current_context();
        writer
            .write(
                &context,
                &self.annotations.flatten(),
                &self.threads,
                &armed.capture.log,
            )
            .map_err(|errno| Error::CaptureFailed(std::io::Error::from_raw_os_error(errno)))?;

        let dump = self.completed_dump(writer)?.ok_or_else(|| {
            Error::CaptureFailed(std::io::Error::other("the minidump was not completed"))
        })?;

        if move_to_pending {
            dump::move_to_pending(&dump, &armed.config.resolved_pending_dir())
        } else {
            Ok(dump)
        }
    }

    /// Routes a synthetic signal through the armed hook without terminating
    /// the process.
    ///
    /// Returns the minidump written locally, or `None` when the monitor wrote
    /// it or the capture failed.
    pub fn simulate_crash(&self, signal: Signal) -> Result<Option<Dump>, Error> {
        let controller = self.controller.lock();
        let armed = controller.armed.as_ref().ok_or(Error::NotArmed)?;

        let _result = armed.handler.simulate_signal(signal);
        self.completed_dump(&armed.capture.writer)
    }

    fn completed_dump(&self, writer: &SelfDumpWriter) -> Result<Option<Dump>, Error> {
        let Some(id) = writer.take_completed() else {
            return Ok(None);
        };

        let path = dump::minidump_for_id(&writer.directory(), &id);
        Dump::from_path(path, std::process::id()).map(Some)
    }

    /// Sends crash notices to the monitor at `endpoint` instead of writing
    /// minidumps locally.
    ///
    /// Returns false if the monitor can't be reached, crashes are then still
    /// written locally.
    pub fn setup_remote_handler(&self, endpoint: &RemoteEndpoint) -> bool {
        let client = match Client::connect(endpoint) {
            Ok(client) => client,
            Err(err) => {
                log::error!("unable to connect to the monitor at '{endpoint}': {err}");
                return false;
            }
        };

        if let Err(err) = client.send_annotations(&self.annotations.flatten()) {
            log::warn!("failed to send annotations to the monitor: {err}");
        }

        self.remote.publish(Some(Arc::new(client)));
        log::info!("crashes will be reported to the monitor at '{endpoint}'");
        true
    }

    /// Goes back to writing minidumps locally
    pub fn unset_remote_handler(&self) {
        if self.remote.publish(None) {
            log::info!("remote crash handler removed");
        }
    }

    #[inline]
    pub fn has_remote_handler(&self) -> bool {
        self.remote.is_set()
    }

    /// Sends the current annotations to the monitor, which writes them to
    /// the extra files of this process' dumps. Returns false when there is
    /// no remote handler.
    pub fn send_annotations_to_monitor(&self) -> Result<bool, Error> {
        let Some(client) = self.remote.read() else {
            return Ok(false);
        };

        client.send_annotations(&self.annotations.flatten())?;
        Ok(true)
    }
}

impl Drop for CrashReporter {
    fn drop(&mut self) {
        if let Some(armed) = self.controller.get_mut().armed.take() {
            armed.handler.detach();
        }
        self.threads.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{
        alloc::{GlobalAlloc, Layout, System},
        cell::Cell,
        sync::atomic::{AtomicUsize, Ordering},
    };

    /// Counts the allocations made by threads that opted in
    struct Counting;

    static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

    thread_local! {
        static COUNTING: Cell<bool> = const { Cell::new(false) };
    }

    #[allow(unsafe_code)]
    unsafe impl GlobalAlloc for Counting {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            if COUNTING.with(Cell::get) {
                ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
            }
            // SAFETY: forwarded as is
            unsafe { System.alloc(layout) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            // SAFETY: forwarded as is
            unsafe { System.dealloc(ptr, layout) }
        }
    }

    #[global_allocator]
    static GLOBAL: Counting = Counting;

    #[test]
    fn crash_path_does_not_allocate() {
        let dir = tempfile::tempdir().unwrap();

        let annotations = Arc::new(AnnotationStore::new());
        annotations.set("BuildID", "20240101");
        let threads = Arc::new(ThreadAnnotations::new());
        threads.initialize();
        threads.set_current_thread_name("main");

        let (monitor_end, child_end) = crate::create_notification_pipe_for_child().unwrap();
        let client = Client::connect(&RemoteEndpoint::Inherited(std::os::fd::IntoRawFd::into_raw_fd(
            child_end,
        )))
        .unwrap();

        let capture = CrashCapture {
            writer: SelfDumpWriter::new(dir.path(), true),
            annotations: annotations.clone(),
            threads: threads.clone(),
            remote: Arc::new(CrashView::new(Arc::new(client))),
            payload: Mutex::new(vec![0; CRASH_ANNOTATIONS_CAPACITY].into_boxed_slice()),
            log: CrashLog::stderr(),
        };

        // A thread that has never touched any of the above
        let allocations = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let cc = minidump::current_context();

                    COUNTING.with(|c| c.set(true));

                    let sent = capture.remote.read().map(|client| {
                        capture.send_annotations(&client);
                    });

                    let snapshot = capture.annotations.crash_snapshot();
                    let written = snapshot.as_deref().map(|annotations| {
                        capture
                            .writer
                            .write(&cc, annotations, &capture.threads, &capture.log)
                    });

                    COUNTING.with(|c| c.set(false));

                    assert!(sent.is_some());
                    assert_eq!(written, Some(Ok(())));
                    ALLOCATIONS.load(Ordering::SeqCst)
                })
                .join()
                .unwrap()
        });

        assert_eq!(allocations, 0);

        // The monitor end got the annotations as they were at the crash
        let mut packet = vec![0u8; 1024];
        let len = monitor_end.recv(&mut packet).unwrap();
        let json = std::str::from_utf8(&packet[8..len]).unwrap();
        let sent: AnnotationTable = serde_json::from_str(json).unwrap();
        assert_eq!(sent.get("BuildID"), Some("20240101"));
        assert!(sent.get(keys::THREAD_ID_NAME_MAPPING).is_some());

        assert!(capture.writer.take_completed().is_some());
    }
}
