//! Monitor side of out-of-process capture.
//!
//! A [`Monitor`] writes minidumps of the child processes it watches, numbers
//! every dump it is asked for with the child's own sequence counter, and
//! pairs child dumps with dumps of other processes that describe the same
//! incident.

use crate::{
    AnnotationTable, Error, MonitorConfig, ThreadAnnotations,
    dump::{self, Dump},
    extra, keys,
    minidump::{self, SelfDumpWriter},
    raw::{self, CrashLog},
};
use crash_context::CrashContext;
use parking_lot::Mutex;
use std::{collections::HashMap, fs::File, path::Path, sync::Arc};

/// Produces the minidump of another process
pub trait ProcessDumper: Send + Sync {
    /// Writes a minidump of `pid` into `file`, blaming thread `tid`.
    ///
    /// `context` is the crash context the process sent along with its crash
    /// notice, if it sent one.
    fn dump(
        &self,
        pid: u32,
        tid: u32,
        context: Option<CrashContext>,
        file: &mut File,
    ) -> Result<(), Error>;
}

/// Dumps processes by attaching to them with ptrace
pub struct PtraceDumper;

impl ProcessDumper for PtraceDumper {
    fn dump(
        &self,
        pid: u32,
        tid: u32,
        context: Option<CrashContext>,
        file: &mut File,
    ) -> Result<(), Error> {
        let mut writer =
            minidump_writer::minidump_writer::MinidumpWriter::new(pid as i32, tid as i32);
        if let Some(inner) = context {
            writer.set_crash_context(minidump_writer::crash_context::CrashContext { inner });
        }

        writer.dump(file)?;
        Ok(())
    }
}

/// Request to dump a child and pair it with another dump
#[derive(Debug)]
pub struct PairRequest {
    pub child_pid: u32,
    pub blamed_thread: u32,
    /// The name the paired dump is stored under, eg. `browser`
    pub pair_name: String,
    /// A dump already taken for the incident. When `None`, the monitor
    /// dumps its own process instead.
    pub incoming: Option<Dump>,
}

/// The outcome of a successful [`Monitor::create_minidumps_and_pair`]
#[derive(Clone, Debug)]
pub struct PairedDumps {
    /// The dump the monitor wrote of the child
    pub child: Dump,
    /// The paired dump, now stored as `<child id>-<pair name>.dmp`
    pub paired: Dump,
    /// The child's sequence number of [`Self::child`]
    pub sequence: u32,
}

/// Pending result of [`Monitor::create_minidumps_and_pair_async`]
pub struct PairCompletion {
    rx: std::sync::mpsc::Receiver<Result<PairedDumps, Error>>,
}

impl PairCompletion {
    /// Blocks until the pairing has finished
    pub fn wait(self) -> Result<PairedDumps, Error> {
        self.rx
            .recv()
            .unwrap_or_else(|_err| Err(Error::Protocol("pairing worker vanished".to_owned())))
    }

    /// Returns the result if the pairing has finished. The result is only
    /// returned once.
    pub fn try_wait(&mut self) -> Option<Result<PairedDumps, Error>> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
struct DumpState {
    next_sequence: u32,
    latest: Option<(Dump, u32)>,
}

/// Everything the monitor tracks about a single child
#[derive(Default)]
struct ChildSlot {
    /// Held for the whole of a dump, serializing dumps of the same child
    dumps: Mutex<DumpState>,
    annotations: Mutex<AnnotationTable>,
}

/// Children keyed by pid. The map lock is only held to find or create a
/// slot, so dumps of unrelated children never wait on each other.
#[derive(Default)]
struct ChildArena {
    children: Mutex<HashMap<u32, Arc<ChildSlot>>>,
}

impl ChildArena {
    fn slot(&self, pid: u32) -> Arc<ChildSlot> {
        self.children.lock().entry(pid).or_default().clone()
    }

    fn existing(&self, pid: u32) -> Option<Arc<ChildSlot>> {
        self.children.lock().get(&pid).cloned()
    }

    fn remove(&self, pid: u32) -> bool {
        self.children.lock().remove(&pid).is_some()
    }
}

struct Inner {
    config: MonitorConfig,
    arena: ChildArena,
    self_writer: Mutex<Option<SelfDumpWriter>>,
}

/// Writes and pairs the minidumps of monitored child processes.
///
/// Cloning is cheap, clones share the same children.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<Inner>,
}

impl Monitor {
    /// Creates a monitor, creating its dump and events directories if needed
    pub fn new(config: MonitorConfig) -> Result<Self, Error> {
        std::fs::create_dir_all(&config.dump_dir)?;
        if let Some(events) = &config.events_dir {
            std::fs::create_dir_all(events)?;
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                arena: ChildArena::default(),
                self_writer: Mutex::new(None),
            }),
        })
    }

    #[inline]
    pub fn dump_dir(&self) -> &Path {
        &self.inner.config.dump_dir
    }

    /// Writes a minidump of a (suspended or crashed) child process.
    ///
    /// The dump consumes the child's next sequence number and becomes the
    /// one returned by [`Self::take_minidump_for_child`].
    pub fn write_remote_dump(&self, pid: u32, tid: u32) -> Result<Dump, Error> {
        self.dump_child(pid, tid, None).map(|(dump, _sequence)| dump)
    }

    /// Same as [`Self::write_remote_dump`], using the crash context the child
    /// captured for itself
    pub fn dump_child(
        &self,
        pid: u32,
        tid: u32,
        context: Option<CrashContext>,
    ) -> Result<(Dump, u32), Error> {
        self.write_child_dump(pid, tid, context, true)
    }

    fn write_child_dump(
        &self,
        pid: u32,
        tid: u32,
        context: Option<CrashContext>,
        record: bool,
    ) -> Result<(Dump, u32), Error> {
        let slot = self.inner.arena.slot(pid);
        let mut state = slot.dumps.lock();

        // Taken before writing so a failed dump still uses up its number
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let id = uuid::Uuid::new_v4().to_string();
        let path = dump::minidump_for_id(self.dump_dir(), &id);

        log::debug!("writing minidump {id} of child {pid}:{tid} (sequence {sequence})");

        let written = File::create(&path)
            .map_err(Error::CaptureFailed)
            .and_then(|mut file| {
                self.inner.config.dumper.dump(pid, tid, context, &mut file)?;
                file.sync_all()?;
                Ok(())
            });

        if let Err(err) = written {
            log::error!("failed to write minidump of child {pid}: {err}");
            let _ = std::fs::remove_file(&path);
            return Err(err);
        }

        let dump = Dump::from_path(path, pid)?;

        let mut annotations = slot.annotations.lock().clone();
        annotations.insert(keys::CRASH_TIME, raw::unix_time().to_string());
        extra::write_extra_file(&dump.extra_path(), &annotations)?;

        if record {
            state.latest = Some((dump.clone(), sequence));
        }
        drop(state);

        if let Some(events) = &self.inner.config.events_dir {
            if let Err(err) = write_crash_event(events, &dump, &annotations) {
                log::error!("failed to write crash event for {}: {err}", dump.id());
            }
        }

        log::info!("wrote minidump {} of child {pid}", dump.id());
        Ok((dump, sequence))
    }

    /// The most recent dump written for the child, and its sequence number.
    ///
    /// The dump is not consumed, asking again without a new dump in between
    /// returns the same dump.
    pub fn take_minidump_for_child(&self, pid: u32) -> Result<(Dump, u32), Error> {
        let slot = self
            .inner
            .arena
            .existing(pid)
            .ok_or(Error::UnknownChild(pid))?;
        let state = slot.dumps.lock();
        state.latest.clone().ok_or(Error::UnknownChild(pid))
    }

    /// Replaces the annotations written to the extra files of the child's
    /// dumps
    pub fn cache_annotations(&self, pid: u32, annotations: AnnotationTable) {
        *self.inner.arena.slot(pid).annotations.lock() = annotations;
    }

    /// Drops everything tracked for an exited child
    pub fn forget_child(&self, pid: u32) {
        if self.inner.arena.remove(pid) {
            log::debug!("forgot child {pid}");
        }
    }

    /// Dumps the child, then stores the request's incoming dump (or a dump of
    /// this process) next to it as `<child id>-<pair name>.dmp` and lists the
    /// pair name in the child's `additional_minidumps` annotation.
    ///
    /// Pairing the same child dump under a name that is already taken adds a
    /// `-2`, `-3`... suffix rather than replacing the earlier dump.
    pub fn create_minidumps_and_pair(&self, request: PairRequest) -> Result<PairedDumps, Error> {
        let PairRequest {
            child_pid,
            blamed_thread,
            pair_name,
            incoming,
        } = request;

        if pair_name.is_empty() || pair_name.contains(['/', ',']) {
            return Err(Error::Configuration(format!(
                "'{pair_name}' is not a valid pair name"
            )));
        }

        let (child, sequence) = self.dump_child(child_pid, blamed_thread, None)?;

        let other = match incoming {
            Some(dump) => dump,
            None => self.dump_self()?,
        };

        let paired = self.attach_additional(&child, other, &pair_name)?;

        Ok(PairedDumps {
            child,
            paired,
            sequence,
        })
    }

    /// Runs [`Self::create_minidumps_and_pair`] on another thread, calling
    /// `callback` with the result exactly once, from an unspecified thread
    pub fn create_minidumps_and_pair_with<F>(&self, request: PairRequest, callback: F)
    where
        F: FnOnce(Result<PairedDumps, Error>) + Send + 'static,
    {
        let callback = Arc::new(Mutex::new(Some(callback)));
        let worker_callback = callback.clone();
        let monitor = self.clone();

        let spawned = std::thread::Builder::new()
            .name("crashreporter-pair".to_owned())
            .spawn(move || {
                let result = monitor.create_minidumps_and_pair(request);
                if let Some(callback) = worker_callback.lock().take() {
                    callback(result);
                }
            });

        if let Err(err) = spawned {
            log::error!("failed to spawn pairing thread: {err}");
            if let Some(callback) = callback.lock().take() {
                callback(Err(err.into()));
            }
        }
    }

    /// Non-blocking [`Self::create_minidumps_and_pair`]
    pub fn create_minidumps_and_pair_async(&self, request: PairRequest) -> PairCompletion {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.create_minidumps_and_pair_with(request, move |result| {
            let _ = tx.send(result);
        });
        PairCompletion { rx }
    }

    /// Dumps the child and stores it next to `parent` as
    /// `<parent id>-<name>.dmp`, listing `name` in the parent's
    /// `additional_minidumps` annotation.
    ///
    /// The dump consumes a sequence number but does not replace the child's
    /// latest dump.
    pub fn create_additional_child_minidump(
        &self,
        child_pid: u32,
        blamed_thread: u32,
        parent: &Dump,
        name: &str,
    ) -> Result<Dump, Error> {
        let (dump, _sequence) = self.write_child_dump(child_pid, blamed_thread, None, false)?;
        self.attach_additional(parent, dump, name)
    }

    /// Writes a minidump of the monitor process itself
    fn dump_self(&self) -> Result<Dump, Error> {
        let mut writer = self.inner.self_writer.lock();
        let writer =
            writer.get_or_insert_with(|| SelfDumpWriter::new(&self.inner.config.dump_dir, true));

        let context = minidump::current_context();
        writer
            .write(
                &context,
                &AnnotationTable::new(),
                &ThreadAnnotations::new(),
                &CrashLog::stderr(),
            )
            .map_err(|errno| Error::CaptureFailed(std::io::Error::from_raw_os_error(errno)))?;

        let id = writer.take_completed().ok_or_else(|| {
            Error::CaptureFailed(std::io::Error::other("self dump did not complete"))
        })?;

        Dump::from_path(
            dump::minidump_for_id(self.dump_dir(), &id),
            std::process::id(),
        )
    }

    /// Moves `other` next to `main` under `<main id>-<name>` and records it
    /// in `main`'s extra file. If `other` was the latest dump of its child,
    /// the child's latest dump follows it to the new path.
    fn attach_additional(&self, main: &Dump, mut other: Dump, name: &str) -> Result<Dump, Error> {
        let dir = main.path().parent().unwrap_or_else(|| Path::new("."));

        let mut suffixed = name.to_owned();
        let mut attempt = 1;
        while dump::minidump_for_id(dir, &format!("{}-{suffixed}", main.id())).exists() {
            attempt += 1;
            suffixed = format!("{name}-{attempt}");
        }

        let previous = other.path().to_owned();
        other.rename_to(dir, &format!("{}-{suffixed}", main.id()))?;

        if let Some(slot) = self.inner.arena.existing(other.pid()) {
            let mut state = slot.dumps.lock();
            if let Some((latest, _sequence)) = &mut state.latest {
                if latest.path() == previous {
                    *latest = other.clone();
                }
            }
        }

        extra::add_additional_minidump(&main.extra_path(), &suffixed)?;

        log::info!("paired {} with {}", other.id(), main.id());
        Ok(other)
    }
}

/// Crash event files are picked up by whatever submits crash reports
fn write_crash_event(dir: &Path, dump: &Dump, annotations: &AnnotationTable) -> Result<(), Error> {
    let process_type = annotations.get(keys::PROCESS_TYPE).unwrap_or("content");
    let crash_time = annotations.get(keys::CRASH_TIME).unwrap_or("0");

    let mut contents = format!("crash.{process_type}.3\n{crash_time}\n{}\n", dump.id());
    contents.push_str(&serde_json::to_string(annotations)?);

    std::fs::write(dir.join(dump.id()), contents)?;
    Ok(())
}
