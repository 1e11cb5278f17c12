//! Names and annotations of individual threads.
//!
//! The registry is only accepting records between
//! [`ThreadAnnotations::initialize`] and [`ThreadAnnotations::shutdown`], and
//! is flattened into the `ThreadIdNameMapping` annotation of crash reports.

use crate::crash_view::{CrashRef, CrashView};
use arc_swap::ArcSwap;
use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

const UNINIT: u8 = 0;
const ACTIVE: u8 = 1;
const SHUTDOWN: u8 = 2;

/// The name and annotations of a single thread
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadRecord {
    pub tid: i32,
    pub name: Option<String>,
    pub annotations: Vec<(String, String)>,
}

/// Per-thread names and annotations, flattened into the
/// `ThreadIdNameMapping` annotation when a crash is captured.
///
/// Records keep the order in which threads first registered. Updates are
/// published as a whole new record list so the crash hook can walk it
/// without locking.
pub struct ThreadAnnotations {
    phase: AtomicU8,
    writer: parking_lot::Mutex<()>,
    threads: ArcSwap<Vec<Arc<ThreadRecord>>>,
    crash: CrashView<Vec<Arc<ThreadRecord>>>,
}

impl Default for ThreadAnnotations {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel id of the calling thread
#[inline]
#[allow(unsafe_code)]
pub fn current_thread_id() -> i32 {
    // SAFETY: syscall
    unsafe {
        libc::syscall(libc::SYS_gettid) as i32
    }
}

impl ThreadAnnotations {
    pub fn new() -> Self {
        let threads = Arc::new(Vec::new());
        Self {
            phase: AtomicU8::new(UNINIT),
            writer: parking_lot::Mutex::new(()),
            threads: ArcSwap::new(threads.clone()),
            crash: CrashView::new(threads),
        }
    }

    /// Must be called with the writer lock held
    fn publish(&self, threads: Vec<Arc<ThreadRecord>>) {
        let threads = Arc::new(threads);
        self.crash.publish(Some(threads.clone()));
        self.threads.store(threads);
    }

    /// Enables registration, subsequent calls are no-ops
    pub fn initialize(&self) {
        let _ = self
            .phase
            .compare_exchange(UNINIT, ACTIVE, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Drops every record and refuses further registration
    pub fn shutdown(&self) {
        let _writer = self.writer.lock();
        self.phase.store(SHUTDOWN, Ordering::Release);
        self.publish(Vec::new());
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.phase.load(Ordering::Acquire) == ACTIVE
    }

    fn update_current(&self, apply: impl FnOnce(&mut ThreadRecord)) {
        let _writer = self.writer.lock();

        // Checked under the lock so a concurrent shutdown can't be undone
        if !self.is_active() {
            log::debug!("thread annotation ignored, registry is not active");
            return;
        }

        let tid = current_thread_id();
        let mut threads = Vec::clone(&self.threads.load());

        match threads.iter().position(|r| r.tid == tid) {
            Some(i) => {
                let mut record = ThreadRecord::clone(&threads[i]);
                apply(&mut record);
                threads[i] = Arc::new(record);
            }
            None => {
                let mut record = ThreadRecord {
                    tid,
                    name: None,
                    annotations: Vec::new(),
                };
                apply(&mut record);
                threads.push(Arc::new(record));
            }
        }

        self.publish(threads);
    }

    /// Records the display name of the calling thread
    pub fn set_current_thread_name(&self, name: &str) {
        self.update_current(|record| record.name = Some(name.to_owned()));
    }

    /// Attaches an annotation to the calling thread, replacing the value of an
    /// existing key in place
    pub fn annotate_current_thread(&self, key: &str, value: &str) {
        self.update_current(|record| {
            match record.annotations.iter_mut().find(|(k, _)| k == key) {
                Some((_, v)) => *v = value.to_owned(),
                None => record
                    .annotations
                    .push((key.to_owned(), value.to_owned())),
            }
        });
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.threads.load().is_empty()
    }

    /// The current records, in registration order
    pub fn records(&self) -> Arc<Vec<Arc<ThreadRecord>>> {
        self.threads.load_full()
    }

    /// Invokes `visit` once per registered thread with its formatted line,
    /// eg. `1234:"Main Thread" priority="high"`.
    ///
    /// Every call walks the records as they are at that moment.
    pub fn visit_flat(&self, mut visit: impl FnMut(&str)) {
        let threads = self.threads.load();
        let mut line = String::new();
        for record in threads.iter() {
            line.clear();
            let _ = emit_record(record, &mut |piece| {
                line.push_str(piece);
                Ok::<_, std::convert::Infallible>(())
            });
            visit(&line);
        }
    }

    /// The records as the crash hook sees them
    #[inline]
    pub(crate) fn crash_records(&self) -> Option<CrashRef<'_, Vec<Arc<ThreadRecord>>>> {
        self.crash.read()
    }
}

/// Emits every line joined by `,` as a series of fragments, without
/// allocating
pub(crate) fn write_flat<E>(
    records: &[Arc<ThreadRecord>],
    sink: &mut impl FnMut(&str) -> Result<(), E>,
) -> Result<(), E> {
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            sink(",")?;
        }
        emit_record(record, sink)?;
    }
    Ok(())
}

fn emit_record<E>(
    record: &ThreadRecord,
    sink: &mut impl FnMut(&str) -> Result<(), E>,
) -> Result<(), E> {
    let mut digits = crate::raw::Decimal::new();
    sink(digits.signed(record.tid.into()))?;
    sink(":\"")?;
    sink(record.name.as_deref().unwrap_or_default())?;
    sink("\"")?;

    for (key, value) in &record.annotations {
        sink(" ")?;
        sink(key)?;
        sink("=\"")?;
        sink(value)?;
        sink("\"")?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn lines(registry: &ThreadAnnotations) -> Vec<String> {
        let mut lines = Vec::new();
        registry.visit_flat(|line| lines.push(line.to_owned()));
        lines
    }

    #[test]
    fn requires_initialize() {
        let registry = ThreadAnnotations::new();
        registry.set_current_thread_name("early");
        assert!(lines(&registry).is_empty());

        registry.initialize();
        registry.initialize();
        registry.set_current_thread_name("main");

        let tid = current_thread_id();
        assert_eq!(lines(&registry), [format!("{tid}:\"main\"")]);
    }

    #[test]
    fn registration_order_and_annotations() {
        let registry = Arc::new(ThreadAnnotations::new());
        registry.initialize();
        registry.set_current_thread_name("Main Thread");

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                registry.set_current_thread_name("Worker");
                registry.annotate_current_thread("state", "idle");
                registry.annotate_current_thread("state", "busy");
                tx.send(current_thread_id()).unwrap();
            })
        };
        let worker_tid = rx.recv().unwrap();
        worker.join().unwrap();

        registry.annotate_current_thread("priority", "high");

        let main_tid = current_thread_id();
        assert_eq!(
            lines(&registry),
            [
                format!("{main_tid}:\"Main Thread\" priority=\"high\""),
                format!("{worker_tid}:\"Worker\" state=\"busy\""),
            ]
        );

        let mut joined = String::new();
        let records = registry.crash_records().unwrap();
        write_flat(&records, &mut |piece| {
            joined.push_str(piece);
            Ok::<_, ()>(())
        })
        .unwrap();
        assert_eq!(joined, lines(&registry).join(","));
    }

    #[test]
    fn shutdown_is_terminal() {
        let registry = ThreadAnnotations::new();
        registry.initialize();
        registry.set_current_thread_name("main");
        registry.shutdown();
        assert!(lines(&registry).is_empty());
        assert!(registry.crash_records().unwrap().is_empty());

        // Late registration during teardown is silently dropped
        registry.set_current_thread_name("late");
        registry.initialize();
        assert!(lines(&registry).is_empty());
        assert!(!registry.is_active());
    }
}
