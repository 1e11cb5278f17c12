//! The process-wide key/value annotations attached to every crash report.
//!
//! Writers serialize on a mutex, build a complete new [`AnnotationTable`] and
//! publish it with a single pointer swap. Readers only ever load the
//! currently published table, so they never block on the writer lock and
//! never observe a half-applied update. The crash hook reads the same table
//! through a [`CrashView`], which needs no per-thread state.

use crate::crash_view::{CrashRef, CrashView};
use arc_swap::ArcSwap;
use std::{collections::BTreeMap, sync::Arc};

/// Annotation keys populated or interpreted by the reporter itself
pub mod keys {
    pub const BUILD_ID: &str = "BuildID";
    pub const CRASH_TIME: &str = "CrashTime";
    pub const INSTALL_TIME: &str = "InstallTime";
    pub const SERVER_URL: &str = "ServerURL";
    pub const TELEMETRY_SESSION_ID: &str = "TelemetrySessionId";
    pub const NOTES: &str = "Notes";
    pub const THREAD_ID_NAME_MAPPING: &str = "ThreadIdNameMapping";
    pub const CAPTURE_DEGRADED: &str = "CaptureDegraded";
    pub const ADDITIONAL_MINIDUMPS: &str = "additional_minidumps";
    pub const IS_GARBAGE_COLLECTING: &str = "IsGarbageCollecting";
    pub const EVENT_LOOP_NESTING_LEVEL: &str = "EventLoopNestingLevel";
    pub const OOM_ALLOCATION_SIZE: &str = "OOMAllocationSize";
    pub const PROCESS_TYPE: &str = "ProcessType";
}

/// An immutable snapshot of annotations, ordered by key
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(
    from = "BTreeMap<String, String>",
    into = "BTreeMap<String, String>"
)]
pub struct AnnotationTable {
    entries: Vec<(String, String)>,
}

impl AnnotationTable {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn position(&self, key: &str) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_str().cmp(key))
    }

    /// Retrieves the value for the key, if present
    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.position(key)
            .ok()
            .map(|i| self.entries[i].1.as_str())
    }

    /// Inserts or replaces a value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Ok(i) => self.entries[i].1 = value,
            Err(i) => self.entries.insert(i, (key, value)),
        }
    }

    /// Removes the key, returning its previous value
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let i = self.position(key).ok()?;
        Some(self.entries.remove(i).1)
    }

    /// Inserts every entry of `other`, its values winning over ours
    pub fn merge(&mut self, other: &AnnotationTable) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<BTreeMap<String, String>> for AnnotationTable {
    fn from(map: BTreeMap<String, String>) -> Self {
        // BTreeMap iteration is already sorted by key
        Self {
            entries: map.into_iter().collect(),
        }
    }
}

impl From<AnnotationTable> for BTreeMap<String, String> {
    fn from(table: AnnotationTable) -> Self {
        table.entries.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AnnotationTable {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut table = Self::new();
        for (k, v) in iter {
            table.insert(k, v);
        }
        table
    }
}

/// Process-wide annotation store
pub struct AnnotationStore {
    writer: parking_lot::Mutex<()>,
    current: ArcSwap<AnnotationTable>,
    crash: CrashView<AnnotationTable>,
}

impl Default for AnnotationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnotationStore {
    pub fn new() -> Self {
        let table = Arc::new(AnnotationTable::new());
        Self {
            writer: parking_lot::Mutex::new(()),
            current: ArcSwap::new(table.clone()),
            crash: CrashView::new(table),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut AnnotationTable) -> bool) {
        let _writer = self.writer.lock();
        let mut next = AnnotationTable::clone(&self.current.load());
        if apply(&mut next) {
            let next = Arc::new(next);
            self.crash.publish(Some(next.clone()));
            self.current.store(next);
        }
    }

    /// Sets the value for the key, replacing any previous value
    pub fn set(&self, key: &str, value: impl Into<String>) {
        if key.is_empty() {
            log::warn!("ignoring annotation with an empty key");
            return;
        }

        let value = value.into();
        self.update(|table| {
            table.insert(key, value);
            true
        });
    }

    /// Removes the key, a no-op if it isn't present
    pub fn remove(&self, key: &str) {
        self.update(|table| table.remove(key).is_some());
    }

    /// Gets the current value for the key
    pub fn get(&self, key: &str) -> Option<String> {
        self.current.load().get(key).map(str::to_owned)
    }

    /// Returns the currently published snapshot.
    ///
    /// Calling this twice with no writes in between returns the same snapshot.
    #[inline]
    pub fn flatten(&self) -> Arc<AnnotationTable> {
        self.current.load_full()
    }

    /// Borrows the published snapshot without the writer lock, the
    /// allocator or any thread-local state, this is what the crash hook reads
    #[inline]
    pub(crate) fn crash_snapshot(&self) -> Option<CrashRef<'_, AnnotationTable>> {
        self.crash.read()
    }

    /// Appends `data` to the free-form `Notes` annotation
    pub fn append_app_notes(&self, data: &str) {
        self.update(|table| {
            let mut notes = table.get(keys::NOTES).unwrap_or_default().to_owned();
            notes.push_str(data);
            table.insert(keys::NOTES, notes);
            true
        });
    }

    #[inline]
    pub fn set_garbage_collecting(&self, collecting: bool) {
        if collecting {
            self.set(keys::IS_GARBAGE_COLLECTING, "1");
        } else {
            self.remove(keys::IS_GARBAGE_COLLECTING);
        }
    }

    #[inline]
    pub fn set_event_loop_nesting_level(&self, level: u32) {
        if level > 0 {
            self.set(keys::EVENT_LOOP_NESTING_LEVEL, level.to_string());
        } else {
            self.remove(keys::EVENT_LOOP_NESTING_LEVEL);
        }
    }

    #[inline]
    pub fn annotate_oom_allocation_size(&self, size: usize) {
        self.set(keys::OOM_ALLOCATION_SIZE, size.to_string());
    }
}
