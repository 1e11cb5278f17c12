use crate::{Error, monitor::ProcessDumper};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Overrides the dump directory passed to [`HandlerConfig::from_env`]
pub const DUMP_DIR_ENV: &str = "CRASHREPORTER_DUMP_DIR";
/// Path of a file the crash hook logs to instead of stderr
pub const CRASH_LOG_ENV: &str = "CRASHREPORTER_CRASH_LOG";
/// When set to anything but `0` or an empty string, arming the handler fails
pub const DISABLE_ENV: &str = "CRASHREPORTER_DISABLE";

/// Settings for arming a [`crate::CrashReporter`]
#[derive(Clone, Debug)]
pub struct HandlerConfig {
    pub dump_dir: PathBuf,
    /// Where dumps wait to be submitted, `<dump_dir>/pending` when unset
    pub pending_dir: Option<PathBuf>,
    /// The crash hook logs here, stderr when unset
    pub crash_log: Option<PathBuf>,
    /// The process allowed to ptrace this one once it has crashed, any
    /// process when unset
    pub ptracer: Option<u32>,
    /// Copy the crashing thread's stack into self-written dumps
    pub capture_stack: bool,
}

impl HandlerConfig {
    pub fn new(dump_dir: impl Into<PathBuf>) -> Self {
        Self {
            dump_dir: dump_dir.into(),
            pending_dir: None,
            crash_log: None,
            ptracer: None,
            capture_stack: true,
        }
    }

    /// Applies the `CRASHREPORTER_*` environment overrides on top of the
    /// defaults for `dump_dir`
    pub fn from_env(dump_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(dump_dir);

        if let Some(dir) = std::env::var_os(DUMP_DIR_ENV).filter(|d| !d.is_empty()) {
            config.dump_dir = dir.into();
        }

        if let Some(log) = std::env::var_os(CRASH_LOG_ENV).filter(|l| !l.is_empty()) {
            config.crash_log = Some(log.into());
        }

        config
    }

    #[inline]
    pub fn pending_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pending_dir = Some(dir.into());
        self
    }

    #[inline]
    pub fn crash_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.crash_log = Some(path.into());
        self
    }

    #[inline]
    pub fn ptracer(mut self, pid: u32) -> Self {
        self.ptracer = Some(pid);
        self
    }

    #[inline]
    pub fn capture_stack(mut self, capture: bool) -> Self {
        self.capture_stack = capture;
        self
    }

    /// The effective pending directory
    pub fn resolved_pending_dir(&self) -> PathBuf {
        self.pending_dir
            .clone()
            .unwrap_or_else(|| self.dump_dir.join("pending"))
    }
}

/// True if the environment asks for crash reporting to stay off
pub fn disabled_by_env() -> bool {
    std::env::var_os(DISABLE_ENV).is_some_and(|v| !v.is_empty() && v != "0")
}

/// Checks that files can be created in the directory
pub(crate) fn ensure_writable(dir: &Path) -> Result<(), Error> {
    if !dir.is_dir() {
        return Err(Error::Configuration(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }

    let scratch = dir.join(format!(".crashreporter-write-check-{}", std::process::id()));
    std::fs::write(&scratch, b"").map_err(|err| {
        Error::Configuration(format!("'{}' is not writable: {err}", dir.display()))
    })?;
    let _ = std::fs::remove_file(&scratch);

    Ok(())
}

/// Settings for a [`crate::Monitor`]
#[derive(Clone)]
pub struct MonitorConfig {
    /// Where child minidumps are written
    pub dump_dir: PathBuf,
    /// Where crash event files are written, none are written when unset
    pub events_dir: Option<PathBuf>,
    /// Produces the minidumps of other processes
    pub dumper: Arc<dyn ProcessDumper>,
}

impl MonitorConfig {
    pub fn new(dump_dir: impl Into<PathBuf>) -> Self {
        Self {
            dump_dir: dump_dir.into(),
            events_dir: None,
            dumper: Arc::new(crate::PtraceDumper),
        }
    }

    #[inline]
    pub fn events_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.events_dir = Some(dir.into());
        self
    }

    #[inline]
    pub fn dumper(mut self, dumper: Arc<dyn ProcessDumper>) -> Self {
        self.dumper = dumper;
        self
    }
}

impl std::fmt::Debug for MonitorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorConfig")
            .field("dump_dir", &self.dump_dir)
            .field("events_dir", &self.events_dir)
            .finish_non_exhaustive()
    }
}
