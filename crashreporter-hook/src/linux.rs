mod state;

use crate::Error;

/// The signals that we support catching and raising
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(i32)]
pub enum Signal {
    Abort = libc::SIGABRT,
    Bus = libc::SIGBUS,
    Fpe = libc::SIGFPE,
    Illegal = libc::SIGILL,
    Segv = libc::SIGSEGV,
    Trap = libc::SIGTRAP,
}

impl Signal {
    /// Maps a raw signal number to one of the signals the hook handles
    #[inline]
    pub fn from_raw(signo: i32) -> Option<Self> {
        Some(match signo {
            libc::SIGABRT => Self::Abort,
            libc::SIGBUS => Self::Bus,
            libc::SIGFPE => Self::Fpe,
            libc::SIGILL => Self::Illegal,
            libc::SIGSEGV => Self::Segv,
            libc::SIGTRAP => Self::Trap,
            _ => return None,
        })
    }

    /// The conventional name of the signal, eg. `SIGSEGV`
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Self::Abort => "SIGABRT",
            Self::Bus => "SIGBUS",
            Self::Fpe => "SIGFPE",
            Self::Illegal => "SIGILL",
            Self::Segv => "SIGSEGV",
            Self::Trap => "SIGTRAP",
        }
    }

    /// Every signal the hook is installed for
    #[inline]
    pub fn all() -> [Self; 6] {
        state::FAULT_SIGNALS
    }
}

/// A Linux/Android signal handler
pub struct CrashHandler;

#[allow(clippy::unused_self)]
impl CrashHandler {
    /// Attaches the signal handler.
    ///
    /// The provided event will be invoked if a signal is caught, providing a
    /// [`crate::CrashContext`] with the details of the thread where the
    /// signal was raised.
    ///
    /// The event runs in a compromised context, so it is highly recommended
    /// to not perform actions that may fail due to corrupted state that caused
    /// or is a symptom of the original signal. This includes doing heap
    /// allocations from the same allocator as the crashing code.
    ///
    /// # Errors
    ///
    /// A handler is already attached, or the alternate stack or one of the
    /// signal handlers could not be installed. Nothing is left installed on
    /// failure.
    pub fn attach(on_crash: Box<dyn crate::CrashEvent>) -> Result<Self, Error> {
        state::attach(on_crash)?;
        Ok(Self)
    }

    /// Detaches the handler, restoring the handlers that were installed
    /// before [`Self::attach`].
    ///
    /// This is done automatically when this [`CrashHandler`] is dropped.
    #[inline]
    pub fn detach(self) {
        state::detach();
    }

    /// Whether a handler is currently attached to the process
    #[inline]
    pub fn is_attached() -> bool {
        state::ATTACHED.lock().is_some()
    }

    /// Set the process that is allowed to perform `ptrace` operations on the
    /// current process.
    ///
    /// A monitor process that writes the minidump of this process after it
    /// crashes needs to be able to ptrace it. The pid set here is passed to
    /// `prctl(PR_SET_PTRACER, <pid>, ...)` before the crash event runs. When
    /// unset, `PR_SET_PTRACER_ANY` is used.
    ///
    /// This only matters if `/proc/sys/kernel/yama/ptrace_scope` is 1
    /// "restricted ptrace", but there is no harm in setting it in other modes.
    ///
    /// See <https://www.kernel.org/doc/Documentation/security/Yama.txt> for
    /// the full documentation.
    #[inline]
    pub fn set_ptracer(&self, pid: Option<u32>) {
        if let Some(attached) = &mut *state::ATTACHED.lock() {
            attached.ptracer = pid;
        }
    }

    /// Routes a synthetic `signal` through the attached crash event, as if
    /// it had been raised on the calling thread, without terminating the
    /// process afterwards.
    pub fn simulate_signal(&self, signal: Signal) -> crate::CrashEventResult {
        state::simulate(signal)
    }
}

impl Drop for CrashHandler {
    fn drop(&mut self) {
        state::detach();
    }
}
