//! [`CrashHandler`] arms a process-wide fault hook, executing a user-specified
//! [`CrashEvent`] with the details of the fault when one occurs.
//!
//! # Linux
//!
//! On Linux and Android this is done by handling the following
//! [signals](https://man7.org/linux/man-pages/man7/signal.7.html)
//!
//! ## `SIGABRT`
//!
//! Sent to a process to tell it to abort. Usually raised by the process
//! itself via `std::process::abort` or `libc::abort`.
//!
//! ## `SIGBUS`
//!
//! Sent when the process causes a [bus error](https://en.wikipedia.org/wiki/Bus_error).
//!
//! ## `SIGFPE`
//!
//! Sent when the process executes an erroneous arithmetic operation, integer
//! division by zero included.
//!
//! ## `SIGILL`
//!
//! Sent when the process attempts to execute an illegal, malformed, unknown,
//! or privileged instruction.
//!
//! ## `SIGSEGV`
//!
//! Sent when the process makes an invalid virtual memory reference. This
//! covers `null` pointer access, out of bounds access, use after free, stack
//! overflows, etc.
//!
//! ## `SIGTRAP`
//!
//! Sent when a trap is raised, eg. a breakpoint or debug assertion.
//!
//! Whatever handlers were installed for these signals before
//! [`CrashHandler::attach`] are saved and put back, flags and masks included,
//! by [`CrashHandler::detach`], so other in-process fault consumers keep
//! working once the hook is removed.
//!
//! An [alternate signal stack](https://man7.org/linux/man-pages/man2/sigaltstack.2.html)
//! is installed on the attaching thread so that a `SIGSEGV` caused by a stack
//! overflow can still be handled.
//!
//! A fault raised by the crash event itself, while the same thread is still
//! inside the hook, is not delivered to the event a second time. The process
//! is terminated immediately instead.

#![allow(unsafe_code)]

mod error;

pub use error::Error;

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    write_fd(2, s.as_bytes());
}

/// Writes the bytes to an already open file descriptor with a single
/// `write(2)`, ignoring any failure.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_fd(fd: i32, bytes: &[u8]) {
    // SAFETY: syscall, the buffer is valid for its length
    unsafe {
        libc::write(fd, bytes.as_ptr().cast(), bytes.len());
    }
}

pub use crash_context::CrashContext;

/// The result of the user code executed during a crash event
pub enum CrashEventResult {
    /// The event was handled in some way. `true` means the event captured
    /// the crash and the default action (termination) should follow, `false`
    /// means the previously installed handlers get a chance to run.
    Handled(bool),
}

impl From<bool> for CrashEventResult {
    fn from(b: bool) -> Self {
        Self::Handled(b)
    }
}

/// User implemented trait for handling a crash event that has ocurred.
///
/// # Safety
///
/// This trait is marked unsafe as [`Self::on_crash`] runs in a compromised
/// context. Only a small subset of libc functions are
/// [async signal safe](https://man7.org/linux/man-pages/man7/signal-safety.7.html)
/// and calling non-safe ones, such as `malloc`, can have undefined behavior.
/// Anything that needs allocation or locking must be prepared before the
/// [`CrashHandler`] is attached, or hoisted out to another process entirely.
pub unsafe trait CrashEvent: Send + Sync {
    /// Method invoked when a crash occurs. Returning true indicates your handler
    /// has processed the crash and that no further handlers should run.
    fn on_crash(&self, context: &CrashContext) -> CrashEventResult;
}

/// Creates a [`CrashEvent`] using the supplied closure as the implementation.
///
/// # Safety
///
/// See the [`CrashEvent`] Safety section for information on why this is `unsafe`.
#[inline]
pub unsafe fn make_crash_event<F>(closure: F) -> Box<dyn CrashEvent>
where
    F: Send + Sync + Fn(&CrashContext) -> CrashEventResult + 'static,
{
    struct Wrapper<F> {
        inner: F,
    }

    unsafe impl<F> CrashEvent for Wrapper<F>
    where
        F: Send + Sync + Fn(&CrashContext) -> CrashEventResult,
    {
        fn on_crash(&self, context: &CrashContext) -> CrashEventResult {
            (self.inner)(context)
        }
    }

    Box::new(Wrapper { inner: closure })
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;

        pub use linux::{CrashHandler, Signal};
    } else {
        compile_error!("unimplemented target platform");
    }
}
