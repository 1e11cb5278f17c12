use crate::{CrashEventResult, Error, Signal};
use std::{
    mem, ptr,
    sync::atomic::{AtomicI32, Ordering},
};

const fn get_stack_size() -> usize {
    if libc::SIGSTKSZ > 16 * 1024 {
        libc::SIGSTKSZ
    } else {
        16 * 1024
    }
}

/// The size of the alternate stack mapped for the attaching thread.
///
/// At least 16k, only committed if a stack overflow actually happens.
const SIG_STACK_SIZE: usize = get_stack_size();

/// kill
const SI_USER: i32 = 0;

/// The signals the hook is installed for, in the order their previous
/// actions are saved
pub(super) const FAULT_SIGNALS: [Signal; 6] = [
    Signal::Abort,
    Signal::Bus,
    Signal::Fpe,
    Signal::Illegal,
    Signal::Segv,
    Signal::Trap,
];

/// An alternate stack we mapped and registered
struct AltStack {
    previous: Option<libc::stack_t>,
    ours: libc::stack_t,
}

/// Everything installed by [`attach`] and undone by [`detach`]
pub(super) struct Attached {
    event: Box<dyn crate::CrashEvent>,
    pub(super) ptracer: Option<u32>,
    previous: [libc::sigaction; 6],
    alt_stack: Option<AltStack>,
}

// SAFETY: the only non-Send member is the stack pointer, which is never
// dereferenced, only handed back to the kernel
unsafe impl Send for Attached {}

pub(super) static ATTACHED: parking_lot::Mutex<Option<Attached>> = parking_lot::const_mutex(None);

/// The tid of the thread currently running the crash event, 0 if none
static HANDLING_THREAD: AtomicI32 = AtomicI32::new(0);

/// Too large for the alternate stack, so it lives in .bss
static CRASH_CONTEXT: parking_lot::Mutex<crash_context::CrashContext> =
    parking_lot::const_mutex(unsafe { mem::zeroed() });

#[inline]
fn gettid() -> i32 {
    // SAFETY: syscall
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Maps and registers an alternate stack for the signal handler to run on,
/// unless a large enough one is already registered on this thread
unsafe fn install_sigaltstack() -> Result<Option<AltStack>, Error> {
    unsafe {
        let mut existing: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut existing) == -1 {
            return Err(Error::AlternateStack(std::io::Error::last_os_error()));
        }

        if existing.ss_flags & libc::SS_DISABLE == 0 && existing.ss_size >= SIG_STACK_SIZE {
            return Ok(None);
        }

        let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let alloc_size = guard_size + SIG_STACK_SIZE;

        let mapping = libc::mmap(
            ptr::null_mut(),
            alloc_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if mapping == libc::MAP_FAILED {
            return Err(Error::AlternateStack(std::io::Error::last_os_error()));
        }

        // The first page stays PROT_NONE as a guard
        let stack_ptr = (mapping as usize + guard_size) as *mut libc::c_void;
        if libc::mprotect(
            stack_ptr,
            SIG_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
        ) == -1
        {
            let err = std::io::Error::last_os_error();
            libc::munmap(mapping, alloc_size);
            return Err(Error::AlternateStack(err));
        }

        let ours = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: SIG_STACK_SIZE,
        };
        if libc::sigaltstack(&ours, ptr::null_mut()) == -1 {
            let err = std::io::Error::last_os_error();
            libc::munmap(mapping, alloc_size);
            return Err(Error::AlternateStack(err));
        }

        Ok(Some(AltStack {
            previous: (existing.ss_flags & libc::SS_DISABLE == 0).then_some(existing),
            ours,
        }))
    }
}

/// Puts back the alternate stack that was registered before ours.
///
/// The registration is per-thread, if this is called from a thread other than
/// the one that attached, our stack is still live there and the mapping is
/// left alone.
unsafe fn restore_sigaltstack(alt: &AltStack) {
    unsafe {
        let mut current: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut current) == -1 || current.ss_sp != alt.ours.ss_sp {
            return;
        }

        let restored = if let Some(previous) = alt.previous {
            libc::sigaltstack(&previous, ptr::null_mut())
        } else {
            let mut disable: libc::stack_t = mem::zeroed();
            disable.ss_flags = libc::SS_DISABLE;
            libc::sigaltstack(&disable, ptr::null_mut())
        };

        if restored == 0 {
            let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let mapping = (alt.ours.ss_sp as usize - guard_size) as *mut libc::c_void;
            libc::munmap(mapping, guard_size + alt.ours.ss_size);
        }
    }
}

/// Restores the default action for the signal, as described in
/// <https://man7.org/linux/man-pages/man7/signal.7.html>
unsafe fn install_default_handler(sig: i32) {
    // Android L+ interpose signal and sigaction, and a request to set SIG_DFL
    // is ignored by them, which would loop forever re-entering our handler, so
    // go to the kernel directly there
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                let mut sa: libc::sigaction = mem::zeroed();
                libc::sigemptyset(&mut sa.sa_mask);
                sa.sa_sigaction = libc::SIG_DFL;
                sa.sa_flags = libc::SA_RESTART;
                libc::syscall(
                    libc::SYS_rt_sigaction,
                    sig,
                    &sa,
                    ptr::null::<libc::sigaction>(),
                    mem::size_of::<libc::sigset_t>(),
                );
            } else {
                libc::signal(sig, libc::SIG_DFL);
            }
        }
    }
}

/// Reinstalls the saved actions, flags and masks included, falling back to
/// the default action for any that cannot be put back
unsafe fn restore_handlers(previous: &[libc::sigaction]) {
    unsafe {
        for (sig, action) in FAULT_SIGNALS.iter().zip(previous) {
            if libc::sigaction(*sig as i32, action, ptr::null_mut()) == -1 {
                install_default_handler(*sig as i32);
            }
        }
    }
}

unsafe fn install_handlers() -> Result<[libc::sigaction; 6], Error> {
    unsafe {
        let mut previous: [libc::sigaction; 6] = mem::zeroed();
        for (sig, slot) in FAULT_SIGNALS.iter().zip(previous.iter_mut()) {
            if libc::sigaction(*sig as i32, ptr::null(), slot) == -1 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
        }

        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);

        // Every fault signal is masked while one of them is being handled
        for sig in FAULT_SIGNALS {
            libc::sigaddset(&mut sa.sa_mask, sig as i32);
        }

        sa.sa_sigaction = signal_handler as usize;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

        for (installed, sig) in FAULT_SIGNALS.iter().enumerate() {
            if libc::sigaction(*sig as i32, &sa, ptr::null_mut()) == -1 {
                let err = std::io::Error::last_os_error();
                restore_handlers(&previous[..installed]);
                return Err(Error::Io(err));
            }
        }

        Ok(previous)
    }
}

pub(super) fn attach(event: Box<dyn crate::CrashEvent>) -> Result<(), Error> {
    let mut lock = ATTACHED.lock();

    if lock.is_some() {
        return Err(Error::AlreadyAttached);
    }

    // SAFETY: syscalls
    let (alt_stack, previous) = unsafe {
        let alt_stack = install_sigaltstack()?;
        match install_handlers() {
            Ok(previous) => (alt_stack, previous),
            Err(err) => {
                if let Some(alt) = &alt_stack {
                    restore_sigaltstack(alt);
                }
                return Err(err);
            }
        }
    };

    *lock = Some(Attached {
        event,
        ptracer: None,
        previous,
        alt_stack,
    });

    Ok(())
}

/// Restores the handlers and alternate stack that were in place before
/// [`attach`], a no-op if nothing is attached
pub(super) fn detach() {
    let mut lock = ATTACHED.lock();
    if let Some(attached) = lock.take() {
        // SAFETY: syscalls
        unsafe {
            restore_handlers(&attached.previous);
            if let Some(alt) = &attached.alt_stack {
                restore_sigaltstack(alt);
            }
        }
    }
}

/// Runs the crash event for a synthetic signal raised on the calling thread
pub(super) fn simulate(signal: Signal) -> CrashEventResult {
    let tid = gettid();
    if HANDLING_THREAD.load(Ordering::Acquire) == tid {
        // Simulating from inside the crash event would deadlock on the state
        return CrashEventResult::Handled(false);
    }

    // SAFETY: the siginfo is plain old data, getcontext fills the zeroed
    // context
    unsafe {
        let mut siginfo: libc::signalfd_siginfo = mem::zeroed();
        siginfo.ssi_signo = signal as u32;
        siginfo.ssi_code = SI_USER;
        siginfo.ssi_pid = std::process::id();
        siginfo.ssi_tid = tid as u32;

        let mut context: crash_context::ucontext_t = mem::zeroed();
        crash_context::crash_context_getcontext(&mut context);

        let attached = ATTACHED.lock();
        let Some(attached) = &*attached else {
            return CrashEventResult::Handled(false);
        };

        HANDLING_THREAD.store(tid, Ordering::Release);
        let result = attached.capture(&siginfo, None, &context);
        HANDLING_THREAD.store(0, Ordering::Release);
        result
    }
}

/// The function installed for each fault signal, invoked by the kernel
unsafe extern "C" fn signal_handler(sig: i32, info: *mut libc::siginfo_t, uc: *mut libc::c_void) {
    unsafe {
        // Code that saves and restores handlers with `signal` instead of
        // `sigaction` drops SA_SIGINFO, which makes `info` and `uc` garbage.
        // Reinstall ourselves properly and return, the signal will be raised
        // again with the right arguments.
        {
            let mut current: libc::sigaction = mem::zeroed();
            if libc::sigaction(sig, ptr::null_mut(), &mut current) == 0
                && current.sa_sigaction == signal_handler as usize
                && current.sa_flags & libc::SA_SIGINFO == 0
            {
                libc::sigemptyset(&mut current.sa_mask);
                libc::sigaddset(&mut current.sa_mask, sig);

                current.sa_sigaction = signal_handler as usize;
                current.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

                if libc::sigaction(sig, &current, ptr::null_mut()) == -1 {
                    install_default_handler(sig);
                }

                return;
            }
        }

        let tid = gettid();
        if HANDLING_THREAD.load(Ordering::Acquire) == tid {
            // The crash event itself faulted
            debug_print!("fault while handling a fault, terminating");
            install_default_handler(sig);
            libc::_exit(128 + sig);
        }

        let info = &*info;

        enum Action {
            RestoreDefault,
            RestorePrevious([libc::sigaction; 6]),
        }

        let action = {
            // Other faulting threads wait here until the first one is done
            let attached = ATTACHED.lock();

            if let Some(attached) = &*attached {
                HANDLING_THREAD.store(tid, Ordering::Release);
                let siginfo = &*(ptr::from_ref(info).cast::<libc::signalfd_siginfo>());
                let context = &*(uc.cast_const().cast::<crash_context::ucontext_t>());
                let fault_address = matches!(
                    sig,
                    libc::SIGSEGV | libc::SIGBUS | libc::SIGFPE | libc::SIGILL | libc::SIGTRAP
                )
                .then(|| info.si_addr() as u64);

                let result = attached.capture(siginfo, fault_address, context);
                HANDLING_THREAD.store(0, Ordering::Release);

                match result {
                    CrashEventResult::Handled(true) => Action::RestoreDefault,
                    CrashEventResult::Handled(false) => Action::RestorePrevious(attached.previous),
                }
            } else {
                Action::RestoreDefault
            }
        };

        // Once we return, the signal is unmasked and raised again. Either the
        // default action terminates the process, or the handler that was there
        // before us gets its turn.
        match action {
            Action::RestoreDefault => {
                debug_print!("installing default handler");
                install_default_handler(sig);
            }
            Action::RestorePrevious(previous) => {
                debug_print!("restoring previous handlers");
                restore_handlers(&previous);
            }
        }

        debug_print!("finishing signal handler");

        if info.si_code <= 0 || sig == libc::SIGABRT {
            // Sent with kill() (or a SysRq SIGABRT), it won't come back on its
            // own so queue it again ourselves
            if libc::syscall(libc::SYS_tgkill, std::process::id(), tid, sig) < 0 {
                libc::_exit(1);
            }
        }
    }
}

impl Attached {
    /// Fills the static crash context from the signal details and hands it
    /// to the crash event
    unsafe fn capture(
        &self,
        siginfo: &libc::signalfd_siginfo,
        fault_address: Option<u64>,
        uc: &crash_context::ucontext_t,
    ) -> CrashEventResult {
        unsafe {
            let _dumpable = SetDumpable::new(self.ptracer);
            debug_print!("set dumpable");

            let mut cc = CRASH_CONTEXT.lock();

            {
                use std::ops::DerefMut;
                #[allow(clippy::explicit_deref_methods)]
                ptr::write_bytes(cc.deref_mut(), 0, 1);

                ptr::copy_nonoverlapping(siginfo, &mut cc.siginfo, 1);
                if let Some(addr) = fault_address {
                    cc.siginfo.ssi_addr = addr;
                }

                ptr::copy_nonoverlapping(uc, &mut cc.context, 1);
                debug_print!("copied context");

                cfg_if::cfg_if! {
                    if #[cfg(target_arch = "aarch64")] {
                        let fp_ptr = uc.uc_mcontext.__reserved.as_ptr().cast::<crash_context::fpsimd_context>();

                        if (*fp_ptr).head.magic == crash_context::FPSIMD_MAGIC {
                            ptr::copy_nonoverlapping(fp_ptr, &mut cc.float_state, 1);
                        }
                    } else if #[cfg(not(target_arch = "arm"))] {
                        if !uc.uc_mcontext.fpregs.is_null() {
                            ptr::copy_nonoverlapping(uc.uc_mcontext.fpregs, ((&mut cc.float_state) as *mut crash_context::fpregset_t).cast(), 1);
                        }
                    }
                }

                cc.pid = std::process::id() as i32;
                cc.tid = gettid();
            }

            self.event.on_crash(&cc)
        }
    }
}

// Not all of these are exposed by libc on every target, eg. Android
const PR_GET_DUMPABLE: i32 = 3;
const PR_SET_DUMPABLE: i32 = 4;
const PR_SET_PTRACER: i32 = 0x59616d61;
const PR_SET_PTRACER_ANY: i32 = -1;

/// Makes the process dumpable and ptrace-able by the monitor for the duration
/// of the crash event, restoring the previous state when dropped
struct SetDumpable {
    was_dumpable: bool,
}

impl SetDumpable {
    unsafe fn new(ptracer: Option<u32>) -> Self {
        unsafe {
            let was_dumpable = libc::syscall(libc::SYS_prctl, PR_GET_DUMPABLE, 0, 0, 0, 0) > 0;

            if !was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 1, 0, 0, 0);
            }

            // Fails with EINVAL if the pid doesn't exist, which leaves the
            // yama restriction in place
            let ptracer = ptracer.map_or(PR_SET_PTRACER_ANY, |pid| pid as i32);
            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, ptracer, 0, 0, 0);

            Self { was_dumpable }
        }
    }
}

impl Drop for SetDumpable {
    fn drop(&mut self) {
        unsafe {
            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, 0, 0, 0, 0);

            if !self.was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 0, 0, 0, 0);
            }
        }
    }
}
