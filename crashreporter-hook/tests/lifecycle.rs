//! Attach, simulate and detach share process-wide state, so they are
//! exercised in order from a single test

#![allow(unsafe_code)]

use crashreporter_hook::{self as ch, CrashEventResult, CrashHandler, Signal};
use std::{
    mem, ptr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

extern "C" fn previous_trap_handler(_sig: i32, _info: *mut libc::siginfo_t, _uc: *mut libc::c_void) {}

fn current_action(sig: Signal) -> libc::sigaction {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        assert_eq!(libc::sigaction(sig as i32, ptr::null(), &mut action), 0);
        action
    }
}

#[test]
fn attach_simulate_detach() {
    // Something else in the process already handles SIGTRAP
    let previous = unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaddset(&mut sa.sa_mask, libc::SIGUSR2);
        sa.sa_sigaction = previous_trap_handler as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        assert_eq!(libc::sigaction(libc::SIGTRAP, &sa, ptr::null_mut()), 0);
        current_action(Signal::Trap)
    };

    assert!(!CrashHandler::is_attached());

    let seen = Arc::new(AtomicU32::new(0));
    let handler = {
        let seen = seen.clone();
        unsafe {
            CrashHandler::attach(ch::make_crash_event(move |cc: &ch::CrashContext| {
                seen.store(cc.siginfo.ssi_signo, Ordering::SeqCst);
                assert_eq!(cc.pid, std::process::id() as i32);
                CrashEventResult::Handled(false)
            }))
            .unwrap()
        }
    };

    assert!(CrashHandler::is_attached());
    assert_ne!(
        current_action(Signal::Trap).sa_sigaction,
        previous.sa_sigaction
    );

    // Only one hook per process
    let second = unsafe {
        CrashHandler::attach(ch::make_crash_event(|_cc: &ch::CrashContext| {
            CrashEventResult::Handled(true)
        }))
    };
    assert!(matches!(second, Err(ch::Error::AlreadyAttached)));

    // A simulated fault reaches the event without terminating anything
    let CrashEventResult::Handled(handled) = handler.simulate_signal(Signal::Illegal);
    assert!(!handled);
    assert_eq!(seen.load(Ordering::SeqCst), libc::SIGILL as u32);

    handler.set_ptracer(Some(std::process::id()));
    let CrashEventResult::Handled(handled) = handler.simulate_signal(Signal::Abort);
    assert!(!handled);
    assert_eq!(seen.load(Ordering::SeqCst), libc::SIGABRT as u32);

    handler.detach();
    assert!(!CrashHandler::is_attached());

    let restored = current_action(Signal::Trap);
    assert_eq!(restored.sa_sigaction, previous.sa_sigaction);
    assert_eq!(restored.sa_flags, previous.sa_flags);
    assert_eq!(
        unsafe { libc::sigismember(&restored.sa_mask, libc::SIGUSR2) },
        1
    );

    // Attaching again after a detach is allowed
    let again = unsafe {
        CrashHandler::attach(ch::make_crash_event(|_cc: &ch::CrashContext| {
            CrashEventResult::Handled(true)
        }))
    };
    assert!(again.is_ok());
    drop(again);
    assert!(!CrashHandler::is_attached());
}

#[test]
fn signal_names_round_trip() {
    for signal in Signal::all() {
        assert_eq!(Signal::from_raw(signal as i32), Some(signal));
        assert!(signal.name().starts_with("SIG"));
    }
    assert_eq!(Signal::from_raw(libc::SIGUSR1), None);
}
