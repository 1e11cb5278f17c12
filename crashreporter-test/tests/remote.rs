//! Crashes handed to a monitor are dumped by it over ptrace, with the
//! annotations the client sent beforehand

use crashreporter_test::*;

#[test]
fn remote_segfault() {
    run_remote_test(Signal::Segv, false);
}

#[test]
fn remote_segfault_threaded() {
    run_remote_test(Signal::Segv, true);
}

#[test]
fn remote_abort() {
    run_remote_test(Signal::Abort, false);
}

#[test]
fn remote_illegal() {
    run_remote_test(Signal::Illegal, false);
}
