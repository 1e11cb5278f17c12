#![allow(unused_unsafe)]


#[test]
fn handles_trap() {
    shared::handles_crash(crashreporter_hook::Signal::Trap, || unsafe {
        sadness_generator::raise_trap();
    });
}
