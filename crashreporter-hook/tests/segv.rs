#![allow(unused_unsafe)]


#[test]
fn handles_segv() {
    shared::handles_crash(crashreporter_hook::Signal::Segv, || unsafe {
        sadness_generator::raise_segfault();
    });
}
