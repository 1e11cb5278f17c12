#![allow(unused_unsafe)]


#[test]
fn handles_fpe() {
    shared::handles_crash(crashreporter_hook::Signal::Fpe, || unsafe {
        sadness_generator::raise_floating_point_exception();
    });
}
