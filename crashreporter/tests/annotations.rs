use crashreporter::{AnnotationStore, ThreadAnnotations};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Every snapshot taken while another thread writes reflects some prefix of
/// the writes, and later snapshots never go back in time
#[test]
fn flatten_sees_prefixes() {
    const WRITES: u64 = 2000;

    let store = Arc::new(AnnotationStore::new());
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let store = store.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            for i in 1..=WRITES {
                // `first` is always written before `second`
                store.set("first", i.to_string());
                store.set("second", i.to_string());
                if i % 100 == 0 {
                    store.remove("scratch");
                } else {
                    store.set("scratch", "x".repeat((i % 50) as usize));
                }
            }
            done.store(true, Ordering::Release);
        })
    };

    let read = |table: &crashreporter::AnnotationTable, key: &str| -> u64 {
        table.get(key).map_or(0, |v| v.parse().unwrap())
    };

    let mut last_first = 0;
    let mut last_second = 0;
    loop {
        let finished = done.load(Ordering::Acquire);
        let snapshot = store.flatten();

        let first = read(&snapshot, "first");
        let second = read(&snapshot, "second");

        assert!(second <= first, "second {second} is ahead of first {first}");
        assert!(first >= last_first && second >= last_second);
        if let Some(scratch) = snapshot.get("scratch") {
            assert!(scratch.bytes().all(|b| b == b'x'));
        }

        last_first = first;
        last_second = second;

        if finished {
            break;
        }
    }

    writer.join().unwrap();
    assert_eq!(last_first, WRITES);
    assert_eq!(last_second, WRITES);
}

#[test]
fn empty_and_idempotent() {
    let store = AnnotationStore::new();
    assert!(store.flatten().is_empty());

    store.set("BuildID", "20240101");
    let a = store.flatten();
    let b = store.flatten();
    assert_eq!(*a, *b);
    assert_eq!(a.iter().collect::<Vec<_>>(), vec![("BuildID", "20240101")]);
}

#[test]
fn thread_lines_follow_registration_order() {
    let threads = Arc::new(ThreadAnnotations::new());
    threads.initialize();

    threads.set_current_thread_name("main");
    let main_tid = crashreporter::current_thread_id();

    let worker_tid = {
        let threads = threads.clone();
        std::thread::spawn(move || {
            threads.set_current_thread_name("worker");
            threads.annotate_current_thread("task", "decode");
            crashreporter::current_thread_id()
        })
        .join()
        .unwrap()
    };

    let mut lines = Vec::new();
    threads.visit_flat(|line| lines.push(line.to_owned()));
    assert_eq!(
        lines,
        vec![
            format!("{main_tid}:\"main\""),
            format!("{worker_tid}:\"worker\" task=\"decode\""),
        ]
    );

    // Each visit walks the current state again
    threads.annotate_current_thread("phase", "startup");
    let mut count = 0;
    threads.visit_flat(|_| count += 1);
    assert_eq!(count, 2);

    threads.shutdown();
    threads.set_current_thread_name("ignored");
    assert!(threads.is_empty());
}
