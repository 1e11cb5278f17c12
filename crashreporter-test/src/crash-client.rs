use crashreporter_test::Signal;

use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
struct Command {
    /// Where the minidump is written when no monitor takes the crash
    #[clap(long)]
    dump_dir: PathBuf,
    /// The monitor to hand the crash to, eg. `abstract:<name>`
    #[clap(long)]
    endpoint: Option<crashreporter::RemoteEndpoint>,
    /// The signal/exception to raise
    #[clap(long, value_enum)]
    signal: Signal,
    /// Raises the signal on a separate thread rather than the main thread
    #[clap(long)]
    use_thread: bool,
    /// `key=value` annotations to attach to the minidump
    #[clap(long)]
    annotate: Vec<String>,
    /// Prints `ready` once connected and waits to be killed instead of crashing
    #[clap(long)]
    hang: bool,
}

#[allow(unsafe_code)]
fn real_main() -> anyhow::Result<()> {
    let cmd = Command::parse();

    println!("pid: {}", std::process::id());

    let reporter = crashreporter::CrashReporter::new();
    for annotation in &cmd.annotate {
        let (key, value) = annotation
            .split_once('=')
            .with_context(|| format!("invalid annotation '{annotation}'"))?;
        reporter.annotations().set(key, value);
    }

    reporter
        .install(&cmd.dump_dir, false)
        .context("failed to arm crash reporting")?;
    reporter
        .thread_annotations()
        .set_current_thread_name("crash-client");

    if let Some(endpoint) = &cmd.endpoint {
        let start = std::time::Instant::now();
        let connect_timeout = std::time::Duration::from_secs(2);

        while !reporter.setup_remote_handler(endpoint) {
            if start.elapsed() > connect_timeout {
                anyhow::bail!("timed out trying to connect to monitor {endpoint}");
            }

            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    let mut threads = Vec::new();

    for _ in 0..10 {
        threads.push(std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::MAX);
        }));
    }

    if cmd.hang {
        println!("ready");

        loop {
            std::thread::park();
        }
    }

    let signal = cmd.signal;

    let raise_signal = move || {
        // SAFETY: we're about to intentionally crash ourselves via shenanigans,
        // none of this is safe
        unsafe {
            match signal {
                Signal::Illegal => {
                    sadness_generator::raise_illegal_instruction();
                }
                Signal::Trap => {
                    sadness_generator::raise_trap();
                }
                Signal::Abort => {
                    sadness_generator::raise_abort();
                }
                Signal::Fpe => {
                    sadness_generator::raise_floating_point_exception();
                }
                Signal::Segv => {
                    sadness_generator::raise_segfault();
                }
                Signal::StackOverflow => {
                    sadness_generator::raise_stack_overflow();
                }
            }
        }
    };

    if cmd.use_thread {
        std::thread::spawn(raise_signal)
            .join()
            .map_err(|_err| anyhow::anyhow!("failed to join thread"))?;
    } else {
        raise_signal();
    }

    anyhow::bail!("we should have raised a signal and exited");
}

fn main() {
    // This program is meant to crash and have a minidump written, any error
    // before that is reported with its own exit code so the test fails
    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");

        // A crash has no exit code at all
        #[allow(clippy::exit)]
        std::process::exit(222);
    }
}
