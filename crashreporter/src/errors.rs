use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A path or setting supplied by the caller can't be used
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("the crash handler is already armed")]
    AlreadyArmed,
    #[error("the crash handler is not armed")]
    NotArmed,
    #[error("the crash handler was removed and cannot be armed again")]
    HandlerRemoved,
    /// The dump could not be written at all
    #[error("failed to write the minidump: {0}")]
    CaptureFailed(#[source] std::io::Error),
    #[error("the remote endpoint is invalid")]
    InvalidEndpoint,
    #[error("client process requesting crash dump has an unknown or invalid pid")]
    UnknownClientPid,
    #[error("no minidump has been recorded for child process {0}")]
    UnknownChild(u32),
    #[error("minidump '{}' does not exist", .0.display())]
    MissingDump(PathBuf),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Scroll(#[from] scroll::Error),
    #[error(transparent)]
    Writer(#[from] minidump_writer::errors::WriterError),
    #[error(transparent)]
    Hook(#[from] crashreporter_hook::Error),
}
