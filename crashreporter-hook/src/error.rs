use std::fmt;

/// An error that can occur when attaching a [`crate::CrashHandler`]
#[derive(Debug)]
pub enum Error {
    /// The alternate signal stack could not be mapped or registered
    AlternateStack(std::io::Error),
    /// Only one [`crate::CrashHandler`] can be attached to a process at any
    /// one time.
    AlreadyAttached,
    /// Saving or replacing the handler of a signal failed
    Io(std::io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AlternateStack(inner) | Self::Io(inner) => Some(inner),
            Self::AlreadyAttached => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlternateStack(e) => write!(f, "unable to install alternate signal stack: {e}"),
            Self::AlreadyAttached => f.write_str("a crash handler is already attached"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
