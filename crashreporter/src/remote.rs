//! The channel between a child process and the monitor that writes its
//! minidumps.
//!
//! Every message is a single `SOCK_SEQPACKET` packet made of a [`Header`]
//! followed by `size` bytes of payload. A crash request carries a
//! [`CrashNotice`], optionally followed by the raw [`crash_context::CrashContext`]
//! of the faulting thread, and the child blocks until the monitor acks it,
//! which the monitor only does once the minidump has been written.

mod client;
mod server;

pub use client::Client;
pub use server::{LoopAction, PipeRegistrar, Server, ServerHandler};

use crate::Error;
use std::{os::fd::RawFd, path::PathBuf, str::FromStr};

const CRASH: u32 = 0;
const CRASH_ACK: u32 = 1;
const PING: u32 = 2;
const PONG: u32 = 3;
const ANNOTATIONS: u32 = 4;
/// User message kinds are offset by this
const USER: u32 = 5;

/// The largest payload either side accepts, a peer announcing more is
/// disconnected
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// The descriptor number the child end of a notification pipe is mapped to
/// in the child process by convention
pub const CHILD_PIPE_FD: RawFd = 4;

#[derive(Copy, Clone)]
#[cfg_attr(test, derive(PartialEq, Debug))]
#[repr(C)]
struct Header {
    kind: u32,
    size: u32,
}

impl Header {
    fn as_bytes(&self) -> &[u8] {
        #[allow(unsafe_code)]
        unsafe {
            let size = std::mem::size_of::<Self>();
            let ptr = (self as *const Self).cast();
            std::slice::from_raw_parts(ptr, size)
        }
    }

    fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != std::mem::size_of::<Self>() {
            return None;
        }

        #[allow(unsafe_code)]
        unsafe {
            Some(*buf.as_ptr().cast::<Self>())
        }
    }
}

/// The fixed-size notice a crashing child sends to its monitor
#[derive(Copy, Clone, Debug, PartialEq, Eq, scroll::Pwrite, scroll::Pread, scroll::SizeWith)]
pub struct CrashNotice {
    pub pid: u32,
    pub tid: u32,
    /// The signal number
    pub fault_kind: i32,
    /// The signal's `si_code`
    pub fault_code: i32,
    pub fault_address: u64,
}

impl CrashNotice {
    pub const SIZE: usize = 24;

    /// Describes the fault recorded in the crash context
    pub fn from_crash_context(cc: &crash_context::CrashContext) -> Self {
        Self {
            pid: cc.pid as u32,
            tid: cc.tid as u32,
            fault_kind: cc.siginfo.ssi_signo as i32,
            fault_code: cc.siginfo.ssi_code,
            fault_address: cc.siginfo.ssi_addr,
        }
    }

    fn encode(&self, buf: &mut [u8; Self::SIZE]) -> Result<(), Error> {
        use scroll::Pwrite;
        buf.pwrite_with(*self, 0, scroll::LE)?;
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        use scroll::Pread;
        Ok(buf.pread_with(0, scroll::LE)?)
    }
}

/// Where a child finds its monitor.
///
/// Parses from `fd:<n>` for an inherited socket descriptor,
/// `abstract:<name>` for a Linux abstract socket, and anything else as the
/// path of a socket on the filesystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteEndpoint {
    Inherited(RawFd),
    Abstract(String),
    Named(PathBuf),
}

impl FromStr for RemoteEndpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::InvalidEndpoint);
        }

        if let Some(fd) = s.strip_prefix("fd:") {
            let fd: RawFd = fd.parse().map_err(|_err| Error::InvalidEndpoint)?;
            if fd < 0 {
                return Err(Error::InvalidEndpoint);
            }
            Ok(Self::Inherited(fd))
        } else if let Some(name) = s.strip_prefix("abstract:") {
            if name.is_empty() {
                return Err(Error::InvalidEndpoint);
            }
            Ok(Self::Abstract(name.to_owned()))
        } else {
            Ok(Self::Named(PathBuf::from(s)))
        }
    }
}

impl std::fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inherited(fd) => write!(f, "fd:{fd}"),
            Self::Abstract(name) => write!(f, "abstract:{name}"),
            Self::Named(path) => write!(f, "{}", path.display()),
        }
    }
}

impl RemoteEndpoint {
    fn socket_addr(&self) -> Result<uds::UnixSocketAddr, Error> {
        match self {
            Self::Abstract(name) => {
                uds::UnixSocketAddr::from_abstract(name).map_err(|_err| Error::InvalidEndpoint)
            }
            Self::Named(path) => {
                uds::UnixSocketAddr::from_path(path).map_err(|_err| Error::InvalidEndpoint)
            }
            Self::Inherited(_) => Err(Error::InvalidEndpoint),
        }
    }
}

/// Creates the socket pair used to notify the monitor of a child's crash.
///
/// The first socket stays in the monitor and is handed to
/// [`PipeRegistrar::register`] once the child's pid is known, the second must
/// be inherited by the child, see [`ChildPipe::remap`].
pub fn create_notification_pipe_for_child() -> Result<(uds::UnixSeqpacketConn, ChildPipe), Error> {
    let (monitor, child) = uds::UnixSeqpacketConn::pair()?;
    Ok((monitor, ChildPipe { conn: child }))
}

/// The child's end of a notification pipe
pub struct ChildPipe {
    conn: uds::UnixSeqpacketConn,
}

impl ChildPipe {
    /// Arranges for the pipe to be available as `target_fd` in the process
    /// spawned by `cmd`, and returns the endpoint the child should connect to
    pub fn remap(&self, cmd: &mut std::process::Command, target_fd: RawFd) -> RemoteEndpoint {
        use std::os::{fd::AsRawFd, unix::process::CommandExt};

        let source = self.conn.as_raw_fd();

        #[allow(unsafe_code)]
        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            cmd.pre_exec(move || {
                if source == target_fd {
                    // Same number, only the close-on-exec flag needs clearing
                    let flags = libc::fcntl(source, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(source, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(source, target_fd) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        RemoteEndpoint::Inherited(target_fd)
    }
}

impl std::os::fd::IntoRawFd for ChildPipe {
    fn into_raw_fd(self) -> RawFd {
        self.conn.into_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_bytes() {
        let expected = Header {
            kind: 20,
            size: 8 * 1024,
        };
        let exp_bytes = expected.as_bytes();

        let actual = Header::from_bytes(exp_bytes).unwrap();

        assert_eq!(expected, actual);
    }

    #[test]
    fn notice_wire_layout() {
        let notice = CrashNotice {
            pid: 1234,
            tid: 5,
            fault_kind: libc::SIGSEGV,
            fault_code: 1,
            fault_address: 0xdead_beef,
        };

        let mut buf = [0u8; CrashNotice::SIZE];
        notice.encode(&mut buf).unwrap();
        assert_eq!(&buf[..4], &1234u32.to_le_bytes());
        assert_eq!(&buf[8..12], &libc::SIGSEGV.to_le_bytes());
        assert_eq!(&buf[16..], &0xdead_beefu64.to_le_bytes());

        assert_eq!(CrashNotice::decode(&buf).unwrap(), notice);
        assert!(CrashNotice::decode(&buf[..10]).is_err());
    }

    #[test]
    fn endpoints() {
        assert_eq!("fd:4".parse::<RemoteEndpoint>().unwrap(), RemoteEndpoint::Inherited(4));
        assert_eq!(
            "abstract:monitor".parse::<RemoteEndpoint>().unwrap(),
            RemoteEndpoint::Abstract("monitor".to_owned())
        );
        assert_eq!(
            "/tmp/monitor.sock".parse::<RemoteEndpoint>().unwrap(),
            RemoteEndpoint::Named("/tmp/monitor.sock".into())
        );

        for bad in ["", "fd:", "fd:-1", "fd:four", "abstract:"] {
            assert!(
                matches!(bad.parse::<RemoteEndpoint>(), Err(Error::InvalidEndpoint)),
                "{bad}"
            );
        }

        for ep in ["fd:7", "abstract:x", "/run/x.sock"] {
            assert_eq!(ep.parse::<RemoteEndpoint>().unwrap().to_string(), ep);
        }
    }
}
