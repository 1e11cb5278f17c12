use super::{
    ANNOTATIONS, CRASH, CRASH_ACK, CrashNotice, Header, MAX_PAYLOAD, PING, PONG, RemoteEndpoint,
    USER,
};
use crate::{AnnotationTable, Error};
use std::io::{ErrorKind, IoSlice};

/// Child side of the connection to the monitor process
pub struct Client {
    socket: uds::UnixSeqpacketConn,
}

impl Client {
    /// Connects to the monitor at the endpoint.
    ///
    /// An [`RemoteEndpoint::Inherited`] descriptor is owned by the client
    /// from then on and closed when it is dropped.
    ///
    /// # Errors
    ///
    /// The endpoint is invalid, or no monitor is listening on it
    pub fn connect(endpoint: &RemoteEndpoint) -> Result<Self, Error> {
        if let RemoteEndpoint::Inherited(fd) = endpoint {
            return Self::from_fd(*fd);
        }

        let addr = endpoint.socket_addr()?;
        Ok(Self {
            socket: uds::UnixSeqpacketConn::connect_unix_addr(&addr)?,
        })
    }

    #[allow(unsafe_code)]
    fn from_fd(fd: std::os::fd::RawFd) -> Result<Self, Error> {
        use std::os::fd::FromRawFd;

        // SAFETY: syscalls, the descriptor is only adopted once it is known
        // to be an open seqpacket socket
        unsafe {
            let mut kind: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            if libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_TYPE,
                (&mut kind as *mut libc::c_int).cast(),
                &mut len,
            ) != 0
                || kind != libc::SOCK_SEQPACKET
            {
                return Err(Error::InvalidEndpoint);
            }

            let socket = uds::UnixSeqpacketConn::from_raw_fd(fd);
            Ok(Self { socket })
        }
    }

    /// Asks the monitor to dump this process and blocks until it has.
    ///
    /// Usable from the crash hook, nothing is allocated on success.
    pub fn request_dump(
        &self,
        notice: &CrashNotice,
        context: Option<&crash_context::CrashContext>,
    ) -> Result<(), Error> {
        let mut notice_buf = [0u8; CrashNotice::SIZE];
        notice.encode(&mut notice_buf)?;

        let context_buf = context.map_or(&[][..], |cc| cc.as_bytes());

        let header = Header {
            kind: CRASH,
            size: (notice_buf.len() + context_buf.len()) as u32,
        };

        let io_bufs = [
            IoSlice::new(header.as_bytes()),
            IoSlice::new(&notice_buf),
            IoSlice::new(context_buf),
        ];
        self.socket.send_vectored(&io_bufs)?;

        crashreporter_hook::debug_print!("waiting for the monitor to write the minidump...");
        self.expect(CRASH_ACK)?;
        crashreporter_hook::debug_print!("minidump creation acked");

        Ok(())
    }

    /// Checks that the monitor is alive and keeps the connection from going
    /// stale
    pub fn ping(&self) -> Result<(), Error> {
        let header = Header {
            kind: PING,
            size: 0,
        };
        self.socket.send(header.as_bytes())?;
        self.expect(PONG)
    }

    /// Sends an application message, delivered to
    /// [`super::ServerHandler::on_message`] with the same `kind`.
    ///
    /// The monitor does not acknowledge messages.
    pub fn send_message(&self, kind: u32, buf: impl AsRef<[u8]>) -> Result<(), Error> {
        let kind = kind
            .checked_add(USER)
            .ok_or_else(|| Error::Protocol(format!("message kind {kind} is out of range")))?;

        self.send(kind, buf.as_ref())
    }

    /// Sends the annotations the monitor writes to the extra files of this
    /// process' dumps, replacing the ones sent before
    pub fn send_annotations(&self, annotations: &AnnotationTable) -> Result<(), Error> {
        let json = serde_json::to_vec(annotations)?;
        self.send(ANNOTATIONS, &json)
    }

    /// Sends annotations that were already serialized, from the crash hook
    pub(crate) fn send_serialized_annotations(&self, json: &[u8]) -> Result<(), Error> {
        self.send(ANNOTATIONS, json)
    }

    fn send(&self, kind: u32, buffer: &[u8]) -> Result<(), Error> {
        if buffer.len() > MAX_PAYLOAD {
            return Err(Error::Protocol(format!(
                "a {} byte message exceeds the {MAX_PAYLOAD} byte limit",
                buffer.len()
            )));
        }

        let header = Header {
            kind,
            size: buffer.len() as u32,
        };

        let io_bufs = [IoSlice::new(header.as_bytes()), IoSlice::new(buffer)];
        self.socket.send_vectored(&io_bufs)?;
        Ok(())
    }

    fn expect(&self, kind: u32) -> Result<(), Error> {
        let mut reply = [0u8; std::mem::size_of::<Header>()];
        let len = self.socket.recv(&mut reply)?;

        match Header::from_bytes(&reply[..len]) {
            Some(header) if header.kind == kind => Ok(()),
            _ => Err(std::io::Error::from(ErrorKind::InvalidData).into()),
        }
    }
}
