use super::{
    ANNOTATIONS, CRASH, CRASH_ACK, CrashNotice, Header, MAX_PAYLOAD, PING, PONG, RemoteEndpoint,
    USER,
};
use crate::{AnnotationTable, Dump, Error, Monitor};
use polling::{Event, Poller};
use std::{
    io::ErrorKind,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, RawFd},
    sync::{Arc, mpsc},
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// Whether the server loop keeps going
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopAction {
    Exit,
    Continue,
}

/// Allows user code to hook into the server loop
pub trait ServerHandler: Send + Sync {
    /// Called once the monitor has tried to dump a crashed child, whether it
    /// succeeded or not. The child is released after this returns.
    ///
    /// Each crash is dumped on its own thread, so this can be called
    /// concurrently with itself and the other callbacks.
    fn on_child_dump(&self, pid: u32, result: Result<(Dump, u32), Error>) -> LoopAction;
    /// Called with messages sent with [`super::Client::send_message`]
    fn on_message(&self, kind: u32, buffer: Vec<u8>);
    /// Called after a new client has connected
    fn on_client_connected(&self, _num_clients: usize) -> LoopAction {
        LoopAction::Continue
    }
    /// Called after a client has disconnected or gone stale
    fn on_client_disconnected(&self, _num_clients: usize) -> LoopAction {
        LoopAction::Continue
    }
}

struct Listener(uds::nonblocking::UnixSeqpacketListener);

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for Listener {
    #[allow(unsafe_code)]
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the descriptor is open for as long as the listener lives
        unsafe { BorrowedFd::borrow_raw(self.0.as_raw_fd()) }
    }
}

struct Connection(uds::nonblocking::UnixSeqpacketConn);

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for Connection {
    #[allow(unsafe_code)]
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the descriptor is open for as long as the connection lives
        unsafe { BorrowedFd::borrow_raw(self.0.as_raw_fd()) }
    }
}

/// Hands the monitor end of a notification pipe to a running server
#[derive(Clone)]
pub struct PipeRegistrar {
    tx: mpsc::Sender<(uds::UnixSeqpacketConn, u32)>,
}

impl PipeRegistrar {
    /// Attaches the monitor end of a pipe created by
    /// [`super::create_notification_pipe_for_child`] to the server, crash
    /// notices received on it must come from `pid`
    pub fn register(&self, conn: uds::UnixSeqpacketConn, pid: u32) -> Result<(), Error> {
        self.tx
            .send((conn, pid))
            .map_err(|_err| Error::Protocol("the server is no longer running".to_owned()))
    }
}

/// Monitor side of the channel, accepting crash notices from children and
/// dumping them with a [`Monitor`]
pub struct Server {
    listener: Option<Listener>,
    socket_path: Option<std::path::PathBuf>,
    pipes: mpsc::Receiver<(uds::UnixSeqpacketConn, u32)>,
    registrar: PipeRegistrar,
}

struct ClientConn {
    socket: Connection,
    key: usize,
    /// Last time a message was received from the client
    last_update: Instant,
    /// For notification pipes this is the registered child, for accepted
    /// connections it is the peer's pid
    pid: Option<u32>,
    /// Notification pipes can only be trusted on the registered pid
    registered: bool,
}

impl ClientConn {
    fn recv(&mut self) -> Option<(u32, Vec<u8>)> {
        use std::io::IoSliceMut;

        let mut hdr_buf = [0u8; std::mem::size_of::<Header>()];
        let len = self.socket.0.peek(&mut hdr_buf).ok()?;

        if len == 0 {
            return None;
        }

        let header = Header::from_bytes(&hdr_buf[..len])?;

        if header.size as usize > MAX_PAYLOAD {
            log::error!(
                "client {} announced a {} byte message, disconnecting it",
                self.key,
                header.size
            );
            return None;
        }

        if header.size == 0 {
            self.socket.0.recv(&mut hdr_buf).ok()?;
            Some((header.kind, Vec::new()))
        } else {
            let mut buffer = vec![0; header.size as usize];

            self.socket
                .0
                .recv_vectored(&mut [IoSliceMut::new(&mut hdr_buf), IoSliceMut::new(&mut buffer)])
                .ok()?;

            Some((header.kind, buffer))
        }
    }
}

impl Server {
    /// Creates a server listening on the endpoint.
    ///
    /// A socket file left over at a [`RemoteEndpoint::Named`] path is
    /// removed first.
    ///
    /// # Errors
    ///
    /// The endpoint is an inherited descriptor, or the listener socket
    /// could not be bound
    pub fn bind(endpoint: &RemoteEndpoint) -> Result<Self, Error> {
        let socket_path = if let RemoteEndpoint::Named(path) = endpoint {
            let _res = std::fs::remove_file(path);
            Some(path.clone())
        } else {
            None
        };

        let addr = endpoint.socket_addr()?;
        let listener = uds::nonblocking::UnixSeqpacketListener::bind_unix_addr(&addr)?;

        let mut server = Self::pipes_only();
        server.listener = Some(Listener(listener));
        server.socket_path = socket_path;
        Ok(server)
    }

    /// Creates a server that only serves notification pipes registered
    /// through its [`PipeRegistrar`]
    pub fn pipes_only() -> Self {
        let (tx, pipes) = mpsc::channel();
        Self {
            listener: None,
            socket_path: None,
            pipes,
            registrar: PipeRegistrar { tx },
        }
    }

    /// A handle for registering notification pipes, usable from other
    /// threads while [`Self::run`] is executing
    #[inline]
    pub fn registrar(&self) -> PipeRegistrar {
        self.registrar.clone()
    }

    /// Registers a notification pipe, see [`PipeRegistrar::register`]
    #[inline]
    pub fn register_child_pipe(&self, conn: uds::UnixSeqpacketConn, pid: u32) -> Result<(), Error> {
        self.registrar.register(conn, pid)
    }

    /// Runs the server loop until `shutdown` is set or the handler asks it to
    /// exit.
    ///
    /// If `stale_timeout` is specified, clients that have not sent anything
    /// for that long are disconnected. [`super::Client::ping`] keeps a
    /// quiet client alive.
    ///
    /// A crash request hands its connection to a worker thread that dumps
    /// the child and acks it, the loop keeps serving everyone else. The
    /// workers still running are joined before this returns.
    ///
    /// # Errors
    ///
    /// Polling for I/O events failed
    #[allow(unsafe_code)]
    pub fn run(
        &mut self,
        monitor: &Monitor,
        handler: Box<dyn ServerHandler>,
        shutdown: &std::sync::atomic::AtomicBool,
        stale_timeout: Option<Duration>,
    ) -> Result<(), Error> {
        struct Poll {
            listener: Option<Listener>,
            clients: Vec<ClientConn>,
            poll: Poller,
            workers: Vec<JoinHandle<()>>,
        }

        impl Poll {
            fn new(listener: Option<Listener>) -> std::io::Result<Self> {
                let s = Self {
                    listener,
                    poll: Poller::new()?,
                    clients: Vec::new(),
                    workers: Vec::new(),
                };

                if let Some(listener) = &s.listener {
                    // SAFETY: We ensure we delete the listener during drop
                    unsafe {
                        s.poll.add(listener, Event::readable(0))?;
                    }
                }

                Ok(s)
            }

            #[inline]
            fn add(&mut self, src: &Connection, interest: Event) -> std::io::Result<()> {
                // SAFETY: We ensure we delete all sources we add before dropping the poll
                unsafe { self.poll.add(src, interest) }
            }
        }

        impl Drop for Poll {
            fn drop(&mut self) {
                for client in std::mem::take(&mut self.clients) {
                    if let Err(err) = self.poll.delete(&client.socket) {
                        log::error!("failed to deregister socket: {err}");
                    }
                }

                if let Some(listener) = &self.listener {
                    if let Err(err) = self.poll.delete(listener) {
                        log::error!("failed to deregister listener: {err}");
                    }
                }

                for worker in self.workers.drain(..) {
                    if worker.join().is_err() {
                        log::error!("a dump worker panicked");
                    }
                }
            }
        }

        /// What happens to a client after one of its messages was handled
        enum Next {
            Keep,
            Close(Connection),
            /// Moved to a dump worker
            Handed,
        }

        let handler: Arc<dyn ServerHandler> = Arc::from(handler);
        let (exit_tx, exit_rx) = mpsc::channel::<u32>();

        let mut events = polling::Events::new();
        let mut polling = Poll::new(self.listener.take())?;
        let mut id = 1;

        loop {
            if shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                return Ok(());
            }

            if let Ok(pid) = exit_rx.try_recv() {
                log::debug!("user handler requested exit after the minidump of child {pid}");
                return Ok(());
            }

            polling.workers.retain(|worker| !worker.is_finished());

            while let Ok((conn, pid)) = self.pipes.try_recv() {
                let key = id;
                id += 1;

                conn.set_nonblocking(true)?;
                // SAFETY: the descriptor is moved straight out of `conn`
                let socket = Connection(unsafe {
                    uds::nonblocking::UnixSeqpacketConn::from_raw_fd(conn.into_raw_fd())
                });
                polling.add(&socket, Event::readable(key))?;

                log::debug!("registered notification pipe {key} for child {pid}");
                polling.clients.push(ClientConn {
                    socket,
                    key,
                    last_update: Instant::now(),
                    pid: Some(pid),
                    registered: true,
                });

                if handler.on_client_connected(polling.clients.len()) == LoopAction::Exit {
                    log::debug!("on_client_connected exited message loop");
                    return Ok(());
                }
            }

            events.clear();
            let timeout = Duration::from_millis(10);
            let deadline = Instant::now() + timeout;
            let mut remaining = Some(timeout);
            while let Some(timeout) = remaining {
                match polling.poll.wait(&mut events, Some(timeout)) {
                    Ok(_) => {
                        break;
                    }
                    Err(e) => {
                        if matches!(e.kind(), ErrorKind::Interrupted) {
                            remaining = deadline.checked_duration_since(Instant::now());
                        } else {
                            return Err(e.into());
                        }
                    }
                }
            }

            for event in events.iter() {
                if event.key == 0 {
                    let Some(listener) = &polling.listener else {
                        continue;
                    };

                    match listener.0.accept_unix_addr() {
                        Ok((accepted, _addr)) => {
                            let key = id;
                            id += 1;

                            let pid = accepted
                                .initial_peer_credentials()
                                .ok()
                                .and_then(|creds| creds.pid())
                                .map(|pid| pid.get());

                            let socket = Connection(accepted);
                            polling.add(&socket, Event::readable(key))?;

                            log::debug!("accepted connection {key} from {pid:?}");
                            polling.clients.push(ClientConn {
                                socket,
                                key,
                                last_update: Instant::now(),
                                pid,
                                registered: false,
                            });

                            if handler.on_client_connected(polling.clients.len())
                                == LoopAction::Exit
                            {
                                log::debug!("on_client_connected exited message loop");
                                return Ok(());
                            }
                        }
                        Err(err) => {
                            log::error!("failed to accept socket connection: {err}");
                        }
                    }

                    // We need to reregister interest every time
                    if let Some(listener) = &polling.listener {
                        polling.poll.modify(listener, Event::readable(0))?;
                    }
                } else if let Some(pos) = polling.clients.iter().position(|cc| cc.key == event.key)
                {
                    polling.clients[pos].last_update = Instant::now();

                    let next = match polling.clients[pos].recv() {
                        Some((CRASH, buffer)) => {
                            let cc = polling.clients.swap_remove(pos);
                            if let Err(err) = polling.poll.delete(&cc.socket) {
                                log::error!("failed to deregister socket: {err}");
                            }

                            let monitor = monitor.clone();
                            let handler = handler.clone();
                            let exit_tx = exit_tx.clone();
                            let spawned = std::thread::Builder::new()
                                .name("crashreporter-dump".to_owned())
                                .spawn(move || {
                                    let exit =
                                        Self::serve_crash(cc, &buffer, &monitor, &*handler);
                                    if let Some(pid) = exit {
                                        let _res = exit_tx.send(pid);
                                    }
                                });

                            match spawned {
                                Ok(worker) => polling.workers.push(worker),
                                // The connection was dropped with the closure, the child
                                // sees it close and dumps itself
                                Err(err) => log::error!("failed to spawn dump worker: {err}"),
                            }

                            Next::Handed
                        }
                        Some((PING, _buffer)) => {
                            let pong = Header {
                                kind: PONG,
                                size: 0,
                            };

                            if let Err(err) = polling.clients[pos].socket.0.send(pong.as_bytes()) {
                                log::error!("failed to send PONG: {err}");

                                let cc = polling.clients.swap_remove(pos);
                                Next::Close(cc.socket)
                            } else {
                                Next::Keep
                            }
                        }
                        Some((PONG | CRASH_ACK, _buffer)) => Next::Keep,
                        Some((ANNOTATIONS, buffer)) => {
                            let conn = &polling.clients[pos];
                            match (conn.pid, serde_json::from_slice::<AnnotationTable>(&buffer)) {
                                (Some(pid), Ok(table)) => monitor.cache_annotations(pid, table),
                                (None, _) => {
                                    log::warn!("ignoring annotations from a client with no known pid");
                                }
                                (_, Err(err)) => {
                                    log::error!("client {} sent invalid annotations: {err}", conn.key);
                                }
                            }

                            Next::Keep
                        }
                        Some((kind, buffer)) => {
                            handler.on_message(
                                kind - USER, /* give the user back the original code they specified */
                                buffer,
                            );

                            Next::Keep
                        }
                        None => {
                            log::debug!("client closed socket {pos}");
                            let cc = polling.clients.swap_remove(pos);
                            Next::Close(cc.socket)
                        }
                    };

                    let removed = !matches!(next, Next::Keep);
                    match next {
                        Next::Keep => {
                            let conn = &polling.clients[pos];
                            polling
                                .poll
                                .modify(&conn.socket, Event::readable(conn.key))?;
                        }
                        Next::Close(socket) => {
                            if let Err(err) = polling.poll.delete(&socket) {
                                log::error!("failed to deregister socket: {err}");
                            }
                        }
                        Next::Handed => {}
                    }

                    if removed
                        && handler.on_client_disconnected(polling.clients.len()) == LoopAction::Exit
                    {
                        log::debug!("on_client_disconnected exited message loop");
                        return Ok(());
                    }
                }
            }

            if let Some(st) = stale_timeout {
                let before = polling.clients.len();

                // Reap any connections that haven't sent a message in the period
                // specified by the user
                polling.clients.retain(|conn| {
                    let keep = conn.last_update.elapsed() < st;

                    if !keep {
                        log::debug!("dropping stale connection {:?}", conn.last_update.elapsed());
                        if let Err(err) = polling.poll.delete(&conn.socket) {
                            log::error!("failed to deregister timed-out socket: {err}");
                        }
                    }

                    keep
                });

                if before > polling.clients.len()
                    && handler.on_client_disconnected(polling.clients.len()) == LoopAction::Exit
                {
                    log::debug!("on_client_disconnected exited message loop");
                    return Ok(());
                }
            }
        }
    }

    /// Dumps the child and releases it. Runs on a worker thread that owns
    /// the connection, returns the child's pid if the handler asked the loop
    /// to exit.
    fn serve_crash(
        conn: ClientConn,
        buffer: &[u8],
        monitor: &Monitor,
        handler: &dyn ServerHandler,
    ) -> Option<u32> {
        let action = match Self::handle_crash_request(&conn, buffer, monitor) {
            Ok((pid, result)) => {
                if result.is_ok() {
                    log::info!("captured minidump of child {pid}");
                }
                (pid, handler.on_child_dump(pid, result))
            }
            Err(err) => {
                log::error!("rejected crash request: {err}");
                (0, LoopAction::Continue)
            }
        };

        // The child is blocked until it gets this, even when no dump could
        // be written
        let ack = Header {
            kind: CRASH_ACK,
            size: 0,
        };

        if let Err(err) = conn.socket.0.send(ack.as_bytes()) {
            log::error!("failed to send ack: {err}");
        }

        match action {
            (pid, LoopAction::Exit) => Some(pid),
            (_, LoopAction::Continue) => None,
        }
    }

    /// Validates the crash notice and dumps the child it names
    fn handle_crash_request(
        conn: &ClientConn,
        buffer: &[u8],
        monitor: &Monitor,
    ) -> Result<(u32, Result<(Dump, u32), Error>), Error> {
        if buffer.len() < CrashNotice::SIZE {
            return Err(Error::Protocol(format!(
                "crash notice is {} bytes, expected at least {}",
                buffer.len(),
                CrashNotice::SIZE
            )));
        }

        let (notice_buf, context_buf) = buffer.split_at(CrashNotice::SIZE);
        let notice = CrashNotice::decode(notice_buf)?;

        // Validate that the notice and the connection agree on the pid
        let expected = conn.pid.ok_or(Error::UnknownClientPid)?;
        if notice.pid != expected {
            log::error!(
                "crash notice names pid {} but the {} belongs to {expected}",
                notice.pid,
                if conn.registered { "pipe" } else { "connection" },
            );
            return Err(Error::UnknownClientPid);
        }

        let context = if context_buf.is_empty() {
            None
        } else {
            let cc = crash_context::CrashContext::from_bytes(context_buf).ok_or_else(|| {
                Error::Protocol("client sent an incorrectly sized crash context".to_owned())
            })?;

            if cc.pid as u32 != notice.pid {
                return Err(Error::UnknownClientPid);
            }
            Some(cc)
        };

        log::debug!(
            "child {} crashed on thread {} with signal {} (code {}, address {:#x})",
            notice.pid,
            notice.tid,
            notice.fault_kind,
            notice.fault_code,
            notice.fault_address
        );

        Ok((notice.pid, monitor.dump_child(notice.pid, notice.tid, context)))
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.listener.take();

        if let Some(path) = self.socket_path.take() {
            let _res = std::fs::remove_file(path);
        }
    }
}
