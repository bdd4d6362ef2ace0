//! One client connection bridged to one login process.
//!
//! A session owns the socket, the PTY master, the child handle and one ring
//! buffer per direction. The event loop asks it which descriptors are worth
//! watching (`poll_ready`) and then lets it make exactly one non-blocking
//! attempt on each descriptor that turned out ready (`drive`).

use super::pty::{ChildExit, ChildProcess, Resize, SpawnedPty};
use super::ring_buffer::RingBuffer;
use bitflags::bitflags;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use telnet_core::protocol::option_name;
use telnet_core::{CodecSink, TelnetCodec, WindowSize};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Upper bound for a single socket read.
const READ_CHUNK: usize = 4096;

/// A read of `n` client bytes produces at most `n + 2` reply bytes: only the
/// first reply can be completed by a single byte.
const REPLY_HEADROOM: usize = 2;

/// Monotonic identifier assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Descriptors a session found ready during one poll.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u8 {
        const SOCKET_READ = 1 << 0;
        const SOCKET_WRITE = 1 << 1;
        const PTY_READ = 1 << 2;
        const PTY_WRITE = 1 << 3;
        const SOCKET_FAULT = 1 << 4;
        const PTY_FAULT = 1 << 5;
    }
}

/// Which end of the bridge went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Pty,
}

/// Why a session left the live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ClientError(io::ErrorKind),
    PtyClosed,
    PtyError(io::ErrorKind),
    ChildExited(ChildExit),
}

impl CloseReason {
    fn side(&self) -> Side {
        match self {
            CloseReason::ClientClosed | CloseReason::ClientError(_) => Side::Client,
            CloseReason::PtyClosed | CloseReason::PtyError(_) | CloseReason::ChildExited(_) => {
                Side::Pty
            }
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => write!(f, "client closed connection"),
            CloseReason::ClientError(kind) => write!(f, "socket error: {kind}"),
            CloseReason::PtyClosed => write!(f, "terminal closed"),
            CloseReason::PtyError(kind) => write!(f, "terminal error: {kind}"),
            CloseReason::ChildExited(exit) => write!(f, "login exited with code {}", exit.code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Live,
    /// One side is gone; bytes bound for the other are still flushed.
    Closing {
        lost: Side,
        reason: CloseReason,
        since: Instant,
    },
    /// Both sides are gone; waiting to be reaped.
    Dead { reason: CloseReason },
}

/// Bytes queued for the client before the first byte of login output.
#[derive(Debug, Clone, Default)]
pub struct Preamble {
    pub negotiation: Vec<u8>,
    pub banner: Vec<u8>,
}

pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    socket: TcpStream,
    pty: AsyncFd<File>,
    resizer: Box<dyn Resize>,
    child: Box<dyn ChildProcess>,
    /// Client → terminal, already decoded.
    to_pty: RingBuffer,
    /// Terminal → client, plus negotiation replies.
    to_client: RingBuffer,
    codec: TelnetCodec,
    phase: Phase,
    /// Set once the login child is gone; the terminal is still drained
    /// until it reports EOF.
    child_exit: Option<(ChildExit, Instant)>,
    created_at: Instant,
}

impl Session {
    /// Wire an accepted socket to a spawned terminal. On error nothing is
    /// registered and the child is handed back for cleanup.
    pub fn establish(
        id: SessionId,
        socket: TcpStream,
        peer: SocketAddr,
        spawned: SpawnedPty,
        buffer_size: usize,
        preamble: &Preamble,
    ) -> Result<Self, (io::Error, Box<dyn ChildProcess>)> {
        let SpawnedPty {
            master,
            resizer,
            child,
        } = spawned;
        let master_fd = master.as_raw_fd();
        let pty = match set_nonblocking(&master).and_then(|()| register_pty(master)) {
            Ok(pty) => pty,
            Err(e) => return Err((e, child)),
        };

        let mut to_client = RingBuffer::new(buffer_size);
        to_client.append(&preamble.negotiation);
        to_client.append(&preamble.banner);

        debug!(
            session = %id,
            master_fd,
            pid = ?child.pid(),
            "session established"
        );

        Ok(Self {
            id,
            peer,
            socket,
            pty,
            resizer,
            child,
            to_pty: RingBuffer::new(buffer_size),
            to_client,
            codec: TelnetCodec::default(),
            phase: Phase::Live,
            child_exit: None,
            created_at: Instant::now(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_live(&self) -> bool {
        self.phase == Phase::Live
    }

    /// Bytes waiting for the terminal and for the client.
    pub fn buffered(&self) -> (usize, usize) {
        (self.to_pty.len(), self.to_client.len())
    }

    fn client_open(&self) -> bool {
        match &self.phase {
            Phase::Live => true,
            Phase::Closing { lost, .. } => *lost != Side::Client,
            Phase::Dead { .. } => false,
        }
    }

    fn pty_open(&self) -> bool {
        match &self.phase {
            Phase::Live => true,
            Phase::Closing { lost, .. } => *lost != Side::Pty,
            Phase::Dead { .. } => false,
        }
    }

    /// How many client bytes may be read without either buffer overflowing.
    fn socket_read_budget(&self) -> usize {
        self.to_pty
            .free()
            .min(self.to_client.free().saturating_sub(REPLY_HEADROOM))
    }

    /// Register interest for every descriptor that could make progress and
    /// report those that already can.
    pub fn poll_ready(&self, cx: &mut Context<'_>) -> Readiness {
        let mut ready = Readiness::empty();
        let live = self.is_live();

        if live && self.socket_read_budget() > 0 {
            match self.socket.poll_read_ready(cx) {
                Poll::Ready(Ok(())) => ready |= Readiness::SOCKET_READ,
                Poll::Ready(Err(_)) => ready |= Readiness::SOCKET_FAULT,
                Poll::Pending => {}
            }
        }
        if self.client_open() && !self.to_client.is_empty() {
            match self.socket.poll_write_ready(cx) {
                Poll::Ready(Ok(())) => ready |= Readiness::SOCKET_WRITE,
                Poll::Ready(Err(_)) => ready |= Readiness::SOCKET_FAULT,
                Poll::Pending => {}
            }
        }
        if live && !self.to_client.is_full() {
            match self.pty.poll_read_ready(cx) {
                Poll::Ready(Ok(_guard)) => ready |= Readiness::PTY_READ,
                Poll::Ready(Err(_)) => ready |= Readiness::PTY_FAULT,
                Poll::Pending => {}
            }
        }
        if self.pty_open() && !self.to_pty.is_empty() {
            match self.pty.poll_write_ready(cx) {
                Poll::Ready(Ok(_guard)) => ready |= Readiness::PTY_WRITE,
                Poll::Ready(Err(_)) => ready |= Readiness::PTY_FAULT,
                Poll::Pending => {}
            }
        }

        ready
    }

    /// One attempt per ready descriptor.
    pub fn drive(&mut self, ready: Readiness) {
        if ready.contains(Readiness::SOCKET_FAULT) {
            self.close(CloseReason::ClientError(io::ErrorKind::Other));
        }
        if ready.contains(Readiness::PTY_FAULT) {
            self.close(CloseReason::PtyError(io::ErrorKind::Other));
        }
        if ready.contains(Readiness::SOCKET_READ) {
            self.read_socket();
        }
        if ready.contains(Readiness::PTY_WRITE) {
            self.write_pty();
        }
        if ready.contains(Readiness::PTY_READ) {
            self.read_pty();
        }
        if ready.contains(Readiness::SOCKET_WRITE) {
            self.write_socket();
        }
    }

    fn read_socket(&mut self) {
        let budget = self.socket_read_budget().min(READ_CHUNK);
        if !self.is_live() || budget == 0 {
            return;
        }
        let mut chunk = [0u8; READ_CHUNK];
        match self.socket.try_read(&mut chunk[..budget]) {
            Ok(0) => self.close(CloseReason::ClientClosed),
            Ok(n) => {
                let mut sink = Pump {
                    id: self.id,
                    to_pty: &mut self.to_pty,
                    to_client: &mut self.to_client,
                    resizer: self.resizer.as_mut(),
                };
                self.codec.feed(&chunk[..n], &mut sink);
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => self.close(CloseReason::ClientError(e.kind())),
        }
    }

    fn write_pty(&mut self) {
        if !self.pty_open() || self.to_pty.is_empty() {
            return;
        }
        let pty = &self.pty;
        let result = self.to_pty.write_to(|bufs| {
            pty.try_io(Interest::WRITABLE, |file| {
                let mut file: &File = file;
                file.write_vectored(bufs)
            })
        });
        match result {
            Ok(_) => {}
            Err(e) if is_transient(&e) => {}
            Err(e) => self.close(pty_failure(e)),
        }
    }

    fn read_pty(&mut self) {
        if !self.is_live() || self.to_client.is_full() {
            return;
        }
        let pty = &self.pty;
        let result = self.to_client.fill_from(|span| {
            pty.try_io(Interest::READABLE, |file| {
                let mut file: &File = file;
                file.read(&mut span[..])
            })
        });
        match result {
            Ok(0) => self.close(CloseReason::PtyClosed),
            Ok(_) => {}
            Err(e) if is_transient(&e) => {}
            Err(e) => self.close(pty_failure(e)),
        }
    }

    fn write_socket(&mut self) {
        if !self.client_open() || self.to_client.is_empty() {
            return;
        }
        let socket = &self.socket;
        match self.to_client.write_to(|bufs| socket.try_write_vectored(bufs)) {
            Ok(0) => self.close(CloseReason::ClientClosed),
            Ok(_) => {}
            Err(e) if is_transient(&e) => {}
            Err(e) => self.close(CloseReason::ClientError(e.kind())),
        }
    }

    /// Non-blocking liveness check of the login child.
    ///
    /// Output the child wrote before exiting is still read from the master.
    /// The session only closes on the exit itself if the terminal has not
    /// reported EOF within `grace`, e.g. when a background job holds the
    /// slave open.
    pub fn check_child(&mut self, now: Instant, grace: Duration) {
        if !self.is_live() {
            return;
        }
        if let Some((exit, at)) = self.child_exit {
            if now.duration_since(at) >= grace {
                self.close(CloseReason::ChildExited(exit));
            }
            return;
        }
        match self.child.try_wait() {
            Ok(Some(exit)) => {
                debug!(session = %self.id, code = exit.code, "login exited, draining terminal");
                self.child_exit = Some((exit, now));
                if grace.is_zero() {
                    self.close(CloseReason::ChildExited(exit));
                }
            }
            Ok(None) => {}
            Err(e) => warn!(session = %self.id, error = %e, "child status check failed"),
        }
    }

    /// Record that one side is gone. Live sessions start closing; a closing
    /// session that loses its other side is dead.
    pub fn close(&mut self, reason: CloseReason) {
        let side = reason.side();
        match &self.phase {
            Phase::Live => {
                info!(session = %self.id, peer = %self.peer, reason = %reason, "session closing");
                self.phase = Phase::Closing {
                    lost: side,
                    reason,
                    since: Instant::now(),
                };
            }
            Phase::Closing { lost, reason: first, .. } if *lost != side => {
                debug!(session = %self.id, reason = %reason, "drain aborted");
                self.phase = Phase::Dead {
                    reason: first.clone(),
                };
            }
            Phase::Closing { .. } | Phase::Dead { .. } => {}
        }
    }

    /// Whether the session can be torn down: both sides gone, nothing left
    /// to flush toward the open one, or `linger` exceeded.
    pub fn is_finished(&self, now: Instant, linger: Duration) -> bool {
        match &self.phase {
            Phase::Live => false,
            Phase::Dead { .. } => true,
            Phase::Closing { lost, since, .. } => {
                let pending = match lost {
                    Side::Client => &self.to_pty,
                    Side::Pty => &self.to_client,
                };
                pending.is_empty() || now.duration_since(*since) >= linger
            }
        }
    }

    /// Close both descriptors and try to collect the child without blocking.
    /// A child that has not exited yet is killed and handed back so the
    /// registry can keep polling it.
    pub fn teardown(self) -> Option<Box<dyn ChildProcess>> {
        let (to_pty, to_client) = self.buffered();
        let Session {
            id,
            peer,
            socket,
            pty,
            mut child,
            created_at,
            phase,
            ..
        } = self;
        let reason = match phase {
            Phase::Closing { reason, .. } | Phase::Dead { reason } => Some(reason),
            Phase::Live => None,
        };
        drop(socket);
        drop(pty);

        let exit = match child.try_wait() {
            Ok(Some(exit)) => Some(exit),
            Ok(None) => {
                if let Err(e) = child.kill() {
                    warn!(session = %id, error = %e, "failed to kill login process");
                }
                child.try_wait().ok().flatten()
            }
            Err(e) => {
                warn!(session = %id, error = %e, "child status check failed");
                None
            }
        };

        info!(
            session = %id,
            peer = %peer,
            reason = %reason.map(|r| r.to_string()).unwrap_or_else(|| "shutdown".into()),
            exit_code = ?exit.map(|e| e.code),
            dropped_bytes = to_pty + to_client,
            duration_secs = created_at.elapsed().as_secs(),
            "session reaped"
        );

        match exit {
            Some(_) => None,
            None => Some(child),
        }
    }
}

/// Sink wiring the codec to the session's buffers and terminal.
struct Pump<'a> {
    id: SessionId,
    to_pty: &'a mut RingBuffer,
    to_client: &'a mut RingBuffer,
    resizer: &'a mut dyn Resize,
}

impl CodecSink for Pump<'_> {
    fn data(&mut self, bytes: &[u8]) {
        let taken = self.to_pty.append(bytes);
        debug_assert_eq!(taken, bytes.len(), "read budget exceeded terminal buffer");
    }

    fn reply(&mut self, bytes: &[u8]) {
        let taken = self.to_client.append(bytes);
        debug_assert_eq!(taken, bytes.len(), "read budget exceeded reply headroom");
        debug!(
            session = %self.id,
            option = bytes.get(2).copied().map_or("?", option_name),
            reply = ?bytes,
            "option refused"
        );
    }

    fn window_size(&mut self, size: WindowSize) {
        if size.is_zero() {
            debug!(session = %self.id, cols = size.cols, rows = size.rows, "ignoring empty window size");
            return;
        }
        debug!(session = %self.id, cols = size.cols, rows = size.rows, "window size");
        if let Err(e) = self.resizer.resize(size) {
            warn!(session = %self.id, error = %e, "failed to apply window size");
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Linux reports EIO on the master once the slave side has no open handles.
fn pty_failure(e: io::Error) -> CloseReason {
    if e.raw_os_error() == Some(nix::libc::EIO) {
        CloseReason::PtyClosed
    } else {
        CloseReason::PtyError(e.kind())
    }
}

fn register_pty(master: OwnedFd) -> io::Result<AsyncFd<File>> {
    // SAFETY: the `File` owns the descriptor and lives inside the `AsyncFd`,
    // so it stays open and unchanged until the registration is dropped.
    let pty = unsafe { AsyncFd::register(File::from(master)) }?;
    Ok(pty)
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let raw = fd.as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}
