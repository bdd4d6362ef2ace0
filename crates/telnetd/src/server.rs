//! Core server: the listener and the single-threaded event loop.
//!
//! Each turn of the loop rebuilds the interest set from the registry, waits
//! once for any descriptor (or the listener, or the housekeeping tick) to
//! become ready, then gives every ready descriptor exactly one non-blocking
//! attempt before waiting again.

use crate::config::ServerConfig;
use crate::session::{Preamble, PtySpawner, Readiness, Registry, Session, SessionId};
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Instant;
use telnet_core::{greeting, TelnetError, TelnetResult, WindowSize};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// What woke the loop up.
struct Wake {
    accepted: Option<io::Result<(TcpStream, SocketAddr)>>,
    ready: Vec<(SessionId, Readiness)>,
    tick: bool,
}

/// The telnetd engine: one listener, one registry, one loop.
pub struct Server<S: PtySpawner> {
    config: ServerConfig,
    listener: TcpListener,
    spawner: S,
    registry: Registry,
    preamble: Preamble,
    housekeeping: Interval,
    /// Set after a failed accept; cleared by the next housekeeping tick.
    accept_paused: bool,
}

impl<S: PtySpawner> Server<S> {
    /// Bind to `addr` and build a server around the listener.
    pub async fn bind(addr: SocketAddr, config: ServerConfig, spawner: S) -> TelnetResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TelnetError::Transport(format!("bind {addr} failed: {e}")))?;
        Ok(Self::new(listener, config, spawner))
    }

    /// Adopt a listener bound before the runtime started.
    pub fn from_std(
        listener: std::net::TcpListener,
        config: ServerConfig,
        spawner: S,
    ) -> TelnetResult<Self> {
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        Ok(Self::new(listener, config, spawner))
    }

    fn new(listener: TcpListener, config: ServerConfig, spawner: S) -> Self {
        let negotiation = if config.negotiate {
            greeting()
        } else {
            Vec::new()
        };
        let preamble = Preamble {
            negotiation,
            banner: config.load_banner(),
        };
        let mut housekeeping = interval(config.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            config,
            listener,
            spawner,
            registry: Registry::new(),
            preamble,
            housekeeping,
            accept_paused: false,
        }
    }

    pub fn local_addr(&self) -> TelnetResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Serve forever. Failures inside the loop only ever end sessions.
    pub async fn run(mut self) -> TelnetResult<()> {
        info!(
            addr = %self.local_addr()?,
            login = %self.config.login.display(),
            max_sessions = self.config.max_sessions,
            "accepting connections"
        );
        loop {
            self.turn().await;
        }
    }

    /// One loop iteration: wait, then do one unit of work per ready source.
    pub async fn turn(&mut self) {
        let wake = poll_fn(|cx| self.poll_wake(cx)).await;

        for (id, ready) in wake.ready {
            if let Some(session) = self.registry.get_mut(id) {
                session.drive(ready);
            }
        }

        if wake.tick {
            self.accept_paused = false;
            self.registry.check_children(Instant::now(), self.config.linger);
            trace!(
                sessions = self.registry.len(),
                orphans = self.registry.orphan_count(),
                "housekeeping"
            );
        }

        if let Some(result) = wake.accepted {
            self.on_accept(result);
        }

        self.registry.reap(Instant::now(), self.config.linger);
    }

    fn poll_wake(&mut self, cx: &mut Context<'_>) -> Poll<Wake> {
        let ready: Vec<(SessionId, Readiness)> = self
            .registry
            .iter()
            .filter_map(|session| {
                let ready = session.poll_ready(cx);
                (!ready.is_empty()).then(|| (session.id(), ready))
            })
            .collect();

        let accepted = if self.accept_paused {
            None
        } else {
            match self.listener.poll_accept(cx) {
                Poll::Ready(result) => Some(result),
                Poll::Pending => None,
            }
        };

        let tick = self.housekeeping.poll_tick(cx).is_ready();

        if ready.is_empty() && accepted.is_none() && !tick {
            return Poll::Pending;
        }
        Poll::Ready(Wake {
            accepted,
            ready,
            tick,
        })
    }

    fn on_accept(&mut self, result: io::Result<(TcpStream, SocketAddr)>) {
        match result {
            Ok((stream, peer)) => self.admit(stream, peer),
            Err(e) => {
                // Usually descriptor exhaustion.
                warn!(error = %e, "TCP accept failed, pausing until next tick");
                self.accept_paused = true;
            }
        }
    }

    /// Turn an accepted connection into a registered session, or drop it.
    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.registry.len() >= self.config.max_sessions {
            warn!(
                peer = %peer,
                max_sessions = self.config.max_sessions,
                "session limit reached, refusing connection"
            );
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "could not disable Nagle");
        }

        let spawned = match self.spawner.spawn(WindowSize::default()) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(peer = %peer, error = %e, "session setup failed");
                return;
            }
        };

        let id = self.registry.next_id();
        match Session::establish(
            id,
            stream,
            peer,
            spawned,
            self.config.buffer_size,
            &self.preamble,
        ) {
            Ok(session) => self.registry.insert(session),
            Err((e, mut child)) => {
                warn!(peer = %peer, error = %e, "session setup failed");
                if let Err(e) = child.kill() {
                    warn!(peer = %peer, error = %e, "failed to kill login process");
                }
                self.registry.adopt(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pty::{ChildExit, ChildProcess, Resize, SpawnedPty};
    use crate::session::NativeSpawner;
    use std::os::fd::OwnedFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use telnet_core::protocol::{option, DO, DONT, IAC, SB, SE, WILL};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;
    use tokio::time::timeout;

    /// Test side of a fake terminal.
    struct FakeTerminal {
        stream: UnixStream,
        resizes: Arc<Mutex<Vec<WindowSize>>>,
        exited: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct FakeSpawner {
        terminals: Arc<Mutex<Vec<FakeTerminal>>>,
        fail: bool,
    }

    struct FakeResizer(Arc<Mutex<Vec<WindowSize>>>);

    impl Resize for FakeResizer {
        fn resize(&mut self, size: WindowSize) -> TelnetResult<()> {
            self.0.lock().unwrap().push(size);
            Ok(())
        }
    }

    struct FakeChild(Arc<AtomicBool>);

    impl ChildProcess for FakeChild {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn try_wait(&mut self) -> TelnetResult<Option<ChildExit>> {
            Ok(self.0.load(Ordering::SeqCst).then_some(ChildExit { code: 0 }))
        }

        fn kill(&mut self) -> TelnetResult<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    impl PtySpawner for FakeSpawner {
        fn spawn(&self, _size: WindowSize) -> TelnetResult<SpawnedPty> {
            if self.fail {
                return Err(TelnetError::Pty("no pty for you".into()));
            }
            let (ours, theirs) = std::os::unix::net::UnixStream::pair()?;
            theirs.set_nonblocking(true)?;
            let resizes = Arc::new(Mutex::new(Vec::new()));
            let exited = Arc::new(AtomicBool::new(false));
            self.terminals.lock().unwrap().push(FakeTerminal {
                stream: UnixStream::from_std(theirs)?,
                resizes: resizes.clone(),
                exited: exited.clone(),
            });
            Ok(SpawnedPty {
                master: OwnedFd::from(ours),
                resizer: Box::new(FakeResizer(resizes)),
                child: Box::new(FakeChild(exited)),
            })
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            negotiate: false,
            issue_file: None,
            housekeeping_interval: Duration::from_millis(20),
            linger: Duration::from_secs(2),
            ..ServerConfig::default()
        }
    }

    async fn server_with(
        config: ServerConfig,
        spawner: FakeSpawner,
    ) -> (Server<FakeSpawner>, Arc<Mutex<Vec<FakeTerminal>>>) {
        let terminals = spawner.terminals.clone();
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), config, spawner)
            .await
            .unwrap();
        (server, terminals)
    }

    /// Run loop turns until `done` holds, failing after two seconds.
    async fn turn_until<S: PtySpawner>(
        server: &mut Server<S>,
        mut done: impl FnMut(&Server<S>) -> bool,
    ) {
        timeout(Duration::from_secs(2), async {
            while !done(&*server) {
                server.turn().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Connect a client and drive the loop until its session is registered.
    async fn connect(
        server: &mut Server<FakeSpawner>,
        terminals: &Arc<Mutex<Vec<FakeTerminal>>>,
    ) -> (TcpStream, FakeTerminal) {
        let addr = server.local_addr().unwrap();
        let before = server.registry().len();
        let client = TcpStream::connect(addr).await.unwrap();
        turn_until(server, |s| s.registry().len() > before).await;
        let terminal = terminals.lock().unwrap().pop().unwrap();
        (client, terminal)
    }

    /// Drive the loop while reading exactly `n` bytes from `reader`.
    async fn read_exact_driving<R: AsyncRead + Unpin>(
        server: &mut Server<FakeSpawner>,
        reader: &mut R,
        n: usize,
    ) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        timeout(Duration::from_secs(2), async {
            while filled < n {
                tokio::select! {
                    read = reader.read(&mut buf[filled..]) => {
                        let read = read.unwrap();
                        assert!(read > 0, "unexpected EOF after {filled} bytes");
                        filled += read;
                    }
                    _ = server.turn() => {}
                }
            }
        })
        .await
        .expect("bytes not delivered in time");
        buf
    }

    #[tokio::test]
    async fn client_bytes_reach_terminal_unmodified() {
        let (mut server, terminals) = server_with(test_config(), FakeSpawner::default()).await;
        let (mut client, mut terminal) = connect(&mut server, &terminals).await;

        client.write_all(b"ls\r\n").await.unwrap();
        let got = read_exact_driving(&mut server, &mut terminal.stream, 4).await;
        assert_eq!(got, b"ls\r\n");

        terminal.stream.write_all(b"file.txt\r\n$ ").await.unwrap();
        let got = read_exact_driving(&mut server, &mut client, 12).await;
        assert_eq!(got, b"file.txt\r\n$ ");
    }

    #[tokio::test]
    async fn refused_option_answers_client_only() {
        let (mut server, terminals) = server_with(test_config(), FakeSpawner::default()).await;
        let (mut client, mut terminal) = connect(&mut server, &terminals).await;

        client.write_all(&[IAC, WILL, option::ECHO]).await.unwrap();
        client.write_all(b"x").await.unwrap();

        let reply = read_exact_driving(&mut server, &mut client, 3).await;
        assert_eq!(reply, vec![IAC, DONT, option::ECHO]);
        // Only the trailing literal makes it to the terminal.
        let got = read_exact_driving(&mut server, &mut terminal.stream, 1).await;
        assert_eq!(got, b"x");
    }

    #[tokio::test]
    async fn naws_resizes_and_is_not_forwarded() {
        let (mut server, terminals) = server_with(test_config(), FakeSpawner::default()).await;
        let (mut client, mut terminal) = connect(&mut server, &terminals).await;

        // Split the subnegotiation across two writes.
        client.write_all(&[IAC, SB, option::NAWS, 0]).await.unwrap();
        client.flush().await.unwrap();
        client.write_all(&[80, 0, 24, IAC, SE, b'k']).await.unwrap();

        let got = read_exact_driving(&mut server, &mut terminal.stream, 1).await;
        assert_eq!(got, b"k");
        assert_eq!(
            *terminal.resizes.lock().unwrap(),
            vec![WindowSize::new(80, 24)]
        );
    }

    #[tokio::test]
    async fn greeting_is_sent_first() {
        let config = ServerConfig {
            negotiate: true,
            ..test_config()
        };
        let (mut server, terminals) = server_with(config, FakeSpawner::default()).await;
        let (mut client, _terminal) = connect(&mut server, &terminals).await;

        let got = read_exact_driving(&mut server, &mut client, 9).await;
        assert_eq!(got, greeting());
        assert_eq!(&got[..3], &[IAC, DO, option::NAWS]);
    }

    #[tokio::test]
    async fn terminal_eof_flushes_then_closes() {
        let (mut server, terminals) = server_with(test_config(), FakeSpawner::default()).await;
        let (mut client, terminal) = connect(&mut server, &terminals).await;

        let mut pty_side = terminal.stream;
        pty_side.write_all(b"logout\r\n").await.unwrap();
        pty_side.shutdown().await.unwrap();
        drop(pty_side);

        let got = read_exact_driving(&mut server, &mut client, 8).await;
        assert_eq!(got, b"logout\r\n");

        turn_until(&mut server, |s| s.registry().is_empty()).await;

        let mut rest = Vec::new();
        timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn client_disconnect_tears_down_session() {
        let (mut server, terminals) = server_with(test_config(), FakeSpawner::default()).await;
        let (client, terminal) = connect(&mut server, &terminals).await;
        drop(client);

        turn_until(&mut server, |s| s.registry().is_empty()).await;
        // Teardown kills the login child.
        assert!(terminal.exited.load(Ordering::SeqCst));

        let mut pty_side = terminal.stream;
        let mut rest = Vec::new();
        timeout(Duration::from_secs(2), pty_side.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn child_exit_detected_by_housekeeping() {
        let config = ServerConfig {
            linger: Duration::from_millis(200),
            ..test_config()
        };
        let (mut server, terminals) = server_with(config, FakeSpawner::default()).await;
        let (mut client, mut terminal) = connect(&mut server, &terminals).await;

        // Written just before exiting, while the terminal stays open.
        terminal.stream.write_all(b"bye\r\n").await.unwrap();
        terminal.exited.store(true, Ordering::SeqCst);

        let got = read_exact_driving(&mut server, &mut client, 5).await;
        assert_eq!(got, b"bye\r\n");
        turn_until(&mut server, |s| s.registry().is_empty()).await;

        let mut rest = Vec::new();
        timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn client_half_close_still_flushes_to_terminal() {
        let (mut server, terminals) = server_with(test_config(), FakeSpawner::default()).await;
        let (client, mut terminal) = connect(&mut server, &terminals).await;

        let (_read_half, mut write_half) = client.into_split();
        write_half.write_all(b"exit\r\n").await.unwrap();
        drop(write_half);

        let got = read_exact_driving(&mut server, &mut terminal.stream, 6).await;
        assert_eq!(got, b"exit\r\n");
        turn_until(&mut server, |s| s.registry().is_empty()).await;
    }

    #[tokio::test]
    async fn closing_session_keeps_draining_to_client() {
        let config = ServerConfig {
            buffer_size: 64,
            ..test_config()
        };
        let (mut server, terminals) = server_with(config, FakeSpawner::default()).await;
        let (mut client, mut terminal) = connect(&mut server, &terminals).await;

        // More output than one buffer holds, then the terminal goes away.
        let output: Vec<u8> = (0..200u8).collect();
        terminal.stream.write_all(&output).await.unwrap();
        terminal.stream.shutdown().await.unwrap();

        let mut got = Vec::new();
        timeout(Duration::from_secs(2), async {
            tokio::select! {
                read = client.read_to_end(&mut got) => read.unwrap(),
                _ = async { loop { server.turn().await } } => unreachable!(),
            }
        })
        .await
        .unwrap();
        assert_eq!(got, output);
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn setup_failure_registers_nothing() {
        let spawner = FakeSpawner {
            fail: true,
            ..Default::default()
        };
        let (mut server, _terminals) = server_with(test_config(), spawner).await;
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut rest = Vec::new();
        timeout(Duration::from_secs(2), async {
            tokio::select! {
                read = client.read_to_end(&mut rest) => read.unwrap(),
                _ = async { loop { server.turn().await } } => unreachable!(),
            }
        })
        .await
        .unwrap();
        assert!(rest.is_empty());
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn session_limit_refuses_extra_clients() {
        let config = ServerConfig {
            max_sessions: 1,
            ..test_config()
        };
        let (mut server, terminals) = server_with(config, FakeSpawner::default()).await;
        let (_first, _terminal) = connect(&mut server, &terminals).await;

        let addr = server.local_addr().unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut rest = Vec::new();
        timeout(Duration::from_secs(2), async {
            tokio::select! {
                read = second.read_to_end(&mut rest) => read.unwrap(),
                _ = async { loop { server.turn().await } } => unreachable!(),
            }
        })
        .await
        .unwrap();
        assert!(rest.is_empty());
        assert_eq!(server.registry().len(), 1);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let (mut server, terminals) = server_with(test_config(), FakeSpawner::default()).await;
        let (mut a, mut term_a) = connect(&mut server, &terminals).await;
        let (mut b, mut term_b) = connect(&mut server, &terminals).await;

        a.write_all(b"first").await.unwrap();
        b.write_all(b"second").await.unwrap();

        assert_eq!(read_exact_driving(&mut server, &mut term_b.stream, 6).await, b"second");
        assert_eq!(read_exact_driving(&mut server, &mut term_a.stream, 5).await, b"first");

        drop(a);
        turn_until(&mut server, |s| s.registry().len() == 1).await;

        term_b.stream.write_all(b"still here").await.unwrap();
        assert_eq!(read_exact_driving(&mut server, &mut b, 10).await, b"still here");
    }

    #[tokio::test]
    async fn large_transfer_respects_backpressure() {
        let config = ServerConfig {
            buffer_size: 64,
            ..test_config()
        };
        let (mut server, terminals) = server_with(config, FakeSpawner::default()).await;
        let (mut client, mut terminal) = connect(&mut server, &terminals).await;

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });

        let got = read_exact_driving(&mut server, &mut terminal.stream, expected.len()).await;
        assert_eq!(got, expected);
        let _client = writer.await.unwrap();
    }

    #[tokio::test]
    async fn zero_window_size_is_ignored() {
        let (mut server, terminals) = server_with(test_config(), FakeSpawner::default()).await;
        let (mut client, mut terminal) = connect(&mut server, &terminals).await;

        client
            .write_all(&[IAC, SB, option::NAWS, 0, 0, 0, 24, IAC, SE])
            .await
            .unwrap();
        client
            .write_all(&[IAC, SB, option::NAWS, 0, 80, 0, 0, IAC, SE, b'k'])
            .await
            .unwrap();

        let got = read_exact_driving(&mut server, &mut terminal.stream, 1).await;
        assert_eq!(got, b"k");
        assert!(terminal.resizes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn linger_expiry_reaps_session_with_pending_output() {
        let linger = Duration::from_millis(300);
        let config = ServerConfig {
            buffer_size: 64,
            linger,
            ..test_config()
        };
        let (mut server, terminals) = server_with(config, FakeSpawner::default()).await;
        // The client never reads, so output backs up into the session.
        let (_client, terminal) = connect(&mut server, &terminals).await;

        let FakeTerminal {
            stream: mut pty_side,
            exited,
            ..
        } = terminal;
        let flood = tokio::spawn(async move {
            let chunk = [b'y'; 16 * 1024];
            while pty_side.write_all(&chunk).await.is_ok() {}
        });

        timeout(Duration::from_secs(10), async {
            while !server.registry().iter().all(|s| s.buffered().1 == 64) {
                server.turn().await;
            }
        })
        .await
        .expect("client-bound buffer never filled");

        exited.store(true, Ordering::SeqCst);
        turn_until(&mut server, |s| s.registry().iter().all(|session| !session.is_live())).await;
        let closed_at = Instant::now();
        assert!(server.registry().iter().all(|s| s.buffered().1 > 0));

        turn_until(&mut server, |s| s.registry().is_empty()).await;
        assert!(closed_at.elapsed() >= linger - Duration::from_millis(50));

        // Teardown closed the terminal side, which ends the flood.
        timeout(Duration::from_secs(2), flood).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn accept_failure_pauses_listener_until_tick() {
        let config = ServerConfig {
            housekeeping_interval: Duration::from_millis(400),
            ..test_config()
        };
        let (mut server, terminals) = server_with(config, FakeSpawner::default()).await;
        let (_first, _terminal) = connect(&mut server, &terminals).await;

        server.on_accept(Err(io::Error::from_raw_os_error(nix::libc::EMFILE)));
        assert!(server.accept_paused);

        let addr = server.local_addr().unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();

        // Nothing wakes the loop for the listener while paused.
        let _ = timeout(Duration::from_millis(100), async {
            loop {
                server.turn().await;
            }
        })
        .await;
        assert_eq!(server.registry().len(), 1);

        turn_until(&mut server, |s| s.registry().len() == 2).await;
        assert!(!server.accept_paused);
    }

    #[tokio::test]
    async fn native_shell_session_round_trip() {
        let config = ServerConfig {
            login: "/bin/sh".into(),
            ..test_config()
        };
        let spawner = NativeSpawner::new(config.login.clone(), config.term.clone());
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), config, spawner)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&[IAC, SB, option::NAWS, 0, 100, 0, 40, IAC, SE])
            .await
            .unwrap();
        client
            .write_all(b"stty size; echo MARK$((1+1)); exit\r")
            .await
            .unwrap();

        // The shell exits, the master reads EIO, and the session drains and
        // closes the connection.
        let mut got = Vec::new();
        timeout(Duration::from_secs(10), async {
            tokio::select! {
                read = client.read_to_end(&mut got) => read.unwrap(),
                _ = async { loop { server.turn().await } } => unreachable!(),
            }
        })
        .await
        .expect("shell session did not finish");

        let output = String::from_utf8_lossy(&got);
        assert!(output.contains("40 100"), "output: {output:?}");
        assert!(output.contains("MARK2"), "output: {output:?}");

        turn_until(&mut server, |s| s.registry().is_empty()).await;
    }
}
