//! ChatServer reactor implementation
//!
//! Owns the listening socket, its accept event source and the registry of
//! sessions. `run` drains the event queue one event at a time, so accept
//! handling, line handling, broadcasts and disconnects never interleave and
//! need no locks.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::io::unix::AsyncFd;
use tokio::net::{lookup_host, TcpSocket};
use tracing::{debug, error, info, warn};

use crate::command::{Command, INVALID_COMMAND};
use crate::config::{ServerConfig, LISTEN_BACKLOG};
use crate::error::{AcceptError, SessionError, StartupError};
use crate::reactor::{event_queue, Event, EventReceiver, EventSender, EventSource};
use crate::registry::Registry;
use crate::session::Session;
use crate::types::{Generation, PeerAddress, SessionKey};

/// Sender label for server notices
pub const SERVER_NAME: &str = "Server";

/// Reply sent before disconnecting a session that sent undecodable input
pub const INVALID_MESSAGE: &str = "Invalid message received";

/// Notice broadcast once when the server stops
pub const STOPPING_NOTICE: &str = "Stopping chat server";

/// Listening socket plus its accept source; only exists while listening
#[derive(Debug)]
struct Listener {
    io: Arc<AsyncFd<TcpListener>>,
    source: EventSource,
    local_addr: SocketAddr,
}

#[derive(Debug)]
enum ServerState {
    Stopped,
    Listening(Listener),
}

/// The chat server
///
/// `Stopped -start()-> Listening -stop()-> Stopped`. All state is owned by
/// the instance, so independent servers can run side by side.
#[derive(Debug)]
pub struct ChatServer {
    config: ServerConfig,
    state: ServerState,
    registry: Registry,
    last_generation: Generation,
    events_tx: EventSender,
    events: EventReceiver,
}

impl ChatServer {
    /// Create a stopped server for the given config
    pub fn new(config: ServerConfig) -> Self {
        let (events_tx, events) = event_queue();
        Self {
            config,
            state: ServerState::Stopped,
            registry: Registry::new(),
            last_generation: Generation::default(),
            events_tx,
            events,
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.state, ServerState::Listening(_))
    }

    /// Bound address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            ServerState::Listening(listener) => Some(listener.local_addr),
            ServerState::Stopped => None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bind, listen and register the accept source
    ///
    /// Any failure here is fatal for the process.
    pub async fn start(&mut self) -> Result<(), StartupError> {
        if self.is_listening() {
            warn!("start() called on a listening server");
            return Ok(());
        }

        let addr = resolve(&self.config).await?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(StartupError::Bind)?;
        socket.set_reuseaddr(true).map_err(StartupError::Bind)?;
        socket.bind(addr).map_err(StartupError::Bind)?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(StartupError::Listen)?;

        // Hand the descriptor over to our own readiness registration
        let listener = listener.into_std().map_err(StartupError::Register)?;
        listener.set_nonblocking(true).map_err(StartupError::Register)?;
        let local_addr = listener.local_addr().map_err(StartupError::Register)?;
        let io = Arc::new(AsyncFd::new(listener).map_err(StartupError::Register)?);
        let source = EventSource::new(Arc::clone(&io), Event::Acceptable, self.events_tx.clone());

        self.state = ServerState::Listening(Listener {
            io,
            source,
            local_addr,
        });
        info!("Chat server listening on {}", local_addr);
        Ok(())
    }

    /// Run the reactor until the server stops
    pub async fn run(&mut self) {
        info!("Reactor started");

        while self.is_listening() {
            let Some(event) = self.events.recv().await else {
                break;
            };
            self.dispatch(event).await;
        }

        info!("Reactor stopped");
    }

    /// Handle one readiness event, then re-arm its source if it still exists
    async fn dispatch(&mut self, event: Event) {
        match event {
            Event::Acceptable => {
                if !self.is_listening() {
                    debug!("Dropping accept notification for stopped server");
                    return;
                }
                self.accept_one().await;
                if let ServerState::Listening(listener) = &self.state {
                    listener.source.rearm();
                }
            }
            Event::Readable(key, generation) => {
                // Also covers a descriptor reused by a newer session
                if !self.registry.is_current(key, generation) {
                    debug!("Dropping stale notification for {} ({:?})", key, generation);
                    return;
                }
                self.handle_readable(key).await;
                if self.registry.is_current(key, generation) {
                    if let Some(session) = self.registry.get(key) {
                        session.rearm();
                    }
                }
            }
        }
    }

    /// Accept a single pending connection
    ///
    /// Failures cost only this connection attempt.
    pub async fn accept_one(&mut self) {
        let session = match self.try_accept() {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!("Spurious accept wakeup");
                return;
            }
            Err(e) => {
                error!("Error handling new client: {}", e);
                return;
            }
        };

        // Announce before joining, so the newcomer is not told about itself
        self.broadcast(&format!("{} connected", session), None).await;

        if let Err(duplicate) = self.registry.insert(session) {
            error!("Descriptor {} is already registered", duplicate.key());
            duplicate.close().await;
        }
        debug!("Total sessions: {}", self.registry.len());
    }

    fn try_accept(&mut self) -> Result<Option<Session>, AcceptError> {
        let ServerState::Listening(listener) = &self.state else {
            return Ok(None);
        };
        let Some(ready) = listener.io.readable().now_or_never() else {
            return Ok(None);
        };
        let mut guard = ready.map_err(AcceptError::Accept)?;

        let stream = match guard.try_io(|inner| inner.get_ref().accept()) {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => return Err(AcceptError::Accept(e)),
            Err(_would_block) => return Ok(None),
        };

        // Resolve now: the address must stay printable after close
        let address = stream
            .peer_addr()
            .map(PeerAddress::from)
            .map_err(AcceptError::PeerAddress)?;
        let generation = self.last_generation.next();
        let session = Session::new(stream, address, generation, self.events_tx.clone())
            .map_err(AcceptError::Register)?;
        self.last_generation = generation;
        Ok(Some(session))
    }

    /// Consume whatever the session has sent
    async fn handle_readable(&mut self, key: SessionKey) {
        let Some(session) = self.registry.get_mut(key) else {
            return;
        };

        match session.receive() {
            Ok(Some(_)) => self.drain_lines(key).await,
            Ok(None) => debug!("No data available from {}", session),
            Err(SessionError::ConnectionClosed) => {
                if let Some(rest) = session.take_remainder() {
                    self.handle_line(key, &rest).await;
                }
                self.disconnect(key, true).await;
            }
            Err(e) => {
                error!("Error handling message from: {}: {}", session, e);
                self.disconnect(key, true).await;
            }
        }
    }

    async fn drain_lines(&mut self, key: SessionKey) {
        while let Some(line) = self.registry.get_mut(key).and_then(|s| s.next_line()) {
            self.handle_line(key, &line).await;
            if !self.is_listening() {
                break;
            }
        }
    }

    /// Protocol handler for one framed line
    pub async fn handle_line(&mut self, key: SessionKey, frame: &[u8]) {
        let text = match std::str::from_utf8(frame) {
            Ok(text) if !frame.is_empty() => text,
            _ => {
                warn!("Invalid message received from {}", key);
                self.send(INVALID_MESSAGE, key, true).await;
                self.disconnect(key, true).await;
                return;
            }
        };

        let trimmed = text.trim();
        let lower = trimmed.to_lowercase();
        if !self.handle_command(&lower, key).await && !trimmed.is_empty() {
            self.broadcast(trimmed, Some(key)).await;
        }
    }

    /// Execute `command` if it is one
    ///
    /// Returns `true` if it was a command, `false` if it should be treated as chat.
    pub async fn handle_command(&mut self, command: &str, key: SessionKey) -> bool {
        let Some(parsed) = Command::parse(command) else {
            return false;
        };
        let Some(session) = self.registry.get(key) else {
            return true;
        };
        info!("{} sent command: {}", session, command);

        match parsed {
            Command::Exit => self.disconnect(key, true).await,
            Command::Who => {
                let listing = self.registry.describe();
                self.send(&listing, key, false).await;
            }
            Command::StopServer => self.stop().await,
            Command::WhoAmI => {
                let reply = format!("You are {}", session);
                self.send(&reply, key, false).await;
            }
            Command::Rename(name) => {
                let old_name = session.display_name();
                let Some(session) = self.registry.get_mut(key) else {
                    return true;
                };
                session.set_name(name);
                let notice = format!("{} is now {}", old_name, session);
                self.broadcast(&notice, None).await;
            }
            Command::InvalidArity => self.send(INVALID_COMMAND, key, false).await,
        }
        true
    }

    /// Send one line to a single session
    ///
    /// On failure the recipient is disconnected, unless `ignoring_errors`.
    pub async fn send(&mut self, message: &str, to: SessionKey, ignoring_errors: bool) {
        let Some(session) = self.registry.get(to) else {
            return;
        };
        debug!("Sending to {}: {}", session, message);

        let payload = format!("{}\n", message);
        if let Err(e) = session.send_all(payload.as_bytes()).await {
            if ignoring_errors {
                debug!("Ignoring send error to {}: {}", session, e);
                return;
            }
            warn!("Error sending message to: {}, message: {}: {}", session, message, e);
            self.disconnect(to, true).await;
        }
    }

    /// Send `message` to every session except `from`
    ///
    /// Receivers that fail are disconnected once the fan-out is done.
    pub async fn broadcast(&mut self, message: &str, from: Option<SessionKey>) {
        let failed = self.fan_out(message, from).await;
        for key in failed {
            self.disconnect(key, true).await;
        }
    }

    /// Write to every session but `from`; returns the receivers that failed
    async fn fan_out(&self, message: &str, from: Option<SessionKey>) -> Vec<SessionKey> {
        let sender_name = from
            .and_then(|key| self.registry.get(key))
            .map(Session::display_name)
            .unwrap_or_else(|| SERVER_NAME.to_string());
        let payload = format!("{}: {}\n", sender_name, message);
        info!("{}", payload.trim_end_matches('\n'));

        let mut failed = Vec::new();
        for key in self.registry.snapshot() {
            if Some(key) == from {
                continue;
            }
            let Some(receiver) = self.registry.get(key) else {
                continue;
            };
            if let Err(e) = receiver.send_all(payload.as_bytes()).await {
                warn!("Error broadcasting message to: {}: {}", receiver, e);
                failed.push(key);
            }
        }
        failed
    }

    /// Tear a session down exactly once
    ///
    /// The notice goes to every registered session, the departing one
    /// included, before it is removed. A failed send to the departing session
    /// is ignored; other failed receivers are disconnected in turn. Calling
    /// this for a session that is already gone does nothing.
    pub async fn disconnect(&mut self, key: SessionKey, broadcast_to_others: bool) {
        let mut pending = VecDeque::from([(key, broadcast_to_others)]);

        while let Some((key, notify)) = pending.pop_front() {
            let Some(name) = self.registry.get(key).map(Session::display_name) else {
                debug!("{} is already disconnected", key);
                continue;
            };

            if notify {
                let failed = self.fan_out(&format!("{} disconnected", name), None).await;
                pending.extend(
                    failed
                        .into_iter()
                        .filter(|&failed| failed != key)
                        .map(|failed| (failed, true)),
                );
            } else {
                info!("{} disconnected", name);
            }

            if let Some(session) = self.registry.remove(key) {
                session.close().await;
            }
        }

        debug!("Total sessions: {}", self.registry.len());
    }

    /// Stop serving; idempotent
    ///
    /// Sends one notice to everyone, closes the listening socket, then drops
    /// every session without individual notices.
    pub async fn stop(&mut self) {
        if !self.is_listening() {
            debug!("stop() called on a stopped server");
            return;
        }

        self.broadcast(STOPPING_NOTICE, None).await;

        if let ServerState::Listening(mut listener) =
            std::mem::replace(&mut self.state, ServerState::Stopped)
        {
            listener.source.release().await;
            // Dropping the last handle closes the socket
            drop(listener);
        }

        for key in self.registry.snapshot() {
            self.disconnect(key, false).await;
        }
    }
}

/// Resolve the configured host/port to the first usable address
async fn resolve(config: &ServerConfig) -> Result<SocketAddr, StartupError> {
    let host = config.bind_host();
    let resolve_error = |source: io::Error| StartupError::Resolve {
        host: host.to_string(),
        port: config.port.clone(),
        source,
    };

    let port: u16 = config
        .port
        .parse()
        .map_err(|e| resolve_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    let mut addrs = lookup_host((host, port)).await.map_err(resolve_error)?;

    addrs.next().ok_or_else(|| StartupError::NoAddress {
        host: host.to_string(),
        port: config.port.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(3);
    const QUIET: Duration = Duration::from_millis(200);

    async fn start_server() -> (SocketAddr, JoinHandle<ChatServer>) {
        let mut server = ChatServer::new(ServerConfig::new(Some("127.0.0.1".to_string()), "0"));
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            server.run().await;
            server
        });
        (addr, handle)
    }

    struct TestClient {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        label: String,
    }

    impl TestClient {
        /// Connect and wait until the server has registered us
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let label = format!("\"127.0.0.1\":{}", stream.local_addr().unwrap().port());
            let (reader, writer) = stream.into_split();
            let mut client = Self {
                reader: BufReader::new(reader),
                writer,
                label,
            };
            client.send("/whoami").await;
            let expected = format!("You are {}", client.label);
            assert_eq!(client.recv().await.as_deref(), Some(expected.as_str()));
            client
        }

        async fn send(&mut self, line: &str) {
            self.send_raw(format!("{}\n", line).as_bytes()).await;
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        /// Next line without its terminator; `None` at EOF
        async fn recv(&mut self) -> Option<String> {
            let mut line = String::new();
            let n = timeout(WAIT, self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a line")
                .unwrap_or(0);
            (n > 0).then(|| line.trim_end_matches('\n').to_string())
        }

        async fn expect_silence(&mut self) {
            let mut line = String::new();
            let outcome = timeout(QUIET, self.reader.read_line(&mut line)).await;
            assert!(outcome.is_err(), "unexpected traffic: {:?}", line);
        }
    }

    /// Three registered clients with the join notices already drained
    async fn three_clients(addr: SocketAddr) -> (TestClient, TestClient, TestClient) {
        let mut a = TestClient::connect(addr).await;
        let mut b = TestClient::connect(addr).await;
        assert_eq!(a.recv().await, Some(format!("Server: {} connected", b.label)));
        let c = TestClient::connect(addr).await;
        assert_eq!(a.recv().await, Some(format!("Server: {} connected", c.label)));
        assert_eq!(b.recv().await, Some(format!("Server: {} connected", c.label)));
        (a, b, c)
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let (addr, _server) = start_server().await;
        let (mut a, mut b, mut c) = three_clients(addr).await;

        a.send("Hello World").await;

        let expected = format!("{}: Hello World", a.label);
        assert_eq!(b.recv().await, Some(expected.clone()));
        assert_eq!(c.recv().await, Some(expected));
        a.expect_silence().await;
    }

    #[tokio::test]
    async fn test_who_lists_sessions_in_order() {
        let (addr, _server) = start_server().await;
        let (mut a, mut b, mut c) = three_clients(addr).await;

        a.send("/name alice").await;
        for client in [&mut a, &mut b, &mut c] {
            let notice = client.recv().await;
            assert!(notice.unwrap().ends_with(" is now alice"));
        }
        b.send("/name bob").await;
        for client in [&mut a, &mut b, &mut c] {
            let notice = client.recv().await;
            assert!(notice.unwrap().ends_with(" is now bob"));
        }

        c.send("/who").await;
        let expected = format!(
            "alice is {}, bob is {}, {}",
            a.label, b.label, c.label
        );
        assert_eq!(c.recv().await, Some(expected));
        a.expect_silence().await;
    }

    #[tokio::test]
    async fn test_rename_announced_with_old_name() {
        let (addr, _server) = start_server().await;
        let (mut a, mut b, mut c) = three_clients(addr).await;

        a.send("/name alice").await;
        let first = format!("Server: {} is now alice", a.label);
        for client in [&mut a, &mut b, &mut c] {
            assert_eq!(client.recv().await, Some(first.clone()));
        }

        a.send("/name bob2").await;
        for client in [&mut a, &mut b, &mut c] {
            assert_eq!(client.recv().await.as_deref(), Some("Server: alice is now bob2"));
        }

        b.send("/whoami").await;
        assert_eq!(b.recv().await, Some(format!("You are {}", b.label)));
        a.send("/whoami").await;
        assert_eq!(a.recv().await.as_deref(), Some("You are bob2"));
    }

    #[tokio::test]
    async fn test_name_with_wrong_arity_is_rejected() {
        let (addr, _server) = start_server().await;
        let mut a = TestClient::connect(addr).await;
        let mut b = TestClient::connect(addr).await;
        a.recv().await;

        a.send("/name a b").await;
        assert_eq!(a.recv().await.as_deref(), Some(INVALID_COMMAND));
        b.expect_silence().await;

        a.send("/whoami").await;
        assert_eq!(a.recv().await, Some(format!("You are {}", a.label)));
    }

    #[tokio::test]
    async fn test_commands_are_case_insensitive_and_lowercase_names() {
        let (addr, _server) = start_server().await;
        let mut a = TestClient::connect(addr).await;

        a.send("  /WhoAmI  ").await;
        assert_eq!(a.recv().await, Some(format!("You are {}", a.label)));

        a.send("/NAME Alice").await;
        assert_eq!(
            a.recv().await,
            Some(format!("Server: {} is now alice", a.label))
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_disconnects_only_that_session() {
        let (addr, _server) = start_server().await;
        let mut a = TestClient::connect(addr).await;
        let mut b = TestClient::connect(addr).await;
        a.recv().await;

        a.send_raw(&[0xff, 0xfe, b'\n']).await;
        assert_eq!(a.recv().await.as_deref(), Some(INVALID_MESSAGE));
        assert_eq!(a.recv().await, Some(format!("Server: {} disconnected", a.label)));
        assert_eq!(a.recv().await, None);

        assert_eq!(b.recv().await, Some(format!("Server: {} disconnected", a.label)));
        b.send("/who").await;
        assert_eq!(b.recv().await, Some(b.label.clone()));
    }

    #[tokio::test]
    async fn test_exit_notifies_everyone_then_closes() {
        let (addr, _server) = start_server().await;
        let mut a = TestClient::connect(addr).await;
        let mut b = TestClient::connect(addr).await;
        a.recv().await;

        a.send("/exit").await;
        // The leaving session hears its own notice before EOF
        assert_eq!(a.recv().await, Some(format!("Server: {} disconnected", a.label)));
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, Some(format!("Server: {} disconnected", a.label)));
        b.expect_silence().await;
    }

    #[tokio::test]
    async fn test_peer_close_disconnects() {
        let (addr, _server) = start_server().await;
        let a = TestClient::connect(addr).await;
        let mut b = TestClient::connect(addr).await;
        let label = a.label.clone();

        drop(a);
        assert_eq!(b.recv().await, Some(format!("Server: {} disconnected", label)));
    }

    #[tokio::test]
    async fn test_unterminated_line_is_delivered_at_close() {
        let (addr, _server) = start_server().await;
        let mut a = TestClient::connect(addr).await;
        let mut b = TestClient::connect(addr).await;
        a.recv().await;

        a.send_raw(b"bye").await;
        a.writer.shutdown().await.unwrap();

        assert_eq!(b.recv().await, Some(format!("{}: bye", a.label)));
        assert_eq!(b.recv().await, Some(format!("Server: {} disconnected", a.label)));
    }

    #[tokio::test]
    async fn test_blank_lines_produce_no_traffic() {
        let (addr, _server) = start_server().await;
        let mut a = TestClient::connect(addr).await;
        let mut b = TestClient::connect(addr).await;
        a.recv().await;

        a.send("   \t ").await;
        a.send("").await;
        b.expect_silence().await;
        a.expect_silence().await;
    }

    #[tokio::test]
    async fn test_unknown_slash_words_are_chat() {
        let (addr, _server) = start_server().await;
        let mut a = TestClient::connect(addr).await;
        let mut b = TestClient::connect(addr).await;
        a.recv().await;

        a.send("/StopP now").await;
        assert_eq!(b.recv().await, Some(format!("{}: /StopP now", a.label)));

        // Still serving
        b.send("/whoami").await;
        assert_eq!(b.recv().await, Some(format!("You are {}", b.label)));
    }

    #[tokio::test]
    async fn test_stopserver_notifies_once_and_tears_down() {
        let (addr, server) = start_server().await;
        let mut a = TestClient::connect(addr).await;
        let mut b = TestClient::connect(addr).await;
        a.recv().await;

        a.send("/stopserver").await;

        for client in [&mut a, &mut b] {
            assert_eq!(client.recv().await.as_deref(), Some("Server: Stopping chat server"));
            assert_eq!(client.recv().await, None);
        }

        let mut server = timeout(WAIT, server).await.unwrap().unwrap();
        assert!(!server.is_listening());
        assert!(server.registry().is_empty());
        assert!(server.local_addr().is_none());
        assert!(TcpStream::connect(addr).await.is_err());

        // Second stop has no observable effect
        server.stop().await;
        assert!(!server.is_listening());
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_harmless() {
        let mut server = ChatServer::new(ServerConfig::new(Some("127.0.0.1".to_string()), "0"));
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let event = timeout(WAIT, server.events.recv()).await.unwrap();
        assert_eq!(event, Some(Event::Acceptable));
        server.dispatch(Event::Acceptable).await;
        assert_eq!(server.registry().len(), 1);

        let key = server.registry().snapshot()[0];
        server.disconnect(key, true).await;
        assert!(server.registry().is_empty());
        server.disconnect(key, true).await;
        assert!(server.registry().is_empty());

        server.stop().await;
    }

    /// Accept one connection on a server that is not running its reactor
    async fn admit(server: &mut ChatServer) -> BufReader<TcpStream> {
        let client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let event = timeout(WAIT, server.events.recv()).await.unwrap();
        assert_eq!(event, Some(Event::Acceptable));
        server.dispatch(Event::Acceptable).await;
        BufReader::new(client)
    }

    fn label_of(client: &BufReader<TcpStream>) -> String {
        let port = client.get_ref().local_addr().unwrap().port();
        format!("\"127.0.0.1\":{}", port)
    }

    async fn next_line(client: &mut BufReader<TcpStream>) -> Option<String> {
        let mut line = String::new();
        let n = timeout(WAIT, client.read_line(&mut line)).await.unwrap().unwrap_or(0);
        (n > 0).then(|| line.trim_end_matches('\n').to_string())
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_broadcast_failure_disconnects_receiver_and_continues() {
        let mut server = ChatServer::new(ServerConfig::new(Some("127.0.0.1".to_string()), "0"));
        server.start().await.unwrap();

        let mut a = admit(&mut server).await;
        let b = admit(&mut server).await;
        let mut c = admit(&mut server).await;
        assert_eq!(server.registry().len(), 3);
        let (b_label, c_label) = (label_of(&b), label_of(&c));

        // Abortive close: the server's next write to b fails
        b.get_ref().set_linger(Some(Duration::ZERO)).unwrap();
        drop(b);
        tokio::time::sleep(Duration::from_millis(100)).await;

        server.broadcast("hello", None).await;
        assert_eq!(server.registry().len(), 2);

        assert_eq!(next_line(&mut a).await, Some(format!("Server: {} connected", b_label)));
        assert_eq!(next_line(&mut a).await, Some(format!("Server: {} connected", c_label)));
        for client in [&mut a, &mut c] {
            assert_eq!(next_line(client).await.as_deref(), Some("Server: hello"));
            assert_eq!(
                next_line(client).await,
                Some(format!("Server: {} disconnected", b_label))
            );
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_readable_from_earlier_generation_is_dropped() {
        let mut server = ChatServer::new(ServerConfig::new(Some("127.0.0.1".to_string()), "0"));
        server.start().await.unwrap();
        let mut client = admit(&mut server).await;
        let label = label_of(&client);

        client.get_mut().write_all(b"/exit\n").await.unwrap();
        let event = timeout(WAIT, server.events.recv()).await.unwrap().unwrap();
        let Event::Readable(key, generation) = event else {
            panic!("expected a readable event, got {:?}", event);
        };
        assert!(server.registry().is_current(key, generation));

        // Same descriptor, earlier accept: ignored
        server.dispatch(Event::Readable(key, Generation::default())).await;
        assert_eq!(server.registry().len(), 1);

        server.dispatch(event).await;
        assert!(server.registry().is_empty());
        assert_eq!(next_line(&mut client).await, Some(format!("Server: {} disconnected", label)));
        assert_eq!(next_line(&mut client).await, None);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_spurious_accept_is_a_no_op() {
        let mut server = ChatServer::new(ServerConfig::new(Some("127.0.0.1".to_string()), "0"));
        server.start().await.unwrap();

        server.accept_one().await;
        assert!(server.registry().is_empty());
        assert!(server.is_listening());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_start_fails_when_port_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port().to_string();

        let mut server = ChatServer::new(ServerConfig::new(Some("127.0.0.1".to_string()), port));
        let err = server.start().await.unwrap_err();
        assert!(
            matches!(err, StartupError::Bind(_) | StartupError::Listen(_)),
            "unexpected error: {}",
            err
        );
        assert!(!server.is_listening());
    }

    #[tokio::test]
    async fn test_start_rejects_bad_port() {
        let mut server = ChatServer::new(ServerConfig::new(None, "not-a-port"));
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, StartupError::Resolve { .. }));
    }
}
