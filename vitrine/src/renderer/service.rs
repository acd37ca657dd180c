//! The renderer-side control service.
//!
//! A single-threaded mio event loop over a loopback listener:
//! - accept connections (over the cap: answer `too_many_connections` and
//!   close);
//! - per message, enforce the shared-secret token when one is configured —
//!   a mismatch on *any* message type answers `unauthorized` and closes
//!   the connection;
//! - dispatch lifecycle commands against the session registry;
//! - run one paint-pump iteration per loop tick.
//!
//! Sessions are owned by the connection that created them and are disposed
//! when it drops, so a host that reconnects starts from a clean registry
//! and recreates what it needs. The most recently authenticated connection
//! is the single active consumer for inline `frameReady` fallback frames.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;

use crate::config::ServiceConfig;
use crate::net::{write_line_all, FillOutcome, LineBuffer, LineError};
use crate::protocol::{
    decode_line, encode_line, pixels, AckStatus, ControlMessage, ErrorReason, ProtocolError,
};
use crate::renderer::paint::PaintSourceFactory;
use crate::renderer::session::{RendererSession, SessionParams};
use crate::trace::{debug, info, warn};

const LISTENER: Token = Token(0);
const FIRST_CONN: usize = 1;

/// Inline frame sends are logged once per this many frames.
const FRAME_LOG_EVERY: u64 = 300;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("control listener failed: {0}")]
    Io(#[from] io::Error),
}

struct Connection {
    stream: TcpStream,
    buffer: LineBuffer,
    peer: SocketAddr,
    authenticated: bool,
}

struct SessionEntry {
    session: RendererSession,
    owner: Token,
}

/// The renderer process's control service and paint pump.
pub struct RendererService {
    config: ServiceConfig,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    conns: HashMap<Token, Connection>,
    sessions: HashMap<String, SessionEntry>,
    active_sink: Option<Token>,
    factory: PaintSourceFactory,
    next_token: usize,
    shutdown: Arc<AtomicBool>,
    frames_sent_inline: u64,
}

impl RendererService {
    /// Binds the loopback listener and prepares the event loop.
    ///
    /// # Errors
    ///
    /// Fails when the port is taken or the poller cannot be created.
    pub fn bind(config: ServiceConfig, factory: PaintSourceFactory) -> Result<Self, ServiceError> {
        let addr: SocketAddr = ([127, 0, 0, 1], config.port).into();
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        info!(addr = %local_addr, "renderer control service listening");
        Ok(Self {
            config,
            poll,
            events: Events::with_capacity(64),
            listener,
            local_addr,
            conns: HashMap::new(),
            sessions: HashMap::new(),
            active_sink: None,
            factory,
            next_token: FIRST_CONN,
            shutdown: Arc::new(AtomicBool::new(false)),
            frames_sent_inline: 0,
        })
    }

    /// The bound port — useful when configured with port 0.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Flag that stops [`run`](Self::run) from another thread or a signal
    /// handler.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs until the shutdown flag is raised, then tears every session
    /// down (destroying their segments).
    pub fn run(&mut self) -> Result<(), ServiceError> {
        while !self.shutdown.load(Ordering::Relaxed) {
            self.poll_once()?;
        }
        info!(sessions = self.sessions.len(), "service shutting down");
        self.sessions.clear();
        Ok(())
    }

    /// One event-loop iteration: socket readiness, then the paint pump.
    pub fn poll_once(&mut self) -> Result<(), ServiceError> {
        match self.poll.poll(&mut self.events, Some(self.config.poll_timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let ready: Vec<Token> = self.events.iter().map(|ev| ev.token()).collect();
        for token in ready {
            if token == LISTENER {
                self.accept_pending();
            } else {
                self.service_connection(token);
            }
        }

        self.pump_sessions();
        Ok(())
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    if self.conns.len() >= self.config.max_connections {
                        warn!(%peer, "connection limit reached, refusing");
                        self.send_direct(
                            &mut stream,
                            &ControlMessage::Error {
                                message: ErrorReason::TooManyConnections,
                            },
                        );
                        continue; // stream drops here
                    }

                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(%peer, error = %e, "failed to register connection");
                        continue;
                    }

                    debug!(%peer, "connection accepted");
                    self.conns.insert(
                        token,
                        Connection {
                            stream,
                            buffer: LineBuffer::new(),
                            peer,
                            authenticated: false,
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn service_connection(&mut self, token: Token) {
        let mut lines = Vec::new();
        let outcome = match self.conns.get_mut(&token) {
            Some(conn) => conn.buffer.fill_from(&mut conn.stream, &mut lines),
            None => return,
        };

        for line in &lines {
            if !self.handle_line(token, line) {
                self.drop_connection(token, "protocol violation");
                return;
            }
        }

        match outcome {
            Ok(FillOutcome::Open) => {}
            Ok(FillOutcome::Closed) => self.drop_connection(token, "peer closed"),
            Err(LineError::Oversized) => self.drop_connection(token, "oversized line"),
            Err(error) => {
                warn!(error = %error, "read failed");
                self.drop_connection(token, "read error");
            }
        }
    }

    /// Handles one decoded line. Returns `false` when the connection must
    /// be closed (auth failure).
    fn handle_line(&mut self, token: Token, line: &str) -> bool {
        let msg = match decode_line(line) {
            Ok(msg) => msg,
            Err(ProtocolError::UnknownType(ty)) => {
                debug!(ty = %ty, "ignoring unknown message type");
                return true;
            }
            Err(err @ ProtocolError::MissingId(_)) => {
                debug!(error = %err, "rejecting command without id");
                self.send(
                    token,
                    &ControlMessage::Error {
                        message: ErrorReason::MissingId,
                    },
                );
                return true;
            }
            Err(error) => {
                warn!(error = %error, "rejecting undecodable line");
                self.send(
                    token,
                    &ControlMessage::Error {
                        message: ErrorReason::Unsupported,
                    },
                );
                return true;
            }
        };

        // Token enforcement covers every message type once a secret is
        // configured, not just the handshake.
        if let Some(secret) = &self.config.token {
            if msg.token() != Some(secret.as_str()) {
                warn!(ty = msg.wire_type(), "unauthorized message, closing connection");
                self.send(
                    token,
                    &ControlMessage::Error {
                        message: ErrorReason::Unauthorized,
                    },
                );
                return false;
            }
        }

        match msg {
            ControlMessage::Handshake { client, .. } => {
                info!(client = %client, "handshake");
                if let Some(conn) = self.conns.get_mut(&token) {
                    conn.authenticated = true;
                }
                self.active_sink = Some(token);
                self.send(token, &ControlMessage::HandshakeAck { status: AckStatus::Ok });
            }
            ControlMessage::Ping { .. } => {
                self.send(token, &ControlMessage::Pong);
            }
            ControlMessage::InitBrowser {
                id,
                url,
                width,
                height,
                fps,
                ..
            } => self.init_session(token, SessionParams::resolve(id, url, width, height, fps)),
            ControlMessage::UpdateBrowser {
                id,
                url,
                width,
                height,
                ..
            } => self.update_session(token, &id, url.as_deref(), width, height),
            ControlMessage::DisposeBrowser { id, .. } => self.dispose_session(token, &id),
            other => {
                debug!(ty = other.wire_type(), "ignoring message not addressed to the renderer");
            }
        }
        true
    }

    fn init_session(&mut self, token: Token, params: SessionParams) {
        let id = params.id.clone();
        if self.sessions.remove(&id).is_some() {
            // At most one session per id: the old instance (and its
            // segment) goes away before the replacement claims the name.
            warn!(session = %id, "initBrowser for live id, recreating");
        }

        info!(
            session = %id,
            url = %params.url,
            width = params.width,
            height = params.height,
            fps = params.fps,
            "creating session"
        );
        let session = RendererSession::create(params, &self.factory);
        self.sessions.insert(id.clone(), SessionEntry { session, owner: token });
        self.send(
            token,
            &ControlMessage::BrowserReady {
                id,
                status: AckStatus::Ok,
            },
        );
    }

    fn update_session(
        &mut self,
        token: Token,
        id: &str,
        url: Option<&str>,
        width: Option<u32>,
        height: Option<u32>,
    ) {
        let Some(entry) = self.sessions.get_mut(id) else {
            self.send(
                token,
                &ControlMessage::Error {
                    message: ErrorReason::UnknownId,
                },
            );
            return;
        };
        entry.session.apply_update(url, width, height);
        self.send(
            token,
            &ControlMessage::BrowserUpdated {
                id: id.to_owned(),
                status: AckStatus::Ok,
            },
        );
    }

    fn dispose_session(&mut self, token: Token, id: &str) {
        if self.sessions.remove(id).is_none() {
            self.send(
                token,
                &ControlMessage::Error {
                    message: ErrorReason::UnknownId,
                },
            );
            return;
        }
        info!(session = %id, "session disposed");
        self.send(
            token,
            &ControlMessage::BrowserDisposed {
                id: id.to_owned(),
                status: AckStatus::Ok,
            },
        );
    }

    /// One paint-pump iteration across all sessions. Inline frames go to
    /// the single active fallback consumer.
    fn pump_sessions(&mut self) {
        let now = minstant::Instant::now();
        let mut inline = Vec::new();
        for (id, entry) in &mut self.sessions {
            if let Some(frame) = entry.session.pump(now) {
                inline.push((id.clone(), frame));
            }
        }

        if inline.is_empty() {
            return;
        }
        let Some(sink) = self.active_sink else {
            return;
        };
        for (id, frame) in inline {
            self.frames_sent_inline += 1;
            if self.frames_sent_inline % FRAME_LOG_EVERY == 1 {
                debug!(
                    session = %id,
                    total = self.frames_sent_inline,
                    "delivering inline frames"
                );
            }
            let msg = ControlMessage::FrameReady {
                id,
                width: frame.width,
                height: frame.height,
                data: pixels::encode(&frame.pixels),
            };
            self.send(sink, &msg);
        }
    }

    /// Encodes and writes one line to a connection; a failed write drops
    /// the connection.
    fn send(&mut self, token: Token, msg: &ControlMessage) {
        let line = match encode_line(msg) {
            Ok(line) => line,
            Err(error) => {
                warn!(error = %error, "failed to encode message");
                return;
            }
        };
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if let Err(error) =
            write_line_all(&mut conn.stream, line.as_bytes(), self.config.write_budget)
        {
            warn!(peer = %conn.peer, error = %error, "write failed");
            self.drop_connection(token, "write failure");
        }
    }

    /// Best-effort write to a connection that is not (or not yet) in the
    /// registry.
    fn send_direct(&self, stream: &mut TcpStream, msg: &ControlMessage) {
        if let Ok(line) = encode_line(msg) {
            let _ = write_line_all(stream, line.as_bytes(), self.config.write_budget);
        }
    }

    fn drop_connection(&mut self, token: Token, reason: &str) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        info!(peer = %conn.peer, reason, "connection closed");
        let _ = self.poll.registry().deregister(&mut conn.stream);

        if self.active_sink == Some(token) {
            // Fall back to any other authenticated connection, else none.
            self.active_sink = self
                .conns
                .iter()
                .find(|(_, c)| c.authenticated)
                .map(|(t, _)| *t);
        }

        // Sessions self-clean when their owning connection goes away; the
        // host recreates what it still wants after reconnecting.
        let orphaned: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, e)| e.owner == token)
            .map(|(id, _)| id.clone())
            .collect();
        for id in orphaned {
            info!(session = %id, "disposing session of closed connection");
            self.sessions.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::paint::pattern_factory;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::time::Duration;

    fn test_config(token: Option<&str>) -> ServiceConfig {
        ServiceConfig {
            port: 0,
            token: token.map(str::to_owned),
            max_connections: 2,
            poll_timeout: Duration::from_millis(1),
            write_budget: Duration::from_secs(1),
        }
    }

    struct TestClient {
        reader: BufReader<StdTcpStream>,
        writer: StdTcpStream,
    }

    impl TestClient {
        fn connect(port: u16) -> Self {
            let stream = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let writer = stream.try_clone().unwrap();
            Self {
                reader: BufReader::new(stream),
                writer,
            }
        }

        fn send(&mut self, msg: &ControlMessage) {
            let line = encode_line(msg).unwrap();
            self.writer.write_all(line.as_bytes()).unwrap();
        }

        fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).unwrap();
            self.writer.write_all(b"\n").unwrap();
        }

        /// Reads lines until one decodes as a non-`frameReady` message.
        fn recv(&mut self, service: &mut RendererService) -> ControlMessage {
            loop {
                service.poll_once().unwrap();
                let mut line = String::new();
                let _ = self
                    .reader
                    .get_mut()
                    .set_read_timeout(Some(Duration::from_millis(20)));
                match self.reader.read_line(&mut line) {
                    Ok(0) => panic!("connection closed while awaiting reply"),
                    Ok(_) => match decode_line(line.trim_end()) {
                        Ok(ControlMessage::FrameReady { .. }) => continue,
                        Ok(msg) => return msg,
                        Err(err) => panic!("undecodable reply: {err}"),
                    },
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(e) => panic!("read failed: {e}"),
                }
            }
        }

        fn expect_closed(&mut self, service: &mut RendererService) {
            for _ in 0..100 {
                service.poll_once().unwrap();
                let mut line = String::new();
                let _ = self
                    .reader
                    .get_mut()
                    .set_read_timeout(Some(Duration::from_millis(10)));
                match self.reader.read_line(&mut line) {
                    Ok(0) => return,
                    Ok(_) => continue, // drain the error reply
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(_) => return,
                }
            }
            panic!("connection was not closed");
        }
    }

    fn handshake(client: &mut TestClient, service: &mut RendererService, token: Option<&str>) {
        client.send(&ControlMessage::Handshake {
            client: "test-host".into(),
            token: token.map(str::to_owned),
        });
        assert_eq!(
            client.recv(service),
            ControlMessage::HandshakeAck { status: AckStatus::Ok }
        );
    }

    #[test]
    fn handshake_and_ping() {
        let mut service = RendererService::bind(test_config(None), pattern_factory()).unwrap();
        let mut client = TestClient::connect(service.local_port());

        handshake(&mut client, &mut service, None);
        client.send(&ControlMessage::Ping { token: None });
        assert_eq!(client.recv(&mut service), ControlMessage::Pong);
    }

    #[test]
    fn session_lifecycle_acks() {
        let mut service = RendererService::bind(test_config(None), pattern_factory()).unwrap();
        let mut client = TestClient::connect(service.local_port());
        handshake(&mut client, &mut service, None);

        client.send(&ControlMessage::InitBrowser {
            id: "s1".into(),
            url: Some("https://example.com".into()),
            width: Some(4),
            height: Some(4),
            fps: Some(30),
            token: None,
        });
        assert_eq!(
            client.recv(&mut service),
            ControlMessage::BrowserReady {
                id: "s1".into(),
                status: AckStatus::Ok
            }
        );
        assert_eq!(service.session_count(), 1);

        client.send(&ControlMessage::UpdateBrowser {
            id: "s1".into(),
            url: None,
            width: Some(2),
            height: Some(2),
            token: None,
        });
        assert_eq!(
            client.recv(&mut service),
            ControlMessage::BrowserUpdated {
                id: "s1".into(),
                status: AckStatus::Ok
            }
        );

        client.send(&ControlMessage::DisposeBrowser {
            id: "s1".into(),
            token: None,
        });
        assert_eq!(
            client.recv(&mut service),
            ControlMessage::BrowserDisposed {
                id: "s1".into(),
                status: AckStatus::Ok
            }
        );
        assert_eq!(service.session_count(), 0);

        // Disposing again is a well-defined unknown_id, not a crash.
        client.send(&ControlMessage::DisposeBrowser {
            id: "s1".into(),
            token: None,
        });
        assert_eq!(
            client.recv(&mut service),
            ControlMessage::Error {
                message: ErrorReason::UnknownId
            }
        );
    }

    #[test]
    fn unknown_id_update_is_rejected() {
        let mut service = RendererService::bind(test_config(None), pattern_factory()).unwrap();
        let mut client = TestClient::connect(service.local_port());
        handshake(&mut client, &mut service, None);

        client.send(&ControlMessage::UpdateBrowser {
            id: "ghost".into(),
            url: None,
            width: None,
            height: None,
            token: None,
        });
        assert_eq!(
            client.recv(&mut service),
            ControlMessage::Error {
                message: ErrorReason::UnknownId
            }
        );
    }

    #[test]
    fn missing_id_is_answered_not_fatal() {
        let mut service = RendererService::bind(test_config(None), pattern_factory()).unwrap();
        let mut client = TestClient::connect(service.local_port());
        handshake(&mut client, &mut service, None);

        client.send_raw(r#"{"type":"disposeBrowser"}"#);
        assert_eq!(
            client.recv(&mut service),
            ControlMessage::Error {
                message: ErrorReason::MissingId
            }
        );

        // The connection survives and keeps working.
        client.send(&ControlMessage::Ping { token: None });
        assert_eq!(client.recv(&mut service), ControlMessage::Pong);
    }

    #[test]
    fn unknown_types_are_ignored() {
        let mut service = RendererService::bind(test_config(None), pattern_factory()).unwrap();
        let mut client = TestClient::connect(service.local_port());
        handshake(&mut client, &mut service, None);

        client.send_raw(r#"{"type":"helper_ready"}"#);
        client.send(&ControlMessage::Ping { token: None });
        assert_eq!(client.recv(&mut service), ControlMessage::Pong);
    }

    #[test]
    fn wrong_token_closes_connection_for_any_message() {
        let mut service =
            RendererService::bind(test_config(Some("secret")), pattern_factory()).unwrap();

        // Wrong token on a session command.
        let mut client = TestClient::connect(service.local_port());
        client.send(&ControlMessage::DisposeBrowser {
            id: "s1".into(),
            token: Some("wrong".into()),
        });
        client.expect_closed(&mut service);

        // Missing token on a ping.
        let mut client = TestClient::connect(service.local_port());
        client.send(&ControlMessage::Ping { token: None });
        client.expect_closed(&mut service);

        // Correct token is accepted.
        let mut client = TestClient::connect(service.local_port());
        client.send(&ControlMessage::Ping {
            token: Some("secret".into()),
        });
        assert_eq!(client.recv(&mut service), ControlMessage::Pong);
    }

    #[test]
    fn connection_limit_is_enforced() {
        let mut service = RendererService::bind(test_config(None), pattern_factory()).unwrap();
        let mut a = TestClient::connect(service.local_port());
        let mut b = TestClient::connect(service.local_port());
        handshake(&mut a, &mut service, None);
        handshake(&mut b, &mut service, None);

        let mut c = TestClient::connect(service.local_port());
        // The refused connection gets the error and is closed.
        for _ in 0..50 {
            service.poll_once().unwrap();
        }
        let mut line = String::new();
        c.reader
            .get_mut()
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        c.reader.read_line(&mut line).unwrap();
        assert_eq!(
            decode_line(line.trim_end()).unwrap(),
            ControlMessage::Error {
                message: ErrorReason::TooManyConnections
            }
        );
    }

    #[test]
    fn sessions_die_with_their_connection() {
        let mut service = RendererService::bind(test_config(None), pattern_factory()).unwrap();
        let mut client = TestClient::connect(service.local_port());
        handshake(&mut client, &mut service, None);

        client.send(&ControlMessage::InitBrowser {
            id: "owned".into(),
            url: None,
            width: Some(2),
            height: Some(2),
            fps: Some(30),
            token: None,
        });
        assert!(matches!(
            client.recv(&mut service),
            ControlMessage::BrowserReady { .. }
        ));
        assert_eq!(service.session_count(), 1);

        drop(client);
        for _ in 0..100 {
            service.poll_once().unwrap();
            if service.session_count() == 0 {
                return;
            }
        }
        panic!("session outlived its connection");
    }
}
