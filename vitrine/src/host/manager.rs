//! The session manager: single entry point for "ensure a session exists /
//! update it / remove it" and the router for inbound fallback frames.
//!
//! Owns the renderer's lifecycle end to end. `ensure_ready` attaches to an
//! already-listening renderer first (avoiding duplicate processes), else
//! resolves and launches the binary and reconnects with bounded backoff
//! before performing the authenticated handshake.
//!
//! One dedicated link thread — never the render thread — runs the control
//! read loop and doubles as the health loop: it pings on an interval, and
//! on a broken link or missed pong it relaunches the renderer, reconnects,
//! and re-establishes every registered session without caller involvement.
//! During an outage consumers simply see no new frames; the last presented
//! frame stays up.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;

use crate::config::BridgeConfig;
use crate::host::sink::FrameSink;
use crate::host::supervisor::{resolve_renderer_path, RendererSupervisor, SpawnError};
use crate::net::{connect_with_timeout, write_line_all, FillOutcome, LineBuffer, LineError};
use crate::protocol::{decode_line, encode_line, pixels, AckStatus, ControlMessage, ProtocolError};
use crate::trace::{debug, info, warn};

const CLIENT_NAME: &str = "vitrine-host";
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(100);
const RECONNECT_BACKOFF_START: Duration = Duration::from_millis(150);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(2);
/// Inbound fallback frames are logged once per this many frames.
const FRAME_LOG_EVERY: u64 = 300;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("renderer binary could not be located")]
    RendererNotFound,
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("timed out waiting for handshake_ack")]
    HandshakeTimeout,
    #[error("renderer rejected the handshake")]
    HandshakeRejected,
    #[error("control channel failed: {0}")]
    Channel(#[from] LineError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Host-side view of a session's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Create sent, acknowledgement pending. Callers proceed
    /// optimistically; frames will arrive once the renderer is painting.
    Requested,
    Ready,
    /// Gone in the renderer (acknowledged dispose, or the link dropped).
    Disposed,
}

#[derive(Debug, Clone)]
struct SessionSpec {
    url: String,
    width: u32,
    height: u32,
    fps: u32,
    state: SessionState,
}

/// Mutex access that shrugs off poisoning — registry state stays usable
/// even if some thread panicked while holding a lock.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The write half of the control connection. Writes go out whole lines
/// under the gate so concurrent senders never interleave bytes.
struct Link {
    stream: Arc<TcpStream>,
    write_gate: Mutex<()>,
}

impl Link {
    fn send(&self, msg: &ControlMessage, budget: Duration) -> Result<(), LinkError> {
        let line = encode_line(msg)?;
        let _gate = lock(&self.write_gate);
        write_line_all(&mut (&*self.stream), line.as_bytes(), budget)?;
        Ok(())
    }
}

/// An established, authenticated connection plus its read-side state.
struct LinkConn {
    link: Arc<Link>,
    buffer: LineBuffer,
    /// Lines that arrived bundled with the handshake ack.
    pending: Vec<String>,
}

struct Shared {
    config: BridgeConfig,
    token: String,
    sessions: Mutex<HashMap<String, SessionSpec>>,
    sinks: Mutex<HashMap<String, Arc<Mutex<FrameSink>>>>,
    supervisor: Mutex<RendererSupervisor>,
    link: Mutex<Option<Arc<Link>>>,
    ready: AtomicBool,
    shutdown: AtomicBool,
}

/// The host's session manager. One instance per host process; all other
/// subsystems go through it.
pub struct SessionManager {
    shared: Arc<Shared>,
    link_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        let token = config.effective_token();
        Self {
            shared: Arc::new(Shared {
                config,
                token,
                sessions: Mutex::new(HashMap::new()),
                sinks: Mutex::new(HashMap::new()),
                supervisor: Mutex::new(RendererSupervisor::new()),
                link: Mutex::new(None),
                ready: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
            link_thread: Mutex::new(None),
        }
    }

    /// Whether the control link is currently up.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Idempotent bring-up: attach to a running renderer or launch one,
    /// then handshake and start the link thread.
    ///
    /// Returns `false` — after logging — when the renderer binary cannot
    /// be located or never accepts a connection in time. The host keeps
    /// running; browser sessions are simply unavailable.
    pub fn ensure_ready(&self) -> bool {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return false;
        }
        if self.is_ready() {
            return true;
        }

        let mut thread = lock(&self.link_thread);
        if self.is_ready() {
            return true;
        }
        if thread.is_some() {
            // The link thread exists and is recovering on its own
            // schedule; report current readiness rather than racing it.
            return self.is_ready();
        }

        match bring_up(&self.shared) {
            Ok(conn) => {
                let shared = Arc::clone(&self.shared);
                let spawned = std::thread::Builder::new()
                    .name("vitrine-link".into())
                    .spawn(move || run_link(&shared, conn));
                match spawned {
                    Ok(handle) => {
                        *thread = Some(handle);
                        true
                    }
                    Err(error) => {
                        warn!(error = %error, "could not start the link thread");
                        false
                    }
                }
            }
            Err(error) => {
                warn!(error = %error, "renderer bring-up failed; browser sessions unavailable");
                false
            }
        }
    }

    /// Requests a session. Does not wait for the acknowledgement — the
    /// registry entry moves to [`SessionState::Ready`] when it arrives.
    pub fn create_session(&self, id: &str, url: &str, width: u32, height: u32, fps: u32) -> bool {
        if !self.ensure_ready() {
            return false;
        }

        lock(&self.shared.sessions).insert(
            id.to_owned(),
            SessionSpec {
                url: url.to_owned(),
                width,
                height,
                fps,
                state: SessionState::Requested,
            },
        );

        self.send_best_effort(&ControlMessage::InitBrowser {
            id: id.to_owned(),
            url: Some(url.to_owned()),
            width: Some(width),
            height: Some(height),
            fps: Some(fps),
            token: Some(self.shared.token.clone()),
        })
    }

    /// Mutates a session in place — same identity, so no flicker and no
    /// duplicate-id race. A dimension change resets the routed sink so it
    /// re-attaches to the replacement segment.
    pub fn update_session(
        &self,
        id: &str,
        url: Option<&str>,
        width: Option<u32>,
        height: Option<u32>,
    ) -> bool {
        let mut resized = false;
        {
            let mut sessions = lock(&self.shared.sessions);
            let Some(spec) = sessions.get_mut(id) else {
                warn!(session = %id, "update for unregistered session");
                return false;
            };
            if let Some(url) = url {
                spec.url = url.to_owned();
            }
            if let Some(width) = width {
                resized |= spec.width != width;
                spec.width = width;
            }
            if let Some(height) = height {
                resized |= spec.height != height;
                spec.height = height;
            }
        }

        if resized {
            if let Some(sink) = lock(&self.shared.sinks).get(id).cloned() {
                lock(&sink).reset();
            }
        }

        self.send_best_effort(&ControlMessage::UpdateBrowser {
            id: id.to_owned(),
            url: url.map(str::to_owned),
            width,
            height,
            token: Some(self.shared.token.clone()),
        })
    }

    /// Removes the session and its frame routing locally regardless of
    /// whether the renderer acknowledges; the dispose message itself is
    /// best-effort (the renderer also self-cleans when the connection
    /// drops).
    pub fn dispose_session(&self, id: &str) {
        lock(&self.shared.sessions).remove(id);
        lock(&self.shared.sinks).remove(id);
        self.send_best_effort(&ControlMessage::DisposeBrowser {
            id: id.to_owned(),
            token: Some(self.shared.token.clone()),
        });
    }

    /// Routes future frames for `id` — inline fallback frames included —
    /// to this sink.
    pub fn register_sink(&self, id: &str, sink: Arc<Mutex<FrameSink>>) {
        lock(&self.shared.sinks).insert(id.to_owned(), sink);
    }

    pub fn unregister_sink(&self, id: &str) {
        lock(&self.shared.sinks).remove(id);
    }

    #[must_use]
    pub fn session_state(&self, id: &str) -> Option<SessionState> {
        lock(&self.shared.sessions).get(id).map(|s| s.state)
    }

    /// Tears the bridge down: best-effort disposes, stops the link
    /// thread, and terminates the renderer gracefully.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("session manager shutting down");

        if let Some(link) = lock(&self.shared.link).clone() {
            let ids: Vec<String> = lock(&self.shared.sessions).keys().cloned().collect();
            for id in ids {
                let _ = link.send(
                    &ControlMessage::DisposeBrowser {
                        id,
                        token: Some(self.shared.token.clone()),
                    },
                    self.shared.config.write_budget,
                );
            }
        }

        if let Some(handle) = lock(&self.link_thread).take() {
            let _ = handle.join();
        }
        lock(&self.shared.supervisor).terminate();
        lock(&self.shared.sessions).clear();
        lock(&self.shared.sinks).clear();
    }

    fn send_best_effort(&self, msg: &ControlMessage) -> bool {
        let Some(link) = lock(&self.shared.link).clone() else {
            warn!(ty = msg.wire_type(), "no control link, command not sent");
            return false;
        };
        match link.send(msg, self.shared.config.write_budget) {
            Ok(()) => true,
            Err(error) => {
                warn!(ty = msg.wire_type(), error = %error, "control send failed");
                false
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Attach-or-launch: the connection order avoids duplicate renderer
/// processes when something else already started one.
fn bring_up(shared: &Shared) -> Result<LinkConn, LinkError> {
    let config = &shared.config;

    debug!(port = config.port, "trying to attach to an existing renderer");
    if let Ok(conn) = connect_and_handshake(shared, config.attach_timeout) {
        info!(port = config.port, "attached to existing renderer");
        return Ok(conn);
    }

    let path = resolve_renderer_path(config.renderer_path.as_deref())
        .ok_or(LinkError::RendererNotFound)?;
    info!(path = %path.display(), "launching renderer");
    lock(&shared.supervisor).launch(&path, config.port, &shared.token)?;

    // The renderer needs a moment to start listening; retry with growing
    // backoff inside the connect budget.
    let deadline = Instant::now() + config.launch_connect_timeout;
    let mut backoff = RECONNECT_BACKOFF_START;
    loop {
        match connect_and_handshake(shared, Duration::from_millis(300)) {
            Ok(conn) => {
                info!(port = config.port, "connected to launched renderer");
                return Ok(conn);
            }
            Err(error) => {
                if Instant::now() + backoff >= deadline {
                    warn!(error = %error, "renderer never accepted a connection");
                    return Err(error);
                }
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
            }
        }
    }
}

/// Connects, sends the handshake, and waits (bounded) for its ack.
fn connect_and_handshake(shared: &Shared, connect_timeout: Duration) -> Result<LinkConn, LinkError> {
    let config = &shared.config;
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let stream = connect_with_timeout(addr, connect_timeout)?;
    let link = Arc::new(Link {
        stream: Arc::new(stream),
        write_gate: Mutex::new(()),
    });

    link.send(
        &ControlMessage::Handshake {
            client: CLIENT_NAME.to_owned(),
            token: Some(shared.token.clone()),
        },
        config.write_budget,
    )?;

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(4);
    let fd = link.stream.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&fd), Token(0), Interest::READABLE)?;

    let mut buffer = LineBuffer::new();
    let mut pending = Vec::new();
    let deadline = Instant::now() + config.handshake_timeout;
    while Instant::now() < deadline {
        match poll.poll(&mut events, Some(Duration::from_millis(50))) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
        match buffer.fill_from(&mut (&*link.stream), &mut pending)? {
            FillOutcome::Open => {}
            FillOutcome::Closed => return Err(LinkError::HandshakeRejected),
        }

        let mut index = 0;
        while index < pending.len() {
            match decode_line(&pending[index]) {
                Ok(ControlMessage::HandshakeAck { status }) => {
                    pending.remove(index);
                    return if status == AckStatus::Ok {
                        Ok(LinkConn {
                            link,
                            buffer,
                            pending,
                        })
                    } else {
                        Err(LinkError::HandshakeRejected)
                    };
                }
                Ok(ControlMessage::Error { message }) => {
                    warn!(reason = ?message, "handshake answered with error");
                    return Err(LinkError::HandshakeRejected);
                }
                _ => index += 1,
            }
        }
    }
    Err(LinkError::HandshakeTimeout)
}

/// Read-loop statistics shared between dispatch and health checks.
struct LinkStats {
    last_ping: Instant,
    last_pong: Instant,
    pings_sent: u64,
    frames_routed: u64,
}

/// The link thread body: read/health loop, and on link loss the
/// relaunch-reconnect-reestablish cycle. Exits only on shutdown.
fn run_link(shared: &Arc<Shared>, mut conn: LinkConn) {
    loop {
        *lock(&shared.link) = Some(Arc::clone(&conn.link));
        shared.ready.store(true, Ordering::Release);

        read_until_broken(shared, &mut conn);

        shared.ready.store(false, Ordering::Release);
        *lock(&shared.link) = None;
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        warn!("control link lost, entering recovery");
        // Everything the renderer held is gone with it.
        for spec in lock(&shared.sessions).values_mut() {
            spec.state = SessionState::Disposed;
        }
        for sink in lock(&shared.sinks).values() {
            lock(sink).reset();
        }

        match recover(shared) {
            Some(new_conn) => conn = new_conn,
            None => return, // shutdown during recovery
        }
    }
}

/// Runs the read loop until the connection dies or shutdown is requested.
fn read_until_broken(shared: &Arc<Shared>, conn: &mut LinkConn) {
    let mut stats = LinkStats {
        last_ping: Instant::now(),
        last_pong: Instant::now(),
        pings_sent: 0,
        frames_routed: 0,
    };

    // Lines that arrived with the handshake ack are handled first.
    for line in std::mem::take(&mut conn.pending) {
        dispatch(shared, &line, &mut stats);
    }

    let Ok(mut poll) = Poll::new() else {
        return;
    };
    let mut events = Events::with_capacity(16);
    let fd = conn.link.stream.as_raw_fd();
    if poll
        .registry()
        .register(&mut SourceFd(&fd), Token(0), Interest::READABLE)
        .is_err()
    {
        return;
    }

    let mut lines = Vec::new();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        match poll.poll(&mut events, Some(READ_POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                warn!(error = %error, "control poll failed");
                return;
            }
        }

        lines.clear();
        match conn.buffer.fill_from(&mut (&*conn.link.stream), &mut lines) {
            Ok(FillOutcome::Open) => {}
            Ok(FillOutcome::Closed) => {
                for line in &lines {
                    dispatch(shared, line, &mut stats);
                }
                warn!("renderer closed the control connection");
                return;
            }
            Err(error) => {
                warn!(error = %error, "control read failed");
                return;
            }
        }
        for line in &lines {
            dispatch(shared, line, &mut stats);
        }

        // Health: one ping per interval; a pong must land before the next
        // ping is due, otherwise the renderer is unresponsive.
        if stats.last_ping.elapsed() >= shared.config.health_interval {
            if stats.pings_sent > 0 && stats.last_pong < stats.last_ping {
                warn!("renderer missed its pong deadline");
                return;
            }
            if conn
                .link
                .send(
                    &ControlMessage::Ping {
                        token: Some(shared.token.clone()),
                    },
                    shared.config.write_budget,
                )
                .is_err()
            {
                return;
            }
            stats.last_ping = Instant::now();
            stats.pings_sent += 1;
        }
    }
}

/// Relaunch/reconnect loop. Returns `None` only on shutdown.
fn recover(shared: &Arc<Shared>) -> Option<LinkConn> {
    let config = &shared.config;
    let mut backoff = RECONNECT_BACKOFF_START;
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return None;
        }

        {
            let mut supervisor = lock(&shared.supervisor);
            if !supervisor.is_alive() {
                match resolve_renderer_path(config.renderer_path.as_deref()) {
                    Some(path) => {
                        info!(path = %path.display(), "relaunching renderer");
                        if let Err(error) = supervisor.launch(&path, config.port, &shared.token) {
                            warn!(error = %error, "relaunch failed");
                        }
                    }
                    None => warn!("renderer binary could not be located for relaunch"),
                }
            }
        }

        match connect_and_handshake(shared, Duration::from_millis(500)) {
            Ok(conn) => {
                info!("control link re-established");
                reestablish_sessions(shared, &conn);
                return Some(conn);
            }
            Err(error) => {
                debug!(error = %error, "reconnect attempt failed");
            }
        }

        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
    }
}

/// The new renderer process starts empty: proactively recreate every
/// registered session rather than assuming any still exist.
fn reestablish_sessions(shared: &Arc<Shared>, conn: &LinkConn) {
    let specs: Vec<(String, SessionSpec)> = {
        let mut sessions = lock(&shared.sessions);
        sessions
            .iter_mut()
            .map(|(id, spec)| {
                spec.state = SessionState::Requested;
                (id.clone(), spec.clone())
            })
            .collect()
    };

    for (id, spec) in specs {
        info!(session = %id, "re-establishing session");
        let _ = conn.link.send(
            &ControlMessage::InitBrowser {
                id,
                url: Some(spec.url),
                width: Some(spec.width),
                height: Some(spec.height),
                fps: Some(spec.fps),
                token: Some(shared.token.clone()),
            },
            shared.config.write_budget,
        );
    }
}

/// Handles one inbound control line on the link thread.
fn dispatch(shared: &Arc<Shared>, line: &str, stats: &mut LinkStats) {
    let msg = match decode_line(line) {
        Ok(msg) => msg,
        Err(ProtocolError::UnknownType(ty)) => {
            debug!(ty = %ty, "ignoring unknown message type");
            return;
        }
        Err(error) => {
            warn!(error = %error, "dropping undecodable control line");
            return;
        }
    };

    match msg {
        ControlMessage::FrameReady {
            id,
            width,
            height,
            data,
        } => {
            let pixels = match pixels::decode(&data, width, height) {
                Ok(pixels) => pixels,
                Err(error) => {
                    warn!(session = %id, error = %error, "discarding corrupt inline frame");
                    return;
                }
            };
            let Some(sink) = lock(&shared.sinks).get(&id).cloned() else {
                warn!(session = %id, "frame for unknown session dropped");
                return;
            };
            stats.frames_routed += 1;
            if stats.frames_routed % FRAME_LOG_EVERY == 1 {
                debug!(session = %id, total = stats.frames_routed, "routing inline frames");
            }
            lock(&sink).handle_inline(width, height, &pixels);
        }
        ControlMessage::BrowserReady { id, status } => {
            debug!(session = %id, status = ?status, "session acknowledged");
            if status == AckStatus::Ok {
                if let Some(spec) = lock(&shared.sessions).get_mut(&id) {
                    spec.state = SessionState::Ready;
                }
            }
        }
        ControlMessage::BrowserUpdated { id, status } => {
            debug!(session = %id, status = ?status, "update acknowledged");
        }
        ControlMessage::BrowserDisposed { id, .. } => {
            // Host-initiated disposes already removed the entry; an entry
            // still present means the renderer disposed on its own.
            if let Some(spec) = lock(&shared.sessions).get_mut(&id) {
                spec.state = SessionState::Disposed;
            }
        }
        ControlMessage::Pong => {
            stats.last_pong = Instant::now();
        }
        ControlMessage::HandshakeAck { .. } => {
            debug!("late handshake_ack ignored");
        }
        ControlMessage::Error { message } => {
            warn!(reason = ?message, "renderer reported an error");
        }
        other => {
            debug!(ty = other.wire_type(), "ignoring message not addressed to the host");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;

    fn unreachable_config() -> BridgeConfig {
        BridgeConfig {
            // Port 1 on loopback: connection refused immediately.
            port: 1,
            token: Some("secret".into()),
            renderer_path: Some("/nonexistent/vitrine-renderer".into()),
            attach_timeout: Duration::from_millis(100),
            launch_connect_timeout: Duration::from_millis(200),
            handshake_timeout: Duration::from_millis(200),
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn ensure_ready_fails_cleanly_without_renderer() {
        let manager = SessionManager::new(unreachable_config());
        assert!(!manager.ensure_ready());
        assert!(!manager.is_ready());
        // Failure is a boolean, not a panic, and is repeatable.
        assert!(!manager.ensure_ready());
    }

    #[test]
    fn commands_without_link_return_false() {
        let manager = SessionManager::new(unreachable_config());
        assert!(!manager.create_session("s1", "https://example.com", 1280, 720, 30));
        assert!(!manager.update_session("s1", None, None, None));
        // Dispose is best-effort and must not crash.
        manager.dispose_session("s1");
        assert_eq!(manager.session_state("s1"), None);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let manager = SessionManager::new(unreachable_config());
        manager.shutdown();
        manager.shutdown();
    }
}
