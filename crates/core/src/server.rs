//! Server orchestration: configuration, the poll loop, and the
//! per-connection protocol driver.

use std::io::{BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Result, Status};
use crate::media::DescriptionCache;
use crate::protocol::handler::{MethodHandler, RequestContext};
use crate::protocol::request::{self, RequestOutcome};
use crate::protocol::response::Response;
use crate::protocol::rollback::RollbackReader;
use crate::reactor::{Reactor, Source, Token};
use crate::session::SessionTable;

/// Server-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for the control listener.
    pub bind_addr: String,
    /// Directory media paths resolve against.
    pub media_root: PathBuf,
    /// Transcoder executable.
    pub ffmpeg: String,
    /// Probe executable.
    pub ffprobe: String,
    /// Sleep between idle selector scans.
    pub poll_interval: Duration,
    /// Bound on blocking socket I/O within one dispatched unit of work.
    pub io_timeout: Duration,
    /// Advertised and enforced session idle timeout.
    pub session_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8554".to_string(),
            media_root: PathBuf::from("."),
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            poll_interval: Duration::from_millis(10),
            io_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(86400),
        }
    }
}

/// Interval between session-expiry sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The RTSP server: one listener, one selector, one thread.
///
/// Everything — accepts, request handling, interleaved relaying, probe and
/// transcode invocations — runs cooperatively on the thread that calls
/// [`run`](Self::run). One dispatched unit of work runs to completion before
/// the selector is consulted again, which is the only synchronization the
/// session table's callers rely on beyond its own locks.
pub struct Server {
    config: Arc<ServerConfig>,
    sessions: SessionTable,
    cache: DescriptionCache,
    reactor: Reactor,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    last_sweep: Instant,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config: Arc::new(config),
            sessions: SessionTable::new(),
            cache: DescriptionCache::new(),
            reactor: Reactor::new(),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            last_sweep: Instant::now(),
        }
    }

    /// Bind the control listener and register it with the selector.
    /// Returns the bound address (useful when binding port 0).
    pub fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        self.reactor.register(Source::Listener(listener));
        self.local_addr = Some(addr);
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(%addr, "RTSP server listening");
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Flag handle; storing `false` makes [`run`](Self::run) return after
    /// the current scan.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn session_table(&self) -> &SessionTable {
        &self.sessions
    }

    /// Drive the selector until shut down.
    pub fn run(&mut self) -> Result<()> {
        while self.running.load(Ordering::SeqCst) {
            let worked = self.poll_once();
            self.sweep_expired();
            if !worked {
                std::thread::sleep(self.config.poll_interval);
            }
        }
        tracing::debug!("run loop exited");
        Ok(())
    }

    /// One scan over every registered source, dispatching the ready ones.
    /// Returns whether any work was done.
    fn poll_once(&mut self) -> bool {
        let mut worked = false;
        for token in self.reactor.tokens() {
            // A source may have been deregistered by an earlier dispatch in
            // this same scan.
            let Some(source) = self.reactor.take(token) else {
                continue;
            };
            match source {
                Source::Listener(listener) => {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            worked = true;
                            self.accept_connection(stream, peer);
                        }
                        Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(error) => tracing::warn!(error = %error, "accept error"),
                    }
                    self.reactor.restore(token, Source::Listener(listener));
                }
                Source::Connection(mut connection) => {
                    if connection.ready() {
                        worked = true;
                        match connection.service(&mut self.reactor) {
                            ConnFlow::Keep => {
                                self.reactor.restore(token, Source::Connection(connection));
                            }
                            ConnFlow::Close => self.close_connection(token, connection),
                        }
                    } else {
                        self.reactor.restore(token, Source::Connection(connection));
                    }
                }
                Source::Relay(mut relay) => match relay.forward_one() {
                    Ok(forwarded) => {
                        worked |= forwarded;
                        self.reactor.restore(token, Source::Relay(relay));
                    }
                    Err(error) => {
                        tracing::debug!(error = %error, "relay dropped");
                        self.reactor.discard_relay(token, relay.owner);
                    }
                },
            }
        }
        worked
    }

    fn accept_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let setup = Connection::accept(
            stream,
            peer,
            &mut self.reactor,
            self.sessions.clone(),
            self.cache.clone(),
            self.config.clone(),
        );
        if let Err(error) = setup {
            tracing::warn!(%peer, error = %error, "connection setup failed");
        }
    }

    /// Tear down a finished connection: its relay sockets are closed before
    /// the connection leaves the selector, and sessions that deliver only
    /// through this connection's interleaved channels die with it.
    fn close_connection(&mut self, token: Token, connection: Box<Connection>) {
        self.reactor.deregister_relays_owned_by(token);
        for session in self.sessions.take_owned_by(token) {
            session.lock().stop(&mut self.reactor);
        }
        tracing::info!(peer = %connection.peer, "client disconnected");
    }

    fn sweep_expired(&mut self) {
        if self.last_sweep.elapsed() < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = Instant::now();
        for (key, session) in self.sessions.take_expired(self.config.session_timeout) {
            tracing::info!(session = %crate::session::format_key(key), "session expired");
            session.lock().stop(&mut self.reactor);
        }
    }
}

pub(crate) enum ConnFlow {
    Keep,
    Close,
}

/// One RTSP control connection.
///
/// `stream` is the write/probe handle; `reader` wraps a buffered clone of
/// the same socket behind the rollback layer that classifies interleaved
/// frames against textual requests.
pub(crate) struct Connection {
    pub(crate) peer: SocketAddr,
    stream: TcpStream,
    reader: RollbackReader<BufReader<TcpStream>>,
    handler: MethodHandler,
    response_started: bool,
}

impl Connection {
    pub(crate) fn accept(
        stream: TcpStream,
        peer: SocketAddr,
        reactor: &mut Reactor,
        sessions: SessionTable,
        cache: DescriptionCache,
        config: Arc<ServerConfig>,
    ) -> std::io::Result<()> {
        stream.set_read_timeout(Some(config.io_timeout))?;
        stream.set_write_timeout(Some(config.io_timeout))?;
        let read_half = stream.try_clone()?;

        let token = reactor.reserve();
        let handler = MethodHandler::new(
            sessions,
            cache,
            config,
            peer,
            token,
            stream.try_clone()?,
        );
        let connection = Connection {
            peer,
            reader: RollbackReader::new(BufReader::new(read_half)),
            stream,
            handler,
            response_started: false,
        };
        connection.stream.set_nonblocking(true)?;
        reactor.fill(token, Source::Connection(Box::new(connection)));
        tracing::info!(%peer, "client connected");
        Ok(())
    }

    /// Ready when bytes are already buffered or the socket has data (or an
    /// orderly EOF) pending.
    pub(crate) fn ready(&self) -> bool {
        if self.has_pending() {
            return true;
        }
        let mut probe = [0u8; 1];
        match self.stream.peek(&mut probe) {
            Ok(_) => true,
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => false,
            // Surface the failure inside service().
            Err(_) => true,
        }
    }

    fn has_pending(&self) -> bool {
        self.reader.has_buffered() || !self.reader.get_ref().buffer().is_empty()
    }

    /// Process protocol units until no input remains buffered, then hand
    /// the socket back to the selector.
    pub(crate) fn service(&mut self, reactor: &mut Reactor) -> ConnFlow {
        if self.stream.set_nonblocking(false).is_err() {
            return ConnFlow::Close;
        }
        let mut flow = ConnFlow::Keep;
        loop {
            match self.handle_one_unit(reactor) {
                Ok(ConnFlow::Keep) => {}
                Ok(ConnFlow::Close) => {
                    flow = ConnFlow::Close;
                    break;
                }
                Err(error) => {
                    tracing::debug!(peer = %self.peer, error = %error, "connection failed");
                    if !self.response_started {
                        let mut response = Response::new(Status::InternalServerError);
                        response.push_header("Connection", "close");
                        let _ = self.send(response, &[]);
                    }
                    flow = ConnFlow::Close;
                    break;
                }
            }
            if !self.has_pending() {
                break;
            }
        }
        if matches!(flow, ConnFlow::Keep) && self.stream.set_nonblocking(true).is_err() {
            flow = ConnFlow::Close;
        }
        flow
    }

    /// One unit of protocol work: an interleaved frame drain or a full
    /// request/response cycle, classified by the first byte.
    fn handle_one_unit(&mut self, reactor: &mut Reactor) -> std::io::Result<ConnFlow> {
        self.reader.start_capture();
        let mut marker = [0u8; 1];
        if self.reader.read(&mut marker)? == 0 {
            return Ok(ConnFlow::Close);
        }
        if marker[0] == b'$' {
            self.reader.drop_capture();
            self.drain_interleaved_frame()?;
            return Ok(ConnFlow::Keep);
        }
        self.reader.roll_back();

        match request::read_request(&mut self.reader)? {
            RequestOutcome::Eof => Ok(ConnFlow::Close),
            RequestOutcome::Empty => Ok(ConnFlow::Keep),
            RequestOutcome::Invalid(error) => {
                tracing::warn!(peer = %self.peer, reason = %error.reason(), "framing error");
                let mut response = Response::from_error(&error);
                response.push_header("Connection", "close");
                self.send(response, &[])?;
                Ok(ConnFlow::Close)
            }
            RequestOutcome::Request(request) => {
                tracing::debug!(
                    peer = %self.peer,
                    method = %request.method,
                    target = %request.target,
                    "request"
                );
                let mut ctx = RequestContext::new(&request);
                let response = self.handler.dispatch(&request, &mut ctx, reactor);
                tracing::debug!(peer = %self.peer, status = response.status.code(), "response");
                let cseqs: Vec<String> =
                    request.header_all("CSeq").map(str::to_string).collect();
                self.send(response, &cseqs)?;
                Ok(ConnFlow::Keep)
            }
        }
    }

    /// Inbound interleaved data is read and discarded: the transcoder offers
    /// no way to feed it client RTCP, so there is nowhere to forward it.
    fn drain_interleaved_frame(&mut self) -> std::io::Result<()> {
        let mut header = [0u8; 3];
        self.reader.read_exact(&mut header)?;
        let mut remaining = u16::from_be_bytes([header[1], header[2]]) as usize;
        let mut scratch = [0u8; 2048];
        while remaining > 0 {
            let take = remaining.min(scratch.len());
            let n = self.reader.read(&mut scratch[..take])?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            remaining -= n;
        }
        Ok(())
    }

    /// Write a response, echoing every request `CSeq`.
    ///
    /// `response_started` is raised before the first byte reaches the socket
    /// and cleared only after the full response went out, so failure paths
    /// can tell whether a partial response is on the wire — headers cannot
    /// be retracted once transmitted, so in that case the connection is
    /// simply closed.
    fn send(&mut self, mut response: Response, cseqs: &[String]) -> std::io::Result<()> {
        for cseq in cseqs {
            response.push_header("CSeq", cseq);
        }
        let bytes = response.serialize();
        self.response_started = true;
        self.stream.write_all(&bytes)?;
        self.stream.flush()?;
        self.response_started = false;
        Ok(())
    }
}
