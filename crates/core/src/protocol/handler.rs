//! RTSP method dispatch and the verb state machine (RFC 2326 §10).
//!
//! Each control connection gets a [`MethodHandler`]. Per request, a
//! [`RequestContext`] tracks what has been resolved so far — path, media
//! description, session — with every field starting unresolved and filled in
//! the order the verb needs. Verb handlers return `Result<Response,
//! ErrorResponse>`; the dispatcher renders errors, attaching the contextual
//! `Allow` header where the status calls for one.

use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ErrorResponse, Status};
use crate::media::{self, DescriptionCache, MediaDescription};
use crate::protocol::request::{self, Request};
use crate::protocol::response::Response;
use crate::reactor::{Reactor, Token};
use crate::server::ServerConfig;
use crate::session::transport::{InterleavedTransport, Transport, TransportChoice, UdpTransport};
use crate::session::{self, Session, SessionKey, SessionTable};

/// The closed set of supported methods; anything else falls through to the
/// explicit default branch in [`MethodHandler::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
}

impl Method {
    /// Value of the `Public` header (RFC 2326 §12.28).
    pub const PUBLIC: &'static str = "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN";

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "OPTIONS" => Some(Method::Options),
            "DESCRIBE" => Some(Method::Describe),
            "SETUP" => Some(Method::Setup),
            "PLAY" => Some(Method::Play),
            "PAUSE" => Some(Method::Pause),
            "TEARDOWN" => Some(Method::Teardown),
            _ => None,
        }
    }
}

/// Per-request resolution state.
///
/// `media` doubles as "path parsed", `streams` as "media parsed", and
/// `session_parsed` guards the session lookup, so helpers can be called in
/// any order without redoing work.
pub struct RequestContext {
    plainpath: Option<String>,
    media: Option<Vec<String>>,
    /// Stream index from the final path segment; `None` = aggregate.
    stream: Option<usize>,
    ospath: Option<PathBuf>,
    streams: Option<usize>,
    description: Option<Arc<MediaDescription>>,
    session_parsed: bool,
    invalid_session: bool,
    session_key: Option<SessionKey>,
    session: Option<Arc<Mutex<Session>>>,
}

impl RequestContext {
    pub fn new(request: &Request) -> Self {
        RequestContext {
            plainpath: request.plain_path(),
            media: None,
            stream: None,
            ospath: None,
            streams: None,
            description: None,
            session_parsed: false,
            invalid_session: false,
            session_key: None,
            session: None,
        }
    }
}

/// Snapshot of the session fields the `Allow` predicates read, taken so no
/// lock is held across them.
struct SessionView {
    media: Vec<String>,
    configured: Vec<bool>,
    playing: bool,
    count: usize,
}

/// Handles RTSP requests for a single control connection.
pub struct MethodHandler {
    sessions: SessionTable,
    cache: DescriptionCache,
    config: Arc<ServerConfig>,
    client_addr: SocketAddr,
    conn_token: Token,
    conn_write: TcpStream,
}

impl MethodHandler {
    pub fn new(
        sessions: SessionTable,
        cache: DescriptionCache,
        config: Arc<ServerConfig>,
        client_addr: SocketAddr,
        conn_token: Token,
        conn_write: TcpStream,
    ) -> Self {
        MethodHandler {
            sessions,
            cache,
            config,
            client_addr,
            conn_token,
            conn_write,
        }
    }

    pub fn dispatch(
        &mut self,
        request: &Request,
        ctx: &mut RequestContext,
        reactor: &mut Reactor,
    ) -> Response {
        let result = match Method::from_token(&request.method) {
            Some(Method::Options) => self.do_options(request, ctx),
            Some(Method::Describe) => self.do_describe(request, ctx),
            Some(Method::Setup) => self.do_setup(request, ctx),
            Some(Method::Play) => self.do_play(request, ctx, reactor),
            Some(Method::Pause) => self.do_pause(request, ctx, reactor),
            Some(Method::Teardown) => self.do_teardown(request, ctx, reactor),
            // HTTP leftovers a confused client might try.
            None if request.method == "GET" || request.method == "HEAD" => {
                Err(ErrorResponse::new(Status::Forbidden))
            }
            None => {
                tracing::warn!(method = %request.method, "unsupported method");
                let message = format!("Request method {:?} not implemented", request.method);
                Ok(Response::with_reason(Status::NotImplemented, message)
                    .header("Public", Method::PUBLIC))
            }
        };

        match result {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!(
                    method = %request.method,
                    status = error.status.code(),
                    reason = %error.reason(),
                    "request refused"
                );
                let mut response = Response::from_error(&error);
                if error.status.requires_allow() {
                    self.append_allow(request, ctx, &mut response);
                }
                response
            }
        }
    }

    fn do_options(
        &mut self,
        request: &Request,
        ctx: &mut RequestContext,
    ) -> Result<Response, ErrorResponse> {
        let mut response = match self.options_inner(request, ctx) {
            Ok(response) => response,
            Err(error) => Response::from_error(&error),
        };
        response.push_header("Public", Method::PUBLIC);
        Ok(response)
    }

    fn options_inner(
        &mut self,
        request: &Request,
        ctx: &mut RequestContext,
    ) -> Result<Response, ErrorResponse> {
        if ctx.plainpath.is_some() {
            self.parse_path(request, ctx)?;
            self.parse_media(ctx)?;
        }
        let mut response = match self.parse_session(request, ctx) {
            Ok(()) => Response::ok(),
            Err(error) => Response::from_error(&error),
        };
        self.append_allow(request, ctx, &mut response);
        Ok(response)
    }

    fn do_describe(
        &mut self,
        request: &Request,
        ctx: &mut RequestContext,
    ) -> Result<Response, ErrorResponse> {
        self.parse_path(request, ctx)?;
        let description = self.parse_media(ctx)?;
        if ctx.stream.is_some() {
            return Err(ErrorResponse::new(Status::OnlyAggregateOperationAllowed));
        }
        Ok(Response::ok()
            .header("Content-Base", &request.target)
            .body("application/sdp", description.sdp.clone().into_bytes()))
    }

    fn do_setup(
        &mut self,
        request: &Request,
        ctx: &mut RequestContext,
    ) -> Result<Response, ErrorResponse> {
        self.parse_session(request, ctx)?;
        self.parse_session_path(request, ctx)?;

        if ctx.session.is_none() && ctx.plainpath.is_none() {
            return Err(ErrorResponse::with_message(
                Status::MethodNotValidInThisState,
                "No media or session specified",
            ));
        }

        let stream = match ctx.stream {
            Some(stream) => stream,
            None => {
                let streams = ctx.streams.or_else(|| {
                    ctx.session
                        .as_ref()
                        .map(|session| session.lock().stream_count())
                });
                if streams.unwrap_or(0) > 1 {
                    return Err(ErrorResponse::with_message(
                        Status::AggregateOperationNotAllowed,
                        format!("{} streams available", streams.unwrap_or(0)),
                    ));
                }
                0
            }
        };

        if let Some(session) = &ctx.session
            && session.lock().is_playing()
        {
            return Err(ErrorResponse::with_message(
                Status::MethodNotValidInThisState,
                "SETUP not supported while streaming",
            ));
        }

        let choice = crate::session::transport::negotiate(request.header_all("Transport"))?;
        let transport = match choice {
            TransportChoice::Udp { client_port } => Transport::Udp(UdpTransport {
                destination: self.client_addr.ip(),
                rtp_port: client_port,
            }),
            TransportChoice::Interleaved { channel } => {
                let sink = self.conn_write.try_clone().map_err(|error| {
                    tracing::error!(error = %error, "could not clone control stream");
                    ErrorResponse::new(Status::InternalServerError)
                })?;
                Transport::Interleaved(InterleavedTransport::new(channel, self.conn_token, sink))
            }
        };
        let negotiated = transport.header();
        let out_of_range = || {
            ErrorResponse::with_message(Status::NotFound, format!("No stream slot {}", stream))
        };

        let message = match ctx.session.clone() {
            Some(session) => {
                let mut session = session.lock();
                let slot = session.transports.get_mut(stream).ok_or_else(out_of_range)?;
                *slot = Some(transport);
                None
            }
            None => {
                let mut session = Session::new(
                    ctx.media.clone().unwrap_or_default(),
                    ctx.ospath.clone().unwrap_or_default(),
                    ctx.streams.unwrap_or(0),
                );
                let slot = session.transports.get_mut(stream).ok_or_else(out_of_range)?;
                *slot = Some(transport);
                let key = self.sessions.insert(session);
                ctx.session_key = Some(key);
                Some("Session created")
            }
        };

        let mut response = match message {
            Some(message) => Response::with_reason(Status::Ok, message),
            None => Response::ok(),
        };
        self.append_session(ctx, &mut response);
        response.push_header("Transport", &negotiated);
        Ok(response)
    }

    fn do_play(
        &mut self,
        request: &Request,
        ctx: &mut RequestContext,
        reactor: &mut Reactor,
    ) -> Result<Response, ErrorResponse> {
        self.parse_session(request, ctx)?;
        self.parse_session_path(request, ctx)?;
        let Some(session) = ctx.session.clone() else {
            let mut response = Response::with_reason(Status::SessionNotFound, "No session given");
            self.append_allow(request, ctx, &mut response);
            return Ok(response);
        };

        {
            let locked = session.lock();
            if let Some(stream) = ctx.stream
                && locked.other_transports(stream)
            {
                return Err(ErrorResponse::new(Status::OnlyAggregateOperationAllowed));
            }
            if locked.is_playing() {
                drop(locked);
                let mut response = Response::with_reason(Status::Ok, "Already playing");
                self.append_session(ctx, &mut response);
                return Ok(response);
            }
        }

        if let Some(range) = request.get_header("Range") {
            match parse_npt_range(range) {
                RangeOutcome::Npt(start) => session.lock().position = start,
                RangeOutcome::NotNpt => {
                    let mut response =
                        Response::with_reason(Status::NotImplemented, "Only NPT range supported");
                    response.push_header("Accept-Ranges", "npt");
                    return Ok(response);
                }
                RangeOutcome::Invalid(message) => {
                    return Err(ErrorResponse::with_message(
                        Status::HeaderFieldNotValidForResource,
                        message,
                    ));
                }
            }
        }

        let mut locked = session.lock();
        let position = locked.position;
        locked.start(&self.config, reactor).map_err(|error| {
            tracing::error!(error = %error, "could not start transcoder");
            ErrorResponse::with_message(Status::InternalServerError, "Could not start transcoder")
        })?;
        drop(locked);

        let mut response = Response::ok();
        self.append_session(ctx, &mut response);
        response.push_header("Range", &format!("npt={:.6}-", position));
        Ok(response)
    }

    fn do_pause(
        &mut self,
        request: &Request,
        ctx: &mut RequestContext,
        reactor: &mut Reactor,
    ) -> Result<Response, ErrorResponse> {
        self.parse_session(request, ctx)?;
        self.parse_session_path(request, ctx)?;
        let Some(session) = ctx.session.clone() else {
            let mut response = Response::with_reason(Status::SessionNotFound, "No session given");
            self.append_allow(request, ctx, &mut response);
            return Ok(response);
        };

        if let Some(stream) = ctx.stream
            && session.lock().other_transports(stream)
        {
            return Err(ErrorResponse::new(Status::OnlyAggregateOperationAllowed));
        }

        if request.get_header("Range").is_some() {
            return Err(ErrorResponse::with_message(
                Status::HeaderFieldNotValidForResource,
                "Deferred pausing not supported",
            ));
        }

        let mut locked = session.lock();
        let message = match locked.stop(reactor) {
            Some(elapsed) => {
                locked.position += elapsed.as_secs_f64();
                None
            }
            None => Some("Already paused"),
        };
        let position = locked.position;
        drop(locked);

        let mut response = match message {
            Some(message) => Response::with_reason(Status::Ok, message),
            None => Response::ok(),
        };
        self.append_session(ctx, &mut response);
        response.push_header("Range", &format!("npt={:.6}", position));
        Ok(response)
    }

    fn do_teardown(
        &mut self,
        request: &Request,
        ctx: &mut RequestContext,
        reactor: &mut Reactor,
    ) -> Result<Response, ErrorResponse> {
        let mut message = match self.parse_session(request, ctx) {
            Ok(()) => None,
            Err(error) => Some(error.reason().to_string()),
        };
        self.parse_session_path(request, ctx)?;

        if ctx.invalid_session {
            // An unknown token is reported as a 200 with a message, per the
            // protocol's convention for TEARDOWN.
            return Ok(match message {
                Some(message) => Response::with_reason(Status::Ok, message),
                None => Response::ok(),
            });
        }
        let Some(session) = ctx.session.clone() else {
            let mut response = Response::with_reason(Status::SessionNotFound, "No session given");
            self.append_allow(request, ctx, &mut response);
            return Ok(response);
        };
        let Some(key) = ctx.session_key else {
            return Err(ErrorResponse::new(Status::InternalServerError));
        };

        match ctx.stream {
            None => {
                self.sessions.remove(key);
                session.lock().stop(reactor);
                message = Some("Session invalidated".to_string());
            }
            Some(stream) => {
                let mut locked = session.lock();
                if locked.is_playing() {
                    if locked.other_transports(stream) {
                        return Err(ErrorResponse::with_message(
                            Status::MethodNotValidInThisState,
                            "Partial TEARDOWN not supported while streaming",
                        ));
                    }
                    locked.stop(reactor);
                }
                message = Some(
                    match locked.transports.get_mut(stream).and_then(Option::take) {
                        Some(mut transport) => {
                            transport.stop(reactor);
                            // Releasing the last configured transport ends
                            // the session.
                            if locked.transports.iter().all(Option::is_none) {
                                self.sessions.remove(key);
                            }
                            format!("Stream {} closed", stream)
                        }
                        None => format!("Stream {} not set up", stream),
                    },
                );
            }
        }

        let mut response = match message {
            Some(message) => Response::with_reason(Status::Ok, message),
            None => Response::ok(),
        };
        if self.sessions.contains(key) {
            self.append_session(ctx, &mut response);
        }
        Ok(response)
    }

    /// Split the parsed path into media segments plus the optional stream
    /// index carried by the final segment.
    fn parse_path(&self, request: &Request, ctx: &mut RequestContext) -> Result<(), ErrorResponse> {
        let Some(path) = &ctx.plainpath else {
            return Err(ErrorResponse::with_message(
                Status::MethodNotAllowed,
                format!("Method {} does not accept null path", request.method),
            ));
        };
        let mut segments = request::parse_path(path);
        let last = segments.pop().unwrap_or_default();
        ctx.media = Some(segments);
        ctx.stream = if last.is_empty() {
            None
        } else {
            Some(last.parse::<usize>().map_err(|error| {
                ErrorResponse::with_message(
                    Status::NotFound,
                    format!("Bad stream number {:?}: {}", last, error),
                )
            })?)
        };
        Ok(())
    }

    /// Derive (or reuse) the media description for the parsed path and
    /// validate the stream index against it.
    fn parse_media(&self, ctx: &mut RequestContext) -> Result<Arc<MediaDescription>, ErrorResponse> {
        let media = ctx.media.clone().unwrap_or_default();
        let ospath = self.config.media_root.join(media.join("/"));
        let description = match self.cache.lookup(&ospath) {
            Some(description) => description,
            None => {
                let derived =
                    media::describe(&self.config, media, ospath.clone()).map_err(|error| {
                        tracing::warn!(
                            path = %ospath.display(),
                            error = %error,
                            "media description failed"
                        );
                        ErrorResponse::with_message(Status::NotFound, error.to_string())
                    })?;
                let derived = Arc::new(derived);
                self.cache.store(derived.clone());
                derived
            }
        };
        ctx.ospath = Some(description.ospath.clone());
        ctx.streams = Some(description.streams);
        ctx.description = Some(description.clone());
        self.validate_stream(ctx)?;
        Ok(description)
    }

    fn validate_stream(&self, ctx: &RequestContext) -> Result<(), ErrorResponse> {
        let streams = ctx.streams.unwrap_or(0);
        if let Some(stream) = ctx.stream
            && stream >= streams
        {
            return Err(ErrorResponse::with_message(
                Status::NotFound,
                format!("Stream number out of range 0-{}", streams as i64 - 1),
            ));
        }
        Ok(())
    }

    /// Resolve the `Session` header. Leaves `invalid_session` set when the
    /// header was present but unusable.
    fn parse_session(&self, request: &Request, ctx: &mut RequestContext) -> Result<(), ErrorResponse> {
        ctx.session_parsed = true;
        ctx.invalid_session = true;
        ctx.session = None;
        let Some(value) = request.get_header("Session") else {
            ctx.invalid_session = false;
            return Ok(());
        };
        let token = value.split(';').next().unwrap_or(value).trim();
        let key = session::parse_key(token).map_err(|error| {
            ErrorResponse::with_message(
                Status::SessionNotFound,
                format!("Bad session token {:?}: {}", token, error),
            )
        })?;
        ctx.session_key = Some(key);
        let Some(session) = self.sessions.get(key) else {
            return Err(ErrorResponse::new(Status::SessionNotFound));
        };
        session.lock().touch();
        ctx.session = Some(session);
        ctx.invalid_session = false;
        Ok(())
    }

    /// Resolve path and media the way the session verbs need: no path means
    /// aggregate; with a session the path must name the session's media and
    /// the stream index is validated against its slots.
    fn parse_session_path(
        &self,
        request: &Request,
        ctx: &mut RequestContext,
    ) -> Result<(), ErrorResponse> {
        if ctx.plainpath.is_none() {
            ctx.stream = None;
            return Ok(());
        }
        self.parse_path(request, ctx)?;
        if let Some(session) = ctx.session.clone() {
            let locked = session.lock();
            if ctx.media.as_ref() != Some(&locked.media) {
                return Err(ErrorResponse::with_message(
                    Status::MethodNotValidInThisState,
                    "Session already set up with different media file",
                ));
            }
            ctx.streams = Some(locked.stream_count());
            drop(locked);
            self.validate_stream(ctx)
        } else {
            self.parse_media(ctx).map(|_| ())
        }
    }

    /// Append `Session` and `Allow` headers for the current context.
    ///
    /// Pure over protocol state, best-effort: a secondary resolution failure
    /// leaves the headers off rather than failing the response.
    fn append_allow(&self, request: &Request, ctx: &mut RequestContext, response: &mut Response) {
        if ctx.plainpath.is_some() {
            if ctx.media.is_none() && self.parse_path(request, ctx).is_err() {
                return;
            }
            if ctx.streams.is_none() && self.parse_media(ctx).is_err() {
                return;
            }
        }
        if !ctx.session_parsed {
            let _ = self.parse_session(request, ctx);
        }

        let view = ctx.session.as_ref().map(|session| {
            let locked = session.lock();
            SessionView {
                media: locked.media.clone(),
                configured: locked
                    .transports
                    .iter()
                    .map(|slot| slot.is_some())
                    .collect(),
                playing: locked.is_playing(),
                count: locked.stream_count(),
            }
        });

        let media_match = match (&view, &ctx.plainpath) {
            (Some(view), Some(_)) => ctx.media.as_ref() == Some(&view.media),
            _ => true,
        };
        let streaming = view.as_ref().is_some_and(|view| view.playing);
        let all_streams = view.as_ref().is_some_and(|view| {
            ctx.plainpath.is_none()
                || match ctx.stream {
                    None => true,
                    Some(stream) => {
                        view.configured.get(stream).copied().unwrap_or(false)
                            && !view
                                .configured
                                .iter()
                                .enumerate()
                                .any(|(index, configured)| *configured && index != stream)
                    }
                }
        });

        let mut allow = vec!["OPTIONS"];
        let single_stream = if ctx.plainpath.is_some() {
            if ctx.stream.is_none() {
                allow.push("DESCRIBE");
            }
            ctx.stream.is_some() || ctx.streams.unwrap_or(0) <= 1
        } else {
            view.as_ref().is_some_and(|view| view.count <= 1)
        };
        if media_match && single_stream && !ctx.invalid_session && !streaming {
            allow.push("SETUP");
        }
        if ctx.invalid_session || (view.is_some() && media_match && (all_streams || !streaming)) {
            allow.push("TEARDOWN");
        }
        if media_match && all_streams {
            allow.push("PLAY");
            allow.push("PAUSE");
        }

        if ctx.session.is_some() {
            self.append_session(ctx, response);
        }
        response.push_header("Allow", &allow.join(", "));
    }

    fn append_session(&self, ctx: &RequestContext, response: &mut Response) {
        if let Some(key) = ctx.session_key {
            response.push_header(
                "Session",
                &format!(
                    "{};timeout={}",
                    session::format_key(key),
                    self.config.session_timeout.as_secs()
                ),
            );
        }
    }
}

enum RangeOutcome {
    Npt(f64),
    NotNpt,
    Invalid(String),
}

/// Parse a `Range` request header: `npt=<start>-` seeks, an end point or a
/// `time=` anchor is unsupported, and a non-NPT unit is not implemented.
fn parse_npt_range(value: &str) -> RangeOutcome {
    let mut npt: Option<&str> = None;
    for parameter in value.split(';') {
        let parameter = parameter.trim();
        let (key, val) = match parameter.split_once('=') {
            Some((key, val)) => (key.trim(), val.trim()),
            None => (parameter, ""),
        };
        if key.eq_ignore_ascii_case("time") {
            return RangeOutcome::Invalid("Start time parameter not supported".to_string());
        }
        if key.eq_ignore_ascii_case("npt") {
            npt = Some(val);
        }
    }
    let Some(npt) = npt else {
        return RangeOutcome::NotNpt;
    };
    let (start, end) = npt.split_once('-').unwrap_or((npt, ""));
    if !end.is_empty() {
        return RangeOutcome::Invalid("End point not supported".to_string());
    }
    match start.trim().parse::<f64>() {
        Ok(start) => RangeOutcome::Npt(start),
        Err(error) => RangeOutcome::Invalid(format!("Bad NPT value {:?}: {}", start, error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::DescriptionCache;
    use std::net::{Ipv4Addr, TcpListener};

    struct Fixture {
        handler: MethodHandler,
        reactor: Reactor,
        sessions: SessionTable,
        // Keeps the client side of the control socket open.
        _client: TcpStream,
    }

    fn fixture() -> Fixture {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, peer) = listener.accept().unwrap();

        let mut reactor = Reactor::new();
        let token = reactor.reserve();
        let sessions = SessionTable::new();
        let handler = MethodHandler::new(
            sessions.clone(),
            DescriptionCache::new(),
            Arc::new(ServerConfig::default()),
            peer,
            token,
            server_side,
        );
        Fixture {
            handler,
            reactor,
            sessions,
            _client: client,
        }
    }

    fn request(method: &str, target: &str, headers: &[(&str, &str)]) -> Request {
        Request {
            method: method.to_string(),
            target: target.to_string(),
            version: Some("RTSP/1.0".to_string()),
            protocol: Some("RTSP".to_string()),
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }

    fn dispatch(fixture: &mut Fixture, request: &Request) -> Response {
        let mut ctx = RequestContext::new(request);
        fixture
            .handler
            .dispatch(request, &mut ctx, &mut fixture.reactor)
    }

    fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
        response
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[test]
    fn options_star_lists_public_and_allow() {
        let mut fx = fixture();
        let req = request("OPTIONS", "*", &[]);
        let response = dispatch(&mut fx, &req);
        assert_eq!(response.status, Status::Ok);
        assert_eq!(header(&response, "Public"), Some(Method::PUBLIC));
        assert_eq!(header(&response, "Allow"), Some("OPTIONS"));
    }

    #[test]
    fn options_with_bad_session_token() {
        let mut fx = fixture();
        let req = request("OPTIONS", "*", &[("Session", "not-hex")]);
        let response = dispatch(&mut fx, &req);
        assert_eq!(response.status, Status::SessionNotFound);
        assert!(header(&response, "Allow").is_some());
        assert!(header(&response, "Public").is_some());
        assert!(header(&response, "Session").is_none());
    }

    #[test]
    fn play_without_session_is_454_with_allow() {
        let mut fx = fixture();
        let req = request("PLAY", "*", &[]);
        let response = dispatch(&mut fx, &req);
        assert_eq!(response.status, Status::SessionNotFound);
        assert_eq!(response.reason.as_deref(), Some("No session given"));
        assert!(header(&response, "Allow").is_some());
    }

    #[test]
    fn unknown_method_hits_default_branch() {
        let mut fx = fixture();
        let req = request("RECORD", "*", &[]);
        let response = dispatch(&mut fx, &req);
        assert_eq!(response.status, Status::NotImplemented);
        assert_eq!(
            response.reason.as_deref(),
            Some("Request method \"RECORD\" not implemented")
        );
        assert_eq!(header(&response, "Public"), Some(Method::PUBLIC));
    }

    #[test]
    fn http_verbs_are_forbidden() {
        let mut fx = fixture();
        let response = dispatch(&mut fx, &request("GET", "/index.html", &[]));
        assert_eq!(response.status, Status::Forbidden);
    }

    #[test]
    fn setup_without_path_or_session() {
        let mut fx = fixture();
        let req = request("SETUP", "*", &[("Transport", "RTP/AVP;unicast;client_port=5000-5001")]);
        let response = dispatch(&mut fx, &req);
        assert_eq!(response.status, Status::MethodNotValidInThisState);
        assert_eq!(response.reason.as_deref(), Some("No media or session specified"));
        assert!(header(&response, "Allow").is_some());
    }

    #[test]
    fn teardown_with_unknown_token_reports_ok() {
        let mut fx = fixture();
        let req = request("TEARDOWN", "*", &[("Session", "00000000000000000000000000000ABC")]);
        let response = dispatch(&mut fx, &req);
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.reason.as_deref(), Some("Session Not Found"));
        assert!(fx.sessions.is_empty());
    }

    #[test]
    fn pause_on_configured_session_reports_position() {
        let mut fx = fixture();
        let key = fx.sessions.insert(Session::new(
            vec!["movie.mp4".to_string()],
            "movie.mp4".into(),
            1,
        ));
        let token = crate::session::format_key(key);
        let req = request("PAUSE", "*", &[("Session", &token)]);
        let response = dispatch(&mut fx, &req);
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.reason.as_deref(), Some("Already paused"));
        assert_eq!(header(&response, "Range"), Some("npt=0.000000"));
        assert!(header(&response, "Session").unwrap().starts_with(&token));
    }

    #[test]
    fn teardown_last_stream_keeps_session_until_aggregate() {
        let mut fx = fixture();
        let key = fx.sessions.insert(Session::new(
            vec!["movie.mp4".to_string()],
            "movie.mp4".into(),
            2,
        ));
        let token = crate::session::format_key(key);

        // Single-stream TEARDOWN on an unconfigured slot.
        let req = request("TEARDOWN", "rtsp://h/movie.mp4/1", &[("Session", &token)]);
        let response = dispatch(&mut fx, &req);
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.reason.as_deref(), Some("Stream 1 not set up"));
        assert!(fx.sessions.contains(key));
        assert!(header(&response, "Session").is_some());

        // Aggregate TEARDOWN removes the session.
        let req = request("TEARDOWN", "rtsp://h/movie.mp4/", &[("Session", &token)]);
        let response = dispatch(&mut fx, &req);
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.reason.as_deref(), Some("Session invalidated"));
        assert!(!fx.sessions.contains(key));
        assert!(header(&response, "Session").is_none());
    }

    #[test]
    fn teardown_of_last_configured_stream_removes_session() {
        let mut fx = fixture();
        let mut session = Session::new(vec!["movie.mp4".to_string()], "movie.mp4".into(), 2);
        session.transports[0] = Some(Transport::Udp(UdpTransport {
            destination: "127.0.0.1".parse().unwrap(),
            rtp_port: 5000,
        }));
        let key = fx.sessions.insert(session);
        let token = crate::session::format_key(key);

        let req = request("TEARDOWN", "rtsp://h/movie.mp4/0", &[("Session", &token)]);
        let response = dispatch(&mut fx, &req);
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.reason.as_deref(), Some("Stream 0 closed"));
        assert!(!fx.sessions.contains(key), "emptied session must be removed");
        assert!(header(&response, "Session").is_none());

        let req = request("PLAY", "*", &[("Session", &token)]);
        let response = dispatch(&mut fx, &req);
        assert_eq!(response.status, Status::SessionNotFound);
    }

    #[test]
    fn session_path_mismatch_is_455() {
        let mut fx = fixture();
        let key = fx.sessions.insert(Session::new(
            vec!["movie.mp4".to_string()],
            "movie.mp4".into(),
            1,
        ));
        let token = crate::session::format_key(key);
        let req = request("PLAY", "rtsp://h/other.mp4/", &[("Session", &token)]);
        let response = dispatch(&mut fx, &req);
        assert_eq!(response.status, Status::MethodNotValidInThisState);
        assert_eq!(
            response.reason.as_deref(),
            Some("Session already set up with different media file")
        );
        // Allow is best-effort: the new path's media cannot be described
        // here, so the header is omitted rather than failing the response.
        assert!(header(&response, "Allow").is_none());
    }

    #[test]
    fn npt_range_parsing() {
        assert!(matches!(parse_npt_range("npt=10.5-"), RangeOutcome::Npt(v) if v == 10.5));
        assert!(matches!(parse_npt_range("npt=0-"), RangeOutcome::Npt(v) if v == 0.0));
        assert!(matches!(parse_npt_range("npt=10.5"), RangeOutcome::Npt(v) if v == 10.5));
        assert!(matches!(parse_npt_range("clock=19961108T143720Z-"), RangeOutcome::NotNpt));
        assert!(matches!(parse_npt_range("npt=10-20"), RangeOutcome::Invalid(_)));
        assert!(matches!(
            parse_npt_range("npt=10-;time=19970123T143720Z"),
            RangeOutcome::Invalid(_)
        ));
        assert!(matches!(parse_npt_range("npt=bogus-"), RangeOutcome::Invalid(_)));
    }
}
