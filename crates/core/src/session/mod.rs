//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! A session is created by the first SETUP against a path, accumulates one
//! transport per elementary stream, and owns at most one running transcoder:
//!
//! ```text
//! SETUP                -> configured (transport slots filling)
//! PLAY                 -> playing    (transcoder child running)
//! PAUSE                -> paused     (child killed, position retained)
//! TEARDOWN / expiry    -> removed
//! ```
//!
//! The table is process-wide: a session outlives the connection that created
//! it unless every configured transport is interleaved on that connection.

pub mod transport;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::RngExt;

use crate::error::Result;
use crate::media::{self, RtpTarget, STREAM_KINDS, StreamKind};
use crate::reactor::{Reactor, Token};
use crate::server::ServerConfig;
pub use transport::Transport;

/// Session identifier: 128 random bits, rendered as 32 hex digits.
pub type SessionKey = u128;

/// Format a key for the `Session` header.
pub fn format_key(key: SessionKey) -> String {
    format!("{:032X}", key)
}

/// Parse a client-supplied session token (hex, case-insensitive).
pub fn parse_key(token: &str) -> std::result::Result<SessionKey, std::num::ParseIntError> {
    SessionKey::from_str_radix(token, 16)
}

/// One playback session.
pub struct Session {
    /// Path segments the session was set up with; later requests naming a
    /// different resource are refused.
    pub media: Vec<String>,
    /// Resolved filesystem path handed to the transcoder.
    pub ospath: PathBuf,
    /// One slot per elementary stream; the length never changes.
    pub transports: Vec<Option<Transport>>,
    /// Playback offset in seconds, advanced on PAUSE.
    pub position: f64,
    started: Option<Instant>,
    child: Option<Child>,
    last_active: Instant,
}

impl Session {
    pub fn new(media: Vec<String>, ospath: PathBuf, streams: usize) -> Self {
        Session {
            media,
            ospath,
            transports: (0..streams).map(|_| None).collect(),
            position: 0.0,
            started: None,
            child: None,
            last_active: Instant::now(),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.transports.len()
    }

    pub fn is_playing(&self) -> bool {
        self.child.is_some()
    }

    /// Whether any stream slot other than `stream` is configured.
    pub fn other_transports(&self, stream: usize) -> bool {
        self.transports
            .iter()
            .enumerate()
            .any(|(index, slot)| index != stream && slot.is_some())
    }

    /// Record client activity for the expiry sweep.
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// True when at least one transport is configured and every configured
    /// transport is interleaved on the given connection — the case where a
    /// closing connection takes the session with it.
    pub fn all_interleaved_owned_by(&self, token: Token) -> bool {
        let mut any = false;
        for slot in self.transports.iter().flatten() {
            if slot.interleaved_owner() != Some(token) {
                return false;
            }
            any = true;
        }
        any
    }

    /// Start the transcoder for every configured stream, seeked to the
    /// stored position.
    pub fn start(&mut self, config: &ServerConfig, reactor: &mut Reactor) -> Result<()> {
        let mut targets: Vec<(StreamKind, Option<RtpTarget>)> = Vec::new();
        let mut failed = None;
        for (index, kind) in STREAM_KINDS.iter().enumerate() {
            let Some(slot) = self.transports.get_mut(index) else {
                break;
            };
            if let Some(transport) = slot {
                match transport.start(reactor) {
                    Ok(target) => targets.push((*kind, Some(target))),
                    Err(error) => {
                        failed = Some(error);
                        break;
                    }
                }
            }
        }
        if let Some(error) = failed {
            self.stop_transports(reactor);
            return Err(error.into());
        }

        match media::spawn_transcoder(config, &self.ospath, self.position, &targets) {
            Ok(child) => {
                self.child = Some(child);
                self.started = Some(Instant::now());
                Ok(())
            }
            Err(error) => {
                self.stop_transports(reactor);
                Err(error)
            }
        }
    }

    /// Stop playback: release relay sockets, kill the transcoder, reap it.
    /// Returns the wall time spent playing, or `None` when already stopped.
    ///
    /// The child is killed rather than signalled: a graceful shutdown makes
    /// the transcoder emit RTCP BYE packets that race with socket teardown.
    pub fn stop(&mut self, reactor: &mut Reactor) -> Option<Duration> {
        let mut child = self.child.take()?;
        self.stop_transports(reactor);
        if let Err(error) = child.kill() {
            tracing::debug!(error = %error, "transcoder kill failed");
        }
        match child.wait() {
            Ok(status) => tracing::debug!(%status, "transcoder reaped"),
            Err(error) => tracing::warn!(error = %error, "transcoder wait failed"),
        }
        self.started.take().map(|started| started.elapsed())
    }

    fn stop_transports(&mut self, reactor: &mut Reactor) {
        for transport in self.transports.iter_mut().flatten() {
            transport.stop(reactor);
        }
    }
}

/// Process-wide registry of active sessions.
///
/// The single-threaded selector never contends on these locks; they encode
/// the per-session mutual exclusion any multi-threaded port would need.
#[derive(Clone, Default)]
pub struct SessionTable {
    sessions: Arc<RwLock<HashMap<SessionKey, Arc<Mutex<Session>>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a fresh random key. The key is chosen only
    /// here, after the first transport attached successfully, so clients can
    /// never race the server to a token.
    pub fn insert(&self, session: Session) -> SessionKey {
        let key: SessionKey = rand::rng().random();
        let mut sessions = self.sessions.write();
        sessions.insert(key, Arc::new(Mutex::new(session)));
        tracing::debug!(
            session = %format_key(key),
            total_sessions = sessions.len(),
            "session created"
        );
        key
    }

    pub fn get(&self, key: SessionKey) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(&key).cloned()
    }

    pub fn remove(&self, key: SessionKey) -> Option<Arc<Mutex<Session>>> {
        let removed = self.sessions.write().remove(&key);
        if removed.is_some() {
            tracing::debug!(session = %format_key(key), "session removed");
        }
        removed
    }

    pub fn contains(&self, key: SessionKey) -> bool {
        self.sessions.read().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Remove and return sessions idle past `timeout`.
    pub fn take_expired(&self, timeout: Duration) -> Vec<(SessionKey, Arc<Mutex<Session>>)> {
        let mut sessions = self.sessions.write();
        let expired: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, session)| session.lock().idle_for() > timeout)
            .map(|(key, _)| *key)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| sessions.remove(&key).map(|session| (key, session)))
            .collect()
    }

    /// Remove and return sessions whose delivery depends entirely on the
    /// closing connection's interleaved channels.
    pub fn take_owned_by(&self, token: Token) -> Vec<Arc<Mutex<Session>>> {
        let mut sessions = self.sessions.write();
        let doomed: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, session)| session.lock().all_interleaved_owned_by(token))
            .map(|(key, _)| *key)
            .collect();
        doomed
            .into_iter()
            .filter_map(|key| sessions.remove(&key))
            .collect()
    }
}
