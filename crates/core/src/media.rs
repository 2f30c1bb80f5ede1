//! Media probing and transcoder process management.
//!
//! The transcoder is an opaque collaborator: this module only spawns it,
//! kills it, and parses what it prints. Two invocations exist:
//!
//! - **probe** — `ffprobe` with JSON output, for duration and title;
//! - **describe** — `ffmpeg -t 0`, which prints the SDP for its RTP outputs
//!   and exits before processing any video.
//!
//! The playback invocation (`-re -ss <offset>`) is built by the same command
//! builder with real RTP targets and owned by the session that started it.

use std::collections::HashMap;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::{Result, RtspError};
use crate::protocol::sdp;
use crate::server::ServerConfig;

/// Elementary-stream kinds the transcoder can emit, in output order.
pub const STREAM_KINDS: [StreamKind; 2] = [StreamKind::Video, StreamKind::Audio];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    /// Single-letter flag used by the tool's per-type options
    /// (`-vcodec`, `-an`, `-map 0:v`, ...).
    fn flag(self) -> char {
        match self {
            StreamKind::Video => 'v',
            StreamKind::Audio => 'a',
        }
    }
}

/// Where one elementary stream's RTP and RTCP should be sent.
#[derive(Debug, Clone)]
pub struct RtpTarget {
    pub host: IpAddr,
    pub rtp_port: u16,
    pub rtcp_port: u16,
}

impl RtpTarget {
    fn url(&self) -> String {
        format!(
            "rtp://{}:{}?rtcpport={}",
            format_host(self.host),
            self.rtp_port,
            self.rtcp_port
        )
    }
}

/// An IP formatted for a URL authority.
pub fn format_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}

/// Duration and title read from the probe tool.
#[derive(Debug, Clone)]
pub struct MediaMetadata {
    /// Total duration in seconds, verbatim for the SDP range attribute.
    pub duration: String,
    pub title: Option<String>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: String,
    #[serde(default)]
    tags: HashMap<String, String>,
}

/// The derived description of one media resource.
#[derive(Debug)]
pub struct MediaDescription {
    /// Path segments the client used to name the resource.
    pub media: Vec<String>,
    /// Resolved filesystem path handed to the tools.
    pub ospath: PathBuf,
    pub sdp: String,
    pub streams: usize,
}

/// Single-entry cache of the most recently derived description.
///
/// Keyed by resolved path: a request for a different resource recomputes,
/// and a failed derivation is never stored.
#[derive(Clone, Default)]
pub struct DescriptionCache {
    last: Arc<Mutex<Option<Arc<MediaDescription>>>>,
}

impl DescriptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, ospath: &Path) -> Option<Arc<MediaDescription>> {
        self.last
            .lock()
            .as_ref()
            .filter(|description| description.ospath == ospath)
            .cloned()
    }

    pub fn store(&self, description: Arc<MediaDescription>) {
        *self.last.lock() = Some(description);
    }
}

/// Run the probe tool and parse its JSON metadata.
pub fn probe_metadata(config: &ServerConfig, path: &Path) -> Result<MediaMetadata> {
    let output = Command::new(&config.ffprobe)
        .args(["-loglevel", "warning"])
        .args(["-show_entries", "format=duration : format_tags=title"])
        .args(["-print_format", "json"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(RtspError::Io)?;
    if !output.status.success() {
        return Err(RtspError::ProbeFailed(output.status));
    }
    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)?;
    Ok(MediaMetadata {
        duration: parsed.format.duration,
        title: parsed.format.tags.get("title").cloned(),
    })
}

/// Derive the full description for a resource: probe for metadata, then read
/// the transcoder's SDP preamble and rewrite it for clients.
pub fn describe(config: &ServerConfig, media: Vec<String>, ospath: PathBuf) -> Result<MediaDescription> {
    let metadata = probe_metadata(config, &ospath)?;

    // Stop before processing any video; the SDP preamble is all we need.
    let placeholders: Vec<(StreamKind, Option<RtpTarget>)> =
        STREAM_KINDS.iter().map(|kind| (*kind, None)).collect();
    let mut child = transcode_command(config, &ospath, &["-t", "0"], &placeholders, "error")
        .stdout(Stdio::piped())
        .spawn()
        .map_err(RtspError::Io)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RtspError::Io(std::io::Error::other("transcoder stdout not captured")))?;

    let mut reader = BufReader::new(stdout);
    let rewritten =
        sdp::rewrite_description(&mut reader, &metadata.duration, metadata.title.is_some());
    drop(reader);

    match rewritten {
        Ok(rewritten) => {
            let status = child.wait().map_err(RtspError::Io)?;
            if !status.success() {
                return Err(RtspError::DescribeFailed(status));
            }
            tracing::debug!(
                path = %ospath.display(),
                streams = rewritten.streams,
                "derived media description"
            );
            Ok(MediaDescription {
                media,
                ospath,
                sdp: rewritten.sdp,
                streams: rewritten.streams,
            })
        }
        Err(error) => {
            // Report the tool's own failure status when it died; otherwise
            // reap it and surface the rewrite error.
            if let Some(status) = child.try_wait().map_err(RtspError::Io)? {
                if !status.success() {
                    return Err(RtspError::DescribeFailed(status));
                }
            } else {
                let _ = child.kill();
                let _ = child.wait();
            }
            Err(error)
        }
    }
}

/// Start the transcoder delivering the given streams, seeked to `position`
/// seconds. One process serves every configured stream of a session.
pub fn spawn_transcoder(
    config: &ServerConfig,
    input: &Path,
    position: f64,
    streams: &[(StreamKind, Option<RtpTarget>)],
) -> Result<Child> {
    let offset = format!("{:.6}", position);
    let child = transcode_command(config, input, &["-re", "-ss", &offset], streams, "warning")
        .stdout(Stdio::null())
        .spawn()
        .map_err(RtspError::Io)?;
    tracing::info!(
        pid = child.id(),
        path = %input.display(),
        offset = %offset,
        "transcoder started"
    );
    Ok(child)
}

/// Build a transcoder invocation: `pre` options, the input, then one RTP
/// output per requested stream with every other stream kind suppressed.
fn transcode_command(
    config: &ServerConfig,
    input: &Path,
    pre: &[&str],
    streams: &[(StreamKind, Option<RtpTarget>)],
    loglevel: &str,
) -> Command {
    let mut command = Command::new(&config.ffmpeg);
    command.args(["-loglevel", loglevel]);
    command.args(pre);
    command.arg("-i").arg(input);

    for (index, (kind, target)) in streams.iter().enumerate() {
        command.arg("-map").arg(format!("0:{}", kind.flag()));
        command.arg(format!("-{}codec", kind.flag())).arg("copy");
        for other in STREAM_KINDS {
            if other != *kind {
                command.arg(format!("-{}n", other.flag()));
            }
        }
        command.args(["-f", "rtp", "-rtpflags", "send_bye"]);
        command.arg(match target {
            Some(target) => target.url(),
            // Placeholder ports for description runs; the tool rejects a
            // null or zero port even though it never sends.
            None => format!("rtp://localhost:{}", 6970 + index * 2),
        });
    }
    command.stdin(Stdio::null());
    command
}
