//! Request-line and header parsing (RFC 2326 §6, HTTP/1.x shaped).
//!
//! The codec is protocol-agnostic: the advertised protocol token only
//! selects the byte decoding (UTF-8 for RTSP, Latin-1 otherwise), so the
//! same parser serves RTSP and plain-HTTP front ends. All reads are bounded:
//!
//! - request line: 8000 octets (RFC 7230 §3.1.1 recommended minimum)
//! - header line: 1000 octets, at most 200 header lines
//!
//! Violations are framing errors — fatal to the request, connection closed.

use std::io::Read;

use crate::error::{ErrorResponse, Status};

/// Maximum request-line length in octets, terminator included.
pub const MAX_REQUEST_LINE: usize = 8000;
/// Maximum header-line length in octets, terminator included.
pub const MAX_HEADER_LINE: usize = 1000;
/// Maximum number of header lines before the blank terminator.
pub const MAX_HEADER_COUNT: usize = 200;

/// A parsed request: method, target, protocol tokens and ordered headers.
///
/// Headers are stored as received, names case-preserved and repeatable;
/// lookups via [`get_header`](Self::get_header) are case-insensitive per
/// RFC 2326 §4.2. The request is scoped to one request/response cycle.
#[derive(Debug)]
pub struct Request {
    /// Method token (OPTIONS, DESCRIBE, SETUP, ...), decoded but unvalidated.
    pub method: String,
    /// Request target as sent (absolute RTSP URI, bare path, or `*`).
    pub target: String,
    /// Version token (e.g. `RTSP/1.0`), absent when the request line had
    /// fewer than three fields.
    pub version: Option<String>,
    /// Protocol name extracted from the version token (e.g. `RTSP`).
    pub protocol: Option<String>,
    /// Headers as ordered (name, value) pairs.
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// First header value by case-insensitive name.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value of a repeatable header, in order of appearance.
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The target reduced to a plain path: query/fragment stripped, the
    /// scheme and authority of an absolute URI removed. `None` for `*` and
    /// for an empty path (both mean "no resource named").
    pub fn plain_path(&self) -> Option<String> {
        let target = self.target.split(['?', '#']).next().unwrap_or("");
        if target == "*" {
            return None;
        }
        let path = if let Some(rest) = target
            .strip_prefix("rtsp://")
            .or_else(|| target.strip_prefix("rtsps://"))
        {
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "",
            }
        } else {
            target
        };
        if path.is_empty() {
            None
        } else {
            Some(path.to_string())
        }
    }
}

/// What came off the wire when a request was expected.
#[derive(Debug)]
pub enum RequestOutcome {
    /// Peer closed the connection before sending anything.
    Eof,
    /// A bare blank line; ignored, connection stays open.
    Empty,
    /// Framing violation; the error is sent and the connection closed.
    Invalid(ErrorResponse),
    /// A complete request.
    Request(Request),
}

/// Read one request (line plus headers) from the byte source.
///
/// I/O errors propagate; framing violations come back as
/// [`RequestOutcome::Invalid`] so the caller can render them.
pub fn read_request(reader: &mut impl Read) -> std::io::Result<RequestOutcome> {
    let line = match read_line_limited(reader, MAX_REQUEST_LINE)? {
        Line::Eof => return Ok(RequestOutcome::Eof),
        Line::TooLong => {
            return Ok(RequestOutcome::Invalid(ErrorResponse::with_message(
                Status::RequestLineTooLong,
                "Request line too long",
            )));
        }
        Line::Data(data) => data,
    };

    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(RequestOutcome::Empty);
    }

    let (method, rest) = split_first_word(line);
    let (target, version) = match rest {
        None => (&b""[..], None),
        Some(rest) => match split_last_word(rest) {
            None => (rest, None),
            Some((target, version)) => (target, Some(version)),
        },
    };

    // The protocol name (before the slash of "RTSP/1.0") picks the decoding.
    let protocol = version.map(|v| match v.iter().rposition(|&b| b == b'/') {
        Some(slash) => &v[..slash],
        None => v,
    });
    let utf8 = matches!(protocol, None | Some(b"RTSP"));

    let decoded = (|| {
        Some(Request {
            method: decode(method, utf8)?,
            target: decode(target, utf8)?,
            version: match version {
                Some(v) => Some(decode(v, utf8)?),
                None => None,
            },
            protocol: match protocol {
                Some(p) => Some(decode(p, utf8)?),
                None => None,
            },
            headers: Vec::new(),
        })
    })();
    let mut request = match decoded {
        Some(request) => request,
        None => {
            return Ok(RequestOutcome::Invalid(ErrorResponse::with_message(
                Status::BadRequest,
                "Undecodable request line",
            )));
        }
    };

    let mut count = 0;
    loop {
        let line = match read_line_limited(reader, MAX_HEADER_LINE)? {
            // EOF amid headers ends them; the write side will notice the
            // dead peer soon enough.
            Line::Eof => break,
            Line::TooLong => {
                return Ok(RequestOutcome::Invalid(ErrorResponse::with_message(
                    Status::HeaderFieldsTooLarge,
                    "Request header line too long",
                )));
            }
            Line::Data(data) => data,
        };
        let line = line.trim_ascii();
        if line.is_empty() {
            break;
        }
        count += 1;
        if count > MAX_HEADER_COUNT {
            return Ok(RequestOutcome::Invalid(ErrorResponse::with_message(
                Status::HeaderFieldsTooLarge,
                "Request header too long",
            )));
        }
        let Some(text) = decode(line, utf8) else {
            return Ok(RequestOutcome::Invalid(ErrorResponse::with_message(
                Status::BadRequest,
                "Undecodable header line",
            )));
        };
        let Some(colon) = text.find(':') else {
            return Ok(RequestOutcome::Invalid(ErrorResponse::with_message(
                Status::BadRequest,
                "Invalid header line",
            )));
        };
        let name = text[..colon].trim().to_string();
        let value = text[colon + 1..].trim().to_string();
        request.headers.push((name, value));
    }

    Ok(RequestOutcome::Request(request))
}

/// Split a plain path into percent-decoded segments, resolving `.` and `..`
/// against an implicit root. A trailing slash (or a path that resolves to
/// nothing) leaves a sentinel empty final segment.
pub fn parse_path(path: &str) -> Vec<String> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let mut parsed: Vec<String> = Vec::new();
    let mut empty_file = true;
    for elem in path.split('/') {
        empty_file = true;
        if elem == ".." {
            parsed.pop();
        } else if !elem.is_empty() && elem != "." {
            parsed.push(percent_decode(elem));
            empty_file = false;
        }
    }
    if empty_file {
        parsed.push(String::new());
    }
    parsed
}

enum Line {
    Eof,
    TooLong,
    Data(Vec<u8>),
}

/// Read one LF-terminated line of at most `limit` octets (terminator
/// included). Reads byte-at-a-time; the callers sit on buffered sources.
fn read_line_limited(reader: &mut impl Read, limit: usize) -> std::io::Result<Line> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte)? == 0 {
            if line.is_empty() {
                return Ok(Line::Eof);
            }
            break;
        }
        line.push(byte[0]);
        if line.len() > limit {
            return Ok(Line::TooLong);
        }
        if byte[0] == b'\n' {
            break;
        }
    }
    Ok(Line::Data(line))
}

/// Split trimmed bytes at the leftmost whitespace run: `(word, rest)`.
fn split_first_word(bytes: &[u8]) -> (&[u8], Option<&[u8]>) {
    match bytes.iter().position(|b| b.is_ascii_whitespace()) {
        Some(pos) => (&bytes[..pos], Some(bytes[pos..].trim_ascii())),
        None => (bytes, None),
    }
}

/// Split trimmed bytes at the rightmost whitespace run: `(rest, word)`.
///
/// `None` when there is no whitespace, so a target containing no version
/// token degrades gracefully instead of losing its tail.
fn split_last_word(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = bytes.iter().rposition(|b| b.is_ascii_whitespace())?;
    Some((bytes[..pos].trim_ascii(), &bytes[pos + 1..]))
}

/// Decode bytes as UTF-8 or Latin-1. Latin-1 maps bytes to code points
/// one-to-one and cannot fail; UTF-8 failure means a malformed request.
fn decode(bytes: &[u8], utf8: bool) -> Option<String> {
    if utf8 {
        String::from_utf8(bytes.to_vec()).ok()
    } else {
        Some(bytes.iter().map(|&b| b as char).collect())
    }
}

fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = |b: u8| (b as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(raw: &[u8]) -> RequestOutcome {
        read_request(&mut Cursor::new(raw.to_vec())).unwrap()
    }

    fn parse_ok(raw: &[u8]) -> Request {
        match parse(raw) {
            RequestOutcome::Request(request) => request,
            other => panic!("expected a request, got {:?}", other),
        }
    }

    #[test]
    fn parse_options_request() {
        let req = parse_ok(b"OPTIONS rtsp://localhost:8554/test RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        assert_eq!(req.method, "OPTIONS");
        assert_eq!(req.target, "rtsp://localhost:8554/test");
        assert_eq!(req.version.as_deref(), Some("RTSP/1.0"));
        assert_eq!(req.protocol.as_deref(), Some("RTSP"));
        assert_eq!(req.get_header("CSeq"), Some("1"));
        assert_eq!(req.plain_path().as_deref(), Some("/test"));
    }

    #[test]
    fn header_lookup_case_insensitive_and_repeatable() {
        let req = parse_ok(b"OPTIONS * RTSP/1.0\r\ncseq: 42\r\nCSeq: 43\r\n\r\n");
        assert_eq!(req.get_header("CSEQ"), Some("42"));
        let all: Vec<&str> = req.header_all("CSeq").collect();
        assert_eq!(all, vec!["42", "43"]);
    }

    #[test]
    fn missing_version_keeps_whole_target() {
        let req = parse_ok(b"SETUP movie.mp4/0\r\n\r\n");
        assert_eq!(req.method, "SETUP");
        assert_eq!(req.target, "movie.mp4/0");
        assert!(req.version.is_none());
        assert!(req.protocol.is_none());
    }

    #[test]
    fn rightmost_split_preserves_spaces_in_target() {
        let req = parse_ok(b"DESCRIBE my movie.mp4/ RTSP/1.0\r\n\r\n");
        assert_eq!(req.target, "my movie.mp4/");
        assert_eq!(req.version.as_deref(), Some("RTSP/1.0"));
    }

    #[test]
    fn star_and_empty_targets_have_no_path() {
        let req = parse_ok(b"OPTIONS * RTSP/1.0\r\n\r\n");
        assert_eq!(req.plain_path(), None);
        let req = parse_ok(b"OPTIONS rtsp://host:8554 RTSP/1.0\r\n\r\n");
        assert_eq!(req.plain_path(), None);
    }

    #[test]
    fn query_and_fragment_stripped() {
        let req = parse_ok(b"DESCRIBE rtsp://h/movie.mp4/?probe=1#x RTSP/1.0\r\n\r\n");
        assert_eq!(req.plain_path().as_deref(), Some("/movie.mp4/"));
    }

    #[test]
    fn request_line_too_long() {
        let mut raw = vec![b'A'; MAX_REQUEST_LINE + 1];
        raw.extend_from_slice(b"\r\n");
        match parse(&raw) {
            RequestOutcome::Invalid(err) => {
                assert_eq!(err.status, Status::RequestLineTooLong);
            }
            other => panic!("expected 414, got {:?}", other),
        }
    }

    #[test]
    fn request_line_at_bound_is_accepted() {
        // 8000 octets including CRLF.
        let mut raw = b"GET ".to_vec();
        raw.extend(std::iter::repeat_n(b'a', MAX_REQUEST_LINE - 4 - 2));
        raw.extend_from_slice(b"\r\n\r\n");
        assert!(matches!(parse(&raw), RequestOutcome::Request(_)));
    }

    #[test]
    fn header_line_too_long() {
        let mut raw = b"OPTIONS * RTSP/1.0\r\nX: ".to_vec();
        raw.extend(std::iter::repeat_n(b'v', MAX_HEADER_LINE));
        raw.extend_from_slice(b"\r\n\r\n");
        match parse(&raw) {
            RequestOutcome::Invalid(err) => {
                assert_eq!(err.status, Status::HeaderFieldsTooLarge);
                assert_eq!(err.reason(), "Request header line too long");
            }
            other => panic!("expected 431, got {:?}", other),
        }
    }

    #[test]
    fn header_count_bound() {
        let mut raw = b"OPTIONS * RTSP/1.0\r\n".to_vec();
        for i in 0..MAX_HEADER_COUNT {
            raw.extend_from_slice(format!("H{}: v\r\n", i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let req = parse_ok(&raw);
        assert_eq!(req.headers.len(), MAX_HEADER_COUNT);

        let mut raw = b"OPTIONS * RTSP/1.0\r\n".to_vec();
        for i in 0..=MAX_HEADER_COUNT {
            raw.extend_from_slice(format!("H{}: v\r\n", i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        match parse(&raw) {
            RequestOutcome::Invalid(err) => {
                assert_eq!(err.status, Status::HeaderFieldsTooLarge);
                assert_eq!(err.reason(), "Request header too long");
            }
            other => panic!("expected 431, got {:?}", other),
        }
    }

    #[test]
    fn rtsp_requests_decode_utf8() {
        let mut raw = b"DESCRIBE /caf\xc3\xa9/ RTSP/1.0\r\n\r\n".to_vec();
        let req = parse_ok(&raw);
        assert_eq!(req.target, "/café/");

        // An invalid UTF-8 byte under the RTSP protocol token is a 400.
        raw = b"DESCRIBE /caf\xff/ RTSP/1.0\r\n\r\n".to_vec();
        match parse(&raw) {
            RequestOutcome::Invalid(err) => assert_eq!(err.status, Status::BadRequest),
            other => panic!("expected 400, got {:?}", other),
        }
    }

    #[test]
    fn non_rtsp_requests_decode_latin1() {
        let req = parse_ok(b"GET /caf\xe9 HTTP/1.1\r\n\r\n");
        assert_eq!(req.target, "/café");
        assert_eq!(req.protocol.as_deref(), Some("HTTP"));
    }

    #[test]
    fn blank_line_is_ignored() {
        assert!(matches!(parse(b"\r\n"), RequestOutcome::Empty));
    }

    #[test]
    fn eof_reported() {
        assert!(matches!(parse(b""), RequestOutcome::Eof));
    }

    #[test]
    fn header_without_colon_rejected() {
        match parse(b"OPTIONS * RTSP/1.0\r\nbogus line\r\n\r\n") {
            RequestOutcome::Invalid(err) => assert_eq!(err.status, Status::BadRequest),
            other => panic!("expected 400, got {:?}", other),
        }
    }

    #[test]
    fn path_segments_resolved() {
        assert_eq!(parse_path("/movie.mp4/0"), vec!["movie.mp4", "0"]);
        assert_eq!(parse_path("/movie.mp4/"), vec!["movie.mp4", ""]);
        assert_eq!(parse_path("/movie.mp4"), vec!["movie.mp4"]);
        assert_eq!(parse_path("/a/./b"), vec!["a", "b"]);
        assert_eq!(parse_path("/a/../b"), vec!["b"]);
        assert_eq!(parse_path("/a/.."), vec![""]);
        assert_eq!(parse_path("/"), vec![""]);
        assert_eq!(parse_path("/my%20movie.mp4/"), vec!["my movie.mp4", ""]);
    }

    #[test]
    fn dotdot_cannot_escape_root() {
        assert_eq!(parse_path("/../../etc/passwd"), vec!["etc", "passwd"]);
    }
}
