//! Response construction and serialization (RFC 2326 §7).
//!
//! Builder pattern: chain [`header`](Response::header) /
//! [`body`](Response::body), then hand the finished value to the connection
//! for writing. `Content-Length` is computed at serialization when a body is
//! present, and serialization consumes the builder — nothing can append a
//! header once the terminal blank line exists.

use crate::error::{ErrorResponse, Status};

/// Server identification string included in every response (RFC 2326 §12.36).
pub const SERVER_AGENT: &str = "rtsp-vod/0.1";

/// An RTSP response under construction.
///
/// The status line's reason text defaults to the status's canonical phrase;
/// protocol messages ("Session created", "Already paused", ...) override it,
/// which is how this server reports informational outcomes.
#[must_use]
pub struct Response {
    pub status: Status,
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Response {
            status,
            reason: None,
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    /// 200 OK.
    pub fn ok() -> Self {
        Self::new(Status::Ok)
    }

    /// A response with a custom reason text in the status line.
    pub fn with_reason(status: Status, reason: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.reason = Some(reason.into());
        response
    }

    /// Render a structured protocol error as a response.
    pub fn from_error(error: &ErrorResponse) -> Self {
        match &error.message {
            Some(message) => Self::with_reason(error.status, message.clone()),
            None => Self::new(error.status),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn push_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Attach an entity body with its media type.
    pub fn body(mut self, content_type: &str, data: Vec<u8>) -> Self {
        self.headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        self.body = Some(data);
        self
    }

    /// Serialize to the wire format, consuming the builder.
    ///
    /// `Content-Length` is appended automatically when a body is present
    /// (RFC 2326 §12.14).
    pub fn serialize(self) -> Vec<u8> {
        let reason = self
            .reason
            .as_deref()
            .unwrap_or_else(|| self.status.reason());
        let mut out = format!("RTSP/1.0 {} {}\r\n", self.status.code(), reason).into_bytes();

        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        if let Some(body) = &self.body {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(body);
        } else {
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}
