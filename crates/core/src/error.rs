//! Error types for the RTSP VOD server.

use std::process::ExitStatus;

/// Status codes used by the protocol layer, with their fixed reason phrases
/// (RFC 2326 §7.1.1 plus the RTSP-specific extensions of §11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    RequestLineTooLong,
    HeaderFieldsTooLarge,
    SessionNotFound,
    MethodNotValidInThisState,
    HeaderFieldNotValidForResource,
    AggregateOperationNotAllowed,
    OnlyAggregateOperationAllowed,
    UnsupportedTransport,
    InternalServerError,
    NotImplemented,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::MethodNotAllowed => 405,
            Status::RequestLineTooLong => 414,
            Status::HeaderFieldsTooLarge => 431,
            Status::SessionNotFound => 454,
            Status::MethodNotValidInThisState => 455,
            Status::HeaderFieldNotValidForResource => 456,
            Status::AggregateOperationNotAllowed => 459,
            Status::OnlyAggregateOperationAllowed => 460,
            Status::UnsupportedTransport => 461,
            Status::InternalServerError => 500,
            Status::NotImplemented => 501,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::RequestLineTooLong => "Request-URI Too Long",
            Status::HeaderFieldsTooLarge => "Request Header Fields Too Large",
            Status::SessionNotFound => "Session Not Found",
            Status::MethodNotValidInThisState => "Method Not Valid In This State",
            Status::HeaderFieldNotValidForResource => "Header Field Not Valid for Resource",
            Status::AggregateOperationNotAllowed => "Aggregate Operation Not Allowed",
            Status::OnlyAggregateOperationAllowed => "Only Aggregate Operation Allowed",
            Status::UnsupportedTransport => "Unsupported Transport",
            Status::InternalServerError => "Internal Server Error",
            Status::NotImplemented => "Not Implemented",
        }
    }

    /// Whether responses with this status must carry a contextual `Allow`
    /// header (405 per the specification, 455 recommended by it, 459/460 by
    /// analogy).
    pub fn requires_allow(self) -> bool {
        matches!(
            self,
            Status::MethodNotAllowed
                | Status::MethodNotValidInThisState
                | Status::AggregateOperationNotAllowed
                | Status::OnlyAggregateOperationAllowed
        )
    }
}

/// A structured protocol error: status plus an optional human-readable
/// message, rendered into the response's reason text.
///
/// Verb handlers return this instead of writing "not valid" responses
/// themselves; the dispatcher performs the single translate-and-send step.
#[derive(Debug)]
pub struct ErrorResponse {
    pub status: Status,
    pub message: Option<String>,
}

impl ErrorResponse {
    pub fn new(status: Status) -> Self {
        ErrorResponse {
            status,
            message: None,
        }
    }

    pub fn with_message(status: Status, message: impl Into<String>) -> Self {
        ErrorResponse {
            status,
            message: Some(message.into()),
        }
    }

    /// The reason text for the status line: the attached message, or the
    /// status's canonical phrase.
    pub fn reason(&self) -> &str {
        self.message.as_deref().unwrap_or(self.status.reason())
    }
}

/// Errors that can occur below the protocol layer.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Io`](Self::Io) — socket/process I/O failures.
/// - **Media**: [`ProbeFailed`](Self::ProbeFailed),
///   [`Metadata`](Self::Metadata), [`DescribeFailed`](Self::DescribeFailed),
///   [`TruncatedDescription`](Self::TruncatedDescription) — the external
///   probe/transcode tools misbehaving.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The probe tool exited with a failure status.
    #[error("probe tool failed ({0})")]
    ProbeFailed(ExitStatus),

    /// The probe tool's JSON output was missing or malformed.
    #[error("unreadable probe metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    /// The transcoder exited with a failure status while describing a resource.
    #[error("transcoder failed generating a description ({0})")]
    DescribeFailed(ExitStatus),

    /// The transcoder's description ended without its terminating blank line.
    #[error("transcoder description ended prematurely")]
    TruncatedDescription,
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
