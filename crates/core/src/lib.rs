//! RTSP VOD control-plane server.
//!
//! Negotiates playback sessions against local media resources, hands
//! transcoding to an external subprocess, and relays the elementary streams
//! as UDP unicast or interleaved onto the control connection — all from a
//! single cooperatively scheduled thread.

pub mod error;
pub mod media;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod session;

pub use error::{ErrorResponse, Result, RtspError, Status};
pub use server::{Server, ServerConfig};
