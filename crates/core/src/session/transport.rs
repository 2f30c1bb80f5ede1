//! Transport negotiation and delivery bindings (RFC 2326 §12.39).
//!
//! SETUP offers one or more transport alternatives; the first supported one
//! wins. Two are supported:
//!
//! ```text
//! Client → Server:  Transport: RTP/AVP;unicast;client_port=5000-5001
//! Server → Client:  Transport: RTP/AVP/UDP;unicast;destination=10.0.0.5;client_port=5000-5001
//!
//! Client → Server:  Transport: RTP/AVP/TCP;interleaved=0-1
//! Server → Client:  Transport: RTP/AVP/TCP;interleaved=0-1
//! ```
//!
//! A UDP transport is just an address: the transcoder sends straight to the
//! client. An interleaved transport owns a pair of loopback UDP sockets the
//! transcoder sends to, registered with the selector as relays that frame
//! each datagram onto the control connection.

use std::net::{IpAddr, Ipv4Addr, TcpStream, UdpSocket};

use crate::error::{ErrorResponse, Status};
use crate::media::RtpTarget;
use crate::reactor::{Reactor, Token};

/// One validated alternative from a `Transport` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportChoice {
    Udp { client_port: u16 },
    Interleaved { channel: u8 },
}

/// Pick the first supported alternative among every `Transport` header
/// occurrence, each possibly carrying comma-separated alternatives.
///
/// When nothing is usable the 461 carries the one parse failure if there was
/// exactly one, and a generic message otherwise.
pub fn negotiate<'a>(
    values: impl Iterator<Item = &'a str>,
) -> Result<TransportChoice, ErrorResponse> {
    let mut error: Option<String> = None;
    let mut single_error = false;
    for alternative in values.flat_map(|value| value.split(',')) {
        match parse_alternative(alternative.trim()) {
            Ok(choice) => return Ok(choice),
            Err(reason) => {
                single_error = error.is_none();
                error = Some(reason);
            }
        }
    }
    let message = match error {
        Some(message) if single_error => message,
        _ => "No supported unicast UDP or interleaved transport given".to_string(),
    };
    Err(ErrorResponse::with_message(
        Status::UnsupportedTransport,
        message,
    ))
}

fn parse_alternative(alternative: &str) -> Result<TransportChoice, String> {
    let mut parts = alternative.split(';').map(str::trim);

    let protocol = parts.next().unwrap_or("");
    let mut protocol = protocol.split('/');
    let transport = protocol.next().unwrap_or("");
    let profile = protocol.next().unwrap_or("AVP");
    if !transport.eq_ignore_ascii_case("RTP") || !profile.eq_ignore_ascii_case("AVP") {
        return Err("Only RTP/AVP supported".to_string());
    }
    let lower = protocol.next();

    let mut unicast = false;
    let mut client_port: Option<u16> = None;
    let mut channel: Option<u8> = None;
    let mut modes: Option<String> = None;
    for parameter in parts {
        let (key, value) = match parameter.split_once('=') {
            Some((key, value)) => (key.trim(), unquote(value.trim())),
            None => (parameter, ""),
        };
        if key.eq_ignore_ascii_case("unicast") {
            unicast = true;
        } else if key.eq_ignore_ascii_case("client_port") {
            client_port = Some(parse_pair(value, "Pair of ports required for RTP and RTCP")?);
        } else if key.eq_ignore_ascii_case("interleaved") {
            let pair = parse_pair(value, "Pair of channels required for RTP and RTCP")?;
            channel = Some(
                u8::try_from(pair)
                    .ok()
                    .filter(|&c| c < u8::MAX)
                    .ok_or_else(|| "Pair of channels required for RTP and RTCP".to_string())?,
            );
        } else if key.eq_ignore_ascii_case("mode") {
            modes = Some(value.to_string());
        }
        // Other parameters (destination, ttl, ...) are ignored.
    }

    if let Some(modes) = modes {
        let play_only = modes
            .split(',')
            .all(|mode| unquote(mode.trim()).eq_ignore_ascii_case("PLAY"));
        if !play_only {
            return Err(r#"Only mode="PLAY" supported"#.to_string());
        }
    }

    if let Some(channel) = channel {
        return Ok(TransportChoice::Interleaved { channel });
    }

    let udp = lower.is_none_or(|lower| lower.eq_ignore_ascii_case("UDP"));
    if udp && unicast {
        let client_port =
            client_port.ok_or_else(|| r#"UDP transport missing "client_port" parameter"#.to_string())?;
        return Ok(TransportChoice::Udp { client_port });
    }

    Err("Only unicast UDP and interleaved transports supported".to_string())
}

/// Parse `base[-end]`, requiring `end >= base + 1` when given. The base must
/// leave room for the implicit RTCP sibling at `base + 1`.
fn parse_pair(value: &str, pair_message: &str) -> Result<u16, String> {
    let (base, end) = value.split_once('-').unwrap_or((value, ""));
    let base: u16 = base
        .trim()
        .parse()
        .map_err(|err| format!("Bad port value {:?}: {}", base, err))?;
    if base == u16::MAX {
        return Err(pair_message.to_string());
    }
    if !end.is_empty() {
        let end: u16 = end
            .trim()
            .parse()
            .map_err(|err| format!("Bad port value {:?}: {}", end, err))?;
        if end < base.saturating_add(1) {
            return Err(pair_message.to_string());
        }
    }
    Ok(base)
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// The negotiated delivery binding for one elementary stream.
///
/// Once attached to a session's stream slot it never changes until that
/// stream's TEARDOWN releases the slot.
pub enum Transport {
    Udp(UdpTransport),
    Interleaved(InterleavedTransport),
}

/// Raw UDP unicast to the client's own ports.
pub struct UdpTransport {
    pub destination: IpAddr,
    pub rtp_port: u16,
}

/// RTP/RTCP relayed onto the control connection as `$`-framed channels.
pub struct InterleavedTransport {
    pub channel: u8,
    owner: Token,
    sink: TcpStream,
    relays: Option<(Token, Token)>,
}

impl InterleavedTransport {
    /// `sink` is a write handle to the control connection the SETUP arrived
    /// on; frames go there no matter which connection later sends PLAY.
    pub fn new(channel: u8, owner: Token, sink: TcpStream) -> Self {
        InterleavedTransport {
            channel,
            owner,
            sink,
            relays: None,
        }
    }
}

impl Transport {
    /// The negotiated `Transport` response header value.
    pub fn header(&self) -> String {
        match self {
            Transport::Udp(udp) => format!(
                "RTP/AVP/UDP;unicast;destination={};client_port={}-{}",
                udp.destination,
                udp.rtp_port,
                udp.rtp_port + 1
            ),
            Transport::Interleaved(interleaved) => format!(
                "RTP/AVP/TCP;interleaved={}-{}",
                interleaved.channel,
                interleaved.channel + 1
            ),
        }
    }

    /// Prepare delivery and return where the transcoder should send.
    ///
    /// UDP transports are pure addressing. Interleaved transports bind their
    /// loopback relay sockets and register them with the selector.
    pub fn start(&mut self, reactor: &mut Reactor) -> std::io::Result<RtpTarget> {
        match self {
            Transport::Udp(udp) => Ok(RtpTarget {
                host: udp.destination,
                rtp_port: udp.rtp_port,
                rtcp_port: udp.rtp_port + 1,
            }),
            Transport::Interleaved(interleaved) => {
                let rtp_socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
                let rtcp_socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
                let rtp_port = rtp_socket.local_addr()?.port();
                let rtcp_port = rtcp_socket.local_addr()?.port();

                let rtp_token = reactor.register_relay(
                    rtp_socket,
                    interleaved.channel,
                    interleaved.sink.try_clone()?,
                    interleaved.owner,
                )?;
                let rtcp_token = match reactor.register_relay(
                    rtcp_socket,
                    interleaved.channel + 1,
                    interleaved.sink.try_clone()?,
                    interleaved.owner,
                ) {
                    Ok(token) => token,
                    Err(error) => {
                        reactor.deregister(rtp_token);
                        return Err(error);
                    }
                };
                interleaved.relays = Some((rtp_token, rtcp_token));
                Ok(RtpTarget {
                    host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    rtp_port,
                    rtcp_port,
                })
            }
        }
    }

    /// Release delivery resources; idempotent.
    pub fn stop(&mut self, reactor: &mut Reactor) {
        if let Transport::Interleaved(interleaved) = self
            && let Some((rtp, rtcp)) = interleaved.relays.take()
        {
            reactor.deregister(rtp);
            reactor.deregister(rtcp);
        }
    }

    /// The connection owning this transport's relays, for interleaved
    /// transports only.
    pub fn interleaved_owner(&self) -> Option<Token> {
        match self {
            Transport::Interleaved(interleaved) => Some(interleaved.owner),
            Transport::Udp(_) => None,
        }
    }
}
