//! Single-threaded readiness selector.
//!
//! Every socket the server watches — the listener, control connections, and
//! the per-session UDP relay sockets — is registered here and dispatched on
//! read-readiness by the server's poll loop. Registration returns an opaque
//! [`Token`]; deregistration and teardown go through tokens, never through
//! object identity.
//!
//! The selector itself is a registry. Readiness probing and dispatch live
//! with the poll loop in [`crate::server`], except for relays, whose single
//! unit of work (receive one datagram, frame it onto the control connection)
//! is self-contained.

use std::collections::HashMap;
use std::io::Write;
use std::net::{TcpListener, TcpStream, UdpSocket};

use crate::server::Connection;

/// Handle to a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(usize);

impl Token {
    pub(crate) fn from_raw(index: usize) -> Self {
        Token(index)
    }
}

/// The closed set of source kinds the selector watches.
pub(crate) enum Source {
    Listener(TcpListener),
    Connection(Box<Connection>),
    Relay(Relay),
}

/// An ephemeral UDP socket relaying transcoder output onto a control
/// connection as one interleaved channel.
pub(crate) struct Relay {
    socket: UdpSocket,
    channel: u8,
    sink: TcpStream,
    pub(crate) owner: Token,
    buffer: Vec<u8>,
}

impl Relay {
    /// Forward one pending datagram, framed as
    /// `[b'$'][channel][2-byte BE length][payload]`.
    ///
    /// Returns `Ok(false)` when no datagram is pending. Write errors mean
    /// the control connection is gone and the relay should be dropped.
    pub(crate) fn forward_one(&mut self) -> std::io::Result<bool> {
        let len = match self.socket.recv(&mut self.buffer) {
            Ok(len) => len,
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(error) => return Err(error),
        };

        let header = [b'$', self.channel, (len >> 8) as u8, len as u8];
        // The control socket is non-blocking while idle; a frame write takes
        // the same bounded blocking discipline as a request unit.
        self.sink.set_nonblocking(false)?;
        let result = self
            .sink
            .write_all(&header)
            .and_then(|()| self.sink.write_all(&self.buffer[..len]))
            .and_then(|()| self.sink.flush());
        self.sink.set_nonblocking(true)?;
        result?;
        Ok(true)
    }
}

/// Registry of readiness sources.
#[derive(Default)]
pub struct Reactor {
    slots: Vec<Option<Source>>,
    /// Relay tokens per owning connection, for teardown on close.
    owners: HashMap<Token, Vec<Token>>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot so a source can learn its own token before insertion.
    pub(crate) fn reserve(&mut self) -> Token {
        self.slots.push(None);
        Token(self.slots.len() - 1)
    }

    pub(crate) fn fill(&mut self, token: Token, source: Source) {
        self.slots[token.0] = Some(source);
    }

    pub(crate) fn register(&mut self, source: Source) -> Token {
        let token = self.reserve();
        self.fill(token, source);
        token
    }

    /// Register a relay socket for one interleaved channel.
    pub(crate) fn register_relay(
        &mut self,
        socket: UdpSocket,
        channel: u8,
        sink: TcpStream,
        owner: Token,
    ) -> std::io::Result<Token> {
        socket.set_nonblocking(true)?;
        let token = self.register(Source::Relay(Relay {
            socket,
            channel,
            sink,
            owner,
            buffer: vec![0u8; 65535],
        }));
        self.owners.entry(owner).or_default().push(token);
        tracing::debug!(?token, channel, ?owner, "relay registered");
        Ok(token)
    }

    /// Remove a source for good, dropping (and thereby closing) its socket.
    pub(crate) fn deregister(&mut self, token: Token) -> Option<Source> {
        let source = self.slots.get_mut(token.0)?.take();
        if let Some(Source::Relay(relay)) = &source {
            self.forget_owner(relay.owner, token);
            tracing::debug!(?token, "relay deregistered");
        }
        source
    }

    /// Drop every relay a closing connection owns. Called before the
    /// connection itself is removed so no registration leaks.
    pub(crate) fn deregister_relays_owned_by(&mut self, owner: Token) {
        if let Some(tokens) = self.owners.remove(&owner) {
            for token in tokens {
                if let Some(slot) = self.slots.get_mut(token.0) {
                    slot.take();
                }
            }
        }
    }

    /// Forget a relay whose slot was already vacated by [`take`](Self::take).
    pub(crate) fn discard_relay(&mut self, token: Token, owner: Token) {
        self.forget_owner(owner, token);
    }

    fn forget_owner(&mut self, owner: Token, token: Token) {
        if let Some(tokens) = self.owners.get_mut(&owner) {
            tokens.retain(|t| *t != token);
            if tokens.is_empty() {
                self.owners.remove(&owner);
            }
        }
    }

    /// Take a source out for dispatch; pair with [`restore`](Self::restore)
    /// unless the source is closing.
    pub(crate) fn take(&mut self, token: Token) -> Option<Source> {
        self.slots.get_mut(token.0)?.take()
    }

    pub(crate) fn restore(&mut self, token: Token, source: Source) {
        self.slots[token.0] = Some(source);
    }

    /// Snapshot of the currently occupied tokens.
    pub(crate) fn tokens(&self) -> Vec<Token> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| Token(index))
            .collect()
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::Ipv4Addr;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn relay_frames_datagrams_onto_the_sink() {
        let (mut client, server) = tcp_pair();
        let mut reactor = Reactor::new();
        let owner = reactor.reserve();

        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let relay_addr = socket.local_addr().unwrap();
        let token = reactor.register_relay(socket, 2, server, owner).unwrap();

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sender.send_to(b"rtp-payload", relay_addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let Some(Source::Relay(mut relay)) = reactor.take(token) else {
            panic!("relay not registered");
        };
        assert!(relay.forward_one().unwrap());
        assert!(!relay.forward_one().unwrap());
        reactor.restore(token, Source::Relay(relay));

        let mut frame = [0u8; 15];
        client.read_exact(&mut frame).unwrap();
        assert_eq!(&frame[..4], &[b'$', 2, 0, 11]);
        assert_eq!(&frame[4..], b"rtp-payload");
    }

    #[test]
    fn owned_relays_are_swept_on_close() {
        let (_client, server) = tcp_pair();
        let mut reactor = Reactor::new();
        let owner = reactor.reserve();

        for channel in [0u8, 1] {
            let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            reactor
                .register_relay(socket, channel, server.try_clone().unwrap(), owner)
                .unwrap();
        }
        assert_eq!(reactor.len(), 2);

        reactor.deregister_relays_owned_by(owner);
        assert!(reactor.is_empty());
        assert!(reactor.owners.is_empty());
    }

    #[test]
    fn deregister_updates_owner_index() {
        let (_client, server) = tcp_pair();
        let mut reactor = Reactor::new();
        let owner = reactor.reserve();

        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let token = reactor.register_relay(socket, 0, server, owner).unwrap();
        assert!(reactor.deregister(token).is_some());
        assert!(reactor.owners.is_empty());
        assert!(reactor.deregister(token).is_none());
    }
}
