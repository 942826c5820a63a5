// Peer connection state machine
// Drives one replication connection through the mutual-challenge
// handshake, the one-shot data exchange, and teardown. Each invocation of
// handle_connection consumes whatever frames are buffered and returns;
// the machine itself never blocks.

use std::io;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::crypto::SharedKey;
use crate::error::{Error, Result};
use crate::net::framing::{extract, wrap, Extract, Tag};
use crate::net::socket::Socket;
use crate::skews::NodeId;

/// Length of the random challenge each side must return encrypted.
pub const CHAL_LEN: usize = 64;

const READ_CHUNK: usize = 1024;

/// Connection lifecycle states. The client walks Connecting, Auth2,
/// Auth4, DataTx, WaitAck, Idle; the server walks Connected, Auth3,
/// DataRx, HasData.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    Auth2,
    Auth3,
    Auth4,
    DataTx,
    DataRx,
    WaitAck,
    HasData,
}

impl ConnState {
    /// Which frame this state awaits: (tag, whether a closer is expected).
    /// None means the state consumes no frames.
    fn expected(self) -> Option<(Tag, bool)> {
        match self {
            ConnState::Connected | ConnState::DataTx => Some((Tag::Sid, true)),
            ConnState::DataRx => Some((Tag::Rep, true)),
            ConnState::WaitAck => Some((Tag::Ack, false)),
            ConnState::Auth2 | ConnState::Auth3 | ConnState::Auth4 => Some((Tag::Auth, true)),
            ConnState::Idle | ConnState::Connecting | ConnState::HasData => None,
        }
    }
}

/// One replication connection, client or server role.
pub struct PeerConn<S: Socket> {
    socket: S,
    state: ConnState,
    node_id: NodeId,
    peer_id: Option<NodeId>,
    key: Arc<SharedKey>,
    challenge: [u8; CHAL_LEN],
    recv_buf: Vec<u8>,
    /// Client role: the prepared `<REP>`-wrapped payload to transmit
    outgoing: Vec<u8>,
    /// Server role: the payload received, pending pickup by the owner
    received: Option<Vec<u8>>,
    last_error: Option<Error>,
}

impl<S: Socket> PeerConn<S> {
    /// Initiator side. `payload` is the raw replication buffer; it is
    /// wrapped here and sent once the handshake completes.
    pub fn client(socket: S, node_id: NodeId, key: Arc<SharedKey>, payload: &[u8]) -> Self {
        PeerConn {
            socket,
            state: ConnState::Connecting,
            node_id,
            peer_id: None,
            key,
            challenge: [0u8; CHAL_LEN],
            recv_buf: Vec::new(),
            outgoing: wrap(payload, Tag::Rep),
            received: None,
            last_error: None,
        }
    }

    /// Acceptor side.
    pub fn server(socket: S, node_id: NodeId, key: Arc<SharedKey>) -> Self {
        PeerConn {
            socket,
            state: ConnState::Connected,
            node_id,
            peer_id: None,
            key,
            challenge: [0u8; CHAL_LEN],
            recv_buf: Vec::new(),
            outgoing: Vec::new(),
            received: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Peer node id learned from its `<SID>` frame.
    pub fn peer_id(&self) -> Option<NodeId> {
        self.peer_id
    }

    /// The error that tore this connection down, if any.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// True once this connection needs no further socket events: torn
    /// down, or holding data for the owner.
    pub fn is_settled(&self) -> bool {
        matches!(self.state, ConnState::Idle | ConnState::HasData)
    }

    /// Drain the received replication payload (server role, HasData).
    pub fn take_received(&mut self) -> Option<Vec<u8>> {
        self.received.take()
    }

    /// Close the descriptor and mark the connection Idle. Safe to call in
    /// any state.
    pub fn disconnect(&mut self) {
        self.socket.close();
        self.state = ConnState::Idle;
    }

    /// Process everything currently available on the socket. Errors tear
    /// the connection down and are recorded, never propagated.
    pub fn handle_connection(&mut self) {
        if matches!(self.state, ConnState::Idle) {
            return;
        }
        if let Err(e) = self.pump() {
            match e {
                Error::AuthFailure => warn!(peer = ?self.peer_id, "authentication failed, disconnecting"),
                ref e => warn!(peer = ?self.peer_id, error = %e, "connection error, disconnecting"),
            }
            self.last_error = Some(e);
            self.disconnect();
        }
    }

    fn pump(&mut self) -> Result<()> {
        // The client's first leg awaits no frame: announce ourselves
        if matches!(self.state, ConnState::Connecting) {
            self.send_sid()?;
            self.state = ConnState::Auth2;
        }

        let saw_eof = self.fill_recv_buf()?;

        while let Some((tag, has_closer)) = self.state.expected() {
            match extract(&mut self.recv_buf, tag, has_closer)? {
                Extract::NotReady => break,
                Extract::OpenerOnly => self.dispatch(Vec::new())?,
                Extract::Frame(payload) => self.dispatch(payload)?,
            }
        }

        if saw_eof && !matches!(self.state, ConnState::Idle | ConnState::HasData) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed connection mid-exchange",
            )));
        }
        Ok(())
    }

    /// Pull everything the socket has into the receive buffer. Returns
    /// true when the peer has closed.
    fn fill_recv_buf(&mut self) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.socket.read_into(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.recv_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn dispatch(&mut self, payload: Vec<u8>) -> Result<()> {
        match self.state {
            ConnState::Connected => self.on_peer_sid_server(payload),
            ConnState::Auth2 => self.on_challenge(payload),
            ConnState::Auth3 => self.on_auth_response(payload),
            ConnState::Auth4 => self.on_challenge_echo(payload),
            ConnState::DataTx => self.on_peer_sid_client(payload),
            ConnState::DataRx => self.on_replication_data(payload),
            ConnState::WaitAck => {
                debug!(peer = ?self.peer_id, "replication acknowledged");
                self.disconnect();
                Ok(())
            }
            ConnState::Idle | ConnState::Connecting | ConnState::HasData => Ok(()),
        }
    }

    fn send_sid(&mut self) -> Result<()> {
        let frame = wrap(self.node_id.to_string().as_bytes(), Tag::Sid);
        self.socket.write_all(&frame)?;
        Ok(())
    }

    fn parse_peer_id(payload: &[u8]) -> Result<NodeId> {
        std::str::from_utf8(payload)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| Error::Protocol("unparseable peer node identifier".into()))
    }

    /// Server: the client identified itself; issue our challenge.
    fn on_peer_sid_server(&mut self, payload: Vec<u8>) -> Result<()> {
        self.peer_id = Some(Self::parse_peer_id(&payload)?);
        OsRng.fill_bytes(&mut self.challenge);
        let frame = wrap(&self.challenge, Tag::Auth);
        self.socket.write_all(&frame)?;
        self.state = ConnState::Auth3;
        Ok(())
    }

    /// Client: answer the server's challenge and pose our own.
    fn on_challenge(&mut self, payload: Vec<u8>) -> Result<()> {
        if payload.len() != CHAL_LEN {
            return Err(Error::Protocol(format!(
                "challenge of {} bytes, expected {}",
                payload.len(),
                CHAL_LEN
            )));
        }
        let echoed = self.key.encrypt(&payload);
        OsRng.fill_bytes(&mut self.challenge);

        let mut body = Vec::with_capacity(CHAL_LEN + echoed.len());
        body.extend_from_slice(&self.challenge);
        body.extend_from_slice(&echoed);
        let frame = wrap(&body, Tag::Auth);
        self.socket.write_all(&frame)?;
        self.state = ConnState::Auth4;
        Ok(())
    }

    /// Server: verify the echoed challenge proves key possession, then
    /// answer the client's challenge and identify ourselves.
    fn on_auth_response(&mut self, payload: Vec<u8>) -> Result<()> {
        if payload.len() < CHAL_LEN {
            return Err(Error::Protocol(format!(
                "auth response of {} bytes is shorter than a challenge",
                payload.len()
            )));
        }
        let (peer_challenge, echoed) = payload.split_at(CHAL_LEN);
        let recovered = self.key.decrypt(echoed)?;
        if !bool::from(recovered.as_slice().ct_eq(&self.challenge)) {
            return Err(Error::AuthFailure);
        }

        let answer = self.key.encrypt(peer_challenge);
        let frame = wrap(&answer, Tag::Auth);
        self.socket.write_all(&frame)?;
        self.send_sid()?;
        self.state = ConnState::DataRx;
        Ok(())
    }

    /// Client: verify the server echoed our challenge back.
    fn on_challenge_echo(&mut self, payload: Vec<u8>) -> Result<()> {
        let recovered = self.key.decrypt(&payload)?;
        if !bool::from(recovered.as_slice().ct_eq(&self.challenge)) {
            return Err(Error::AuthFailure);
        }
        self.state = ConnState::DataTx;
        Ok(())
    }

    /// Client: the server identified itself; ship the replication data.
    fn on_peer_sid_client(&mut self, payload: Vec<u8>) -> Result<()> {
        self.peer_id = Some(Self::parse_peer_id(&payload)?);
        let frame = std::mem::take(&mut self.outgoing);
        self.socket.write_all(&frame)?;
        info!(peer = ?self.peer_id, bytes = frame.len(), "authenticated, replication data sent");
        self.state = ConnState::WaitAck;
        Ok(())
    }

    /// Server: stash the payload for the owner and acknowledge.
    fn on_replication_data(&mut self, payload: Vec<u8>) -> Result<()> {
        info!(peer = ?self.peer_id, bytes = payload.len(), "replication data received");
        self.received = Some(payload);
        self.socket.write_all(Tag::Ack.opener())?;
        self.state = ConnState::HasData;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::MemorySocket;

    fn pump_both<A: Socket, B: Socket>(client: &mut PeerConn<A>, server: &mut PeerConn<B>) {
        for _ in 0..8 {
            client.handle_connection();
            server.handle_connection();
        }
    }

    #[test]
    fn test_handshake_success() {
        let key = Arc::new(SharedKey::generate());
        let (client_sock, server_sock) = MemorySocket::pair();

        let mut client = PeerConn::client(client_sock, 7, key.clone(), b"replication bytes");
        let mut server = PeerConn::server(server_sock, 3, key);

        pump_both(&mut client, &mut server);

        assert_eq!(client.state(), ConnState::Idle);
        assert!(client.last_error().is_none());
        assert_eq!(client.peer_id(), Some(3));

        assert_eq!(server.state(), ConnState::HasData);
        assert!(server.last_error().is_none());
        assert_eq!(server.peer_id(), Some(7));
        assert_eq!(server.take_received().unwrap(), b"replication bytes");
    }

    #[test]
    fn test_handshake_wrong_key_fails_auth() {
        let server_key = Arc::new(SharedKey::generate());
        let client_key = Arc::new(SharedKey::generate());
        let (client_sock, server_sock) = MemorySocket::pair();

        let mut client = PeerConn::client(client_sock, 7, client_key, b"data");
        let mut server = PeerConn::server(server_sock, 3, server_key);

        pump_both(&mut client, &mut server);

        assert_eq!(server.state(), ConnState::Idle);
        assert!(matches!(server.last_error(), Some(Error::AuthFailure)));
        assert!(server.take_received().is_none());

        // The client observes the teardown rather than completing
        assert_eq!(client.state(), ConnState::Idle);
        assert!(client.last_error().is_some());
    }

    #[test]
    fn test_client_rejects_bad_challenge_echo() {
        let key = Arc::new(SharedKey::generate());
        let (mut fake_server, client_sock) = MemorySocket::pair();

        let mut client = PeerConn::client(client_sock, 7, key.clone(), b"data");
        client.handle_connection(); // sends SID, enters Auth2

        // Pose as the server with a challenge, then echo garbage back
        fake_server.write_all(&wrap(&[0u8; CHAL_LEN], Tag::Auth)).unwrap();
        client.handle_connection(); // answers, enters Auth4

        let garbage = key.encrypt(&[0xABu8; CHAL_LEN]);
        fake_server.write_all(&wrap(&garbage, Tag::Auth)).unwrap();
        client.handle_connection();

        assert_eq!(client.state(), ConnState::Idle);
        assert!(matches!(client.last_error(), Some(Error::AuthFailure)));
    }

    #[test]
    fn test_server_rejects_garbage_sid() {
        let key = Arc::new(SharedKey::generate());
        let (mut fake_client, server_sock) = MemorySocket::pair();
        let mut server = PeerConn::server(server_sock, 3, key);

        fake_client.write_all(&wrap(b"not-a-number", Tag::Sid)).unwrap();
        server.handle_connection();

        assert_eq!(server.state(), ConnState::Idle);
        assert!(matches!(server.last_error(), Some(Error::Protocol(_))));
    }

    #[test]
    fn test_fragmented_delivery_completes() {
        let key = Arc::new(SharedKey::generate());
        let (mut fake_client, server_sock) = MemorySocket::pair();
        let mut server = PeerConn::server(server_sock, 3, key);

        // Deliver the SID frame in three pieces; the server should sit in
        // Connected until the closer lands
        fake_client.write_all(b"<SI").unwrap();
        server.handle_connection();
        assert_eq!(server.state(), ConnState::Connected);

        fake_client.write_all(b"D>42</S").unwrap();
        server.handle_connection();
        assert_eq!(server.state(), ConnState::Connected);

        fake_client.write_all(b"ID>").unwrap();
        server.handle_connection();
        assert_eq!(server.state(), ConnState::Auth3);
        assert_eq!(server.peer_id(), Some(42));
    }

    #[test]
    fn test_disconnect_mid_handshake_reports_eof() {
        let key = Arc::new(SharedKey::generate());
        let (client_sock, server_sock) = MemorySocket::pair();

        let mut client = PeerConn::client(client_sock, 7, key.clone(), b"data");
        let mut server = PeerConn::server(server_sock, 3, key);

        client.handle_connection();
        server.handle_connection(); // server now in Auth3, challenge issued
        client.disconnect();

        server.handle_connection();
        assert_eq!(server.state(), ConnState::Idle);
        assert!(matches!(server.last_error(), Some(Error::Io(_))));
    }
}
