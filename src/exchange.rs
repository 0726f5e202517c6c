//! TCP side channel for bootstrap.
//!
//! One stream is established per session and kept open for both exchange
//! rounds and the readiness barrier, so the only address configuration needed
//! is a single port. Both ends send their own record before reading the
//! peer's, which keeps the protocol deadlock-free no matter which side wins
//! the connect/accept race.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use log::debug;

use crate::endpoint::{EndpointInfo, WIRE_LEN};

/// Default TCP port for the bootstrap channel.
pub const DEFAULT_PORT: u16 = 28515;

const READY_BYTE: u8 = 0x52;

/// Error returned by [`ExchangeChannel`] operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExchangeError {
    #[error("failed to connect to responder at {addr}")]
    Connect { addr: String, source: io::Error },
    #[error("failed to accept initiator on port {port}")]
    Accept { port: u16, source: io::Error },
    #[error("failed to send record to peer")]
    Send(#[source] io::Error),
    #[error("failed to receive record from peer")]
    Receive(#[source] io::Error),
    #[error("readiness barrier failed")]
    Barrier(#[source] io::Error),
    #[error("peer sent unexpected barrier byte {0:#04x}")]
    BadBarrier(u8),
}

/// A connected bootstrap channel to the peer.
///
/// Used for exactly two record exchanges plus one readiness barrier, then
/// dropped; the stream closes with it.
#[derive(Debug)]
pub struct ExchangeChannel {
    stream: TcpStream,
    peer: SocketAddr,
}

impl ExchangeChannel {
    /// Connect to a responder listening at `addr` (initiator side).
    pub fn connect(addr: &str) -> Result<Self, ExchangeError> {
        let stream = TcpStream::connect(addr).map_err(|source| ExchangeError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        Self::from_stream(stream)
    }

    /// Block until one initiator connects on `port` (responder side). The
    /// listener is closed right after the first accept, one session per run.
    pub fn accept(port: u16) -> Result<Self, ExchangeError> {
        let listener =
            TcpListener::bind(("0.0.0.0", port)).map_err(|source| ExchangeError::Accept { port, source })?;
        let (stream, _) = listener
            .accept()
            .map_err(|source| ExchangeError::Accept { port, source })?;
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> Result<Self, ExchangeError> {
        // The records are tiny and latency-sensitive, do not batch them.
        stream.set_nodelay(true).map_err(ExchangeError::Send)?;
        let peer = stream.peer_addr().map_err(ExchangeError::Send)?;
        debug!("bootstrap channel established with {peer}");
        Ok(ExchangeChannel { stream, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send `local` and read the peer's record back. Send-then-receive on both
    /// ends, so the call is symmetric.
    pub fn exchange(&mut self, local: &EndpointInfo) -> Result<EndpointInfo, ExchangeError> {
        self.stream.write_all(&local.to_wire()).map_err(ExchangeError::Send)?;

        let mut buf = [0u8; WIRE_LEN];
        self.stream.read_exact(&mut buf).map_err(ExchangeError::Receive)?;

        let remote = EndpointInfo::from_wire(&buf);
        debug!("exchanged records with {}: remote {remote}", self.peer);
        Ok(remote)
    }

    /// One-byte barrier: tell the peer this side is ready and block until the
    /// peer says the same. Replaces timing assumptions between the exchange
    /// rounds and the first data-path operation.
    pub fn ready(&mut self) -> Result<(), ExchangeError> {
        self.stream.write_all(&[READY_BYTE]).map_err(ExchangeError::Barrier)?;

        let mut byte = [0u8; 1];
        self.stream.read_exact(&mut byte).map_err(ExchangeError::Barrier)?;
        if byte[0] != READY_BYTE {
            return Err(ExchangeError::BadBarrier(byte[0]));
        }

        debug!("readiness barrier passed with {}", self.peer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn free_port() -> u16 {
        // Bind to an ephemeral port, then release it for the test to reuse.
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_exchange_and_barrier_over_loopback() {
        let port = free_port();

        let responder_info = EndpointInfo {
            lid: 7,
            qp_number: 0x100,
            packet_seq: 0xaaa,
            buf_addr: 0xdead_0000,
            buf_rkey: 0x42,
            ..Default::default()
        };
        let initiator_info = EndpointInfo {
            lid: 9,
            qp_number: 0x200,
            packet_seq: 0xbbb,
            ..Default::default()
        };

        let responder = thread::spawn(move || {
            let mut chan = ExchangeChannel::accept(port).unwrap();
            let remote = chan.exchange(&responder_info).unwrap();
            chan.ready().unwrap();
            remote
        });

        // Retry the connect until the listener is up.
        let addr = format!("127.0.0.1:{port}");
        let mut chan = loop {
            match ExchangeChannel::connect(&addr) {
                Ok(chan) => break chan,
                Err(_) => thread::yield_now(),
            }
        };
        let remote = chan.exchange(&initiator_info).unwrap();
        chan.ready().unwrap();

        assert_eq!(remote, responder_info);
        assert_eq!(responder.join().unwrap(), initiator_info);
    }

    #[test]
    fn test_connect_refused() {
        let port = free_port();
        let err = ExchangeChannel::connect(&format!("127.0.0.1:{port}")).unwrap_err();
        assert!(matches!(err, ExchangeError::Connect { .. }));
    }
}
