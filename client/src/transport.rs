//! The peer transport seam.
//!
//! The core assumes an asynchronous bidirectional message bus with in-order,
//! reliable delivery within one peer pair for a session, and nothing across
//! distinct channels. Messages travel as UTF-8 JSON wire strings; the engine
//! owns encoding and decoding so the canonical form never varies by
//! transport.

use async_trait::async_trait;
use ethers_core::types::Address;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors emitting a message to the peer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer endpoint is gone.
    #[error("peer {0:?} is not reachable")]
    PeerUnreachable(Address),

    /// The underlying bus failed.
    #[error("transport backend: {0}")]
    Backend(String),
}

/// Outbound half of the message bus.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Emit a wire-encoded message to a peer.
    async fn send(&self, to: Address, wire: String) -> Result<(), TransportError>;
}

/// Inbound messages as `(sender, wire)` pairs, in receipt order per peer.
pub type Inbox = mpsc::Receiver<(Address, String)>;

const LOOPBACK_CAPACITY: usize = 256;

/// In-memory duplex transport for tests and local simulation.
pub struct Loopback {
    local: Address,
    peer: Address,
    outbound: mpsc::Sender<(Address, String)>,
}

/// Wire two endpoints together, returning each side's transport and inbox.
pub fn loopback_pair(a: Address, b: Address) -> ((Loopback, Inbox), (Loopback, Inbox)) {
    let (to_a, inbox_a) = mpsc::channel(LOOPBACK_CAPACITY);
    let (to_b, inbox_b) = mpsc::channel(LOOPBACK_CAPACITY);
    (
        (
            Loopback {
                local: a,
                peer: b,
                outbound: to_b,
            },
            inbox_a,
        ),
        (
            Loopback {
                local: b,
                peer: a,
                outbound: to_a,
            },
            inbox_b,
        ),
    )
}

#[async_trait]
impl Transport for Loopback {
    async fn send(&self, to: Address, wire: String) -> Result<(), TransportError> {
        if to != self.peer {
            return Err(TransportError::PeerUnreachable(to));
        }
        self.outbound
            .send((self.local, wire))
            .await
            .map_err(|_| TransportError::PeerUnreachable(to))
    }
}

/// Placeholder endpoint for processes that only run chain operations and
/// queries; the host application wires the real message bus. Sending fails.
pub struct Disconnected;

/// A transport that cannot reach any peer, with an inbox that never yields.
pub fn disconnected() -> (Disconnected, Inbox) {
    let (_closed, inbox) = mpsc::channel(1);
    (Disconnected, inbox)
}

#[async_trait]
impl Transport for Disconnected {
    async fn send(&self, to: Address, _wire: String) -> Result<(), TransportError> {
        Err(TransportError::PeerUnreachable(to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_delivers_in_order() {
        let a = Address::repeat_byte(0xaa);
        let b = Address::repeat_byte(0xbb);
        let ((transport_a, _inbox_a), (_transport_b, mut inbox_b)) = loopback_pair(a, b);

        transport_a.send(b, "first".into()).await.unwrap();
        transport_a.send(b, "second".into()).await.unwrap();

        assert_eq!(inbox_b.recv().await.unwrap(), (a, "first".to_string()));
        assert_eq!(inbox_b.recv().await.unwrap(), (a, "second".to_string()));
    }

    #[tokio::test]
    async fn unknown_peer_rejected() {
        let a = Address::repeat_byte(0xaa);
        let b = Address::repeat_byte(0xbb);
        let ((transport_a, _inbox_a), _) = loopback_pair(a, b);
        assert!(transport_a
            .send(Address::repeat_byte(0xcc), "lost".into())
            .await
            .is_err());
    }
}
