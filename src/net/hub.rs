//! Request/reply messaging.
//!
//! The transport itself is a collaborator behind the [`Hub`] trait; the
//! in-process [`LocalHub`] routes between peers of one process and is what
//! the test harness runs on. Every delivery passes through the wire codec,
//! so local routing exercises the same envelope as a socket transport would.
//!
//! Clock discipline lives here: a receiver synchronizes its clock with the
//! inbound timestamp before the handler runs, and every reply is stamped
//! with a fresh sample.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;

use crate::core::identity::PeerId;
use crate::core::time::LogicalClock;

use super::proto::{decode_message, encode_message, Message, Payload, ProtoError};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("peer {peer} unreachable")]
    PeerUnreachable { peer: PeerId },
    #[error("request declined: {reason}")]
    Declined { reason: String },
    #[error("request rejected as invalid")]
    Invalid,
    #[error(transparent)]
    Serialization(#[from] ProtoError),
}

/// Inbound dispatch. One handler per peer routes to tables and chunks.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message) -> Payload;
}

/// The messaging collaborator. All inter-peer communication goes through
/// here; implementations must block the caller until the reply arrives.
pub trait Hub: Send + Sync {
    fn own_peer(&self) -> &PeerId;

    /// Send and wait for the reply.
    fn request(&self, peer: &PeerId, payload: Payload) -> Result<Message, NetError>;

    /// Peers currently reachable (excluding self).
    fn ready_peers(&self) -> Vec<PeerId>;

    /// Send to every reachable peer; responses keyed by peer.
    fn request_all(&self, payload: Payload) -> BTreeMap<PeerId, Result<Message, NetError>> {
        self.ready_peers()
            .into_iter()
            .map(|peer| {
                let response = self.request(&peer, payload.clone());
                (peer, response)
            })
            .collect()
    }

    /// Ack-or-error convenience for fire-and-confirm requests.
    fn request_ack(&self, peer: &PeerId, payload: Payload) -> Result<(), NetError> {
        let response = self.request(peer, payload)?;
        match response.payload {
            Payload::Ack | Payload::Redundant => Ok(()),
            Payload::Decline { reason } => Err(NetError::Declined { reason }),
            _ => Err(NetError::Invalid),
        }
    }
}

struct Endpoint {
    clock: Arc<LogicalClock>,
    handler: Arc<dyn MessageHandler>,
    attached: Arc<AtomicBool>,
}

/// Process-wide registry connecting the [`LocalHub`]s of co-located peers.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    endpoints: Arc<RwLock<BTreeMap<PeerId, Endpoint>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detach a peer without any leave protocol, simulating a crash.
    pub fn sever(&self, peer: &PeerId) {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        if let Some(endpoint) = endpoints.remove(peer) {
            endpoint.attached.store(false, Ordering::Relaxed);
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

/// In-process hub implementation.
pub struct LocalHub {
    network: LocalNetwork,
    own: PeerId,
    clock: Arc<LogicalClock>,
    attached: Arc<AtomicBool>,
    simulated_lag: Duration,
}

impl LocalHub {
    pub fn attach(
        network: &LocalNetwork,
        own: PeerId,
        clock: Arc<LogicalClock>,
        handler: Arc<dyn MessageHandler>,
        simulated_lag: Duration,
    ) -> Self {
        let attached = Arc::new(AtomicBool::new(true));
        let endpoint = Endpoint {
            clock: Arc::clone(&clock),
            handler,
            attached: Arc::clone(&attached),
        };
        let mut endpoints = network
            .endpoints
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let previous = endpoints.insert(own.clone(), endpoint);
        assert!(previous.is_none(), "peer {own} attached twice");
        drop(endpoints);
        Self {
            network: network.clone(),
            own,
            clock,
            attached,
            simulated_lag,
        }
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::Relaxed);
        self.network.sever(&self.own);
    }

    fn deliver(&self, peer: &PeerId, wire: Vec<u8>) -> Result<Vec<u8>, NetError> {
        if !self.simulated_lag.is_zero() {
            std::thread::sleep(self.simulated_lag);
        }
        let endpoints = self
            .network
            .endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let Some(endpoint) = endpoints.get(peer) else {
            return Err(NetError::PeerUnreachable { peer: peer.clone() });
        };
        if !endpoint.attached.load(Ordering::Relaxed) {
            return Err(NetError::PeerUnreachable { peer: peer.clone() });
        }
        let clock = Arc::clone(&endpoint.clock);
        let handler = Arc::clone(&endpoint.handler);
        let own = peer.clone();
        drop(endpoints);

        let message = decode_message(&wire)?;
        clock.synchronize(message.time);
        let response_payload = handler.handle(&message);
        let response = Message::new(own, clock.sample(), response_payload);
        Ok(encode_message(&response))
    }
}

impl Hub for LocalHub {
    fn own_peer(&self) -> &PeerId {
        &self.own
    }

    fn request(&self, peer: &PeerId, payload: Payload) -> Result<Message, NetError> {
        if !self.attached.load(Ordering::Relaxed) {
            return Err(NetError::PeerUnreachable { peer: peer.clone() });
        }
        let message = Message::new(self.own.clone(), self.clock.sample(), payload);
        let wire = encode_message(&message);
        let response_wire = self.deliver(peer, wire)?;
        let response = decode_message(&response_wire)?;
        self.clock.synchronize(response.time);
        Ok(response)
    }

    fn ready_peers(&self) -> Vec<PeerId> {
        self.network
            .peers()
            .into_iter()
            .filter(|peer| *peer != self.own)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl MessageHandler for Echo {
        fn handle(&self, message: &Message) -> Payload {
            match &message.payload {
                Payload::Discovery => Payload::Ack,
                _ => Payload::Invalid,
            }
        }
    }

    fn peer(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    fn attach(network: &LocalNetwork, address: &str) -> (LocalHub, Arc<LogicalClock>) {
        let clock = Arc::new(LogicalClock::new());
        let hub = LocalHub::attach(
            network,
            peer(address),
            Arc::clone(&clock),
            Arc::new(Echo),
            Duration::ZERO,
        );
        (hub, clock)
    }

    #[test]
    fn request_reaches_handler_and_returns_ack() {
        let network = LocalNetwork::new();
        let (a, _) = attach(&network, "127.0.0.1:1");
        let (_b, _) = attach(&network, "127.0.0.1:2");

        let response = a.request(&peer("127.0.0.1:2"), Payload::Discovery).unwrap();
        assert!(response.is_ack());
        assert_eq!(response.sender, peer("127.0.0.1:2"));
    }

    #[test]
    fn request_to_unknown_peer_is_unreachable() {
        let network = LocalNetwork::new();
        let (a, _) = attach(&network, "127.0.0.1:1");
        assert!(matches!(
            a.request(&peer("127.0.0.1:9"), Payload::Discovery),
            Err(NetError::PeerUnreachable { .. })
        ));
    }

    #[test]
    fn severed_peer_becomes_unreachable() {
        let network = LocalNetwork::new();
        let (a, _) = attach(&network, "127.0.0.1:1");
        let (_b, _) = attach(&network, "127.0.0.1:2");
        network.sever(&peer("127.0.0.1:2"));
        assert!(matches!(
            a.request(&peer("127.0.0.1:2"), Payload::Discovery),
            Err(NetError::PeerUnreachable { .. })
        ));
    }

    #[test]
    fn clocks_synchronize_through_messages() {
        let network = LocalNetwork::new();
        let (a, clock_a) = attach(&network, "127.0.0.1:1");
        let (_b, clock_b) = attach(&network, "127.0.0.1:2");

        // Drive A's clock far ahead; B must land past it after one exchange.
        for _ in 0..100 {
            clock_a.sample();
        }
        let before = clock_a.sample();
        a.request(&peer("127.0.0.1:2"), Payload::Discovery).unwrap();
        assert!(clock_b.sample() > before);
    }

    #[test]
    fn ready_peers_excludes_self() {
        let network = LocalNetwork::new();
        let (a, _) = attach(&network, "127.0.0.1:1");
        let (_b, _) = attach(&network, "127.0.0.1:2");
        assert_eq!(a.ready_peers(), vec![peer("127.0.0.1:2")]);
    }
}
