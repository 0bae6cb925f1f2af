use crate::hash_table::HashTable;
use crate::message::{ExternalMessage, InternalMessage, Message, NodeInfo};
use crate::ring::{Outgoing, RingState};
use crate::routing::{self, PendingForwards};
use crate::utils::{Config, NodeId, RingError};

use log::{debug, error, info, warn};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};

// Network Manager
#[derive(Clone)]
pub struct NetworkManager {
    pub socket: Arc<UdpSocket>,
    pub buffer_size: usize,
}

impl NetworkManager {
    pub fn new(socket: Arc<UdpSocket>, buffer_size: usize) -> Self {
        NetworkManager {
            socket,
            buffer_size,
        }
    }

    pub async fn send_internal(&self, outgoing: &Outgoing) -> Result<(), RingError> {
        debug!(
            "Sending {:?} {:?} to {}",
            outgoing.message.kind, outgoing.message.node, outgoing.dst
        );
        let bytes = outgoing.message.encode()?;
        self.send_raw(&bytes, SocketAddr::V4(outgoing.dst)).await
    }

    pub async fn send_raw(&self, bytes: &[u8], dst: SocketAddr) -> Result<(), RingError> {
        self.socket.send_to(bytes, dst).await.map_err(|e| {
            error!("Failed to send {} bytes to {}: {:?}", bytes.len(), dst, e);
            RingError::Network(e)
        })?;
        Ok(())
    }

    pub async fn receive(&self) -> Result<(Vec<u8>, SocketAddr), RingError> {
        let mut buf = vec![0u8; self.buffer_size];
        let (size, src) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(size);
        Ok((buf, src))
    }
}

/// Resolves on the next stabilization tick, or never when periodic
/// stabilization is disabled.
async fn next_tick(stabilize: &mut Option<Interval>) {
    match stabilize {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// A ring member: one UDP socket, the local table and the ring links, all
/// driven by a single receive loop.
pub struct RingNode {
    pub config: Arc<Config>,
    ring: RingState,
    storage: HashTable,
    pending: PendingForwards,
    network_manager: NetworkManager,
    shutdown: mpsc::Receiver<()>,
}

impl fmt::Debug for RingNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingNode")
            .field("me", &self.ring.me())
            .field("successor", &self.ring.successor())
            .field("predecessor", &self.ring.predecessor())
            .field("storage", &self.storage)
            .finish()
    }
}

impl RingNode {
    pub async fn new(config: Config) -> Result<(Self, mpsc::Sender<()>), RingError> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => {
                return Err(RingError::Config(format!(
                    "ring messages carry IPv4 addresses only, cannot bind {}",
                    addr
                )))
            }
        };
        if addr.ip().is_unspecified() {
            warn!(
                "Bound to {}; peers cannot reach an unspecified address, bind a concrete interface",
                addr
            );
        }

        let id = config
            .node_id
            .map(NodeId)
            .unwrap_or_else(|| NodeId::from_addr(&SocketAddr::V4(addr)));
        let (shutdown_sender, shutdown_receiver) = mpsc::channel(1);

        info!("RingNode {} bound to address: {}", id, addr);

        Ok((
            RingNode {
                network_manager: NetworkManager::new(socket, config.recv_buffer_size),
                config: Arc::new(config),
                ring: RingState::new(NodeInfo::new(id, addr)),
                storage: HashTable::new(),
                pending: PendingForwards::new(),
                shutdown: shutdown_receiver,
            },
            shutdown_sender,
        ))
    }

    pub fn id(&self) -> NodeId {
        self.ring.me().id
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.ring.me().addr)
    }

    pub fn successor(&self) -> Option<NodeInfo> {
        self.ring.successor()
    }

    pub fn predecessor(&self) -> Option<NodeInfo> {
        self.ring.predecessor()
    }

    pub fn storage_len(&self) -> usize {
        self.storage.len()
    }

    pub fn pending_forwards(&self) -> usize {
        self.pending.len()
    }

    /// Sends JOIN to the configured registration node, if any.
    pub async fn join(&mut self) -> Result<(), RingError> {
        let Some(registration) = self.config.registration else {
            info!("No registration address, starting a new ring as {}", self.id());
            return Ok(());
        };
        let registration = match registration {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => {
                return Err(RingError::Config(format!(
                    "registration address {} is not IPv4",
                    addr
                )))
            }
        };
        let outgoing = self.ring.join(registration);
        self.network_manager.send_internal(&outgoing).await
    }

    pub async fn run(&mut self) -> Result<(), RingError> {
        let mut stabilize = self.config.stabilize_interval.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                result = self.network_manager.receive() => {
                    match result {
                        Ok((datagram, src)) => self.handle_datagram(datagram, src).await?,
                        Err(e) => error!("Failed to receive datagram: {:?}", e),
                    }
                }
                _ = next_tick(&mut stabilize) => {
                    if let Some(outgoing) = self.ring.stabilize() {
                        self.dispatch(vec![outgoing]).await;
                    }
                }
                _ = self.shutdown.recv() => {
                    info!("Received shutdown signal, stopping node {}", self.id());
                    break;
                }
            }
        }
        Ok(())
    }

    /// Only protocol violations escape; malformed datagrams and transport
    /// failures are logged and the loop carries on.
    pub async fn handle_datagram(
        &mut self,
        datagram: Vec<u8>,
        src: SocketAddr,
    ) -> Result<(), RingError> {
        let message = match Message::decode(&datagram) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed datagram from {}: {}", src, e);
                return Ok(());
            }
        };

        match message {
            Message::Internal(message) => self.handle_internal(message).await,
            Message::External(message) if message.is_response() => {
                self.handle_response(datagram, message, src).await;
                Ok(())
            }
            Message::External(message) => {
                self.handle_request(datagram, message, src).await;
                Ok(())
            }
        }
    }

    async fn handle_internal(&mut self, message: InternalMessage) -> Result<(), RingError> {
        let outgoing = self.ring.handle(message)?;
        self.dispatch(outgoing).await;
        Ok(())
    }

    async fn handle_request(&mut self, datagram: Vec<u8>, request: ExternalMessage, src: SocketAddr) {
        debug!("Request {:?} from {}", request, src);
        if !routing::owns(&self.ring, &request.key) {
            self.forward(datagram, request.transaction, src).await;
            return;
        }

        let response = routing::apply_request(&mut self.storage, &request);
        match response.encode() {
            Ok(bytes) => {
                if let Err(e) = self.network_manager.send_raw(&bytes, src).await {
                    warn!("Dropping response for transaction {}: {}", request.transaction, e);
                }
            }
            Err(e) => error!("Failed to encode response {:?}: {}", response, e),
        }
    }

    /// Relays a request we do not own to the successor. A detached task waits
    /// for the matching response and sends it back to `origin`.
    async fn forward(&mut self, datagram: Vec<u8>, transaction: u8, origin: SocketAddr) {
        let Some(successor) = self.ring.successor() else {
            return;
        };

        debug!(
            "Forwarding transaction {} from {} to successor {:?}",
            transaction, origin, successor
        );
        if let Err(e) = self
            .network_manager
            .send_raw(&datagram, SocketAddr::V4(successor.addr))
            .await
        {
            warn!("Abandoning forward of transaction {}: {}", transaction, e);
            return;
        }

        let receiver = self.pending.register(transaction);
        let network_manager = self.network_manager.clone();
        let deadline: Duration = self.config.forward_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(deadline, receiver).await {
                Ok(Ok(response)) => {
                    if let Err(e) = network_manager.send_raw(&response, origin).await {
                        warn!("Failed to relay transaction {} to {}: {}", transaction, origin, e);
                    }
                }
                Ok(Err(_)) => debug!("Forward of transaction {} was dropped", transaction),
                Err(_) => warn!(
                    "Timeout waiting for successor response to transaction {} from {}",
                    transaction, origin
                ),
            }
        });
    }

    /// Completes a pending forward. An ACK-flagged datagram nobody waits for
    /// is a client request like any other.
    async fn handle_response(&mut self, datagram: Vec<u8>, message: ExternalMessage, src: SocketAddr) {
        if let Err(datagram) = self.pending.complete(message.transaction, datagram) {
            debug!(
                "No forward waiting for transaction {}, serving it as a request",
                message.transaction
            );
            self.handle_request(datagram, message, src).await;
        }
    }

    async fn dispatch(&self, outgoing: Vec<Outgoing>) {
        for out in &outgoing {
            if let Err(e) = self.network_manager.send_internal(out).await {
                warn!("Failed to send {:?} to {}: {}", out.message.kind, out.dst, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Actions;

    async fn solo_node() -> RingNode {
        let config = Config {
            node_id: Some(1),
            ..Config::default()
        };
        RingNode::new(config).await.unwrap().0
    }

    #[tokio::test]
    async fn derives_identifier_from_address() {
        let (node, _shutdown) = RingNode::new(Config::default()).await.unwrap();
        assert_eq!(node.id(), NodeId::from_addr(&node.local_addr()));
    }

    #[tokio::test]
    async fn malformed_datagrams_are_dropped() {
        let mut node = solo_node().await;
        let src: SocketAddr = "127.0.0.1:9".parse().unwrap();
        node.handle_datagram(vec![Actions::GET.bits(), 1, 0], src)
            .await
            .unwrap();
        node.handle_datagram(vec![0x81, 0, 0], src).await.unwrap();
        assert_eq!(node.storage_len(), 0);
        assert_eq!(node.successor(), None);
    }

    #[tokio::test]
    async fn owned_request_updates_storage() {
        let mut node = solo_node().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = ExternalMessage::new(Actions::SET, 2, b"a", b"1");

        node.handle_datagram(request.encode().unwrap(), client.local_addr().unwrap())
            .await
            .unwrap();
        assert_eq!(node.storage_len(), 1);

        let mut buf = [0u8; 64];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[(Actions::ACK | Actions::SET).bits(), 2, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn acknowledged_request_without_forward_is_served() {
        let mut node = solo_node().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let src = client.local_addr().unwrap();
        node.handle_datagram(ExternalMessage::new(Actions::SET, 1, b"a", b"1").encode().unwrap(), src)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        client.recv_from(&mut buf).await.unwrap();

        let request = ExternalMessage::new(Actions::ACK | Actions::GET, 11, b"a", b"");
        node.handle_datagram(request.encode().unwrap(), src).await.unwrap();
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(
            ExternalMessage::decode(&buf[..len]).unwrap(),
            ExternalMessage::new(Actions::ACK | Actions::GET, 11, b"a", b"1")
        );
    }

    #[tokio::test]
    async fn rejects_ipv6_bind() {
        let config = Config {
            bind_addr: "[::1]:0".parse().unwrap(),
            ..Config::default()
        };
        // hosts without IPv6 loopback fail to bind, which is also an error
        assert!(RingNode::new(config).await.is_err());
    }
}
