use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::account::{Account, AccountStore, StoreError};
use crate::auth::{check_credentials, AuthError, ConfigFrame, STATUS_ERROR};
use crate::cipher;
use crate::config::ServerConfig;
use crate::monitor::TransferMonitor;
use crate::packet::Packet;
use crate::registry::{NetworkRegistry, RegistryError};
use crate::session::{Session, SessionTable};
use crate::MAX_UDP_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("account belongs to no network")]
    NoMembership,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The per-datagram dispatcher. One UDP socket serves every client:
/// unknown endpoints go through authentication, known endpoints get
/// their payload decrypted, resolved against the network's binding map
/// and re-encrypted for the destination session. Holds no state of its
/// own beyond handles to the owning components.
#[derive(Clone)]
pub struct Relay {
    socket: Arc<UdpSocket>,
    store: Arc<dyn AccountStore>,
    registry: Arc<NetworkRegistry>,
    sessions: Arc<SessionTable>,
    monitor: Arc<TransferMonitor>,
    tunnel: bool,
}

impl Relay {
    /// Binds the server socket. This is the only fatal failure point;
    /// everything past it is handled per-datagram.
    pub async fn bind(
        addr: SocketAddr,
        tunnel: bool,
        store: Arc<dyn AccountStore>,
        registry: Arc<NetworkRegistry>,
    ) -> std::io::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(std::net::UdpSocket::from(socket))?;

        Ok(Self {
            socket: Arc::new(socket),
            store,
            registry,
            sessions: Arc::new(SessionTable::new()),
            monitor: Arc::new(TransferMonitor::new()),
            tunnel,
        })
    }

    pub async fn from_config(
        config: &ServerConfig,
        store: Arc<dyn AccountStore>,
        registry: Arc<NetworkRegistry>,
    ) -> std::io::Result<Self> {
        Self::bind(config.socket_addr(), config.tunnel(), store, registry).await
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn monitor(&self) -> &Arc<TransferMonitor> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<NetworkRegistry> {
        &self.registry
    }

    /// Drops the session at an endpoint, if any.
    pub fn disconnect(&self, endpoint: &SocketAddr) {
        if let Some(session) = self.sessions.remove(endpoint) {
            log::info!("disconnected {} at {endpoint}", session.account);
        }
    }

    /// The receive loop. Each datagram is dispatched on its own task so
    /// a slow store lookup or forward cannot stall reception; as a
    /// consequence, per-session processing order is not guaranteed.
    /// Returns once the token is cancelled, letting in-flight workers
    /// finish on their own.
    pub async fn run(&self, token: CancellationToken) {
        let mut buf = vec![0u8; MAX_UDP_SIZE];

        match self.local_addr() {
            Ok(addr) => log::info!("listening on {addr}"),
            Err(_) => log::info!("listening"),
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    log::info!("server stopped");
                    return;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        let relay = self.clone();
                        let datagram = buf[..len].to_vec();
                        tokio::spawn(async move {
                            relay.handle_datagram(datagram, peer).await;
                        });
                    }
                    Err(e) => log::warn!("receive failed: {e}"),
                }
            }
        }
    }

    /// Spawns `run` on its own task.
    pub fn spawn(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move { relay.run(token).await })
    }

    async fn handle_datagram(self, datagram: Vec<u8>, peer: SocketAddr) {
        match self.sessions.lookup_endpoint(&peer) {
            Some(session) => self.relay_packet(&session, &datagram).await,
            None => self.handle_handshake(&datagram, peer).await,
        }
    }

    async fn handle_handshake(&self, frame: &[u8], peer: SocketAddr) {
        let account = match check_credentials(self.store.as_ref(), frame).await {
            Ok(account) => account,
            Err(AuthError::Rejected) => {
                log::debug!("rejected credentials from {peer}");
                self.send_status(peer, STATUS_ERROR).await;
                return;
            }
            Err(AuthError::Frame(e)) => {
                // Not even a credential frame: drop without a reply.
                log::debug!("malformed frame from {peer}: {e}");
                return;
            }
        };

        match self.establish_session(&account, peer).await {
            Ok(reply) => {
                if let Err(e) = self.socket.send_to(&reply, peer).await {
                    log::warn!("configuration reply to {peer} failed: {e}");
                }
            }
            Err(e) => {
                log::warn!("cannot establish session for {}: {e}", account.username);
                self.send_status(peer, STATUS_ERROR).await;
            }
        }
    }

    /// Binds a virtual address on the account's front network, creates
    /// the session (superseding any previous one) and builds the
    /// configuration reply.
    async fn establish_session(
        &self,
        account: &Account,
        peer: SocketAddr,
    ) -> Result<Vec<u8>, RelayError> {
        let membership = account.networks.first().ok_or(RelayError::NoMembership)?;
        let network = self.registry.get(membership.network)?;
        let address = network.bind_address(account.id, membership.address)?;

        if membership.address != Some(address) {
            self.store
                .set_address(account.id, network.id, address)
                .await?;
        }

        let session = self
            .sessions
            .establish(peer, account.id, network.id, address);
        log::info!(
            "session established: {} at {peer} as {address}",
            account.username
        );

        Ok(ConfigFrame {
            address,
            mask: network.subnet.mask,
            key: session.key,
        }
        .encode())
    }

    async fn relay_packet(&self, session: &Session, wire: &[u8]) {
        // A packet that fails to decrypt or parse is dropped; it never
        // tears down the session.
        let plain = match cipher::open(&session.key, wire) {
            Ok(plain) => plain,
            Err(e) => {
                log::debug!("dropping packet from {}: {e}", session.endpoint);
                return;
            }
        };

        let Some(packet) = Packet::parse(plain) else {
            log::debug!("unparseable datagram from {}", session.endpoint);
            return;
        };

        let network = match self.registry.get(session.network) {
            Ok(network) => network,
            Err(e) => {
                log::warn!("session {} references {e}", session.endpoint);
                return;
            }
        };

        match network.account_at(packet.dst()) {
            Some(dst_account) => {
                let Some(dst_session) = self.sessions.lookup_account(dst_account) else {
                    log::debug!("destination {} is bound but not connected", packet.dst());
                    return;
                };

                let wire = match cipher::seal(&dst_session.key, packet.bytes()) {
                    Ok(wire) => wire,
                    Err(e) => {
                        log::warn!("re-encryption for {} failed: {e}", dst_session.endpoint);
                        return;
                    }
                };

                match self.socket.send_to(&wire, dst_session.endpoint).await {
                    Ok(_) => {
                        self.monitor.record_upload(session.account, packet.len());
                        self.monitor.record_download(dst_account, packet.len());
                    }
                    Err(e) => log::warn!("forward to {} failed: {e}", dst_session.endpoint),
                }
            }
            None if self.tunnel => {
                // Outside the virtual network: forward the decrypted
                // datagram to its real endpoint.
                let target = SocketAddr::from((packet.dst(), packet.dst_port()));
                match self.socket.send_to(packet.bytes(), target).await {
                    Ok(_) => self.monitor.record_upload(session.account, packet.len()),
                    Err(e) => log::debug!("external forward to {target} failed: {e}"),
                }
            }
            None => log::trace!("no binding for {}, dropping", packet.dst()),
        }
    }

    async fn send_status(&self, peer: SocketAddr, status: u8) {
        if let Err(e) = self.socket.send_to(&[status], peer).await {
            log::warn!("status reply to {peer} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;
    use crate::account::MemoryStore;
    use crate::addr::RangeSpec;
    use crate::client::{Client, ClientError};
    use crate::registry::NetworkId;

    struct Harness {
        relay: Relay,
        server: SocketAddr,
        store: Arc<MemoryStore>,
        network: NetworkId,
        token: CancellationToken,
    }

    async fn start_server(capacity: u32) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(NetworkRegistry::new());
        let network = registry
            .create_network(Some(RangeSpec::parse("10.0.0.0/29")), capacity)
            .unwrap();

        let relay = Relay::bind(
            "127.0.0.1:0".parse().unwrap(),
            false,
            Arc::clone(&store) as Arc<dyn AccountStore>,
            registry,
        )
        .await
        .unwrap();
        let server = relay.local_addr().unwrap();

        let token = CancellationToken::new();
        let _ = relay.spawn(token.clone());

        Harness {
            relay,
            server,
            store,
            network,
            token,
        }
    }

    async fn add_user(harness: &Harness, username: &str, password: &str) -> crate::AccountId {
        let id = harness.store.create(username, password).await.unwrap();
        harness
            .store
            .add_membership(id, harness.network, false, None)
            .await
            .unwrap();
        id
    }

    fn test_datagram(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let builder = etherparse::PacketBuilder::ipv4(src.octets(), dst.octets(), 64).udp(40000, 9999);
        let mut bytes = Vec::with_capacity(builder.size(4));
        builder.write(&mut bytes, &[1, 2, 3, 4]).unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_end_to_end_relay() {
        let harness = start_server(5).await;
        let alice = add_user(&harness, "alice", "secret").await;
        let bob = add_user(&harness, "bob", "hunter2").await;

        let alice_session = Client::new(harness.server)
            .await
            .unwrap()
            .authenticate("alice", "secret")
            .await
            .unwrap();
        assert_eq!(alice_session.address, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(alice_session.mask, Ipv4Addr::new(255, 255, 255, 248));

        let bob_session = Client::new(harness.server)
            .await
            .unwrap()
            .authenticate("bob", "hunter2")
            .await
            .unwrap();
        assert_eq!(bob_session.address, Ipv4Addr::new(10, 0, 0, 1));

        let datagram = test_datagram(alice_session.address, bob_session.address);
        alice_session.send(&datagram).await.unwrap();

        let received = bob_session
            .recv_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(received, datagram);

        let monitor = harness.relay.monitor();
        assert_eq!(monitor.totals(alice).upload, datagram.len() as u64);
        assert_eq!(monitor.totals(bob).download, datagram.len() as u64);

        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_wrong_password_leaves_no_state() {
        let harness = start_server(5).await;
        add_user(&harness, "alice", "secret").await;

        let result = Client::new(harness.server)
            .await
            .unwrap()
            .authenticate("alice", "wrong")
            .await;
        assert!(matches!(result, Err(ClientError::AuthenticationFailed)));

        assert!(harness.relay.sessions().is_empty());
        let network = harness.relay.registry().get(harness.network).unwrap();
        assert_eq!(network.binding_count(), 0);

        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_reconnect_keeps_address_and_supersedes() {
        let harness = start_server(5).await;
        add_user(&harness, "alice", "secret").await;

        let first = Client::new(harness.server)
            .await
            .unwrap()
            .authenticate("alice", "secret")
            .await
            .unwrap();

        let second = Client::new(harness.server)
            .await
            .unwrap()
            .authenticate("alice", "secret")
            .await
            .unwrap();

        assert_eq!(first.address, second.address);
        // Only the second endpoint remains connected.
        assert_eq!(harness.relay.sessions().len(), 1);

        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_pool_exhaustion_rejects_handshake() {
        let harness = start_server(1).await;
        add_user(&harness, "alice", "secret").await;
        add_user(&harness, "bob", "hunter2").await;

        Client::new(harness.server)
            .await
            .unwrap()
            .authenticate("alice", "secret")
            .await
            .unwrap();

        let result = Client::new(harness.server)
            .await
            .unwrap()
            .authenticate("bob", "hunter2")
            .await;
        assert!(matches!(result, Err(ClientError::AuthenticationFailed)));

        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_bad_ciphertext_does_not_kill_session() {
        let harness = start_server(5).await;
        add_user(&harness, "alice", "secret").await;
        add_user(&harness, "bob", "hunter2").await;

        let alice_session = Client::new(harness.server)
            .await
            .unwrap()
            .authenticate("alice", "secret")
            .await
            .unwrap();
        let bob_session = Client::new(harness.server)
            .await
            .unwrap()
            .authenticate("bob", "hunter2")
            .await
            .unwrap();

        // Garbage from an authenticated endpoint is dropped silently.
        alice_session
            .socket()
            .send_to(&[0xff; 64], harness.server)
            .await
            .unwrap();

        // The session still relays valid traffic afterwards.
        let datagram = test_datagram(alice_session.address, bob_session.address);
        alice_session.send(&datagram).await.unwrap();
        let received = bob_session
            .recv_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(received, datagram);

        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_unbound_destination_is_dropped() {
        let harness = start_server(5).await;
        let alice = add_user(&harness, "alice", "secret").await;

        let alice_session = Client::new(harness.server)
            .await
            .unwrap()
            .authenticate("alice", "secret")
            .await
            .unwrap();

        // 10.0.0.6 is inside the range but bound to nobody; tunneling is
        // off, so the packet disappears and no bytes are accounted.
        let datagram = test_datagram(alice_session.address, Ipv4Addr::new(10, 0, 0, 6));
        alice_session.send(&datagram).await.unwrap();

        let result = alice_session.recv_timeout(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(ClientError::Timeout)));
        assert_eq!(harness.relay.monitor().totals(alice).upload, 0);

        harness.token.cancel();
    }
}
