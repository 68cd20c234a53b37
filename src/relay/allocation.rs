//! Allocation table and per-allocation relay sockets.
//!
//! One live allocation per five-tuple. Each allocation exclusively owns its
//! relay socket; the permission set is the only state shared between the
//! relay inbound loop and client-driven requests, so it sits behind its own
//! lock and the table mutex is never held across socket I/O.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info, trace, warn};

use super::handlers::data_indication;
use super::RelayConfig;
use crate::agent::TransportProtocol;
use crate::error::{Result, StunError};
use crate::message::MAX_MESSAGE_SIZE;

/// Identity key of an allocation: client address, server address and
/// transport protocol. Value equality, not object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    /// Client transport address.
    pub client_addr: SocketAddr,
    /// Server transport address the client sent to.
    pub server_addr: SocketAddr,
    /// Transport protocol between client and server.
    pub protocol: TransportProtocol,
}

/// A live relay allocation.
///
/// Created by a successful Allocate request, mutated only through
/// permission insertion, destroyed on expiry or explicit teardown.
pub struct Allocation {
    five_tuple: FiveTuple,
    relayed_addr: SocketAddr,
    lifetime: Duration,
    created_at: Instant,
    relay_socket: Arc<UdpSocket>,
    permissions: Arc<RwLock<HashSet<IpAddr>>>,
    relay_task: JoinHandle<()>,
}

impl Allocation {
    /// Five-tuple identity key.
    pub fn five_tuple(&self) -> &FiveTuple {
        &self.five_tuple
    }

    /// Client transport address.
    pub fn client_addr(&self) -> SocketAddr {
        self.five_tuple.client_addr
    }

    /// OS-assigned relayed transport address peers send to.
    pub fn relayed_addr(&self) -> SocketAddr {
        self.relayed_addr
    }

    /// Granted lifetime.
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Deadline after which the allocation is expired.
    pub fn expires_at(&self) -> Instant {
        self.created_at + self.lifetime
    }

    /// Whether the lifetime has elapsed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at()
    }

    /// Whether datagrams from this IP may cross the relay. Port-insensitive
    /// by design (RFC 5766 address-only permission model).
    pub fn permits(&self, ip: IpAddr) -> bool {
        self.permissions.read().contains(&ip)
    }

    /// Install a permission for the peer's IP. Idempotent.
    pub fn insert_permission(&self, ip: IpAddr) {
        self.permissions.write().insert(ip);
    }

    /// Forward payload bytes to a peer through the relay socket.
    pub async fn send_to_peer(&self, peer: SocketAddr, payload: &[u8]) -> Result<()> {
        self.relay_socket.send_to(payload, peer).await?;
        Ok(())
    }

    fn shutdown(&self) {
        self.relay_task.abort();
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.relay_task.abort();
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("five_tuple", &self.five_tuple)
            .field("relayed_addr", &self.relayed_addr)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

/// Keyed table of live allocations.
///
/// All table and permission mutations go through `allocate`,
/// `install_permission` and `remove`; the table mutex serializes them
/// against the expiry sweep and concurrent requests.
pub struct AllocationManager {
    config: RelayConfig,
    allocations: Mutex<HashMap<FiveTuple, Arc<Allocation>>>,
}

impl AllocationManager {
    /// Create an empty manager.
    pub fn new(config: RelayConfig) -> Self {
        Self { config, allocations: Mutex::new(HashMap::new()) }
    }

    /// Manager configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Create an allocation for the given client.
    ///
    /// Fails with a 437-class error when the five-tuple already has a live
    /// allocation; the existing one is left untouched. Otherwise binds an
    /// ephemeral relay socket on the configured host, starts the inbound
    /// forwarding loop and stores the allocation under its five-tuple.
    pub async fn allocate(
        &self,
        client_addr: SocketAddr,
        protocol: TransportProtocol,
        requested_lifetime: Option<Duration>,
    ) -> Result<Arc<Allocation>> {
        let key = FiveTuple { client_addr, server_addr: self.config.server_addr, protocol };

        let mut table = self.allocations.lock().await;
        if table.contains_key(&key) {
            debug!("allocate refused: five-tuple {:?} already allocated", key);
            return Err(StunError::allocation_mismatch("5-tuple already allocated"));
        }

        let socket =
            Arc::new(UdpSocket::bind(SocketAddr::new(self.config.relay_host, 0)).await?);
        let relayed_addr = socket.local_addr()?;

        let lifetime = requested_lifetime
            .unwrap_or(self.config.max_lifetime)
            .min(self.config.max_lifetime);

        let permissions = Arc::new(RwLock::new(HashSet::new()));
        let relay_task =
            tokio::spawn(relay_loop(socket.clone(), permissions.clone(), client_addr));

        let allocation = Arc::new(Allocation {
            five_tuple: key,
            relayed_addr,
            lifetime,
            created_at: Instant::now(),
            relay_socket: socket,
            permissions,
            relay_task,
        });
        table.insert(key, allocation.clone());

        info!(
            "allocation created: client {} -> relay {} (lifetime {:?})",
            client_addr, relayed_addr, lifetime
        );
        Ok(allocation)
    }

    /// Look up the allocation for a client address on this server.
    pub async fn get(
        &self,
        client_addr: SocketAddr,
        protocol: TransportProtocol,
    ) -> Option<Arc<Allocation>> {
        let key = FiveTuple { client_addr, server_addr: self.config.server_addr, protocol };
        self.allocations.lock().await.get(&key).cloned()
    }

    /// Install a permission for `peer_addr`'s IP on the client's
    /// allocation. The port is ignored.
    pub async fn install_permission(
        &self,
        client_addr: SocketAddr,
        protocol: TransportProtocol,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let allocation = self
            .get(client_addr, protocol)
            .await
            .ok_or_else(|| StunError::allocation_mismatch("no allocation for 5-tuple"))?;
        allocation.insert_permission(peer_addr.ip());
        debug!("permission installed: {} may reach {}", peer_addr.ip(), client_addr);
        Ok(())
    }

    /// Tear an allocation down: stop its forwarding loop, release the
    /// socket, remove the table entry.
    pub async fn remove(&self, key: &FiveTuple) -> Result<()> {
        let allocation = self
            .allocations
            .lock()
            .await
            .remove(key)
            .ok_or_else(|| StunError::allocation_mismatch("no allocation for 5-tuple"))?;
        allocation.shutdown();
        info!("allocation removed: client {}", key.client_addr);
        Ok(())
    }

    /// Number of live allocations.
    pub async fn len(&self) -> usize {
        self.allocations.lock().await.len()
    }

    /// Whether the table is empty.
    pub async fn is_empty(&self) -> bool {
        self.allocations.lock().await.is_empty()
    }

    /// Spawn the background sweep removing expired allocations.
    pub fn start_expiry_sweep(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                manager.sweep_expired().await;
            }
        })
    }

    /// Remove every expired allocation. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let mut table = self.allocations.lock().await;
        let expired: Vec<FiveTuple> = table
            .iter()
            .filter(|(_, alloc)| alloc.is_expired())
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            if let Some(allocation) = table.remove(key) {
                allocation.shutdown();
                info!("allocation expired: client {}", key.client_addr);
            }
        }
        expired.len()
    }

    /// Tear down every allocation.
    pub async fn shutdown(&self) {
        let mut table = self.allocations.lock().await;
        for (_, allocation) in table.drain() {
            allocation.shutdown();
        }
    }
}

/// Per-allocation inbound loop: peer datagrams arriving on the relay socket
/// are permission-checked and forwarded to the client as data indications.
/// Unpermitted senders are dropped silently.
async fn relay_loop(
    socket: Arc<UdpSocket>,
    permissions: Arc<RwLock<HashSet<IpAddr>>>,
    client_addr: SocketAddr,
) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("relay socket error for client {}: {}", client_addr, e);
                break;
            }
        };

        if !permissions.read().contains(&peer.ip()) {
            trace!("dropping {} bytes from unpermitted peer {}", len, peer);
            continue;
        }

        match data_indication(peer, &buf[..len]) {
            Ok(indication) => {
                if let Err(e) = socket.send_to(&indication.raw, client_addr).await {
                    warn!("failed to forward data indication to {}: {}", client_addr, e);
                }
            }
            Err(e) => warn!("failed to build data indication for {}: {}", client_addr, e),
        }
    }
}
