use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::crypto::SymmetricKey;
use crate::directory::KeyDirectory;
use crate::session::connection::Connection;
use crate::session::SessionContext;
use crate::ship::{Life, Ship};

/// Bones of locally initiated connections start here
pub const FIRST_BONE: u64 = 1;
/// distance between consecutively allocated bones
pub const BONE_STEP: u64 = 4;

/// A peer's key material and, once known, its direct address
#[derive(Debug)]
pub struct PeerInfo {
    pub ship: Ship,
    pub life: Life,
    pub symmetric_key: SymmetricKey,
    lane: RwLock<Option<SocketAddr>>,
}

impl PeerInfo {
    pub fn new(ship: Ship, life: Life, symmetric_key: SymmetricKey) -> PeerInfo {
        PeerInfo {
            ship,
            life,
            symmetric_key,
            lane: RwLock::new(None),
        }
    }

    /// The peer's direct address, `None` if packets have to go through the relay
    pub fn lane(&self) -> Option<SocketAddr> {
        *self.lane.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `true` if the lane changed
    pub fn set_lane(&self, addr: SocketAddr) -> bool {
        let mut lane = self.lane.write().unwrap_or_else(|e| e.into_inner());
        if *lane == Some(addr) {
            return false;
        }
        debug!(peer = %self.ship, ?addr, "updated lane");
        *lane = Some(addr);
        true
    }
}

struct PeerConnections {
    by_bone: FxHashMap<u64, Arc<Connection>>,
    next_bone: u64,
}

pub struct Peer {
    info: Arc<PeerInfo>,
    ctx: Arc<SessionContext>,
    connections: Mutex<PeerConnections>,
}

impl Peer {
    pub fn new(info: PeerInfo, ctx: Arc<SessionContext>) -> Peer {
        Peer {
            info: Arc::new(info),
            ctx,
            connections: Mutex::new(PeerConnections {
                by_bone: FxHashMap::default(),
                next_bone: FIRST_BONE,
            }),
        }
    }

    pub fn ship(&self) -> Ship {
        self.info.ship
    }

    pub fn info(&self) -> &Arc<PeerInfo> {
        &self.info
    }

    fn new_connection(&self, bone: u64) -> Arc<Connection> {
        Arc::new(Connection::new(bone, self.info.clone(), self.ctx.clone()))
    }

    /// Opens a connection on a freshly allocated bone. Bones that are already taken, e.g. by
    ///  connections the peer initiated, are skipped.
    pub async fn connect(&self) -> Arc<Connection> {
        let mut connections = self.connections.lock().await;
        while connections.by_bone.contains_key(&connections.next_bone) {
            connections.next_bone += BONE_STEP;
        }
        let bone = connections.next_bone;
        connections.next_bone += BONE_STEP;

        debug!(peer = %self.info.ship, bone, "opening connection");
        let connection = self.new_connection(bone);
        connections.by_bone.insert(bone, connection.clone());
        connection
    }

    /// The connection for a bone, creating it if necessary. Creating a connection advances the
    ///  bone counter like [Peer::connect] does.
    pub async fn get_connection(&self, bone: u64) -> Arc<Connection> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.by_bone.get(&bone) {
            return connection.clone();
        }

        debug!(peer = %self.info.ship, bone, "creating connection");
        let connection = self.new_connection(bone);
        connections.by_bone.insert(bone, connection.clone());
        connections.next_bone += BONE_STEP;
        connection
    }

    pub async fn find_connection(&self, bone: u64) -> Option<Arc<Connection>> {
        self.connections.lock().await
            .by_bone
            .get(&bone)
            .cloned()
    }

    /// all connections, ordered by bone
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        let mut result = self.connections.lock().await
            .by_bone
            .values()
            .cloned()
            .collect::<Vec<_>>();
        result.sort_by_key(|c| c.bone());
        result
    }
}

/// All peers this ship talks to. A peer's keys are looked up and its symmetric key derived
///  exactly once, even if several tasks ask for the same peer concurrently.
pub struct PeerRegistry {
    ctx: Arc<SessionContext>,
    encryption_seed: [u8; 32],
    directory: Arc<dyn KeyDirectory>,
    peers: Mutex<FxHashMap<Ship, Arc<OnceCell<Arc<Peer>>>>>,
}

impl PeerRegistry {
    pub fn new(ctx: Arc<SessionContext>, encryption_seed: [u8; 32], directory: Arc<dyn KeyDirectory>) -> PeerRegistry {
        PeerRegistry {
            ctx,
            encryption_seed,
            directory,
            peers: Default::default(),
        }
    }

    /// Returns the peer, creating it on first use. A failed key lookup is not cached, so the
    ///  next call tries again, and it leaves no entry behind.
    pub async fn get_peer(&self, ship: Ship) -> anyhow::Result<Arc<Peer>> {
        let cell = self.peers.lock().await
            .entry(ship)
            .or_default()
            .clone();

        let result = cell.get_or_try_init(|| self.create_peer(ship))
            .await
            .cloned();

        if result.is_err() {
            let mut peers = self.peers.lock().await;
            // cells are only cloned under this lock; other holders are still waiting to retry
            let unused = |c: &Arc<OnceCell<Arc<Peer>>>| Arc::ptr_eq(c, &cell) && Arc::strong_count(c) == 2 && c.get().is_none();
            if peers.get(&ship).is_some_and(unused) {
                peers.remove(&ship);
            }
        }
        result
    }

    async fn create_peer(&self, ship: Ship) -> anyhow::Result<Arc<Peer>> {
        let keys = self.directory.lookup(ship).await?;
        let secret = self.ctx.crypto.shared_secret(&keys.encryption_key, &self.encryption_seed);
        info!(peer = %ship, life = keys.life, "derived session key");

        let info = PeerInfo::new(ship, keys.life, SymmetricKey::new(secret.to_vec()));
        Ok(Arc::new(Peer::new(info, self.ctx.clone())))
    }

    /// The peer if it was successfully created before
    pub async fn existing_peer(&self, ship: Ship) -> Option<Arc<Peer>> {
        self.peers.lock().await
            .get(&ship)
            .and_then(|cell| cell.get().cloned())
    }

    /// all successfully created peers, ordered by ship
    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        let mut result = self.peers.lock().await
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect::<Vec<_>>();
        result.sort_by_key(|p| p.ship());
        result
    }
}
