use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, broadcast, mpsc};
use uuid::Uuid;

use crate::auth::{AuthKeys, Principal};
use crate::config::Config;
use crate::engine::timers::TimerManager;
use crate::guard::{RateLimiter, SpamGuard};
use crate::models::presence::{CustomerPresence, DriverPresence, InspectionLock, PendingApproval};
use crate::observability::metrics::Metrics;
use crate::protocol::ServerEvent;
use crate::protocol::outbound::StatsSnapshot;
use crate::store::{SettingsCache, SettingsDefaults, Store};

const ORDER_LOCK_SHARDS: usize = 256;

/// Write half of one websocket session. Events queue on `tx` and a writer
/// task owns the socket; `kill` tears the session down when the same
/// principal connects again elsewhere.
pub struct ConnectionHandle {
    pub tx: mpsc::UnboundedSender<ServerEvent>,
    pub principal: Principal,
    pub addr: SocketAddr,
    pub kill: Arc<Notify>,
}

/// Identity of the session an event arrived on, threaded through every
/// handler.
#[derive(Debug, Clone, Copy)]
pub struct ConnCtx {
    pub conn_id: Uuid,
    pub principal: Principal,
    pub addr: SocketAddr,
}

/// Bidirectional index of proximity groups: which driver connections serve
/// each customer, and which customers each driver connection serves. Both
/// directions are kept in step by every mutation, so eviction never has to
/// scan.
#[derive(Default)]
pub struct RoomTable {
    members: HashMap<i64, HashSet<Uuid>>,
    rooms: HashMap<Uuid, HashSet<i64>>,
}

impl RoomTable {
    /// Replaces the member set of one customer's group, applying only the
    /// difference to the reverse index.
    pub fn set_members(&mut self, customer_id: i64, new: HashSet<Uuid>) {
        let old = self
            .members
            .get(&customer_id)
            .cloned()
            .unwrap_or_default();

        for gone in old.difference(&new) {
            if let Some(rooms) = self.rooms.get_mut(gone) {
                rooms.remove(&customer_id);
                if rooms.is_empty() {
                    self.rooms.remove(gone);
                }
            }
        }
        for added in new.difference(&old) {
            self.rooms.entry(*added).or_default().insert(customer_id);
        }

        if new.is_empty() {
            self.members.remove(&customer_id);
        } else {
            self.members.insert(customer_id, new);
        }
    }

    /// Replaces the set of groups one driver connection belongs to.
    pub fn set_rooms(&mut self, conn_id: Uuid, new: HashSet<i64>) {
        let old = self.rooms.get(&conn_id).cloned().unwrap_or_default();

        for gone in old.difference(&new) {
            if let Some(members) = self.members.get_mut(gone) {
                members.remove(&conn_id);
                if members.is_empty() {
                    self.members.remove(gone);
                }
            }
        }
        for added in new.difference(&old) {
            self.members.entry(*added).or_default().insert(conn_id);
        }

        if new.is_empty() {
            self.rooms.remove(&conn_id);
        } else {
            self.rooms.insert(conn_id, new);
        }
    }

    pub fn evict_conn(&mut self, conn_id: &Uuid) {
        if let Some(rooms) = self.rooms.remove(conn_id) {
            for customer_id in rooms {
                if let Some(members) = self.members.get_mut(&customer_id) {
                    members.remove(conn_id);
                    if members.is_empty() {
                        self.members.remove(&customer_id);
                    }
                }
            }
        }
    }

    pub fn clear_customer(&mut self, customer_id: i64) {
        if let Some(members) = self.members.remove(&customer_id) {
            for conn_id in members {
                if let Some(rooms) = self.rooms.get_mut(&conn_id) {
                    rooms.remove(&customer_id);
                    if rooms.is_empty() {
                        self.rooms.remove(&conn_id);
                    }
                }
            }
        }
    }

    pub fn members_of(&self, customer_id: i64) -> Vec<Uuid> {
        self.members
            .get(&customer_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, conn_id: &Uuid) -> Vec<i64> {
        self.rooms
            .get(conn_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn customer_ids(&self) -> Vec<i64> {
        self.members.keys().copied().collect()
    }

    pub fn total_edges(&self) -> usize {
        self.members.values().map(HashSet::len).sum()
    }
}

pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub settings: SettingsCache,
    pub auth: AuthKeys,
    pub metrics: Metrics,
    pub drivers: DashMap<i64, DriverPresence>,
    pub customers: DashMap<i64, CustomerPresence>,
    pub conns: DashMap<Uuid, ConnectionHandle>,
    pub inspection_locks: DashMap<i64, InspectionLock>,
    pub pending_approvals: DashMap<i64, PendingApproval>,
    pub limiter: RateLimiter,
    pub spam: SpamGuard,
    pub timers: TimerManager,
    pub stats_tx: broadcast::Sender<ServerEvent>,
    rooms: RwLock<RoomTable>,
    order_locks: Vec<Arc<Mutex<()>>>,
}

impl AppState {
    pub fn new(config: Config, store: Store) -> Self {
        let (stats_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);
        let settings = SettingsCache::new(SettingsDefaults {
            search_radius_km: config.default_search_radius_km,
            location_freshness_mins: config.default_location_freshness_mins,
            cancellation_fee_percent: config.default_cancellation_fee_percent,
        });
        let order_locks = (0..ORDER_LOCK_SHARDS)
            .map(|_| Arc::new(Mutex::new(())))
            .collect();
        let auth = AuthKeys::new(
            &config.jwt_secret,
            config.access_token_ttl_secs,
            config.refresh_token_ttl_secs,
        );

        Self {
            config,
            store,
            settings,
            auth,
            metrics: Metrics::new(),
            drivers: DashMap::new(),
            customers: DashMap::new(),
            conns: DashMap::new(),
            inspection_locks: DashMap::new(),
            pending_approvals: DashMap::new(),
            limiter: RateLimiter::new(),
            spam: SpamGuard::new(),
            timers: TimerManager::new(),
            stats_tx,
            rooms: RwLock::new(RoomTable::default()),
            order_locks,
        }
    }

    pub fn rooms(&self) -> RwLockReadGuard<'_, RoomTable> {
        self.rooms.read().expect("room table lock poisoned")
    }

    pub fn rooms_mut(&self) -> RwLockWriteGuard<'_, RoomTable> {
        self.rooms.write().expect("room table lock poisoned")
    }

    /// Lock serializing handlers that touch the same order. Shards are
    /// allocated once and never pruned, so two handlers can never hold
    /// different locks for one order id.
    pub fn order_guard(&self, order_id: i64) -> Arc<Mutex<()>> {
        let shard = order_id.rem_euclid(ORDER_LOCK_SHARDS as i64) as usize;
        Arc::clone(&self.order_locks[shard])
    }

    /// True if the event was queued; a closed queue or unknown connection
    /// reports false and the caller decides whether that matters.
    pub fn send_to_conn(&self, conn_id: &Uuid, event: ServerEvent) -> bool {
        match self.conns.get(conn_id) {
            Some(handle) => handle.tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn send_to_driver(&self, driver_id: i64, event: ServerEvent) -> bool {
        let conn_id = match self.drivers.get(&driver_id) {
            Some(presence) => presence.conn_id,
            None => return false,
        };
        self.send_to_conn(&conn_id, event)
    }

    pub fn send_to_customer(&self, customer_id: i64, event: ServerEvent) -> bool {
        let conn_id = match self.customers.get(&customer_id) {
            Some(presence) => presence.conn_id,
            None => return false,
        };
        self.send_to_conn(&conn_id, event)
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            drivers_connected: self.drivers.len(),
            customers_connected: self.customers.len(),
            room_memberships: self.rooms().total_edges(),
            inspection_locks: self.inspection_locks.len(),
            pending_approvals: self.pending_approvals.len(),
            taken_at: Utc::now(),
        }
    }

    pub fn sync_presence_gauges(&self) {
        self.metrics.drivers_connected.set(self.drivers.len() as i64);
        self.metrics.customers_connected.set(self.customers.len() as i64);
        self.metrics
            .room_memberships
            .set(self.rooms().total_edges() as i64);
    }
}
