//! # Peer Registry
//!
//! The registry owns every open peer connection and the **live**
//! routing table, all under one shared-exclusive lock together with a
//! monotonically increasing table epoch:
//!
//! - `pool`: node id → peer handle
//! - `trans`: network address → node id (reverse lookup for transports)
//! - `routes`: the live [`RoutingTable`] read by everything outside
//!   the manager
//! - `time`: bumped on every table commit
//!
//! The exclusive side is taken only by the manager's commit and by the
//! drop path; all other accessors read under the shared side. Guards
//! are never held across an await, and no path feeds the drop queue
//! while holding the lock.
//!
//! Peers are owned here exclusively: the routing table stores ids, not
//! handles, so dropping a peer can never dangle a table reference —
//! stale ids are cleaned by the next converge cycle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::debug;

use crate::id::{prefix, NodeId};
use crate::messages::Envelope;
use crate::table::RoutingTable;

/// An open peer connection handle.
///
/// Created by the dial/accept path, destroyed by [`Peer::close`]. The
/// handle only enqueues onto the connection's bounded outbound queue;
/// the transport's send task drains it. Closing is idempotent and
/// observable through [`Peer::closed`].
pub struct Peer {
    node_id: NodeId,
    addrs: Vec<String>,
    outbound: mpsc::Sender<Envelope>,
    shut: AtomicBool,
    shut_signal: Notify,
}

impl Peer {
    /// Build a peer handle plus the receiving end of its outbound
    /// queue, which the transport's send task (or a test) drains.
    pub fn new(
        node_id: NodeId,
        addrs: Vec<String>,
        queue: usize,
    ) -> (Arc<Peer>, mpsc::Receiver<Envelope>) {
        let (outbound, rx) = mpsc::channel(queue);
        let peer = Arc::new(Peer {
            node_id,
            addrs,
            outbound,
            shut: AtomicBool::new(false),
            shut_signal: Notify::new(),
        });
        (peer, rx)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// Enqueue an envelope without blocking. Fails when the peer is
    /// closed or its queue is full — callers treat either as a link
    /// failure and schedule a drop.
    pub fn enqueue(&self, env: Envelope) -> Result<()> {
        if self.shut.load(Ordering::Acquire) {
            anyhow::bail!("peer {} is closed", self.node_id.short());
        }
        self.outbound
            .try_send(env)
            .map_err(|err| anyhow::anyhow!("peer {} send failed: {}", self.node_id.short(), err))
    }

    /// Close the connection. Safe to call any number of times.
    pub fn close(&self) {
        if !self.shut.swap(true, Ordering::AcqRel) {
            self.shut_signal.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }

    /// Resolve once the peer has been closed.
    pub async fn closed(&self) {
        let mut notified = std::pin::pin!(self.shut_signal.notified());
        loop {
            // Enable the wakeup before checking the flag, or a close
            // racing between the check and the await would be lost.
            notified.as_mut().enable();
            if self.shut.load(Ordering::Acquire) {
                return;
            }
            notified.as_mut().await;
            notified.set(self.shut_signal.notified());
        }
    }
}

struct Inner {
    pool: HashMap<NodeId, Arc<Peer>>,
    trans: HashMap<String, NodeId>,
    routes: RoutingTable,
    time: u64,
}

/// Shared peer and routing state. See the module docs for the locking
/// discipline.
pub struct Registry {
    self_id: NodeId,
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            inner: RwLock::new(Inner {
                pool: HashMap::new(),
                trans: HashMap::new(),
                routes: RoutingTable::new(),
                time: 0,
            }),
        }
    }

    /// Insert a freshly authenticated peer. When the id is already
    /// pooled (the dial/accept race) the incumbent wins and `false` is
    /// returned; the caller closes the newcomer.
    pub fn insert(&self, peer: Arc<Peer>) -> bool {
        let mut inner = self.write();
        if inner.pool.contains_key(peer.node_id()) {
            return false;
        }
        for addr in peer.addrs() {
            inner.trans.insert(addr.clone(), *peer.node_id());
        }
        inner.pool.insert(*peer.node_id(), peer);
        true
    }

    /// Remove dropped peers, returning the ids actually removed.
    ///
    /// A peer is only removed when the pooled handle is the very same
    /// one being dropped: a reconnect may already have replaced it, in
    /// which case the stale drop is a no-op. The cheap shared-lock scan
    /// runs first so drop storms of already-gone peers never take the
    /// exclusive side.
    pub fn remove(&self, drops: &[Arc<Peer>]) -> Vec<NodeId> {
        if drops.is_empty() {
            return Vec::new();
        }
        let any = {
            let inner = self.read();
            drops.iter().any(|d| {
                inner
                    .pool
                    .get(d.node_id())
                    .is_some_and(|p| Arc::ptr_eq(p, d))
            })
        };
        if !any {
            return Vec::new();
        }

        let mut removed = Vec::new();
        let mut inner = self.write();
        for d in drops {
            let pooled = inner
                .pool
                .get(d.node_id())
                .is_some_and(|p| Arc::ptr_eq(p, d));
            if pooled {
                inner.pool.remove(d.node_id());
                for addr in d.addrs() {
                    inner.trans.remove(addr);
                }
                removed.push(*d.node_id());
            }
        }
        removed
    }

    pub fn peer(&self, id: &NodeId) -> Option<Arc<Peer>> {
        self.read().pool.get(id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.read().pool.contains_key(id)
    }

    /// Reverse lookup: which node advertises this address.
    pub fn resolve(&self, addr: &str) -> Option<NodeId> {
        self.read().trans.get(addr).copied()
    }

    /// Snapshot of every pooled peer.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.read().pool.values().cloned().collect()
    }

    pub fn pool_ids(&self) -> Vec<NodeId> {
        self.read().pool.keys().copied().collect()
    }

    pub fn pool_id_set(&self) -> HashSet<NodeId> {
        self.read().pool.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().pool.is_empty()
    }

    /// Current table epoch.
    pub fn epoch(&self) -> u64 {
        self.read().time
    }

    /// Clone of the live table, the manager's shadow starting point.
    pub fn live(&self) -> RoutingTable {
        self.read().routes.clone()
    }

    /// Diff a candidate table against the live one under a single
    /// shared acquisition: `(changed, needs_repair)`.
    pub fn diff(&self, candidate: &RoutingTable) -> (bool, bool) {
        self.read().routes.changed(candidate)
    }

    /// Swap in a converged table and bump the epoch. The one exclusive
    /// acquisition of a converge cycle.
    pub fn commit(&self, table: RoutingTable) -> u64 {
        let mut inner = self.write();
        inner.routes = table;
        inner.time += 1;
        inner.time
    }

    /// Whether `id` is used for routing (present in live leaves or
    /// cells). Pooled peers failing this are passive.
    pub fn is_active(&self, id: &NodeId) -> bool {
        self.read().routes.contains(id)
    }

    /// One shared acquisition for the beater: the epoch and every peer
    /// tagged with its passive flag.
    pub fn beat_snapshot(&self) -> (u64, Vec<(Arc<Peer>, bool)>) {
        let inner = self.read();
        let peers = inner
            .pool
            .values()
            .map(|p| (p.clone(), !inner.routes.contains(p.node_id())))
            .collect();
        (inner.time, peers)
    }

    /// Assemble a full state exchange for `recipient` under one shared
    /// acquisition: own addresses, every pooled leaf, and the pooled
    /// entries of the recipient's prefix row. Every id is re-checked
    /// against the pool — the table may reference peers that dropped
    /// since the last commit.
    pub fn exchange_state(
        &self,
        self_addrs: &[String],
        recipient: &NodeId,
    ) -> (u64, HashMap<String, Vec<String>>) {
        let inner = self.read();
        let mut addrs = HashMap::new();
        addrs.insert(self.self_id.to_string(), self_addrs.to_vec());
        for id in inner.routes.leaves() {
            if let Some(peer) = inner.pool.get(id) {
                addrs.insert(id.to_string(), peer.addrs().to_vec());
            }
        }
        if *recipient != self.self_id {
            let (row, _) = prefix(&self.self_id, recipient);
            for id in inner.routes.row(row).iter().flatten() {
                if let Some(peer) = inner.pool.get(id) {
                    addrs.insert(id.to_string(), peer.addrs().to_vec());
                }
            }
        }
        (inner.time, addrs)
    }

    /// Select the next hop toward `target`.
    ///
    /// Leaf-set closest when `target` falls inside the leaf span;
    /// otherwise the prefix cell for `target`; when that cell is empty
    /// or stale, the pooled id closest to `target` by ring distance.
    pub fn route(&self, target: &NodeId) -> Option<Arc<Peer>> {
        if *target == self.self_id {
            return None;
        }
        let inner = self.read();
        let leaves = inner.routes.leaves();

        if !leaves.is_empty() && self.in_leaf_span(leaves, target) {
            let nearest = leaves
                .iter()
                .copied()
                .min_by_key(|leaf| target.ring_distance(leaf))
                .expect("leaves checked non-empty");
            if let Some(peer) = inner.pool.get(&nearest) {
                return Some(peer.clone());
            }
            debug!(id = %nearest.short(), "closest leaf has no pooled peer");
        }

        let (row, col) = prefix(&self.self_id, target);
        if let Some(id) = inner.routes.cell(row, col) {
            if let Some(peer) = inner.pool.get(&id) {
                return Some(peer.clone());
            }
        }

        // Fall back to the closest reachable id on the ring.
        inner
            .pool
            .iter()
            .min_by_key(|(id, _)| target.ring_distance(*id))
            .map(|(_, peer)| Arc::clone(peer))
    }

    /// Whether `target` lies on the ring arc covered by the leaf set:
    /// no further from `self` than the outermost leaf on its side.
    fn in_leaf_span(&self, leaves: &[NodeId], target: &NodeId) -> bool {
        const HALF_RING: u8 = 0x80;
        let off = self.self_id.ring_offset(target);
        let successor = off[0] < HALF_RING;
        if successor {
            leaves
                .iter()
                .map(|l| self.self_id.ring_offset(l))
                .filter(|o| o[0] < HALF_RING)
                .max()
                .is_some_and(|max| off <= max)
        } else {
            leaves
                .iter()
                .map(|l| self.self_id.ring_offset(l))
                .filter(|o| o[0] >= HALF_RING)
                .min()
                .is_some_and(|min| off >= min)
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("registry lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("registry lock poisoned")
    }
}
