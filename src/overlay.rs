//! # Overlay Facade
//!
//! [`Overlay`] ties the maintenance core together: the peer registry,
//! the convergence manager, the heartbeat beater and the liveness
//! monitor. It is the single surface outer layers talk to:
//!
//! - transports hand over authenticated connections with
//!   [`Overlay::adopt`] and inbound state records with
//!   [`Overlay::deliver`];
//! - message layers pick next hops with [`Overlay::route`] and park on
//!   [`Overlay::wait_until_stable`];
//! - everything runs between [`Overlay::boot`] and
//!   [`Overlay::shutdown`].
//!
//! ## Failure model
//!
//! Nothing here returns a fatal error: a failed send schedules the
//! peer on the drop queue from a detached task (the caller may hold
//! the shared registry lock — feeding the queue inline could deadlock
//! against the manager), a dead heartbeat becomes a drop, and a drop
//! triggers table repair on the next converge cycle. The only exit is
//! an explicit shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::OverlayConfig;
use crate::heart::{Callback, Heart, HeartError};
use crate::id::NodeId;
use crate::maintenance;
use crate::messages::{Envelope, State};
use crate::protocols::Dialer;
use crate::registry::{Peer, Registry};
use crate::table::RoutingTable;

/// Heart callback bridging liveness into the maintenance loop: a dead
/// peer is posted to the drop queue, never handled inline.
struct DropOnDead {
    registry: Arc<Registry>,
    drop_tx: mpsc::Sender<Arc<Peer>>,
}

impl Callback for DropOnDead {
    fn beat(&self) {}

    fn dead(&self, id: NodeId) {
        if let Some(peer) = self.registry.peer(&id) {
            warn!(id = %id.short(), "peer missed its heartbeats, dropping");
            let drop_tx = self.drop_tx.clone();
            tokio::spawn(async move {
                let _ = drop_tx.send(peer).await;
            });
        }
    }
}

/// Queue ends handed to the manager at boot.
struct BootParts {
    up_rx: mpsc::Receiver<State>,
    drop_rx: mpsc::Receiver<Arc<Peer>>,
}

pub(crate) struct Shared<D: Dialer> {
    pub(crate) config: OverlayConfig,
    pub(crate) node_id: NodeId,
    pub(crate) addrs: Vec<String>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) dialer: D,
    pub(crate) up_tx: mpsc::Sender<State>,
    pub(crate) drop_tx: mpsc::Sender<Arc<Peer>>,
    pub(crate) quit: watch::Sender<bool>,
    pub(crate) stable: watch::Sender<bool>,
    pub(crate) heart: Heart,
    boot: Mutex<Option<BootParts>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: Dialer> Shared<D> {
    /// Merge a received state exchange into the manager's shadow
    /// table, recording the advertised addresses for later dials.
    pub(crate) fn merge(
        &self,
        routes: &mut RoutingTable,
        scratch: &mut HashMap<String, Vec<String>>,
        state: &State,
    ) {
        routes.merge(&self.node_id, self.config.leaves, scratch, &state.addrs);
    }

    /// Enqueue an envelope on a peer, converting any failure into a
    /// drop posted from a detached task.
    pub(crate) fn send(&self, env: Envelope, peer: &Arc<Peer>) {
        if let Err(err) = peer.enqueue(env) {
            debug!(peer = %peer.node_id().short(), %err, "send failed, scheduling drop");
            let drop_tx = self.drop_tx.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                let _ = drop_tx.send(peer).await;
            });
        }
    }

    /// Announce the local addresses to a freshly connected peer.
    pub(crate) fn send_join(&self, peer: &Arc<Peer>) {
        let mut addrs = HashMap::new();
        addrs.insert(self.node_id.to_string(), self.addrs.clone());
        let state = State {
            addrs,
            ..State::default()
        };
        self.send(
            Envelope {
                dest: self.node_id,
                state,
            },
            peer,
        );
    }

    /// Ship the full routing state to a peer: own addresses, pooled
    /// leaves, and the recipient's prefix row. `repair` asks the peer
    /// to answer with its own state.
    pub(crate) fn send_state(&self, peer: &Arc<Peer>, repair: bool) {
        let (updated, addrs) = self.registry.exchange_state(&self.addrs, peer.node_id());
        let state = State {
            addrs,
            updated,
            repair,
            passive: false,
        };
        self.send(
            Envelope {
                dest: self.node_id,
                state,
            },
            peer,
        );
    }

    /// Heartbeat a peer, tagging whether it is unused for routing.
    pub(crate) fn send_beat(&self, peer: &Arc<Peer>, updated: u64, passive: bool) {
        self.send(
            Envelope {
                dest: *peer.node_id(),
                state: State::beat(updated, passive),
            },
            peer,
        );
    }

    /// Take ownership of an authenticated connection: pool it, monitor
    /// its liveness and announce ourselves. Returns false when the
    /// incumbent connection for the same id won (the newcomer is
    /// closed) or the peer turned out to be ourselves.
    pub(crate) fn adopt_peer(&self, peer: Arc<Peer>) -> bool {
        if *peer.node_id() == self.node_id {
            debug!("refusing loopback connection");
            peer.close();
            return false;
        }
        if !self.registry.insert(peer.clone()) {
            debug!(
                peer = %peer.node_id().short(),
                "duplicate connection, keeping the incumbent"
            );
            peer.close();
            return false;
        }
        if let Err(err) = self.heart.monitor(*peer.node_id()) {
            trace!(peer = %peer.node_id().short(), %err, "monitor on adopt");
        }
        self.send_join(&peer);
        true
    }

    /// Close dropped connections and clean them out of the registry
    /// and the liveness monitor.
    pub(crate) fn drop_peers(&self, drops: &[Arc<Peer>]) {
        if drops.is_empty() {
            return;
        }
        for peer in drops {
            peer.close();
        }
        let removed = self.registry.remove(drops);
        for id in &removed {
            // Already gone when the drop originated from the monitor.
            let _ = self.heart.unmonitor(id);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "dropped peer connections");
        }
    }

    pub(crate) fn set_stable(&self, stable: bool) {
        self.stable.send_replace(stable);
    }
}

/// Handle on a running overlay node. Cheap to clone; all clones drive
/// the same node.
pub struct Overlay<D: Dialer> {
    shared: Arc<Shared<D>>,
}

impl<D: Dialer> Clone for Overlay<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: Dialer> Overlay<D> {
    /// Assemble an overlay node around a local id, its advertised
    /// addresses and a dialer. Nothing runs until [`Overlay::boot`].
    pub fn new(
        config: OverlayConfig,
        node_id: NodeId,
        addrs: Vec<String>,
        dialer: D,
    ) -> Result<Self> {
        config.validate().context("invalid overlay configuration")?;

        let (up_tx, up_rx) = mpsc::channel(config.update_queue);
        let (drop_tx, drop_rx) = mpsc::channel(config.drop_queue);
        let (quit, _) = watch::channel(false);
        let (stable, _) = watch::channel(false);

        let registry = Arc::new(Registry::new(node_id));
        let heart = Heart::new(
            config.beat_period,
            config.kill_ticks,
            Arc::new(DropOnDead {
                registry: registry.clone(),
                drop_tx: drop_tx.clone(),
            }),
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                node_id,
                addrs,
                registry,
                dialer,
                up_tx,
                drop_tx,
                quit,
                stable,
                heart,
                boot: Mutex::new(Some(BootParts { up_rx, drop_rx })),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawn the manager, the beater and the liveness monitor. A
    /// second boot is a no-op.
    pub fn boot(&self) {
        let parts = self.shared.boot.lock().expect("boot lock poisoned").take();
        let Some(parts) = parts else {
            warn!("overlay already booted");
            return;
        };
        info!(id = %self.shared.node_id.short(), "booting overlay");
        self.shared.heart.start();
        let mut tasks = self.shared.tasks.lock().expect("task lock poisoned");
        tasks.push(tokio::spawn(maintenance::run_manager(
            self.shared.clone(),
            parts.up_rx,
            parts.drop_rx,
        )));
        tasks.push(tokio::spawn(maintenance::run_beater(self.shared.clone())));
    }

    /// Cooperatively stop every task, then close and clear all peer
    /// connections.
    pub async fn shutdown(&self) {
        info!(id = %self.shared.node_id.short(), "shutting down overlay");
        self.shared.quit.send_replace(true);
        self.shared.heart.terminate().await;
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.shared.tasks.lock().expect("task lock poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        let peers = self.shared.registry.peers();
        for peer in &peers {
            peer.close();
        }
        self.shared.registry.remove(&peers);
    }

    /// Hand over an authenticated connection (dial or accept path).
    /// Returns false when a connection for the same id already exists;
    /// the newcomer is closed.
    pub fn adopt(&self, peer: Arc<Peer>) -> bool {
        self.shared.adopt_peer(peer)
    }

    /// Deliver an inbound state record from `from`.
    ///
    /// Any record counts as proof of life. A repair request is answered
    /// immediately with the full local state; records carrying
    /// addresses are queued for the manager to merge.
    pub async fn deliver(&self, from: NodeId, state: State) {
        if let Err(err) = self.shared.heart.ping(&from) {
            trace!(peer = %from.short(), %err, "ping from unmonitored peer");
        }
        if state.repair {
            if let Some(peer) = self.shared.registry.peer(&from) {
                self.shared.send_state(&peer, false);
            }
        }
        if !state.addrs.is_empty() && self.shared.up_tx.send(state).await.is_err() {
            debug!("update queue closed, discarding state record");
        }
    }

    /// Select the next hop toward `target`: leaf set within the span,
    /// prefix table otherwise, closest pooled id as a last resort.
    pub fn route(&self, target: &NodeId) -> Option<Arc<Peer>> {
        self.shared.registry.route(target)
    }

    /// Park until the overlay next reports local quiescence. Stability
    /// is advisory: it means no churn was seen locally for the
    /// configured timeout, not a global property.
    pub async fn wait_until_stable(&self) {
        let mut stable = self.shared.stable.subscribe();
        let _ = stable.wait_for(|stable| *stable).await;
    }

    /// Current value of the stability latch.
    pub fn is_stable(&self) -> bool {
        *self.shared.stable.borrow()
    }

    /// Start watching an entity on the liveness monitor.
    pub fn monitor(&self, id: NodeId) -> Result<(), HeartError> {
        self.shared.heart.monitor(id)
    }

    /// Stop watching an entity.
    pub fn unmonitor(&self, id: &NodeId) -> Result<(), HeartError> {
        self.shared.heart.unmonitor(id)
    }

    /// Refresh an entity's liveness.
    pub fn ping(&self, id: &NodeId) -> Result<(), HeartError> {
        self.shared.heart.ping(id)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.shared.node_id
    }

    pub fn addrs(&self) -> &[String] {
        &self.shared.addrs
    }

    /// Routing table epoch: bumped on every commit.
    pub fn epoch(&self) -> u64 {
        self.shared.registry.epoch()
    }

    /// Number of pooled peer connections.
    pub fn peer_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Look up a pooled peer by id.
    pub fn peer(&self, id: &NodeId) -> Option<Arc<Peer>> {
        self.shared.registry.peer(id)
    }

    /// Whether `id` is used for routing (live leaves or cells).
    pub fn is_active(&self, id: &NodeId) -> bool {
        self.shared.registry.is_active(id)
    }
}
