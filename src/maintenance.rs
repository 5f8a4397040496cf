//! # Convergence Manager and Beater
//!
//! One manager task processes state updates from all connected peers,
//! merging them into a shadow routing table, dialing discovered nodes
//! and dropping failed or useless connections, then atomically swaps
//! the live table and broadcasts the new state. One beater task
//! periodically heartbeats every pooled peer, tagging whether the
//! connection is active (used for routing) or passive.
//!
//! ## The three phases of a converge cycle
//!
//! - **Wait**: block on the update queue, the drop queue, shutdown, or
//!   the stability timer. Quiet for the whole timeout means locally
//!   stable; the latch releases exactly once per quiet spell.
//! - **Cascade**: drain both queues without blocking, close and remove
//!   dropped peers, dial every table id missing from the pool (all
//!   dials awaited together, each bounded by the auth timeout), then
//!   revoke whatever still failed to appear. Repeat until a full pass
//!   drains nothing — churn triggered by our own dials and drops must
//!   settle before a commit.
//! - **Commit**: if the shadow differs from the live table, swap under
//!   the exclusive registry lock, bump the epoch, and rebroadcast the
//!   state to every pooled peer on the bounded exchange pool. Pending
//!   broadcasts from the previous cycle are aborted first — the fresh
//!   state supersedes them.
//!
//! No event in here is fatal: dial failures leave ids undiscovered
//! (revoked on the second discovery pass), send failures feed the drop
//! queue, and a drop just drives the next cycle. The only exit is the
//! shutdown signal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::messages::State;
use crate::overlay::Shared;
use crate::protocols::Dialer;
use crate::registry::Peer;
use crate::table::RoutingTable;

/// Queue a peer for dropping, once per connection handle.
fn push_drop(drops: &mut Vec<Arc<Peer>>, peer: Arc<Peer>) {
    if !drops.iter().any(|p| Arc::ptr_eq(p, &peer)) {
        drops.push(peer);
    }
}

/// The manager task. Runs until shutdown.
pub(crate) async fn run_manager<D: Dialer>(
    o: Arc<Shared<D>>,
    mut up_rx: mpsc::Receiver<State>,
    mut drop_rx: mpsc::Receiver<Arc<Peer>>,
) {
    let mut quit = o.quit.subscribe();
    if *quit.borrow() {
        return;
    }

    // Broadcast limiter: aborted wholesale when a newer table commits.
    let exch_permits = Arc::new(Semaphore::new(o.config.exch_workers));
    let mut exch_pool: JoinSet<()> = JoinSet::new();

    let mut stable = false;
    let mut stable_time = o.config.boot_timeout;
    let mut shadow: Option<RoutingTable> = None;

    loop {
        // Shadow copy of the live table, kept across cycles that did
        // not commit.
        let mut routes = shadow.take().unwrap_or_else(|| o.registry.live());
        let mut scratch: HashMap<String, Vec<String>> = HashMap::new();
        let mut drops: Vec<Arc<Peer>> = Vec::new();

        // Phase 1: wait for churn.
        loop {
            tokio::select! {
                changed = quit.changed() => {
                    if changed.is_err() || *quit.borrow() {
                        return;
                    }
                }
                update = up_rx.recv() => {
                    match update {
                        Some(state) => {
                            o.merge(&mut routes, &mut scratch, &state);
                            break;
                        }
                        None => return,
                    }
                }
                dropped = drop_rx.recv() => {
                    match dropped {
                        Some(peer) => {
                            push_drop(&mut drops, peer);
                            break;
                        }
                        None => return,
                    }
                }
                _ = tokio::time::sleep(stable_time) => {
                    if !stable {
                        stable = true;
                        o.set_stable(true);
                        debug!("overlay reached local stability");
                    }
                }
            }
        }
        // Churn arrived: unstable again, and later quiet spells only
        // need the shorter convergence timeout.
        if stable {
            stable = false;
            o.set_stable(false);
        }
        stable_time = o.config.conv_timeout;

        // Phase 2: cascade merges, drops and dials until quiescent.
        loop {
            let mut cascade = false;
            while let Ok(state) = up_rx.try_recv() {
                o.merge(&mut routes, &mut scratch, &state);
                cascade = true;
            }
            while let Ok(peer) = drop_rx.try_recv() {
                push_drop(&mut drops, peer);
                cascade = true;
            }
            o.drop_peers(&drops);

            let pending = routes.missing(&o.registry.pool_id_set());
            if !pending.is_empty() {
                trace!(count = pending.len(), "dialing discovered peers");
                let mut dials: JoinSet<()> = JoinSet::new();
                for id in pending {
                    // Resolve the advertised addresses; a bad entry is
                    // dropped, the rest are still dialed.
                    let addrs: Vec<String> = scratch
                        .get(&id.to_string())
                        .map(|addrs| addrs.as_slice())
                        .unwrap_or_default()
                        .iter()
                        .filter(|addr| match addr.parse::<SocketAddr>() {
                            Ok(_) => true,
                            Err(err) => {
                                warn!(%addr, %err, "failed to resolve peer address");
                                false
                            }
                        })
                        .cloned()
                        .collect();
                    if addrs.is_empty() {
                        debug!(id = %id.short(), "discovered peer has no usable addresses");
                        continue;
                    }
                    let o = o.clone();
                    dials.spawn(async move {
                        match tokio::time::timeout(o.config.auth_timeout, o.dialer.dial(&addrs))
                            .await
                        {
                            Ok(Ok(peer)) => {
                                o.adopt_peer(peer);
                            }
                            Ok(Err(err)) => {
                                debug!(id = %id.short(), %err, "failed to dial peer")
                            }
                            Err(_) => debug!(id = %id.short(), "dial timed out"),
                        }
                    });
                }
                // Every outbound attempt completes or times out before
                // the broken links are judged.
                while dials.join_next().await.is_some() {}

                let downs = routes.missing(&o.registry.pool_id_set());
                if !downs.is_empty() {
                    warn!(count = downs.len(), "revoking unreachable peers");
                    routes.revoke(
                        &o.node_id,
                        o.config.leaves,
                        &downs,
                        &o.registry.pool_ids(),
                    );
                }
            }
            if !cascade {
                break;
            }
        }

        // Phase 3: swap and broadcast if anything changed.
        let (changed, repair) = o.registry.diff(&routes);
        if changed {
            let epoch = o.registry.commit(routes);
            debug!(epoch, repair, "committed converged routing table");

            // Stale broadcasts describe a table nobody holds anymore.
            exch_pool.abort_all();
            while exch_pool.try_join_next().is_some() {}
            for peer in o.registry.peers() {
                let o = o.clone();
                let permits = exch_permits.clone();
                exch_pool.spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    o.send_state(&peer, repair);
                });
            }
        } else {
            shadow = Some(routes);
        }
    }
}

/// The beater task: heartbeat every pooled peer each period, marking
/// connections that are not referenced by the live table as passive.
pub(crate) async fn run_beater<D: Dialer>(o: Arc<Shared<D>>) {
    let mut quit = o.quit.subscribe();
    if *quit.borrow() {
        return;
    }
    let mut ticker = tokio::time::interval(o.config.beat_period);
    ticker.tick().await;
    loop {
        tokio::select! {
            changed = quit.changed() => {
                if changed.is_err() || *quit.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let (updated, peers) = o.registry.beat_snapshot();
                for (peer, passive) in peers {
                    o.send_beat(&peer, updated, passive);
                }
            }
        }
    }
}
