//! # Leaf Set and Prefix Routing Table
//!
//! The overlay's routing state is a Pastry-style pair:
//!
//! - **Leaf set**: the window of nearest ids around `self` on the ring,
//!   up to `L/2` on each side, stored in circular order anchored at
//!   `self` (the ring starts immediately after `self` and increases).
//! - **Prefix table**: [`ROWS`] × [`BASE`] cells where `routes[r][c]`
//!   holds an id sharing exactly `r` leading digits with `self` and
//!   having digit `c` at position `r`. The diagonal cell (`c` equal to
//!   `self`'s own digit) stays empty.
//!
//! Everything in this module is a pure value operation: no I/O, no
//! locks. The manager owns a shadow copy, converges it with these
//! operations, and swaps it into the registry when done.
//!
//! ## Invariants
//!
//! - All stored ids are distinct and never equal to `self`.
//! - Every non-empty cell satisfies `prefix(self, id) == (r, c)`.
//! - The leaf set holds the up-to-`L/2` nearest ids on each side of
//!   `self`, in anchored circular order.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::id::{prefix, NodeId, BASE, ROWS};

/// Pastry-style routing state: leaf window plus prefix-addressed cells.
#[derive(Clone)]
pub struct RoutingTable {
    leaves: Vec<NodeId>,
    rows: Vec<[Option<NodeId>; BASE]>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            leaves: Vec::new(),
            rows: vec![[None; BASE]; ROWS],
        }
    }

    /// The leaf window, in circular order anchored at `self`.
    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    /// A single prefix cell.
    pub fn cell(&self, row: usize, col: usize) -> Option<NodeId> {
        self.rows[row][col]
    }

    /// One full prefix row, as shipped in a state exchange.
    pub fn row(&self, row: usize) -> &[Option<NodeId>; BASE] {
        &self.rows[row]
    }

    /// Whether `id` appears anywhere in the leaves or the prefix cells.
    /// Peers failing this test are passive: connected but unused for
    /// routing.
    pub fn contains(&self, id: &NodeId) -> bool {
        if self.leaves.contains(id) {
            return true;
        }
        self.rows
            .iter()
            .any(|row| row.iter().any(|cell| cell.as_ref() == Some(id)))
    }

    /// Merge a received state exchange into the table.
    ///
    /// Each id is parsed from its hex key; `self` and malformed entries
    /// are skipped (logged, never fatal). Parsed addresses are recorded
    /// into `scratch` for later dialing. New ids extend the leaf window
    /// and fill empty prefix cells; an occupied cell keeps its
    /// incumbent (the less disruptive, deterministic choice).
    pub fn merge(
        &mut self,
        self_id: &NodeId,
        leaves_cap: usize,
        scratch: &mut HashMap<String, Vec<String>>,
        addrs: &HashMap<String, Vec<String>>,
    ) {
        let mut ids = Vec::with_capacity(addrs.len());
        for (sid, peer_addrs) in addrs {
            match sid.parse::<NodeId>() {
                Ok(id) => {
                    if id == *self_id {
                        continue;
                    }
                    scratch.insert(sid.clone(), peer_addrs.clone());
                    ids.push(id);
                }
                Err(err) => {
                    warn!(id = %sid, %err, "ignoring malformed node id in state exchange");
                }
            }
        }
        self.leaves = merge_leaves(self_id, leaves_cap, &self.leaves, &ids);

        for id in &ids {
            let (row, col) = prefix(self_id, id);
            if self.rows[row][col].is_none() {
                self.rows[row][col] = Some(*id);
            }
            // Occupied by a different id: keep the incumbent.
        }
    }

    /// Ids referenced by the table but missing from the connection
    /// pool, sorted and deduplicated. These are the peers a converging
    /// manager must dial (first pass) or revoke (second pass).
    pub fn missing(&self, pool: &HashSet<NodeId>) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .leaves
            .iter()
            .chain(self.rows.iter().flatten().flatten())
            .filter(|id| !pool.contains(*id))
            .copied()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Remove unreachable ids, repairing from the live pool.
    ///
    /// Downed leaves are dropped and the window is backfilled from the
    /// pooled ids; downed prefix cells are cleared and refilled with
    /// any pooled id landing in the same cell.
    pub fn revoke(
        &mut self,
        self_id: &NodeId,
        leaves_cap: usize,
        downs: &[NodeId],
        pool: &[NodeId],
    ) {
        let mut downs = downs.to_vec();
        downs.sort();

        let before = self.leaves.len();
        self.leaves.retain(|id| downs.binary_search(id).is_err());
        if self.leaves.len() != before {
            self.leaves = merge_leaves(self_id, leaves_cap, &self.leaves, pool);
        }

        for row in 0..ROWS {
            for col in 0..BASE {
                let down = match self.rows[row][col] {
                    Some(id) => downs.binary_search(&id).is_ok(),
                    None => false,
                };
                if down {
                    self.rows[row][col] = pool
                        .iter()
                        .copied()
                        .find(|p| prefix(self_id, p) == (row, col));
                }
            }
        }
    }

    /// Compare against a candidate table: `(changed, needs_repair)`.
    ///
    /// `changed` is any leaf or cell difference. `needs_repair` is a
    /// cell that went from occupied to empty, meaning a route slot was
    /// lost and peers should be asked for their state to refill it.
    pub fn changed(&self, new: &RoutingTable) -> (bool, bool) {
        let mut changed = self.leaves != new.leaves;
        let mut repair = false;
        for row in 0..ROWS {
            for col in 0..BASE {
                match (self.rows[row][col], new.rows[row][col]) {
                    (Some(_), None) => {
                        changed = true;
                        repair = true;
                    }
                    (None, Some(_)) => changed = true,
                    (Some(old), Some(new)) if old != new => changed = true,
                    _ => {}
                }
            }
        }
        (changed, repair)
    }
}

/// Merge two leaf lists into the window of nearest ids around `self`.
///
/// The union is sorted by clockwise offset from `self`, deduplicated,
/// and trimmed to the `cap/2` nearest successors plus the `cap/2`
/// nearest predecessors. The result stays in anchored circular order
/// (successors ascending, then predecessors), with `self` excluded.
pub fn merge_leaves(self_id: &NodeId, cap: usize, a: &[NodeId], b: &[NodeId]) -> Vec<NodeId> {
    let mut all: Vec<NodeId> = a
        .iter()
        .chain(b.iter())
        .filter(|id| *id != self_id)
        .copied()
        .collect();
    all.sort_by(|x, y| self_id.ring_offset(x).cmp(&self_id.ring_offset(y)));
    all.dedup();

    if all.len() <= cap {
        return all;
    }
    let half = cap / 2;
    let mut window = Vec::with_capacity(cap);
    window.extend_from_slice(&all[..half]);
    window.extend_from_slice(&all[all.len() - half..]);
    window
}
