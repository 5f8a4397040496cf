//! # Heartbeat Monitor
//!
//! A generic liveness monitor over a set of entities identified by
//! [`NodeId`]. The monitor keeps an integer tick that advances once per
//! beat period; every entity remembers the tick at which it was last
//! pinged, and an entity that falls `kill` ticks behind is reported
//! dead through a callback.
//!
//! ## Callback contract
//!
//! After each beat cycle the monitor invokes `beat()` once, then
//! `dead(id)` once per expired entity in collection order. Callbacks
//! run on the monitor task with the internal lock already released, so
//! a `dead` handler may call straight back into [`Heart::unmonitor`]
//! (or any other operation) without deadlocking. Within one monitor
//! instance callbacks are never concurrent with each other.
//!
//! ## Numeric semantics
//!
//! An entity pinged at tick `T` is reported at the end of the cycle
//! whose post-increment tick equals `T + kill`. Newly monitored
//! entities start at the current tick and therefore get the full grace
//! period. A reported entity is removed from monitoring, so each
//! silence is reported exactly once; re-monitor to resume watching.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::id::NodeId;

/// Events reported by the monitor. Implementations must be cheap and
/// non-blocking; they run on the monitor task.
pub trait Callback: Send + Sync + 'static {
    /// A beat cycle completed.
    fn beat(&self);
    /// `id` missed too many consecutive ticks and was dropped from
    /// monitoring.
    fn dead(&self, id: NodeId);
}

/// Validation errors surfaced by the monitor operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartError {
    /// `monitor` was called for an id that is already monitored.
    DuplicateEntry,
    /// `unmonitor` or `ping` was called for an id that is not monitored.
    NotMonitored,
}

impl fmt::Display for HeartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeartError::DuplicateEntry => write!(f, "entity is already monitored"),
            HeartError::NotMonitored => write!(f, "entity is not monitored"),
        }
    }
}

impl std::error::Error for HeartError {}

/// A monitored entity: its id and the tick of its last ping. The
/// monitor keeps entities sorted by id for binary-search lookup.
struct Entity {
    id: NodeId,
    last_tick: u64,
}

struct HeartState {
    entities: Vec<Entity>,
    tick: u64,
}

impl HeartState {
    fn find(&self, id: &NodeId) -> Result<usize, usize> {
        self.entities.binary_search_by(|e| e.id.cmp(id))
    }

    /// One beat cycle under the lock: advance the tick, collect and
    /// remove every entity that fell `kill` ticks behind.
    fn advance(&mut self, kill: u64) -> Vec<NodeId> {
        self.tick += 1;
        let tick = self.tick;
        let mut dead = Vec::new();
        self.entities.retain(|e| {
            if tick - e.last_tick >= kill {
                dead.push(e.id);
                false
            } else {
                true
            }
        });
        dead
    }
}

/// Tick-based liveness monitor. Cheap to share behind an [`Arc`];
/// operations lock briefly and never block on the network.
pub struct Heart {
    state: Arc<Mutex<HeartState>>,
    beat: Duration,
    kill: u64,
    callback: Arc<dyn Callback>,
    quit: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heart {
    /// A monitor beating every `beat`, reporting entities dead after
    /// `kill` missed ticks. Nothing runs until [`Heart::start`].
    pub fn new(beat: Duration, kill: u64, callback: Arc<dyn Callback>) -> Self {
        let (quit, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(HeartState {
                entities: Vec::new(),
                tick: 0,
            })),
            beat,
            kill,
            callback,
            quit,
            task: Mutex::new(None),
        }
    }

    /// Spawn the beater task. Calling twice is a no-op.
    pub fn start(&self) {
        let mut slot = self.task.lock().expect("heart task lock poisoned");
        if slot.is_some() {
            return;
        }
        let state = self.state.clone();
        let callback = self.callback.clone();
        let kill = self.kill;
        let beat = self.beat;
        let mut quit = self.quit.subscribe();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(beat);
            // The first interval tick fires immediately; a beat cycle
            // must only complete after a full period.
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = quit.changed() => {
                        // A dropped sender terminates just like an
                        // explicit signal.
                        if changed.is_err() || *quit.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        let dead = state
                            .lock()
                            .expect("heart state lock poisoned")
                            .advance(kill);
                        callback.beat();
                        for id in dead {
                            trace!(id = %id.short(), "entity missed its heartbeats");
                            callback.dead(id);
                        }
                    }
                }
            }
        }));
    }

    /// Stop the beater. Terminated is absorbing: no callback fires
    /// after this returns.
    pub async fn terminate(&self) {
        let _ = self.quit.send(true);
        let task = self.task.lock().expect("heart task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Register `id`, starting its grace period at the current tick.
    pub fn monitor(&self, id: NodeId) -> Result<(), HeartError> {
        let mut state = self.state.lock().expect("heart state lock poisoned");
        match state.find(&id) {
            Ok(_) => Err(HeartError::DuplicateEntry),
            Err(pos) => {
                let last_tick = state.tick;
                state.entities.insert(pos, Entity { id, last_tick });
                Ok(())
            }
        }
    }

    /// Remove `id` from monitoring.
    pub fn unmonitor(&self, id: &NodeId) -> Result<(), HeartError> {
        let mut state = self.state.lock().expect("heart state lock poisoned");
        match state.find(id) {
            Ok(pos) => {
                state.entities.remove(pos);
                Ok(())
            }
            Err(_) => Err(HeartError::NotMonitored),
        }
    }

    /// Refresh the last-seen tick of `id`.
    pub fn ping(&self, id: &NodeId) -> Result<(), HeartError> {
        let mut state = self.state.lock().expect("heart state lock poisoned");
        let tick = state.tick;
        match state.find(id) {
            Ok(pos) => {
                state.entities[pos].last_tick = tick;
                Ok(())
            }
            Err(_) => Err(HeartError::NotMonitored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};

    /// Recording callback: counts beats, collects deaths in order, and
    /// verifies deliveries never overlap.
    #[derive(Default)]
    struct Recorder {
        beats: AtomicUsize,
        dead: Mutex<Vec<NodeId>>,
        in_callback: AtomicUsize,
        overlapped: AtomicUsize,
    }

    impl Recorder {
        fn enter(&self) {
            if self.in_callback.fetch_add(1, Ordering::SeqCst) != 0 {
                self.overlapped.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn exit(&self) {
            self.in_callback.fetch_sub(1, Ordering::SeqCst);
        }

        fn deaths(&self) -> Vec<NodeId> {
            self.dead.lock().unwrap().clone()
        }
    }

    impl Callback for Recorder {
        fn beat(&self) {
            self.enter();
            self.beats.fetch_add(1, Ordering::SeqCst);
            self.exit();
        }

        fn dead(&self, id: NodeId) {
            self.enter();
            self.dead.lock().unwrap().push(id);
            self.exit();
        }
    }

    fn heart_with(beat_ms: u64, kill: u64) -> (Heart, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let heart = Heart::new(Duration::from_millis(beat_ms), kill, recorder.clone());
        (heart, recorder)
    }

    fn advance_only(kill: u64) -> (Heart, Arc<Recorder>) {
        // Never started: cycles are driven by hand through the state,
        // which keeps the numeric semantics tests free of timers.
        heart_with(60_000, kill)
    }

    fn cycle(heart: &Heart) -> Vec<NodeId> {
        heart.state.lock().unwrap().advance(heart.kill)
    }

    #[test]
    fn monitor_rejects_duplicates() {
        let (heart, _) = advance_only(3);
        let id = NodeId::random();
        heart.monitor(id).expect("first monitor");
        assert_eq!(heart.monitor(id), Err(HeartError::DuplicateEntry));
    }

    #[test]
    fn unmonitor_and_ping_require_membership() {
        let (heart, _) = advance_only(3);
        let id = NodeId::random();
        assert_eq!(heart.unmonitor(&id), Err(HeartError::NotMonitored));
        assert_eq!(heart.ping(&id), Err(HeartError::NotMonitored));
        heart.monitor(id).expect("monitor");
        heart.ping(&id).expect("ping");
        heart.unmonitor(&id).expect("unmonitor");
        assert_eq!(heart.ping(&id), Err(HeartError::NotMonitored));
    }

    #[test]
    fn silent_entity_dies_exactly_at_kill_ticks() {
        let (heart, _) = advance_only(3);
        let id = NodeId::random();
        heart.monitor(id).expect("monitor");
        assert!(cycle(&heart).is_empty(), "tick 1 is within grace");
        assert!(cycle(&heart).is_empty(), "tick 2 is within grace");
        assert_eq!(cycle(&heart), vec![id], "tick 3 expires the entity");
        // Removed on death: nothing further, and exactly once.
        assert!(cycle(&heart).is_empty());
        assert_eq!(heart.ping(&id), Err(HeartError::NotMonitored));
    }

    #[test]
    fn regular_pings_keep_an_entity_alive() {
        let (heart, _) = advance_only(3);
        let id = NodeId::random();
        heart.monitor(id).expect("monitor");
        // Pinging every kill - 1 cycles never lets the gap reach kill.
        for _ in 0..12 {
            assert!(cycle(&heart).is_empty());
            assert!(cycle(&heart).is_empty());
            heart.ping(&id).expect("ping");
        }
    }

    #[test]
    fn late_monitor_gets_a_full_grace_period() {
        let (heart, _) = advance_only(2);
        let early = NodeId::random();
        heart.monitor(early).expect("monitor");
        assert!(cycle(&heart).is_empty());
        // Joins at tick 1: must survive ticks 2 and die at 3.
        let late = NodeId::random();
        heart.monitor(late).expect("monitor");
        assert_eq!(cycle(&heart), vec![early]);
        assert_eq!(cycle(&heart), vec![late]);
    }

    #[test]
    fn dead_entities_are_reported_in_collection_order() {
        let (heart, _) = advance_only(1);
        let mut ids: Vec<NodeId> = (0..8).map(|_| NodeId::random()).collect();
        for id in &ids {
            heart.monitor(*id).expect("monitor");
        }
        // Entities are kept sorted by id, so collection order is id order.
        ids.sort();
        assert_eq!(cycle(&heart), ids);
    }

    #[tokio::test]
    async fn beater_reports_one_death_and_stops() {
        let (heart, recorder) = heart_with(10, 3);
        let id = NodeId::random();
        heart.monitor(id).expect("monitor");
        heart.start();

        timeout(Duration::from_secs(5), async {
            while recorder.deaths().is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("death never reported");

        // Let several more cycles pass: still exactly one report.
        sleep(Duration::from_millis(80)).await;
        assert_eq!(recorder.deaths(), vec![id]);
        assert!(recorder.beats.load(Ordering::SeqCst) >= 3);
        assert_eq!(recorder.overlapped.load(Ordering::SeqCst), 0);

        heart.terminate().await;
        let beats = recorder.beats.load(Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            recorder.beats.load(Ordering::SeqCst),
            beats,
            "no callbacks after terminate"
        );
    }

    #[tokio::test]
    async fn pinged_entity_outlives_silent_one() {
        let (heart, recorder) = heart_with(10, 3);
        let lively = NodeId::random();
        let silent = NodeId::random();
        heart.monitor(lively).expect("monitor");
        heart.monitor(silent).expect("monitor");
        heart.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while recorder.deaths().is_empty() {
            heart.ping(&lively).expect("ping");
            assert!(tokio::time::Instant::now() < deadline, "no death reported");
            sleep(Duration::from_millis(3)).await;
        }
        assert_eq!(recorder.deaths(), vec![silent]);
        heart.terminate().await;
    }
}
