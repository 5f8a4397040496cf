//! Integration tests for the beater and the liveness path: heartbeat
//! tagging, silence detection and the resulting drop cascade.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout, Instant};

use weft::messages::Envelope;
use weft::{Dialer, NodeId, Overlay, OverlayConfig, Peer, State};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Every address is unreachable: these scenarios never re-dial.
struct DeadEndDialer;

#[async_trait]
impl Dialer for DeadEndDialer {
    async fn dial(&self, addrs: &[String]) -> anyhow::Result<Arc<Peer>> {
        anyhow::bail!("no route to any of {addrs:?}")
    }
}

fn liveness_config(kill_ticks: u64) -> OverlayConfig {
    OverlayConfig {
        leaves: 8,
        beat_period: Duration::from_millis(50),
        kill_ticks,
        boot_timeout: Duration::from_millis(150),
        conv_timeout: Duration::from_millis(100),
        exch_workers: 4,
        auth_timeout: Duration::from_millis(200),
        ..OverlayConfig::default()
    }
}

fn remote(port: u16) -> (NodeId, Arc<Peer>, tokio::sync::mpsc::Receiver<Envelope>, String) {
    let id = NodeId::random();
    let addr = format!("127.0.0.1:{port}");
    let (peer, rx) = Peer::new(id, vec![addr.clone()], 64);
    (id, peer, rx, addr)
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

/// Next heartbeat envelope, skipping joins and state exchanges.
async fn next_beat(rx: &mut tokio::sync::mpsc::Receiver<Envelope>) -> Envelope {
    timeout(TEST_TIMEOUT, async {
        loop {
            let env = rx.recv().await.expect("peer queue closed");
            if env.state.is_beat() {
                return env;
            }
        }
    })
    .await
    .expect("no heartbeat received")
}

#[tokio::test]
async fn beats_tag_routing_peers_active_and_others_passive() {
    // Generous kill allowance: nothing dies during this test.
    let overlay = Overlay::new(
        liveness_config(10_000),
        NodeId::random(),
        vec!["127.0.0.1:9100".to_string()],
        DeadEndDialer,
    )
    .expect("overlay");
    overlay.boot();

    let (routed_id, routed_peer, mut routed_rx, routed_addr) = remote(9101);
    let (idle_id, idle_peer, mut idle_rx, _idle_addr) = remote(9102);
    assert!(overlay.adopt(routed_peer));
    assert!(overlay.adopt(idle_peer));

    // Only the routed peer is announced into the table; the idle one
    // stays pooled but unused.
    let mut addrs = HashMap::new();
    addrs.insert(routed_id.to_string(), vec![routed_addr]);
    overlay
        .deliver(
            routed_id,
            State {
                addrs,
                ..State::default()
            },
        )
        .await;
    wait_for("routed peer to become active", || {
        overlay.is_active(&routed_id)
    })
    .await;

    // Beats taken after the commit must tag the routed peer active.
    let beat = timeout(TEST_TIMEOUT, async {
        loop {
            let env = next_beat(&mut routed_rx).await;
            if !env.state.passive {
                return env;
            }
        }
    })
    .await
    .expect("routed peer never tagged active");
    assert_eq!(beat.dest, routed_id, "beats are addressed to the peer");

    // The idle peer is tagged passive on every single beat.
    for _ in 0..3 {
        let beat = next_beat(&mut idle_rx).await;
        assert!(beat.state.passive, "unused peer must be passive");
        assert_eq!(beat.dest, idle_id);
    }

    overlay.shutdown().await;
}

#[tokio::test]
async fn silent_peer_is_dropped_after_missed_heartbeats() {
    let overlay = Overlay::new(
        liveness_config(3),
        NodeId::random(),
        vec!["127.0.0.1:9110".to_string()],
        DeadEndDialer,
    )
    .expect("overlay");
    overlay.boot();

    let (silent_id, silent_peer, _silent_rx, _) = remote(9111);
    assert!(overlay.adopt(silent_peer));
    assert_eq!(overlay.peer_count(), 1);

    // Never delivers anything: the monitor declares it dead and the
    // manager cascades the drop.
    wait_for("silent peer to be dropped", || {
        overlay.peer(&silent_id).is_none()
    })
    .await;
    assert_eq!(overlay.peer_count(), 0);
    assert!(!overlay.is_active(&silent_id));

    overlay.shutdown().await;
}

#[tokio::test]
async fn delivering_state_keeps_a_peer_alive() {
    let overlay = Overlay::new(
        liveness_config(3),
        NodeId::random(),
        vec!["127.0.0.1:9120".to_string()],
        DeadEndDialer,
    )
    .expect("overlay");
    overlay.boot();

    let (lively_id, lively_peer, _lively_rx, _) = remote(9121);
    assert!(overlay.adopt(lively_peer));

    // Inbound heartbeats count as proof of life and nothing else:
    // they carry no addresses, so no table churn, no commits.
    let deadline = Instant::now() + Duration::from_millis(600);
    while Instant::now() < deadline {
        overlay.deliver(lively_id, State::beat(0, false)).await;
        sleep(Duration::from_millis(20)).await;
    }
    assert!(
        overlay.peer(&lively_id).is_some(),
        "pinged peer must stay pooled"
    );
    assert_eq!(overlay.epoch(), 0, "bare heartbeats must not commit");

    overlay.shutdown().await;
}

#[tokio::test]
async fn repair_request_is_answered_with_full_state() {
    let overlay = Overlay::new(
        liveness_config(10_000),
        NodeId::random(),
        vec!["127.0.0.1:9130".to_string()],
        DeadEndDialer,
    )
    .expect("overlay");
    overlay.boot();
    let self_id = *overlay.node_id();

    let (asker_id, asker_peer, mut asker_rx, _) = remote(9131);
    assert!(overlay.adopt(asker_peer));

    // Drain the adoption join first.
    let join = timeout(TEST_TIMEOUT, async {
        loop {
            let env = asker_rx.recv().await.expect("peer queue closed");
            if !env.state.is_beat() {
                return env;
            }
        }
    })
    .await
    .expect("no join received");
    assert_eq!(join.state.updated, 0);

    // A beat with the repair flag asks for our full state.
    overlay
        .deliver(
            asker_id,
            State {
                repair: true,
                ..State::default()
            },
        )
        .await;

    let answer = timeout(TEST_TIMEOUT, async {
        loop {
            let env = asker_rx.recv().await.expect("peer queue closed");
            if !env.state.is_beat() {
                return env;
            }
        }
    })
    .await
    .expect("repair request never answered");
    assert!(answer.state.addrs.contains_key(&self_id.to_string()));
    assert!(!answer.state.repair, "the answer itself must not re-request");

    overlay.shutdown().await;
}
