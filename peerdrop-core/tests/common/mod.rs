#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use peerdrop_core::{
    Config, LoopbackNetwork, MemoryStorage, Multiplexer, MultiplexerEvent, PeerId, PeerInfo,
    RoomMembership, SignalingCommand, SignalingEvent,
};
use tokio::sync::mpsc;

pub type RelayLog = Arc<Mutex<Vec<SignalingCommand>>>;

pub struct Node {
    pub id: PeerId,
    pub mux: Multiplexer,
    pub events: mpsc::UnboundedReceiver<MultiplexerEvent>,
    pub storage: Arc<MemoryStorage>,
    /// Everything this node sent to the relay.
    pub relay_log: RelayLog,
    /// Inject relay events into this node.
    pub relay: mpsc::UnboundedSender<SignalingEvent>,
}

pub struct Harness {
    pub a: Node,
    pub b: Node,
}

/// Small partitions so multi-partition files stay small.
pub fn small_config() -> Config {
    Config {
        chunk_size: 1_000,
        partition_size: 4_000,
        ..Config::default()
    }
}

pub fn peer(id: &str) -> PeerInfo {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "name": {"displayName": format!("device {id}")},
        "rtcSupported": true
    }))
    .expect("peer info")
}

/// Two multiplexers on one loopback network that see each other in `room`.
pub async fn pair(room: RoomMembership, config: Config) -> Harness {
    let net: Arc<LoopbackNetwork> = Arc::new(LoopbackNetwork::new());
    let a_id = PeerId::from("peer-a");
    let b_id = PeerId::from("peer-b");

    let (a_cmd_tx, a_cmd_rx) = mpsc::unbounded_channel();
    let (b_cmd_tx, b_cmd_rx) = mpsc::unbounded_channel();
    let (a_ev_tx, a_ev_rx) = mpsc::unbounded_channel();
    let (b_ev_tx, b_ev_rx) = mpsc::unbounded_channel();

    let a_storage = Arc::new(MemoryStorage::new());
    let b_storage = Arc::new(MemoryStorage::new());
    let (a_mux, a_events) = Multiplexer::spawn(
        config.clone(),
        net.clone(),
        a_storage.clone(),
        a_cmd_tx,
        a_ev_rx,
    );
    let (b_mux, b_events) = Multiplexer::spawn(config, net, b_storage.clone(), b_cmd_tx, b_ev_rx);

    let a_log = relay(a_id.clone(), a_cmd_rx, b_ev_tx.clone());
    let b_log = relay(b_id.clone(), b_cmd_rx, a_ev_tx.clone());

    let mut a = Node {
        id: a_id.clone(),
        mux: a_mux,
        events: a_events,
        storage: a_storage,
        relay_log: a_log,
        relay: a_ev_tx,
    };
    let mut b = Node {
        id: b_id.clone(),
        mux: b_mux,
        events: b_events,
        storage: b_storage,
        relay_log: b_log,
        relay: b_ev_tx,
    };
    for (node, other) in [(&mut a, &b_id), (&mut b, &a_id)] {
        node.relay.send(SignalingEvent::Connected).unwrap();
        node.relay
            .send(SignalingEvent::Peers {
                room: room.clone(),
                peers: vec![peer(other.as_str())],
            })
            .unwrap();
        wait_for(&mut node.events, |e| {
            matches!(e, MultiplexerEvent::PeersUpdated(_))
        })
        .await;
    }
    Harness { a, b }
}

/// Forward `from`'s signals to the other node and log every command.
fn relay(
    from: PeerId,
    mut commands: mpsc::UnboundedReceiver<SignalingCommand>,
    to: mpsc::UnboundedSender<SignalingEvent>,
) -> RelayLog {
    let log = RelayLog::default();
    let sink = log.clone();
    tokio::spawn(async move {
        while let Some(cmd) = commands.recv().await {
            if let SignalingCommand::Signal { room, signal, .. } = &cmd {
                let _ = to.send(SignalingEvent::Signal {
                    sender_id: from.clone(),
                    room: Some(room.clone()),
                    signal: signal.clone(),
                });
            }
            sink.lock().unwrap().push(cmd);
        }
    });
    log
}

/// Next event matching `f`, skipping others.
pub async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<MultiplexerEvent>,
    mut f: impl FnMut(&MultiplexerEvent) -> bool,
) -> MultiplexerEvent {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let event = events.recv().await.expect("multiplexer stopped");
            if f(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub fn sample(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
