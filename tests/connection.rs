//! End-to-end tests running two real nodes against each other over localhost UDP.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peerlink::{ConnectResult, DisconnectReason, Node, NodeConfig};
use tracing::Level;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

/// aggressive timers so the tests finish quickly
fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default_lan();
    config.flush_interval = Duration::from_millis(10);
    config.connect_attempt_interval = Duration::from_millis(50);
    config.connect_timeout = Duration::from_secs(3);
    config.keepalive_interval = Duration::from_millis(500);
    config.lost_timeout = Duration::from_secs(5);
    config.maintenance_interval = Duration::from_millis(200);
    config.disconnect_linger = Duration::from_millis(500);
    config
}

/// captures everything a node's callbacks report, for asserting on it later
#[derive(Default)]
struct Recorder {
    connects: Mutex<Vec<(SocketAddr, ConnectResult)>>,
    disconnects: Mutex<Vec<(SocketAddr, DisconnectReason)>>,
    messages: Mutex<Vec<(u8, Vec<u8>, SocketAddr, u8)>>,
}

impl Recorder {
    fn attach(node: &Node) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());

        let r = recorder.clone();
        node.on_connect(move |peer, result| r.connects.lock().unwrap().push((peer, result)));
        let r = recorder.clone();
        node.on_disconnect(move |peer, reason| r.disconnects.lock().unwrap().push((peer, reason)));
        let r = recorder.clone();
        node.on_message(move |type_id, payload, from, channel| {
            r.messages.lock().unwrap().push((type_id, payload.to_vec(), from, channel));
        });

        recorder
    }

    fn connects(&self) -> Vec<(SocketAddr, ConnectResult)> {
        self.connects.lock().unwrap().clone()
    }

    fn disconnects(&self) -> Vec<(SocketAddr, DisconnectReason)> {
        self.disconnects.lock().unwrap().clone()
    }

    fn messages(&self) -> Vec<(u8, Vec<u8>, SocketAddr, u8)> {
        self.messages.lock().unwrap().clone()
    }
}

/// keeps calling `sync` on all nodes until the condition holds or the timeout elapses
async fn pump_until(nodes: &[&Node], timeout_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        for node in nodes {
            node.sync();
        }
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

struct ConnectedPair {
    server: Arc<Node>,
    client: Arc<Node>,
    server_events: Arc<Recorder>,
    client_events: Arc<Recorder>,
    server_addr: SocketAddr,
    client_addr: SocketAddr,
}

async fn connected_pair() -> ConnectedPair {
    let server = Node::new(test_config()).unwrap();
    let server_events = Recorder::attach(&server);
    let port = server.host_on(0, 4, "secret").await.unwrap();

    let client = Node::new(test_config()).unwrap();
    let client_events = Recorder::attach(&client);
    let server_addr = client.connect_to("127.0.0.1", port, "secret").await.unwrap();

    let connected = pump_until(&[&server, &client], 3000, || {
        client_events.connects().contains(&(server_addr, ConnectResult::Succes))
            && !server_events.connects().is_empty()
    }).await;
    assert!(connected, "handshake did not complete");

    let (client_addr, result) = server_events.connects()[0];
    assert_eq!(result, ConnectResult::Succes);
    assert!(server.is_connected(client_addr));
    assert!(client.is_connected(server_addr));

    ConnectedPair { server, client, server_events, client_events, server_addr, client_addr }
}

#[tokio::test]
async fn test_connect_and_reliable_message() {
    let pair = connected_pair().await;

    pair.client.send_reliable(20, b"hello", 3, Some(pair.server_addr), None).unwrap();
    let delivered = pump_until(&[&pair.server, &pair.client], 3000,
        || !pair.server_events.messages().is_empty()).await;
    assert!(delivered);

    let messages = pair.server_events.messages();
    assert_eq!(messages, vec![(20, b"hello".to_vec(), pair.client_addr, 3)]);

    // let the retransmission machinery run a while longer: still exactly one delivery
    pump_until(&[&pair.server, &pair.client], 200, || false).await;
    assert_eq!(pair.server_events.messages().len(), 1);

    pair.client.shutdown().await;
    pair.server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_password_rejected() {
    let server = Node::new(test_config()).unwrap();
    let server_events = Recorder::attach(&server);
    let port = server.host_on(0, 4, "secret").await.unwrap();

    let client = Node::new(test_config()).unwrap();
    let client_events = Recorder::attach(&client);
    let server_addr = client.connect_to("127.0.0.1", port, "wrong").await.unwrap();

    let rejected = pump_until(&[&server, &client], 3000, || {
        client_events.connects().contains(&(server_addr, ConnectResult::InvalidPw))
    }).await;
    assert!(rejected);
    assert!(server_events.connects().is_empty(), "the acceptor reports nothing for a rejected stranger");
    assert!(!client.is_connected(server_addr));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_capacity_exceeded_rejected() {
    let server = Node::new(test_config()).unwrap();
    let port = server.host_on(0, 0, "secret").await.unwrap();

    let client = Node::new(test_config()).unwrap();
    let client_events = Recorder::attach(&client);
    let server_addr = client.connect_to("127.0.0.1", port, "secret").await.unwrap();

    let rejected = pump_until(&[&server, &client], 3000, || {
        client_events.connects().contains(&(server_addr, ConnectResult::MaxUsers))
    }).await;
    assert!(rejected);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_connect_to_nobody_times_out() {
    let mut config = test_config();
    config.connect_timeout = Duration::from_millis(300);
    let client = Node::new(config).unwrap();
    let client_events = Recorder::attach(&client);

    // a port where nothing listens
    let target = client.connect_to("127.0.0.1", 9, "pw").await.unwrap();
    let timed_out = pump_until(&[&client], 3000, || {
        client_events.connects().contains(&(target, ConnectResult::TimedOut))
    }).await;
    assert!(timed_out);

    client.shutdown().await;
}

#[tokio::test]
async fn test_reliable_delivery_under_simulated_loss() {
    let pair = connected_pair().await;
    pair.server.set_simulated_loss(Some(3));
    pair.client.set_simulated_loss(Some(3));

    for i in 0..50u8 {
        pair.client.send_reliable(20, &[i], 1, Some(pair.server_addr), None).unwrap();
    }

    let delivered = pump_until(&[&pair.server, &pair.client], 10_000,
        || pair.server_events.messages().len() >= 50).await;
    assert!(delivered, "got {} of 50 messages", pair.server_events.messages().len());

    // exactly once, in send order, despite every third datagram being dropped
    let received: Vec<u8> = pair.server_events.messages().iter()
        .map(|(_, payload, _, _)| payload[0])
        .collect();
    assert_eq!(received, (0..50).collect::<Vec<u8>>());

    pair.server.set_simulated_loss(None);
    pair.client.set_simulated_loss(None);
    pair.client.shutdown().await;
    pair.server.shutdown().await;
}

#[tokio::test]
async fn test_fragmented_message_reassembled() {
    let pair = connected_pair().await;
    let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();

    pair.client.send_reliable(30, &payload, 0, Some(pair.server_addr), None).unwrap();
    let delivered = pump_until(&[&pair.server, &pair.client], 5000,
        || !pair.server_events.messages().is_empty()).await;
    assert!(delivered);

    let messages = pair.server_events.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, 30);
    assert_eq!(messages[0].1, payload);

    pair.client.shutdown().await;
    pair.server.shutdown().await;
}

#[tokio::test]
async fn test_traced_send_resolves_on_delivery() {
    let pair = connected_pair().await;

    let trace = pair.client
        .send_reliable_traced(20, b"traced", 2, Some(pair.server_addr), None)
        .unwrap();
    assert!(trace.wait_all(Duration::from_secs(3)).await);
    assert!(trace.peek_specific(pair.server_addr));

    pair.client.shutdown().await;
    pair.server.shutdown().await;
}

#[tokio::test]
async fn test_unreliable_message_delivered() {
    let pair = connected_pair().await;

    // fire a few: unreliable sends may be dropped in principle, but localhost does not
    // lose datagrams and every flush carries them out
    for _ in 0..5 {
        pair.client.send_unreliable(40, b"state", Some(pair.server_addr), None).unwrap();
        pump_until(&[&pair.server, &pair.client], 50, || false).await;
    }

    let delivered = pump_until(&[&pair.server, &pair.client], 3000,
        || !pair.server_events.messages().is_empty()).await;
    assert!(delivered);
    assert_eq!(pair.server_events.messages()[0].1, b"state".to_vec());

    pair.client.shutdown().await;
    pair.server.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_except_skips_one_peer() {
    let server = Node::new(test_config()).unwrap();
    let server_events = Recorder::attach(&server);
    let port = server.host_on(0, 4, "secret").await.unwrap();

    let client_a = Node::new(test_config()).unwrap();
    let events_a = Recorder::attach(&client_a);
    let client_b = Node::new(test_config()).unwrap();
    let events_b = Recorder::attach(&client_b);
    client_a.connect_to("127.0.0.1", port, "secret").await.unwrap();
    client_b.connect_to("127.0.0.1", port, "secret").await.unwrap();

    let all = [&*server, &*client_a, &*client_b];
    let connected = pump_until(&all, 3000, || {
        server_events.connects().len() == 2
            && !events_a.connects().is_empty()
            && !events_b.connects().is_empty()
    }).await;
    assert!(connected);

    // identify a's address as the server sees it, then relay around it
    let addr_a = {
        let trace = client_a.send_reliable_traced(20, b"which", 0, None, None).unwrap();
        assert!(trace.wait_all(Duration::from_secs(3)).await);
        pump_until(&all, 1000, || !server_events.messages().is_empty()).await;
        server_events.messages()[0].2
    };

    server.send_reliable(21, b"relay", 0, None, Some(addr_a)).unwrap();
    let delivered = pump_until(&all, 3000, || !events_b.messages().is_empty()).await;
    assert!(delivered);
    assert!(events_a.messages().is_empty(), "the excepted peer must not receive the broadcast");

    client_a.shutdown().await;
    client_b.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_reported_on_both_sides() {
    let pair = connected_pair().await;

    let trace = pair.client.disconnect(pair.server_addr).unwrap();
    assert!(trace.wait_all(Duration::from_secs(3)).await, "the goodbye was never acknowledged");

    let reported = pump_until(&[&pair.server, &pair.client], 3000, || {
        pair.server_events.disconnects().contains(&(pair.client_addr, DisconnectReason::Requested))
            && pair.client_events.disconnects().contains(&(pair.server_addr, DisconnectReason::Requested))
    }).await;
    assert!(reported);

    // disconnecting again is a no-op
    assert!(pair.client.disconnect(pair.server_addr).is_none());

    pair.client.shutdown().await;
    pair.server.shutdown().await;
}

#[tokio::test]
async fn test_kick_reported_as_kicked() {
    let pair = connected_pair().await;

    pair.server.kick(pair.client_addr).unwrap();
    let reported = pump_until(&[&pair.server, &pair.client], 3000, || {
        pair.client_events.disconnects().contains(&(pair.server_addr, DisconnectReason::Kicked))
    }).await;
    assert!(reported);

    pair.client.shutdown().await;
    pair.server.shutdown().await;
}

#[tokio::test]
async fn test_simultaneous_connect_peer_to_peer() {
    let a = Node::new(test_config()).unwrap();
    let events_a = Recorder::attach(&a);
    let b = Node::new(test_config()).unwrap();
    let events_b = Recorder::attach(&b);

    // both need a bound port before either dials, so each dials the other's real port
    let port_a = a.host_on(0, 4, "mesh").await.unwrap();
    let port_b = b.host_on(0, 4, "mesh").await.unwrap();

    let addr_b = a.connect_to("127.0.0.1", port_b, "mesh").await.unwrap();
    let addr_a = b.connect_to("127.0.0.1", port_a, "mesh").await.unwrap();

    let connected = pump_until(&[&a, &b], 3000, || {
        events_a.connects().iter().any(|(addr, r)| *addr == addr_b && *r == ConnectResult::Succes)
            && events_b.connects().iter().any(|(addr, r)| *addr == addr_a && *r == ConnectResult::Succes)
    }).await;
    assert!(connected);

    // exactly one connection per pair, even though both sides dialed
    assert_eq!(a.connected_peers(), vec![addr_b]);
    assert_eq!(b.connected_peers(), vec![addr_a]);

    a.shutdown().await;
    b.shutdown().await;
}
