//! Integration tests for the link layers over real localhost TCP.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use link_core::{
    AddressTable, DeliveryReceiver, FairLossConfig, FairLossLink, Link, LinkConfig, LinkStack,
    Message, PerfectConfig, PerfectLink, ProcessId, StubbornConfig, StubbornLink, Tag, TaskGroup,
};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::timeout;

// ============================================================================
// Helpers
// ============================================================================

fn pid(s: &str) -> ProcessId {
    s.parse().unwrap()
}

async fn bind_local() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Config with a fast retransmission timer so tests finish quickly.
fn fast_config() -> LinkConfig {
    LinkConfig {
        stubborn: StubbornConfig {
            retransmit_interval_ms: 50,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Start two full stacks, "a" and "b", that know each other.
async fn stack_pair(config: LinkConfig) -> (LinkStack, LinkStack) {
    let (a_listener, a_addr) = bind_local().await;
    let (b_listener, b_addr) = bind_local().await;
    let table = AddressTable::new()
        .insert(pid("a"), a_addr)
        .insert(pid("b"), b_addr);

    let a = LinkStack::start(pid("a"), table.clone(), a_listener, config.clone()).unwrap();
    let b = LinkStack::start(pid("b"), table, b_listener, config).unwrap();
    (a, b)
}

async fn recv(events: &mut DeliveryReceiver) -> (ProcessId, Message) {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Timeout waiting for delivery")
        .expect("Delivery channel closed")
}

/// Collect everything that arrives within `window`.
async fn drain_for(events: &mut DeliveryReceiver, window: Duration) -> Vec<(ProcessId, Message)> {
    let mut received = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(delivery)) = tokio::time::timeout_at(deadline, events.recv()).await {
        received.push(delivery);
    }
    received
}

// ============================================================================
// Fair-Loss Link
// ============================================================================

#[tokio::test]
async fn test_fair_loss_delivers_only_what_was_sent() {
    let tasks = TaskGroup::new();
    let (a_listener, a_addr) = bind_local().await;
    let (b_listener, b_addr) = bind_local().await;
    let table = AddressTable::new()
        .insert(pid("a"), a_addr)
        .insert(pid("b"), b_addr);

    let a = FairLossLink::start(
        pid("a"),
        table.clone(),
        a_listener,
        FairLossConfig::default(),
        &tasks,
    )
    .unwrap();
    let b = FairLossLink::start(pid("b"), table, b_listener, FairLossConfig::default(), &tasks)
        .unwrap();
    let mut deliveries = b.deliver_events().unwrap();

    let sent: HashSet<String> = (0..5).map(|t| format!("msg{}", t)).collect();
    for body in &sent {
        a.send(&pid("b"), Message::new(body.as_str()));
    }

    let received = drain_for(&mut deliveries, Duration::from_millis(1500)).await;
    assert!(!received.is_empty());
    for (sender, message) in received {
        assert_eq!(sender, pid("a"));
        let body = message.body().as_str().unwrap().to_string();
        assert!(sent.contains(&body), "fabricated delivery {}", body);
    }

    tasks.shutdown().await;
}

#[tokio::test]
async fn test_fair_loss_loses_messages_to_a_dead_peer() {
    let tasks = TaskGroup::new();
    let (a_listener, a_addr) = bind_local().await;
    let (gone, gone_addr) = bind_local().await;
    drop(gone);
    let table = AddressTable::new()
        .insert(pid("a"), a_addr)
        .insert(pid("b"), gone_addr);

    let a = FairLossLink::start(pid("a"), table, a_listener, FairLossConfig::default(), &tasks)
        .unwrap();

    // Nothing to observe but the absence of a panic or a hang
    for t in 0..10 {
        a.send(&pid("b"), Message::new(t));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    timeout(Duration::from_secs(5), tasks.shutdown())
        .await
        .expect("Shutdown hung");
}

// ============================================================================
// Stubborn Link
// ============================================================================

#[tokio::test]
async fn test_stubborn_retransmits_past_dropped_attempts() {
    const DROPPED: usize = 3;

    let tasks = TaskGroup::new();
    let (a_listener, a_addr) = bind_local().await;
    let (peer, peer_addr) = bind_local().await;
    let table = AddressTable::new()
        .insert(pid("a"), a_addr)
        .insert(pid("b"), peer_addr);

    let fll = FairLossLink::start(pid("a"), table, a_listener, FairLossConfig::default(), &tasks)
        .unwrap();
    let sl = StubbornLink::new(
        fll,
        StubbornConfig {
            retransmit_interval_ms: 50,
            ..Default::default()
        },
        &tasks,
    )
    .unwrap();

    sl.send(&pid("b"), Message::new("persistent"));

    // The peer loses the first attempts by closing without reading
    for _ in 0..DROPPED {
        let (stream, _) = timeout(Duration::from_secs(5), peer.accept())
            .await
            .unwrap()
            .unwrap();
        drop(stream);
    }

    let (mut stream, _) = timeout(Duration::from_secs(5), peer.accept())
        .await
        .unwrap()
        .unwrap();
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await.unwrap();
    let frame: serde_json::Value = serde_json::from_slice(&data).unwrap();
    assert_eq!(frame["msg"], json!("persistent"));
    assert_eq!(frame["from"], json!("a"));

    assert_eq!(sl.pending_len(), 1);
    tasks.shutdown().await;
}

#[tokio::test]
async fn test_stubborn_delivers_duplicates_upward() {
    let tasks = TaskGroup::new();
    let (a_listener, a_addr) = bind_local().await;
    let (b_listener, b_addr) = bind_local().await;
    let table = AddressTable::new()
        .insert(pid("a"), a_addr)
        .insert(pid("b"), b_addr);
    let config = StubbornConfig {
        retransmit_interval_ms: 50,
        ..Default::default()
    };

    let a_fll = FairLossLink::start(
        pid("a"),
        table.clone(),
        a_listener,
        FairLossConfig::default(),
        &tasks,
    )
    .unwrap();
    let b_fll = FairLossLink::start(pid("b"), table, b_listener, FairLossConfig::default(), &tasks)
        .unwrap();
    let a = StubbornLink::new(a_fll, config.clone(), &tasks).unwrap();
    let b = StubbornLink::new(b_fll, config, &tasks).unwrap();
    let mut deliveries = b.deliver_events().unwrap();

    a.send(&pid("b"), Message::new("again"));

    let received = drain_for(&mut deliveries, Duration::from_millis(500)).await;
    assert!(received.len() >= 2, "got {} deliveries", received.len());
    assert!(received.iter().all(|(s, m)| *s == pid("a") && *m == Message::new("again")));

    tasks.shutdown().await;
}

#[tokio::test]
async fn test_stubborn_pending_set_larger_than_outbound_queue() {
    const SENT: i64 = 200;

    let tasks = TaskGroup::new();
    let (a_listener, a_addr) = bind_local().await;
    let (b_listener, b_addr) = bind_local().await;
    let table = AddressTable::new()
        .insert(pid("a"), a_addr)
        .insert(pid("b"), b_addr);
    let small_queue = FairLossConfig {
        outbound_queue: 8,
        ..Default::default()
    };
    let config = StubbornConfig {
        retransmit_interval_ms: 100,
        ..Default::default()
    };

    let a_fll = FairLossLink::start(pid("a"), table.clone(), a_listener, small_queue, &tasks)
        .unwrap();
    let b_fll = FairLossLink::start(pid("b"), table, b_listener, FairLossConfig::default(), &tasks)
        .unwrap();
    let a = StubbornLink::new(a_fll, config.clone(), &tasks).unwrap();
    let b = StubbornLink::new(b_fll, config, &tasks).unwrap();
    let mut deliveries = b.deliver_events().unwrap();

    // Most first attempts overflow the queue and are dropped
    for i in 0..SENT {
        a.send(&pid("b"), Message::new(i));
    }

    let mut seen = HashSet::new();
    let all_seen = async {
        while seen.len() < SENT as usize {
            let (_, message) = deliveries.recv().await.unwrap();
            seen.insert(message.body().as_i64().unwrap());
        }
    };
    timeout(Duration::from_secs(15), all_seen)
        .await
        .expect("Some pending messages were never retransmitted");
    assert_eq!(seen, (0..SENT).collect::<HashSet<_>>());
    assert_eq!(a.pending_len(), SENT as usize);

    tasks.shutdown().await;
}

// ============================================================================
// Perfect Link
// ============================================================================

#[tokio::test]
async fn test_perfect_delivers_exactly_once_under_retransmission() {
    let (a, b) = stack_pair(fast_config()).await;
    let mut deliveries = b.perfect().deliver_events().unwrap();

    a.perfect().send(&pid("b"), Message::new(json!(["msg0"])));
    a.perfect().send(&pid("b"), Message::new(json!(["msg1"])));

    let received = drain_for(&mut deliveries, Duration::from_millis(800)).await;
    let mut bodies: Vec<_> = received.iter().map(|(_, m)| m.body().clone()).collect();
    bodies.sort_by_key(|b| b.to_string());
    assert_eq!(bodies, vec![json!(["msg0"]), json!(["msg1"])]);

    // The stubborn layer underneath kept retransmitting
    assert_eq!(a.stubborn().pending_len(), 2);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_perfect_both_directions() {
    let (a, b) = stack_pair(fast_config()).await;
    let mut at_a = a.perfect().deliver_events().unwrap();
    let mut at_b = b.perfect().deliver_events().unwrap();

    a.perfect().send(&pid("b"), Message::new("ping"));
    b.perfect().send(&pid("a"), Message::new("pong"));

    assert_eq!(recv(&mut at_b).await, (pid("a"), Message::new("ping")));
    assert_eq!(recv(&mut at_a).await, (pid("b"), Message::new("pong")));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_tag_routing_over_the_wire() {
    let (a, b) = stack_pair(fast_config()).await;
    let foo = Tag::new("Foo").unwrap();
    let mut tagged = b.perfect().tagged_deliver_events(foo.clone()).unwrap();
    let mut untagged = b.perfect().deliver_events().unwrap();

    a.perfect()
        .send(&pid("b"), Message::tagged(foo.clone(), json!({"n": 1})));
    a.perfect().send(&pid("b"), Message::new(json!(["plain"])));

    let (_, message) = recv(&mut tagged).await;
    assert_eq!(message.tag(), Some(&foo));
    let (_, message) = recv(&mut untagged).await;
    assert_eq!(message.body(), &json!(["plain"]));

    // Neither leaked into the other channel
    assert!(drain_for(&mut tagged, Duration::from_millis(300)).await.is_empty());
    assert!(drain_for(&mut untagged, Duration::from_millis(100)).await.is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_legacy_tagged_frame_is_routed_by_marker() {
    let (b_listener, b_addr) = bind_local().await;
    let tasks = TaskGroup::new();
    // Single process on loopback besides ourselves, so the sender resolves by IP
    let table = AddressTable::new().insert(pid("a"), "127.0.0.1:9".parse().unwrap());
    let fll = FairLossLink::start(
        pid("b"),
        table,
        b_listener,
        FairLossConfig::default(),
        &tasks,
    )
    .unwrap();
    let sl = StubbornLink::new(fll, StubbornConfig::default(), &tasks).unwrap();
    let pl = PerfectLink::new(sl, PerfectConfig::default(), &tasks).unwrap();
    let mut foo = pl.tagged_deliver_events(Tag::new("Foo").unwrap()).unwrap();

    for _ in 0..3 {
        let mut stream = tokio::net::TcpStream::connect(b_addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut stream, br#"{"msg":["MT:Foo","MID:0"]}"#)
            .await
            .unwrap();
    }

    let (sender, message) = recv(&mut foo).await;
    assert_eq!(sender, pid("a"));
    assert_eq!(message.body(), &json!(["MT:Foo", "MID:0"]));
    assert!(drain_for(&mut foo, Duration::from_millis(300)).await.is_empty());

    tasks.shutdown().await;
}

#[tokio::test]
async fn test_untagged_message_with_marker_body_stays_untagged() {
    let (a, b) = stack_pair(fast_config()).await;
    let mut foo = b.perfect().tagged_deliver_events(Tag::new("Foo").unwrap()).unwrap();
    let mut untagged = b.perfect().deliver_events().unwrap();

    let message = Message::new(json!(["MT:Foo", 1]));
    a.perfect().send(&pid("b"), message.clone());

    assert_eq!(recv(&mut untagged).await, (pid("a"), message));
    assert!(drain_for(&mut foo, Duration::from_millis(300)).await.is_empty());

    a.shutdown().await;
    b.shutdown().await;
}
