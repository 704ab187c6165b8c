use super::*;
use std::sync::atomic::AtomicUsize;
use tether_common::memory::{duplex, MemoryPeer};
use tokio::time::{sleep, timeout};

fn hub_with(config: HubConfig) -> Arc<Hub> {
    Arc::new(Hub::new(config))
}

async fn connect(hub: &Arc<Hub>, capacity: usize) -> (ClientHandle, MemoryPeer) {
    let (conn, peer) = duplex(capacity);
    (hub.register(conn).await, peer)
}

async fn next_text(peer: &mut MemoryPeer) -> String {
    loop {
        match timeout(Duration::from_secs(2), peer.recv()).await {
            Ok(Some(Frame::Text(text))) => return text,
            Ok(Some(Frame::Ping(_))) => continue,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

async fn wait_until_gone(hub: &Hub, id: ClientId) {
    for _ in 0..200 {
        if !hub.contains(id).await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("{} was never unregistered", id);
}

#[tokio::test]
async fn test_broadcast_reaches_every_client_in_order() {
    let hub = hub_with(HubConfig::default());
    let mut peers = Vec::new();
    for _ in 0..5 {
        peers.push(connect(&hub, 16).await.1);
    }
    assert_eq!(hub.client_count().await, 5);

    for n in 0..3 {
        let report = hub.broadcast(Bytes::from(format!("msg-{}", n))).await;
        assert_eq!(report, BroadcastReport { delivered: 5, dropped: 0 });
    }

    for peer in peers.iter_mut() {
        for n in 0..3 {
            assert_eq!(next_text(peer).await, format!("msg-{}", n));
        }
    }
}

#[tokio::test]
async fn test_saturated_client_drops_without_blocking_others() {
    let hub = hub_with(HubConfig {
        queue_capacity: 4,
        ..HubConfig::default()
    });
    // The slow peer never reads, so its transport fills after one frame.
    let (slow, _slow_peer) = connect(&hub, 1).await;
    let (_fast, mut fast_peer) = connect(&hub, 64).await;

    let mut sent = 0;
    while hub.pending(slow.id).await != Some(4) {
        assert!(sent < 50, "slow client queue never filled");
        hub.broadcast(Bytes::from(format!("fill-{}", sent))).await;
        sent += 1;
        sleep(Duration::from_millis(5)).await;
    }
    for n in 0..sent {
        assert_eq!(next_text(&mut fast_peer).await, format!("fill-{}", n));
    }

    let report = hub.broadcast(Bytes::from_static(b"latest")).await;
    assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });
    assert_eq!(hub.pending(slow.id).await, Some(4));
    assert_eq!(next_text(&mut fast_peer).await, "latest");
    assert!(hub.contains(slow.id).await);
}

#[tokio::test]
async fn test_unregister_is_idempotent_and_closes() {
    let hub = hub_with(HubConfig::default());
    let (handle, mut peer) = connect(&hub, 4).await;

    assert!(hub.unregister(handle.id).await);
    assert!(!hub.unregister(handle.id).await);
    assert_eq!(hub.client_count().await, 0);
    assert_eq!(hub.pending(handle.id).await, None);

    let frame = timeout(Duration::from_secs(1), peer.recv()).await.unwrap();
    assert_eq!(frame, Some(Frame::Close));
    assert_eq!(hub.broadcast(Bytes::from_static(b"nobody")).await, BroadcastReport::default());
}

#[tokio::test]
async fn test_disconnect_unregisters() {
    let hub = hub_with(HubConfig::default());
    let (handle, mut peer) = connect(&hub, 4).await;
    let (other, _other_peer) = connect(&hub, 4).await;

    peer.disconnect();
    wait_until_gone(&hub, handle.id).await;
    assert!(hub.contains(other.id).await);
}

#[tokio::test]
async fn test_dropped_peer_unregisters() {
    let hub = hub_with(HubConfig::default());
    let (handle, peer) = connect(&hub, 4).await;

    drop(peer);
    hub.broadcast(Bytes::from_static(b"into the void")).await;
    wait_until_gone(&hub, handle.id).await;
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let hub = hub_with(HubConfig::default());
    let (_handle, mut peer) = connect(&hub, 4).await;

    peer.send_text(r#"{"type":"ping"}"#).await.unwrap();
    assert_eq!(next_text(&mut peer).await, r#"{"type":"pong"}"#);

    // Anything else is ignored and the client stays registered.
    peer.send_text("not json").await.unwrap();
    hub.broadcast(Bytes::from_static(b"still here")).await;
    assert_eq!(next_text(&mut peer).await, "still here");
}

#[tokio::test]
async fn test_idle_client_gets_keepalive() {
    let hub = hub_with(HubConfig {
        keepalive_interval: Duration::from_millis(50),
        ..HubConfig::default()
    });
    let (handle, mut peer) = connect(&hub, 16).await;

    let frame = timeout(Duration::from_secs(2), peer.recv()).await.unwrap();
    assert_eq!(frame, Some(Frame::Ping(Vec::new())));
    assert!(hub.contains(handle.id).await);
}

#[tokio::test]
async fn test_busy_client_answering_pings_stays_registered() {
    let hub = hub_with(HubConfig {
        keepalive_interval: Duration::from_millis(100),
        read_timeout: Duration::from_millis(250),
        ..HubConfig::default()
    });
    let (handle, mut peer) = connect(&hub, 64).await;

    // A dashboard never sends data of its own; only its pongs keep it alive.
    let pings = Arc::new(AtomicUsize::new(0));
    let seen = pings.clone();
    let responder = tokio::spawn(async move {
        while let Some(frame) = peer.recv().await {
            if let Frame::Ping(data) = frame {
                seen.fetch_add(1, Ordering::SeqCst);
                if peer.send(Frame::Pong(data)).await.is_err() {
                    break;
                }
            }
        }
    });

    // Steady traffic for well past the read timeout.
    for n in 0..60 {
        hub.broadcast(Bytes::from(format!("tick-{}", n))).await;
        sleep(Duration::from_millis(10)).await;
    }

    assert!(pings.load(Ordering::SeqCst) >= 2, "keepalive starved by traffic");
    assert!(hub.contains(handle.id).await, "healthy client was dropped");

    hub.unregister(handle.id).await;
    timeout(Duration::from_secs(2), responder).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_non_utf8_broadcast_goes_out_as_binary() {
    let hub = hub_with(HubConfig::default());
    let (_a, mut first) = connect(&hub, 4).await;
    let (_b, mut second) = connect(&hub, 4).await;

    let report = hub.broadcast(Bytes::from_static(b"\xff\x00raw")).await;
    assert_eq!(report.delivered, 2);
    for peer in [&mut first, &mut second] {
        let frame = timeout(Duration::from_secs(1), peer.recv()).await.unwrap();
        assert_eq!(frame, Some(Frame::Binary(b"\xff\x00raw".to_vec())));
    }
}

#[tokio::test]
async fn test_silent_client_times_out() {
    let hub = hub_with(HubConfig {
        keepalive_interval: Duration::from_millis(40),
        read_timeout: Duration::from_millis(150),
        ..HubConfig::default()
    });
    let (handle, _peer) = connect(&hub, 64).await;

    wait_until_gone(&hub, handle.id).await;
}

#[test]
fn test_ping_detection() {
    assert!(is_ping(br#"{"type":"ping"}"#));
    assert!(is_ping(br#"{"type":"ping","extra":1}"#));
    assert!(!is_ping(br#"{"type":"pong"}"#));
    assert!(!is_ping(b"ping"));
    assert!(!is_ping(b"[]"));
}
