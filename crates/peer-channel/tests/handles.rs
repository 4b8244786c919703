mod common;

use std::sync::Arc;

use common::{eventually, init_tracing};
use peer_channel::{
    ChunkConfig, ChunkedTransport, HandleMultiplexer, MemoryChannel, MessageChannel, PortEvent,
};
use serde_json::json;
use test_timeout::timeout_test;

fn mux_pair() -> (HandleMultiplexer, HandleMultiplexer) {
    let (a, b) = MemoryChannel::pair("data");
    let left = Arc::new(ChunkedTransport::new(a, ChunkConfig::with_chunk_size(1_000)));
    let right = Arc::new(ChunkedTransport::new(b, ChunkConfig::with_chunk_size(1_000)));
    (HandleMultiplexer::new(left), HandleMultiplexer::new(right))
}

#[timeout_test(secs = 10)]
async fn transferred_port_lives_and_closes_once() {
    init_tracing();
    let (local, remote) = mux_pair();
    let mut inbound = remote.subscribe();

    let channel = MessageChannel::new();
    local
        .post_message(
            json!({ "kind": "attach", "port": { "__transfer__": 0 } }),
            vec![channel.port2.clone()],
        )
        .unwrap();

    let envelope = inbound.recv().await.unwrap();
    assert_eq!(
        envelope.data,
        json!({ "kind": "attach", "port": { "__transfer__": 0 } })
    );
    assert_eq!(envelope.ports.len(), 1);
    let far = envelope.ports[0].clone();
    assert!(far.virtual_id().is_some());

    let big = "x".repeat(100_000);
    channel.port1.post_message(json!({ "body": big })).unwrap();
    assert_eq!(far.recv().await, Some(json!({ "body": big })));

    far.post_message(json!("reply")).unwrap();
    assert_eq!(channel.port1.recv().await, Some(json!("reply")));

    channel.port1.close();
    assert_eq!(far.recv_event().await, Some(PortEvent::Close));
    assert_eq!(far.recv_event().await, None);
    assert!(far.is_closed());

    eventually(|| local.handle_count() == 0 && remote.handle_count() == 0).await;
}

#[timeout_test(secs = 10)]
async fn closing_the_virtual_side_reaches_the_application_port() {
    init_tracing();
    let (local, remote) = mux_pair();
    let mut inbound = remote.subscribe();

    let channel = MessageChannel::new();
    local
        .post_message(json!([{ "__transfer__": 0 }]), vec![channel.port2])
        .unwrap();
    let far = inbound.recv().await.unwrap().ports.remove(0);

    far.close();
    assert_eq!(channel.port1.recv_event().await, Some(PortEvent::Close));
    assert_eq!(channel.port1.recv_event().await, None);
    assert!(far.post_message(json!(1)).is_err());
    eventually(|| local.handle_count() == 0 && remote.handle_count() == 0).await;
}
