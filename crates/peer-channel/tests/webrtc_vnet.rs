mod common;

use common::{init_tracing, pump};
use peer_channel::rtc::webrtc::vnet_factories;
use peer_channel::{
    ConnectionFactory, Payload, Peer, PeerConfig, PeerOptions, PeerState, RtcConnection,
    runtime_config,
};
use serde_json::json;
use test_timeout::timeout_test;

#[timeout_test(secs = 60, multi_thread)]
async fn peers_negotiate_over_virtual_network() {
    init_tracing();
    let (left, right) = vnet_factories().await.unwrap();
    let config = PeerConfig::localhost();

    // Both sides raise negotiation-needed for their negotiated channels, and
    // this stack cannot roll back the polite side's offer.
    let left_conn = left.create().await.unwrap();
    assert!(!left_conn.supports_rollback());

    let a = Peer::new(
        left_conn,
        PeerOptions {
            local_role: "client".into(),
            remote_peer_id: "b".into(),
            is_initiator: true,
        },
        &config,
    )
    .await
    .unwrap();
    let b = Peer::new(
        right.create().await.unwrap(),
        PeerOptions {
            local_role: "server".into(),
            remote_peer_id: "a".into(),
            is_initiator: false,
        },
        &config,
    )
    .await
    .unwrap();
    pump(&a, &b);
    pump(&b, &a);

    a.ready().await.unwrap();
    b.ready().await.unwrap();

    let sender = a.open_transport(*runtime_config());
    let receiver = b.open_transport(*runtime_config());
    let mut inbound = receiver.subscribe();
    let body = "y".repeat(200_000);
    sender.send(json!({ "body": body })).unwrap();
    assert_eq!(
        inbound.recv().await,
        Some(Payload::Json(json!({ "body": body })))
    );

    a.close().await;
    b.closed().await;
    assert_eq!(b.state(), PeerState::Closed);
}
