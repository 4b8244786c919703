mod common;

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use common::{
    Cluster, ROOM, eventually, init_tracing, next_connected, next_disconnected, next_message,
};
use peer_channel::{PeerState, TransportError};
use test_timeout::timeout_test;

#[timeout_test(secs = 15)]
async fn server_and_client_pair_up_and_exchange_one_message() {
    init_tracing();
    let cluster = Cluster::default();
    let server = cluster.peering("server", "client", Some(1));
    let client = cluster.peering("client", "server", Some(1));
    let mut server_events = server.subscribe();
    let mut client_events = client.subscribe();

    server.join().await.unwrap();
    client.join().await.unwrap();
    assert!(matches!(
        client.join().await,
        Err(TransportError::AlreadyJoined)
    ));

    let (client_id, server_side) = next_connected(&mut server_events).await;
    let (_, client_side) = next_connected(&mut client_events).await;
    assert!(client_side.is_initiator());
    assert!(!client_side.polite());
    assert!(server_side.polite());
    assert_eq!(server_side.remote_peer_id(), client_id);

    assert_eq!(client.send_message(Bytes::from_static(b"ping"), None).await, 1);
    let (from, data) = next_message(&mut server_events).await;
    assert_eq!(from, client_id);
    assert_eq!(data, b"ping");
    assert!(
        tokio::time::timeout(Duration::from_millis(200), next_message(&mut server_events))
            .await
            .is_err(),
        "ping delivered more than once"
    );

    assert_eq!(
        server
            .send_message(Bytes::from_static(b"pong"), Some(client_id.as_str()))
            .await,
        1
    );
    assert_eq!(next_message(&mut client_events).await.1, b"pong");
    assert_eq!(
        server
            .send_message(Bytes::from_static(b"lost"), Some("nobody"))
            .await,
        0
    );

    // Both pools are full and settled, so neither side stays discoverable.
    eventually(|| !server.is_discoverable() && !client.is_discoverable()).await;
    assert!(cluster.rendezvous.members(ROOM).is_empty());
    assert_eq!(cluster.rendezvous.stored_messages(ROOM), 0);
}

#[timeout_test(secs = 15)]
async fn departure_reopens_the_session() {
    init_tracing();
    let cluster = Cluster::default();
    let server = cluster.peering("server", "client", Some(1));
    let client = cluster.peering("client", "server", Some(1));
    let mut server_events = server.subscribe();

    server.join().await.unwrap();
    client.join().await.unwrap();
    let (client_id, _) = next_connected(&mut server_events).await;
    eventually(|| !server.is_discoverable()).await;

    client.destroy().await;
    assert_eq!(next_disconnected(&mut server_events).await, client_id);
    eventually(|| server.is_discoverable()).await;
    assert_eq!(server.pool_size(), 0);
    eventually(|| cluster.rendezvous.members(ROOM).len() == 1).await;

    // A newcomer is admitted through the fresh session.
    let newcomer = cluster.peering("client", "server", Some(1));
    newcomer.join().await.unwrap();
    let (newcomer_id, _) = next_connected(&mut server_events).await;
    assert_ne!(newcomer_id, client_id);

    server.destroy().await;
    newcomer.destroy().await;
    assert_eq!(cluster.net.live_connections(), 0);
}

#[timeout_test(secs = 20)]
async fn admission_stops_at_max_peers() {
    init_tracing();
    let cluster = Cluster::default();
    let server = cluster.peering("server", "client", Some(2));
    let mut server_events = server.subscribe();
    server.join().await.unwrap();

    let clients: Vec<_> = (0..3)
        .map(|_| cluster.peering("client", "server", None))
        .collect();
    for client in &clients {
        client.join().await.unwrap();
    }

    let mut admitted = HashSet::new();
    while admitted.len() < 2 {
        admitted.insert(next_connected(&mut server_events).await.0);
    }
    eventually(|| !server.is_discoverable()).await;
    assert_eq!(server.pool_size(), 2);
    assert!(
        tokio::time::timeout(Duration::from_millis(300), next_connected(&mut server_events))
            .await
            .is_err(),
        "a third peer was admitted"
    );

    let has_ready_peer = |index: usize| {
        clients[index]
            .peers()
            .iter()
            .any(|(_, peer)| peer.state() == PeerState::Ready)
    };
    eventually(|| (0..clients.len()).filter(|i| has_ready_peer(*i)).count() == 2).await;
    let leaving = (0..clients.len())
        .find(|i| has_ready_peer(*i))
        .expect("a connected client");
    clients[leaving].destroy().await;

    let departed = next_disconnected(&mut server_events).await;
    assert!(admitted.contains(&departed));

    let (replacement, _) = next_connected(&mut server_events).await;
    assert!(!admitted.contains(&replacement));
    eventually(|| !server.is_discoverable()).await;
    assert_eq!(server.pool_size(), 2);
}
