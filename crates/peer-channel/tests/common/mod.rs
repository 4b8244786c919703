#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use peer_channel::{
    MemoryNetwork, MemoryRendezvous, Peer, PeerConfig, RolePeering, RolePeeringEvent,
    RolePeeringOptions,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

pub const ROOM: &str = "room-under-test";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Polls `check` until it holds. Callers rely on the test timeout to bound it.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    while !check() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Forwards `from`'s relay traffic to `to`.
pub fn pump(from: &Peer, to: &Peer) {
    let mut outbound = from
        .take_outbound_signals()
        .expect("outbound signals already taken");
    let to = to.clone();
    tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            to.deliver_signal(envelope);
        }
    });
}

/// A shared rendezvous and network for a group of endpoints.
#[derive(Clone, Default)]
pub struct Cluster {
    pub rendezvous: MemoryRendezvous,
    pub net: MemoryNetwork,
}

impl Cluster {
    pub fn peering(&self, self_role: &str, remote_role: &str, max_peers: Option<usize>) -> RolePeering {
        let mut options = RolePeeringOptions::new(ROOM, self_role, remote_role)
            .with_peer_config(PeerConfig::localhost());
        if let Some(max_peers) = max_peers {
            options = options.with_max_peers(max_peers);
        }
        RolePeering::new(
            options,
            Arc::new(self.rendezvous.clone()),
            Arc::new(self.net.clone()),
        )
    }
}

pub async fn next_connected(events: &mut UnboundedReceiver<RolePeeringEvent>) -> (String, Peer) {
    loop {
        match events.recv().await {
            Some(RolePeeringEvent::PeerConnected { peer_id, peer }) => return (peer_id, peer),
            Some(_) => continue,
            None => panic!("event stream ended"),
        }
    }
}

pub async fn next_disconnected(events: &mut UnboundedReceiver<RolePeeringEvent>) -> String {
    loop {
        match events.recv().await {
            Some(RolePeeringEvent::PeerDisconnected { peer_id }) => return peer_id,
            Some(_) => continue,
            None => panic!("event stream ended"),
        }
    }
}

pub async fn next_message(events: &mut UnboundedReceiver<RolePeeringEvent>) -> (String, Vec<u8>) {
    loop {
        match events.recv().await {
            Some(RolePeeringEvent::Message { peer_id, data }) => return (peer_id, data.to_vec()),
            Some(_) => continue,
            None => panic!("event stream ended"),
        }
    }
}
