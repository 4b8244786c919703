//! webrtc-rs backend.

use std::sync::Arc;
use std::time::Duration;

use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::MediaEngine;
use ::webrtc::api::setting_engine::SettingEngine;
use ::webrtc::api::{API, APIBuilder};
use ::webrtc::data_channel::RTCDataChannel;
use ::webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use ::webrtc::data_channel::data_channel_message::DataChannelMessage;
use ::webrtc::data_channel::data_channel_state::RTCDataChannelState;
use ::webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use ::webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::signaling_state::RTCSignalingState;
use ::webrtc::util::vnet::net::{Net, NetConfig};
use ::webrtc::util::vnet::router::{Router, RouterConfig};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tracing::{debug, trace, warn};

use super::{ConnectionFactory, Connectivity, RtcConnection, RtcEvent, SignalingState};
use crate::channel::{ChannelState, DataChannel};
use crate::config::PeerConfig;
use crate::error::{TransportError, to_negotiation_error, to_setup_error};
use crate::events::Emitter;
use crate::signal::{IceCandidate, SdpType, SessionDescription};

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_configuration(config: &PeerConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

/// Builds webrtc-rs peer connections from a [`PeerConfig`].
pub struct WebRtcFactory {
    api: API,
    config: RTCConfiguration,
    _router: Option<Arc<AsyncMutex<Router>>>,
}

impl WebRtcFactory {
    pub fn new(config: &PeerConfig) -> Result<Self, TransportError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        Ok(Self {
            api: build_api(setting)?,
            config: rtc_configuration(config),
            _router: None,
        })
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcFactory {
    async fn create(&self) -> Result<Arc<dyn RtcConnection>, TransportError> {
        let pc = self
            .api
            .new_peer_connection(self.config.clone())
            .await
            .map_err(to_setup_error)?;
        Ok(WebRtcConnection::new(Arc::new(pc)))
    }
}

async fn attach_vnet_to_router(
    vnet: &Arc<Net>,
    router: &Arc<AsyncMutex<Router>>,
) -> Result<(), TransportError> {
    let nic = vnet.get_nic().map_err(to_setup_error)?;
    {
        let mut router_guard = router.lock().await;
        router_guard
            .add_net(Arc::clone(&nic))
            .await
            .map_err(to_setup_error)?;
    }
    let nic_guard = nic.lock().await;
    nic_guard
        .set_router(Arc::clone(router))
        .await
        .map_err(to_setup_error)?;
    Ok(())
}

/// Two factories on a private virtual network, for tests that must not touch
/// the host's interfaces.
pub async fn vnet_factories() -> Result<(WebRtcFactory, WebRtcFactory), TransportError> {
    let wan = Arc::new(AsyncMutex::new(
        Router::new(RouterConfig {
            cidr: "10.0.0.0/24".to_owned(),
            ..Default::default()
        })
        .map_err(to_setup_error)?,
    ));

    let mut factories = Vec::with_capacity(2);
    for ip in ["10.0.0.2", "10.0.0.3"] {
        let vnet = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec![ip.to_owned()],
            ..Default::default()
        })));
        attach_vnet_to_router(&vnet, &wan).await?;

        let mut setting = SettingEngine::default();
        setting.set_vnet(Some(vnet));
        setting.set_ice_timeouts(
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(1)),
            Some(Duration::from_millis(200)),
        );
        factories.push(WebRtcFactory {
            api: build_api(setting)?,
            config: RTCConfiguration::default(),
            _router: Some(Arc::clone(&wan)),
        });
    }

    wan.lock().await.start().await.map_err(to_setup_error)?;

    let second = factories
        .pop()
        .ok_or_else(|| TransportError::Setup("vnet factory missing".into()))?;
    let first = factories
        .pop()
        .ok_or_else(|| TransportError::Setup("vnet factory missing".into()))?;
    Ok((first, second))
}

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RtcEvent>>>,
}

impl WebRtcConnection {
    pub fn new(pc: Arc<RTCPeerConnection>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(RtcEvent::NegotiationNeeded);
            })
        }));

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(RtcEvent::LocalCandidate(candidate_from_init(init)));
                    }
                    Err(err) => {
                        warn!(target = "peer_channel::webrtc", error = %err, "failed to encode local candidate");
                    }
                }
            })
        }));

        let tx = events_tx;
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                trace!(target = "peer_channel::webrtc", ?state, "ice connection state");
                if let Some(connectivity) = connectivity_from(state) {
                    let _ = tx.send(RtcEvent::Connectivity(connectivity));
                }
            })
        }));

        Arc::new(Self {
            pc,
            events: Mutex::new(Some(events_rx)),
        })
    }
}

fn connectivity_from(state: RTCIceConnectionState) -> Option<Connectivity> {
    Some(match state {
        RTCIceConnectionState::New => Connectivity::New,
        RTCIceConnectionState::Checking => Connectivity::Checking,
        RTCIceConnectionState::Connected => Connectivity::Connected,
        RTCIceConnectionState::Completed => Connectivity::Completed,
        RTCIceConnectionState::Disconnected => Connectivity::Disconnected,
        RTCIceConnectionState::Failed => Connectivity::Failed,
        RTCIceConnectionState::Closed => Connectivity::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn description_from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(TransportError::Negotiation("unspecified sdp type".into()));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn description_to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp).map_err(to_negotiation_error),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp).map_err(to_negotiation_error),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp).map_err(to_negotiation_error),
        SdpType::Rollback => Err(TransportError::Negotiation(
            "rollback descriptions are applied through rollback()".into(),
        )),
    }
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RtcEvent>> {
        self.events.lock().take()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        description_from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        description_from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(description_to_rtc(desc)?)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(description_to_rtc(desc)?)
            .await
            .map_err(to_negotiation_error)
    }

    /// webrtc-rs has no `have-local-offer` to `stable` transition for a
    /// local rollback.
    fn supports_rollback(&self) -> bool {
        false
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        Err(TransportError::Negotiation(
            "webrtc backend cannot roll back a local offer".into(),
        ))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_negotiation_error)
    }

    async fn create_channel(
        &self,
        label: &str,
        id: u16,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(id),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        Ok(WebRtcChannel::attach(dc).await)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(to_setup_error)
    }
}

fn channel_state_from(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
            ChannelState::Connecting
        }
    }
}

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    state: Arc<watch::Sender<ChannelState>>,
    inbound: Arc<Emitter<Bytes>>,
    drained: Arc<Notify>,
}

impl WebRtcChannel {
    pub async fn attach(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let state = Arc::new(watch::Sender::new(channel_state_from(dc.ready_state())));
        let inbound = Arc::new(Emitter::new());
        let drained = Arc::new(Notify::new());
        let label = dc.label().to_string();

        let open_state = Arc::clone(&state);
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            let state = Arc::clone(&open_state);
            let label = open_label.clone();
            Box::pin(async move {
                debug!(target = "peer_channel::webrtc", %label, "data channel open");
                state.send_replace(ChannelState::Open);
            })
        }));

        let close_state = Arc::clone(&state);
        let close_inbound = Arc::clone(&inbound);
        let close_drained = Arc::clone(&drained);
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            let state = Arc::clone(&close_state);
            let inbound = Arc::clone(&close_inbound);
            let drained = Arc::clone(&close_drained);
            let label = close_label.clone();
            Box::pin(async move {
                debug!(target = "peer_channel::webrtc", %label, "data channel closed");
                state.send_replace(ChannelState::Closed);
                inbound.clear();
                drained.notify_waiters();
            })
        }));

        let message_inbound = Arc::clone(&inbound);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let inbound = Arc::clone(&message_inbound);
            Box::pin(async move {
                inbound.emit(msg.data);
            })
        }));

        let low_drained = Arc::clone(&drained);
        dc.on_buffered_amount_low(Box::new(move || {
            let drained = Arc::clone(&low_drained);
            Box::pin(async move {
                drained.notify_waiters();
            })
        }))
        .await;

        Arc::new(Self {
            dc,
            label,
            state,
            inbound,
            drained,
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn id(&self) -> u16 {
        self.dc.id()
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.inbound.subscribe()
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.state() != ChannelState::Open {
            return Err(TransportError::NotOpen);
        }
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|err| {
                warn!(target = "peer_channel::webrtc", label = %self.label, error = %err, "data channel send failed");
                TransportError::ChannelClosed
            })
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    fn buffer_drained(&self) -> &Notify {
        &self.drained
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            debug!(target = "peer_channel::webrtc", label = %self.label, error = %err, "data channel close failed");
        }
        self.state.send_replace(ChannelState::Closed);
        self.drained.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_descriptions_are_not_converted() {
        let desc = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(
            description_to_rtc(desc),
            Err(TransportError::Negotiation(_))
        ));
    }

    #[test]
    fn ice_servers_are_carried_over() {
        let config = rtc_configuration(&PeerConfig::default());
        assert_eq!(config.ice_servers.len(), 2);
        assert!(rtc_configuration(&PeerConfig::localhost()).ice_servers.is_empty());
    }
}
