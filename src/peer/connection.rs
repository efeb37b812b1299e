use crate::config::DEFAULT_STUN_SERVERS;
use crate::peer::data_channel::{attach_dc, current_dc, take_dc, DataChannelSlot};
use crate::peer::transport::{
    Transport, TransportEvent, TransportEvents, TransportFactory, TransportFailure,
};
use crate::peer::types::{
    Candidate, ConnectionState, IceServer, MediaTrack, RemoteTrack, SessionDescription,
    SessionRole, TrackKind, TransportConfig,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel},
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// Имя data-channel, который открывает offerer
pub const DATA_CHANNEL_LABEL: &str = "dataChannel";

impl From<webrtc::Error> for TransportFailure {
    fn from(e: webrtc::Error) -> Self {
        TransportFailure::new(e)
    }
}

/// Транспорт на базе `webrtc` для каждой новой сессии
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcFactory;

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        config: &TransportConfig,
        role: SessionRole,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportFailure> {
        let dc = DataChannelSlot::default();
        let pc = new_peer(config, role, events, Arc::clone(&dc)).await?;
        Ok(Box::new(WebRtcTransport { pc, dc }))
    }
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    dc: DataChannelSlot,
}

/// создаём Peer; offerer сам делает data-channel
pub async fn new_peer(
    config: &TransportConfig,
    role: SessionRole,
    events: TransportEvents,
    dc_slot: DataChannelSlot,
) -> Result<Arc<RTCPeerConnection>, TransportFailure> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(rtc_config(config)).await?);

    // Локальные кандидаты уходят сразу (Trickle-ICE), None = конец сбора
    let ev = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => match c.to_json() {
                Ok(init) => ev.emit(TransportEvent::LocalCandidate(Some(from_init(init)))),
                Err(e) => tracing::warn!(peer = %ev.peer(), "failed to serialize local candidate: {e}"),
            },
            None => ev.emit(TransportEvent::LocalCandidate(None)),
        }
        Box::pin(async {})
    }));

    let peer = events.peer().clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        tracing::debug!(peer = %peer, "ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    let ev = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        tracing::debug!(peer = %ev.peer(), "Peer connection state changed to: {:?}", st);
        if let Some(state) = map_state(st) {
            ev.emit(TransportEvent::ConnectionState(state));
        }
        Box::pin(async {})
    }));

    let ev = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            ev.emit(TransportEvent::RemoteTrack(RemoteTrack {
                track_id: track.id(),
                stream_id: track.stream_id(),
                kind,
            }));
            Box::pin(async {})
        },
    ));

    match role {
        SessionRole::Offerer => {
            let dc = pc
                .create_data_channel(DATA_CHANNEL_LABEL, Some(RTCDataChannelInit::default()))
                .await?;
            attach_dc(&dc, events, &dc_slot);
        }
        SessionRole::Answerer => {
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                attach_dc(&dc, events.clone(), &dc_slot);
                Box::pin(async {})
            }));
        }
    }
    Ok(pc)
}

fn map_state(st: RTCPeerConnectionState) -> Option<ConnectionState> {
    match st {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(config: &TransportConfig) -> RTCConfiguration {
    let ice_servers = if config.ice_servers.is_empty() {
        vec![RTCIceServer {
            urls: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }]
    } else {
        config.ice_servers.iter().map(ice_server).collect()
    };

    let bundle_policy = match config.bundle_policy.as_deref().map(RTCBundlePolicy::from) {
        None | Some(RTCBundlePolicy::Unspecified) => RTCBundlePolicy::MaxBundle,
        Some(policy) => policy,
    };
    let rtcp_mux_policy = match config.rtcp_mux_policy.as_deref().map(RTCRtcpMuxPolicy::from) {
        None | Some(RTCRtcpMuxPolicy::Unspecified) => RTCRtcpMuxPolicy::Require,
        Some(policy) => policy,
    };

    RTCConfiguration {
        ice_servers,
        ice_transport_policy: config
            .ice_transport_policy
            .as_deref()
            .map(RTCIceTransportPolicy::from)
            .unwrap_or_default(),
        bundle_policy,
        rtcp_mux_policy,
        ice_candidate_pool_size: config.ice_candidate_pool_size.unwrap_or_default(),
        ..Default::default()
    }
}

fn ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server
            .urls
            .iter()
            .map(|url| add_ice_url_scheme(server, url))
            .collect(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
    }
}

fn from_init(init: RTCIceCandidateInit) -> Candidate {
    Candidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_init(candidate: Candidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

// Формат JSON у обоих типов совпадает: {"type": "...", "sdp": "..."}
fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportFailure> {
    let value = serde_json::to_value(desc).map_err(TransportFailure::new)?;
    serde_json::from_value(value).map_err(TransportFailure::new)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportFailure> {
    let value = serde_json::to_value(desc).map_err(TransportFailure::new)?;
    serde_json::from_value(value).map_err(TransportFailure::new)
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportFailure> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportFailure> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportFailure> {
        Ok(self.pc.set_local_description(to_rtc(desc)?).await?)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportFailure> {
        Ok(self.pc.set_remote_description(to_rtc(desc)?).await?)
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), TransportFailure> {
        Ok(self.pc.add_ice_candidate(to_init(candidate)).await?)
    }

    async fn attach_track(
        &self,
        track: &MediaTrack,
        stream_id: &str,
    ) -> Result<(), TransportFailure> {
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind),
            track.id.clone(),
            stream_id.to_string(),
        ));
        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportFailure> {
        let Some(dc) = current_dc(&self.dc) else {
            return Err(TransportFailure::new("data channel not established"));
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportFailure::new(format!(
                "data channel is {}",
                dc.ready_state()
            )));
        }
        dc.send_text(text.to_string()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportFailure> {
        take_dc(&self.dc);
        Ok(self.pc.close().await?)
    }
}
