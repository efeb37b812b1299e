use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Фаза согласования сессии
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    New,
    HaveLocalOffer,
    HaveRemoteAnswer,
    HaveRemoteOffer,
    HaveLocalAnswer,
    Connected,
    Closed,
}

impl NegotiationPhase {
    /// Обмен offer/answer завершён
    pub fn is_negotiated(self) -> bool {
        matches!(
            self,
            NegotiationPhase::HaveRemoteAnswer
                | NegotiationPhase::HaveLocalAnswer
                | NegotiationPhase::Connected
        )
    }
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationPhase::New => "NEW",
            NegotiationPhase::HaveLocalOffer => "HAVE_LOCAL_OFFER",
            NegotiationPhase::HaveRemoteAnswer => "HAVE_REMOTE_ANSWER",
            NegotiationPhase::HaveRemoteOffer => "HAVE_REMOTE_OFFER",
            NegotiationPhase::HaveLocalAnswer => "HAVE_LOCAL_ANSWER",
            NegotiationPhase::Connected => "CONNECTED",
            NegotiationPhase::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Роль локальной стороны в сессии
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Отдаёт медиа и создаёт offer
    Offerer,
    /// Принимает offer удалённой стороны
    Answerer,
}

/// Состояние соединения, которое сообщает транспорт
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Описание сессии в формате браузерного `RTCSessionDescriptionInit`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// ICE кандидат в формате браузерного `RTCIceCandidateInit`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Параметры транспорта, которые присылает релей (CONFIG)
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_transport_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp_mux_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_candidate_pool_size: Option<u8>,
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Локальный трек, привязанный к источнику медиа
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn sources(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.source.clone()).collect()
    }
}

/// Удалённый трек, пришедший от транспорта
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub track_id: String,
    pub stream_id: String,
    pub kind: Option<TrackKind>,
}
