//! Конверт сигнализации и кодеки его полезной нагрузки.
//!
//! `payload` всегда строка; её структуру разбирает только обработчик
//! соответствующего `type`.

use crate::peer::types::{Candidate, IceServer, SdpKind, SessionDescription, TransportConfig};
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Идентификатор пира в сети релея
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// Тип сообщения; неизвестные значения сохраняются как есть
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Register,
    Config,
    Request,
    Response,
    Offer,
    Answer,
    Candidate,
    Error,
    Unknown(String),
}

impl MessageKind {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "REGISTER" => MessageKind::Register,
            "CONFIG" => MessageKind::Config,
            "REQUEST" => MessageKind::Request,
            "RESPONSE" => MessageKind::Response,
            "OFFER" => MessageKind::Offer,
            "ANSWER" => MessageKind::Answer,
            "CANDIDATE" => MessageKind::Candidate,
            "ERROR" => MessageKind::Error,
            other => MessageKind::Unknown(other.to_string()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            MessageKind::Register => "REGISTER",
            MessageKind::Config => "CONFIG",
            MessageKind::Request => "REQUEST",
            MessageKind::Response => "RESPONSE",
            MessageKind::Offer => "OFFER",
            MessageKind::Answer => "ANSWER",
            MessageKind::Candidate => "CANDIDATE",
            MessageKind::Error => "ERROR",
            MessageKind::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

/// Некорректный конверт или полезная нагрузка
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {} message: field `{field}`: {reason}", kind_label(.kind))]
pub struct DecodeError {
    pub kind: Option<MessageKind>,
    pub field: &'static str,
    pub reason: String,
}

fn kind_label(kind: &Option<MessageKind>) -> &str {
    kind.as_ref().map(MessageKind::as_wire).unwrap_or("relay")
}

impl DecodeError {
    pub fn new(kind: Option<&MessageKind>, field: &'static str, reason: impl ToString) -> Self {
        DecodeError {
            kind: kind.cloned(),
            field,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: String,
}

impl Envelope {
    pub fn new(kind: MessageKind, payload: impl Into<String>) -> Self {
        Envelope {
            to: None,
            from: None,
            kind,
            payload: payload.into(),
        }
    }

    pub fn to_peer(to: &PeerId, kind: MessageKind, payload: impl Into<String>) -> Self {
        Envelope {
            to: Some(to.clone()),
            ..Envelope::new(kind, payload)
        }
    }

    pub fn from_peer(from: &PeerId, kind: MessageKind, payload: impl Into<String>) -> Self {
        Envelope {
            from: Some(from.clone()),
            ..Envelope::new(kind, payload)
        }
    }

    /// Отправитель обязателен для всех сообщений, адресованных сессии
    pub fn sender(&self) -> Result<&PeerId, DecodeError> {
        self.from
            .as_ref()
            .ok_or_else(|| DecodeError::new(Some(&self.kind), "from", "missing sender"))
    }

    pub fn encode(&self) -> String {
        // Только строки и опциональные строки: сериализация не может упасть
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| DecodeError::new(None, "envelope", e))?;
        let obj = value
            .as_object()
            .ok_or_else(|| DecodeError::new(None, "envelope", "expected a JSON object"))?;

        let kind = match obj.get("type") {
            Some(Value::String(raw)) => MessageKind::from_wire(raw),
            Some(_) => return Err(DecodeError::new(None, "type", "expected a string")),
            None => return Err(DecodeError::new(None, "type", "missing")),
        };
        let to = peer_field(obj, "to", &kind)?;
        let from = peer_field(obj, "from", &kind)?;

        // Браузерный клиент кладёт в payload объект, а не строку
        let payload = match obj.get("payload") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };

        Ok(Envelope {
            to,
            from,
            kind,
            payload,
        })
    }
}

fn peer_field(
    obj: &Map<String, Value>,
    key: &'static str,
    kind: &MessageKind,
) -> Result<Option<PeerId>, DecodeError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(PeerId::new(s.clone()))),
        // Браузерный клиент шлёт числовые id в REGISTER/REQUEST
        Some(Value::Number(n)) => Ok(Some(PeerId::new(n.to_string()))),
        Some(_) => Err(DecodeError::new(
            Some(kind),
            key,
            "expected a string or number",
        )),
    }
}

fn payload_object(kind: &MessageKind, payload: &str) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(_) => Err(DecodeError::new(
            Some(kind),
            "payload",
            "expected a JSON object",
        )),
        Err(e) => Err(DecodeError::new(Some(kind), "payload", e)),
    }
}

fn optional<T: DeserializeOwned>(
    obj: &Map<String, Value>,
    key: &str,
    field: &'static str,
    kind: &MessageKind,
) -> Result<Option<T>, DecodeError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| DecodeError::new(Some(kind), field, e)),
    }
}

fn required<T: DeserializeOwned>(
    obj: &Map<String, Value>,
    key: &str,
    field: &'static str,
    kind: &MessageKind,
) -> Result<T, DecodeError> {
    optional(obj, key, field, kind)?.ok_or_else(|| DecodeError::new(Some(kind), field, "missing"))
}

/// OFFER/ANSWER: `{"type": "offer", "sdp": "..."}`
pub fn decode_description(
    kind: &MessageKind,
    payload: &str,
) -> Result<SessionDescription, DecodeError> {
    let obj = payload_object(kind, payload)?;
    let sdp_kind: SdpKind = required(&obj, "type", "payload.type", kind)?;
    let sdp: String = required(&obj, "sdp", "payload.sdp", kind)?;
    if sdp.trim().is_empty() && !matches!(sdp_kind, SdpKind::Rollback) {
        return Err(DecodeError::new(Some(kind), "payload.sdp", "empty"));
    }
    Ok(SessionDescription {
        kind: sdp_kind,
        sdp,
    })
}

pub fn encode_description(desc: &SessionDescription) -> String {
    serde_json::to_string(desc).unwrap_or_default()
}

/// CANDIDATE; `None` означает конец сбора кандидатов
pub fn decode_candidate(kind: &MessageKind, payload: &str) -> Result<Option<Candidate>, DecodeError> {
    let trimmed = payload.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    let obj = payload_object(kind, trimmed)?;
    let candidate: String = required(&obj, "candidate", "payload.candidate", kind)?;
    if candidate.is_empty() {
        return Ok(None);
    }
    Ok(Some(Candidate {
        candidate,
        sdp_mid: optional(&obj, "sdpMid", "payload.sdpMid", kind)?,
        sdp_mline_index: optional(&obj, "sdpMLineIndex", "payload.sdpMLineIndex", kind)?,
        username_fragment: optional(&obj, "usernameFragment", "payload.usernameFragment", kind)?,
    }))
}

pub fn encode_candidate(candidate: &Candidate) -> String {
    serde_json::to_string(candidate).unwrap_or_default()
}

/// CONFIG: браузерный `RTCConfiguration`
pub fn decode_config(kind: &MessageKind, payload: &str) -> Result<TransportConfig, DecodeError> {
    let obj = payload_object(kind, payload)?;
    let ice_servers: Vec<IceServer> =
        optional(&obj, "iceServers", "payload.iceServers", kind)?.unwrap_or_default();
    if let Some(server) = ice_servers.iter().find(|s| s.urls.is_empty()) {
        return Err(DecodeError::new(
            Some(kind),
            "payload.iceServers",
            format!("server without urls (username {:?})", server.username),
        ));
    }
    Ok(TransportConfig {
        ice_servers,
        ice_transport_policy: optional(
            &obj,
            "iceTransportPolicy",
            "payload.iceTransportPolicy",
            kind,
        )?,
        bundle_policy: optional(&obj, "bundlePolicy", "payload.bundlePolicy", kind)?,
        rtcp_mux_policy: optional(&obj, "rtcpMuxPolicy", "payload.rtcpMuxPolicy", kind)?,
        ice_candidate_pool_size: optional(
            &obj,
            "iceCandidatePoolSize",
            "payload.iceCandidatePoolSize",
            kind,
        )?,
    })
}

/// REQUEST/RESPONSE: список источников через запятую
pub fn parse_sources(payload: &str) -> Vec<String> {
    payload
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn join_sources(sources: &[String]) -> String {
    sources.join(",")
}
