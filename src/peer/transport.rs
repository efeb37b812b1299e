//! Граница с медиа/транспортным движком.

use crate::peer::types::{
    Candidate, ConnectionState, MediaTrack, RemoteTrack, SessionDescription, SessionRole,
    TransportConfig,
};
use crate::protocol::PeerId;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransportFailure(pub String);

impl TransportFailure {
    pub fn new(reason: impl ToString) -> Self {
        TransportFailure(reason.to_string())
    }
}

/// Возможности транспорта, которыми владеет одна сессия
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportFailure>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportFailure>;

    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), TransportFailure>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportFailure>;

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), TransportFailure>;

    async fn attach_track(&self, track: &MediaTrack, stream_id: &str)
        -> Result<(), TransportFailure>;

    /// Текст в открытый data-channel
    async fn send_text(&self, text: &str) -> Result<(), TransportFailure>;

    async fn close(&self) -> Result<(), TransportFailure>;
}

/// Создаёт транспорт для новой сессии
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &TransportConfig,
        role: SessionRole,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportFailure>;
}

/// События транспорта (push, не опрос)
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// `None` означает конец сбора кандидатов
    LocalCandidate(Option<Candidate>),
    ConnectionState(ConnectionState),
    RemoteTrack(RemoteTrack),
    DataChannelOpen,
    DataChannelMessage(String),
    DataChannelClosed,
}

/// События, которые роутер получает от сессий и их транспортов
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Transport { peer: PeerId, event: TransportEvent },
    /// `generation` отличает таймер текущего разрыва от уже устаревших
    GraceExpired { peer: PeerId, generation: u64 },
}

/// Канал событий одного транспорта, уже привязанный к удалённому пиру
#[derive(Debug, Clone)]
pub struct TransportEvents {
    peer: PeerId,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl TransportEvents {
    pub fn new(peer: PeerId, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        TransportEvents { peer, tx }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn emit(&self, event: TransportEvent) {
        // Цикл роутера уже завершён: событие некому доставить
        if self
            .tx
            .send(PeerEvent::Transport {
                peer: self.peer.clone(),
                event,
            })
            .is_err()
        {
            tracing::trace!(peer = %self.peer, "transport event dropped, router is gone");
        }
    }
}
