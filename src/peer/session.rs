//! Сессия согласования с одним удалённым пиром.

use crate::config::GRACE_PERIOD;
use crate::error::{Result, SignalError};
use crate::logger::dump_candidate;
use crate::peer::ice::{analyze_candidates, apply_pending_candidates, CandidateTally, PendingCandidates};
use crate::peer::transport::{PeerEvent, Transport};
use crate::peer::types::{
    Candidate, ConnectionState, MediaStream, NegotiationPhase, SdpKind, SessionRole,
};
use crate::protocol::{
    decode_candidate, decode_description, encode_candidate, encode_description, Envelope,
    MessageKind, PeerId,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Что роутер должен сделать после смены состояния транспорта
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOutcome {
    Ignored,
    Connected,
    Recovered,
    Problem,
    MustClose,
}

pub struct NegotiationSession {
    remote: PeerId,
    role: SessionRole,
    phase: NegotiationPhase,
    transport: Option<Box<dyn Transport>>,
    media: Option<MediaStream>,
    granted_sources: Vec<String>,
    pending: PendingCandidates,
    remote_applied: bool,
    local_tally: CandidateTally,
    transport_state: ConnectionState,
    outbound: mpsc::UnboundedSender<Envelope>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    grace_period: Duration,
    grace_task: Option<JoinHandle<()>>,
    grace_generation: u64,
}

impl NegotiationSession {
    pub fn new(
        remote: PeerId,
        role: SessionRole,
        transport: Box<dyn Transport>,
        outbound: mpsc::UnboundedSender<Envelope>,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        NegotiationSession {
            remote,
            role,
            phase: NegotiationPhase::New,
            transport: Some(transport),
            media: None,
            granted_sources: Vec::new(),
            pending: PendingCandidates::default(),
            remote_applied: false,
            local_tally: CandidateTally::default(),
            transport_state: ConnectionState::New,
            outbound,
            peer_events,
            grace_period: GRACE_PERIOD,
            grace_task: None,
            grace_generation: 0,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == NegotiationPhase::Closed
    }

    pub fn media(&self) -> Option<&MediaStream> {
        self.media.as_ref()
    }

    pub fn granted_sources(&self) -> &[String] {
        &self.granted_sources
    }

    pub fn set_granted_sources(&mut self, sources: Vec<String>) {
        self.granted_sources = sources;
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    fn transport(&self) -> Result<&dyn Transport> {
        match &self.transport {
            Some(t) => Ok(t.as_ref()),
            None => Err(self.ordering("use transport")),
        }
    }

    fn ordering(&self, op: &'static str) -> SignalError {
        SignalError::Ordering {
            peer: self.remote.clone(),
            op,
            phase: self.phase,
        }
    }

    fn expect_phase(&self, op: &'static str, expected: NegotiationPhase) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(self.ordering(op))
        }
    }

    fn send(&self, kind: MessageKind, payload: String) {
        if self
            .outbound
            .send(Envelope::to_peer(&self.remote, kind, payload))
            .is_err()
        {
            tracing::warn!(peer = %self.remote, "relay outbound channel closed, message dropped");
        }
    }

    /// Привязывает локальные треки к транспорту
    pub async fn attach_media(&mut self, stream: MediaStream) -> Result<()> {
        if self.phase != NegotiationPhase::New {
            return Err(self.ordering("attach_media"));
        }
        let transport = self.transport()?;
        for track in &stream.tracks {
            transport
                .attach_track(track, &stream.id)
                .await
                .map_err(|e| SignalError::transport(&self.remote, e))?;
            tracing::debug!(peer = %self.remote, track = %track.id, source = %track.source, "track attached");
        }
        self.media = Some(stream);
        Ok(())
    }

    pub async fn create_local_offer(&mut self) -> Result<()> {
        self.expect_phase("create_local_offer", NegotiationPhase::New)?;
        let transport = self.transport()?;
        let offer = transport
            .create_offer()
            .await
            .map_err(|e| SignalError::transport(&self.remote, e))?;
        transport
            .set_local_description(offer.clone())
            .await
            .map_err(|e| SignalError::transport(&self.remote, e))?;

        self.phase = NegotiationPhase::HaveLocalOffer;
        tracing::info!(peer = %self.remote, "sending offer");
        self.send(MessageKind::Offer, encode_description(&offer));
        Ok(())
    }

    pub async fn create_local_answer(&mut self) -> Result<()> {
        self.expect_phase("create_local_answer", NegotiationPhase::HaveRemoteOffer)?;
        let transport = self.transport()?;
        let answer = transport
            .create_answer()
            .await
            .map_err(|e| SignalError::transport(&self.remote, e))?;
        transport
            .set_local_description(answer.clone())
            .await
            .map_err(|e| SignalError::transport(&self.remote, e))?;

        self.phase = NegotiationPhase::HaveLocalAnswer;
        tracing::info!(peer = %self.remote, "sending answer");
        self.send(MessageKind::Answer, encode_description(&answer));
        Ok(())
    }

    /// Применяет offer/answer удалённой стороны; `kind` нужен только для ошибок разбора.
    /// Glare (offer в HAVE_LOCAL_OFFER) даёт ошибку порядка без отката.
    /// Возвращает тип применённого описания, `None` для закрытой сессии.
    pub async fn apply_remote_description(
        &mut self,
        kind: &MessageKind,
        payload: &str,
    ) -> Result<Option<SdpKind>> {
        if self.is_closed() {
            tracing::debug!(peer = %self.remote, "session closed, remote description ignored");
            return Ok(None);
        }
        let desc = decode_description(kind, payload)?;
        let next = match (self.phase, desc.kind) {
            (NegotiationPhase::New, SdpKind::Offer) => NegotiationPhase::HaveRemoteOffer,
            (NegotiationPhase::HaveLocalOffer, SdpKind::Answer) => NegotiationPhase::HaveRemoteAnswer,
            (_, SdpKind::Offer) => return Err(self.ordering("apply_remote_description(offer)")),
            (_, SdpKind::Answer) => return Err(self.ordering("apply_remote_description(answer)")),
            (_, SdpKind::Pranswer) => return Err(self.ordering("apply_remote_description(pranswer)")),
            (_, SdpKind::Rollback) => return Err(self.ordering("apply_remote_description(rollback)")),
        };

        let Some(transport) = self.transport.as_deref() else {
            return Err(self.ordering("apply_remote_description"));
        };
        let applied_kind = desc.kind;
        transport
            .set_remote_description(desc)
            .await
            .map_err(|e| SignalError::transport(&self.remote, e))?;

        let applied = apply_pending_candidates(&self.remote, transport, &mut self.pending).await;
        if applied > 0 {
            tracing::debug!(peer = %self.remote, applied, "flushed pending candidates");
        }
        self.remote_applied = true;
        self.phase = next;
        tracing::info!(peer = %self.remote, phase = %self.phase, "remote description applied");
        Ok(Some(applied_kind))
    }

    /// Кандидат удалённой стороны; до remote description он откладывается
    pub async fn add_remote_candidate(&mut self, payload: &str) -> Result<()> {
        if self.is_closed() {
            tracing::debug!(peer = %self.remote, "session closed, remote candidate ignored");
            return Ok(());
        }
        let Some(candidate) = decode_candidate(&MessageKind::Candidate, payload)? else {
            tracing::debug!(peer = %self.remote, "remote end-of-candidates");
            return Ok(());
        };

        if !self.remote_applied {
            tracing::debug!(peer = %self.remote, "remote description not set yet, queuing candidate");
            self.pending.push(candidate);
            return Ok(());
        }

        dump_candidate("REMOTE", &self.remote, &candidate);
        if let Err(e) = self.transport()?.add_ice_candidate(candidate).await {
            tracing::warn!(peer = %self.remote, error = %e, "failed to add ICE candidate");
        }
        Ok(())
    }

    /// Локальный кандидат от транспорта: сразу уходит удалённой стороне
    pub fn on_local_candidate(&mut self, candidate: Option<Candidate>) {
        if self.is_closed() {
            return;
        }
        match candidate {
            Some(c) => {
                dump_candidate("LOCAL", &self.remote, &c);
                self.local_tally.record(&c);
                self.send(MessageKind::Candidate, encode_candidate(&c));
            }
            None => {
                // null-кандидат означает конец сбора и не пересылается
                tracing::debug!(peer = %self.remote, total = self.local_tally.total(), "ICE candidate gathering completed");
                analyze_candidates(&self.remote, &self.local_tally);
            }
        }
    }

    pub fn on_connection_state(&mut self, state: ConnectionState) -> StateOutcome {
        if self.is_closed() {
            return StateOutcome::Ignored;
        }
        tracing::debug!(peer = %self.remote, ?state, phase = %self.phase, "transport state changed");
        self.transport_state = state;

        match state {
            ConnectionState::Connected => {
                // отменяем отложенное закрытие, если оно было
                let recovered = match self.grace_task.take() {
                    Some(task) => {
                        task.abort();
                        true
                    }
                    None => false,
                };
                let promoted =
                    self.phase.is_negotiated() && self.phase != NegotiationPhase::Connected;
                if promoted {
                    self.phase = NegotiationPhase::Connected;
                }
                match (recovered, promoted) {
                    (true, _) => StateOutcome::Recovered,
                    (false, true) => StateOutcome::Connected,
                    (false, false) => {
                        tracing::debug!(peer = %self.remote, phase = %self.phase, "connected outside of negotiation, ignoring");
                        StateOutcome::Ignored
                    }
                }
            }
            ConnectionState::Disconnected => {
                if self.grace_task.is_some() {
                    return StateOutcome::Ignored;
                }
                let peer = self.remote.clone();
                let events = self.peer_events.clone();
                let grace = self.grace_period;
                self.grace_generation += 1;
                let generation = self.grace_generation;
                tracing::debug!(peer = %peer, grace_ms = grace.as_millis() as u64, generation, "grace period started");
                self.grace_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = events.send(PeerEvent::GraceExpired { peer, generation });
                }));
                StateOutcome::Problem
            }
            ConnectionState::Failed | ConnectionState::Closed => StateOutcome::MustClose,
            ConnectionState::New | ConnectionState::Connecting => StateOutcome::Ignored,
        }
    }

    /// `true`, если соединение так и не восстановилось.
    /// Событие от таймера прошлого разрыва игнорируется.
    pub fn on_grace_expired(&mut self, generation: u64) -> bool {
        if self.is_closed() || generation != self.grace_generation {
            tracing::debug!(peer = %self.remote, generation, current = self.grace_generation, "stale grace expiry ignored");
            return false;
        }
        if self.grace_task.take().is_none() {
            return false;
        }
        self.transport_state != ConnectionState::Connected
    }

    /// Отправляет текст пиру по data-channel
    pub async fn send_message(&self, text: &str) -> Result<()> {
        if self.is_closed() {
            return Err(self.ordering("send message"));
        }
        self.transport()?
            .send_text(text)
            .await
            .map_err(|e| SignalError::transport(&self.remote, e))?;
        tracing::debug!(peer = %self.remote, len = text.len(), "data channel message sent");
        Ok(())
    }

    /// Освобождает транспорт; повторный вызов ничего не делает
    pub async fn close(&mut self) -> Result<()> {
        if let Some(task) = self.grace_task.take() {
            task.abort();
        }
        self.pending.clear();
        self.phase = NegotiationPhase::Closed;

        let Some(transport) = self.transport.take() else {
            return Ok(());
        };
        tracing::info!(peer = %self.remote, "closing peer connection");
        transport
            .close()
            .await
            .map_err(|e| SignalError::transport(&self.remote, e))
    }
}

impl Drop for NegotiationSession {
    fn drop(&mut self) {
        if let Some(task) = self.grace_task.take() {
            task.abort();
        }
        let Some(transport) = self.transport.take() else {
            return;
        };
        let peer = self.remote.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.close().await {
                        tracing::warn!(peer = %peer, error = %e, "failed to close dropped session");
                    }
                });
            }
            Err(_) => tracing::warn!(peer = %peer, "session dropped outside runtime, transport released without close"),
        }
    }
}
