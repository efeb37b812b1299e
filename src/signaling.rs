//! Роутер сигнализации: разбирает конверты релея и раздаёт их сессиям.

use crate::config::ConfigSlot;
use crate::error::{Result, SignalError};
use crate::logger::Emitter;
use crate::media::MediaResolver;
use crate::peer::transport::{PeerEvent, TransportEvent, TransportFactory};
use crate::peer::session::StateOutcome;
use crate::peer::types::{SdpKind, SessionRole};
use crate::protocol::{decode_config, join_sources, parse_sources, Envelope, MessageKind, PeerId};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::relay::RelayEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct SignalingRouter {
    local_id: PeerId,
    config: ConfigSlot,
    sessions: SessionRegistry,
    media: Arc<dyn MediaResolver>,
    outbound: mpsc::UnboundedSender<Envelope>,
    emitter: Emitter,
}

impl SignalingRouter {
    /// Возвращает роутер и приёмник событий его транспортов
    pub fn new(
        local_id: PeerId,
        factory: Arc<dyn TransportFactory>,
        media: Arc<dyn MediaResolver>,
        outbound: mpsc::UnboundedSender<Envelope>,
        emitter: Emitter,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let router = SignalingRouter {
            local_id,
            config: ConfigSlot::new(),
            sessions: SessionRegistry::new(factory, outbound.clone(), peer_tx),
            media,
            outbound,
            emitter,
        };
        (router, peer_rx)
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.sessions = self.sessions.with_grace_period(grace_period);
        self
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &ConfigSlot {
        &self.config
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    fn send(&self, envelope: Envelope) {
        tracing::debug!(kind = %envelope.kind, to = ?envelope.to.as_ref().map(PeerId::as_str), "sending envelope");
        if self.outbound.send(envelope).is_err() {
            tracing::warn!("relay outbound channel closed, message dropped");
        }
    }

    // ========== ЛОКАЛЬНЫЕ ДЕЙСТВИЯ ==========

    /// REGISTER с собственным id
    pub fn register(&self) {
        tracing::info!(id = %self.local_id, "registering with relay");
        self.send(Envelope::new(MessageKind::Register, self.local_id.as_str()));
    }

    /// Запросить у пира список источников
    pub fn request(&self, to: &PeerId, sources: &[String]) {
        tracing::info!(peer = %to, sources = %join_sources(sources), "requesting media");
        self.send(Envelope::to_peer(to, MessageKind::Request, join_sources(sources)));
    }

    /// Закрыть все сессии; возвращает те, что закрылись с ошибкой
    pub async fn stop(&self) -> Vec<(PeerId, SignalError)> {
        let peers = self.sessions.peers();
        let failures = self.sessions.close_all().await;
        for peer in &peers {
            self.emitter.emit_disconnected(peer);
        }
        tracing::info!(closed = peers.len(), failed = failures.len(), "all sessions closed");
        failures
    }

    /// Текст пиру по data-channel его сессии
    pub async fn send_message(&self, peer: &PeerId, text: &str) -> Result<()> {
        let handle = self.session(peer)?;
        let session = handle.lock().await;
        session.send_message(text).await
    }

    // ========== ВХОДЯЩИЕ СООБЩЕНИЯ ==========

    /// Кадр релея; ошибки не выходят за пределы одного сообщения
    pub async fn handle_text(&self, text: &str) {
        match Envelope::decode(text) {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(e) => self.report(None, &SignalError::from(e)),
        }
    }

    pub async fn handle_envelope(&self, envelope: Envelope) {
        let peer = envelope.from.clone();
        if let Err(e) = self.dispatch(envelope).await {
            self.report(peer.as_ref(), &e);
        }
    }

    fn report(&self, peer: Option<&PeerId>, err: &SignalError) {
        let peer = peer.map(PeerId::as_str);
        if err.is_disruptive() {
            tracing::error!(peer = ?peer, error = %err, "signaling failure");
            self.emitter.emit_alert(err.to_string());
        } else {
            tracing::warn!(peer = ?peer, error = %err, "envelope rejected");
        }
    }

    pub async fn dispatch(&self, envelope: Envelope) -> Result<()> {
        tracing::debug!(
            kind = %envelope.kind,
            from = ?envelope.from.as_ref().map(PeerId::as_str),
            "envelope received"
        );
        match &envelope.kind {
            MessageKind::Config => self.on_config(&envelope),
            MessageKind::Request => self.on_request(&envelope).await,
            MessageKind::Response => self.on_response(&envelope).await,
            MessageKind::Offer => self.on_offer(&envelope).await,
            MessageKind::Answer => self.on_answer(&envelope).await,
            MessageKind::Candidate => self.on_candidate(&envelope).await,
            MessageKind::Error => {
                self.on_error(&envelope);
                Ok(())
            }
            MessageKind::Register => {
                tracing::debug!(payload = %envelope.payload, "inbound REGISTER discarded");
                Ok(())
            }
            MessageKind::Unknown(raw) => {
                tracing::warn!(kind = %raw, "unknown message type discarded");
                Ok(())
            }
        }
    }

    fn on_config(&self, envelope: &Envelope) -> Result<()> {
        let config = decode_config(&envelope.kind, &envelope.payload)?;
        let servers = config.ice_servers.len();
        if self.config.set(config) {
            tracing::info!(ice_servers = servers, "transport configuration received");
        } else {
            tracing::warn!("transport configuration already set, CONFIG ignored");
        }
        Ok(())
    }

    /// Удалённый пир просит медиа: мы становимся offerer
    async fn on_request(&self, envelope: &Envelope) -> Result<()> {
        let peer = envelope.sender()?.clone();
        let config = self.config.get()?;
        if self.sessions.contains(&peer) {
            return Err(SignalError::DuplicateSession { peer });
        }

        let requested = parse_sources(&envelope.payload);
        let sources = self.media.resolve_available_sources(&requested).await;
        tracing::info!(peer = %peer, requested = requested.len(), granted = sources.len(), "media requested");

        let stream = match self.media.acquire_local_media(&sources).await {
            Ok(stream) => stream,
            Err(e) => {
                self.send(Envelope::to_peer(&peer, MessageKind::Error, e.to_string()));
                return Err(e);
            }
        };

        let handle = match self
            .sessions
            .create(&peer, config, SessionRole::Offerer, Some(stream))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.send(Envelope::to_peer(&peer, MessageKind::Error, e.to_string()));
                return Err(e);
            }
        };
        handle.lock().await.set_granted_sources(sources.clone());
        self.send(Envelope::to_peer(&peer, MessageKind::Response, join_sources(&sources)));

        let offered = handle.lock().await.create_local_offer().await;
        if let Err(e) = offered {
            self.discard(&peer).await;
            return Err(e);
        }
        Ok(())
    }

    /// Пир согласился отдать медиа: ждём от него offer
    async fn on_response(&self, envelope: &Envelope) -> Result<()> {
        let peer = envelope.sender()?;
        let config = self.config.get()?;
        let sources = parse_sources(&envelope.payload);
        let handle = self
            .sessions
            .create(peer, config, SessionRole::Answerer, None)
            .await?;
        tracing::info!(peer = %peer, sources = %envelope.payload, "request granted, awaiting offer");
        handle.lock().await.set_granted_sources(sources);
        Ok(())
    }

    async fn on_offer(&self, envelope: &Envelope) -> Result<()> {
        let peer = envelope.sender()?;
        let handle = self.session(peer)?;
        let answered = {
            let mut session = handle.lock().await;
            let applied = session
                .apply_remote_description(&envelope.kind, &envelope.payload)
                .await?;
            if applied == Some(SdpKind::Offer) {
                session.create_local_answer().await
            } else {
                Ok(())
            }
        };
        if let Err(e) = answered {
            self.discard(peer).await;
            return Err(e);
        }
        Ok(())
    }

    async fn on_answer(&self, envelope: &Envelope) -> Result<()> {
        let peer = envelope.sender()?;
        let handle = self.session(peer)?;
        let mut session = handle.lock().await;
        session
            .apply_remote_description(&envelope.kind, &envelope.payload)
            .await?;
        Ok(())
    }

    /// Кандидат никогда не создаёт сессию
    async fn on_candidate(&self, envelope: &Envelope) -> Result<()> {
        let peer = envelope.sender()?;
        let handle = self.session(peer)?;
        let mut session = handle.lock().await;
        session.add_remote_candidate(&envelope.payload).await
    }

    fn on_error(&self, envelope: &Envelope) {
        tracing::warn!(
            peer = ?envelope.from.as_ref().map(PeerId::as_str),
            "ERROR from relay: {}",
            envelope.payload
        );
        self.emitter
            .emit_peer_error(envelope.from.as_ref(), &envelope.payload);
    }

    fn session(&self, peer: &PeerId) -> Result<SessionHandle> {
        self.sessions
            .get(peer)
            .ok_or_else(|| SignalError::SessionNotFound { peer: peer.clone() })
    }

    /// Убрать сессию из реестра и закрыть её
    async fn discard(&self, peer: &PeerId) {
        match self.sessions.close(peer).await {
            Ok(true) => tracing::info!(peer = %peer, "session discarded"),
            Ok(false) => {}
            Err(e) => tracing::warn!(peer = %peer, error = %e, "session discarded, close failed"),
        }
    }

    // ========== СОБЫТИЯ ТРАНСПОРТА ==========

    pub async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Transport { peer, event } => self.on_transport_event(&peer, event).await,
            PeerEvent::GraceExpired { peer, generation } => {
                let Some(handle) = self.sessions.get(&peer) else {
                    return;
                };
                let expired = handle.lock().await.on_grace_expired(generation);
                if expired {
                    tracing::warn!(peer = %peer, "connection not recovered within grace period");
                    self.emitter.emit_connection_failed(&peer);
                    self.discard(&peer).await;
                }
            }
        }
    }

    async fn on_transport_event(&self, peer: &PeerId, event: TransportEvent) {
        // После закрытия сессии транспорт ещё может прислать события
        let Some(handle) = self.sessions.get(peer) else {
            tracing::debug!(peer = %peer, ?event, "event for unknown session dropped");
            return;
        };
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                handle.lock().await.on_local_candidate(candidate);
            }
            TransportEvent::ConnectionState(state) => {
                let outcome = handle.lock().await.on_connection_state(state);
                match outcome {
                    StateOutcome::Connected => self.emitter.emit_connected(peer),
                    StateOutcome::Recovered => {
                        self.emitter.emit_connection_recovered(peer);
                        self.emitter.emit_connected(peer);
                    }
                    StateOutcome::Problem => {
                        self.emitter.emit_connection_problem(peer);
                        self.emitter.emit_connection_recovering(peer);
                    }
                    StateOutcome::MustClose => {
                        tracing::info!(peer = %peer, ?state, "transport ended, closing session");
                        self.discard(peer).await;
                        self.emitter.emit_disconnected(peer);
                    }
                    StateOutcome::Ignored => {}
                }
            }
            TransportEvent::RemoteTrack(track) => {
                tracing::info!(peer = %peer, track = %track.track_id, stream = %track.stream_id, "remote track");
                self.emitter.emit_remote_track(peer, track);
            }
            TransportEvent::DataChannelOpen => {
                tracing::info!(peer = %peer, "data channel open");
            }
            TransportEvent::DataChannelMessage(text) => self.emitter.emit_message(peer, &text),
            TransportEvent::DataChannelClosed => {
                tracing::info!(peer = %peer, "data channel closed");
            }
        }
    }

    // ========== РЕЛЕЙ ==========

    /// `false`, когда цикл должен завершиться
    pub async fn handle_relay_event(&self, event: RelayEvent) -> bool {
        match event {
            RelayEvent::Open => {
                tracing::info!("relay connection open");
                self.register();
                true
            }
            RelayEvent::Message(text) => {
                self.handle_text(&text).await;
                true
            }
            RelayEvent::Error(reason) => {
                self.report(None, &SignalError::RelayConnection(reason));
                true
            }
            RelayEvent::Closed => {
                tracing::warn!(sessions = self.sessions.len(), "relay connection closed");
                let failures = self.stop().await;
                for (peer, e) in &failures {
                    self.report(Some(peer), e);
                }
                self.emitter.emit_relay_closed();
                false
            }
        }
    }

    /// События релея и транспортов обрабатываются по одному, в порядке прихода
    pub async fn run(
        &self,
        mut relay_events: mpsc::UnboundedReceiver<RelayEvent>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        loop {
            tokio::select! {
                event = relay_events.recv() => {
                    let event = event.unwrap_or(RelayEvent::Closed);
                    if !self.handle_relay_event(event).await {
                        break;
                    }
                }
                Some(event) = peer_events.recv() => self.handle_peer_event(event).await,
            }
        }
        tracing::info!("signaling loop finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Notice;
    use crate::peer::mock::{Call, Failures, MockFactory, MockMedia};
    use crate::peer::types::{ConnectionState, NegotiationPhase};

    struct Harness {
        router: SignalingRouter,
        factory: MockFactory,
        outbound: mpsc::UnboundedReceiver<Envelope>,
        notices: mpsc::UnboundedReceiver<Notice>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn harness_with(media: MockMedia) -> Harness {
        let factory = MockFactory::default();
        let (out_tx, outbound) = mpsc::unbounded_channel();
        let (emitter, notices) = Emitter::channel();
        let (router, peer_events) = SignalingRouter::new(
            PeerId::from("P1"),
            Arc::new(factory.clone()),
            Arc::new(media),
            out_tx,
            emitter,
        );
        Harness {
            router: router.with_grace_period(Duration::from_millis(20)),
            factory,
            outbound,
            notices,
            peer_events,
        }
    }

    fn harness() -> Harness {
        harness_with(MockMedia {
            available: vec!["camA".into(), "camB".into(), "camC".into()],
            capture_fails: false,
        })
    }

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn envelope(from: &str, kind: MessageKind, payload: &str) -> Envelope {
        Envelope::from_peer(&PeerId::from(from), kind, payload)
    }

    const CONFIG: &str =
        r#"{"type":"CONFIG","payload":{"iceServers":[{"urls":"stun:stun.example.org:3478"}]}}"#;
    const OFFER: &str = r#"{"type":"offer","sdp":"v=0 remote-offer"}"#;
    const ANSWER: &str = r#"{"type":"answer","sdp":"v=0 remote-answer"}"#;
    const CANDIDATE: &str = r#"{"candidate":"candidate:1 1 udp 1 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;

    #[tokio::test]
    async fn request_is_answered_with_response_then_offer() {
        let mut h = harness();
        h.router.handle_text(CONFIG).await;
        assert!(h.router.config().is_set());

        h.router
            .handle_text(r#"{"type":"REQUEST","from":"P2","payload":"camA,camB"}"#)
            .await;

        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, MessageKind::Response);
        assert_eq!(sent[0].to, Some(PeerId::from("P2")));
        assert_eq!(sent[0].payload, "camA,camB");
        assert_eq!(sent[1].kind, MessageKind::Offer);
        assert_eq!(sent[1].to, Some(PeerId::from("P2")));

        let handle = h.router.sessions().get(&PeerId::from("P2")).unwrap();
        let session = handle.lock().await;
        assert_eq!(session.phase(), NegotiationPhase::HaveLocalOffer);
        assert_eq!(session.role(), SessionRole::Offerer);
        assert_eq!(session.granted_sources(), ["camA", "camB"]);
        let attached = h
            .factory
            .recorder("P2")
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::AttachTrack(_)))
            .count();
        assert_eq!(attached, 2);
    }

    #[tokio::test]
    async fn unavailable_sources_are_filtered_from_response() {
        let mut h = harness();
        h.router.handle_text(CONFIG).await;
        h.router
            .dispatch(envelope("P2", MessageKind::Request, "camA, camZ"))
            .await
            .unwrap();
        let sent = drain(&mut h.outbound);
        assert_eq!(sent[0].payload, "camA");
    }

    #[tokio::test]
    async fn candidate_for_unknown_peer_creates_nothing() {
        let h = harness();
        h.router.handle_text(CONFIG).await;
        let err = h
            .router
            .dispatch(envelope("P9", MessageKind::Candidate, CANDIDATE))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::SessionNotFound { ref peer } if peer.as_str() == "P9"));
        assert!(h.router.sessions().is_empty());
        assert_eq!(h.factory.created(), 0);
    }

    #[tokio::test]
    async fn request_before_config_fails_fast() {
        let mut h = harness();
        let err = h
            .router
            .dispatch(envelope("P2", MessageKind::Request, "camA"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::ConfigurationUnset));
        assert!(h.router.sessions().is_empty());
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn response_before_config_fails_fast() {
        let mut h = harness();
        let err = h
            .router
            .dispatch(envelope("P2", MessageKind::Response, "camA"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::ConfigurationUnset));
        assert!(h.router.sessions().is_empty());
        assert_eq!(h.factory.created(), 0);
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn failed_session_setup_notifies_requester() {
        let mut h = harness();
        h.factory.fail_for(
            "P2",
            Failures {
                attach: true,
                ..Default::default()
            },
        );
        h.router.handle_text(CONFIG).await;
        h.router
            .handle_envelope(envelope("P2", MessageKind::Request, "camA"))
            .await;

        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::Error);
        assert_eq!(sent[0].to, Some(PeerId::from("P2")));
        assert!(h.router.sessions().is_empty());
        assert!(matches!(drain(&mut h.notices).as_slice(), [Notice::Alert(_)]));
    }

    #[tokio::test]
    async fn message_is_sent_over_the_peer_data_channel() {
        let h = harness();
        h.router.handle_text(CONFIG).await;
        h.router
            .dispatch(envelope("P2", MessageKind::Response, "camA"))
            .await
            .unwrap();
        h.router
            .send_message(&PeerId::from("P2"), "Hello from P1")
            .await
            .unwrap();
        assert_eq!(
            h.factory.recorder("P2").count(&Call::SendText("Hello from P1".into())),
            1
        );

        let err = h
            .router
            .send_message(&PeerId::from("P9"), "nobody home")
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn first_config_wins() {
        let h = harness();
        h.router.handle_text(CONFIG).await;
        h.router
            .handle_text(r#"{"type":"CONFIG","payload":"{\"iceServers\":[]}"}"#)
            .await;
        let config = h.router.config().get().unwrap();
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_request_keeps_existing_session() {
        let mut h = harness();
        h.router.handle_text(CONFIG).await;
        h.router
            .dispatch(envelope("P2", MessageKind::Request, "camA"))
            .await
            .unwrap();
        drain(&mut h.outbound);

        let err = h
            .router
            .dispatch(envelope("P2", MessageKind::Request, "camB"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::DuplicateSession { .. }));
        assert!(drain(&mut h.outbound).is_empty());
        let handle = h.router.sessions().get(&PeerId::from("P2")).unwrap();
        assert_eq!(handle.lock().await.phase(), NegotiationPhase::HaveLocalOffer);
        assert_eq!(h.factory.created(), 1);
    }

    #[tokio::test]
    async fn media_failure_notifies_requester_and_operator() {
        let mut h = harness_with(MockMedia {
            available: vec!["camA".into()],
            capture_fails: true,
        });
        h.router.handle_text(CONFIG).await;
        h.router
            .handle_envelope(envelope("P2", MessageKind::Request, "camA"))
            .await;

        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::Error);
        assert_eq!(sent[0].to, Some(PeerId::from("P2")));
        assert!(h.router.sessions().is_empty());
        assert!(drain(&mut h.notices)
            .iter()
            .any(|n| matches!(n, Notice::Alert(text) if text.contains("camera busy"))));
    }

    #[tokio::test]
    async fn failed_offer_discards_session() {
        let mut h = harness();
        h.factory.fail_for(
            "P2",
            Failures {
                create_offer: true,
                ..Default::default()
            },
        );
        h.router.handle_text(CONFIG).await;
        let err = h
            .router
            .dispatch(envelope("P2", MessageKind::Request, "camA"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::Transport { .. }));
        assert!(h.router.sessions().is_empty());
        assert_eq!(h.factory.recorder("P2").count(&Call::Close), 1);
        let kinds: Vec<_> = drain(&mut h.outbound).into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![MessageKind::Response]);
    }

    #[tokio::test]
    async fn answerer_flow_sends_answer_and_reports_connected() {
        let mut h = harness();
        h.router.handle_text(CONFIG).await;
        h.router.request(&PeerId::from("P3"), &["camA".to_string()]);
        let request = h.outbound.try_recv().unwrap();
        assert_eq!(request.kind, MessageKind::Request);
        assert_eq!(request.payload, "camA");

        h.router
            .dispatch(envelope("P3", MessageKind::Response, "camA"))
            .await
            .unwrap();
        h.router
            .dispatch(envelope("P3", MessageKind::Candidate, CANDIDATE))
            .await
            .unwrap();
        h.router
            .dispatch(envelope("P3", MessageKind::Offer, OFFER))
            .await
            .unwrap();

        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::Answer);
        assert_eq!(h.factory.role("P3"), Some(SessionRole::Answerer));
        let calls = h.factory.recorder("P3").calls();
        assert_eq!(calls[0], Call::SetRemote(SdpKind::Offer));
        assert!(matches!(calls[1], Call::AddCandidate(_)));

        h.factory
            .events("P3")
            .emit(TransportEvent::ConnectionState(ConnectionState::Connected));
        let event = h.peer_events.recv().await.unwrap();
        h.router.handle_peer_event(event).await;

        let handle = h.router.sessions().get(&PeerId::from("P3")).unwrap();
        assert_eq!(handle.lock().await.phase(), NegotiationPhase::Connected);
        assert_eq!(
            drain(&mut h.notices),
            vec![Notice::Connected(PeerId::from("P3"))]
        );
    }

    #[tokio::test]
    async fn offerer_applies_answer() {
        let h = harness();
        h.router.handle_text(CONFIG).await;
        h.router
            .dispatch(envelope("P2", MessageKind::Request, "camA"))
            .await
            .unwrap();
        h.router
            .dispatch(envelope("P2", MessageKind::Answer, ANSWER))
            .await
            .unwrap();
        let handle = h.router.sessions().get(&PeerId::from("P2")).unwrap();
        assert_eq!(handle.lock().await.phase(), NegotiationPhase::HaveRemoteAnswer);
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_to_the_peer() {
        let mut h = harness();
        h.router.handle_text(CONFIG).await;
        h.router
            .dispatch(envelope("P3", MessageKind::Response, "camA"))
            .await
            .unwrap();
        let candidate = crate::protocol::decode_candidate(&MessageKind::Candidate, CANDIDATE).unwrap();
        h.factory
            .events("P3")
            .emit(TransportEvent::LocalCandidate(candidate));
        let event = h.peer_events.recv().await.unwrap();
        h.router.handle_peer_event(event).await;

        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::Candidate);
        assert_eq!(sent[0].to, Some(PeerId::from("P3")));
    }

    #[tokio::test]
    async fn relay_close_closes_every_session() {
        let mut h = harness();
        h.factory.fail_for(
            "A",
            Failures {
                close: true,
                ..Default::default()
            },
        );
        h.router.handle_text(CONFIG).await;
        h.router
            .dispatch(envelope("A", MessageKind::Request, "camA"))
            .await
            .unwrap();
        h.router
            .dispatch(envelope("B", MessageKind::Response, "camB"))
            .await
            .unwrap();
        let a = h.router.sessions().get(&PeerId::from("A")).unwrap();
        let b = h.router.sessions().get(&PeerId::from("B")).unwrap();

        assert!(!h.router.handle_relay_event(RelayEvent::Closed).await);
        assert!(h.router.sessions().is_empty());
        assert!(a.lock().await.is_closed());
        assert!(b.lock().await.is_closed());
        assert_eq!(h.factory.recorder("B").count(&Call::Close), 1);
        assert_eq!(drain(&mut h.notices).last(), Some(&Notice::RelayClosed));
    }

    #[tokio::test]
    async fn garbage_does_not_stop_the_router() {
        let mut h = harness();
        h.router.handle_text("not json").await;
        h.router.handle_text(r#"{"type":"PING","payload":""}"#).await;
        h.router.handle_text(r#"{"type":"REGISTER","from":7,"payload":"7"}"#).await;
        h.router.handle_text(r#"[1,2,3]"#).await;
        assert!(drain(&mut h.outbound).is_empty());

        h.router.handle_text(CONFIG).await;
        assert!(h.router.config().is_set());
    }

    #[tokio::test]
    async fn offer_without_sender_is_a_decode_error() {
        let h = harness();
        let err = h
            .router
            .dispatch(Envelope::new(MessageKind::Offer, OFFER))
            .await
            .unwrap_err();
        match err {
            SignalError::Decode(e) => assert_eq!(e.field, "from"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn relay_error_raises_alert() {
        let mut h = harness();
        assert!(h.router.handle_relay_event(RelayEvent::Error("reset".into())).await);
        assert!(matches!(drain(&mut h.notices).as_slice(), [Notice::Alert(_)]));
    }

    #[tokio::test]
    async fn relay_open_registers_local_id() {
        let mut h = harness();
        assert!(h.router.handle_relay_event(RelayEvent::Open).await);
        let sent = h.outbound.try_recv().unwrap();
        assert_eq!(sent.kind, MessageKind::Register);
        assert_eq!(sent.payload, "P1");
    }

    #[tokio::test]
    async fn error_envelope_is_surfaced() {
        let mut h = harness();
        h.router
            .dispatch(envelope("P2", MessageKind::Error, "peer busy"))
            .await
            .unwrap();
        assert_eq!(
            drain(&mut h.notices),
            vec![Notice::PeerError {
                peer: Some(PeerId::from("P2")),
                text: "peer busy".into()
            }]
        );
    }

    #[tokio::test]
    async fn grace_expiry_discards_session() {
        let mut h = harness();
        h.router.handle_text(CONFIG).await;
        h.router
            .dispatch(envelope("P2", MessageKind::Request, "camA"))
            .await
            .unwrap();

        h.factory
            .events("P2")
            .emit(TransportEvent::ConnectionState(ConnectionState::Disconnected));
        let event = h.peer_events.recv().await.unwrap();
        h.router.handle_peer_event(event).await;

        let expired = tokio::time::timeout(Duration::from_secs(2), h.peer_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            expired,
            PeerEvent::GraceExpired {
                peer: PeerId::from("P2"),
                generation: 1,
            }
        );
        h.router.handle_peer_event(expired).await;

        assert!(h.router.sessions().is_empty());
        let peer = PeerId::from("P2");
        assert_eq!(
            drain(&mut h.notices),
            vec![
                Notice::ConnectionProblem(peer.clone()),
                Notice::ConnectionRecovering(peer.clone()),
                Notice::ConnectionFailed(peer),
            ]
        );
    }

    #[tokio::test]
    async fn run_exits_when_relay_closes() {
        let h = harness();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        relay_tx.send(RelayEvent::Open).unwrap();
        relay_tx.send(RelayEvent::Message(CONFIG.to_string())).unwrap();
        relay_tx.send(RelayEvent::Closed).unwrap();
        let Harness {
            router,
            mut outbound,
            peer_events,
            ..
        } = h;
        tokio::time::timeout(Duration::from_secs(2), router.run(relay_rx, peer_events))
            .await
            .unwrap();
        assert!(router.config().is_set());
        assert_eq!(outbound.try_recv().unwrap().kind, MessageKind::Register);
    }
}
