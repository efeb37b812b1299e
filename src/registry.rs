//! Реестр сессий: не больше одной сессии на удалённого пира.

use crate::error::{Result, SignalError};
use crate::peer::session::NegotiationSession;
use crate::peer::transport::{PeerEvent, TransportEvents, TransportFactory};
use crate::peer::types::{MediaStream, SessionRole, TransportConfig};
use crate::protocol::{Envelope, PeerId};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

pub type SessionHandle = Arc<AsyncMutex<NegotiationSession>>;

pub struct SessionRegistry {
    sessions: Mutex<HashMap<PeerId, SessionHandle>>,
    factory: Arc<dyn TransportFactory>,
    outbound: mpsc::UnboundedSender<Envelope>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    grace_period: Option<Duration>,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        outbound: mpsc::UnboundedSender<Envelope>,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            factory,
            outbound,
            peer_events,
            grace_period: None,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = Some(grace_period);
        self
    }

    fn map(&self) -> MutexGuard<'_, HashMap<PeerId, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, peer: &PeerId) -> Option<SessionHandle> {
        self.map().get(peer).cloned()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.map().contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.map().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Создаёт сессию; существующая сессия не заменяется и не закрывается
    pub async fn create(
        &self,
        peer: &PeerId,
        config: &TransportConfig,
        role: SessionRole,
        stream: Option<MediaStream>,
    ) -> Result<SessionHandle> {
        if self.contains(peer) {
            return Err(SignalError::DuplicateSession { peer: peer.clone() });
        }

        let events = TransportEvents::new(peer.clone(), self.peer_events.clone());
        let transport = self
            .factory
            .create(config, role, events)
            .await
            .map_err(|e| SignalError::transport(peer, e))?;
        let mut session = NegotiationSession::new(
            peer.clone(),
            role,
            transport,
            self.outbound.clone(),
            self.peer_events.clone(),
        );
        if let Some(grace) = self.grace_period {
            session = session.with_grace_period(grace);
        }

        if let Some(stream) = stream {
            if let Err(e) = session.attach_media(stream).await {
                if let Err(close_err) = session.close().await {
                    tracing::warn!(peer = %peer, error = %close_err, "failed to close half-built session");
                }
                return Err(e);
            }
        }

        let handle = Arc::new(AsyncMutex::new(session));
        {
            let mut map = self.map();
            if let Entry::Vacant(slot) = map.entry(peer.clone()) {
                slot.insert(Arc::clone(&handle));
                tracing::info!(peer = %peer, ?role, "session created");
                return Ok(handle);
            }
        }

        // Пока создавался транспорт, сессию для этого пира уже добавили
        if let Err(e) = handle.lock().await.close().await {
            tracing::warn!(peer = %peer, error = %e, "failed to close duplicate session");
        }
        Err(SignalError::DuplicateSession { peer: peer.clone() })
    }

    pub fn remove(&self, peer: &PeerId) -> Option<SessionHandle> {
        self.map().remove(peer)
    }

    /// Удаляет и закрывает одну сессию
    pub async fn close(&self, peer: &PeerId) -> Result<bool> {
        let Some(handle) = self.remove(peer) else {
            return Ok(false);
        };
        handle.lock().await.close().await?;
        Ok(true)
    }

    /// Закрывает все сессии; ошибка одной не мешает закрыть остальные
    pub async fn close_all(&self) -> Vec<(PeerId, SignalError)> {
        let drained: Vec<(PeerId, SessionHandle)> = self.map().drain().collect();
        let mut failures = Vec::new();
        for (peer, handle) in drained {
            if let Err(e) = handle.lock().await.close().await {
                tracing::warn!(peer = %peer, error = %e, "failed to close session");
                failures.push((peer, e));
            }
        }
        failures
    }
}
