//! Записывающий транспорт для тестов.

use crate::error::{Result, SignalError};
use crate::media::MediaResolver;
use crate::peer::transport::{Transport, TransportEvents, TransportFactory, TransportFailure};
use crate::peer::types::{
    Candidate, MediaStream, MediaTrack, SdpKind, SessionDescription, SessionRole, TrackKind,
    TransportConfig,
};
use crate::protocol::PeerId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    AttachTrack(String),
    SendText(String),
    Close,
}

#[derive(Debug, Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Recorder {
    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Failures {
    pub create_offer: bool,
    pub set_remote: bool,
    pub attach: bool,
    pub send_text: bool,
    pub close: bool,
}

pub struct MockTransport {
    rec: Recorder,
    failures: Failures,
}

impl MockTransport {
    pub fn new(rec: Recorder, failures: Failures) -> Self {
        MockTransport { rec, failures }
    }

    fn fail_if(&self, fail: bool, what: &str) -> Result<(), TransportFailure> {
        if fail {
            Err(TransportFailure::new(format!("{what} rejected")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportFailure> {
        self.rec.push(Call::CreateOffer);
        self.fail_if(self.failures.create_offer, "create_offer")?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0 local-offer".into(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportFailure> {
        self.rec.push(Call::CreateAnswer);
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 local-answer".into(),
        })
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportFailure> {
        self.rec.push(Call::SetLocal(desc.kind));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportFailure> {
        self.rec.push(Call::SetRemote(desc.kind));
        self.fail_if(self.failures.set_remote, "set_remote_description")
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), TransportFailure> {
        self.rec.push(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn attach_track(
        &self,
        track: &MediaTrack,
        _stream_id: &str,
    ) -> Result<(), TransportFailure> {
        self.rec.push(Call::AttachTrack(track.id.clone()));
        self.fail_if(self.failures.attach, "attach_track")
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportFailure> {
        self.rec.push(Call::SendText(text.to_string()));
        self.fail_if(self.failures.send_text, "send_text")
    }

    async fn close(&self) -> Result<(), TransportFailure> {
        self.rec.push(Call::Close);
        self.fail_if(self.failures.close, "close")
    }
}

/// Фабрика, запоминающая транспорт и канал событий каждого пира
#[derive(Clone, Default)]
pub struct MockFactory {
    recorders: Arc<Mutex<HashMap<PeerId, Recorder>>>,
    events: Arc<Mutex<HashMap<PeerId, TransportEvents>>>,
    failures: Arc<Mutex<HashMap<PeerId, Failures>>>,
    roles: Arc<Mutex<HashMap<PeerId, SessionRole>>>,
}

impl MockFactory {
    pub fn fail_for(&self, peer: &str, failures: Failures) {
        self.failures
            .lock()
            .unwrap()
            .insert(PeerId::from(peer), failures);
    }

    pub fn recorder(&self, peer: &str) -> Recorder {
        self.recorders
            .lock()
            .unwrap()
            .get(&PeerId::from(peer))
            .cloned()
            .expect("no transport created for peer")
    }

    pub fn created(&self) -> usize {
        self.recorders.lock().unwrap().len()
    }

    pub fn events(&self, peer: &str) -> TransportEvents {
        self.events
            .lock()
            .unwrap()
            .get(&PeerId::from(peer))
            .cloned()
            .expect("no transport created for peer")
    }

    pub fn role(&self, peer: &str) -> Option<SessionRole> {
        self.roles.lock().unwrap().get(&PeerId::from(peer)).copied()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        _config: &TransportConfig,
        role: SessionRole,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportFailure> {
        let peer = events.peer().clone();
        let rec = Recorder::default();
        let failures = self
            .failures
            .lock()
            .unwrap()
            .get(&peer)
            .copied()
            .unwrap_or_default();
        self.recorders.lock().unwrap().insert(peer.clone(), rec.clone());
        self.roles.lock().unwrap().insert(peer.clone(), role);
        self.events.lock().unwrap().insert(peer, events);
        Ok(Box::new(MockTransport::new(rec, failures)))
    }
}

/// Отдаёт только источники из списка доступных
pub struct MockMedia {
    pub available: Vec<String>,
    pub capture_fails: bool,
}

#[async_trait]
impl MediaResolver for MockMedia {
    async fn resolve_available_sources(&self, requested: &[String]) -> Vec<String> {
        requested
            .iter()
            .filter(|s| self.available.contains(s))
            .cloned()
            .collect()
    }

    async fn acquire_local_media(&self, sources: &[String]) -> Result<MediaStream> {
        if self.capture_fails {
            return Err(SignalError::MediaUnavailable("camera busy".into()));
        }
        Ok(MediaStream {
            id: "local".into(),
            tracks: sources
                .iter()
                .map(|s| MediaTrack {
                    id: format!("track-{s}"),
                    kind: TrackKind::Video,
                    source: s.clone(),
                })
                .collect(),
        })
    }
}
