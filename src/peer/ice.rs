use crate::peer::transport::Transport;
use crate::peer::types::Candidate;
use crate::protocol::PeerId;
use std::collections::VecDeque;

/// Кандидаты, полученные до установки remote description
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<Candidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: Candidate) {
        self.queue.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    fn drain(&mut self) -> Vec<Candidate> {
        self.queue.drain(..).collect()
    }
}

/// Применяет все отложенные кандидаты после установки remote description.
/// Возвращает число принятых транспортом кандидатов.
pub async fn apply_pending_candidates(
    peer: &PeerId,
    transport: &dyn Transport,
    pending: &mut PendingCandidates,
) -> usize {
    let mut applied = 0;
    for candidate in pending.drain() {
        tracing::debug!(peer = %peer, candidate = %candidate.candidate, "applying pending candidate");
        match transport.add_ice_candidate(candidate).await {
            Ok(()) => applied += 1,
            Err(e) => tracing::warn!(peer = %peer, error = %e, "failed to apply pending candidate"),
        }
    }
    applied
}

/// Счётчик типов локальных кандидатов
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateTally {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateTally {
    pub fn record(&mut self, candidate: &Candidate) {
        let line = candidate.candidate.as_str();
        if line.contains("typ host") {
            self.host += 1;
        } else if line.contains("typ srflx") {
            self.srflx += 1;
        } else if line.contains("typ relay") {
            self.relay += 1;
        } else {
            self.other += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }
}

pub fn analyze_candidates(peer: &PeerId, tally: &CandidateTally) {
    tracing::info!(
        peer = %peer,
        host = tally.host,
        srflx = tally.srflx,
        relay = tally.relay,
        "candidate analysis"
    );

    if tally.relay == 0 {
        tracing::warn!(peer = %peer, "no TURN relay candidates found, connection through NAT may fail");
    }
}
