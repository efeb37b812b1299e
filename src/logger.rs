use crate::config::DEFAULT_LOG_FILTER;
use crate::peer::types::{Candidate, RemoteTrack};
use crate::protocol::PeerId;
use tokio::sync::mpsc;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Локальное время с миллисекундами
struct LocalClock;

impl FormatTime for LocalClock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format(TIMESTAMP_FORMAT))
    }
}

/// Логирование с временными метками; повторный вызов ничего не делает
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalClock)
        .with_target(false)
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, peer: &PeerId, cand: &Candidate) {
    tracing::debug!(
        peer = %peer,
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index,
        cand.username_fragment
    );
}

/// Уведомления для пользователя/оператора
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Connected(PeerId),
    Disconnected(PeerId),
    ConnectionProblem(PeerId),
    ConnectionRecovering(PeerId),
    ConnectionRecovered(PeerId),
    ConnectionFailed(PeerId),
    RemoteTrack { peer: PeerId, track: RemoteTrack },
    Message { peer: PeerId, text: String },
    /// ERROR от релея или удалённого пира
    PeerError { peer: Option<PeerId>, text: String },
    /// Блокирующее уведомление: релей недоступен, нет медиа и т.п.
    Alert(String),
    RelayClosed,
}

#[derive(Debug, Clone)]
pub struct Emitter {
    tx: Option<mpsc::UnboundedSender<Notice>>,
}

impl Emitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Emitter { tx: Some(tx) }, rx)
    }

    /// Только лог, без получателя
    pub fn disabled() -> Self {
        Emitter { tx: None }
    }

    fn emit_state(&self, notice: Notice) {
        tracing::debug!(?notice, "emit");
        if let Some(tx) = &self.tx {
            if tx.send(notice).is_err() {
                tracing::debug!("notice receiver is gone");
            }
        }
    }

    pub fn emit_connected(&self, peer: &PeerId) {
        self.emit_state(Notice::Connected(peer.clone()));
    }

    pub fn emit_disconnected(&self, peer: &PeerId) {
        self.emit_state(Notice::Disconnected(peer.clone()));
    }

    pub fn emit_connection_problem(&self, peer: &PeerId) {
        self.emit_state(Notice::ConnectionProblem(peer.clone()));
    }

    pub fn emit_connection_recovering(&self, peer: &PeerId) {
        self.emit_state(Notice::ConnectionRecovering(peer.clone()));
    }

    pub fn emit_connection_recovered(&self, peer: &PeerId) {
        self.emit_state(Notice::ConnectionRecovered(peer.clone()));
    }

    pub fn emit_connection_failed(&self, peer: &PeerId) {
        self.emit_state(Notice::ConnectionFailed(peer.clone()));
    }

    pub fn emit_remote_track(&self, peer: &PeerId, track: RemoteTrack) {
        self.emit_state(Notice::RemoteTrack {
            peer: peer.clone(),
            track,
        });
    }

    pub fn emit_message(&self, peer: &PeerId, text: &str) {
        self.emit_state(Notice::Message {
            peer: peer.clone(),
            text: text.to_string(),
        });
    }

    pub fn emit_peer_error(&self, peer: Option<&PeerId>, text: &str) {
        self.emit_state(Notice::PeerError {
            peer: peer.cloned(),
            text: text.to_string(),
        });
    }

    pub fn emit_alert(&self, text: impl Into<String>) {
        self.emit_state(Notice::Alert(text.into()));
    }

    pub fn emit_relay_closed(&self) {
        self.emit_state(Notice::RelayClosed);
    }
}

/// Вывод уведомления, когда снаружи нет UI
pub fn log_notice(notice: &Notice) {
    match notice {
        Notice::Alert(text) => tracing::error!("ALERT: {text}"),
        Notice::PeerError { peer, text } => {
            tracing::warn!(peer = ?peer.as_ref().map(PeerId::as_str), "peer error: {text}")
        }
        Notice::ConnectionFailed(peer) => tracing::warn!(peer = %peer, "connection failed"),
        Notice::Message { peer, text } => tracing::info!(peer = %peer, "message: {text}"),
        other => tracing::info!(notice = ?other, "notice"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitter_delivers_notices_in_order() {
        let (emitter, mut rx) = Emitter::channel();
        let peer = PeerId::from("P1");
        emitter.emit_connected(&peer);
        emitter.emit_alert("relay unreachable");
        assert_eq!(rx.try_recv().unwrap(), Notice::Connected(peer));
        assert_eq!(rx.try_recv().unwrap(), Notice::Alert("relay unreachable".into()));
    }

    #[test]
    fn disabled_emitter_does_not_fail() {
        Emitter::disabled().emit_relay_closed();
    }
}
