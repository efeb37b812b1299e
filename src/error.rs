use crate::peer::types::NegotiationPhase;
use crate::protocol::{DecodeError, PeerId};
use thiserror::Error;

/// Ошибки сигнализации и согласования
#[derive(Debug, Error)]
pub enum SignalError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{op} is not valid for peer {peer} in phase {phase}")]
    Ordering {
        peer: PeerId,
        op: &'static str,
        phase: NegotiationPhase,
    },

    #[error("no session for peer {peer}")]
    SessionNotFound { peer: PeerId },

    #[error("session for peer {peer} already exists")]
    DuplicateSession { peer: PeerId },

    #[error("transport failure for peer {peer}: {reason}")]
    Transport { peer: PeerId, reason: String },

    #[error("relay connection: {0}")]
    RelayConnection(String),

    #[error("transport configuration has not been received from the relay")]
    ConfigurationUnset,

    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),
}

impl SignalError {
    pub fn transport(peer: &PeerId, reason: impl ToString) -> Self {
        SignalError::Transport {
            peer: peer.clone(),
            reason: reason.to_string(),
        }
    }

    /// Ошибки, о которых пользователь должен узнать сразу
    pub fn is_disruptive(&self) -> bool {
        matches!(
            self,
            SignalError::RelayConnection(_)
                | SignalError::MediaUnavailable(_)
                | SignalError::Transport { .. }
        )
    }
}

pub type Result<T, E = SignalError> = std::result::Result<T, E>;
