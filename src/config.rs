// Конфигурация приложения
// Уровень логирования по умолчанию зависит от режима сборки, RUST_LOG его переопределяет

use crate::error::{Result, SignalError};
use crate::peer::types::TransportConfig;
use crate::protocol::PeerId;
use crate::utils::random_id;
use once_cell::sync::OnceCell;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "debug"; // В режиме отладки подробный лог

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Адрес релея, если не задан RELAYRTC_URL
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8080/websocket-webrtc";

pub const RELAY_URL_VAR: &str = "RELAYRTC_URL";
pub const PEER_ID_VAR: &str = "RELAYRTC_PEER_ID";

/// STUN серверы, если CONFIG пришёл без iceServers
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Период ожидания перед принудительным закрытием разорванной сессии
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Settings {
    pub relay_url: String,
    pub peer_id: PeerId,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Settings {
            relay_url: non_empty(RELAY_URL_VAR).unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            peer_id: PeerId::new(non_empty(PEER_ID_VAR).unwrap_or_else(random_id)),
        }
    }
}

/// Конфигурация транспорта на весь процесс: Unset -> Set ровно один раз
#[derive(Debug, Default)]
pub struct ConfigSlot {
    cell: OnceCell<TransportConfig>,
}

impl ConfigSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Первая конфигурация побеждает; `false`, если она уже была задана
    pub fn set(&self, config: TransportConfig) -> bool {
        self.cell.set(config).is_ok()
    }

    pub fn get(&self) -> Result<&TransportConfig> {
        self.cell.get().ok_or(SignalError::ConfigurationUnset)
    }

    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }
}
