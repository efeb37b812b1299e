//! WebSocket до релея: одна на процесс.

use crate::error::{Result, SignalError};
use crate::protocol::Envelope;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Всегда приходит первым
    Open,
    Message(String),
    Closed,
    Error(String),
}

/// http -> ws, https -> wss; прочие схемы отвергаются
pub fn websocket_url(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint).map_err(|e| {
        SignalError::RelayConnection(format!("invalid relay url {endpoint}: {e}"))
    })?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(SignalError::RelayConnection(format!(
                "unsupported relay url scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalError::RelayConnection("invalid websocket scheme".into()))?;
    Ok(url)
}

pub struct RelayConnection {
    url: Url,
    outbound: mpsc::UnboundedSender<Envelope>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayConnection {
    pub async fn connect(endpoint: &str) -> Result<(Self, mpsc::UnboundedReceiver<RelayEvent>)> {
        let url = websocket_url(endpoint)?;
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|e| {
            SignalError::RelayConnection(format!("websocket connect to {url} failed: {e}"))
        })?;
        tracing::info!(url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(RelayEvent::Open);

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let text = envelope.encode();
                tracing::trace!(event = "ws_out", kind = %envelope.kind, len = text.len());
                if let Err(e) = ws_write.send(Message::Text(text)).await {
                    tracing::warn!("relay websocket write failed: {e}");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!("non UTF-8 binary frame from relay dropped");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(?frame, "relay sent close frame");
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!("relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!("relay websocket error: {err}");
                                let _ = event_tx.send(RelayEvent::Error(err.to_string()));
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(event = "ws_in", len = text.len());
                if event_tx.send(RelayEvent::Message(text)).is_err() {
                    return;
                }
            }
            let _ = event_tx.send(RelayEvent::Closed);
        });

        let connection = RelayConnection {
            url,
            outbound,
            tasks: vec![writer, reader],
        };
        Ok((connection, event_rx))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Отправитель для роутера; порядок отправки сохраняется
    pub fn outbound(&self) -> mpsc::UnboundedSender<Envelope> {
        self.outbound.clone()
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}
