pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod signaling;
pub mod utils;

use config::Settings;
use error::Result;
use logger::{log_notice, Emitter};
use media::PassthroughResolver;
use peer::WebRtcFactory;
use relay::RelayConnection;
use signaling::SignalingRouter;
use std::sync::Arc;

/// Подключается к релею и обслуживает сессии, пока релей не закроет соединение
pub async fn run() -> Result<()> {
    logger::init();
    let settings = Settings::from_env();
    tracing::info!(id = %settings.peer_id, relay = %settings.relay_url, "starting");

    let (emitter, mut notices) = Emitter::channel();
    let printer = tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            log_notice(&notice);
        }
    });

    let (mut relay, relay_events) = match RelayConnection::connect(&settings.relay_url).await {
        Ok(connected) => connected,
        Err(e) => {
            emitter.emit_alert(e.to_string());
            drop(emitter);
            let _ = printer.await;
            return Err(e);
        }
    };

    let (router, peer_events) = SignalingRouter::new(
        settings.peer_id,
        Arc::new(WebRtcFactory),
        Arc::new(PassthroughResolver),
        relay.outbound(),
        emitter,
    );
    router.run(relay_events, peer_events).await;

    relay.shutdown();
    drop(router);
    let _ = printer.await;
    Ok(())
}
