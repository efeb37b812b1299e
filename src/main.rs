#[tokio::main]
async fn main() {
    if let Err(e) = relayrtc_lib::run().await {
        tracing::error!("relayrtc stopped: {e}");
        std::process::exit(1);
    }
}
