use chronos_relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| RelayConfig::default().bind_addr);
    let server = RelayServer::new(RelayConfig {
        bind_addr,
        ..RelayConfig::default()
    });

    if let Err(e) = server.run().await {
        log::error!("relay failed: {e}");
        std::process::exit(1);
    }
}
