//! Standalone relay.
//!
//! Usage: `prsc-relay [BIND_ADDR]`; the address defaults to `PRSC_BIND` or
//! `127.0.0.1:9090`. Set `PRSC_OPEN=1` to admit sessions without a
//! `publickey`.

use prsc_presence::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args().nth(1).or_else(|| std::env::var("PRSC_BIND").ok()) {
        config.bind_addr = addr;
    }
    if std::env::var("PRSC_OPEN").is_ok_and(|v| v == "1") {
        config.require_public_key = false;
    }

    log::info!("Starting relay on {}...", config.bind_addr);
    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
