//! Standalone presence relay.
//!
//! Usage: `collab-relay [BIND_ADDR]`. Without an argument the address is
//! taken from `COLLAB_RELAY_ADDR`, then defaults to `127.0.0.1:9090`.
//! Verbosity follows `RUST_LOG`.

use collab_presence::{RelayConfig, RelayServer};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("COLLAB_RELAY_ADDR").ok())
    {
        config.bind_addr = addr;
    }

    info!("Starting presence relay on {}...", config.bind_addr);
    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!("relay stopped: {e}");
        std::process::exit(1);
    }
}
