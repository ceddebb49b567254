use clap::Parser;
use tracing_subscriber::EnvFilter;

use teleop_bridge::config::{BridgeArgs, BridgeConfig};

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=debug for per-tick detail)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(
            "info".parse().expect("static directive"),
        ))
        .init();

    let config = BridgeConfig::from(BridgeArgs::parse());

    if let Err(e) = teleop_bridge::runtime::run(config).await {
        eprintln!("Bridge error: {}", e);
        std::process::exit(1);
    }
}
