//! callbridge - carrier-to-model voice bridge
//!
//! Relays telephony media streams to a realtime speech-to-speech model.

use callbridge::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install Rustls crypto provider for HTTPS support
    // This is required for Rustls 0.23+
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install Rustls crypto provider");

    // Honor a local .env before reading configuration
    dotenvy::dotenv().ok();

    // Initialize logging (INFO level by default, use RUST_LOG to override)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Run CLI
    cli::run().await
}
