//! Voice agent core — media bridge, campaign dispatcher, carrier webhook.

use voicebridge::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install Rustls crypto provider for HTTPS support
    // This is required for Rustls 0.23+
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install Rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let host = std::env::var("VOICE_AGENT_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("VOICE_AGENT_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8088);

    server::start(&host, port).await
}
