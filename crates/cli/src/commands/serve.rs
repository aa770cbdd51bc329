//! `turnstile serve`: start the HTTP chat service.

use std::path::Path;

use turnstile_config::{AppConfig, redact_url};

pub async fn run(
    config_path: Option<&Path>,
    port_override: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config =
        AppConfig::load(config_path).map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("Turnstile");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Provider:  {} ({})", config.provider.name, config.provider.base_url);
    println!("   Model:     {}", config.generation.default_model);
    if let Some(url) = &config.store_url {
        println!("   Store:     {}", redact_url(url));
    }

    turnstile_gateway::start(config).await?;

    Ok(())
}
