mod server;

use anyhow::Result;
use tracing::info;

use streamvault_core::{logging, Config};

use server::Core;

fn load_config() -> Result<Config> {
    let config_file = std::env::args().nth(1);
    let config = Config::load(config_file.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;

    // Fail fast on misconfigurations.
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    logging::init_logging(&config.logging)?;

    info!("StreamVault server starting...");
    info!("API address: {}", config.server.api_address);
    info!("record path: {}", config.server.record_path);

    let core = Core::new(config).await?;
    core.run().await
}
