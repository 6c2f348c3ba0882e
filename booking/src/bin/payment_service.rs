//! Payment service: gateway charges, webhooks and settlement expiry.

use booking::Config;
use booking::bootstrap::{self, Application, Roles};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bootstrap::init_tracing();
    info!("Starting payment service");

    let config = Config::from_env()?;
    info!(
        storage = %config.backend.storage,
        bus = %config.backend.bus,
        address = %config.server.bind_address(),
        "Configuration loaded"
    );

    Application::build(config, Roles::PAYMENT).await?.run().await
}
