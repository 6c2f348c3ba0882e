//! All three services in one process, on the in-memory backends by default.

use booking::Config;
use booking::bootstrap::{self, Application, Roles};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bootstrap::init_tracing();
    info!("Starting fieldbook standalone");

    let config = Config::from_env()?;
    info!(
        storage = %config.backend.storage,
        bus = %config.backend.bus,
        address = %config.server.bind_address(),
        "Configuration loaded"
    );

    Application::build(config, Roles::ALL).await?.run().await
}
