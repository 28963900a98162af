// Forum Core - runs the store until interrupted

use tracing::info;
use tracing_subscriber::EnvFilter;

use forum_core::{app_state::AppState, config::Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("forum_core=info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize application state
    let app_state = AppState::new(config.clone()).await?;
    app_state.database.health_check().await?;

    let (idle, total) = app_state.database.pool_stats();
    info!(url = %config.database.url, idle, total, "forum core ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    app_state.shutdown().await;

    Ok(())
}
