//! Service entry point
//!
//! Initializes logging, loads settings from the environment, wires the
//! shared services, and serves the gateway. Without model credentials the
//! process still comes up against the loopback live backend, which is
//! enough for local protocol work.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use griot_live::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Arc::new(Settings::from_env());

    let default_filter = if settings.debug {
        "griot_live=debug,info"
    } else {
        settings.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!(
        bind_addr = %settings.bind_addr,
        live_model = %settings.live_model,
        text_model = %settings.text_model,
        "starting gateway"
    );

    let text_model: Arc<dyn TextModel> =
        Arc::new(TextClientPool::warm(&settings).context("text client pool")?);
    tracing::info!(pool_size = settings.pool_size, "text client pool warmed");

    let state = AppState::new(
        settings,
        Arc::new(MemoryStore::new()),
        text_model,
        None, // image backend: wired in by deployments that carry one
        None,
        Arc::new(EchoConnector),
    );

    serve(state).await.context("gateway serve")?;
    Ok(())
}
