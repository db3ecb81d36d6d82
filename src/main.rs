//! Ingestion engine entrypoint: load the segment catalog config, spawn one
//! worker per (location, category) pair under the supervisor, run until
//! ctrl-c.

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use realty_ingest::{EngineConfig, HttpFetcherFactory, LogSink, Supervisor};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("realty_ingest=info,worker=info,supervisor=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op elsewhere. Provides REALTY_AUTH_TOKEN
    // and REALTY_CONFIG_PATH.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = EngineConfig::load_default()?;
    if cfg.auth_token.is_empty() {
        tracing::warn!("REALTY_AUTH_TOKEN is not set; requests will go out unauthenticated");
    }

    let fetchers = Arc::new(HttpFetcherFactory::new(&cfg));
    let sink = Arc::new(LogSink);
    let supervisor = Supervisor::new(&cfg, fetchers, sink)?;
    tracing::info!(segments = supervisor.segment_count(), "engine starting");

    let shutdown = supervisor.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
            shutdown.trigger();
        }
    });

    supervisor.run().await
}
