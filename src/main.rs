use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use studiocast_server::config::{AppConfig, CliArgs};
use studiocast_server::geo::GeoResolver;
use studiocast_server::listeners::ListenerStore;
use studiocast_server::server::{run_server, ServerConfig, ServerState};
use studiocast_server::stream::StudioManager;

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let config = AppConfig::resolve(cli_args)?;

    let geo = Arc::new(GeoResolver::new(
        config.geoip_db_path.as_deref(),
        &config.ip_hash_salt,
        config.enable_geoip,
    ));
    if config.enable_geoip && !geo.is_enabled() {
        info!("geoip requested but unavailable; listeners get hash-only enrichment");
    }
    if config.studio_settings.source_password.is_none() {
        info!("SOURCE_PASSWORD not set; live ingest will reject all sources");
    }

    let store = Arc::new(ListenerStore::new());
    let manager = StudioManager::new(
        config.audio_dir.clone(),
        config.studio_settings.clone(),
        store,
        geo,
    );

    for studio_id in &config.studios {
        manager.register_studio(studio_id);
    }

    let cancel = CancellationToken::new();
    let monitor = manager.spawn_monitor(config.snapshot_interval, cancel.child_token());

    // Ctrl-C stops the accept loop; studios are shut down after it exits.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    let state = ServerState::new(
        ServerConfig {
            requests_logging_level: config.logging_level.clone(),
        },
        manager.clone(),
    );

    let result = run_server(&config.listen_addr, state, cancel.clone()).await;

    cancel.cancel();
    let _ = monitor.await;
    manager.shutdown().await;
    info!("bye");

    result
}
