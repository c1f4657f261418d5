use anyhow::{Context, Result};
use futures::future;
use rover_ingest::config::Config;
use rover_ingest::replay::{ReplayDataset, ReplaySimulator};
use rover_ingest::sink::{build_pool, MemorySink, PgRecordSink};
use rover_ingest::station::{spawn_replay_feeder, Station};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,rover_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let mut station = match &config.database_url {
        Some(url) => {
            let pool = build_pool(url, config.db_pool_size)
                .await
                .context("failed to connect to record database")?;
            tracing::info!(pool_size = config.db_pool_size, "using postgres record sink");
            Station::new(&config, Arc::new(PgRecordSink::new(pool)))
        }
        None => {
            tracing::info!("no database configured; records stay in memory");
            Station::new(&config, Arc::new(MemorySink::new()))
        }
    };
    station
        .initialize()
        .await
        .context("failed to initialize station handlers")?;

    let cancel = CancellationToken::new();
    let feeder_handle = match (&config.replay_dir, config.mock) {
        (Some(dir), true) => {
            let dataset = ReplayDataset::load(dir)
                .with_context(|| format!("failed to load replay dataset {}", dir.display()))?;
            tracing::info!(
                rows = dataset.len(),
                mode = %config.replay_mode,
                "replaying recorded telemetry"
            );
            let simulator = ReplaySimulator::new(dataset, config.replay_mode, config.replay_seed);
            Some(spawn_replay_feeder(
                simulator,
                station.mock_router(),
                config.replay_interval(),
                cancel.clone(),
            ))
        }
        (Some(_), false) => {
            tracing::warn!("ROVER_REPLAY_DIR ignored outside mock mode");
            None
        }
        (None, _) => None,
    };

    let station_handle = tokio::spawn(station.run(cancel.clone()));

    tokio::select! {
        _ = async {
            if let Some(handle) = feeder_handle {
                if let Err(err) = handle.await {
                    tracing::warn!(error=%err, "replay feeder failed");
                }
            }
            // keep serving live data after the replay runs dry
            future::pending::<()>().await;
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    if let Err(err) = station_handle.await {
        tracing::error!(error=%err, "station task failed");
    }

    Ok(())
}
