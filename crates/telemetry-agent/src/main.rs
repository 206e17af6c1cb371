mod ingest;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use telemetry_store::{KvStore, RingLog, SharedRing};
use telemetry_uplink::{EngineSettings, EnvFileConfig, HttpTransport, UplinkEngine, identity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "telemetry_agent=debug,telemetry_uplink=debug,telemetry_store=info".into()
            }),
        )
        .init();

    // Config
    let ring_path: PathBuf = std::env::var("TELEMETRY_RING_PATH")
        .unwrap_or_else(|_| "queue.bin".into())
        .into();
    let ring_size: u64 = env_or("TELEMETRY_RING_SIZE", 256 * 1024)?;
    let db_path: PathBuf = std::env::var("TELEMETRY_STATE_DB")
        .unwrap_or_else(|_| "telemetry-state.db".into())
        .into();
    let config_file: PathBuf = std::env::var("TELEMETRY_CONFIG_FILE")
        .unwrap_or_else(|_| ".env".into())
        .into();
    let settings = EngineSettings {
        batch_size: env_or("TELEMETRY_BATCH_SIZE", 1)?,
        send_interval: Duration::from_secs(env_or("TELEMETRY_SEND_INTERVAL_SECS", 30)?),
        sync_interval: Duration::from_secs(env_or("TELEMETRY_SYNC_INTERVAL_SECS", 40)?),
    };
    let timeout = Duration::from_secs(env_or("TELEMETRY_HTTP_TIMEOUT_SECS", 15)?);

    // Persistent state: an unusable store is the one fatal startup error.
    let state = Arc::new(
        KvStore::open(&db_path)
            .with_context(|| format!("cannot open state store {}", db_path.display()))?,
    );
    let ring = RingLog::open(&ring_path, ring_size, state.clone())
        .with_context(|| format!("cannot open ring log {}", ring_path.display()))?;
    info!(
        "Ring log {} ready: capacity {}, {} record(s) queued",
        ring_path.display(),
        ring.capacity(),
        ring.count_approx()
    );
    let ring: SharedRing = Arc::new(Mutex::new(ring));

    let device_id = identity::device_id();
    info!("Device id {}", device_id);

    let transport = HttpTransport::new(timeout)?;
    let engine = UplinkEngine::new(
        transport,
        EnvFileConfig::new(config_file),
        ring.clone(),
        state,
        device_id,
        settings,
    )
    .context("cannot start uplink engine")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let uplink = tokio::spawn(engine.run(shutdown_rx.clone()));
    let producer = tokio::spawn(ingest::run_ingest(
        ingest::spawn_stdin_reader(),
        ring,
        shutdown_rx,
    ));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let (uplink, producer) = tokio::join!(uplink, producer);
    if let Err(e) = uplink {
        error!("Uplink task ended abnormally: {}", e);
    }
    match producer {
        Ok(count) => info!("Producer stopped after {} record(s)", count),
        Err(e) => error!("Producer task ended abnormally: {}", e),
    }

    info!("Telemetry agent stopped");
    Ok(())
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        _ => Ok(default),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
