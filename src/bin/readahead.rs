//! tscache readahead
//!
//! Extends every query in the readahead set up to now, so the next live
//! request finds it hot. Safe to run on every cache host: only the holder of
//! the leader lease does any work.
//!
//! ```bash
//! # one cycle, e.g. from cron
//! ./readahead --config /etc/tscache.toml --once
//!
//! # loop every shadow.interval_secs until Ctrl+C
//! ./readahead --config /etc/tscache.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::{signal, sync::broadcast};
use tracing::{error, info};

use tscache::{
    backend::KairosClient,
    config::Config,
    engine::CacheEngineBuilder,
    readahead::{service, ReadaheadService},
    store::RedisStore,
};

#[derive(Debug, Parser)]
#[command(name = "readahead", version, about = "Keep popular tscache queries warm")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "TSCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tscache=info".parse()?)
                .add_directive("readahead=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_path(path)?,
        None => Config::load(),
    };

    let engine = CacheEngineBuilder::new()
        .with_store(RedisStore::new(&config.redis)?)
        .with_backend(KairosClient::new(&config.kairosdb)?)
        .with_config(config)
        .build()
        .await?;
    let service = Arc::new(ReadaheadService::new(engine));

    if args.once {
        let report = service.run_once().await;
        info!(
            leader = report.leader,
            candidates = report.candidates,
            refreshed = report.refreshed,
            failed = report.failed,
            "Readahead finished"
        );
        if let Some(reason) = report.aborted {
            error!(reason = %reason, "Readahead aborted");
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let handle = service::spawn(service, shutdown_rx);

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
    handle.await?;
    Ok(())
}
