mod config;
mod detector;
mod error;
mod fetcher;
mod monitor;
mod notify;
mod ranker;
mod scorer;
mod store;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::monitor::Monitor;
use crate::notify::{ChatSink, NoopSink, TelegramSink};
use crate::store::{MarketStore, StatePersister};

#[derive(Parser)]
#[command(name = "sentinel", about = "Polymarket probability-move monitor")]
struct Cli {
    /// YAML config file; POLY_ORACLE_* environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let store = if cfg.store.persist_path.is_empty() {
        MarketStore::new(cfg.store.max_snapshots_per_market, cfg.store.max_markets)
    } else {
        MarketStore::with_persistence(
            cfg.store.max_snapshots_per_market,
            cfg.store.max_markets,
            StatePersister::new(&cfg.store.persist_path),
        )
    };
    store.load().await?;

    let sink: Arc<dyn ChatSink> = if cfg.telegram.bot_token.is_empty() {
        warn!("telegram.bot_token not set — notifications will be dropped");
        Arc::new(NoopSink)
    } else {
        Arc::new(TelegramSink::new(&cfg)?)
    };

    let fetcher = Fetcher::new(&cfg)?;

    info!(
        poll_interval_secs = cfg.monitor.poll_interval_secs,
        detection_window_secs = cfg.monitor.detection_window().as_secs(),
        sensitivity = cfg.monitor.sensitivity,
        min_score = cfg.monitor.min_score(),
        top_k = cfg.monitor.top_k,
        markets = store.market_count().await,
        "sentinel starting",
    );

    Monitor::new(cfg, store, fetcher, sink).run().await;
    Ok(())
}
