// =============================================================================
// candle-sync -- Main Entry Point
// =============================================================================
//
// With no arguments the engine runs the daily scheduler over the configured
// pairs. With `candle-sync <COIN> <interval>` it syncs a single pair in the
// foreground.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod clock;
mod config;
mod exchange;
mod fetcher;
mod healer;
mod interval;
mod orchestrator;
mod scheduler;
mod store;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::clock::SystemClock;
use crate::config::SyncConfig;
use crate::exchange::{HyperliquidClient, HyperliquidFeed};
use crate::orchestrator::SyncContext;
use crate::store::{FileStore, PairKey};

const CONFIG_PATH: &str = "sync_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("candle-sync starting up");

    let mut config = SyncConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        SyncConfig::default()
    });

    // Override pairs from env if available.
    if let Ok(spec) = std::env::var("SYNC_PAIRS") {
        match config::parse_pairs(&spec) {
            Ok(pairs) if !pairs.is_empty() => config.pairs = pairs,
            Ok(_) => {}
            Err(e) => warn!(error = %e, "invalid SYNC_PAIRS, keeping configured pairs"),
        }
    }

    let pair_names: Vec<String> = config.pairs.iter().map(ToString::to_string).collect();
    info!(pairs = ?pair_names, data_dir = %config.data_dir, "configured pairs");

    // ── 2. Build shared context ──────────────────────────────────────────
    let persistence = Arc::new(FileStore::new(&config.data_dir));
    let history = Arc::new(HyperliquidClient::new(&config.api_url));
    let feed = Arc::new(HyperliquidFeed::new(&config.ws_url));

    let ctx = Arc::new(SyncContext {
        persistence,
        history,
        feed,
        clock: Arc::new(SystemClock),
        config,
    });

    // ── 3. Single-pair mode ──────────────────────────────────────────────
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() == 2 {
        let pair = PairKey {
            coin: args[0].to_uppercase(),
            interval: args[1].parse()?,
        };
        info!(pair = %pair, "single-pair mode");

        tokio::select! {
            result = orchestrator::run_pair(ctx.clone(), pair) => {
                if let Err(e) = result {
                    error!(error = %e, "pair sync failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("shutdown signal received, stopping");
            }
        }
        return Ok(());
    } else if !args.is_empty() {
        anyhow::bail!("usage: candle-sync [<COIN> <interval>]");
    }

    // ── 4. Scheduled mode ────────────────────────────────────────────────
    tokio::spawn(scheduler::run(ctx.clone()));

    info!("scheduler running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    if let Err(e) = ctx.config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save sync config on shutdown");
    }

    info!("candle-sync shut down complete.");
    Ok(())
}
