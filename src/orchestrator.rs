// =============================================================================
// Sync Orchestrator -- per-pair composition of store, healer and aggregator
// =============================================================================
//
// Each (coin, interval) pair runs as an isolated instance: its store is owned
// by exactly one task and nothing is shared between pairs. The heal phase is
// awaited before the live phase starts, so a live commit can never race a
// historical merge for the same key.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::aggregator::LiveAggregator;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::exchange::{HistoryProvider, LiveFeed};
use crate::fetcher::HistoricalFetcher;
use crate::healer;
use crate::store::{CandleStore, PairKey, Persistence};

/// Shared collaborators handed to every pair. All read-only.
pub struct SyncContext {
    pub config: SyncConfig,
    pub persistence: Arc<dyn Persistence>,
    pub history: Arc<dyn HistoryProvider>,
    pub feed: Arc<dyn LiveFeed>,
    pub clock: Arc<dyn Clock>,
}

/// Load-or-bootstrap the store for `pair`, then heal any gap.
///
/// Bootstrap fetches a bounded default window of recent history and persists
/// it as the initial series. Any error here (fetch, persist) aborts the pair
/// launch and surfaces to the scheduler's retry policy.
pub async fn prepare(ctx: &SyncContext, pair: &PairKey) -> Result<CandleStore> {
    let fetcher = HistoricalFetcher::new(
        ctx.history.clone(),
        ctx.clock.clone(),
        ctx.config.max_fetch_candles,
    );

    let mut store = match CandleStore::load(ctx.persistence.clone(), pair.clone())? {
        Some(store) => {
            info!(pair = %pair, candles = store.len(), "loaded existing candle series");
            store
        }
        None => {
            info!(
                pair = %pair,
                count = ctx.config.bootstrap_candles,
                "no durable state, bootstrapping from historical fetch"
            );
            let seed = fetcher.fetch_recent(pair, ctx.config.bootstrap_candles).await?;
            let store = CandleStore::create(
                ctx.persistence.clone(),
                pair.clone(),
                seed,
                ctx.clock.now_ms(),
            )?;
            info!(pair = %pair, candles = store.len(), "bootstrap complete");
            store
        }
    };

    healer::heal_gaps(&mut store, &fetcher, ctx.clock.as_ref()).await?;
    Ok(store)
}

/// Run the live phase for `pair` until the feed dies for good or the store
/// fails. Never returns an error: failures are logged and end the task, and
/// the next scheduled sync pass revives the pair (healing whatever was
/// missed in between).
pub async fn run_live(ctx: Arc<SyncContext>, pair: PairKey, mut store: CandleStore) {
    let rx = match ctx.feed.subscribe(&pair).await {
        Ok(rx) => rx,
        Err(e) => {
            error!(pair = %pair, error = %e, "failed to subscribe to live feed");
            return;
        }
    };

    let aggregator = LiveAggregator::new(
        pair.clone(),
        Duration::from_millis(ctx.config.debounce_ms),
        ctx.clock.clone(),
    );

    match aggregator.run(&mut store, rx).await {
        Ok(()) => warn!(pair = %pair, "live aggregation ended, awaiting next sync pass"),
        Err(e) => error!(
            pair = %pair,
            error = %e,
            "live aggregation failed, pair halted until next sync pass"
        ),
    }
}

/// Single-pair entry point: prepare, then stay live. Used by the CLI mode.
pub async fn run_pair(ctx: Arc<SyncContext>, pair: PairKey) -> Result<()> {
    let store = prepare(&ctx, &pair).await?;
    run_live(ctx, pair, store).await;
    Ok(())
}
