// =============================================================================
// Gap Healer -- detect and backfill missing buckets
// =============================================================================
//
// POLICY: the healer never fabricates data. A dropped or missing bucket stays
// absent until a fetch actually returns it; every anomaly is logged with the
// pair and the timestamps involved.
// =============================================================================

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::fetcher::HistoricalFetcher;
use crate::store::CandleStore;

/// Run one heal pass for the store's pair.
///
/// * Empty store: nothing to heal (bootstrap owns first seeding).
/// * A last entry opening in the future is a data-corruption signal: it is
///   dropped and the check re-evaluated.
/// * A gap of less than one interval means the series is current.
/// * Otherwise the missing range `[last_open_time, now]` is fetched and
///   merged; the still-open bucket comes back provisional and will be
///   superseded by the live aggregator's committed candle.
///
/// Idempotent: a second pass with no intervening time passage is a no-op.
/// Returns the number of candles added.
pub async fn heal_gaps(
    store: &mut CandleStore,
    fetcher: &HistoricalFetcher,
    clock: &dyn Clock,
) -> Result<usize> {
    let pair = store.key().clone();
    let interval_ms = pair.interval.duration_ms();
    let now = clock.now_ms();

    let last = loop {
        match store.last_open_time() {
            None => {
                debug!(coin = %pair.coin, interval = %pair.interval, "store is empty, nothing to heal");
                return Ok(0);
            }
            Some(last) if last > now => {
                warn!(
                    coin = %pair.coin,
                    interval = %pair.interval,
                    open_time = last,
                    now,
                    "future-dated candle in store, dropping it"
                );
                store.drop_last()?;
            }
            Some(last) => break last,
        }
    };

    if now - last < interval_ms {
        debug!(
            coin = %pair.coin,
            interval = %pair.interval,
            last_open_time = last,
            now,
            "series is current, no gap"
        );
        return Ok(0);
    }

    info!(
        coin = %pair.coin,
        interval = %pair.interval,
        last_open_time = last,
        now,
        missing_buckets = (now - last) / interval_ms,
        "gap detected, backfilling from history"
    );

    let fetched = fetcher.fetch_range(&pair, last, now, true).await?;
    let added = store.merge_from(fetched, now)?;

    info!(
        coin = %pair.coin,
        interval = %pair.interval,
        added,
        total = store.len(),
        "gap heal complete"
    );
    Ok(added)
}
