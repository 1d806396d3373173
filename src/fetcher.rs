// =============================================================================
// Historical Fetcher -- bounded, range-checked bulk candle queries
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::exchange::HistoryProvider;
use crate::store::{Candle, PairKey};

/// Upper bound on candles per request when none is configured.
pub const DEFAULT_MAX_CANDLES: u32 = 5000;

/// Wraps the bulk-history collaborator with window math and result hygiene.
pub struct HistoricalFetcher {
    provider: Arc<dyn HistoryProvider>,
    clock: Arc<dyn Clock>,
    max_candles: u32,
}

impl HistoricalFetcher {
    pub fn new(provider: Arc<dyn HistoryProvider>, clock: Arc<dyn Clock>, max_candles: u32) -> Self {
        Self {
            provider,
            clock,
            max_candles: if max_candles == 0 {
                DEFAULT_MAX_CANDLES
            } else {
                max_candles
            },
        }
    }

    /// Fetch candles covering `[start_ms, end_ms]`.
    ///
    /// `start_ms >= end_ms` is a configuration error, not a silent no-op.
    /// Windows wider than the per-request candle bound are clamped from the
    /// start side. Candles the collaborator returns outside the requested
    /// range are discarded and logged. Each returned candle's `provisional`
    /// flag is normalized against the clock: a bucket that has not closed yet
    /// is provisional.
    pub async fn fetch_range(
        &self,
        pair: &PairKey,
        start_ms: i64,
        end_ms: i64,
        include_partial: bool,
    ) -> Result<Vec<Candle>> {
        if start_ms >= end_ms {
            anyhow::bail!(
                "invalid fetch range for {pair}: start {start_ms} must be before end {end_ms}"
            );
        }

        let duration = pair.interval.duration_ms();
        let max_span = duration * i64::from(self.max_candles);
        let start_ms = if end_ms - start_ms > max_span {
            warn!(
                coin = %pair.coin,
                interval = %pair.interval,
                requested_start = start_ms,
                clamped_start = end_ms - max_span,
                max_candles = self.max_candles,
                "fetch window exceeds per-request candle bound, clamping"
            );
            end_ms - max_span
        } else {
            start_ms
        };

        let raw = self
            .provider
            .candle_snapshot(pair, start_ms, end_ms, include_partial)
            .await?;

        let now = self.clock.now_ms();
        let mut candles = Vec::with_capacity(raw.len());
        for mut candle in raw {
            if candle.open_time < start_ms || candle.open_time > end_ms {
                warn!(
                    coin = %pair.coin,
                    interval = %pair.interval,
                    open_time = candle.open_time,
                    start_ms,
                    end_ms,
                    "discarding candle outside requested range"
                );
                continue;
            }
            candle.provisional = candle.open_time + duration > now;
            candles.push(candle);
        }

        debug!(
            coin = %pair.coin,
            interval = %pair.interval,
            count = candles.len(),
            "historical fetch complete"
        );
        Ok(candles)
    }

    /// Fetch the most recent `count` candles, translating the count into a
    /// time window ending now. `count` is clamped to the per-request bound.
    pub async fn fetch_recent(&self, pair: &PairKey, count: u32) -> Result<Vec<Candle>> {
        let count = count.clamp(1, self.max_candles);
        let end_ms = self.clock.now_ms();
        let start_ms = end_ms - i64::from(count) * pair.interval.duration_ms();
        self.fetch_range(pair, start_ms, end_ms, true).await
    }
}
