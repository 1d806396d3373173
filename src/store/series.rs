// =============================================================================
// Candle series model -- OHLCV candles and the deterministic merge rule
// =============================================================================
//
// Prices and volumes are kept as exact decimal strings end to end. The
// historical endpoint already delivers strings; the live feed is coerced to
// strings at the exchange boundary. Parsing them into floats anywhere in the
// engine would accumulate rounding drift across repeated merges.
// =============================================================================

use std::collections::btree_map::{BTreeMap, Entry};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::interval::Interval;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle for one fixed time bucket.
///
/// `open_time` is bucket-aligned milliseconds since the epoch and acts as the
/// unique key within a series. `provisional` is true while the live feed is
/// still updating the bucket and false once the candle has been committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    /// Defaults to false so series files written before this field existed
    /// still load as fully committed candles.
    #[serde(default)]
    pub provisional: bool,
}

/// Composite key that identifies one candle series and one durable record.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PairKey {
    pub coin: String,
    pub interval: Interval,
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.coin, self.interval)
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Merge `incoming` candles into `existing`, keyed by `open_time`.
///
/// Rules, in order:
///   * Candles opening after `now_ms` are discarded (a candle cannot open in
///     the future) and logged, never stored.
///   * On a duplicate `open_time` the existing entry wins, unless it is
///     provisional and the incoming one is committed: finalized data
///     supersedes provisional data.
///   * The result is sorted strictly ascending by `open_time` with no
///     duplicates.
///
/// The merge is deterministic and idempotent: applying the same `incoming`
/// twice yields the same series as applying it once.
pub fn merge_candles(existing: &[Candle], incoming: Vec<Candle>, now_ms: i64) -> Vec<Candle> {
    let mut by_time: BTreeMap<i64, Candle> = existing
        .iter()
        .cloned()
        .map(|c| (c.open_time, c))
        .collect();

    for candle in incoming {
        if candle.open_time > now_ms {
            warn!(
                open_time = candle.open_time,
                now = now_ms,
                "discarding future-dated candle during merge"
            );
            continue;
        }
        match by_time.entry(candle.open_time) {
            Entry::Vacant(slot) => {
                slot.insert(candle);
            }
            Entry::Occupied(mut slot) => {
                if slot.get().provisional && !candle.provisional {
                    slot.insert(candle);
                }
            }
        }
    }

    by_time.into_values().collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    pub fn candle(open_time: i64, close: &str, provisional: bool) -> Candle {
        Candle {
            open_time,
            open: close.to_string(),
            high: close.to_string(),
            low: close.to_string(),
            close: close.to_string(),
            volume: "10".to_string(),
            provisional,
        }
    }

    const NOW: i64 = 1_000_000;

    #[test]
    fn merge_is_idempotent() {
        let existing = vec![candle(0, "1", false), candle(60_000, "2", false)];
        let incoming = vec![candle(60_000, "9", false), candle(120_000, "3", false)];

        let once = merge_candles(&existing, incoming.clone(), NOW);
        let twice = merge_candles(&once, incoming, NOW);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_sorts_and_deduplicates() {
        let incoming = vec![
            candle(120_000, "3", false),
            candle(0, "1", false),
            candle(60_000, "2", false),
            candle(60_000, "2b", false),
        ];
        let merged = merge_candles(&[], incoming, NOW);

        let times: Vec<i64> = merged.iter().map(|c| c.open_time).collect();
        assert_eq!(times, vec![0, 60_000, 120_000]);
        // First occurrence won the duplicate.
        assert_eq!(merged[1].close, "2");
    }

    #[test]
    fn merge_rejects_future_candles() {
        let incoming = vec![candle(NOW - 60_000, "1", false), candle(NOW + 60_000, "2", false)];
        let merged = merge_candles(&[], incoming, NOW);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].open_time, NOW - 60_000);
    }

    #[test]
    fn finalized_supersedes_provisional() {
        let existing = vec![candle(0, "100", true)];
        let merged = merge_candles(&existing, vec![candle(0, "101", false)], NOW);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].close, "101");
        assert!(!merged[0].provisional);
    }

    #[test]
    fn provisional_never_replaces_finalized() {
        let existing = vec![candle(0, "100", false)];
        let merged = merge_candles(&existing, vec![candle(0, "101", true)], NOW);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].close, "100");
        assert!(!merged[0].provisional);
    }

    #[test]
    fn existing_wins_on_equal_finality() {
        let existing = vec![candle(0, "100", false)];
        let merged = merge_candles(&existing, vec![candle(0, "200", false)], NOW);
        assert_eq!(merged[0].close, "100");
    }

    #[test]
    fn ordering_holds_under_repeated_merges() {
        let mut series = Vec::new();
        for batch in [
            vec![candle(180_000, "d", false), candle(0, "a", false)],
            vec![candle(60_000, "b", true), candle(180_000, "x", false)],
            vec![candle(120_000, "c", false), candle(60_000, "b2", false)],
        ] {
            series = merge_candles(&series, batch, NOW);
            let times: Vec<i64> = series.iter().map(|c| c.open_time).collect();
            let mut sorted = times.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(times, sorted, "series must stay strictly ascending");
        }
        assert_eq!(series.len(), 4);
        // The provisional 60_000 was upgraded by the later committed merge.
        assert_eq!(series[1].close, "b2");
    }

    #[test]
    fn pair_key_display() {
        let key = PairKey {
            coin: "BTC".into(),
            interval: crate::interval::Interval::OneMinute,
        };
        assert_eq!(key.to_string(), "BTC@1m");
    }
}
