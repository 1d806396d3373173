// =============================================================================
// CandleStore -- the owned, ordered, deduplicated series for one key
// =============================================================================
//
// Exactly one orchestrator task owns each store; there is no shared mutable
// state between pairs. Every mutation persists synchronously, so on-disk
// state never lags a commit the engine believes happened.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::file_store::Persistence;
use super::series::{merge_candles, Candle, PairKey};

pub struct CandleStore {
    key: PairKey,
    backend: Arc<dyn Persistence>,
    candles: Vec<Candle>,
}

impl CandleStore {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Load the durable series for `key`. Returns `None` when no prior state
    /// exists, in which case the caller bootstraps via [`CandleStore::create`].
    pub fn load(backend: Arc<dyn Persistence>, key: PairKey) -> Result<Option<Self>> {
        let Some(bytes) = backend.read(&key)? else {
            return Ok(None);
        };

        let mut candles: Vec<Candle> = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse persisted series for {key}"))?;

        // A hand-edited or legacy file may violate ordering; repair it here
        // rather than propagating a fatal error.
        let sorted = candles
            .windows(2)
            .all(|w| w[0].open_time < w[1].open_time);
        if !sorted {
            warn!(key = %key, "persisted series out of order, re-sorting and deduplicating");
            candles.sort_by_key(|c| c.open_time);
            candles.dedup_by_key(|c| c.open_time);
        }

        Ok(Some(Self {
            key,
            backend,
            candles,
        }))
    }

    /// Create a new store seeded from a bootstrap fetch and persist it.
    pub fn create(
        backend: Arc<dyn Persistence>,
        key: PairKey,
        seed: Vec<Candle>,
        now_ms: i64,
    ) -> Result<Self> {
        let store = Self {
            key,
            backend,
            candles: merge_candles(&[], seed, now_ms),
        };
        store.persist()?;
        Ok(store)
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Merge a fetched batch into the series and persist if anything changed.
    /// Returns the number of entries added.
    pub fn merge_from(&mut self, incoming: Vec<Candle>, now_ms: i64) -> Result<usize> {
        let merged = merge_candles(&self.candles, incoming, now_ms);
        let added = merged.len() - self.candles.len();
        if merged != self.candles {
            self.candles = merged;
            self.persist()?;
        }
        Ok(added)
    }

    /// Insert a single candle, applying the same dedup rule as the merge:
    /// an existing committed candle wins over any incoming duplicate, while a
    /// provisional one is replaced by an incoming committed candle. Persists
    /// synchronously. Returns false when the insert was skipped.
    pub fn append(&mut self, candle: Candle, now_ms: i64) -> Result<bool> {
        if candle.open_time > now_ms {
            warn!(
                key = %self.key,
                open_time = candle.open_time,
                now = now_ms,
                "rejecting future-dated candle append"
            );
            return Ok(false);
        }

        if let Some(pos) = self
            .candles
            .iter()
            .position(|c| c.open_time == candle.open_time)
        {
            if self.candles[pos].provisional && !candle.provisional {
                self.candles[pos] = candle;
                self.persist()?;
                return Ok(true);
            }
            debug!(
                key = %self.key,
                open_time = candle.open_time,
                "append skipped, candle already present"
            );
            return Ok(false);
        }

        let idx = self
            .candles
            .partition_point(|c| c.open_time < candle.open_time);
        self.candles.insert(idx, candle);
        self.persist()?;
        Ok(true)
    }

    /// Remove and return the last candle, persisting the shrunken series.
    /// Used by the gap healer to recover from future-dated corruption.
    pub fn drop_last(&mut self) -> Result<Option<Candle>> {
        let dropped = self.candles.pop();
        if dropped.is_some() {
            self.persist()?;
        }
        Ok(dropped)
    }

    // -------------------------------------------------------------------------
    // Read access
    // -------------------------------------------------------------------------

    pub fn key(&self) -> &PairKey {
        &self.key
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last_open_time(&self) -> Option<i64> {
        self.candles.last().map(|c| c.open_time)
    }

    pub fn get(&self, open_time: i64) -> Option<&Candle> {
        self.candles.iter().find(|c| c.open_time == open_time)
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    fn persist(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.candles)
            .with_context(|| format!("failed to serialise series for {}", self.key))?;
        self.backend.write(&self.key, &bytes)
    }
}
