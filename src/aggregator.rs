// =============================================================================
// Live Aggregator -- debounced per-bucket commits from the push feed
// =============================================================================
//
// The feed sends many snapshots per bucket; only the latest one matters. When
// a snapshot for a newer bucket arrives, the previous bucket has closed, but
// the feed may still send a last-moment correction for it. The aggregator
// therefore holds the closing candle for a short debounce window before
// marking it committed and appending it to the store. At most one commit is
// ever scheduled per bucket.
//
// This component never reconnects the feed. A lost connection is just a
// silent channel; whatever was missed is backfilled by the next heal pass.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::store::{Candle, CandleStore, PairKey};

pub struct LiveAggregator {
    pair: PairKey,
    debounce: Duration,
    clock: Arc<dyn Clock>,
    /// Highest bucket already handed to the store. Guards against feed
    /// redelivery and enforces at most one commit per bucket.
    last_committed: i64,
}

impl LiveAggregator {
    pub fn new(pair: PairKey, debounce: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            pair,
            debounce,
            clock,
            last_committed: 0,
        }
    }

    /// Consume the snapshot channel until it closes or the store fails.
    ///
    /// Cancellation is dropping this future: an armed debounce timer dies
    /// with it and no commit fires afterwards.
    pub async fn run(
        mut self,
        store: &mut CandleStore,
        mut rx: mpsc::Receiver<Candle>,
    ) -> Result<()> {
        info!(
            pair = %self.pair,
            debounce_ms = self.debounce.as_millis() as u64,
            "live aggregator started"
        );

        // Latest snapshot for the bucket currently open.
        let mut current: Option<Candle> = None;
        // Snapshot of the just-closed bucket, waiting out the debounce.
        let mut closing: Option<Candle> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(snapshot) => self.on_snapshot(
                            snapshot,
                            &mut current,
                            &mut closing,
                            &mut deadline,
                            store,
                        )?,
                        None => {
                            info!(pair = %self.pair, "live feed channel closed, aggregator stopping");
                            return Ok(());
                        }
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(candle) = closing.take() {
                        self.commit(candle, store)?;
                    }
                    deadline = None;
                }
            }
        }
    }

    /// Route one snapshot: overwrite the buffer for its bucket, or detect a
    /// bucket boundary and arm the debounce timer.
    fn on_snapshot(
        &mut self,
        snapshot: Candle,
        current: &mut Option<Candle>,
        closing: &mut Option<Candle>,
        deadline: &mut Option<Instant>,
        store: &mut CandleStore,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        if snapshot.open_time > now {
            warn!(
                pair = %self.pair,
                open_time = snapshot.open_time,
                now,
                "dropping future-dated live snapshot"
            );
            return Ok(());
        }
        if snapshot.open_time <= self.last_committed {
            debug!(
                pair = %self.pair,
                open_time = snapshot.open_time,
                "dropping snapshot for already-committed bucket"
            );
            return Ok(());
        }

        // Late correction for the bucket waiting out its debounce.
        if let Some(c) = closing.as_mut() {
            if snapshot.open_time == c.open_time {
                debug!(pair = %self.pair, open_time = snapshot.open_time, "late correction for closing bucket");
                *c = snapshot;
                return Ok(());
            }
        }

        let buffered = current.as_ref().map(|c| c.open_time);
        match buffered {
            None => *current = Some(snapshot),
            Some(bucket) if snapshot.open_time == bucket => *current = Some(snapshot),
            Some(bucket) if snapshot.open_time > bucket => {
                // Boundary crossed: the buffered bucket is closing. If an
                // older closing candle is somehow still pending, flush it
                // rather than letting two commits queue up.
                if let Some(stale) = closing.take() {
                    self.commit(stale, store)?;
                }
                debug!(
                    pair = %self.pair,
                    closing_bucket = bucket,
                    next_bucket = snapshot.open_time,
                    "bucket boundary crossed, commit scheduled"
                );
                *closing = current.take();
                *current = Some(snapshot);
                *deadline = Some(Instant::now() + self.debounce);
            }
            Some(_) => {
                debug!(
                    pair = %self.pair,
                    open_time = snapshot.open_time,
                    "dropping snapshot for an older bucket"
                );
            }
        }
        Ok(())
    }

    /// Finalize a closed bucket and hand it to the store exactly once.
    fn commit(&mut self, mut candle: Candle, store: &mut CandleStore) -> Result<()> {
        candle.provisional = false;
        let open_time = candle.open_time;

        // Redelivery guard: a committed candle for this bucket already in the
        // store means the feed (or a previous run) beat us to it.
        if let Some(existing) = store.get(open_time) {
            if !existing.provisional {
                info!(pair = %self.pair, open_time, "candle already committed, skipping");
                self.last_committed = self.last_committed.max(open_time);
                return Ok(());
            }
        }

        let appended = store.append(candle, self.clock.now_ms())?;
        if appended {
            info!(
                pair = %self.pair,
                open_time,
                total = store.len(),
                "candle committed"
            );
        }
        self.last_committed = self.last_committed.max(open_time);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::interval::Interval;
    use crate::store::file_store::MemoryStore;

    const MINUTE: i64 = 60_000;
    const BASE: i64 = 1_700_000_000_000;
    // Clock far past every bucket used below, so nothing is future-dated.
    const NOW: i64 = BASE + 100 * MINUTE;

    fn pair() -> PairKey {
        PairKey {
            coin: "BTC".into(),
            interval: Interval::OneMinute,
        }
    }

    fn snapshot(open_time: i64, close: &str) -> Candle {
        Candle {
            open_time,
            open: close.to_string(),
            high: close.to_string(),
            low: close.to_string(),
            close: close.to_string(),
            volume: "1".to_string(),
            provisional: true,
        }
    }

    fn empty_store() -> CandleStore {
        CandleStore::create(Arc::new(MemoryStore::new()), pair(), vec![], NOW).unwrap()
    }

    fn aggregator() -> LiveAggregator {
        LiveAggregator::new(
            pair(),
            Duration::from_millis(20),
            Arc::new(ManualClock::new(NOW)),
        )
    }

    /// Run the aggregator against a scripted driver and return the store.
    async fn run_with<F, Fut>(mut store: CandleStore, driver: F) -> CandleStore
    where
        F: FnOnce(mpsc::Sender<Candle>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let (tx, rx) = mpsc::channel(256);
        let (result, ()) = tokio::join!(aggregator().run(&mut store, rx), driver(tx));
        result.unwrap();
        store
    }

    #[tokio::test]
    async fn fifty_rapid_updates_commit_exactly_once() {
        let store = run_with(empty_store(), |tx| async move {
            for i in 0..50 {
                tx.send(snapshot(BASE, &format!("{i}"))).await.unwrap();
            }
            // Boundary: first snapshot of the next bucket closes BASE.
            tx.send(snapshot(BASE + MINUTE, "next")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
            // Channel drops here; the aggregator returns cleanly.
        })
        .await;

        assert_eq!(store.len(), 1, "exactly one append for the bucket");
        let committed = store.get(BASE).unwrap();
        assert_eq!(committed.close, "49", "latest snapshot won");
        assert!(!committed.provisional);
    }

    #[tokio::test]
    async fn late_correction_inside_debounce_window_wins() {
        let store = run_with(empty_store(), |tx| async move {
            tx.send(snapshot(BASE, "100")).await.unwrap();
            tx.send(snapshot(BASE + MINUTE, "next")).await.unwrap();
            // Correction for the closing bucket, still inside the window.
            tx.send(snapshot(BASE, "100.5")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
        })
        .await;

        assert_eq!(store.get(BASE).unwrap().close, "100.5");
    }

    #[tokio::test]
    async fn already_committed_bucket_is_skipped() {
        let mut seeded = empty_store();
        let mut committed = snapshot(BASE, "stored");
        committed.provisional = false;
        seeded.append(committed, NOW).unwrap();

        let store = run_with(seeded, |tx| async move {
            tx.send(snapshot(BASE, "live")).await.unwrap();
            tx.send(snapshot(BASE + MINUTE, "next")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
        })
        .await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(BASE).unwrap().close, "stored");
    }

    #[tokio::test]
    async fn commit_upgrades_a_healed_provisional_candle() {
        // The heal pass stored a provisional candle for the open bucket; the
        // live commit must replace it with the finalized version.
        let mut seeded = empty_store();
        seeded.append(snapshot(BASE, "provisional"), NOW).unwrap();

        let store = run_with(seeded, |tx| async move {
            tx.send(snapshot(BASE, "final")).await.unwrap();
            tx.send(snapshot(BASE + MINUTE, "next")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
        })
        .await;

        assert_eq!(store.len(), 1);
        let stored = store.get(BASE).unwrap();
        assert_eq!(stored.close, "final");
        assert!(!stored.provisional);
    }

    #[tokio::test]
    async fn future_dated_snapshot_is_dropped() {
        let store = run_with(empty_store(), |tx| async move {
            tx.send(snapshot(NOW + MINUTE, "future")).await.unwrap();
            tx.send(snapshot(BASE, "ok")).await.unwrap();
            tx.send(snapshot(BASE + MINUTE, "next")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
        })
        .await;

        assert_eq!(store.len(), 1);
        assert!(store.get(NOW + MINUTE).is_none());
        assert_eq!(store.get(BASE).unwrap().close, "ok");
    }

    #[tokio::test]
    async fn consecutive_buckets_each_commit_once() {
        let store = run_with(empty_store(), |tx| async move {
            for bucket in 0..3_i64 {
                let open = BASE + bucket * MINUTE;
                for i in 0..5 {
                    tx.send(snapshot(open, &format!("{bucket}-{i}"))).await.unwrap();
                }
                tx.send(snapshot(open + MINUTE, "roll")).await.unwrap();
                tokio::time::sleep(Duration::from_millis(60)).await;
            }
        })
        .await;

        assert_eq!(store.len(), 3);
        let times: Vec<i64> = store.candles().iter().map(|c| c.open_time).collect();
        assert_eq!(times, vec![BASE, BASE + MINUTE, BASE + 2 * MINUTE]);
        for (bucket, candle) in store.candles().iter().enumerate() {
            assert_eq!(candle.close, format!("{bucket}-4"));
            assert!(!candle.provisional);
        }
    }

    #[tokio::test]
    async fn channel_close_returns_cleanly_without_committing_pending() {
        let store = run_with(empty_store(), |tx| async move {
            tx.send(snapshot(BASE, "only")).await.unwrap();
            // Dropped before any boundary: nothing may be committed.
        })
        .await;

        assert!(store.is_empty());
    }
}
