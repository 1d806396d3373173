// =============================================================================
// Exchange collaborator contracts
// =============================================================================
//
// The engine core never talks to a venue directly. It consumes exactly two
// operations: a pull-based bulk history query and a push-based live candle
// feed delivered over a channel. Connection management, authentication and
// reconnection all live behind these traits.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::store::{Candle, PairKey};

pub mod hyperliquid;

pub use hyperliquid::{HyperliquidClient, HyperliquidFeed};

/// Pull-based bulk history query.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Fetch the candles covering `[start_ms, end_ms]` for `pair`.
    ///
    /// `include_partial` controls whether the still-open current bucket is
    /// included in the response.
    async fn candle_snapshot(
        &self,
        pair: &PairKey,
        start_ms: i64,
        end_ms: i64,
        include_partial: bool,
    ) -> Result<Vec<Candle>>;
}

/// Push-based live candle feed.
#[async_trait]
pub trait LiveFeed: Send + Sync {
    /// Subscribe to candle snapshots for `pair`. Snapshots arrive arbitrarily
    /// often per bucket, in delivery order. The feed owns its connection
    /// lifecycle; when the subscription dies for good, the channel closes.
    async fn subscribe(&self, pair: &PairKey) -> Result<mpsc::Receiver<Candle>>;
}
