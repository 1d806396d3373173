// =============================================================================
// Sync Configuration -- engine settings with atomic save
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::exchange::hyperliquid::{DEFAULT_API_URL, DEFAULT_WS_URL};
use crate::interval::Interval;
use crate::store::PairKey;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_pairs() -> Vec<PairKey> {
    vec![
        PairKey {
            coin: "BTC".to_string(),
            interval: Interval::OneMinute,
        },
        PairKey {
            coin: "BTC".to_string(),
            interval: Interval::FiveMinutes,
        },
        PairKey {
            coin: "BTC".to_string(),
            interval: Interval::FifteenMinutes,
        },
    ]
}

fn default_bootstrap_candles() -> u32 {
    5000
}

fn default_max_fetch_candles() -> u32 {
    5000
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_schedule_hour_utc() -> u32 {
    4
}

fn default_schedule_minute_utc() -> u32 {
    0
}

fn default_pair_launch_delay_secs() -> u64 {
    60
}

fn default_retry_backoff_secs() -> u64 {
    300
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

// =============================================================================
// SyncConfig
// =============================================================================

/// Top-level configuration for the candle sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory holding one series file per (coin, interval) pair.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Pairs the engine keeps in sync.
    #[serde(default = "default_pairs")]
    pub pairs: Vec<PairKey>,

    /// Candle count fetched when seeding a brand-new series.
    #[serde(default = "default_bootstrap_candles")]
    pub bootstrap_candles: u32,

    /// Upper bound on candles per historical request.
    #[serde(default = "default_max_fetch_candles")]
    pub max_fetch_candles: u32,

    /// Delay before committing a just-closed bucket, absorbing last-moment
    /// corrections from the feed.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// UTC hour of the daily sync pass.
    #[serde(default = "default_schedule_hour_utc")]
    pub schedule_hour_utc: u32,

    /// UTC minute of the daily sync pass.
    #[serde(default = "default_schedule_minute_utc")]
    pub schedule_minute_utc: u32,

    /// Delay between pair launches within one pass (rate-limit respect).
    #[serde(default = "default_pair_launch_delay_secs")]
    pub pair_launch_delay_secs: u64,

    /// Backoff before retrying a failed sync pass.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_ws_url")]
    pub ws_url: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            pairs: default_pairs(),
            bootstrap_candles: default_bootstrap_candles(),
            max_fetch_candles: default_max_fetch_candles(),
            debounce_ms: default_debounce_ms(),
            schedule_hour_utc: default_schedule_hour_utc(),
            schedule_minute_utc: default_schedule_minute_utc(),
            pair_launch_delay_secs: default_pair_launch_delay_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
            api_url: default_api_url(),
            ws_url: default_ws_url(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read sync config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse sync config from {}", path.display()))?;

        info!(
            path = %path.display(),
            pairs = config.pairs.len(),
            data_dir = %config.data_dir,
            "sync config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise sync config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "sync config saved (atomic)");
        Ok(())
    }
}

/// Parse a `COIN:interval,COIN:interval` pair list, as accepted by the
/// `SYNC_PAIRS` environment override.
pub fn parse_pairs(spec: &str) -> Result<Vec<PairKey>> {
    let mut pairs = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (coin, interval) = part
            .split_once(':')
            .with_context(|| format!("invalid pair spec '{part}' (expected COIN:interval)"))?;
        pairs.push(PairKey {
            coin: coin.trim().to_uppercase(),
            interval: interval.trim().parse()?,
        });
    }
    Ok(pairs)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.data_dir, "data");
        assert_eq!(cfg.pairs.len(), 3);
        assert_eq!(cfg.pairs[0].coin, "BTC");
        assert_eq!(cfg.pairs[0].interval, Interval::OneMinute);
        assert_eq!(cfg.bootstrap_candles, 5000);
        assert_eq!(cfg.debounce_ms, 100);
        assert_eq!(cfg.schedule_hour_utc, 4);
        assert_eq!(cfg.pair_launch_delay_secs, 60);
        assert_eq!(cfg.retry_backoff_secs, 300);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.pairs.len(), 3);
        assert_eq!(cfg.max_fetch_candles, 5000);
        assert_eq!(cfg.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "debounce_ms": 250, "pairs": [{ "coin": "ETH", "interval": "1h" }] }"#;
        let cfg: SyncConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.debounce_ms, 250);
        assert_eq!(cfg.pairs.len(), 1);
        assert_eq!(cfg.pairs[0].interval, Interval::OneHour);
        assert_eq!(cfg.bootstrap_candles, 5000);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = SyncConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.pairs, cfg2.pairs);
        assert_eq!(cfg.debounce_ms, cfg2.debounce_ms);
        assert_eq!(cfg.schedule_hour_utc, cfg2.schedule_hour_utc);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_config.json");

        let cfg = SyncConfig::default();
        cfg.save(&path).unwrap();
        let loaded = SyncConfig::load(&path).unwrap();
        assert_eq!(loaded.pairs, cfg.pairs);

        // No tmp file left behind.
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["sync_config.json".to_string()]);
    }

    #[test]
    fn parse_pairs_accepts_a_list() {
        let pairs = parse_pairs("BTC:1m, eth:1h").unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].coin, "BTC");
        assert_eq!(pairs[1].coin, "ETH");
        assert_eq!(pairs[1].interval, Interval::OneHour);
    }

    #[test]
    fn parse_pairs_rejects_bad_specs() {
        assert!(parse_pairs("BTC-1m").is_err());
        assert!(parse_pairs("BTC:2m").is_err());
    }
}
