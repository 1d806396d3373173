// =============================================================================
// Scheduler -- daily sync passes with inter-pair delays and backoff retry
// =============================================================================
//
// A pass walks the configured pairs in order and launches any pair whose live
// task is not currently running (the launch delay between pairs keeps the
// bulk-history endpoint happy). Skipping healthy pairs also guarantees that
// no two heal passes for the same key ever run concurrently. A failed pass
// is retried after a fixed backoff instead of waiting a whole day.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::orchestrator::{self, SyncContext};
use crate::store::PairKey;

/// Run sync passes forever: one immediately, then daily at the configured
/// UTC wall-clock time.
pub async fn run(ctx: Arc<SyncContext>) {
    let mut live_tasks: HashMap<PairKey, JoinHandle<()>> = HashMap::new();

    loop {
        match run_sync_pass(&ctx, &mut live_tasks).await {
            Ok(launched) => {
                let wait = until_next_run(
                    ctx.config.schedule_hour_utc,
                    ctx.config.schedule_minute_utc,
                    Utc::now(),
                );
                info!(
                    launched,
                    live_pairs = live_tasks.values().filter(|h| !h.is_finished()).count(),
                    next_pass_in_mins = wait.as_secs() / 60,
                    "sync pass complete, next pass scheduled"
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                let backoff = Duration::from_secs(ctx.config.retry_backoff_secs);
                error!(
                    error = %e,
                    retry_in_secs = backoff.as_secs(),
                    "sync pass failed, retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Launch every configured pair that is not already live. Returns the number
/// of pairs launched this pass.
async fn run_sync_pass(
    ctx: &Arc<SyncContext>,
    live_tasks: &mut HashMap<PairKey, JoinHandle<()>>,
) -> Result<usize> {
    let pairs = ctx.config.pairs.clone();
    let launch_delay = Duration::from_secs(ctx.config.pair_launch_delay_secs);
    let mut launched = 0;

    for pair in pairs {
        if let Some(handle) = live_tasks.get(&pair) {
            if !handle.is_finished() {
                debug!(pair = %pair, "live task still running, skipping");
                continue;
            }
        }

        if launched > 0 {
            tokio::time::sleep(launch_delay).await;
        }

        info!(pair = %pair, "launching pair");
        let store = orchestrator::prepare(ctx, &pair).await?;
        let handle = tokio::spawn(orchestrator::run_live(ctx.clone(), pair.clone(), store));
        live_tasks.insert(pair, handle);
        launched += 1;
    }

    Ok(launched)
}

/// Time until the next occurrence of `hour:minute` UTC, strictly after `now`.
fn until_next_run(hour: u32, minute: u32, now: DateTime<Utc>) -> Duration {
    let hour = hour.min(23);
    let minute = minute.min(59);

    let mut next = now
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .expect("clamped hour/minute are valid")
        .and_utc();
    if next <= now {
        next = next + chrono::Duration::days(1);
    }

    (next - now).to_std().unwrap_or(Duration::ZERO)
}
