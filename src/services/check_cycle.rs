//! Periodic check cycle
//!
//! Each cycle selects records, checks them under the shared gate and writes
//! every outcome back before the next cycle may start.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::error::{PoolError, Result};
use crate::models::CycleStats;
use crate::proxy::{ProxyChecker, ResultAggregator, SelectionLimits, SelectionPolicy};
use crate::repository::ProxyStore;
use crate::shutdown::wait_for_shutdown;

/// Time left in the period, `None` when the cycle overran it
pub fn remaining(period: Duration, elapsed: Duration) -> Option<Duration> {
    period.checked_sub(elapsed)
}

/// Runs select, check and store once per period
pub struct CheckScheduler {
    selection: SelectionPolicy,
    checker: ProxyChecker,
    aggregator: ResultAggregator,
    period: Duration,
    stats_tx: watch::Sender<Option<CycleStats>>,
}

impl CheckScheduler {
    pub fn new(
        store: Arc<dyn ProxyStore>,
        checker: ProxyChecker,
        limits: SelectionLimits,
        period: Duration,
    ) -> Self {
        let (stats_tx, _) = watch::channel(None);
        Self {
            selection: SelectionPolicy::new(store.clone(), limits),
            checker,
            aggregator: ResultAggregator::new(store),
            period,
            stats_tx,
        }
    }

    /// Statistics of the most recent finished cycle
    pub fn stats(&self) -> watch::Receiver<Option<CycleStats>> {
        self.stats_tx.subscribe()
    }

    /// Run cycles until shutdown (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting check scheduler with {}s period",
            self.period.as_secs()
        );

        loop {
            let started = Instant::now();

            let cycle = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    self.checker.gate().close();
                    info!("Check scheduler shutting down mid-cycle");
                    break;
                }
                result = self.run_cycle() => result,
            };

            match cycle {
                Ok(_) => {}
                Err(PoolError::Cancelled) => {
                    info!("Check cycle cancelled");
                    break;
                }
                Err(e) => error!("Check cycle failed: {}", e),
            }

            let elapsed = started.elapsed();
            let wait = match remaining(self.period, elapsed) {
                Some(wait) => wait,
                None => {
                    warn!(
                        elapsed_secs = elapsed.as_secs_f64(),
                        period_secs = self.period.as_secs_f64(),
                        "Check cycle overran its period, starting the next one now"
                    );
                    Duration::ZERO
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    self.checker.gate().close();
                    info!("Check scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// One full cycle.
    ///
    /// Store write failures are counted and skipped. Cancellation aborts the
    /// cycle; outcomes already written stay written.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let started = Instant::now();
        let selection = self.selection.select().await?;

        let mut stats = CycleStats {
            selected: selection.len(),
            active_selected: selection.active.len(),
            new_selected: selection.new.len(),
            stale_selected: selection.stale.len(),
            ..CycleStats::default()
        };

        let width = self.checker.gate().capacity();
        let mut outcomes = futures::stream::iter(selection.into_ordered())
            .map(|identity| async move {
                let outcome = self.checker.check(&identity).await?;
                let stored = self.aggregator.apply(&identity, &outcome).await.is_ok();
                Ok::<_, PoolError>((outcome, stored))
            })
            .buffer_unordered(width);

        while let Some(result) = outcomes.next().await {
            let (outcome, stored) = result?;
            stats.checked += 1;
            if outcome.active {
                stats.active += 1;
            }
            if outcome.is_tunnel_capable() {
                stats.tunnel_capable += 1;
            }
            if !stored {
                stats.store_errors += 1;
            }
        }

        stats.duration_secs = started.elapsed().as_secs_f64();
        stats.finished_at = Some(Utc::now());

        info!(
            selected = stats.selected,
            checked = stats.checked,
            active = stats.active,
            tunnel_capable = stats.tunnel_capable,
            store_errors = stats.store_errors,
            duration_secs = stats.duration_secs,
            "Check cycle complete"
        );

        self.stats_tx.send_replace(Some(stats.clone()));
        Ok(stats)
    }
}
