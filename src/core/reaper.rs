//! Staleness Reaper
//!
//! Periodic sweep that cancels transactions abandoned in an intermediate
//! state. Each sweep handles at most one bounded batch: the oldest stale
//! transactions up to `sweep_batch_limit`, capped at half the store's batch
//! size because each cancellation writes two documents. Anything left over
//! is picked up by the next tick.
//!
//! Cancellation runs through [`TransactionEngine::cancel_stale`] in
//! best-effort mode, so a processor outage never keeps a transaction (or its
//! item) stuck. Payment cleanups of one batch run concurrently, bounded by
//! `sweep_concurrency`.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::store::Versioned;
use crate::types::{EscrowError, Transaction};

use super::engine::{CancelOutcome, TransactionEngine};

/// Tally of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale transactions selected
    pub examined: usize,
    /// Transactions cancelled by this sweep
    pub cancelled: usize,
    /// Cancelled although their payment could not be released
    pub unreleased: usize,
    /// Already terminal or updated since selection
    pub skipped: usize,
    /// Cancellations that failed; retried next sweep
    pub failed: usize,
    /// Whether the batch was full, so more stale transactions may remain
    pub more_pending: bool,
}

#[derive(Debug, Clone)]
pub struct StalenessReaper {
    engine: TransactionEngine,
}

impl StalenessReaper {
    pub fn new(engine: TransactionEngine) -> Self {
        Self { engine }
    }

    /// Number of transactions one sweep may cancel
    pub fn batch_limit(&self) -> usize {
        let ctx = self.engine.context();
        let per_batch = ctx.store.max_batch_size() / 2;
        ctx.config.sweep_batch_limit.min(per_batch).max(1)
    }

    /// Cancel one bounded batch of stale transactions
    ///
    /// Individual failures are logged and counted, never returned; only a
    /// failure to query the store fails the sweep.
    pub async fn sweep(&self) -> Result<SweepReport, EscrowError> {
        let ctx = self.engine.context();
        let config = &ctx.config;
        let limit = self.batch_limit();

        let now = ctx.clock.now();
        let cutoff = chrono::Duration::from_std(config.stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(now);

        let stale = ctx
            .store
            .stale_transactions(&config.stale_statuses, cutoff, limit)
            .await?;

        let mut report = SweepReport {
            examined: stale.len(),
            more_pending: stale.len() >= limit,
            ..SweepReport::default()
        };

        if stale.is_empty() {
            debug!(%cutoff, "no stale transactions");
            return Ok(report);
        }

        let engine = &self.engine;
        let cancels: Vec<_> = stale
            .iter()
            .map(|tx| async move {
                let id = tx.value.id.as_str();
                (id, engine.cancel_stale(id, cutoff).await)
            })
            .collect();
        let results: Vec<_> = stream::iter(cancels)
            .buffer_unordered(config.sweep_concurrency.max(1))
            .collect()
            .await;

        for (transaction_id, result) in results {
            match result {
                Ok(CancelOutcome::Cancelled { release, .. }) => {
                    report.cancelled += 1;
                    if release.is_none() && has_intent(&stale, transaction_id) {
                        report.unreleased += 1;
                    }
                }
                Ok(CancelOutcome::AlreadyCancelled(_)) => report.skipped += 1,
                Err(EscrowError::PreconditionFailed { reason, .. }) => {
                    debug!(transaction = transaction_id, %reason, "stale transaction moved on");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(transaction = transaction_id, error = %e, "failed to cancel stale transaction");
                    report.failed += 1;
                }
            }
        }

        info!(
            examined = report.examined,
            cancelled = report.cancelled,
            unreleased = report.unreleased,
            skipped = report.skipped,
            failed = report.failed,
            more_pending = report.more_pending,
            "staleness sweep finished"
        );
        Ok(report)
    }

    /// Sweep every `period` until `shutdown` turns true or its sender is dropped
    pub async fn run(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "staleness sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("staleness reaper stopped");
                        return;
                    }
                }
            }
        }
    }
}

fn has_intent(stale: &[Versioned<Transaction>], id: &str) -> bool {
    stale
        .iter()
        .any(|tx| tx.value.id == id && tx.value.payment_intent_id.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EscrowConfig;
    use crate::core::context::EscrowContext;
    use crate::core::traits::{ManualClock, SequentialIds};
    use crate::gateway::{GatewayOperation, IntentStatus, MemoryProcessor};
    use crate::store::{DocumentStore, MemoryStore};
    use crate::types::{Item, ItemStatus, PrivateContact, TransactionStatus, User};
    use chrono::Utc;
    use std::sync::Arc;

    struct Harness {
        store: Arc<MemoryStore>,
        processor: Arc<MemoryProcessor>,
        clock: Arc<ManualClock>,
        engine: TransactionEngine,
        reaper: StalenessReaper,
    }

    fn harness(config: EscrowConfig, store: MemoryStore, items: usize) -> Harness {
        let store = Arc::new(store);
        let mut seller = User::new(
            "alice",
            PrivateContact {
                student_id: "S-1".to_string(),
                email: "alice@campus.edu".to_string(),
            },
        );
        seller.payout_account = Some("acct_alice".to_string());
        seller.charges_enabled = true;
        store.insert_user(seller);
        for n in 0..items {
            store.insert_item(Item::new(format!("book-{}", n), "Book", 1000, "alice", 3));
        }

        let processor = Arc::new(MemoryProcessor::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ctx = EscrowContext::new(store.clone(), processor.clone(), config)
            .with_clock(clock.clone())
            .with_ids(Arc::new(SequentialIds::new()));
        let engine = TransactionEngine::new(Arc::new(ctx));

        Harness {
            store,
            processor,
            clock,
            reaper: StalenessReaper::new(engine.clone()),
            engine,
        }
    }

    async fn pending(h: &Harness, item: &str) -> String {
        let tx = h.engine.request_purchase(item, "bob").await.unwrap();
        h.engine.approve(&tx.id, "alice").await.unwrap();
        h.engine.start_payment(&tx.id, "bob").await.unwrap();
        tx.id
    }

    async fn status(h: &Harness, tx: &str) -> TransactionStatus {
        h.store.get_transaction(tx).await.unwrap().unwrap().value.status
    }

    #[tokio::test]
    async fn test_sweep_cancels_stale_payment_pending() {
        let h = harness(EscrowConfig::default(), MemoryStore::new(), 1);
        let tx = pending(&h, "book-0").await;
        let intent = h
            .store
            .get_transaction(&tx)
            .await
            .unwrap()
            .unwrap()
            .value
            .payment_intent_id
            .unwrap();

        h.clock.advance(chrono::Duration::hours(25)).unwrap();
        let report = h.reaper.sweep().await.unwrap();

        assert_eq!(report.cancelled, 1);
        assert_eq!(status(&h, &tx).await, TransactionStatus::Cancelled);
        assert_eq!(h.processor.status_of(&intent), Some(IntentStatus::Canceled));
        let item = h.store.get_item("book-0").await.unwrap().unwrap();
        assert_eq!(item.value.status, ItemStatus::Listing);
    }

    #[tokio::test]
    async fn test_sweep_leaves_recent_transactions() {
        let h = harness(EscrowConfig::default(), MemoryStore::new(), 1);
        let tx = pending(&h, "book-0").await;

        h.clock.advance(chrono::Duration::hours(23)).unwrap();
        let report = h.reaper.sweep().await.unwrap();

        assert_eq!(report, SweepReport::default());
        assert_eq!(status(&h, &tx).await, TransactionStatus::PaymentPending);
    }

    #[tokio::test]
    async fn test_sweep_ignores_request_sent_by_default() {
        let h = harness(EscrowConfig::default(), MemoryStore::new(), 1);
        let tx = h.engine.request_purchase("book-0", "bob").await.unwrap();

        h.clock.advance(chrono::Duration::hours(48)).unwrap();
        h.reaper.sweep().await.unwrap();

        assert_eq!(status(&h, &tx.id).await, TransactionStatus::RequestSent);
    }

    #[tokio::test]
    async fn test_sweep_is_best_effort() {
        let h = harness(EscrowConfig::default(), MemoryStore::new(), 1);
        let tx = pending(&h, "book-0").await;
        h.processor.fail_next(GatewayOperation::Cancel);

        h.clock.advance(chrono::Duration::hours(25)).unwrap();
        let report = h.reaper.sweep().await.unwrap();

        assert_eq!(report.cancelled, 1);
        assert_eq!(report.unreleased, 1);
        assert_eq!(status(&h, &tx).await, TransactionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_sweep_is_bounded() {
        let config = EscrowConfig::default().with_sweep(2, 2);
        let h = harness(config, MemoryStore::new(), 3);
        for n in 0..3 {
            pending(&h, &format!("book-{}", n)).await;
        }
        h.clock.advance(chrono::Duration::hours(25)).unwrap();

        let first = h.reaper.sweep().await.unwrap();
        assert_eq!(first.cancelled, 2);
        assert!(first.more_pending);

        let second = h.reaper.sweep().await.unwrap();
        assert_eq!(second.cancelled, 1);
        assert!(!second.more_pending);

        for tx in ["tx-1", "tx-2", "tx-3"] {
            assert_eq!(status(&h, tx).await, TransactionStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_batch_limit_respects_store_batch_size() {
        let config = EscrowConfig::default().with_sweep(250, 4);
        let h = harness(config, MemoryStore::with_max_batch_size(10), 0);

        assert_eq!(h.reaper.batch_limit(), 5);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(EscrowConfig::default(), MemoryStore::new(), 0);
        let (tx, rx) = watch::channel(false);

        let reaper = h.reaper.clone();
        let handle = tokio::spawn(async move { reaper.run(Duration::from_millis(10), rx).await });
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
