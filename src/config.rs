//! Orchestrator configuration
//!
//! `EscrowConfig` holds every tunable of the lifecycle orchestrator. Defaults
//! match the production marketplace; the CLI overrides a subset of them.

use std::time::Duration;

use rust_decimal::Decimal;

use crate::types::TransactionStatus;

/// Configuration for the escrow orchestrator
#[derive(Clone, Debug)]
pub struct EscrowConfig {
    /// Platform fee rate applied to the item price
    pub fee_rate: Decimal,
    /// Minimum platform fee in the smallest currency unit
    pub min_fee: i64,
    /// Age of the last update after which a transaction counts as abandoned
    pub stale_after: Duration,
    /// Statuses the staleness reaper sweeps
    pub stale_statuses: Vec<TransactionStatus>,
    /// Maximum number of transactions cancelled per sweep
    pub sweep_batch_limit: usize,
    /// Maximum number of concurrent payment cleanups during a sweep
    pub sweep_concurrency: usize,
    /// Payment-intent creations allowed per user within the window
    pub payment_rate_limit: u32,
    /// Sliding window for the payment-intent rate limit
    pub payment_rate_window: Duration,
    /// Whether a seller may buy their own listing (demo/testing affordance)
    pub allow_self_trade: bool,
    /// Whether completion moves the item from `matching` to `sold`
    pub mark_item_sold_on_completion: bool,
    /// Shared secret used to sign processor webhooks
    pub webhook_secret: String,
    /// Accepted clock skew for webhook signature timestamps
    pub webhook_tolerance: Duration,
    /// Secret used to sign proof-of-handover tokens
    pub handover_secret: String,
    /// Attempts for an optimistic read-then-commit cycle before giving up
    pub max_commit_attempts: u32,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            fee_rate: Decimal::new(10, 2),
            min_fee: 50,
            stale_after: Duration::from_secs(24 * 60 * 60),
            stale_statuses: vec![
                TransactionStatus::Approved,
                TransactionStatus::PaymentPending,
            ],
            sweep_batch_limit: 250,
            sweep_concurrency: num_cpus::get(),
            payment_rate_limit: 10,
            payment_rate_window: Duration::from_secs(60 * 60),
            allow_self_trade: false,
            mark_item_sold_on_completion: false,
            webhook_secret: "whsec_local".to_string(),
            webhook_tolerance: Duration::from_secs(300),
            handover_secret: "handover_local".to_string(),
            max_commit_attempts: 5,
        }
    }
}

impl EscrowConfig {
    /// Override the sweep tunables, falling back to defaults on zero values
    pub fn with_sweep(mut self, batch_limit: usize, concurrency: usize) -> Self {
        let default = Self::default();

        self.sweep_batch_limit = if batch_limit == 0 {
            tracing::warn!(
                batch_limit,
                default = default.sweep_batch_limit,
                "invalid sweep batch limit, using default"
            );
            default.sweep_batch_limit
        } else {
            batch_limit
        };

        self.sweep_concurrency = if concurrency == 0 {
            tracing::warn!(
                concurrency,
                default = default.sweep_concurrency,
                "invalid sweep concurrency, using default"
            );
            default.sweep_concurrency
        } else {
            concurrency
        };

        self
    }

    /// Override the staleness threshold, falling back to the default on zero
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        if stale_after.is_zero() {
            tracing::warn!("invalid staleness threshold, using default");
            self.stale_after = Self::default().stale_after;
        } else {
            self.stale_after = stale_after;
        }
        self
    }
}
