//! Core business logic module
//!
//! This module contains the transaction lifecycle components:
//! - `context` - Explicitly constructed dependencies shared by every component
//! - `traits` - External collaborators (notifications, admin check, clock, ids)
//! - `fee` - Platform fee policy
//! - `inventory` - Inventory Lock Manager (atomic item reservation)
//! - `engine` - Transaction State Machine
//! - `handover` - Proof-of-handover tokens
//! - `rate_limiter` - Sliding-window throttle for payment-intent creation
//! - `rating` - Rating Ledger
//! - `reaper` - Staleness Reaper
//! - `webhook` - Webhook/Event Reconciler

pub mod context;
pub mod engine;
pub mod fee;
pub mod handover;
pub mod inventory;
pub mod rate_limiter;
pub mod rating;
pub mod reaper;
pub mod traits;
pub mod webhook;

pub use context::EscrowContext;
pub use engine::{CancelOutcome, Canceller, CleanupMode, CompletionOutcome, TransactionEngine};
pub use fee::{fee, fee_with};
pub use handover::HandoverTokens;
pub use inventory::InventoryLock;
pub use rate_limiter::RateLimiter;
pub use rating::RatingLedger;
pub use reaper::{StalenessReaper, SweepReport};
pub use traits::{
    AdminAuthorizer, Clock, IdSource, LogNotifier, ManualClock, Notifier, RecordingNotifier,
    SequentialIds, StaticAdmins, SystemClock, TransactionEvent, UuidIds,
};
pub use webhook::{sign_payload, verify_signature, WebhookOutcome, WebhookReconciler};
