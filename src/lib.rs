//! Campus Escrow Library
//! # Overview
//!
//! Transaction lifecycle orchestrator for a campus second-hand marketplace.
//! A buyer reserves an item, the seller approves, the buyer's payment is
//! authorized and held, and the handover confirmation captures it and unlocks
//! the seller's contact details.
//!
//! # Architecture
//!
//! - [`types`] - Core data types (Item, Transaction, User, EscrowError)
//! - [`config`] - Orchestrator tunables
//! - [`store`] - Versioned document store with atomic preconditioned batches
//! - [`gateway`] - Payment processor contract and the gateway adapter
//! - [`core`] - Business logic components:
//!   - [`core::inventory`] - Atomic item reservation and release
//!   - [`core::engine`] - Transaction state machine
//!   - [`core::reaper`] - Cancellation of abandoned transactions
//!   - [`core::webhook`] - Processor event reconciliation
//!   - [`core::rating`] - Post-completion ratings
//! - [`io`] - Scenario CSV parsing and ledger output
//! - [`replay`] - Scenario replay against an in-process marketplace
//! - [`cli`] - CLI arguments parsing
//!
//! # Transaction States
//!
//! ```text
//! request_sent -> approved -> payment_pending -> completed
//!       \             \              \
//!        +-------------+--------------+--> cancelled
//! ```
//!
//! `completed` and `cancelled` are terminal. An item is `matching` while a
//! transaction holds it and returns to `listing` when that transaction is
//! cancelled.

pub mod cli;
pub mod config;
pub mod core;
pub mod gateway;
pub mod io;
pub mod replay;
pub mod store;
pub mod types;

pub use crate::config::EscrowConfig;
pub use crate::core::{EscrowContext, RatingLedger, StalenessReaper, TransactionEngine, WebhookReconciler};
pub use io::write_transactions_csv;
pub use replay::ScenarioReplay;
pub use types::{
    EscrowError, Item, ItemStatus, Role, Transaction, TransactionId, TransactionStatus, User,
};
