//! Types module
//!
//! Contains core data structures used throughout the application.
//! This module organizes types into logical submodules:
//! - `item`: Listings and their lock status
//! - `transaction`: Purchase transactions, lifecycle states and roles
//! - `user`: Users as seen by the orchestrator
//! - `error`: Error types for the escrow orchestrator

pub mod error;
pub mod item;
pub mod transaction;
pub mod user;

/// Item identifier
pub type ItemId = String;

pub use error::{ErrorCode, EscrowError};
pub use item::{Item, ItemStatus};
pub use transaction::{Role, Transaction, TransactionId, TransactionStatus, UnlockedAssets};
pub use user::{PrivateContact, RatingAggregate, User, UserId};
