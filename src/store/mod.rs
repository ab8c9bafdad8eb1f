//! Document store abstraction
//!
//! The orchestrator treats persistence as an external ACID document store
//! offering two primitives:
//!
//! - versioned reads of individual documents
//! - an atomic, bounded batch commit where every write carries a
//!   [`Precondition`]; if any precondition fails nothing is written
//!
//! Together they form the optimistic-transaction primitive: read the
//! documents, decide, then commit conditioned on the versions that were read.
//! A concurrent writer makes the commit fail with
//! [`EscrowError::Contention`] and the caller re-reads and decides again.
//!
//! - [`memory`] - In-process implementation backed by DashMap

pub mod memory;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{
    EscrowError, Item, ItemId, Transaction, TransactionId, TransactionStatus, User, UserId,
};

pub use memory::MemoryStore;

/// Maximum number of writes accepted in one atomic batch
pub const MAX_BATCH_WRITES: usize = 500;

/// Monotonic per-document version, starting at 1 on creation
pub type Version = u64;

/// A document together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: Version,
    pub value: T,
}

/// Condition a write requires to hold at commit time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional write
    None,
    /// The document must not exist yet
    Absent,
    /// The document must still be at this version
    Version(Version),
}

/// Key of a document in the store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentKey {
    Item(ItemId),
    Transaction(TransactionId),
    User(UserId),
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKey::Item(id) => write!(f, "items/{}", id),
            DocumentKey::Transaction(id) => write!(f, "transactions/{}", id),
            DocumentKey::User(id) => write!(f, "users/{}", id),
        }
    }
}

/// A document to be written
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Item(Item),
    Transaction(Transaction),
    User(User),
}

impl Document {
    pub fn key(&self) -> DocumentKey {
        match self {
            Document::Item(item) => DocumentKey::Item(item.id.clone()),
            Document::Transaction(tx) => DocumentKey::Transaction(tx.id.clone()),
            Document::User(user) => DocumentKey::User(user.id.clone()),
        }
    }
}

/// A single conditional write
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub document: Document,
    pub precondition: Precondition,
}

/// A set of writes committed atomically
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a write to the batch
    pub fn put(mut self, document: Document, precondition: Precondition) -> Self {
        self.writes.push(Write {
            document,
            precondition,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }
}

/// Trait for the external document store
///
/// Implementations must apply [`DocumentStore::commit`] atomically: either
/// every write lands or none does.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_item(&self, id: &str) -> Result<Option<Versioned<Item>>, EscrowError>;

    async fn get_transaction(&self, id: &str)
        -> Result<Option<Versioned<Transaction>>, EscrowError>;

    async fn get_user(&self, id: &str) -> Result<Option<Versioned<User>>, EscrowError>;

    /// Atomically apply a batch of conditional writes
    ///
    /// # Errors
    ///
    /// * `Contention` - a precondition no longer holds; nothing was written
    /// * `InvalidArgument` - the batch exceeds [`DocumentStore::max_batch_size`]
    async fn commit(&self, batch: WriteBatch) -> Result<(), EscrowError>;

    /// Transactions in one of `statuses` last updated before `updated_before`
    ///
    /// Returns at most `limit` documents, oldest first.
    async fn stale_transactions(
        &self,
        statuses: &[TransactionStatus],
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Versioned<Transaction>>, EscrowError>;

    /// All transactions, in no particular order
    async fn list_transactions(&self) -> Result<Vec<Versioned<Transaction>>, EscrowError>;

    /// Number of rate-log entries for `user` and `action` at or after `since`
    async fn count_rate_events(
        &self,
        user: &str,
        action: &str,
        since: DateTime<Utc>,
    ) -> Result<usize, EscrowError>;

    /// Append a rate-log entry at `at` if fewer than `limit` entries exist at
    /// or after `since`
    ///
    /// The count and the append are one atomic step per `user` and `action`.
    /// Returns the number of entries found before the call; nothing was
    /// written when it is `limit` or more.
    async fn record_rate_event_within(
        &self,
        user: &str,
        action: &str,
        since: DateTime<Utc>,
        limit: usize,
        at: DateTime<Utc>,
    ) -> Result<usize, EscrowError>;

    /// Append a rate-log entry
    async fn record_rate_event(
        &self,
        user: &str,
        action: &str,
        at: DateTime<Utc>,
    ) -> Result<(), EscrowError>;

    fn max_batch_size(&self) -> usize {
        MAX_BATCH_WRITES
    }
}

/// Read an item, failing with `NotFound` if it does not exist
pub async fn require_item(
    store: &dyn DocumentStore,
    id: &str,
) -> Result<Versioned<Item>, EscrowError> {
    store
        .get_item(id)
        .await?
        .ok_or_else(|| EscrowError::not_found("item", id))
}

/// Read a transaction, failing with `NotFound` if it does not exist
pub async fn require_transaction(
    store: &dyn DocumentStore,
    id: &str,
) -> Result<Versioned<Transaction>, EscrowError> {
    store
        .get_transaction(id)
        .await?
        .ok_or_else(|| EscrowError::not_found("transaction", id))
}

/// Read a user, failing with `NotFound` if it does not exist
pub async fn require_user(
    store: &dyn DocumentStore,
    id: &str,
) -> Result<Versioned<User>, EscrowError> {
    store
        .get_user(id)
        .await?
        .ok_or_else(|| EscrowError::not_found("user", id))
}

/// Run one read-decide-commit `attempt` until it stops losing races
///
/// `attempt` must re-read everything it depends on each time it is called.
/// Only [`EscrowError::Contention`] is retried; every other outcome is
/// returned as is. After `max_attempts` contended attempts the operation
/// fails with `Internal`.
pub async fn run_optimistic<T, F, Fut>(
    operation: &str,
    max_attempts: u32,
    mut attempt: F,
) -> Result<T, EscrowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EscrowError>>,
{
    let max_attempts = max_attempts.max(1);

    for n in 1..=max_attempts {
        match attempt().await {
            Err(EscrowError::Contention { document }) => {
                debug!(operation, attempt = n, %document, "optimistic commit contended, retrying");
            }
            other => return other,
        }
    }

    Err(EscrowError::internal(format!(
        "{} still contended after {} attempts",
        operation, max_attempts
    )))
}
