//! In-process document store backed by DashMap
//!
//! `MemoryStore` keeps every collection in its own `DashMap`, so reads of
//! different documents never block each other. Commits take a single commit
//! lock while they validate every precondition and apply the writes, which
//! makes a batch atomic with respect to every other batch.
//!
//! Reads do not take the commit lock. A reader may observe a batch half
//! applied, but any decision based on such a read is committed against the
//! versions it saw and is rejected with `Contention` if they moved.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{
    Document, DocumentKey, DocumentStore, Precondition, Version, Versioned, WriteBatch,
    MAX_BATCH_WRITES,
};
use crate::types::{
    EscrowError, Item, ItemId, Transaction, TransactionId, TransactionStatus, User, UserId,
};

/// Thread-safe in-memory document store
#[derive(Debug)]
pub struct MemoryStore {
    items: DashMap<ItemId, Versioned<Item>>,
    transactions: DashMap<TransactionId, Versioned<Transaction>>,
    users: DashMap<UserId, Versioned<User>>,

    /// Rate-log entries keyed by (user, action)
    rate_log: DashMap<(UserId, String), Vec<DateTime<Utc>>>,

    /// Serializes commits so a batch is validated and applied as one unit
    commit_lock: Mutex<()>,

    max_batch_size: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_batch_size(MAX_BATCH_WRITES)
    }

    /// Create a store that rejects batches above `max_batch_size` writes
    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            items: DashMap::new(),
            transactions: DashMap::new(),
            users: DashMap::new(),
            rate_log: DashMap::new(),
            commit_lock: Mutex::new(()),
            max_batch_size: max_batch_size.max(2),
        }
    }

    /// Seed an item, bypassing preconditions
    pub fn insert_item(&self, item: Item) {
        let version = self.items.get(&item.id).map(|v| v.version).unwrap_or(0) + 1;
        self.items
            .insert(item.id.clone(), Versioned { version, value: item });
    }

    /// Seed a user, bypassing preconditions
    pub fn insert_user(&self, user: User) {
        let version = self.users.get(&user.id).map(|v| v.version).unwrap_or(0) + 1;
        self.users
            .insert(user.id.clone(), Versioned { version, value: user });
    }

    /// Seed a transaction, bypassing preconditions
    pub fn insert_transaction(&self, tx: Transaction) {
        let version = self
            .transactions
            .get(&tx.id)
            .map(|v| v.version)
            .unwrap_or(0)
            + 1;
        self.transactions
            .insert(tx.id.clone(), Versioned { version, value: tx });
    }

    fn current_version(&self, key: &DocumentKey) -> Option<Version> {
        match key {
            DocumentKey::Item(id) => self.items.get(id).map(|v| v.version),
            DocumentKey::Transaction(id) => self.transactions.get(id).map(|v| v.version),
            DocumentKey::User(id) => self.users.get(id).map(|v| v.version),
        }
    }

    fn check(&self, key: &DocumentKey, precondition: Precondition) -> bool {
        match (precondition, self.current_version(key)) {
            (Precondition::None, _) => true,
            (Precondition::Absent, current) => current.is_none(),
            (Precondition::Version(expected), Some(current)) => expected == current,
            (Precondition::Version(_), None) => false,
        }
    }

    fn apply(&self, document: Document) {
        match document {
            Document::Item(item) => self.insert_item(item),
            Document::Transaction(tx) => self.insert_transaction(tx),
            Document::User(user) => self.insert_user(user),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_item(&self, id: &str) -> Result<Option<Versioned<Item>>, EscrowError> {
        Ok(self.items.get(id).map(|entry| entry.value().clone()))
    }

    async fn get_transaction(
        &self,
        id: &str,
    ) -> Result<Option<Versioned<Transaction>>, EscrowError> {
        Ok(self.transactions.get(id).map(|entry| entry.value().clone()))
    }

    async fn get_user(&self, id: &str) -> Result<Option<Versioned<User>>, EscrowError> {
        Ok(self.users.get(id).map(|entry| entry.value().clone()))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), EscrowError> {
        if batch.len() > self.max_batch_size {
            return Err(EscrowError::invalid_argument(format!(
                "batch of {} writes exceeds the limit of {}",
                batch.len(),
                self.max_batch_size
            )));
        }

        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| EscrowError::internal("store commit lock poisoned"))?;

        // Validate every precondition before touching anything
        for write in batch.writes() {
            let key = write.document.key();
            if !self.check(&key, write.precondition) {
                return Err(EscrowError::contention(key.to_string()));
            }
        }

        for write in batch.writes {
            self.apply(write.document);
        }

        Ok(())
    }

    async fn stale_transactions(
        &self,
        statuses: &[TransactionStatus],
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Versioned<Transaction>>, EscrowError> {
        let mut stale: Vec<Versioned<Transaction>> = self
            .transactions
            .iter()
            .filter(|entry| {
                let tx = &entry.value().value;
                statuses.contains(&tx.status) && tx.updated_at < updated_before
            })
            .map(|entry| entry.value().clone())
            .collect();

        stale.sort_by(|a, b| {
            a.value
                .updated_at
                .cmp(&b.value.updated_at)
                .then_with(|| a.value.id.cmp(&b.value.id))
        });
        stale.truncate(limit);

        Ok(stale)
    }

    async fn list_transactions(&self) -> Result<Vec<Versioned<Transaction>>, EscrowError> {
        Ok(self
            .transactions
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn count_rate_events(
        &self,
        user: &str,
        action: &str,
        since: DateTime<Utc>,
    ) -> Result<usize, EscrowError> {
        let key = (user.to_string(), action.to_string());
        Ok(self
            .rate_log
            .get(&key)
            .map(|entries| entries.iter().filter(|at| **at >= since).count())
            .unwrap_or(0))
    }

    async fn record_rate_event_within(
        &self,
        user: &str,
        action: &str,
        since: DateTime<Utc>,
        limit: usize,
        at: DateTime<Utc>,
    ) -> Result<usize, EscrowError> {
        // The entry guard holds the shard lock across the count and the push
        let mut entries = self
            .rate_log
            .entry((user.to_string(), action.to_string()))
            .or_default();
        let recent = entries.iter().filter(|t| **t >= since).count();
        if recent < limit {
            entries.push(at);
        }
        Ok(recent)
    }

    async fn record_rate_event(
        &self,
        user: &str,
        action: &str,
        at: DateTime<Utc>,
    ) -> Result<(), EscrowError> {
        self.rate_log
            .entry((user.to_string(), action.to_string()))
            .or_default()
            .push(at);
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}
