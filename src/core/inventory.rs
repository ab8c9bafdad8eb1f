//! Inventory Lock Manager
//!
//! Couples transaction creation with item locking. `reserve` reads the item,
//! checks it is still listed, and commits the new transaction together with
//! the item's `matching` status in one preconditioned batch. Two buyers racing
//! for the same item can never both win: the loser's commit is rejected, it
//! re-reads the item, finds it `matching`, and reports `Conflict`.
//!
//! Every other writer of `Item.status` goes through [`stage_release`] or
//! [`stage_sold`], which add the item write to the caller's own batch so the
//! item and transaction change together.

use std::sync::Arc;

use tracing::{debug, info};

use crate::store::{
    require_item, run_optimistic, Document, Precondition, Versioned, WriteBatch,
};
use crate::types::{EscrowError, Item, ItemStatus, Transaction};

use super::context::EscrowContext;

/// Add an item release (`matching -> listing`) to `batch`
///
/// Items not in `matching` are left untouched, so releasing an already
/// listed item is a no-op and a sold item is never relisted.
pub fn stage_release(batch: WriteBatch, item: &Versioned<Item>) -> WriteBatch {
    if item.value.status != ItemStatus::Matching {
        return batch;
    }

    let mut released = item.value.clone();
    released.status = ItemStatus::Listing;
    batch.put(Document::Item(released), Precondition::Version(item.version))
}

/// Add a `matching -> sold` transition to `batch`
pub fn stage_sold(batch: WriteBatch, item: &Versioned<Item>) -> WriteBatch {
    if item.value.status != ItemStatus::Matching {
        return batch;
    }

    let mut sold = item.value.clone();
    sold.status = ItemStatus::Sold;
    batch.put(Document::Item(sold), Precondition::Version(item.version))
}

/// Atomic item reservation and release
#[derive(Debug, Clone)]
pub struct InventoryLock {
    ctx: Arc<EscrowContext>,
}

impl InventoryLock {
    pub fn new(ctx: Arc<EscrowContext>) -> Self {
        Self { ctx }
    }

    /// Reserve `item_id` for `buyer_id`, creating a `request_sent` transaction
    ///
    /// # Returns
    ///
    /// * `Ok(Transaction)` - the newly created transaction
    /// * `Err(EscrowError::Conflict)` - the item is no longer available
    /// * `Err(EscrowError::NotFound)` - the item does not exist
    /// * `Err(EscrowError::PreconditionFailed)` - `seller_id` does not own the
    ///   item, or buyer and seller are the same while self-trade is disabled
    pub async fn reserve(
        &self,
        item_id: &str,
        buyer_id: &str,
        seller_id: &str,
    ) -> Result<Transaction, EscrowError> {
        if buyer_id == seller_id && !self.ctx.config.allow_self_trade {
            return Err(EscrowError::precondition_failed(
                "request purchase",
                "buyers cannot purchase their own listing",
            ));
        }

        let transaction_id = self.ctx.ids.next_transaction_id();
        let tx_id = transaction_id.as_str();

        let tx = run_optimistic("reserve", self.ctx.config.max_commit_attempts, move || {
            self.try_reserve(item_id, buyer_id, seller_id, tx_id)
        })
        .await?;

        info!(
            transaction = %tx.id,
            item = item_id,
            buyer = buyer_id,
            "item reserved"
        );
        Ok(tx)
    }

    async fn try_reserve(
        &self,
        item_id: &str,
        buyer_id: &str,
        seller_id: &str,
        tx_id: &str,
    ) -> Result<Transaction, EscrowError> {
        let item = require_item(self.ctx.store.as_ref(), item_id).await?;

        if item.value.seller_id != seller_id {
            return Err(EscrowError::precondition_failed(
                "request purchase",
                format!("item {} is not sold by {}", item_id, seller_id),
            ));
        }

        if !item.value.is_listable() {
            debug!(item = item_id, status = item.value.status.as_str(), "item not listable");
            return Err(EscrowError::conflict(item_id));
        }

        let tx = Transaction::new(tx_id, item_id, buyer_id, seller_id, self.ctx.clock.now());

        let mut locked = item.value.clone();
        locked.status = ItemStatus::Matching;

        let batch = WriteBatch::new()
            .put(Document::Transaction(tx.clone()), Precondition::Absent)
            .put(Document::Item(locked), Precondition::Version(item.version));
        self.ctx.store.commit(batch).await?;

        Ok(tx)
    }

    /// Return an item to `listing`
    ///
    /// A no-op when the item is already listed.
    pub async fn release(&self, item_id: &str) -> Result<(), EscrowError> {
        run_optimistic("release", self.ctx.config.max_commit_attempts, move || async move {
            let item = require_item(self.ctx.store.as_ref(), item_id).await?;
            let batch = stage_release(WriteBatch::new(), &item);
            if batch.is_empty() {
                return Ok(());
            }
            self.ctx.store.commit(batch).await
        })
        .await?;

        info!(item = item_id, "item released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EscrowConfig;
    use crate::core::traits::SequentialIds;
    use crate::gateway::MemoryProcessor;
    use crate::store::{DocumentStore, MemoryStore};
    use crate::types::TransactionStatus;

    fn setup(config: EscrowConfig) -> (Arc<MemoryStore>, InventoryLock) {
        let store = Arc::new(MemoryStore::new());
        store.insert_item(Item::new("book-1", "Discrete Math", 1000, "alice", 4));
        let ctx = EscrowContext::new(store.clone(), Arc::new(MemoryProcessor::new()), config)
            .with_ids(Arc::new(SequentialIds::new()));
        (store, InventoryLock::new(Arc::new(ctx)))
    }

    #[tokio::test]
    async fn test_reserve_locks_item_and_creates_transaction() {
        let (store, lock) = setup(EscrowConfig::default());

        let tx = lock.reserve("book-1", "bob", "alice").await.unwrap();

        assert_eq!(tx.id, "tx-1");
        assert_eq!(tx.status, TransactionStatus::RequestSent);

        let stored = store.get_transaction("tx-1").await.unwrap().unwrap();
        assert_eq!(stored.value, tx);

        let item = store.get_item("book-1").await.unwrap().unwrap();
        assert_eq!(item.value.status, ItemStatus::Matching);
    }

    #[tokio::test]
    async fn test_second_reserve_conflicts() {
        let (store, lock) = setup(EscrowConfig::default());

        lock.reserve("book-1", "bob", "alice").await.unwrap();
        let result = lock.reserve("book-1", "carol", "alice").await;

        assert_eq!(result, Err(EscrowError::conflict("book-1")));
        assert_eq!(store.list_transactions().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserves_have_one_winner() {
        let (store, lock) = setup(EscrowConfig::default());

        let mut handles = Vec::new();
        for buyer in ["bob", "carol", "dave", "erin"] {
            let lock = lock.clone();
            handles.push(tokio::spawn(async move {
                lock.reserve("book-1", buyer, "alice").await
            }));
        }

        let mut winners = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(EscrowError::Conflict { .. }) => conflicts += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(conflicts, 3);
        assert_eq!(store.list_transactions().await.unwrap().len(), 1);
        assert_eq!(
            store.get_item("book-1").await.unwrap().unwrap().value.status,
            ItemStatus::Matching
        );
    }

    #[tokio::test]
    async fn test_reserve_rejects_self_trade_by_default() {
        let (_store, lock) = setup(EscrowConfig::default());

        let result = lock.reserve("book-1", "alice", "alice").await;
        assert!(matches!(result, Err(EscrowError::PreconditionFailed { .. })));
    }

    #[tokio::test]
    async fn test_reserve_allows_self_trade_when_enabled() {
        let config = EscrowConfig {
            allow_self_trade: true,
            ..EscrowConfig::default()
        };
        let (_store, lock) = setup(config);

        assert!(lock.reserve("book-1", "alice", "alice").await.is_ok());
    }

    #[tokio::test]
    async fn test_reserve_rejects_wrong_seller() {
        let (_store, lock) = setup(EscrowConfig::default());

        let result = lock.reserve("book-1", "bob", "mallory").await;
        assert!(matches!(result, Err(EscrowError::PreconditionFailed { .. })));
    }

    #[tokio::test]
    async fn test_reserve_missing_item() {
        let (_store, lock) = setup(EscrowConfig::default());

        let result = lock.reserve("nope", "bob", "alice").await;
        assert_eq!(result, Err(EscrowError::not_found("item", "nope")));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (store, lock) = setup(EscrowConfig::default());
        lock.reserve("book-1", "bob", "alice").await.unwrap();

        lock.release("book-1").await.unwrap();
        let after_first = store.get_item("book-1").await.unwrap().unwrap();
        lock.release("book-1").await.unwrap();
        let after_second = store.get_item("book-1").await.unwrap().unwrap();

        assert_eq!(after_first.value.status, ItemStatus::Listing);
        assert_eq!(after_first.version, after_second.version);
    }

    #[test]
    fn test_stage_sold_only_from_matching() {
        let mut item = Item::new("book-1", "t", 100, "alice", 3);
        let listed = Versioned { version: 1, value: item.clone() };
        assert!(stage_sold(WriteBatch::new(), &listed).is_empty());

        item.status = ItemStatus::Matching;
        let matching = Versioned { version: 2, value: item };
        assert_eq!(stage_sold(WriteBatch::new(), &matching).len(), 1);
    }
}
