//! Rating Ledger
//!
//! After a completed trade each side may rate the other exactly once. The
//! counterparty's aggregate and the rater's `*_rated` flag are written in one
//! preconditioned batch, so a rating is either fully recorded or not at all.
//!
//! The rater states their role explicitly; it is never inferred from the
//! caller id, because with self-trade enabled buyer and seller may be the
//! same user.

use std::sync::Arc;

use tracing::info;

use crate::store::{
    require_transaction, require_user, run_optimistic, Document, Precondition, WriteBatch,
};
use crate::types::{EscrowError, Role, Transaction, TransactionStatus};

use super::context::EscrowContext;

pub const MIN_SCORE: u8 = 1;
pub const MAX_SCORE: u8 = 5;

#[derive(Debug, Clone)]
pub struct RatingLedger {
    ctx: Arc<EscrowContext>,
}

impl RatingLedger {
    pub fn new(ctx: Arc<EscrowContext>) -> Self {
        Self { ctx }
    }

    /// Rate the counterparty of `role` on a completed transaction
    ///
    /// # Arguments
    ///
    /// * `transaction_id` - The completed transaction
    /// * `rater` - Caller identity; must be the participant playing `role`
    /// * `role` - The side the rater played
    /// * `score` - 1 to 5
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The score is out of range (`InvalidArgument`)
    /// - The transaction is not `completed` (`PreconditionFailed`)
    /// - The rater did not play `role` (`PermissionDenied`)
    /// - This side already rated (`AlreadyExists`)
    pub async fn rate(
        &self,
        transaction_id: &str,
        rater: &str,
        role: Role,
        score: u8,
    ) -> Result<Transaction, EscrowError> {
        if !(MIN_SCORE..=MAX_SCORE).contains(&score) {
            return Err(EscrowError::invalid_argument(format!(
                "rating score must be between {} and {}, got {}",
                MIN_SCORE, MAX_SCORE, score
            )));
        }

        let tx = run_optimistic("rate", self.ctx.config.max_commit_attempts, move || {
            self.try_rate(transaction_id, rater, role, score)
        })
        .await?;

        info!(
            transaction = transaction_id,
            rater,
            role = role.as_str(),
            score,
            "rating recorded"
        );
        Ok(tx)
    }

    async fn try_rate(
        &self,
        transaction_id: &str,
        rater: &str,
        role: Role,
        score: u8,
    ) -> Result<Transaction, EscrowError> {
        let store = self.ctx.store.as_ref();
        let current = require_transaction(store, transaction_id).await?;
        let tx = &current.value;

        if tx.status != TransactionStatus::Completed {
            return Err(EscrowError::precondition_failed(
                "rate",
                format!("transaction {} is {}", transaction_id, tx.status),
            ));
        }
        if tx.participant(role) != rater {
            return Err(EscrowError::permission_denied(rater, "rate"));
        }
        if tx.has_rated(role) {
            return Err(EscrowError::already_exists(transaction_id, role.as_str()));
        }

        let target_id = tx.participant(role.counterparty());
        let target = require_user(store, target_id).await?;

        let mut rated_user = target.value.clone();
        rated_user.rating.record(score);

        let mut next = tx.clone();
        match role {
            Role::Buyer => next.buyer_rated = true,
            Role::Seller => next.seller_rated = true,
        }

        let batch = WriteBatch::new()
            .put(
                Document::Transaction(next.clone()),
                Precondition::Version(current.version),
            )
            .put(
                Document::User(rated_user),
                Precondition::Version(target.version),
            );
        store.commit(batch).await?;

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EscrowConfig;
    use crate::gateway::MemoryProcessor;
    use crate::store::{DocumentStore, MemoryStore};
    use crate::types::{PrivateContact, User};
    use chrono::Utc;
    use rstest::rstest;
    use rust_decimal::Decimal;

    fn contact(id: &str) -> PrivateContact {
        PrivateContact {
            student_id: format!("S-{}", id),
            email: format!("{}@campus.edu", id),
        }
    }

    fn setup(buyer: &str, seller: &str, status: TransactionStatus) -> (Arc<MemoryStore>, RatingLedger) {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(User::new(buyer, contact(buyer)));
        store.insert_user(User::new(seller, contact(seller)));

        let mut tx = Transaction::new("tx-1", "book-1", buyer, seller, Utc::now());
        tx.status = status;
        store.insert_transaction(tx);

        let ctx = EscrowContext::new(
            store.clone(),
            Arc::new(MemoryProcessor::new()),
            EscrowConfig::default(),
        );
        (store, RatingLedger::new(Arc::new(ctx)))
    }

    #[tokio::test]
    async fn test_buyer_rates_seller() {
        let (store, ledger) = setup("bob", "alice", TransactionStatus::Completed);

        let tx = ledger.rate("tx-1", "bob", Role::Buyer, 4).await.unwrap();

        assert!(tx.buyer_rated);
        assert!(!tx.seller_rated);
        let alice = store.get_user("alice").await.unwrap().unwrap().value;
        assert_eq!(alice.rating.count, 1);
        assert_eq!(alice.rating.total, 4);
        let bob = store.get_user("bob").await.unwrap().unwrap().value;
        assert_eq!(bob.rating.count, 0);
    }

    #[tokio::test]
    async fn test_rating_twice_already_exists() {
        let (_store, ledger) = setup("bob", "alice", TransactionStatus::Completed);

        ledger.rate("tx-1", "bob", Role::Buyer, 4).await.unwrap();
        let result = ledger.rate("tx-1", "bob", Role::Buyer, 5).await;

        assert_eq!(result, Err(EscrowError::already_exists("tx-1", "buyer")));
    }

    #[rstest]
    #[case::request_sent(TransactionStatus::RequestSent)]
    #[case::approved(TransactionStatus::Approved)]
    #[case::payment_pending(TransactionStatus::PaymentPending)]
    #[case::cancelled(TransactionStatus::Cancelled)]
    #[tokio::test]
    async fn test_rating_requires_completion(#[case] status: TransactionStatus) {
        let (_store, ledger) = setup("bob", "alice", status);

        let result = ledger.rate("tx-1", "bob", Role::Buyer, 4).await;
        assert!(matches!(result, Err(EscrowError::PreconditionFailed { .. })));
    }

    #[rstest]
    #[case::zero(0)]
    #[case::six(6)]
    #[tokio::test]
    async fn test_score_out_of_range(#[case] score: u8) {
        let (_store, ledger) = setup("bob", "alice", TransactionStatus::Completed);

        let result = ledger.rate("tx-1", "bob", Role::Buyer, score).await;
        assert!(matches!(result, Err(EscrowError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn test_rater_must_play_role() {
        let (_store, ledger) = setup("bob", "alice", TransactionStatus::Completed);

        assert_eq!(
            ledger.rate("tx-1", "alice", Role::Buyer, 4).await,
            Err(EscrowError::permission_denied("alice", "rate"))
        );
        assert_eq!(
            ledger.rate("tx-1", "mallory", Role::Seller, 4).await,
            Err(EscrowError::permission_denied("mallory", "rate"))
        );
    }

    #[tokio::test]
    async fn test_self_trade_rates_each_role_once() {
        let (store, ledger) = setup("alice", "alice", TransactionStatus::Completed);

        ledger.rate("tx-1", "alice", Role::Buyer, 5).await.unwrap();
        let tx = ledger.rate("tx-1", "alice", Role::Seller, 3).await.unwrap();

        assert!(tx.buyer_rated && tx.seller_rated);
        let alice = store.get_user("alice").await.unwrap().unwrap().value;
        assert_eq!(alice.rating.count, 2);
        assert_eq!(alice.rating.average(), Some(Decimal::from(4)));
    }

    #[tokio::test]
    async fn test_average_over_many_transactions() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(User::new("alice", contact("alice")));
        let scores = [5u8, 4, 2];
        for (n, _) in scores.iter().enumerate() {
            let buyer = format!("buyer-{}", n);
            store.insert_user(User::new(buyer.as_str(), contact(&buyer)));
            let mut tx = Transaction::new(
                format!("tx-{}", n),
                "book-1",
                buyer.as_str(),
                "alice",
                Utc::now(),
            );
            tx.status = TransactionStatus::Completed;
            store.insert_transaction(tx);
        }
        let ctx = EscrowContext::new(
            store.clone(),
            Arc::new(MemoryProcessor::new()),
            EscrowConfig::default(),
        );
        let ledger = RatingLedger::new(Arc::new(ctx));

        for (n, score) in scores.iter().enumerate() {
            ledger
                .rate(&format!("tx-{}", n), &format!("buyer-{}", n), Role::Buyer, *score)
                .await
                .unwrap();
        }

        let alice = store.get_user("alice").await.unwrap().unwrap().value;
        assert_eq!(alice.rating.count, 3);
        assert_eq!(alice.rating.total, 11);
        assert_eq!(alice.rating.average(), Some(Decimal::from(11) / Decimal::from(3)));
    }
}
