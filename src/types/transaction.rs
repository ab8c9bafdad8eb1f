//! Transaction-related types for the campus escrow orchestrator
//!
//! This module defines the purchase transaction document, its lifecycle
//! states, and the contact record revealed to the buyer on completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ItemId, UserId};

/// Transaction identifier
pub type TransactionId = String;

/// Lifecycle state of a purchase transaction
///
/// ```text
/// request_sent -> approved -> payment_pending -> completed
///       \            |              /
///        `------> cancelled <------'
/// ```
///
/// `Completed` and `Cancelled` are terminal: once reached, the status never
/// changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Buyer asked for the item; the item is locked in `matching`
    RequestSent,

    /// Seller accepted the request
    Approved,

    /// Authorization hold placed on the buyer's payment method
    PaymentPending,

    /// Funds captured and seller contact unlocked
    Completed,

    /// Abandoned, declined, or force-cancelled
    Cancelled,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::RequestSent => "request_sent",
            TransactionStatus::Approved => "approved",
            TransactionStatus::PaymentPending => "payment_pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a transaction a participant is acting as
///
/// Passed explicitly wherever it matters, because buyer and seller may be the
/// same identity in a self-trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Buyer,
    Seller,
}

impl Role {
    pub fn counterparty(&self) -> Role {
        match self {
            Role::Buyer => Role::Seller,
            Role::Seller => Role::Buyer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Buyer => "buyer",
            Role::Seller => "seller",
        }
    }
}

/// Seller contact details copied into the transaction on completion
///
/// Present if and only if the transaction is `Completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockedAssets {
    pub seller_student_id: String,
    pub seller_email: String,
    pub unlocked_at: DateTime<Utc>,
}

/// A purchase transaction document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,

    pub item_id: ItemId,

    pub buyer_id: UserId,

    pub seller_id: UserId,

    pub status: TransactionStatus,

    /// Platform fee in the smallest currency unit, resolved at completion
    pub fee_amount: Option<i64>,

    /// External payment intent handle
    ///
    /// Immutable once set: the hold is created with an idempotency key derived
    /// from the transaction id, so a retry can never issue a second intent.
    pub payment_intent_id: Option<String>,

    pub unlocked_assets: Option<UnlockedAssets>,

    pub meeting_place: Option<String>,

    pub buyer_rated: bool,

    pub seller_rated: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Create a fresh transaction in `RequestSent`
    pub fn new(
        id: impl Into<TransactionId>,
        item_id: impl Into<ItemId>,
        buyer_id: impl Into<UserId>,
        seller_id: impl Into<UserId>,
        now: DateTime<Utc>,
    ) -> Self {
        Transaction {
            id: id.into(),
            item_id: item_id.into(),
            buyer_id: buyer_id.into(),
            seller_id: seller_id.into(),
            status: TransactionStatus::RequestSent,
            fee_amount: None,
            payment_intent_id: None,
            unlocked_assets: None,
            meeting_place: None,
            buyer_rated: false,
            seller_rated: false,
            created_at: now,
            updated_at: now,
            cancelled_at: None,
        }
    }

    /// Identity acting as `role` in this transaction
    pub fn participant(&self, role: Role) -> &UserId {
        match role {
            Role::Buyer => &self.buyer_id,
            Role::Seller => &self.seller_id,
        }
    }

    pub fn is_participant(&self, user: &str) -> bool {
        self.buyer_id == user || self.seller_id == user
    }

    pub fn has_rated(&self, role: Role) -> bool {
        match role {
            Role::Buyer => self.buyer_rated,
            Role::Seller => self.seller_rated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample() -> Transaction {
        Transaction::new("tx-1", "book-1", "bob", "alice", Utc::now())
    }

    #[test]
    fn test_new_transaction_defaults() {
        let tx = sample();

        assert_eq!(tx.status, TransactionStatus::RequestSent);
        assert!(tx.payment_intent_id.is_none());
        assert!(tx.unlocked_assets.is_none());
        assert!(!tx.buyer_rated);
        assert!(!tx.seller_rated);
        assert_eq!(tx.created_at, tx.updated_at);
    }

    #[rstest]
    #[case(TransactionStatus::RequestSent, false)]
    #[case(TransactionStatus::Approved, false)]
    #[case(TransactionStatus::PaymentPending, false)]
    #[case(TransactionStatus::Completed, true)]
    #[case(TransactionStatus::Cancelled, true)]
    fn test_is_terminal(#[case] status: TransactionStatus, #[case] terminal: bool) {
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn test_participant_lookup() {
        let tx = sample();

        assert_eq!(tx.participant(Role::Buyer), "bob");
        assert_eq!(tx.participant(Role::Seller), "alice");
        assert!(tx.is_participant("bob"));
        assert!(!tx.is_participant("mallory"));
    }

    #[test]
    fn test_role_counterparty() {
        assert_eq!(Role::Buyer.counterparty(), Role::Seller);
        assert_eq!(Role::Seller.counterparty(), Role::Buyer);
    }
}
