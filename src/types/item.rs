//! Item-related types for the campus escrow orchestrator
//!
//! An item is a listing put up by a seller. Its `status` field is the single
//! shared mutable resource that needs mutual exclusion: only the inventory
//! lock manager and the staleness reaper ever write it.

use serde::{Deserialize, Serialize};

use super::{ItemId, UserId};

/// Listing status of an item
///
/// Transitions are restricted to:
/// - `Listing -> Matching` when a transaction reserves the item
/// - `Matching -> Listing` when that transaction is cancelled
/// - `Matching -> Sold` on completion (only when enabled in the config)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Visible and available for a purchase request
    Listing,

    /// Reserved by exactly one active transaction
    Matching,

    /// Handed over to a buyer
    Sold,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Listing => "listing",
            ItemStatus::Matching => "matching",
            ItemStatus::Sold => "sold",
        }
    }
}

/// A marketplace listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,

    pub title: String,

    /// Price in the smallest currency unit. Always positive.
    ///
    /// This is the authoritative price used for fee calculation; client
    /// supplied amounts are never trusted.
    pub price: i64,

    pub seller_id: UserId,

    pub status: ItemStatus,

    /// Condition score from 1 (poor) to 5 (like new)
    pub condition: u8,
}

impl Item {
    /// Create a new item in `Listing` status
    pub fn new(
        id: impl Into<ItemId>,
        title: impl Into<String>,
        price: i64,
        seller_id: impl Into<UserId>,
        condition: u8,
    ) -> Self {
        Item {
            id: id.into(),
            title: title.into(),
            price,
            seller_id: seller_id.into(),
            status: ItemStatus::Listing,
            condition: condition.clamp(1, 5),
        }
    }

    pub fn is_listable(&self) -> bool {
        self.status == ItemStatus::Listing
    }
}
