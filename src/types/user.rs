//! User-related types, limited to what the orchestrator consumes

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// User identifier, as handed over by the authentication layer
pub type UserId = String;

/// Aggregate trust score built from post-completion ratings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingAggregate {
    pub count: u32,
    pub total: u64,
}

impl RatingAggregate {
    /// Average score, or `None` when nobody has rated yet
    pub fn average(&self) -> Option<Decimal> {
        if self.count == 0 {
            return None;
        }
        Some(Decimal::from(self.total) / Decimal::from(self.count))
    }

    pub fn record(&mut self, score: u8) {
        self.count += 1;
        self.total += u64::from(score);
    }
}

/// Access-controlled contact fields, only surfaced through the unlock step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateContact {
    pub student_id: String,
    pub email: String,
}

/// A marketplace user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,

    /// Whether the campus identity has been verified
    pub verified: bool,

    /// Connected sub-account at the payment processor
    pub payout_account: Option<String>,

    /// Whether the processor allows charges destined to this user
    pub charges_enabled: bool,

    pub rating: RatingAggregate,

    pub contact: PrivateContact,
}

impl User {
    pub fn new(id: impl Into<UserId>, contact: PrivateContact) -> Self {
        User {
            id: id.into(),
            verified: false,
            payout_account: None,
            charges_enabled: false,
            rating: RatingAggregate::default(),
            contact,
        }
    }

    /// Destination account for payment intents, if this user can receive them
    ///
    /// A user can only receive funds when the processor reports charges as
    /// enabled *and* a sub-account reference exists.
    pub fn payment_destination(&self) -> Option<&str> {
        if self.charges_enabled {
            self.payout_account.as_deref()
        } else {
            None
        }
    }
}
