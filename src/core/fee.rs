//! Platform fee policy
//!
//! Pure functions, no side effects and no failure modes. Always call them
//! with the authoritative item price read from the store.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Default fee rate (10%)
pub const FEE_RATE: Decimal = Decimal::from_parts(10, 0, 0, false, 2);

/// Minimum fee in the smallest currency unit
pub const MIN_FEE: i64 = 50;

/// Platform fee for `amount` with the default rate and minimum
///
/// Returns 0 for non-positive amounts, otherwise
/// `max(floor(amount * 0.10), 50)`.
pub fn fee(amount: i64) -> i64 {
    fee_with(amount, FEE_RATE, MIN_FEE)
}

/// Platform fee for `amount` with an explicit rate and minimum
pub fn fee_with(amount: i64, rate: Decimal, min_fee: i64) -> i64 {
    if amount <= 0 {
        return 0;
    }

    let proportional = (Decimal::from(amount) * rate)
        .floor()
        .to_i64()
        .unwrap_or(i64::MAX);

    proportional.max(min_fee)
}
