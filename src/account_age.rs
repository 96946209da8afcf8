//! Delayed payout schedule based on the buyer's payment account age.
//!
//! A fresh account on a chargeback-prone payment method gets the full
//! [`MAX_PAYOUT_DELAY`]; the delay shrinks linearly until the account reaches
//! the method's required age.
use std::time::Duration;

use crate::offer::{ChargebackRisk, PaymentMethod};
use crate::types::Direction;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

pub const MAX_PAYOUT_DELAY: Duration = Duration::from_millis(28 * DAY_MS);

pub fn required_account_age(method: PaymentMethod) -> Duration {
    match method.chargeback_risk() {
        ChargebackRisk::VeryLow | ChargebackRisk::Low => Duration::ZERO,
        ChargebackRisk::Moderate => Duration::from_millis(21 * DAY_MS),
        ChargebackRisk::High => Duration::from_millis(42 * DAY_MS),
    }
}

/// `MAX_PAYOUT_DELAY * (required - age) / required`, rounded down to the ms.
pub fn linear_delay(account_age: Duration, required_age: Duration) -> Duration {
    let required = required_age.as_millis();
    let age = account_age.as_millis();
    if required == 0 || age >= required {
        return Duration::ZERO;
    }
    let delay = MAX_PAYOUT_DELAY.as_millis() * (required - age) / required;
    Duration::from_millis(u64::try_from(delay).unwrap_or(u64::MAX))
}

/// Delay applied to the buyer's payout for an offer.
///
/// `offer_direction` is the maker's side. Sell offers and crypto trades never
/// delay; a missing witness counts as a brand new account.
pub fn payout_delay(
    offer_direction: Direction,
    method: PaymentMethod,
    buyer_account_age: Option<Duration>,
) -> Duration {
    if offer_direction == Direction::Sell || method.is_crypto() {
        return Duration::ZERO;
    }
    linear_delay(buyer_account_age.unwrap_or_default(), required_account_age(method))
}
