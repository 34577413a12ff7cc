use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::EscrowError;
use crate::Amount;
use crate::model::OrderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    Held,
    Disputed,
    Released,
    Refunded,
    PartiallyRefunded,
}

/// Funds captured for one order, and where they went.
///
/// `released + refunded <= captured` holds after every operation.
#[derive(Debug, Clone, PartialEq)]
pub struct EscrowAccount {
    pub order: OrderId,
    pub reference: String,
    pub captured: Amount,
    pub released: Amount,
    pub refunded: Amount,
    pub disputed: bool,
    pub captured_at: DateTime<Utc>,
    /// Set once the order is delivered.
    pub auto_release_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl EscrowAccount {
    pub fn new(order: OrderId, reference: String, captured: Amount, now: DateTime<Utc>) -> Self {
        Self {
            order,
            reference,
            captured,
            released: Amount::ZERO,
            refunded: Amount::ZERO,
            disputed: false,
            captured_at: now,
            auto_release_at: None,
            version: 0,
        }
    }

    pub fn held(&self) -> Amount {
        self.captured - self.released - self.refunded
    }

    pub fn status(&self) -> EscrowStatus {
        if self.held().is_positive() {
            if self.disputed {
                EscrowStatus::Disputed
            } else {
                EscrowStatus::Held
            }
        } else if self.refunded == self.captured {
            EscrowStatus::Refunded
        } else if self.refunded.is_positive() {
            EscrowStatus::PartiallyRefunded
        } else {
            EscrowStatus::Released
        }
    }

    /// Resolve `None` to the whole held balance and check it can be paid out.
    pub fn payable(&self, amount: Option<Amount>) -> Result<Amount, EscrowError> {
        let amount = amount.unwrap_or_else(|| self.held());
        if !amount.is_positive() {
            return Err(EscrowError::NonPositiveAmount(self.order));
        }
        if amount > self.held() {
            return Err(EscrowError::InsufficientHold {
                order: self.order,
                requested: amount,
                held: self.held(),
            });
        }
        Ok(amount)
    }

    /// Pay `amount` (or everything held) to the seller.
    pub fn release(&mut self, amount: Option<Amount>) -> Result<Amount, EscrowError> {
        let amount = self.payable(amount)?;
        self.released += amount;
        self.version += 1;
        Ok(amount)
    }

    /// Return `amount` (or everything held) to the buyer.
    pub fn refund(&mut self, amount: Option<Amount>) -> Result<Amount, EscrowError> {
        let amount = self.payable(amount)?;
        self.refunded += amount;
        self.version += 1;
        Ok(amount)
    }

    pub fn set_disputed(&mut self, disputed: bool) {
        self.disputed = disputed;
        self.version += 1;
    }
}
