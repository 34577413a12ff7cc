//! Escrow ledger: one account per order, keyed by order id, plus the
//! payment references issued at checkout.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::error::EscrowError;
use super::state::EscrowAccount;
use crate::Amount;
use crate::model::OrderId;

#[derive(Debug, Default)]
pub struct EscrowLedger {
    accounts: HashMap<OrderId, EscrowAccount>,
    /// Payment reference -> order, registered at checkout.
    references: HashMap<String, OrderId>,
}

impl EscrowLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a payment reference for an order.
    pub fn register_reference(
        &mut self,
        reference: String,
        order: OrderId,
    ) -> Result<(), EscrowError> {
        match self.references.get(&reference) {
            Some(existing) if *existing != order => Err(EscrowError::ReferenceInUse(reference)),
            _ => {
                self.references.insert(reference, order);
                Ok(())
            }
        }
    }

    pub fn order_for_reference(&self, reference: &str) -> Option<OrderId> {
        self.references.get(reference).copied()
    }

    pub fn is_captured(&self, order: OrderId) -> bool {
        self.accounts.contains_key(&order)
    }

    /// Record `amount` as held for `order`. Captures at most once per order.
    pub fn capture(
        &mut self,
        order: OrderId,
        reference: &str,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Result<&EscrowAccount, EscrowError> {
        if self.accounts.contains_key(&order) {
            return Err(EscrowError::AlreadyCaptured(order));
        }
        if !amount.is_positive() {
            return Err(EscrowError::NonPositiveAmount(order));
        }

        let account = self
            .accounts
            .entry(order)
            .or_insert_with(|| EscrowAccount::new(order, reference.to_string(), amount, now));
        Ok(&*account)
    }

    /// Pay `amount` (or everything held) to the seller.
    pub fn release(
        &mut self,
        order: OrderId,
        amount: Option<Amount>,
    ) -> Result<Amount, EscrowError> {
        self.account_mut(order)?.release(amount)
    }

    /// Return `amount` (or everything held) to the buyer.
    pub fn refund(
        &mut self,
        order: OrderId,
        amount: Option<Amount>,
    ) -> Result<Amount, EscrowError> {
        self.account_mut(order)?.refund(amount)
    }

    pub fn get(&self, order: OrderId) -> Option<&EscrowAccount> {
        self.accounts.get(&order)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &EscrowAccount> + '_ {
        self.accounts.values()
    }

    pub(crate) fn account_mut(
        &mut self,
        order: OrderId,
    ) -> Result<&mut EscrowAccount, EscrowError> {
        self.accounts
            .get_mut(&order)
            .ok_or(EscrowError::NotFound(order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn captured(order: OrderId, amount: i64) -> EscrowLedger {
        let mut ledger = EscrowLedger::new();
        ledger
            .capture(order, "ESC-1", Amount::from_units(amount), Utc::now())
            .unwrap();
        ledger
    }

    #[test]
    fn capture_once() {
        let mut ledger = captured(1, 983);
        assert_eq!(ledger.get(1).unwrap().held(), Amount::from_units(983));

        let err = ledger
            .capture(1, "ESC-1", Amount::from_units(983), Utc::now())
            .unwrap_err();
        assert_eq!(err, EscrowError::AlreadyCaptured(1));
        assert_eq!(ledger.accounts().count(), 1);
    }

    #[test]
    fn capture_rejects_zero() {
        let mut ledger = EscrowLedger::new();
        let result = ledger.capture(1, "ESC-1", Amount::ZERO, Utc::now());
        assert_eq!(result.unwrap_err(), EscrowError::NonPositiveAmount(1));
        assert!(!ledger.is_captured(1));
    }

    #[test]
    fn release_and_refund_never_exceed_capture() {
        let mut ledger = captured(1, 100);
        ledger.refund(1, Some(Amount::from_units(30))).unwrap();
        ledger.release(1, Some(Amount::from_units(50))).unwrap();

        let err = ledger.refund(1, Some(Amount::from_units(21))).unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientHold { .. }));

        let account = ledger.get(1).unwrap();
        assert!(account.released + account.refunded <= account.captured);
        assert_eq!(account.held(), Amount::from_units(20));
    }

    #[test]
    fn unknown_order() {
        let mut ledger = EscrowLedger::new();
        assert_eq!(ledger.release(9, None), Err(EscrowError::NotFound(9)));
    }

    #[test]
    fn references_are_unique_per_order() {
        let mut ledger = EscrowLedger::new();
        ledger.register_reference("ESC-000001".into(), 1).unwrap();
        // same order again is fine
        ledger.register_reference("ESC-000001".into(), 1).unwrap();

        let err = ledger.register_reference("ESC-000001".into(), 2).unwrap_err();
        assert_eq!(err, EscrowError::ReferenceInUse("ESC-000001".into()));
        assert_eq!(ledger.order_for_reference("ESC-000001"), Some(1));
        assert_eq!(ledger.order_for_reference("nope"), None);
    }
}
