//! Disputes: raising, responding, admin resolution and withdrawal.
//!
//! Funds stay frozen in escrow while a dispute is open. Resolution moves the
//! order and the escrow together or not at all.

use tracing::info;

use super::{DisputeError, Engine, EngineError, EscrowError, OrderError};
use crate::Amount;
use crate::lifecycle::{self, OrderEvent, OrderStatus, Step};
use crate::model::{
    Context, Dispute, DisputeId, DisputeStatus, OrderId, PaymentStatus, Resolution, Role,
};

impl Engine {
    /// Open a dispute on a paid order. Buyer or seller of the order only.
    pub fn open_dispute(
        &mut self,
        ctx: &Context,
        order_id: OrderId,
        reason: &str,
        evidence: Vec<String>,
    ) -> Result<Dispute, EngineError> {
        self.authorize(ctx)?;
        if reason.trim().is_empty() {
            return Err(DisputeError::EmptyReason.into());
        }

        let order = self
            .orders
            .get(&order_id)
            .ok_or(OrderError::NotFound(order_id))?;
        Self::check_participant(order, ctx)?;
        if let Some(&dispute) = self.open_disputes.get(&order_id) {
            return Err(DisputeError::AlreadyOpen {
                order: order_id,
                dispute,
            }
            .into());
        }
        let from = order.status;
        Self::advance(order_id, from, OrderEvent::RaiseDispute, ctx.actor.role)?;

        if from == OrderStatus::Delivered {
            let deadline = self
                .config
                .dispute_window()
                .zip(order.delivered_at)
                .and_then(|(window, delivered)| delivered.checked_add_signed(window));
            if deadline.is_some_and(|deadline| ctx.now > deadline) {
                return Err(OrderError::DisputeWindowClosed(order_id).into());
            }
        }

        self.ledger.account_mut(order_id)?.set_disputed(true);
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(OrderError::NotFound(order_id))?;
        order.prior_status = Some(from);
        order.status = OrderStatus::Disputed;
        order.version += 1;

        self.last_dispute += 1;
        let dispute = Dispute {
            id: self.last_dispute,
            order: order_id,
            raised_by: ctx.actor,
            reason: reason.trim().to_string(),
            evidence,
            seller_response: None,
            status: DisputeStatus::Open,
            resolution: None,
            resolution_amount: None,
            resolution_notes: None,
            resolved_by: None,
            created_at: ctx.now,
            responded_at: None,
            resolved_at: None,
        };
        self.open_disputes.insert(order_id, dispute.id);
        self.disputes.insert(dispute.id, dispute.clone());
        info!(dispute = dispute.id, order = order_id, %from, "dispute opened");
        Ok(dispute)
    }

    /// The seller's side of the story. Moves the dispute under review.
    pub fn respond_to_dispute(
        &mut self,
        ctx: &Context,
        dispute_id: DisputeId,
        response: &str,
    ) -> Result<Dispute, EngineError> {
        Self::require_role(ctx, Role::Seller)?;
        self.authorize(ctx)?;
        let dispute = self.unsettled(dispute_id)?;
        let order = self
            .orders
            .get(&dispute.order)
            .ok_or(OrderError::NotFound(dispute.order))?;
        Self::check_participant(order, ctx)?;
        if response.trim().is_empty() {
            return Err(DisputeError::EmptyResponse.into());
        }

        let dispute = self
            .disputes
            .get_mut(&dispute_id)
            .ok_or(DisputeError::NotFound(dispute_id))?;
        dispute.seller_response = Some(response.trim().to_string());
        dispute.responded_at = Some(ctx.now);
        dispute.status = DisputeStatus::UnderReview;
        Ok(dispute.clone())
    }

    /// Admin decision on an open dispute.
    ///
    /// `partial_amount` goes back to the buyer and the rest to the seller; it must
    /// lie strictly between zero and the captured amount.
    pub fn resolve_dispute(
        &mut self,
        ctx: &Context,
        dispute_id: DisputeId,
        resolution: Resolution,
        notes: &str,
        partial_amount: Option<Amount>,
    ) -> Result<Dispute, EngineError> {
        Self::require_role(ctx, Role::Admin)?;
        let order_id = self.unsettled(dispute_id)?.order;
        if notes.trim().is_empty() {
            return Err(DisputeError::EmptyNotes.into());
        }

        let event = match resolution {
            Resolution::Refund => OrderEvent::ResolveRefund,
            Resolution::Release => OrderEvent::ResolveRelease,
            Resolution::PartialRefund => OrderEvent::ResolvePartial,
        };
        let status = self
            .orders
            .get(&order_id)
            .ok_or(OrderError::NotFound(order_id))?
            .status;
        let next = Self::advance(order_id, status, event, ctx.actor.role)?;

        // work out both payouts before touching anything
        let account = self
            .ledger
            .get(order_id)
            .ok_or(EscrowError::NotFound(order_id))?;
        let (refund, release) = match resolution {
            Resolution::Refund => (Some(account.payable(None)?), None),
            Resolution::Release => (None, Some(account.payable(None)?)),
            Resolution::PartialRefund => {
                let amount = partial_amount.ok_or(DisputeError::MissingPartialAmount)?;
                if !amount.is_positive() || amount >= account.captured {
                    return Err(DisputeError::PartialAmountOutOfRange {
                        amount,
                        captured: account.captured,
                    }
                    .into());
                }
                let refund = account.payable(Some(amount))?;
                let rest = account.held() - refund;
                (Some(refund), rest.is_positive().then_some(rest))
            }
        };

        let account = self.ledger.account_mut(order_id)?;
        if let Some(amount) = refund {
            account.refund(Some(amount))?;
        }
        if let Some(amount) = release {
            account.release(Some(amount))?;
        }
        account.set_disputed(false);

        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(OrderError::NotFound(order_id))?;
        order.status = next;
        order.prior_status = None;
        match next {
            OrderStatus::Refunded => order.payment_status = PaymentStatus::Refunded,
            _ => order.completed_at = Some(ctx.now),
        }
        order.version += 1;

        self.open_disputes.remove(&order_id);
        let dispute = self
            .disputes
            .get_mut(&dispute_id)
            .ok_or(DisputeError::NotFound(dispute_id))?;
        dispute.status = DisputeStatus::Resolved;
        dispute.resolution = Some(resolution);
        dispute.resolution_amount = refund.filter(|_| resolution == Resolution::PartialRefund);
        dispute.resolution_notes = Some(notes.trim().to_string());
        dispute.resolved_by = Some(ctx.actor.id);
        dispute.resolved_at = Some(ctx.now);
        info!(
            dispute = dispute_id,
            order = order_id,
            ?resolution,
            to = %next,
            "dispute resolved"
        );
        Ok(dispute.clone())
    }

    /// Drop a dispute and put the order back where it was. Raiser or admin only.
    pub fn withdraw_dispute(
        &mut self,
        ctx: &Context,
        dispute_id: DisputeId,
    ) -> Result<Dispute, EngineError> {
        self.authorize(ctx)?;
        let dispute = self.unsettled(dispute_id)?;
        if ctx.actor.role != Role::Admin && dispute.raised_by.id != ctx.actor.id {
            return Err(DisputeError::NotRaiser {
                dispute: dispute_id,
                user: ctx.actor.id,
            }
            .into());
        }
        let order_id = dispute.order;

        let order = self
            .orders
            .get(&order_id)
            .ok_or(OrderError::NotFound(order_id))?;
        let resume = order.prior_status.unwrap_or(order.status);
        Self::advance(
            order_id,
            order.status,
            OrderEvent::WithdrawDispute { resume },
            ctx.actor.role,
        )?;

        self.ledger.account_mut(order_id)?.set_disputed(false);
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(OrderError::NotFound(order_id))?;
        order.status = resume;
        order.prior_status = None;
        order.version += 1;

        self.open_disputes.remove(&order_id);
        let dispute = self
            .disputes
            .get_mut(&dispute_id)
            .ok_or(DisputeError::NotFound(dispute_id))?;
        dispute.status = DisputeStatus::Closed;
        dispute.resolved_at = Some(ctx.now);
        info!(dispute = dispute_id, order = order_id, to = %resume, "dispute withdrawn");
        Ok(dispute.clone())
    }

    fn unsettled(&self, dispute_id: DisputeId) -> Result<&Dispute, DisputeError> {
        let dispute = self
            .disputes
            .get(&dispute_id)
            .ok_or(DisputeError::NotFound(dispute_id))?;
        if dispute.status.is_settled() {
            return Err(DisputeError::AlreadySettled {
                dispute: dispute_id,
                status: dispute.status,
            });
        }
        Ok(dispute)
    }

    /// Dispute events never replay, so a successful check always advances.
    fn advance(
        order: OrderId,
        from: OrderStatus,
        event: OrderEvent,
        role: Role,
    ) -> Result<OrderStatus, OrderError> {
        match lifecycle::transition(from, event, role) {
            Ok(Step::Advance(next)) => Ok(next),
            Ok(Step::Replay) => Ok(from),
            Err(e) => Err(OrderError::transition(order, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::super::fixtures::*;
    use super::*;
    use crate::engine::{ErrorKind, EscrowStatus, OrderAction};
    use crate::model::Actor;

    fn open(engine: &mut Engine, order: OrderId) -> Dispute {
        engine
            .open_dispute(&buyer(), order, "crates arrived crushed", vec![])
            .unwrap()
    }

    #[test]
    fn opening_freezes_escrow() {
        let mut engine = engine();
        let order = shipped(&mut engine);
        let dispute = open(&mut engine, order);

        assert_eq!(dispute.status, DisputeStatus::Open);
        assert_eq!(dispute.raised_by, Actor::buyer(BUYER));
        let order = engine.order(order).unwrap();
        assert_eq!(order.status, OrderStatus::Disputed);
        assert_eq!(order.prior_status, Some(OrderStatus::Shipped));
        assert_eq!(
            engine.escrow(order.id).unwrap().status(),
            EscrowStatus::Disputed
        );

        // no lifecycle step while disputed
        let err = engine
            .transition_order(&seller(), order.id, OrderAction::MarkDelivered, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[test]
    fn open_requires_reason_and_paid_order() {
        let mut engine = engine();
        let receipt = checked_out(&mut engine);

        let err = engine
            .open_dispute(&buyer(), receipt.order, " ", vec![])
            .unwrap_err();
        assert!(matches!(err, EngineError::Dispute(DisputeError::EmptyReason)));

        let err = engine
            .open_dispute(&buyer(), receipt.order, "never paid", vec![])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[test]
    fn only_one_open_dispute_per_order() {
        let mut engine = engine();
        let order = shipped(&mut engine);
        let first = open(&mut engine, order);

        let err = engine
            .open_dispute(&seller(), order, "buyer unreachable", vec![])
            .unwrap_err();
        let EngineError::Dispute(DisputeError::AlreadyOpen { dispute, .. }) = err else {
            panic!("expected AlreadyOpen, got {err:?}");
        };
        assert_eq!(dispute, first.id);
        assert_eq!(engine.open_dispute_for(order).unwrap().id, first.id);
    }

    #[test]
    fn dispute_window_after_delivery() {
        let mut engine = engine();
        let order = delivered(&mut engine);

        let late = Context::new(Actor::buyer(BUYER), t0() + TimeDelta::days(4));
        let err = engine
            .open_dispute(&late, order, "rotten", vec![])
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Order(OrderError::DisputeWindowClosed(_))
        ));

        let in_time = Context::new(Actor::buyer(BUYER), t0() + TimeDelta::days(3));
        engine.open_dispute(&in_time, order, "rotten", vec![]).unwrap();
    }

    #[test]
    fn seller_response_moves_under_review() {
        let mut engine = engine();
        let order = shipped(&mut engine);
        let dispute = open(&mut engine, order);

        let err = engine
            .respond_to_dispute(
                &Context::new(Actor::seller(OTHER_SELLER), t0()),
                dispute.id,
                "not mine",
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let dispute = engine
            .respond_to_dispute(&seller(), dispute.id, "packed with care, photos attached")
            .unwrap();
        assert_eq!(dispute.status, DisputeStatus::UnderReview);
        assert!(dispute.seller_response.is_some());
    }

    #[test]
    fn partial_refund_of_half_on_shipped_order() {
        let mut engine = engine();
        let order = shipped(&mut engine);
        let dispute = open(&mut engine, order);

        let half = Amount::from_float(491.50);
        let resolved = engine
            .resolve_dispute(
                &admin(),
                dispute.id,
                Resolution::PartialRefund,
                "half the crates were damaged",
                Some(half),
            )
            .unwrap();
        assert_eq!(resolved.status, DisputeStatus::Resolved);
        assert_eq!(resolved.resolution_amount, Some(half));
        assert_eq!(resolved.resolved_by, Some(ADMIN));

        let escrow = engine.escrow(order).unwrap();
        assert_eq!(escrow.refunded, half);
        assert_eq!(escrow.released, half);
        assert_eq!(escrow.held(), Amount::ZERO);
        assert_eq!(escrow.status(), EscrowStatus::PartiallyRefunded);
        assert_eq!(engine.order(order).unwrap().status, OrderStatus::Completed);
        assert!(engine.open_dispute_for(order).is_none());
    }

    #[test]
    fn full_refund_and_release() {
        let mut engine = engine();
        let refunded = shipped(&mut engine);
        let dispute = open(&mut engine, refunded);
        engine
            .resolve_dispute(&admin(), dispute.id, Resolution::Refund, "never shipped", None)
            .unwrap();
        let order = engine.order(refunded).unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
        assert_eq!(order.payment_status, PaymentStatus::Refunded);
        assert_eq!(
            engine.escrow(refunded).unwrap().refunded,
            Amount::from_units(983)
        );

        let released = shipped(&mut engine);
        let dispute = open(&mut engine, released);
        engine
            .resolve_dispute(&admin(), dispute.id, Resolution::Release, "goods fine", None)
            .unwrap();
        assert_eq!(
            engine.order(released).unwrap().status,
            OrderStatus::Completed
        );
        assert_eq!(
            engine.escrow(released).unwrap().released,
            Amount::from_units(983)
        );
    }

    #[test]
    fn failed_resolution_changes_nothing() {
        let mut engine = engine();
        let order = shipped(&mut engine);
        let dispute = open(&mut engine, order);
        let before = engine.order(order).unwrap().clone();

        for (amount, notes) in [
            (Some(Amount::from_units(983)), "all of it"),
            (Some(Amount::ZERO), "nothing"),
            (None, "forgot the amount"),
            (Some(Amount::from_units(10)), " "),
        ] {
            let err = engine
                .resolve_dispute(&admin(), dispute.id, Resolution::PartialRefund, notes, amount)
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }

        let err = engine
            .resolve_dispute(&buyer(), dispute.id, Resolution::Refund, "me", None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        assert_eq!(engine.order(order).unwrap(), &before);
        assert_eq!(engine.dispute(dispute.id).unwrap().status, DisputeStatus::Open);
        assert_eq!(engine.escrow(order).unwrap().held(), Amount::from_units(983));
    }

    #[test]
    fn settled_dispute_cannot_be_resolved_again() {
        let mut engine = engine();
        let order = shipped(&mut engine);
        let dispute = open(&mut engine, order);
        engine
            .resolve_dispute(&admin(), dispute.id, Resolution::Release, "ok", None)
            .unwrap();

        let err = engine
            .resolve_dispute(&admin(), dispute.id, Resolution::Refund, "changed", None)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Dispute(DisputeError::AlreadySettled { .. })
        ));
        assert_eq!(engine.escrow(order).unwrap().refunded, Amount::ZERO);
    }

    #[test]
    fn withdraw_restores_prior_status() {
        let mut engine = engine();
        let order = delivered(&mut engine);
        let dispute = open(&mut engine, order);

        let err = engine.withdraw_dispute(&seller(), dispute.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let closed = engine.withdraw_dispute(&buyer(), dispute.id).unwrap();
        assert_eq!(closed.status, DisputeStatus::Closed);
        assert_eq!(
            engine.order(order).unwrap().status,
            OrderStatus::Delivered
        );
        assert_eq!(
            engine.escrow(order).unwrap().status(),
            EscrowStatus::Held
        );

        // the order can complete normally afterwards
        advance(&mut engine, order, OrderAction::ConfirmDelivery);
        assert_eq!(
            engine.escrow(order).unwrap().released,
            Amount::from_units(983)
        );
    }
}
