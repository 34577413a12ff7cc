//! Checkout, payment verification and the order lifecycle.

use tracing::{info, warn};

use super::{CartError, Engine, EngineError, EscrowAccount, OrderError};
use crate::Amount;
use crate::lifecycle::{self, OrderEvent, OrderStatus, Step};
use crate::model::{
    CartStatus, Context, DeliveryDetails, DeliveryMethod, Order, OrderId, OrderLine, PaymentStatus,
    Role,
};
use crate::pricing;

/// What the buyer needs to go and pay.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutReceipt {
    pub order: OrderId,
    pub number: String,
    pub total: Amount,
    pub payment_reference: String,
    pub redirect_url: Option<String>,
}

/// What the payment gateway reported for a reference.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayOutcome {
    Success { amount: Amount },
    Pending,
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Success,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentVerification {
    pub order: OrderId,
    pub reference: String,
    pub state: PaymentState,
    /// The escrow account once funds are captured.
    pub escrow: Option<EscrowAccount>,
}

/// A lifecycle step requested by a buyer, seller, admin or timer.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderAction {
    StartProcessing,
    Ship { tracking: Option<String> },
    MarkDelivered,
    ConfirmDelivery,
    AutoRelease,
    Cancel { reason: String },
}

impl OrderAction {
    pub fn event(&self) -> OrderEvent {
        match self {
            OrderAction::StartProcessing => OrderEvent::StartProcessing,
            OrderAction::Ship { .. } => OrderEvent::Ship,
            OrderAction::MarkDelivered => OrderEvent::MarkDelivered,
            OrderAction::ConfirmDelivery => OrderEvent::ConfirmDelivery,
            OrderAction::AutoRelease => OrderEvent::AutoRelease,
            OrderAction::Cancel { .. } => OrderEvent::Cancel,
        }
    }
}

impl Engine {
    /// Turn the buyer's active cart into a PENDING order.
    ///
    /// Cart holds become stock deductions and the payment reference is registered
    /// with the escrow ledger.
    pub fn checkout(
        &mut self,
        ctx: &Context,
        delivery: DeliveryDetails,
    ) -> Result<CheckoutReceipt, EngineError> {
        Self::require_role(ctx, Role::Buyer)?;
        self.authorize(ctx)?;
        let buyer = ctx.actor.id;

        let cart_id = self
            .active_cart_id(buyer, ctx.now)
            .ok_or(CartError::NoActiveCart(buyer))?;
        let cart = self
            .carts
            .get(&cart_id)
            .ok_or(CartError::NoActiveCart(buyer))?;
        if cart.items.is_empty() {
            return Err(CartError::Empty(cart_id).into());
        }
        let has_address = delivery
            .address
            .as_deref()
            .is_some_and(|address| !address.trim().is_empty());
        if delivery.method == DeliveryMethod::Delivery && !has_address {
            return Err(CartError::MissingAddress.into());
        }

        let mut lines = Vec::with_capacity(cart.items.len());
        for item in &cart.items {
            let product = self
                .products
                .get(&item.product)
                .ok_or(CartError::ProductNotFound(item.product))?;
            if !product.listed {
                return Err(CartError::ProductUnavailable(item.product).into());
            }
            lines.push(OrderLine {
                product: item.product,
                name: product.name.clone(),
                unit: product.unit.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                subtotal: item.line_total(),
            });
        }
        let seller = cart.seller;
        let subtotal = lines.iter().map(|line| line.subtotal).sum();
        let totals = pricing::quote(
            subtotal,
            delivery.method,
            &self.config.fees,
            &self.config.delivery,
        );

        let id = self.last_order + 1;
        let reference = format!("{}-{id:06}", self.config.payments.reference_prefix);
        self.ledger.register_reference(reference.clone(), id)?;
        self.last_order = id;

        for line in &lines {
            if let Some(product) = self.products.get_mut(&line.product) {
                product.reserved -= line.quantity;
                product.stock -= line.quantity;
            }
        }
        self.close_cart(cart_id, CartStatus::CheckedOut);

        let number = format!("ORD-{}-{id:04}", ctx.now.format("%Y%m%d%H%M%S"));
        let order = Order {
            id,
            number: number.clone(),
            buyer,
            seller,
            lines,
            totals,
            delivery,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            payment_reference: reference.clone(),
            prior_status: None,
            tracking_number: None,
            cancellation_reason: None,
            created_at: ctx.now,
            paid_at: None,
            shipped_at: None,
            delivered_at: None,
            completed_at: None,
            cancelled_at: None,
            version: 0,
        };
        self.orders.insert(id, order);
        info!(order = id, %number, total = %totals.total(), "order placed");

        let redirect_url = self
            .config
            .payments
            .redirect_base_url
            .as_ref()
            .map(|base| format!("{base}?reference={reference}"));
        Ok(CheckoutReceipt {
            order: id,
            number,
            total: totals.total(),
            payment_reference: reference,
            redirect_url,
        })
    }

    /// Record the gateway's verdict on a payment reference.
    ///
    /// A reference that has already been captured reports success again without
    /// capturing twice.
    pub fn verify_payment(
        &mut self,
        ctx: &Context,
        reference: &str,
        outcome: GatewayOutcome,
    ) -> Result<PaymentVerification, EngineError> {
        if !matches!(ctx.actor.role, Role::PaymentGateway | Role::System) {
            Self::require_role(ctx, Role::PaymentGateway)?;
        }
        self.authorize(ctx)?;

        let order_id = self
            .ledger
            .order_for_reference(reference)
            .ok_or_else(|| OrderError::PaymentNotFound(reference.to_string()))?;
        let verification = |state, escrow| PaymentVerification {
            order: order_id,
            reference: reference.to_string(),
            state,
            escrow,
        };

        if let Some(account) = self.ledger.get(order_id) {
            return Ok(verification(PaymentState::Success, Some(account.clone())));
        }

        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(OrderError::NotFound(order_id))?;
        match outcome {
            GatewayOutcome::Pending => Ok(verification(PaymentState::Pending, None)),
            GatewayOutcome::Failed { reason } => {
                warn!(order = order_id, reference, %reason, "payment failed");
                if order.status == OrderStatus::Pending {
                    order.payment_status = PaymentStatus::Failed;
                    order.version += 1;
                }
                Ok(verification(PaymentState::Failed, None))
            }
            GatewayOutcome::Success { amount } => {
                if amount != order.totals.total() {
                    return Err(OrderError::AmountMismatch {
                        reference: reference.to_string(),
                        expected: order.totals.total(),
                        received: amount,
                    }
                    .into());
                }
                let next = match lifecycle::transition(
                    order.status,
                    OrderEvent::PaymentCaptured,
                    ctx.actor.role,
                )
                .map_err(|e| OrderError::transition(order_id, e))?
                {
                    Step::Advance(next) => next,
                    Step::Replay => order.status,
                };

                let account = self
                    .ledger
                    .capture(order_id, reference, amount, ctx.now)?
                    .clone();
                order.status = next;
                order.payment_status = PaymentStatus::Paid;
                order.paid_at = Some(ctx.now);
                order.version += 1;
                info!(order = order_id, %amount, "payment captured into escrow");
                Ok(verification(PaymentState::Success, Some(account)))
            }
        }
    }

    /// Drive an order one step through its lifecycle.
    ///
    /// Repeating a step the order has already taken returns the order unchanged.
    /// With `expected_version`, a concurrent modification is reported as a conflict.
    pub fn transition_order(
        &mut self,
        ctx: &Context,
        order_id: OrderId,
        action: OrderAction,
        expected_version: Option<u64>,
    ) -> Result<Order, EngineError> {
        self.authorize(ctx)?;
        let order = self
            .orders
            .get(&order_id)
            .ok_or(OrderError::NotFound(order_id))?;
        Self::check_participant(order, ctx)?;
        if let Some(expected) = expected_version {
            if expected != order.version {
                return Err(OrderError::VersionMismatch {
                    order: order_id,
                    expected,
                    actual: order.version,
                }
                .into());
            }
        }

        let event = action.event();
        let next = match lifecycle::transition(order.status, event, ctx.actor.role)
            .map_err(|e| OrderError::transition(order_id, e))?
        {
            Step::Advance(next) => next,
            Step::Replay => return Ok(order.clone()),
        };
        let from = order.status;

        // escrow first: it is the only step that can still fail
        let mut refunded = false;
        match &action {
            OrderAction::ConfirmDelivery | OrderAction::AutoRelease => {
                self.ledger.release(order_id, None)?;
            }
            OrderAction::MarkDelivered => {
                let release_at = ctx
                    .now
                    .checked_add_signed(self.config.auto_release_window())
                    .ok_or(OrderError::ReleaseDateOutOfRange(order_id))?;
                self.ledger.account_mut(order_id)?.auto_release_at = Some(release_at);
            }
            OrderAction::Cancel { .. } if self.ledger.is_captured(order_id) => {
                self.ledger.refund(order_id, None)?;
                refunded = true;
            }
            _ => {}
        }

        if let OrderAction::Cancel { .. } = action {
            self.restock(order_id);
        }

        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(OrderError::NotFound(order_id))?;
        match action {
            OrderAction::Ship { tracking } => {
                order.shipped_at = Some(ctx.now);
                order.tracking_number = tracking;
            }
            OrderAction::MarkDelivered => order.delivered_at = Some(ctx.now),
            OrderAction::ConfirmDelivery | OrderAction::AutoRelease => {
                order.completed_at = Some(ctx.now);
            }
            OrderAction::Cancel { reason } => {
                order.cancelled_at = Some(ctx.now);
                order.cancellation_reason = Some(reason);
                if refunded {
                    order.payment_status = PaymentStatus::Refunded;
                }
            }
            OrderAction::StartProcessing => {}
        }
        order.status = next;
        order.version += 1;

        info!(order = order_id, %from, to = %next, "order {event}");
        Ok(order.clone())
    }

    /// Whether the order's escrow is due for automatic release at `now`.
    pub fn auto_release_due(&self, order_id: OrderId, now: chrono::DateTime<chrono::Utc>) -> bool {
        let delivered = self
            .orders
            .get(&order_id)
            .is_some_and(|order| order.status == OrderStatus::Delivered);
        delivered
            && self
                .ledger
                .get(order_id)
                .and_then(|account| account.auto_release_at)
                .is_some_and(|at| now >= at)
    }

    /// Complete every delivered order whose auto-release time has passed.
    pub fn run_auto_release(&mut self, ctx: &Context) -> Result<Vec<OrderId>, EngineError> {
        Self::require_role(ctx, Role::System)?;
        let due: Vec<OrderId> = self
            .orders
            .keys()
            .copied()
            .filter(|id| self.auto_release_due(*id, ctx.now))
            .collect();

        for &id in &due {
            self.transition_order(ctx, id, OrderAction::AutoRelease, None)?;
        }
        Ok(due)
    }

    /// Buyers and sellers may only act on their own orders.
    pub(super) fn check_participant(order: &Order, ctx: &Context) -> Result<(), OrderError> {
        let actor = ctx.actor;
        let owner = match actor.role {
            Role::Buyer => order.buyer,
            Role::Seller => order.seller,
            _ => return Ok(()),
        };
        if owner == actor.id {
            Ok(())
        } else {
            Err(OrderError::NotParticipant {
                order: order.id,
                user: actor.id,
                role: actor.role,
            })
        }
    }

    fn restock(&mut self, order_id: OrderId) {
        let Some(order) = self.orders.get(&order_id) else {
            return;
        };
        for line in &order.lines {
            if let Some(product) = self.products.get_mut(&line.product) {
                product.stock += line.quantity;
            }
        }
    }

    pub fn order_for_reference(&self, reference: &str) -> Result<&Order, EngineError> {
        let id = self
            .ledger
            .order_for_reference(reference)
            .ok_or_else(|| OrderError::PaymentNotFound(reference.to_string()))?;
        self.orders
            .get(&id)
            .ok_or_else(|| OrderError::NotFound(id).into())
    }
}
