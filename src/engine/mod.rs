//! Marketplace engine.
//!
//! The engine owns every cart, order, escrow account and dispute, and applies
//! commands one at a time. Each operation validates completely before it
//! mutates anything, so a failed command leaves no partial state behind.
//! Commands can also arrive as an async stream (see [`EngineHandle`]), which
//! serialises concurrent callers.

use std::collections::{BTreeMap, HashMap};

use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::Amount;
use crate::Quantity;
use crate::config::Config;
use crate::model::{
    AccountStatus, Cart, CartId, CartView, Context, DeliveryDetails, Dispute, DisputeId, ItemId,
    NewProduct, Order, OrderId, Product, ProductId, Resolution, Role, UserAccount, UserId,
};

mod admin;
mod cart;
mod disputes;
mod error;
mod handle;
mod ledger;
mod orders;
mod state;

pub use error::{
    AccessError, CartError, DisputeError, EngineError, ErrorKind, ErrorReport, EscrowError,
    OrderError, SettingError,
};
pub use handle::{EngineHandle, Envelope};
pub use ledger::EscrowLedger;
pub use orders::{CheckoutReceipt, GatewayOutcome, OrderAction, PaymentState, PaymentVerification};
pub use state::{EscrowAccount, EscrowStatus};

/// A request to the engine. The caller is described by the accompanying [`Context`].
#[derive(Debug, Clone)]
pub enum Command {
    UpsertProduct(NewProduct),
    GetCart,
    AddItem {
        product: ProductId,
        quantity: Quantity,
    },
    UpdateItem {
        item: ItemId,
        quantity: Quantity,
    },
    RemoveItem {
        item: ItemId,
    },
    ClearCart,
    Checkout(DeliveryDetails),
    VerifyPayment {
        reference: String,
        outcome: GatewayOutcome,
    },
    Transition {
        order: OrderId,
        action: OrderAction,
        expected_version: Option<u64>,
    },
    OpenDispute {
        order: OrderId,
        reason: String,
        evidence: Vec<String>,
    },
    RespondDispute {
        dispute: DisputeId,
        response: String,
    },
    ResolveDispute {
        dispute: DisputeId,
        resolution: Resolution,
        notes: String,
        partial_amount: Option<Amount>,
    },
    WithdrawDispute {
        dispute: DisputeId,
    },
    SetUserStatus {
        user: UserId,
        status: AccountStatus,
    },
    VerifyUser {
        user: UserId,
    },
    UpdateSetting {
        key: String,
        value: String,
    },
    /// Expire lapsed carts and auto-release due escrows.
    Sweep,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::UpsertProduct(_) => "upsert_product",
            Command::GetCart => "get_cart",
            Command::AddItem { .. } => "add_item",
            Command::UpdateItem { .. } => "update_item",
            Command::RemoveItem { .. } => "remove_item",
            Command::ClearCart => "clear_cart",
            Command::Checkout(_) => "checkout",
            Command::VerifyPayment { .. } => "verify_payment",
            Command::Transition { action, .. } => action.event().name(),
            Command::OpenDispute { .. } => "open_dispute",
            Command::RespondDispute { .. } => "respond_dispute",
            Command::ResolveDispute { .. } => "resolve_dispute",
            Command::WithdrawDispute { .. } => "withdraw_dispute",
            Command::SetUserStatus { .. } => "set_user_status",
            Command::VerifyUser { .. } => "verify_user",
            Command::UpdateSetting { .. } => "update_setting",
            Command::Sweep => "sweep",
        }
    }
}

/// Successful result of a [`Command`].
#[derive(Debug, Clone)]
pub enum Outcome {
    Product(Product),
    Cart(Option<CartView>),
    Checkout(CheckoutReceipt),
    Payment(PaymentVerification),
    Order(Order),
    Dispute(Dispute),
    User(UserAccount),
    Swept {
        expired_carts: usize,
        released_orders: Vec<OrderId>,
    },
    Done,
}

/// The marketplace engine.
#[derive(Debug)]
pub struct Engine {
    config: Config,
    products: HashMap<ProductId, Product>,
    carts: HashMap<CartId, Cart>,
    /// Buyer -> their single active cart
    active_carts: HashMap<UserId, CartId>,
    orders: BTreeMap<OrderId, Order>,
    ledger: EscrowLedger,
    disputes: HashMap<DisputeId, Dispute>,
    /// Order -> its open dispute (at most one)
    open_disputes: HashMap<OrderId, DisputeId>,
    users: HashMap<UserId, UserAccount>,
    /// Free-form admin settings that the engine does not interpret
    settings: BTreeMap<String, String>,
    last_cart: CartId,
    last_item: ItemId,
    last_order: OrderId,
    last_dispute: DisputeId,
}

/// Public API
impl Engine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            products: HashMap::new(),
            carts: HashMap::new(),
            active_carts: HashMap::new(),
            orders: BTreeMap::new(),
            ledger: EscrowLedger::new(),
            disputes: HashMap::new(),
            open_disputes: HashMap::new(),
            users: HashMap::new(),
            settings: BTreeMap::new(),
            last_cart: 0,
            last_item: 0,
            last_order: 0,
            last_dispute: 0,
        }
    }

    /// Run the engine over a stream of commands, replying to each when asked to.
    pub async fn run(&mut self, mut stream: impl Stream<Item = Envelope> + Unpin) {
        while let Some(Envelope {
            ctx,
            command,
            reply,
        }) = stream.next().await
        {
            // a failed command must not stop the engine; it is logged and returned to the caller
            let result = self.apply(&ctx, command);
            if let Some(reply) = reply {
                // the caller may have given up waiting
                let _ = reply.send(result);
            }
        }
    }

    /// Apply a single command on top of the current engine state
    pub fn apply(&mut self, ctx: &Context, command: Command) -> Result<Outcome, EngineError> {
        let name = command.name();
        let result = self.dispatch(ctx, command);
        Self::log_result(name, ctx, &result);
        result
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn product(&self, id: ProductId) -> Option<&Product> {
        self.products.get(&id)
    }

    /// Snapshot of a cart as seen at `now` (an expired cart never reads as active).
    pub fn cart_view(&self, id: CartId, now: chrono::DateTime<chrono::Utc>) -> Option<CartView> {
        self.carts.get(&id).map(|cart| CartView::at(cart, now))
    }

    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    /// All orders, by id.
    pub fn orders(&self) -> impl Iterator<Item = &Order> + '_ {
        self.orders.values()
    }

    pub fn escrow(&self, order: OrderId) -> Option<&EscrowAccount> {
        self.ledger.get(order)
    }

    pub fn ledger(&self) -> &EscrowLedger {
        &self.ledger
    }

    pub fn dispute(&self, id: DisputeId) -> Option<&Dispute> {
        self.disputes.get(&id)
    }

    pub fn open_dispute_for(&self, order: OrderId) -> Option<&Dispute> {
        self.open_disputes
            .get(&order)
            .and_then(|id| self.disputes.get(id))
    }

    pub fn user(&self, id: UserId) -> UserAccount {
        self.users
            .get(&id)
            .copied()
            .unwrap_or_else(|| UserAccount::new(id))
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }
}

/// Private API
impl Engine {
    fn dispatch(&mut self, ctx: &Context, command: Command) -> Result<Outcome, EngineError> {
        let outcome = match command {
            Command::UpsertProduct(listing) => Outcome::Product(self.upsert_product(ctx, listing)?),
            Command::GetCart => Outcome::Cart(self.cart(ctx)?),
            Command::AddItem { product, quantity } => {
                Outcome::Cart(Some(self.add_item(ctx, product, quantity)?))
            }
            Command::UpdateItem { item, quantity } => {
                Outcome::Cart(Some(self.update_item(ctx, item, quantity)?))
            }
            Command::RemoveItem { item } => Outcome::Cart(self.remove_item(ctx, item)?),
            Command::ClearCart => {
                self.clear_cart(ctx)?;
                Outcome::Done
            }
            Command::Checkout(delivery) => Outcome::Checkout(self.checkout(ctx, delivery)?),
            Command::VerifyPayment { reference, outcome } => {
                Outcome::Payment(self.verify_payment(ctx, &reference, outcome)?)
            }
            Command::Transition {
                order,
                action,
                expected_version,
            } => Outcome::Order(self.transition_order(ctx, order, action, expected_version)?),
            Command::OpenDispute {
                order,
                reason,
                evidence,
            } => Outcome::Dispute(self.open_dispute(ctx, order, &reason, evidence)?),
            Command::RespondDispute { dispute, response } => {
                Outcome::Dispute(self.respond_to_dispute(ctx, dispute, &response)?)
            }
            Command::ResolveDispute {
                dispute,
                resolution,
                notes,
                partial_amount,
            } => Outcome::Dispute(self.resolve_dispute(
                ctx,
                dispute,
                resolution,
                &notes,
                partial_amount,
            )?),
            Command::WithdrawDispute { dispute } => {
                Outcome::Dispute(self.withdraw_dispute(ctx, dispute)?)
            }
            Command::SetUserStatus { user, status } => {
                Outcome::User(self.set_user_status(ctx, user, status)?)
            }
            Command::VerifyUser { user } => Outcome::User(self.verify_user(ctx, user)?),
            Command::UpdateSetting { key, value } => {
                self.update_setting(ctx, &key, &value)?;
                Outcome::Done
            }
            Command::Sweep => {
                Self::require_role(ctx, Role::System)?;
                let expired_carts = self.sweep_expired_carts(ctx.now);
                let released_orders = self.run_auto_release(ctx)?;
                Outcome::Swept {
                    expired_carts,
                    released_orders,
                }
            }
        };
        Ok(outcome)
    }

    /// Small helper to log `apply` results
    fn log_result(name: &str, ctx: &Context, result: &Result<Outcome, EngineError>) {
        match result {
            Ok(_) => {
                info!(
                    actor = ctx.actor.id,
                    role = %ctx.actor.role,
                    "{name} applied"
                );
            }
            Err(e) => {
                warn!(
                    actor = ctx.actor.id,
                    role = %ctx.actor.role,
                    kind = ?e.kind(),
                    reason = %e,
                    "{name} rejected"
                );
            }
        }
    }

    /// Suspended users can do nothing except through an admin.
    pub(super) fn authorize(&self, ctx: &Context) -> Result<(), AccessError> {
        if ctx.actor.role == Role::Admin {
            return Ok(());
        }
        match self.users.get(&ctx.actor.id) {
            Some(account) if account.status == AccountStatus::Suspended => {
                Err(AccessError::Suspended(ctx.actor.id))
            }
            _ => Ok(()),
        }
    }

    fn require_role(ctx: &Context, required: Role) -> Result<(), AccessError> {
        if ctx.actor.role == required {
            Ok(())
        } else {
            Err(AccessError::RoleRequired {
                required,
                actual: ctx.actor.role,
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Shared setup for engine tests.

    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    use super::*;
    use crate::model::{Actor, DeliveryDetails};

    pub const SELLER: UserId = 20;
    pub const OTHER_SELLER: UserId = 21;
    pub const BUYER: UserId = 10;
    pub const ADMIN: UserId = 1;

    pub const MAIZE: ProductId = 1;
    pub const TOMATOES: ProductId = 2;
    pub const YAMS: ProductId = 3;

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    pub fn at_minutes(minutes: i64) -> DateTime<Utc> {
        t0() + TimeDelta::minutes(minutes)
    }

    pub fn buyer() -> Context {
        Context::new(Actor::buyer(BUYER), t0())
    }

    pub fn seller() -> Context {
        Context::new(Actor::seller(SELLER), t0())
    }

    pub fn admin() -> Context {
        Context::new(Actor::admin(ADMIN), t0())
    }

    pub fn system() -> Context {
        Context::new(Actor::system(), t0())
    }

    pub fn gateway() -> Context {
        Context::new(Actor::gateway(), t0())
    }

    pub fn listing(id: ProductId, price: f64, stock: i64, min: i64) -> NewProduct {
        NewProduct {
            id,
            name: format!("product {id}"),
            unit: "kg".to_string(),
            unit_price: Amount::from_float(price),
            stock: Quantity::from_units(stock),
            min_order: Quantity::from_units(min),
            listed: true,
        }
    }

    /// Maize 3.20/kg min 50 and tomatoes 11.60/kg min 10 from SELLER,
    /// yams 5.00/kg min 1 from OTHER_SELLER.
    pub fn engine_with(config: Config) -> Engine {
        let mut engine = Engine::new(config);
        engine
            .upsert_product(&seller(), listing(MAIZE, 3.20, 1_000, 50))
            .unwrap();
        engine
            .upsert_product(&seller(), listing(TOMATOES, 11.60, 200, 10))
            .unwrap();
        engine
            .upsert_product(
                &Context::new(Actor::seller(OTHER_SELLER), t0()),
                listing(YAMS, 5.0, 100, 1),
            )
            .unwrap();
        engine
    }

    pub fn engine() -> Engine {
        engine_with(Config::default())
    }

    pub fn qty(units: i64) -> Quantity {
        Quantity::from_units(units)
    }

    /// The two-item cart from the pricing scenario, checked out for delivery.
    pub fn checked_out(engine: &mut Engine) -> CheckoutReceipt {
        engine.add_item(&buyer(), MAIZE, qty(100)).unwrap();
        engine.add_item(&buyer(), TOMATOES, qty(50)).unwrap();
        engine
            .checkout(&buyer(), DeliveryDetails::delivery("12 Market Rd, Kumasi"))
            .unwrap()
    }

    pub fn paid(engine: &mut Engine) -> OrderId {
        let receipt = checked_out(engine);
        engine
            .verify_payment(
                &gateway(),
                &receipt.payment_reference,
                GatewayOutcome::Success {
                    amount: receipt.total,
                },
            )
            .unwrap();
        receipt.order
    }

    pub fn advance(engine: &mut Engine, order: OrderId, action: OrderAction) -> Order {
        let ctx = match action {
            OrderAction::ConfirmDelivery => buyer(),
            _ => seller(),
        };
        engine.transition_order(&ctx, order, action, None).unwrap()
    }

    pub fn shipped(engine: &mut Engine) -> OrderId {
        let order = paid(engine);
        advance(engine, order, OrderAction::StartProcessing);
        advance(engine, order, OrderAction::Ship { tracking: None });
        order
    }

    pub fn delivered(engine: &mut Engine) -> OrderId {
        let order = shipped(engine);
        advance(engine, order, OrderAction::MarkDelivered);
        order
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::lifecycle::OrderStatus;
    use crate::model::{Actor, CartStatus};

    #[test]
    fn new_engine_is_empty() {
        let engine = Engine::new(Config::default());
        assert_eq!(engine.orders().count(), 0);
        assert_eq!(engine.ledger().accounts().count(), 0);
    }

    #[test]
    fn apply_dispatches_commands() {
        let mut engine = engine();
        let outcome = engine
            .apply(
                &buyer(),
                Command::AddItem {
                    product: MAIZE,
                    quantity: qty(60),
                },
            )
            .unwrap();

        let Outcome::Cart(Some(view)) = outcome else {
            panic!("expected a cart, got {outcome:?}");
        };
        assert_eq!(view.status, CartStatus::Active);
        assert_eq!(view.cart.items.len(), 1);
    }

    #[test]
    fn apply_returns_typed_errors() {
        let mut engine = engine();
        let err = engine
            .apply(
                &buyer(),
                Command::Transition {
                    order: 99,
                    action: OrderAction::ConfirmDelivery,
                    expected_version: None,
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn sweep_requires_system_role() {
        let mut engine = engine();
        let err = engine.apply(&buyer(), Command::Sweep).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn sweep_expires_carts_and_releases_due_escrow() {
        let mut engine = engine();
        let order = delivered(&mut engine);

        // a second buyer leaves a cart behind
        let other = Context::new(Actor::buyer(11), t0());
        engine.add_item(&other, YAMS, qty(5)).unwrap();

        let later = Context::new(Actor::system(), t0() + chrono::TimeDelta::days(8));
        let outcome = engine.apply(&later, Command::Sweep).unwrap();
        let Outcome::Swept {
            expired_carts,
            released_orders,
        } = outcome
        else {
            panic!("expected sweep outcome");
        };
        assert_eq!(expired_carts, 1);
        assert_eq!(released_orders, vec![order]);
        assert_eq!(engine.order(order).unwrap().status, OrderStatus::Completed);
        assert_eq!(engine.product(YAMS).unwrap().reserved, Quantity::ZERO);
    }

    #[tokio::test]
    async fn run_processes_all_commands() {
        let mut engine = engine();
        let envelopes = vec![
            Envelope::new(
                buyer(),
                Command::AddItem {
                    product: MAIZE,
                    quantity: qty(100),
                },
            ),
            Envelope::new(
                buyer(),
                Command::AddItem {
                    product: YAMS, // different seller, rejected
                    quantity: qty(1),
                },
            ),
            Envelope::new(
                buyer(),
                Command::AddItem {
                    product: TOMATOES,
                    quantity: qty(50),
                },
            ),
            Envelope::new(buyer(), Command::Checkout(DeliveryDetails::pickup())),
        ];

        engine.run(tokio_stream::iter(envelopes)).await;

        let order = engine.order(1).unwrap();
        assert_eq!(order.lines.len(), 2);
        assert_eq!(order.totals.subtotal(), Amount::from_units(900));
        assert_eq!(order.totals.total(), Amount::from_units(945));
    }
}
