//! Core domain types for the marketplace engine.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::lifecycle::OrderStatus;
use crate::{Amount, Quantity};

/// User identifier (buyers, sellers and admins share one id space).
pub type UserId = u32;

/// Product identifier.
pub type ProductId = u32;

/// Cart identifier.
pub type CartId = u32;

/// Cart item identifier.
pub type ItemId = u32;

/// Order identifier.
pub type OrderId = u32;

/// Dispute identifier.
pub type DisputeId = u32;

/// Capacity in which an actor performs an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Buyer,
    Seller,
    Admin,
    /// Timers and background sweeps.
    System,
    /// Payment gateway callbacks.
    PaymentGateway,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Buyer => "buyer",
            Role::Seller => "seller",
            Role::Admin => "admin",
            Role::System => "system",
            Role::PaymentGateway => "payment_gateway",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }

    pub fn buyer(id: UserId) -> Self {
        Self::new(id, Role::Buyer)
    }

    pub fn seller(id: UserId) -> Self {
        Self::new(id, Role::Seller)
    }

    pub fn admin(id: UserId) -> Self {
        Self::new(id, Role::Admin)
    }

    /// Timers and sweeps run as user 0.
    pub fn system() -> Self {
        Self::new(0, Role::System)
    }

    pub fn gateway() -> Self {
        Self::new(0, Role::PaymentGateway)
    }
}

/// Request-scoped context passed to every engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub actor: Actor,
    pub now: DateTime<Utc>,
}

impl Context {
    pub fn new(actor: Actor, now: DateTime<Utc>) -> Self {
        Self { actor, now }
    }
}

/// A listed product and its inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: ProductId,
    pub seller: UserId,
    pub name: String,
    pub unit: String,
    pub unit_price: Amount,
    pub stock: Quantity,
    /// Quantity soft-held by active carts.
    pub reserved: Quantity,
    pub min_order: Quantity,
    pub listed: bool,
}

impl Product {
    /// Stock not held by any cart.
    pub fn available(&self) -> Quantity {
        self.stock - self.reserved
    }
}

/// Seller input for creating or updating a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProduct {
    pub id: ProductId,
    pub name: String,
    pub unit: String,
    pub unit_price: Amount,
    pub stock: Quantity,
    pub min_order: Quantity,
    pub listed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CartStatus {
    Active,
    CheckedOut,
    Expired,
    Cleared,
}

/// A line in a cart, priced at the moment it was added.
#[derive(Debug, Clone, PartialEq)]
pub struct CartItem {
    pub id: ItemId,
    pub product: ProductId,
    pub quantity: Quantity,
    pub unit_price: Amount,
}

impl CartItem {
    pub fn line_total(&self) -> Amount {
        self.unit_price.times(self.quantity)
    }
}

/// A buyer's reservation against a single seller.
#[derive(Debug, Clone, PartialEq)]
pub struct Cart {
    pub id: CartId,
    pub buyer: UserId,
    pub seller: UserId,
    pub status: CartStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub items: Vec<CartItem>,
}

impl Cart {
    /// Status as observed at `now`: an active cart past its expiry reads as expired.
    pub fn status_at(&self, now: DateTime<Utc>) -> CartStatus {
        if self.status == CartStatus::Active && now >= self.expires_at {
            CartStatus::Expired
        } else {
            self.status
        }
    }

    /// Time left before the reservation lapses, never negative.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        if self.status_at(now) != CartStatus::Active {
            return Duration::ZERO;
        }
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn subtotal(&self) -> Amount {
        self.items.iter().map(CartItem::line_total).sum()
    }

    pub fn item(&self, id: ItemId) -> Option<&CartItem> {
        self.items.iter().find(|item| item.id == id)
    }
}

/// Read-only snapshot of a cart for display.
#[derive(Debug, Clone, PartialEq)]
pub struct CartView {
    pub cart: Cart,
    pub status: CartStatus,
    pub remaining: Duration,
    pub subtotal: Amount,
}

impl CartView {
    pub fn at(cart: &Cart, now: DateTime<Utc>) -> Self {
        Self {
            status: cart.status_at(now),
            remaining: cart.remaining(now),
            subtotal: cart.subtotal(),
            cart: cart.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMethod {
    Delivery,
    Pickup,
}

impl DeliveryMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "delivery" => Some(DeliveryMethod::Delivery),
            "pickup" => Some(DeliveryMethod::Pickup),
            _ => None,
        }
    }
}

/// Where and how the goods travel, captured at checkout.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryDetails {
    pub method: DeliveryMethod,
    pub address: Option<String>,
    pub region: Option<String>,
    pub district: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

impl DeliveryDetails {
    pub fn pickup() -> Self {
        Self {
            method: DeliveryMethod::Pickup,
            address: None,
            region: None,
            district: None,
            phone: None,
            notes: None,
        }
    }

    pub fn delivery(address: impl Into<String>) -> Self {
        Self {
            method: DeliveryMethod::Delivery,
            address: Some(address.into()),
            ..Self::pickup()
        }
    }
}

/// Immutable copy of a cart line at checkout time.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderLine {
    pub product: ProductId,
    pub name: String,
    pub unit: String,
    pub quantity: Quantity,
    pub unit_price: Amount,
    pub subtotal: Amount,
}

/// Monetary breakdown of an order. `total` is always the sum of the parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTotals {
    subtotal: Amount,
    platform_fee: Amount,
    delivery_fee: Amount,
    total: Amount,
}

impl OrderTotals {
    pub fn new(subtotal: Amount, platform_fee: Amount, delivery_fee: Amount) -> Self {
        Self {
            subtotal,
            platform_fee,
            delivery_fee,
            total: subtotal + platform_fee + delivery_fee,
        }
    }

    pub fn subtotal(&self) -> Amount {
        self.subtotal
    }

    pub fn platform_fee(&self) -> Amount {
        self.platform_fee
    }

    pub fn delivery_fee(&self) -> Amount {
        self.delivery_fee
    }

    pub fn total(&self) -> Amount {
        self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub number: String,
    pub buyer: UserId,
    pub seller: UserId,
    pub lines: Vec<OrderLine>,
    pub totals: OrderTotals,
    pub delivery: DeliveryDetails,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_reference: String,
    /// Status to resume if the open dispute is withdrawn.
    pub prior_status: Option<OrderStatus>,
    pub tracking_number: Option<String>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Bumped on every mutation.
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeStatus {
    Open,
    UnderReview,
    Resolved,
    Closed,
}

impl DisputeStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, DisputeStatus::Resolved | DisputeStatus::Closed)
    }
}

impl fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisputeStatus::Open => "OPEN",
            DisputeStatus::UnderReview => "UNDER_REVIEW",
            DisputeStatus::Resolved => "RESOLVED",
            DisputeStatus::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    /// Everything back to the buyer.
    Refund,
    /// Everything to the seller.
    Release,
    /// Part back to the buyer, the rest to the seller.
    PartialRefund,
}

impl Resolution {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "refund" => Some(Resolution::Refund),
            "release" => Some(Resolution::Release),
            "partial_refund" | "partial" => Some(Resolution::PartialRefund),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispute {
    pub id: DisputeId,
    pub order: OrderId,
    pub raised_by: Actor,
    pub reason: String,
    pub evidence: Vec<String>,
    pub seller_response: Option<String>,
    pub status: DisputeStatus,
    pub resolution: Option<Resolution>,
    /// Amount refunded to the buyer by a partial refund.
    pub resolution_amount: Option<Amount>,
    pub resolution_notes: Option<String>,
    pub resolved_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Suspended,
    PendingVerification,
}

/// Admin-managed view of a user. Unknown users are treated as active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserAccount {
    pub id: UserId,
    pub status: AccountStatus,
    pub verified: bool,
}

impl UserAccount {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            status: AccountStatus::Active,
            verified: false,
        }
    }
}
