//! Error types for marketplace operations.

use serde::Serialize;
use thiserror::Error;

use crate::lifecycle::{OrderEvent, OrderStatus, TransitionError};
use crate::model::{CartId, DisputeId, ItemId, OrderId, ProductId, Role, UserId};
use crate::{Amount, Quantity};

/// Top-level error returned by [`Engine`](super::Engine) operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cart: {0}")]
    Cart(#[from] CartError),

    #[error("order: {0}")]
    Order(#[from] OrderError),

    #[error("escrow: {0}")]
    Escrow(#[from] EscrowError),

    #[error("dispute: {0}")]
    Dispute(#[from] DisputeError),

    #[error("{0}")]
    Access(#[from] AccessError),

    #[error("setting: {0}")]
    Setting(#[from] SettingError),

    #[error("engine is not running")]
    Unavailable,
}

/// Coarse classification handed back to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidTransition,
    InsufficientHold,
    MultiSellerConflict,
    /// Concurrent mutation lost the race, or a duplicate that cannot be replayed.
    Conflict,
    Forbidden,
    Unavailable,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Cart(e) => e.kind(),
            EngineError::Order(e) => e.kind(),
            EngineError::Escrow(e) => e.kind(),
            EngineError::Dispute(e) => e.kind(),
            EngineError::Access(_) => ErrorKind::Forbidden,
            EngineError::Setting(_) => ErrorKind::Validation,
            EngineError::Unavailable => ErrorKind::Unavailable,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Structured error object for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for ErrorReport {
    fn from(err: &EngineError) -> Self {
        err.report()
    }
}

#[derive(Debug, Error)]
pub enum CartError {
    #[error("product {0} not found")]
    ProductNotFound(ProductId),
    #[error("product {0} is not available")]
    ProductUnavailable(ProductId),
    #[error("cannot add your own product {0} to a cart")]
    OwnProduct(ProductId),
    #[error("quantity must be positive")]
    NonPositiveQuantity,
    #[error("product {product}: minimum order quantity is {minimum}, requested {requested}")]
    BelowMinimum {
        product: ProductId,
        requested: Quantity,
        minimum: Quantity,
    },
    #[error("product {product}: only {available} available, requested {requested}")]
    ExceedsStock {
        product: ProductId,
        requested: Quantity,
        available: Quantity,
    },
    #[error("active cart is with seller {active}, product belongs to seller {requested}")]
    SellerConflict { active: UserId, requested: UserId },
    #[error("no active cart for buyer {0}")]
    NoActiveCart(UserId),
    #[error("item {0} not found in cart")]
    ItemNotFound(ItemId),
    #[error("cart {0} is empty")]
    Empty(CartId),
    #[error("delivery address is required for delivery orders")]
    MissingAddress,
    #[error("product {product}: invalid listing: {message}")]
    InvalidListing { product: ProductId, message: String },
    #[error("cart expiry is out of range at {0}")]
    ExpiryOutOfRange(chrono::DateTime<chrono::Utc>),
}

impl CartError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CartError::ProductNotFound(_)
            | CartError::NoActiveCart(_)
            | CartError::ItemNotFound(_) => ErrorKind::NotFound,
            CartError::SellerConflict { .. } => ErrorKind::MultiSellerConflict,
            CartError::ProductUnavailable(_)
            | CartError::OwnProduct(_)
            | CartError::NonPositiveQuantity
            | CartError::BelowMinimum { .. }
            | CartError::ExceedsStock { .. }
            | CartError::Empty(_)
            | CartError::MissingAddress
            | CartError::InvalidListing { .. }
            | CartError::ExpiryOutOfRange(_) => ErrorKind::Validation,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order {0} not found")]
    NotFound(OrderId),
    #[error("order {order}: invalid transition from {from} to {} ({event})", .event.target())]
    InvalidTransition {
        order: OrderId,
        from: OrderStatus,
        event: OrderEvent,
    },
    #[error("order {order}: role {role} may not {event}")]
    RoleNotPermitted {
        order: OrderId,
        event: OrderEvent,
        role: Role,
    },
    #[error("order {order}: user {user} is not the order's {role}")]
    NotParticipant {
        order: OrderId,
        user: UserId,
        role: Role,
    },
    #[error("order {order}: expected version {expected}, found {actual}")]
    VersionMismatch {
        order: OrderId,
        expected: u64,
        actual: u64,
    },
    #[error("payment reference {0} not found")]
    PaymentNotFound(String),
    #[error("payment {reference}: expected {expected}, gateway reported {received}")]
    AmountMismatch {
        reference: String,
        expected: Amount,
        received: Amount,
    },
    #[error("order {0}: dispute window has closed")]
    DisputeWindowClosed(OrderId),
    #[error("order {0}: auto-release date is out of range")]
    ReleaseDateOutOfRange(OrderId),
}

impl OrderError {
    pub(crate) fn transition(order: OrderId, err: TransitionError) -> Self {
        match err {
            TransitionError::Invalid { from, event } => {
                OrderError::InvalidTransition { order, from, event }
            }
            TransitionError::RoleNotPermitted { event, role } => {
                OrderError::RoleNotPermitted { order, event, role }
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderError::NotFound(_) | OrderError::PaymentNotFound(_) => ErrorKind::NotFound,
            OrderError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            OrderError::RoleNotPermitted { .. } | OrderError::NotParticipant { .. } => {
                ErrorKind::Forbidden
            }
            OrderError::VersionMismatch { .. } => ErrorKind::Conflict,
            OrderError::AmountMismatch { .. }
            | OrderError::DisputeWindowClosed(_)
            | OrderError::ReleaseDateOutOfRange(_) => ErrorKind::Validation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EscrowError {
    #[error("no escrow for order {0}")]
    NotFound(OrderId),
    #[error("escrow for order {0} already captured")]
    AlreadyCaptured(OrderId),
    #[error("payment reference {0} already used by another order")]
    ReferenceInUse(String),
    #[error("order {0}: amount must be positive")]
    NonPositiveAmount(OrderId),
    #[error("order {order}: requested {requested}, only {held} held")]
    InsufficientHold {
        order: OrderId,
        requested: Amount,
        held: Amount,
    },
}

impl EscrowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EscrowError::NotFound(_) => ErrorKind::NotFound,
            EscrowError::AlreadyCaptured(_) | EscrowError::ReferenceInUse(_) => ErrorKind::Conflict,
            EscrowError::NonPositiveAmount(_) => ErrorKind::Validation,
            EscrowError::InsufficientHold { .. } => ErrorKind::InsufficientHold,
        }
    }
}

#[derive(Debug, Error)]
pub enum DisputeError {
    #[error("dispute {0} not found")]
    NotFound(DisputeId),
    #[error("order {order} already has open dispute {dispute}")]
    AlreadyOpen { order: OrderId, dispute: DisputeId },
    #[error("a reason is required")]
    EmptyReason,
    #[error("resolution notes are required")]
    EmptyNotes,
    #[error("a response is required")]
    EmptyResponse,
    #[error("partial refund requires an amount")]
    MissingPartialAmount,
    #[error("partial refund {amount} must be between 0 and {captured} exclusive")]
    PartialAmountOutOfRange { amount: Amount, captured: Amount },
    #[error("dispute {dispute} is already {status}")]
    AlreadySettled {
        dispute: DisputeId,
        status: crate::model::DisputeStatus,
    },
    #[error("user {user} did not raise dispute {dispute}")]
    NotRaiser { dispute: DisputeId, user: UserId },
}

impl DisputeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DisputeError::NotFound(_) => ErrorKind::NotFound,
            DisputeError::AlreadyOpen { .. } => ErrorKind::Conflict,
            DisputeError::EmptyReason
            | DisputeError::EmptyNotes
            | DisputeError::EmptyResponse
            | DisputeError::MissingPartialAmount
            | DisputeError::PartialAmountOutOfRange { .. } => ErrorKind::Validation,
            DisputeError::AlreadySettled { .. } => ErrorKind::InvalidTransition,
            DisputeError::NotRaiser { .. } => ErrorKind::Forbidden,
        }
    }
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("user {0} is suspended")]
    Suspended(UserId),
    #[error("operation requires role {required}, caller is {actual}")]
    RoleRequired { required: Role, actual: Role },
    #[error("product {product} belongs to another seller than {user}")]
    NotOwner { product: ProductId, user: UserId },
}

#[derive(Debug, Error)]
pub enum SettingError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_taxonomy() {
        let err = EngineError::from(CartError::SellerConflict {
            active: 1,
            requested: 2,
        });
        assert_eq!(err.kind(), ErrorKind::MultiSellerConflict);

        let err = EngineError::from(EscrowError::InsufficientHold {
            order: 1,
            requested: Amount::from_units(2),
            held: Amount::from_units(1),
        });
        assert_eq!(err.kind(), ErrorKind::InsufficientHold);

        let err = EngineError::from(OrderError::transition(
            7,
            TransitionError::Invalid {
                from: OrderStatus::Pending,
                event: OrderEvent::Ship,
            },
        ));
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(
            err.to_string(),
            "order: order 7: invalid transition from PENDING to SHIPPED (ship)"
        );
    }

    #[test]
    fn report_carries_kind_and_message() {
        let err = EngineError::from(CartError::NoActiveCart(4));
        let report = ErrorReport::from(&err);
        assert_eq!(report.kind, ErrorKind::NotFound);
        assert_eq!(report.message, "cart: no active cart for buyer 4");
    }
}
