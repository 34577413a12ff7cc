//! Order lifecycle state machine.
//!
//! `PENDING -> PAID -> PROCESSING -> SHIPPED -> DELIVERED -> COMPLETED`, with
//! `CANCELLED` before shipping, a re-entrant `DISPUTED` branch and `REFUNDED`
//! as the outcome of a refunded dispute. The table here is pure: it knows
//! nothing about escrow or stock, the engine performs those side effects.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::model::Role;

/// Status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Processing,
    Shipped,
    Delivered,
    Completed,
    Cancelled,
    Refunded,
    Disputed,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
            OrderStatus::Disputed => "DISPUTED",
        }
    }

    /// No event leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }

    /// Statuses from which a dispute can be raised (funds are in escrow).
    pub fn is_disputable(self) -> bool {
        matches!(
            self,
            OrderStatus::Paid
                | OrderStatus::Processing
                | OrderStatus::Shipped
                | OrderStatus::Delivered
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happens to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEvent {
    /// Payment gateway confirmed the payment, funds are now in escrow.
    PaymentCaptured,
    StartProcessing,
    Ship,
    MarkDelivered,
    /// Buyer confirms receipt; releases escrow.
    ConfirmDelivery,
    /// Auto-release window elapsed without a dispute.
    AutoRelease,
    Cancel,
    RaiseDispute,
    ResolveRelease,
    ResolveRefund,
    ResolvePartial,
    /// Dispute withdrawn, the order goes back to where it was.
    WithdrawDispute { resume: OrderStatus },
}

impl OrderEvent {
    pub fn name(self) -> &'static str {
        match self {
            OrderEvent::PaymentCaptured => "payment_captured",
            OrderEvent::StartProcessing => "start_processing",
            OrderEvent::Ship => "ship",
            OrderEvent::MarkDelivered => "mark_delivered",
            OrderEvent::ConfirmDelivery => "confirm_delivery",
            OrderEvent::AutoRelease => "auto_release",
            OrderEvent::Cancel => "cancel",
            OrderEvent::RaiseDispute => "raise_dispute",
            OrderEvent::ResolveRelease => "resolve_release",
            OrderEvent::ResolveRefund => "resolve_refund",
            OrderEvent::ResolvePartial => "resolve_partial_refund",
            OrderEvent::WithdrawDispute { .. } => "withdraw_dispute",
        }
    }

    /// The status this event leads to when it succeeds.
    pub fn target(self) -> OrderStatus {
        match self {
            OrderEvent::PaymentCaptured => OrderStatus::Paid,
            OrderEvent::StartProcessing => OrderStatus::Processing,
            OrderEvent::Ship => OrderStatus::Shipped,
            OrderEvent::MarkDelivered => OrderStatus::Delivered,
            OrderEvent::ConfirmDelivery
            | OrderEvent::AutoRelease
            | OrderEvent::ResolveRelease
            | OrderEvent::ResolvePartial => OrderStatus::Completed,
            OrderEvent::Cancel => OrderStatus::Cancelled,
            OrderEvent::RaiseDispute => OrderStatus::Disputed,
            OrderEvent::ResolveRefund => OrderStatus::Refunded,
            OrderEvent::WithdrawDispute { resume } => resume,
        }
    }

    /// Roles allowed to drive this event.
    pub fn permits(self, role: Role) -> bool {
        use Role::*;
        match self {
            OrderEvent::PaymentCaptured => matches!(role, PaymentGateway | System),
            OrderEvent::StartProcessing | OrderEvent::Ship | OrderEvent::MarkDelivered => {
                matches!(role, Seller | System)
            }
            OrderEvent::ConfirmDelivery => role == Buyer,
            OrderEvent::AutoRelease => role == System,
            OrderEvent::Cancel => matches!(role, Buyer | Seller | Admin),
            OrderEvent::RaiseDispute => matches!(role, Buyer | Seller),
            OrderEvent::ResolveRelease | OrderEvent::ResolveRefund | OrderEvent::ResolvePartial => {
                role == Admin
            }
            OrderEvent::WithdrawDispute { .. } => matches!(role, Buyer | Seller | Admin),
        }
    }

    /// Whether the event may be replayed against its own target status as a no-op.
    ///
    /// Dispute events are excluded: a second dispute is a conflict, not a replay.
    pub fn is_replayable(self) -> bool {
        matches!(
            self,
            OrderEvent::StartProcessing
                | OrderEvent::Ship
                | OrderEvent::MarkDelivered
                | OrderEvent::ConfirmDelivery
                | OrderEvent::AutoRelease
                | OrderEvent::Cancel
        )
    }
}

impl fmt::Display for OrderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of checking an event against the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Move to the given status.
    Advance(OrderStatus),
    /// Already there; nothing to do.
    Replay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition from {from} to {} ({event})", .event.target())]
    Invalid { from: OrderStatus, event: OrderEvent },
    #[error("role {role} may not {event}")]
    RoleNotPermitted { event: OrderEvent, role: Role },
}

/// Check `event` issued by `role` against `from`.
///
/// The role is checked before the status.
pub fn transition(
    from: OrderStatus,
    event: OrderEvent,
    role: Role,
) -> Result<Step, TransitionError> {
    if !event.permits(role) {
        return Err(TransitionError::RoleNotPermitted { event, role });
    }

    if event.is_replayable() && from == event.target() {
        return Ok(Step::Replay);
    }

    use OrderEvent as E;
    use OrderStatus as S;
    let allowed = match (from, event) {
        (S::Pending, E::PaymentCaptured) => true,
        (S::Paid, E::StartProcessing) => true,
        (S::Processing, E::Ship) => true,
        (S::Shipped, E::MarkDelivered) => true,
        (S::Delivered, E::ConfirmDelivery | E::AutoRelease) => true,
        (S::Pending | S::Paid, E::Cancel) => true,
        (s, E::RaiseDispute) => s.is_disputable(),
        (S::Disputed, E::ResolveRelease | E::ResolveRefund | E::ResolvePartial) => true,
        (S::Disputed, E::WithdrawDispute { resume }) => resume.is_disputable(),
        _ => false,
    };

    if allowed {
        Ok(Step::Advance(event.target()))
    } else {
        Err(TransitionError::Invalid { from, event })
    }
}
