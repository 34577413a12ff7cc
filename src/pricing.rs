//! Order pricing: platform fee and delivery fee on top of the cart subtotal.

use crate::Amount;
use crate::config::{DeliveryConfig, FeeConfig};
use crate::model::{DeliveryMethod, OrderTotals};

/// Delivery charge for a subtotal. Pickup is always free.
pub fn delivery_fee(subtotal: Amount, method: DeliveryMethod, config: &DeliveryConfig) -> Amount {
    match method {
        DeliveryMethod::Pickup => Amount::ZERO,
        DeliveryMethod::Delivery => {
            let mut fee = config.base_fee();
            if subtotal > config.large_order_threshold() {
                fee += subtotal.apply_bps(config.large_order_rate_bps());
            }
            fee
        }
    }
}

/// Full breakdown for a subtotal under the given fee schedule.
pub fn quote(
    subtotal: Amount,
    method: DeliveryMethod,
    fees: &FeeConfig,
    delivery: &DeliveryConfig,
) -> OrderTotals {
    let platform_fee = subtotal.apply_bps(fees.platform_fee_bps());
    OrderTotals::new(subtotal, platform_fee, delivery_fee(subtotal, method, delivery))
}
