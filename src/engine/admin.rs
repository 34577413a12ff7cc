//! Admin operations: account status and runtime settings.

use tracing::info;

use super::{Engine, EngineError, SettingError};
use crate::model::{AccountStatus, Context, Role, UserAccount, UserId};

impl Engine {
    pub fn set_user_status(
        &mut self,
        ctx: &Context,
        user: UserId,
        status: AccountStatus,
    ) -> Result<UserAccount, EngineError> {
        Self::require_role(ctx, Role::Admin)?;
        let account = self
            .users
            .entry(user)
            .or_insert_with(|| UserAccount::new(user));
        account.status = status;
        info!(user, ?status, admin = ctx.actor.id, "user status changed");
        Ok(*account)
    }

    /// Mark a user verified, activating them if they were waiting on it.
    pub fn verify_user(&mut self, ctx: &Context, user: UserId) -> Result<UserAccount, EngineError> {
        Self::require_role(ctx, Role::Admin)?;
        let account = self
            .users
            .entry(user)
            .or_insert_with(|| UserAccount::new(user));
        account.verified = true;
        if account.status == AccountStatus::PendingVerification {
            account.status = AccountStatus::Active;
        }
        Ok(*account)
    }

    /// Change a runtime setting.
    ///
    /// Known keys (`platform_fee_percentage`, `auto_release_days`,
    /// `dispute_deadline_days`, `cart_ttl`) are parsed and validated against the
    /// whole configuration; any other key is stored verbatim. Existing orders
    /// keep the fees they were priced with.
    pub fn update_setting(
        &mut self,
        ctx: &Context,
        key: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        Self::require_role(ctx, Role::Admin)?;
        let invalid = |message: String| SettingError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut next = self.config.clone();
        match next.apply_setting(key, value) {
            Ok(true) => {
                next.validate().map_err(|e| invalid(e.to_string()))?;
                self.config = next;
            }
            Ok(false) => {
                self.settings.insert(key.to_string(), value.to_string());
            }
            Err(message) => return Err(invalid(message).into()),
        }
        info!(key, value, admin = ctx.actor.id, "setting updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::Amount;
    use crate::engine::{Command, ErrorKind, Outcome};
    use crate::model::{Actor, DeliveryDetails};

    #[test]
    fn suspended_user_is_locked_out() {
        let mut engine = engine();
        engine
            .set_user_status(&admin(), BUYER, AccountStatus::Suspended)
            .unwrap();

        let err = engine
            .apply(
                &buyer(),
                Command::AddItem {
                    product: MAIZE,
                    quantity: qty(100),
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        engine
            .set_user_status(&admin(), BUYER, AccountStatus::Active)
            .unwrap();
        engine
            .apply(
                &buyer(),
                Command::AddItem {
                    product: MAIZE,
                    quantity: qty(100),
                },
            )
            .unwrap();
    }

    #[test]
    fn verification_activates_pending_users() {
        let mut engine = engine();
        engine
            .set_user_status(&admin(), 30, AccountStatus::PendingVerification)
            .unwrap();
        let account = engine.verify_user(&admin(), 30).unwrap();
        assert!(account.verified);
        assert_eq!(account.status, AccountStatus::Active);
        assert_eq!(engine.user(30), account);

        let err = engine.verify_user(&seller(), 30).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn fee_change_applies_to_new_orders_only() {
        let mut engine = engine();
        let first = checked_out(&mut engine);

        engine
            .update_setting(&admin(), "platform_fee_percentage", "10")
            .unwrap();
        let second = checked_out(&mut engine);

        assert_eq!(first.total, Amount::from_units(983));
        // 900 + 90 + 38
        assert_eq!(second.total, Amount::from_units(1_028));
        assert_eq!(
            engine.order(first.order).unwrap().totals.total(),
            Amount::from_units(983)
        );
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut engine = engine();
        let err = engine
            .update_setting(&admin(), "platform_fee_percentage", "lots")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = engine
            .update_setting(&admin(), "platform_fee_percentage", "150")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(engine.config().fees.platform_fee_percentage, 5.0);
    }

    #[test]
    fn out_of_range_settings_leave_the_engine_usable() {
        let mut engine = engine();
        for (key, value) in [
            ("cart_ttl", "99999999999999999999999d"),
            ("cart_ttl", "99999999999d"),
            ("auto_release_days", "4000000000"),
            ("dispute_deadline_days", "4000000000"),
        ] {
            let err = engine.update_setting(&admin(), key, value).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{key}={value}");
        }

        let order = delivered(&mut engine);
        assert_eq!(
            engine.escrow(order).unwrap().auto_release_at,
            Some(t0() + chrono::TimeDelta::days(7))
        );
        let outcome = engine.apply(&system(), Command::Sweep).unwrap();
        let Outcome::Swept {
            expired_carts,
            released_orders,
        } = outcome
        else {
            panic!("expected a sweep, got {outcome:?}");
        };
        assert_eq!(expired_carts, 0);
        assert!(released_orders.is_empty());
    }

    #[test]
    fn unknown_settings_are_stored() {
        let mut engine = engine();
        engine
            .update_setting(&admin(), "support_email", "help@example.test")
            .unwrap();
        assert_eq!(engine.setting("support_email"), Some("help@example.test"));
    }

    #[test]
    fn cart_ttl_setting_takes_effect() {
        let mut engine = engine();
        engine.update_setting(&admin(), "cart_ttl", "30m").unwrap();
        let view = engine.add_item(&buyer(), MAIZE, qty(100)).unwrap();
        assert_eq!(view.remaining, std::time::Duration::from_secs(30 * 60));

        let later = Context::new(Actor::buyer(BUYER), at_minutes(31));
        let err = engine
            .checkout(&later, DeliveryDetails::pickup())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
