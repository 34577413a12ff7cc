//! Configuration loading and validation for the marketplace engine.
//!
//! Uses serde_yaml to load a YAML file where every section is optional,
//! then applies environment overrides (after loading `.env` if present).

mod duration;
mod error;

pub use error::ConfigError;

use serde::Deserialize;
use std::{env, fs, path::Path, time::Duration};

use crate::Amount;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub fees: FeeConfig,
    pub delivery: DeliveryConfig,
    pub cart: CartConfig,
    pub escrow: EscrowConfig,
    pub payments: PaymentConfig,
}

/// Application-level settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    /// Default tracing directive when `RUST_LOG` is unset.
    pub log_level: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "agro-escrow".to_string(),
            log_level: None,
        }
    }
}

/// Platform commission.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Percentage of the subtotal, e.g. 5.0.
    pub platform_fee_percentage: f64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            platform_fee_percentage: 5.0,
        }
    }
}

impl FeeConfig {
    pub fn platform_fee_bps(&self) -> u32 {
        percentage_to_bps(self.platform_fee_percentage)
    }
}

/// Delivery charge: a base fee plus a percentage on large orders.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub base_fee: f64,
    pub large_order_threshold: f64,
    pub large_order_rate_percentage: f64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            base_fee: 20.0,
            large_order_threshold: 500.0,
            large_order_rate_percentage: 2.0,
        }
    }
}

impl DeliveryConfig {
    pub fn base_fee(&self) -> Amount {
        Amount::from_float(self.base_fee)
    }

    pub fn large_order_threshold(&self) -> Amount {
        Amount::from_float(self.large_order_threshold)
    }

    pub fn large_order_rate_bps(&self) -> u32 {
        percentage_to_bps(self.large_order_rate_percentage)
    }
}

/// How a cart's expiry reacts to mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlPolicy {
    /// Every add/update/remove pushes expiry to `now + ttl`.
    #[default]
    Sliding,
    /// Expiry is fixed when the cart is created.
    Fixed,
}

/// What happens when a buyer adds a product from another seller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SellerConflictPolicy {
    /// Fail with a multi-seller conflict.
    #[default]
    Reject,
    /// Clear the existing cart and start a new one.
    Replace,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CartConfig {
    #[serde(deserialize_with = "duration::deserialize")]
    pub ttl: Duration,
    pub ttl_policy: TtlPolicy,
    pub seller_conflict: SellerConflictPolicy,
}

impl Default for CartConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(8 * 3600),
            ttl_policy: TtlPolicy::default(),
            seller_conflict: SellerConflictPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EscrowConfig {
    /// Days after delivery before escrow is released to the seller automatically.
    pub auto_release_days: u32,
    /// Days after delivery during which the buyer can still dispute. 0 disables the limit.
    pub dispute_deadline_days: u32,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            auto_release_days: 7,
            dispute_deadline_days: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    pub reference_prefix: String,
    /// Hosted payment page; the checkout receipt links to it when set.
    pub redirect_base_url: Option<String>,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            reference_prefix: "ESC".to_string(),
            redirect_base_url: None,
        }
    }
}

/// Longest cart reservation accepted.
const MAX_CART_TTL: Duration = Duration::from_secs(365 * 86_400);

/// Upper bound for the escrow day counts.
const MAX_ESCROW_DAYS: u32 = 3_650;

fn percentage_to_bps(percentage: f64) -> u32 {
    (percentage * 100.0).round().clamp(0.0, f64::from(u32::MAX)) as u32
}

impl Config {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Loads `.env` first (if it exists), then the YAML, then overrides from
    /// `PLATFORM_FEE_PERCENTAGE`, `AUTO_RELEASE_DAYS` and `CART_TTL`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let content = fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;

        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = Config::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        for key in ["PLATFORM_FEE_PERCENTAGE", "AUTO_RELEASE_DAYS", "CART_TTL"] {
            if let Some(value) = lookup(key) {
                let setting = key.to_ascii_lowercase();
                self.apply_setting(&setting, &value)
                    .map_err(|message| ConfigError::Env {
                        key: key.to_string(),
                        message,
                    })?;
            }
        }
        Ok(())
    }

    /// Set a typed runtime setting by key.
    ///
    /// Returns `Ok(false)` when the key is not one this config knows about.
    pub fn apply_setting(&mut self, key: &str, value: &str) -> Result<bool, String> {
        let value = value.trim();
        match key {
            "platform_fee_percentage" => {
                self.fees.platform_fee_percentage = value
                    .parse()
                    .map_err(|_| format!("not a number: {value}"))?;
            }
            "auto_release_days" => {
                self.escrow.auto_release_days = value
                    .parse()
                    .map_err(|_| format!("not a day count: {value}"))?;
            }
            "dispute_deadline_days" => {
                self.escrow.dispute_deadline_days = value
                    .parse()
                    .map_err(|_| format!("not a day count: {value}"))?;
            }
            "cart_ttl" => {
                self.cart.ttl = duration::parse_duration(value)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app.name.is_empty() {
            return Err(ConfigError::Validation("app.name is required".into()));
        }

        let fee = self.fees.platform_fee_percentage;
        if !(0.0..=100.0).contains(&fee) {
            return Err(ConfigError::Validation(format!(
                "fees.platform_fee_percentage must be within 0..=100, got {fee}"
            )));
        }

        let rate = self.delivery.large_order_rate_percentage;
        if !(0.0..=100.0).contains(&rate) {
            return Err(ConfigError::Validation(format!(
                "delivery.large_order_rate_percentage must be within 0..=100, got {rate}"
            )));
        }

        if self.delivery.base_fee < 0.0 || self.delivery.large_order_threshold < 0.0 {
            return Err(ConfigError::Validation(
                "delivery amounts must not be negative".into(),
            ));
        }

        if self.cart.ttl.is_zero() {
            return Err(ConfigError::Validation("cart.ttl must be positive".into()));
        }
        if self.cart.ttl > MAX_CART_TTL {
            return Err(ConfigError::Validation(format!(
                "cart.ttl must be at most 365d, got {}s",
                self.cart.ttl.as_secs()
            )));
        }

        for (key, days) in [
            ("escrow.auto_release_days", self.escrow.auto_release_days),
            ("escrow.dispute_deadline_days", self.escrow.dispute_deadline_days),
        ] {
            if days > MAX_ESCROW_DAYS {
                return Err(ConfigError::Validation(format!(
                    "{key} must be at most {MAX_ESCROW_DAYS}, got {days}"
                )));
            }
        }

        if self.payments.reference_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "payments.reference_prefix is required".into(),
            ));
        }

        Ok(())
    }

    pub fn cart_ttl(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::from_std(self.cart.ttl).unwrap_or(chrono::TimeDelta::MAX)
    }

    pub fn auto_release_window(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::days(i64::from(self.escrow.auto_release_days))
    }

    /// `None` when disputes after delivery are not time-limited.
    pub fn dispute_window(&self) -> Option<chrono::TimeDelta> {
        match self.escrow.dispute_deadline_days {
            0 => None,
            days => Some(chrono::TimeDelta::days(i64::from(days))),
        }
    }
}
