//! Checkout service configuration

use std::str::FromStr;
use thiserror::Error;

use crate::ledger::LedgerKind;
use crate::pricing::{DiscountRule, PricingPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    pub database_max_connections: u32,
    /// Authoritative stock ledger of this deployment
    pub stock_ledger: LedgerKind,
    /// Required with the scripted ledger
    pub redis_url: Option<String>,
    pub port: u16,
    pub pricing: PricingPolicy,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let stock_ledger = parse_or(&get, "STOCK_LEDGER", LedgerKind::Relational)?;
        let redis_url = get("REDIS_URL");
        if stock_ledger == LedgerKind::Scripted && redis_url.is_none() {
            return Err(ConfigError::Missing("REDIS_URL"));
        }

        let membership_off_rate: u8 = parse_or(&get, "MEMBERSHIP_OFF_RATE", 0)?;
        if membership_off_rate > 100 {
            return Err(ConfigError::Invalid { name: "MEMBERSHIP_OFF_RATE", value: membership_off_rate.to_string() });
        }

        Ok(Self {
            database_url,
            database_max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", 10)?,
            stock_ledger,
            redis_url,
            port: parse_or(&get, "PORT", 8083)?,
            pricing: PricingPolicy {
                coupon: rule(&get, ["COUPON_ID", "COUPON_NAME", "COUPON_DISCOUNT", "COUPON_THRESHOLD"])?,
                promotion: rule(&get, ["PROMOTION_ID", "PROMOTION_NAME", "PROMOTION_DISCOUNT", "PROMOTION_THRESHOLD"])?,
                membership_off_rate,
            },
        })
    }
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T, ConfigError> {
    match get(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

/// A discount rule is configured when its id is set.
fn rule(get: &impl Fn(&str) -> Option<String>, [id, name, discount, threshold]: [&'static str; 4]) -> Result<Option<DiscountRule>, ConfigError> {
    let Some(raw_id) = get(id) else { return Ok(None) };
    let rule_id: i64 = raw_id.trim().parse().map_err(|_| ConfigError::Invalid { name: id, value: raw_id.clone() })?;
    let amount: i64 = parse_or(get, discount, 0)?;
    let floor: i64 = parse_or(get, threshold, 0)?;
    if amount < 0 {
        return Err(ConfigError::Invalid { name: discount, value: amount.to_string() });
    }
    if floor < 0 {
        return Err(ConfigError::Invalid { name: threshold, value: floor.to_string() });
    }
    Ok(Some(DiscountRule { id: rule_id, name: get(name).unwrap_or_else(|| format!("rule {rule_id}")), discount: amount, threshold: floor }))
}
