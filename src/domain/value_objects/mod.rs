//! Value Objects for checkout

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = i64;
pub type CommodityId = i64;
pub type CartItemId = i64;
pub type AddressId = i64;

/// Monetary amounts are integer cents.
pub type Cents = i64;

/// Order number value object.
///
/// Generated numbers are `YYYYMMDD`, a 14 digit random sequence and the last
/// four digits of the zero-padded owner id, 26 digits in total.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderNo(String);

impl OrderNo {
    const MAX_LEN: usize = 32;

    pub fn new(value: impl Into<String>) -> Result<Self, OrderNoError> {
        let value = value.into().trim().to_string();
        if value.is_empty() { return Err(OrderNoError::Empty); }
        if value.len() > Self::MAX_LEN { return Err(OrderNoError::TooLong); }
        if !value.bytes().all(|b| b.is_ascii_digit()) { return Err(OrderNoError::NotNumeric); }
        Ok(Self(value))
    }

    pub fn generate(user_id: UserId) -> Self {
        let seq = rand::thread_rng().gen_range(0..99_999_999_999_999u64);
        Self::compose(Utc::now(), seq, user_id)
    }

    fn compose(at: DateTime<Utc>, seq: u64, user_id: UserId) -> Self {
        let padded = format!("{:04}", user_id.unsigned_abs());
        let suffix = &padded[padded.len() - 4..];
        Self(format!("{}{:014}{}", at.format("%Y%m%d"), seq, suffix))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for OrderNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl TryFrom<String> for OrderNo {
    type Error = OrderNoError;
    fn try_from(value: String) -> Result<Self, Self::Error> { Self::new(value) }
}

impl From<OrderNo> for String {
    fn from(value: OrderNo) -> Self { value.0 }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum OrderNoError { Empty, TooLong, NotNumeric }
impl std::error::Error for OrderNoError {}
impl fmt::Display for OrderNoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "order number empty"),
            Self::TooLong => write!(f, "order number too long"),
            Self::NotNumeric => write!(f, "order number must be numeric"),
        }
    }
}
