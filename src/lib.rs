//! OpenSASE Checkout
//!
//! Order-placement pipeline: turns a verified shopping cart into a durable
//! order without overselling stock under concurrent checkout.
//!
//! ## Features
//! - Pricing chain (coupon, promotional discount, membership tier)
//! - Atomic order creation with cart cleanup and stock deduction
//! - Two stock ledgers: relational row locks or an atomic Redis script
//! - Cancellation with stock recovery

use thiserror::Error;

pub mod checkout;
pub mod config;
pub mod domain;
pub mod ledger;
pub mod orders;
pub mod pricing;
pub mod store;

pub use checkout::CheckoutService;
pub use config::Config;
pub use ledger::{LedgerError, LedgerKind, StockLedger};
pub use orders::OrderService;
pub use pricing::{Bill, PricingChain, PricingPolicy};

use domain::aggregates::OrderStatus;
use domain::value_objects::{AddressId, Cents, UserId};
use ledger::ScriptError;
use pricing::PricingError;
use store::StoreError;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum CheckoutError {
    #[error("cart is empty")]
    EmptyCart,

    #[error("bill must be positive, got {0}")]
    NonPositiveBill(Cents),

    #[error("cart items do not belong to user {0}")]
    CartWrongUser(UserId),

    #[error("invalid cart items: {0}")]
    CartItemParam(String),

    #[error("address {address_id} is not a shipping address of user {user_id}")]
    AddressParam { address_id: AddressId, user_id: UserId },

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("order {order_no} can not be changed in status {status:?}")]
    OrderCannotBeChanged { order_no: String, status: OrderStatus },

    #[error("pricing failed: {0}")]
    Pricing(#[from] PricingError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("order {order_no} cancelled but stock not recovered: {source}")]
    RecoveryFailed { order_no: String, #[source] source: LedgerError },

    #[error("order task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, CheckoutError>;

/// Error categories callers can act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Parameter,
    StockOut,
    TooManyRequests,
    NotFound,
    State,
    Server,
}

pub mod codes {
    pub const SERVER: u32 = 10000000;
    pub const PARAMS: u32 = 10000001;
    pub const NOT_FOUND: u32 = 10000002;
    pub const TOO_MANY_REQUESTS: u32 = 10000006;
    pub const COMMODITY_NOT_EXISTS: u32 = 10000200;
    pub const STOCK_OUT: u32 = 10000201;
    pub const CART_ITEM_PARAM: u32 = 10000300;
    pub const CART_WRONG_USER: u32 = 10000301;
    pub const ORDER_PARAMS: u32 = 10000500;
    pub const ORDER_CAN_NOT_BE_CHANGED: u32 = 10000501;
}

impl From<ScriptError> for CheckoutError {
    fn from(e: ScriptError) -> Self { Self::Ledger(e.into()) }
}

impl CheckoutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyCart | Self::NonPositiveBill(_) | Self::CartWrongUser(_) | Self::CartItemParam(_) | Self::AddressParam { .. } | Self::OrderNotFound(_) => ErrorKind::Parameter,
            Self::OrderCannotBeChanged { .. } => ErrorKind::State,
            Self::Ledger(e) => match e {
                LedgerError::StockOut { .. } => ErrorKind::StockOut,
                LedgerError::Locked { .. } => ErrorKind::TooManyRequests,
                LedgerError::CommodityNotFound(_) => ErrorKind::NotFound,
                LedgerError::DuplicateDeduction { .. } | LedgerError::InvalidQuantity { .. } => ErrorKind::Parameter,
                _ => ErrorKind::Server,
            },
            Self::Pricing(_) | Self::Store(_) | Self::RecoveryFailed { .. } | Self::Task(_) => ErrorKind::Server,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::EmptyCart | Self::AddressParam { .. } => codes::PARAMS,
            Self::OrderNotFound(_) => codes::ORDER_PARAMS,
            Self::CartWrongUser(_) => codes::CART_WRONG_USER,
            Self::NonPositiveBill(_) | Self::CartItemParam(_) => codes::CART_ITEM_PARAM,
            Self::OrderCannotBeChanged { .. } => codes::ORDER_CAN_NOT_BE_CHANGED,
            Self::Ledger(e) => match e {
                LedgerError::StockOut { .. } => codes::STOCK_OUT,
                LedgerError::Locked { .. } => codes::TOO_MANY_REQUESTS,
                LedgerError::CommodityNotFound(_) => codes::COMMODITY_NOT_EXISTS,
                LedgerError::DuplicateDeduction { .. } => codes::ORDER_PARAMS,
                LedgerError::InvalidQuantity { .. } => codes::PARAMS,
                _ => codes::SERVER,
            },
            Self::Pricing(_) | Self::Store(_) | Self::RecoveryFailed { .. } | Self::Task(_) => codes::SERVER,
        }
    }

    /// Message safe to show to a client. Never carries store or script text.
    pub fn public_message(&self) -> String {
        match self {
            Self::EmptyCart => "cart is empty".into(),
            Self::NonPositiveBill(_) => "order amount must be positive".into(),
            Self::CartWrongUser(_) => "cart items do not belong to the user".into(),
            Self::CartItemParam(_) => "cart items are invalid".into(),
            Self::AddressParam { .. } => "shipping address is invalid".into(),
            Self::OrderNotFound(_) => "order does not exist".into(),
            Self::OrderCannotBeChanged { .. } => "order can not be changed".into(),
            Self::Ledger(LedgerError::StockOut { commodity_id, .. }) => format!("commodity {commodity_id} is out of stock"),
            Self::Ledger(LedgerError::Locked { .. }) => "too many requests, please retry".into(),
            Self::Ledger(LedgerError::CommodityNotFound(id)) => format!("commodity {id} does not exist"),
            Self::Ledger(LedgerError::DuplicateDeduction { .. }) => "order was already submitted".into(),
            Self::Ledger(LedgerError::InvalidQuantity { .. }) => "invalid quantity".into(),
            _ => "internal server error".into(),
        }
    }
}
