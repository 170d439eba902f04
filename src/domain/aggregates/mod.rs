//! Aggregates module
pub mod address;
pub mod cart;
pub mod order;
pub mod stock;

pub use address::UserAddress;
pub use cart::ShoppingCartItem;
pub use order::{Order, OrderAddress, OrderError, OrderHeader, OrderItem, OrderStatus};
pub use stock::{DeductionLog, StockItem, StockLine};
