//! Relational store capabilities used by the checkout core.
//!
//! [`Database`] and [`Transaction`] are the only way the core touches order,
//! cart and commodity rows. [`CartVerifier`] and [`AddressResolver`] are the
//! collaborators that resolve a checkout request into domain values.

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::{Order, OrderStatus, ShoppingCartItem, UserAddress};
use crate::domain::value_objects::{AddressId, CartItemId, Cents, CommodityId, OrderNo, UserId};
use crate::CheckoutError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("store state poisoned")]
    Poisoned,
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    async fn find_order(&self, order_no: &OrderNo) -> Result<Option<Order>, StoreError>;

    /// Move an order to `next` only if it is still in `expected`.
    /// Returns whether the row changed.
    async fn update_order_status(&self, order_id: Uuid, expected: OrderStatus, next: OrderStatus) -> Result<bool, StoreError>;
}

/// A relational transaction. Dropping it without commit rolls it back.
#[async_trait]
pub trait Transaction: Send {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError>;

    /// Returns the number of rows deleted.
    async fn delete_cart_items(&mut self, ids: &[CartItemId]) -> Result<u64, StoreError>;

    /// Take the write lock on a commodity's stock row and read it.
    ///
    /// Blocks until the lock is granted; `None` if the commodity does not exist.
    async fn lock_stock(&mut self, commodity_id: CommodityId) -> Result<Option<i64>, StoreError>;

    /// Write a stock value. The row must have been locked by this transaction.
    async fn write_stock(&mut self, commodity_id: CommodityId, stock: i64) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CartVerifier: Send + Sync {
    /// Resolve cart rows by id, checking they all belong to `user_id`.
    async fn checked_cart_items(&self, cart_item_ids: &[CartItemId], user_id: UserId) -> crate::Result<Vec<ShoppingCartItem>>;
}

#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn shipping_address(&self, address_id: AddressId, user_id: UserId) -> crate::Result<UserAddress>;
}

/// Commodity fields copied onto a cart line during verification.
#[derive(Clone, Debug)]
pub(crate) struct CommoditySnapshot { pub name: String, pub cover_img: String, pub selling_price: Cents }

/// Cart row joined with its commodity, as fetched by a store.
#[derive(Clone, Debug)]
pub(crate) struct CartRow {
    pub cart_item_id: CartItemId,
    pub user_id: UserId,
    pub commodity_id: CommodityId,
    pub commodity_num: i64,
    pub commodity: Option<CommoditySnapshot>,
}

/// Shared cart verification rules for every store.
pub(crate) fn check_cart_rows(ids: &[CartItemId], user_id: UserId, rows: Vec<CartRow>) -> crate::Result<Vec<ShoppingCartItem>> {
    let wanted: HashSet<CartItemId> = ids.iter().copied().collect();
    if wanted.is_empty() {
        return Err(CheckoutError::EmptyCart);
    }

    let owned: Vec<CartRow> = rows.into_iter().filter(|r| r.user_id == user_id && wanted.contains(&r.cart_item_id)).collect();
    if owned.len() != wanted.len() {
        return Err(CheckoutError::CartWrongUser(user_id));
    }

    let mut items = Vec::with_capacity(owned.len());
    for row in owned {
        let Some(commodity) = row.commodity else {
            tracing::error!(cart_item_id = row.cart_item_id, commodity_id = row.commodity_id, "cart item references a missing commodity");
            return Err(CheckoutError::CartItemParam(format!("commodity {} not found", row.commodity_id)));
        };
        items.push(ShoppingCartItem {
            cart_item_id: row.cart_item_id,
            user_id: row.user_id,
            commodity_id: row.commodity_id,
            commodity_name: commodity.name,
            commodity_img: commodity.cover_img,
            commodity_selling_price: commodity.selling_price,
            commodity_num: row.commodity_num,
        });
    }
    items.sort_by_key(|i| ids.iter().position(|id| *id == i.cart_item_id));
    Ok(items)
}
