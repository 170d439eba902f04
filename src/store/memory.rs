//! In-process store.
//!
//! Behaves like the Postgres store for everything the checkout core relies
//! on: stock rows and deleted cart rows carry real write locks that a
//! transaction holds until it commits or rolls back, and a transaction's
//! writes stay invisible to everyone else until commit. Used by the test suite and for local runs
//! without a database.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{check_cart_rows, AddressResolver, CartRow, CartVerifier, CommoditySnapshot, Database, StoreError, Transaction};
use crate::domain::aggregates::{Order, OrderStatus, ShoppingCartItem, UserAddress};
use crate::domain::value_objects::{AddressId, CartItemId, Cents, CommodityId, OrderNo, UserId};
use crate::CheckoutError;

#[derive(Clone, Default)]
pub struct MemoryStore { inner: Arc<Inner> }

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    row_locks: Mutex<HashMap<Row, Arc<tokio::sync::Mutex<()>>>>,
}

/// Lockable row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Row { Commodity(CommodityId), CartItem(CartItemId) }

#[derive(Default)]
struct State {
    next_id: i64,
    commodities: BTreeMap<CommodityId, Commodity>,
    cart_items: BTreeMap<CartItemId, CartLine>,
    addresses: HashMap<AddressId, UserAddress>,
    deleted_addresses: HashSet<AddressId>,
    orders: HashMap<OrderNo, Order>,
}

#[derive(Clone, Debug)]
struct Commodity { name: String, cover_img: String, selling_price: Cents, stock: i64 }

#[derive(Clone, Debug)]
struct CartLine { user_id: UserId, commodity_id: CommodityId, quantity: i64 }

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Seeding and inspection helpers.
impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn add_commodity(&self, name: &str, selling_price: Cents, stock: i64) -> CommodityId {
        let mut state = self.lock_state();
        let id = state.next_id();
        state.commodities.insert(id, Commodity { name: name.to_string(), cover_img: format!("{id}.png"), selling_price, stock });
        id
    }

    pub fn remove_commodity(&self, commodity_id: CommodityId) {
        self.lock_state().commodities.remove(&commodity_id);
    }

    pub fn add_cart_item(&self, user_id: UserId, commodity_id: CommodityId, quantity: i64) -> CartItemId {
        let mut state = self.lock_state();
        let id = state.next_id();
        state.cart_items.insert(id, CartLine { user_id, commodity_id, quantity });
        id
    }

    /// Stores the address under a fresh id, ignoring `address.id`.
    pub fn add_address(&self, mut address: UserAddress) -> AddressId {
        let mut state = self.lock_state();
        address.id = state.next_id();
        let id = address.id;
        state.addresses.insert(id, address);
        id
    }

    pub fn remove_address(&self, address_id: AddressId) {
        self.lock_state().deleted_addresses.insert(address_id);
    }

    pub fn stock(&self, commodity_id: CommodityId) -> Option<i64> {
        self.lock_state().commodities.get(&commodity_id).map(|c| c.stock)
    }

    pub fn cart_item_ids(&self, user_id: UserId) -> Vec<CartItemId> {
        self.lock_state().cart_items.iter().filter(|(_, l)| l.user_id == user_id).map(|(id, _)| *id).collect()
    }

    pub fn orders(&self, user_id: UserId) -> Vec<Order> {
        let mut orders: Vec<Order> = self.lock_state().orders.values().filter(|o| o.user_id() == user_id).cloned().collect();
        orders.sort_by_key(|o| o.created_at());
        orders
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.inner.state.lock().map_err(|_| StoreError::Poisoned)
    }

    fn row_lock(&self, row: Row) -> Result<Arc<tokio::sync::Mutex<()>>, StoreError> {
        let mut locks = self.inner.row_locks.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(locks.entry(row).or_default().clone())
    }
}

/// Transaction over a [`MemoryStore`]; staged writes are applied on commit.
pub struct MemoryTransaction {
    store: MemoryStore,
    locks: HashMap<Row, OwnedMutexGuard<()>>,
    stock: HashMap<CommodityId, i64>,
    orders: Vec<Order>,
    deleted_cart_items: Vec<CartItemId>,
}

#[async_trait]
impl Database for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            locks: HashMap::new(),
            stock: HashMap::new(),
            orders: Vec::new(),
            deleted_cart_items: Vec::new(),
        }))
    }

    async fn find_order(&self, order_no: &OrderNo) -> Result<Option<Order>, StoreError> {
        Ok(self.state()?.orders.get(order_no).cloned())
    }

    async fn update_order_status(&self, order_id: Uuid, expected: OrderStatus, next: OrderStatus) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let Some(order) = state.orders.values_mut().find(|o| o.id() == order_id) else { return Ok(false) };
        if order.status() != expected {
            return Ok(false);
        }
        order
            .transition(next)
            .map_err(|e| StoreError::Conflict(format!("order {}: {e}", order.order_no())))?;
        Ok(true)
    }
}

impl MemoryTransaction {
    /// Blocks until this transaction holds `row`; reentrant.
    async fn lock_row(&mut self, row: Row) -> Result<(), StoreError> {
        if !self.locks.contains_key(&row) {
            let lock = self.store.row_lock(row)?;
            let guard = lock.lock_owned().await;
            self.locks.insert(row, guard);
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        if self.store.state()?.orders.contains_key(order.order_no()) {
            return Err(StoreError::Conflict(format!("duplicate order number {}", order.order_no())));
        }
        self.orders.push(order.clone());
        Ok(())
    }

    async fn delete_cart_items(&mut self, ids: &[CartItemId]) -> Result<u64, StoreError> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let mut deleted = 0;
        for id in ids {
            // a concurrent delete of the same row waits here, then sees it gone
            self.lock_row(Row::CartItem(id)).await?;
            if self.store.state()?.cart_items.contains_key(&id) && !self.deleted_cart_items.contains(&id) {
                self.deleted_cart_items.push(id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn lock_stock(&mut self, commodity_id: CommodityId) -> Result<Option<i64>, StoreError> {
        self.lock_row(Row::Commodity(commodity_id)).await?;
        if let Some(stock) = self.stock.get(&commodity_id) {
            return Ok(Some(*stock));
        }
        Ok(self.store.state()?.commodities.get(&commodity_id).map(|c| c.stock))
    }

    async fn write_stock(&mut self, commodity_id: CommodityId, stock: i64) -> Result<(), StoreError> {
        if !self.locks.contains_key(&Row::Commodity(commodity_id)) {
            return Err(StoreError::Conflict(format!("stock row {commodity_id} written without its lock")));
        }
        self.stock.insert(commodity_id, stock);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut state = this.store.state()?;

        if let Some(id) = this.deleted_cart_items.iter().find(|id| !state.cart_items.contains_key(id)) {
            return Err(StoreError::Conflict(format!("cart item {id} was consumed concurrently")));
        }
        if let Some(order) = this.orders.iter().find(|o| state.orders.contains_key(o.order_no())) {
            return Err(StoreError::Conflict(format!("duplicate order number {}", order.order_no())));
        }
        if let Some(id) = this.stock.keys().find(|id| !state.commodities.contains_key(id)) {
            return Err(StoreError::Conflict(format!("commodity {id} vanished")));
        }

        for (id, stock) in &this.stock {
            if let Some(commodity) = state.commodities.get_mut(id) {
                commodity.stock = *stock;
            }
        }
        for id in &this.deleted_cart_items {
            state.cart_items.remove(id);
        }
        for order in this.orders {
            state.orders.insert(order.order_no().clone(), order);
        }
        // row locks are released when `this.locks` drops, after the state guard
        drop(state);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl CartVerifier for MemoryStore {
    async fn checked_cart_items(&self, cart_item_ids: &[CartItemId], user_id: UserId) -> crate::Result<Vec<ShoppingCartItem>> {
        let rows = {
            let state = self.state()?;
            cart_item_ids
                .iter()
                .filter_map(|id| state.cart_items.get(id).map(|line| (*id, line)))
                .map(|(id, line)| CartRow {
                    cart_item_id: id,
                    user_id: line.user_id,
                    commodity_id: line.commodity_id,
                    commodity_num: line.quantity,
                    commodity: state.commodities.get(&line.commodity_id).map(|c| CommoditySnapshot {
                        name: c.name.clone(),
                        cover_img: c.cover_img.clone(),
                        selling_price: c.selling_price,
                    }),
                })
                .collect::<Vec<_>>()
        };
        check_cart_rows(cart_item_ids, user_id, rows)
    }
}

#[async_trait]
impl AddressResolver for MemoryStore {
    async fn shipping_address(&self, address_id: AddressId, user_id: UserId) -> crate::Result<UserAddress> {
        let state = self.state()?;
        match state.addresses.get(&address_id) {
            Some(address) if address.user_id == user_id && !state.deleted_addresses.contains(&address_id) => Ok(address.clone()),
            _ => Err(CheckoutError::AddressParam { address_id, user_id }),
        }
    }
}
