//! Checkout application service.
//!
//! Resolves a checkout request (cart item ids + address id) into verified
//! domain values and hands them to the [`OrderService`].

use std::sync::Arc;

use crate::domain::aggregates::Order;
use crate::domain::value_objects::{AddressId, CartItemId, OrderNo, UserId};
use crate::orders::OrderService;
use crate::store::{AddressResolver, CartVerifier};
use crate::{CheckoutError, Result};

#[derive(Clone)]
pub struct CheckoutService {
    carts: Arc<dyn CartVerifier>,
    addresses: Arc<dyn AddressResolver>,
    orders: Arc<OrderService>,
}

impl CheckoutService {
    pub fn new(carts: Arc<dyn CartVerifier>, addresses: Arc<dyn AddressResolver>, orders: Arc<OrderService>) -> Self {
        Self { carts, addresses, orders }
    }

    pub fn orders(&self) -> &OrderService { &self.orders }

    pub async fn place_order(&self, user_id: UserId, cart_item_ids: &[CartItemId], address_id: AddressId) -> Result<OrderNo> {
        if cart_item_ids.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        let items = self.carts.checked_cart_items(cart_item_ids, user_id).await?;
        let address = self.addresses.shipping_address(address_id, user_id).await?;
        let order = self.orders.create_order(&items, &address).await?;
        Ok(order.order_no().clone())
    }

    pub async fn order_info(&self, order_no: &str, user_id: UserId) -> Result<Order> {
        self.orders.get_user_order(order_no, user_id).await
    }

    pub async fn cancel_order(&self, order_no: &str, user_id: UserId) -> Result<Order> {
        self.orders.cancel_order(order_no, user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::UserAddress;
    use crate::ledger::RelationalLedger;
    use crate::pricing::PricingChain;
    use crate::store::{Database, MemoryStore};

    fn service(store: &MemoryStore) -> CheckoutService {
        let db: Arc<dyn Database> = Arc::new(store.clone());
        let orders = OrderService::new(db.clone(), Arc::new(RelationalLedger::new(db)), PricingChain::default());
        CheckoutService::new(Arc::new(store.clone()), Arc::new(store.clone()), Arc::new(orders))
    }

    fn address(user_id: UserId) -> UserAddress {
        UserAddress {
            id: 0, user_id, user_name: "Ada".into(), user_phone: "13800000000".into(),
            province_name: "P".into(), city_name: "C".into(), region_name: "R".into(), detail_address: "1 Main St".into(),
        }
    }

    #[tokio::test]
    async fn place_order_end_to_end() {
        let store = MemoryStore::new();
        let a = store.add_commodity("A", 250, 5);
        let cart = store.add_cart_item(1, a, 2);
        let address_id = store.add_address(address(1));
        let checkout = service(&store);

        let order_no = checkout.place_order(1, &[cart], address_id).await.unwrap();
        let order = checkout.order_info(order_no.as_str(), 1).await.unwrap();
        assert_eq!(order.bill_money(), 500);
        assert_eq!(order.address().detail_address, "1 Main St");
        assert_eq!(order.items()[0].commodity_name, "A");
        assert_eq!(store.stock(a), Some(3));
    }

    #[tokio::test]
    async fn another_users_address_is_rejected_before_any_write() {
        let store = MemoryStore::new();
        let a = store.add_commodity("A", 250, 5);
        let cart = store.add_cart_item(1, a, 2);
        let foreign = store.add_address(address(2));

        let err = service(&store).place_order(1, &[cart], foreign).await.unwrap_err();
        assert!(matches!(err, CheckoutError::AddressParam { user_id: 1, .. }));
        assert_eq!(store.cart_item_ids(1), vec![cart]);
        assert_eq!(store.stock(a), Some(5));
    }

    #[tokio::test]
    async fn another_users_cart_is_rejected() {
        let store = MemoryStore::new();
        let a = store.add_commodity("A", 250, 5);
        let cart = store.add_cart_item(2, a, 1);
        let address_id = store.add_address(address(1));

        let err = service(&store).place_order(1, &[cart], address_id).await.unwrap_err();
        assert!(matches!(err, CheckoutError::CartWrongUser(1)));
    }

    #[tokio::test]
    async fn empty_request_is_rejected() {
        let store = MemoryStore::new();
        let err = service(&store).place_order(1, &[], 1).await.unwrap_err();
        assert!(matches!(err, CheckoutError::EmptyCart));
    }
}
