//! Order creation and lifecycle.
//!
//! [`OrderService::create_order`] persists the order, consumes the cart and
//! deducts stock as one unit: either all of it becomes visible or none of it.
//! The write phase runs on its own task, so it also finishes (or compensates)
//! when the caller stops waiting for it.
//! Status changes are conditional updates guarded by the order state machine.

use std::collections::HashSet;
use std::sync::Arc;

use crate::domain::aggregates::cart::cart_item_ids;
use crate::domain::aggregates::{Order, OrderStatus, ShoppingCartItem, UserAddress};
use crate::domain::value_objects::{CartItemId, OrderNo, UserId};
use crate::ledger::{LedgerKind, StockLedger, StockRequest};
use crate::pricing::PricingChain;
use crate::store::{Database, Transaction};
use crate::{CheckoutError, Result};

pub struct OrderService {
    db: Arc<dyn Database>,
    ledger: Arc<dyn StockLedger>,
    pricing: PricingChain,
}

impl OrderService {
    pub fn new(db: Arc<dyn Database>, ledger: Arc<dyn StockLedger>, pricing: PricingChain) -> Self {
        Self { db, ledger, pricing }
    }

    /// Turn verified cart lines into a persisted order.
    pub async fn create_order(&self, items: &[ShoppingCartItem], address: &UserAddress) -> Result<Order> {
        if items.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        let user_id = address.user_id;
        if items.iter().any(|i| !i.belongs_to(user_id)) {
            return Err(CheckoutError::CartWrongUser(user_id));
        }
        let cart_ids = cart_item_ids(items);
        if cart_ids.iter().collect::<HashSet<_>>().len() != cart_ids.len() {
            return Err(CheckoutError::CartItemParam("duplicate cart item".into()));
        }

        let bill = self.pricing.bill(items)?;
        if bill.original_total <= 0 {
            return Err(CheckoutError::NonPositiveBill(bill.original_total));
        }
        let order = Order::create(&bill, items, address);
        let request = StockRequest::for_order(&order)?;

        let write = tokio::spawn(persist(self.db.clone(), self.ledger.clone(), order, cart_ids, request));
        write.await?
    }

    /// Order owned by `user_id`. Unknown and foreign orders look the same.
    pub async fn get_user_order(&self, order_no: &str, user_id: UserId) -> Result<Order> {
        let not_found = || CheckoutError::OrderNotFound(order_no.to_string());
        let parsed = OrderNo::new(order_no).map_err(|_| not_found())?;
        match self.db.find_order(&parsed).await? {
            Some(order) if order.user_id() == user_id => Ok(order),
            _ => Err(not_found()),
        }
    }

    /// Cancel an unpaid order and give its stock back.
    ///
    /// The status change is kept even when recovery fails; that case is
    /// reported as [`CheckoutError::RecoveryFailed`] for reconciliation.
    pub async fn cancel_order(&self, order_no: &str, user_id: UserId) -> Result<Order> {
        let mut order = self.get_user_order(order_no, user_id).await?;
        if !order.status().can_cancel() {
            return Err(cannot_change(&order));
        }
        self.move_status(&mut order, OrderStatus::UserCancelled).await?;

        let request = StockRequest::for_order(&order)?;
        if let Err(source) = self.ledger.recover(&request).await {
            tracing::error!(order_no = %order.order_no(), user_id, error = %source, "order cancelled but stock not recovered");
            return Err(CheckoutError::RecoveryFailed { order_no: order.order_no().to_string(), source });
        }

        tracing::info!(order_no = %order.order_no(), user_id, "order cancelled");
        Ok(order)
    }

    /// `Created → UnPaid`, when the user starts paying.
    pub async fn begin_payment(&self, order_no: &str, user_id: UserId) -> Result<Order> {
        let mut order = self.get_user_order(order_no, user_id).await?;
        if order.status() != OrderStatus::Created {
            return Err(cannot_change(&order));
        }
        self.move_status(&mut order, OrderStatus::UnPaid).await?;
        tracing::info!(order_no = %order.order_no(), user_id, "payment started");
        Ok(order)
    }

    /// Forward transition driven by payment or fulfilment callbacks.
    pub async fn advance_order(&self, order_no: &str, next: OrderStatus) -> Result<Order> {
        let parsed = OrderNo::new(order_no).map_err(|_| CheckoutError::OrderNotFound(order_no.to_string()))?;
        let mut order = self.db.find_order(&parsed).await?.ok_or_else(|| CheckoutError::OrderNotFound(order_no.to_string()))?;
        if next == OrderStatus::UserCancelled {
            return Err(cannot_change(&order));
        }
        self.move_status(&mut order, next).await?;
        tracing::info!(order_no = %order.order_no(), status = ?next, "order advanced");
        Ok(order)
    }

    async fn move_status(&self, order: &mut Order, next: OrderStatus) -> Result<()> {
        let current = order.status();
        if !current.can_transition_to(next) {
            return Err(cannot_change(order));
        }
        if !self.db.update_order_status(order.id(), current, next).await? {
            tracing::warn!(order_no = %order.order_no(), from = ?current, to = ?next, "order status changed concurrently");
            return Err(cannot_change(order));
        }
        order.transition(next).map_err(|_| cannot_change(order))?;
        Ok(())
    }
}

/// Order insert, cart delete and stock deduction in one transaction.
///
/// A scripted deduction lives outside the transaction and is recovered when
/// the commit fails.
async fn persist(db: Arc<dyn Database>, ledger: Arc<dyn StockLedger>, order: Order, cart_ids: Vec<CartItemId>, request: StockRequest) -> Result<Order> {
    let user_id = order.user_id();
    let mut tx = db.begin().await?;
    let staged = stage(ledger.as_ref(), tx.as_mut(), &order, &cart_ids, &request).await;
    if let Err(e) = staged {
        tracing::warn!(order_no = %order.order_no(), user_id, error = %e, "order rolled back");
        if let Err(rollback) = tx.rollback().await {
            tracing::error!(order_no = %order.order_no(), error = %rollback, "rollback failed");
        }
        return Err(e);
    }

    if let Err(e) = tx.commit().await {
        tracing::error!(order_no = %order.order_no(), user_id, error = %e, "order commit failed");
        if ledger.kind() == LedgerKind::Scripted {
            if let Err(recover) = ledger.recover(&request).await {
                tracing::error!(order_no = %order.order_no(), error = %recover, "stock not returned after failed commit");
            }
        }
        return Err(e.into());
    }

    tracing::info!(
        order_no = %order.order_no(), user_id, bill_money = order.bill_money(), pay_money = order.pay_money(),
        ledger = %ledger.kind(), "order created"
    );
    Ok(order)
}

async fn stage(ledger: &dyn StockLedger, tx: &mut dyn Transaction, order: &Order, cart_ids: &[CartItemId], request: &StockRequest) -> Result<()> {
    tx.insert_order(order).await?;

    let deleted = tx.delete_cart_items(cart_ids).await?;
    if deleted != cart_ids.len() as u64 {
        return Err(CheckoutError::CartItemParam(format!("{} of {} cart items already checked out", cart_ids.len() as u64 - deleted, cart_ids.len())));
    }

    ledger.deduct(tx, request).await?;
    Ok(())
}

fn cannot_change(order: &Order) -> CheckoutError {
    CheckoutError::OrderCannotBeChanged { order_no: order.order_no().to_string(), status: order.status() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::scripted::MemoryScriptStore;
    use crate::ledger::{LedgerError, RelationalLedger, ScriptedLedger};
    use crate::pricing::{DiscountRule, PricingPolicy};
    use crate::store::{CartVerifier, MemoryStore, StoreError};
    use crate::ErrorKind;
    use async_trait::async_trait;
    use std::time::Duration;
    use uuid::Uuid;

    const USER: UserId = 7;

    struct Fixture { store: MemoryStore, service: OrderService, address: UserAddress }

    fn fixture(policy: PricingPolicy) -> Fixture {
        let store = MemoryStore::new();
        let mut address = UserAddress {
            id: 0, user_id: USER, user_name: "Ada".into(), user_phone: "13800000000".into(),
            province_name: "P".into(), city_name: "C".into(), region_name: "R".into(), detail_address: "1 Main St".into(),
        };
        address.id = store.add_address(address.clone());
        let db: Arc<dyn Database> = Arc::new(store.clone());
        let service = OrderService::new(db.clone(), Arc::new(RelationalLedger::new(db)), PricingChain::new(policy));
        Fixture { store, service, address }
    }

    impl Fixture {
        async fn cart(&self, lines: &[(i64, i64)]) -> Vec<ShoppingCartItem> {
            let ids: Vec<_> = lines.iter().map(|&(commodity, qty)| self.store.add_cart_item(USER, commodity, qty)).collect();
            self.store.checked_cart_items(&ids, USER).await.unwrap()
        }
    }

    #[tokio::test]
    async fn create_order_commits_everything() {
        let coupon = DiscountRule { id: 11, name: "10 off".into(), discount: 10, threshold: 100 };
        let f = fixture(PricingPolicy { coupon: Some(coupon), ..PricingPolicy::default() });
        let a = f.store.add_commodity("A", 100, 5);
        let items = f.cart(&[(a, 2)]).await;

        let order = f.service.create_order(&items, &f.address).await.unwrap();
        assert_eq!(order.bill_money(), 200);
        assert_eq!(order.pay_money(), 190);
        assert_eq!(order.coupon_id(), Some(11));
        assert_eq!(order.status(), OrderStatus::Created);
        assert_eq!(f.store.stock(a), Some(3));
        assert!(f.store.cart_item_ids(USER).is_empty());
        assert_eq!(f.store.orders(USER).len(), 1);
    }

    #[tokio::test]
    async fn stock_out_leaves_state_unchanged() {
        let f = fixture(PricingPolicy::default());
        let a = f.store.add_commodity("A", 100, 5);
        let items = f.cart(&[(a, 10)]).await;

        let err = f.service.create_order(&items, &f.address).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Ledger(LedgerError::StockOut { .. })));
        assert_eq!(f.store.stock(a), Some(5));
        assert_eq!(f.store.cart_item_ids(USER).len(), 1);
        assert!(f.store.orders(USER).is_empty());
    }

    #[tokio::test]
    async fn zero_bill_is_a_parameter_error() {
        let f = fixture(PricingPolicy::default());
        let free = f.store.add_commodity("Free", 0, 5);
        let items = f.cart(&[(free, 1)]).await;

        let err = f.service.create_order(&items, &f.address).await.unwrap_err();
        assert!(matches!(err, CheckoutError::NonPositiveBill(0)));
        assert_eq!(f.store.stock(free), Some(5));
    }

    #[tokio::test]
    async fn failing_pricing_stage_rolls_back_as_server_error() {
        let f = fixture(PricingPolicy { membership_off_rate: 101, ..PricingPolicy::default() });
        let a = f.store.add_commodity("A", 100, 5);
        let items = f.cart(&[(a, 2)]).await;

        let err = f.service.create_order(&items, &f.address).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Pricing(_)));
        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(err.public_message(), "internal server error");
        assert!(f.store.orders(USER).is_empty());
        assert_eq!(f.store.cart_item_ids(USER).len(), 1);
        assert_eq!(f.store.stock(a), Some(5));
    }

    #[tokio::test]
    async fn rejects_empty_and_foreign_carts() {
        let f = fixture(PricingPolicy::default());
        assert!(matches!(f.service.create_order(&[], &f.address).await, Err(CheckoutError::EmptyCart)));

        let a = f.store.add_commodity("A", 100, 5);
        let mut items = f.cart(&[(a, 1)]).await;
        items[0].user_id = USER + 1;
        assert!(matches!(f.service.create_order(&items, &f.address).await, Err(CheckoutError::CartWrongUser(USER))));
    }

    #[tokio::test]
    async fn consumed_cart_aborts_the_order() {
        let f = fixture(PricingPolicy::default());
        let a = f.store.add_commodity("A", 100, 5);
        let items = f.cart(&[(a, 1)]).await;
        f.service.create_order(&items, &f.address).await.unwrap();

        let err = f.service.create_order(&items, &f.address).await.unwrap_err();
        assert!(matches!(err, CheckoutError::CartItemParam(_)));
        assert_eq!(f.store.stock(a), Some(4));
        assert_eq!(f.store.orders(USER).len(), 1);
    }

    #[tokio::test]
    async fn cancel_restores_stock() {
        let f = fixture(PricingPolicy::default());
        let a = f.store.add_commodity("A", 100, 5);
        let b = f.store.add_commodity("B", 50, 4);
        let items = f.cart(&[(b, 1), (a, 2)]).await;
        let order = f.service.create_order(&items, &f.address).await.unwrap();
        assert_eq!((f.store.stock(a), f.store.stock(b)), (Some(3), Some(3)));

        let cancelled = f.service.cancel_order(order.order_no().as_str(), USER).await.unwrap();
        assert_eq!(cancelled.status(), OrderStatus::UserCancelled);
        assert_eq!((f.store.stock(a), f.store.stock(b)), (Some(5), Some(4)));

        let err = f.service.cancel_order(order.order_no().as_str(), USER).await.unwrap_err();
        assert!(matches!(err, CheckoutError::OrderCannotBeChanged { status: OrderStatus::UserCancelled, .. }));
        assert_eq!(f.store.stock(a), Some(5));
    }

    #[tokio::test]
    async fn unpaid_order_can_be_cancelled_paid_cannot() {
        let f = fixture(PricingPolicy::default());
        let a = f.store.add_commodity("A", 100, 5);

        let first = f.service.create_order(&f.cart(&[(a, 1)]).await, &f.address).await.unwrap();
        let no = first.order_no().as_str();
        assert_eq!(f.service.begin_payment(no, USER).await.unwrap().status(), OrderStatus::UnPaid);
        f.service.cancel_order(no, USER).await.unwrap();
        assert_eq!(f.store.stock(a), Some(5));

        let second = f.service.create_order(&f.cart(&[(a, 2)]).await, &f.address).await.unwrap();
        let no = second.order_no().as_str();
        f.service.begin_payment(no, USER).await.unwrap();
        f.service.advance_order(no, OrderStatus::Paid).await.unwrap();

        let err = f.service.cancel_order(no, USER).await.unwrap_err();
        assert!(matches!(err, CheckoutError::OrderCannotBeChanged { status: OrderStatus::Paid, .. }));
        assert_eq!(f.store.stock(a), Some(3));
        assert_eq!(f.service.get_user_order(no, USER).await.unwrap().status(), OrderStatus::Paid);
    }

    #[tokio::test]
    async fn advance_follows_the_state_machine() {
        let f = fixture(PricingPolicy::default());
        let a = f.store.add_commodity("A", 100, 5);
        let order = f.service.create_order(&f.cart(&[(a, 1)]).await, &f.address).await.unwrap();
        let no = order.order_no().as_str();

        assert!(matches!(f.service.advance_order(no, OrderStatus::Shipped).await, Err(CheckoutError::OrderCannotBeChanged { .. })));
        assert!(matches!(f.service.advance_order(no, OrderStatus::UserCancelled).await, Err(CheckoutError::OrderCannotBeChanged { .. })));

        f.service.begin_payment(no, USER).await.unwrap();
        for next in [OrderStatus::Paid, OrderStatus::Shipped, OrderStatus::Completed] {
            assert_eq!(f.service.advance_order(no, next).await.unwrap().status(), next);
        }
        assert!(matches!(f.service.begin_payment(no, USER).await, Err(CheckoutError::OrderCannotBeChanged { .. })));
    }

    #[tokio::test]
    async fn foreign_and_unknown_orders_look_alike() {
        let f = fixture(PricingPolicy::default());
        let a = f.store.add_commodity("A", 100, 5);
        let order = f.service.create_order(&f.cart(&[(a, 1)]).await, &f.address).await.unwrap();

        let foreign = f.service.get_user_order(order.order_no().as_str(), USER + 1).await.unwrap_err();
        let unknown = f.service.get_user_order("20990101000000000000000007", USER).await.unwrap_err();
        let garbage = f.service.get_user_order("not-a-number", USER).await.unwrap_err();
        for err in [foreign, unknown, garbage] {
            assert!(matches!(err, CheckoutError::OrderNotFound(_)));
        }
    }

    #[tokio::test]
    async fn recovery_failure_keeps_cancelled_status() {
        let f = fixture(PricingPolicy::default());
        let a = f.store.add_commodity("A", 100, 5);
        let order = f.service.create_order(&f.cart(&[(a, 1)]).await, &f.address).await.unwrap();
        f.store.remove_commodity(a);

        let err = f.service.cancel_order(order.order_no().as_str(), USER).await.unwrap_err();
        assert!(matches!(err, CheckoutError::RecoveryFailed { source: LedgerError::CommodityNotFound(_), .. }));
        let stored = f.service.get_user_order(order.order_no().as_str(), USER).await.unwrap();
        assert_eq!(stored.status(), OrderStatus::UserCancelled);
    }

    /// Store whose commits take `delay` and then fail when `fail` is set.
    struct SlowCommit { inner: MemoryStore, delay: Duration, fail: bool }

    struct SlowTransaction { inner: Box<dyn Transaction>, delay: Duration, fail: bool }

    #[async_trait]
    impl Database for SlowCommit {
        async fn begin(&self) -> std::result::Result<Box<dyn Transaction>, StoreError> {
            let inner = self.inner.begin().await?;
            Ok(Box::new(SlowTransaction { inner, delay: self.delay, fail: self.fail }))
        }

        async fn find_order(&self, order_no: &OrderNo) -> std::result::Result<Option<Order>, StoreError> {
            self.inner.find_order(order_no).await
        }

        async fn update_order_status(&self, order_id: Uuid, expected: OrderStatus, next: OrderStatus) -> std::result::Result<bool, StoreError> {
            self.inner.update_order_status(order_id, expected, next).await
        }
    }

    #[async_trait]
    impl Transaction for SlowTransaction {
        async fn insert_order(&mut self, order: &Order) -> std::result::Result<(), StoreError> { self.inner.insert_order(order).await }
        async fn delete_cart_items(&mut self, ids: &[CartItemId]) -> std::result::Result<u64, StoreError> { self.inner.delete_cart_items(ids).await }
        async fn lock_stock(&mut self, commodity_id: i64) -> std::result::Result<Option<i64>, StoreError> { self.inner.lock_stock(commodity_id).await }
        async fn write_stock(&mut self, commodity_id: i64, stock: i64) -> std::result::Result<(), StoreError> { self.inner.write_stock(commodity_id, stock).await }

        async fn commit(self: Box<Self>) -> std::result::Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                self.inner.rollback().await?;
                return Err(StoreError::Conflict("connection lost during commit".into()));
            }
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> std::result::Result<(), StoreError> { self.inner.rollback().await }
    }

    /// Scripted ledger over `store` with slow commits; stock 5 at price 100.
    async fn scripted_with_slow_commit(store: &MemoryStore, fail: bool) -> (OrderService, Arc<ScriptedLedger>, i64) {
        let ledger = Arc::new(ScriptedLedger::new(Arc::new(MemoryScriptStore::new())));
        ledger.preload().await.unwrap();
        let a = store.add_commodity("A", 100, 5);
        ledger.seed_stock(a, 5).await.unwrap();
        let db = SlowCommit { inner: store.clone(), delay: Duration::from_millis(200), fail };
        (OrderService::new(Arc::new(db), ledger.clone(), PricingChain::default()), ledger, a)
    }

    #[tokio::test]
    async fn abandoned_checkout_gives_stock_back_when_commit_fails() {
        let f = fixture(PricingPolicy::default());
        let (service, ledger, a) = scripted_with_slow_commit(&f.store, true).await;
        let items = f.cart(&[(a, 2)]).await;

        let abandoned = tokio::time::timeout(Duration::from_millis(50), service.create_order(&items, &f.address)).await;
        assert!(abandoned.is_err());
        assert_eq!(ledger.stock_item(a).await.unwrap().unwrap().stock, 3);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ledger.stock_item(a).await.unwrap().unwrap().stock, 5);
        assert!(f.store.orders(USER).is_empty());
        assert_eq!(f.store.cart_item_ids(USER), cart_item_ids(&items));
    }

    #[tokio::test]
    async fn abandoned_checkout_still_commits() {
        let f = fixture(PricingPolicy::default());
        let (service, ledger, a) = scripted_with_slow_commit(&f.store, false).await;
        let items = f.cart(&[(a, 2)]).await;

        let abandoned = tokio::time::timeout(Duration::from_millis(50), service.create_order(&items, &f.address)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ledger.stock_item(a).await.unwrap().unwrap().stock, 3);
        assert_eq!(f.store.orders(USER).len(), 1);
        assert!(f.store.cart_item_ids(USER).is_empty());
    }
}
