//! Order Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::aggregates::address::UserAddress;
use crate::domain::aggregates::cart::ShoppingCartItem;
use crate::domain::aggregates::stock::StockLine;
use crate::domain::value_objects::{Cents, CommodityId, OrderNo, UserId};
use crate::pricing::Bill;

/// A placed order.
///
/// Items and address are snapshots taken at checkout; only `status` changes
/// after creation.
#[derive(Clone, Debug, Serialize)]
pub struct Order {
    id: Uuid,
    order_no: OrderNo,
    user_id: UserId,
    bill_money: Cents,
    pay_money: Cents,
    status: OrderStatus,
    coupon_id: Option<i64>,
    promotion_id: Option<i64>,
    items: Vec<OrderItem>,
    address: OrderAddress,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Persisted order header, used to rebuild an [`Order`] from storage.
#[derive(Clone, Debug)]
pub struct OrderHeader {
    pub id: Uuid,
    pub order_no: OrderNo,
    pub user_id: UserId,
    pub bill_money: Cents,
    pub pay_money: Cents,
    pub status: OrderStatus,
    pub coupon_id: Option<i64>,
    pub promotion_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem { pub commodity_id: CommodityId, pub commodity_name: String, pub commodity_img: String, pub unit_price: Cents, pub quantity: i64 }

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAddress { pub user_name: String, pub user_phone: String, pub province_name: String, pub city_name: String, pub region_name: String, pub detail_address: String }

/// Order lifecycle.
///
/// `Created → UnPaid → Paid → Shipped → Completed`, plus the cancellation
/// edge `Created | UnPaid → UserCancelled`. The discriminants are the
/// persisted status codes and follow the forward order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum OrderStatus {
    #[default]
    Created = 0,
    UnPaid = 1,
    Paid = 2,
    Shipped = 3,
    Completed = 4,
    UserCancelled = 5,
}

impl OrderStatus {
    pub fn code(self) -> i16 { self as i16 }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Created),
            1 => Some(Self::UnPaid),
            2 => Some(Self::Paid),
            3 => Some(Self::Shipped),
            4 => Some(Self::Completed),
            5 => Some(Self::UserCancelled),
            _ => None,
        }
    }

    /// Cancellation is allowed strictly before payment.
    pub fn can_cancel(self) -> bool { self < Self::Paid }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Created, UnPaid) | (UnPaid, Paid) | (Paid, Shipped) | (Shipped, Completed) => true,
            (_, UserCancelled) => self.can_cancel(),
            _ => false,
        }
    }
}

impl Order {
    pub fn create(bill: &Bill, items: &[ShoppingCartItem], address: &UserAddress) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(), order_no: OrderNo::generate(address.user_id), user_id: address.user_id,
            bill_money: bill.original_total, pay_money: bill.total, status: OrderStatus::Created,
            coupon_id: bill.coupon.as_ref().map(|c| c.id), promotion_id: bill.promotion.as_ref().map(|p| p.id),
            items: items.iter().map(OrderItem::snapshot).collect(), address: address.snapshot(),
            created_at: now, updated_at: now,
        }
    }

    pub fn restore(header: OrderHeader, items: Vec<OrderItem>, address: OrderAddress) -> Self {
        Self {
            id: header.id, order_no: header.order_no, user_id: header.user_id,
            bill_money: header.bill_money, pay_money: header.pay_money, status: header.status,
            coupon_id: header.coupon_id, promotion_id: header.promotion_id,
            items, address, created_at: header.created_at, updated_at: header.updated_at,
        }
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn order_no(&self) -> &OrderNo { &self.order_no }
    pub fn user_id(&self) -> UserId { self.user_id }
    pub fn bill_money(&self) -> Cents { self.bill_money }
    pub fn pay_money(&self) -> Cents { self.pay_money }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn coupon_id(&self) -> Option<i64> { self.coupon_id }
    pub fn promotion_id(&self) -> Option<i64> { self.promotion_id }
    pub fn items(&self) -> &[OrderItem] { &self.items }
    pub fn address(&self) -> &OrderAddress { &self.address }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    /// One stock line per order item, in item order.
    pub fn stock_lines(&self) -> impl Iterator<Item = StockLine> + '_ {
        self.items.iter().map(|item| StockLine { commodity_id: item.commodity_id, quantity: item.quantity })
    }

    pub fn transition(&mut self, next: OrderStatus) -> Result<(), OrderError> {
        if !self.status.can_transition_to(next) {
            return Err(OrderError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

impl OrderItem {
    fn snapshot(item: &ShoppingCartItem) -> Self {
        Self {
            commodity_id: item.commodity_id, commodity_name: item.commodity_name.clone(),
            commodity_img: item.commodity_img.clone(), unit_price: item.commodity_selling_price, quantity: item.commodity_num,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum OrderError { InvalidTransition { from: OrderStatus, to: OrderStatus } }
impl std::error::Error for OrderError {}
impl std::fmt::Display for OrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self { Self::InvalidTransition { from, to } => write!(f, "cannot move order from {from:?} to {to:?}") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::{PricingChain, PricingPolicy};

    fn cart_item(id: i64, commodity_id: i64, price: i64, qty: i64) -> ShoppingCartItem {
        ShoppingCartItem {
            cart_item_id: id, user_id: 7, commodity_id, commodity_name: format!("C{commodity_id}"),
            commodity_img: String::new(), commodity_selling_price: price, commodity_num: qty,
        }
    }

    fn address() -> UserAddress {
        UserAddress { id: 1, user_id: 7, user_name: "Ada".into(), user_phone: "13800000000".into(), province_name: "P".into(), city_name: "C".into(), region_name: "R".into(), detail_address: "1 Main St".into() }
    }

    fn order(items: &[ShoppingCartItem]) -> Order {
        let bill = PricingChain::new(PricingPolicy::default()).bill(items).unwrap();
        Order::create(&bill, items, &address())
    }

    #[test]
    fn test_create_snapshots_cart_and_address() {
        let items = vec![cart_item(1, 10, 100, 2)];
        let order = order(&items);
        assert_eq!(order.status(), OrderStatus::Created);
        assert_eq!(order.user_id(), 7);
        assert_eq!(order.bill_money(), 200);
        assert_eq!(order.items()[0].unit_price, 100);
        assert_eq!(order.address().detail_address, "1 Main St");
    }

    #[test]
    fn test_stock_lines_follow_items() {
        let items = vec![cart_item(1, 30, 1, 1), cart_item(2, 10, 1, 2), cart_item(3, 30, 1, 4)];
        let lines: Vec<_> = order(&items).stock_lines().collect();
        assert_eq!(lines, vec![
            StockLine { commodity_id: 30, quantity: 1 },
            StockLine { commodity_id: 10, quantity: 2 },
            StockLine { commodity_id: 30, quantity: 4 },
        ]);
    }

    #[test]
    fn test_status_machine() {
        use OrderStatus::*;
        assert!(Created.can_transition_to(UnPaid));
        assert!(Created.can_transition_to(UserCancelled));
        assert!(UnPaid.can_transition_to(UserCancelled));
        assert!(!Paid.can_transition_to(UserCancelled));
        assert!(!UserCancelled.can_transition_to(UserCancelled));
        assert!(!Created.can_transition_to(Paid));
        assert!(!Completed.can_transition_to(Shipped));
    }

    #[test]
    fn test_transition_rejects_backwards_move() {
        let mut order = order(&[cart_item(1, 10, 100, 1)]);
        order.transition(OrderStatus::UnPaid).unwrap();
        let err = order.transition(OrderStatus::Created).unwrap_err();
        assert_eq!(err, OrderError::InvalidTransition { from: OrderStatus::UnPaid, to: OrderStatus::Created });
        assert_eq!(order.status(), OrderStatus::UnPaid);
    }

    #[test]
    fn test_status_codes_round_trip() {
        for status in [OrderStatus::Created, OrderStatus::Paid, OrderStatus::UserCancelled] {
            assert_eq!(OrderStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(OrderStatus::from_code(42), None);
    }
}
