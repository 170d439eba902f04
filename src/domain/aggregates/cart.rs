//! Cart Aggregate

use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{CartItemId, Cents, CommodityId, UserId};

/// A cart line that has been checked against its owner, with the commodity
/// name, image and selling price resolved at verification time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShoppingCartItem {
    pub cart_item_id: CartItemId,
    pub user_id: UserId,
    pub commodity_id: CommodityId,
    pub commodity_name: String,
    pub commodity_img: String,
    pub commodity_selling_price: Cents,
    pub commodity_num: i64,
}

impl ShoppingCartItem {
    /// `None` when the line total does not fit in an `i64`.
    pub fn line_total(&self) -> Option<Cents> { self.commodity_selling_price.checked_mul(self.commodity_num) }

    pub fn belongs_to(&self, user_id: UserId) -> bool { self.user_id == user_id }
}

/// Cart item ids of a checked cart, in input order.
pub fn cart_item_ids(items: &[ShoppingCartItem]) -> Vec<CartItemId> {
    items.iter().map(|i| i.cart_item_id).collect()
}
