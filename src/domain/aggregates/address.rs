//! Shipping address as resolved from the user's address book

use serde::{Deserialize, Serialize};

use crate::domain::aggregates::order::OrderAddress;
use crate::domain::value_objects::{AddressId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAddress {
    pub id: AddressId,
    pub user_id: UserId,
    pub user_name: String,
    pub user_phone: String,
    pub province_name: String,
    pub city_name: String,
    pub region_name: String,
    pub detail_address: String,
}

impl UserAddress {
    /// Copy taken into the order; later edits to the address book do not reach it.
    pub fn snapshot(&self) -> OrderAddress {
        OrderAddress {
            user_name: self.user_name.clone(), user_phone: self.user_phone.clone(),
            province_name: self.province_name.clone(), city_name: self.city_name.clone(),
            region_name: self.region_name.clone(), detail_address: self.detail_address.clone(),
        }
    }
}
