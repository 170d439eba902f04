//! Postgres store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use uuid::Uuid;

use super::{check_cart_rows, AddressResolver, CartRow, CartVerifier, CommoditySnapshot, Database, StoreError, Transaction};
use crate::domain::aggregates::{Order, OrderAddress, OrderHeader, OrderItem, OrderStatus, ShoppingCartItem, UserAddress};
use crate::domain::value_objects::{AddressId, CartItemId, CommodityId, OrderNo, UserId};
use crate::CheckoutError;

#[derive(Clone)]
pub struct PgStore { pool: PgPool }

pub struct PgTransaction { tx: sqlx::Transaction<'static, Postgres> }

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid, order_no: String, user_id: i64, bill_money: i64, pay_money: i64, order_status: i16,
    coupon_id: Option<i64>, promotion_id: Option<i64>, created_at: DateTime<Utc>, updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct OrderItemRow { commodity_id: i64, commodity_name: String, commodity_img: String, unit_price: i64, quantity: i64 }

#[derive(sqlx::FromRow)]
struct AddressRow { user_name: String, user_phone: String, province_name: String, city_name: String, region_name: String, detail_address: String }

#[derive(sqlx::FromRow)]
struct UserAddressRow {
    id: i64, user_id: i64, user_name: String, user_phone: String, province_name: String,
    city_name: String, region_name: String, detail_address: String,
}

#[derive(sqlx::FromRow)]
struct CartJoinRow {
    cart_item_id: i64, user_id: i64, commodity_id: i64, commodity_num: i64,
    name: Option<String>, cover_img: Option<String>, selling_price: Option<i64>,
}

impl OrderRow {
    fn into_header(self) -> Result<OrderHeader, StoreError> {
        let order_no = OrderNo::new(self.order_no).map_err(|e| StoreError::Corrupt(format!("order {}: {e}", self.id)))?;
        let status = OrderStatus::from_code(self.order_status)
            .ok_or_else(|| StoreError::Corrupt(format!("order {}: unknown status {}", self.id, self.order_status)))?;
        Ok(OrderHeader {
            id: self.id, order_no, user_id: self.user_id, bill_money: self.bill_money, pay_money: self.pay_money,
            status, coupon_id: self.coupon_id, promotion_id: self.promotion_id,
            created_at: self.created_at, updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl Database for PgStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn find_order(&self, order_no: &OrderNo) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT id, order_no, user_id, bill_money, pay_money, order_status, coupon_id, promotion_id, created_at, updated_at FROM orders WHERE order_no = $1",
        )
        .bind(order_no.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let header = row.into_header()?;

        let items = sqlx::query_as::<_, OrderItemRow>(
            "SELECT commodity_id, commodity_name, commodity_img, unit_price, quantity FROM order_items WHERE order_id = $1 ORDER BY id",
        )
        .bind(header.id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| OrderItem { commodity_id: r.commodity_id, commodity_name: r.commodity_name, commodity_img: r.commodity_img, unit_price: r.unit_price, quantity: r.quantity })
        .collect();

        let address = sqlx::query_as::<_, AddressRow>(
            "SELECT user_name, user_phone, province_name, city_name, region_name, detail_address FROM order_addresses WHERE order_id = $1",
        )
        .bind(header.id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::Corrupt(format!("order {} has no address", header.order_no)))?;
        let address = OrderAddress {
            user_name: address.user_name, user_phone: address.user_phone, province_name: address.province_name,
            city_name: address.city_name, region_name: address.region_name, detail_address: address.detail_address,
        };

        Ok(Some(Order::restore(header, items, address)))
    }

    async fn update_order_status(&self, order_id: Uuid, expected: OrderStatus, next: OrderStatus) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE orders SET order_status = $3, updated_at = NOW() WHERE id = $1 AND order_status = $2")
            .bind(order_id)
            .bind(expected.code())
            .bind(next.code())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, order_no, user_id, bill_money, pay_money, order_status, coupon_id, promotion_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(order.id())
        .bind(order.order_no().as_str())
        .bind(order.user_id())
        .bind(order.bill_money())
        .bind(order.pay_money())
        .bind(order.status().code())
        .bind(order.coupon_id())
        .bind(order.promotion_id())
        .bind(order.created_at())
        .bind(order.updated_at())
        .execute(&mut *self.tx)
        .await?;

        let items = order.items();
        let commodity_ids: Vec<i64> = items.iter().map(|i| i.commodity_id).collect();
        let names: Vec<String> = items.iter().map(|i| i.commodity_name.clone()).collect();
        let imgs: Vec<String> = items.iter().map(|i| i.commodity_img.clone()).collect();
        let prices: Vec<i64> = items.iter().map(|i| i.unit_price).collect();
        let quantities: Vec<i64> = items.iter().map(|i| i.quantity).collect();
        sqlx::query(
            r#"
            INSERT INTO order_items (order_id, commodity_id, commodity_name, commodity_img, unit_price, quantity)
            SELECT $1::uuid, * FROM UNNEST($2::bigint[], $3::text[], $4::text[], $5::bigint[], $6::bigint[])
            "#,
        )
        .bind(order.id())
        .bind(&commodity_ids)
        .bind(&names)
        .bind(&imgs)
        .bind(&prices)
        .bind(&quantities)
        .execute(&mut *self.tx)
        .await?;

        let address = order.address();
        sqlx::query(
            r#"
            INSERT INTO order_addresses (order_id, user_name, user_phone, province_name, city_name, region_name, detail_address)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(order.id())
        .bind(&address.user_name)
        .bind(&address.user_phone)
        .bind(&address.province_name)
        .bind(&address.city_name)
        .bind(&address.region_name)
        .bind(&address.detail_address)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn delete_cart_items(&mut self, ids: &[CartItemId]) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM shopping_cart_items WHERE cart_item_id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn lock_stock(&mut self, commodity_id: CommodityId) -> Result<Option<i64>, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT stock_num FROM commodities WHERE id = $1 FOR UPDATE")
            .bind(commodity_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(|(stock,)| stock))
    }

    async fn write_stock(&mut self, commodity_id: CommodityId, stock: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE commodities SET stock_num = $2, updated_at = NOW() WHERE id = $1")
            .bind(commodity_id)
            .bind(stock)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl CartVerifier for PgStore {
    async fn checked_cart_items(&self, cart_item_ids: &[CartItemId], user_id: UserId) -> crate::Result<Vec<ShoppingCartItem>> {
        let rows = sqlx::query_as::<_, CartJoinRow>(
            r#"
            SELECT c.cart_item_id, c.user_id, c.commodity_id, c.commodity_num, m.name, m.cover_img, m.selling_price
            FROM shopping_cart_items c
            LEFT JOIN commodities m ON m.id = c.commodity_id
            WHERE c.cart_item_id = ANY($1)
            "#,
        )
        .bind(cart_item_ids.to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let rows = rows
            .into_iter()
            .map(|r| CartRow {
                cart_item_id: r.cart_item_id,
                user_id: r.user_id,
                commodity_id: r.commodity_id,
                commodity_num: r.commodity_num,
                commodity: match (r.name, r.selling_price) {
                    (Some(name), Some(selling_price)) => Some(CommoditySnapshot { name, cover_img: r.cover_img.unwrap_or_default(), selling_price }),
                    _ => None,
                },
            })
            .collect();
        check_cart_rows(cart_item_ids, user_id, rows)
    }
}

#[async_trait]
impl AddressResolver for PgStore {
    async fn shipping_address(&self, address_id: AddressId, user_id: UserId) -> crate::Result<UserAddress> {
        let row = sqlx::query_as::<_, UserAddressRow>(
            r#"
            SELECT id, user_id, user_name, user_phone, province_name, city_name, region_name, detail_address
            FROM user_addresses WHERE id = $1 AND is_del = FALSE
            "#,
        )
        .bind(address_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        match row {
            Some(r) if r.user_id == user_id => Ok(UserAddress {
                id: r.id, user_id: r.user_id, user_name: r.user_name, user_phone: r.user_phone,
                province_name: r.province_name, city_name: r.city_name, region_name: r.region_name, detail_address: r.detail_address,
            }),
            _ => Err(CheckoutError::AddressParam { address_id, user_id }),
        }
    }
}
