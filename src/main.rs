//! OpenSASE Checkout - order placement service

use anyhow::{Context, Result};
use axum::{async_trait, extract::{FromRequestParts, Path, State}, http::{request::Parts, StatusCode}, response::{IntoResponse, Response}, routing::{get, post}, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use validator::Validate;

use opensase_checkout::domain::aggregates::Order;
use opensase_checkout::ledger::{scripted::RedisScriptStore, RelationalLedger, ScriptedLedger};
use opensase_checkout::store::{Database, PgStore};
use opensase_checkout::{codes, CheckoutError, CheckoutService, Config, ErrorKind, LedgerKind, OrderService, PricingChain, StockLedger};

#[derive(Clone)] pub struct AppState { pub checkout: CheckoutService }

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();
    let config = Config::from_env()?;

    let store = PgStore::connect(&config.database_url, config.database_max_connections).await?;
    store.migrate().await?;
    let db: Arc<dyn Database> = Arc::new(store.clone());

    let ledger: Arc<dyn StockLedger> = match config.stock_ledger {
        LedgerKind::Relational => Arc::new(RelationalLedger::new(db.clone())),
        LedgerKind::Scripted => {
            let url = config.redis_url.as_deref().context("REDIS_URL must be set")?;
            let ledger = ScriptedLedger::new(Arc::new(RedisScriptStore::connect(url).await?));
            ledger.preload().await?;
            Arc::new(ledger)
        }
    };
    tracing::info!(ledger = %config.stock_ledger, "stock ledger ready");

    let orders = Arc::new(OrderService::new(db, ledger, PricingChain::new(config.pricing.clone())));
    let store = Arc::new(store);
    let state = AppState { checkout: CheckoutService::new(store.clone(), store, orders) };

    let app = Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "opensase-checkout"})) }))
        .route("/api/v1/orders", post(place_order))
        .route("/api/v1/orders/:order_no", get(get_order))
        .route("/api/v1/orders/:order_no/cancel", post(cancel_order))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()))
        .with_state(state);

    tracing::info!("OpenSASE Checkout listening on 0.0.0.0:{}", config.port);
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?, app).await?;
    Ok(())
}

/// Caller identity, set by the upstream auth gateway.
pub struct CurrentUser(pub i64);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .map(CurrentUser)
            .ok_or(ApiError::Unauthorized)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct PlaceOrderRequest {
    #[validate(length(min = 1, max = 100))]
    pub cart_item_id_list: Vec<i64>,
    #[validate(range(min = 1))]
    pub user_address_id: i64,
}

#[derive(Debug, Serialize)] pub struct PlaceOrderResponse { pub order_no: String }
#[derive(Debug, Serialize)] pub struct ErrorBody { pub code: u32, pub msg: String }

pub enum ApiError { Unauthorized, Invalid(String), Checkout(CheckoutError) }

impl From<CheckoutError> for ApiError { fn from(e: CheckoutError) -> Self { Self::Checkout(e) } }

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, ErrorBody { code: codes::PARAMS, msg: "missing or invalid x-user-id".into() }),
            Self::Invalid(msg) => (StatusCode::BAD_REQUEST, ErrorBody { code: codes::PARAMS, msg }),
            Self::Checkout(e) => {
                let status = match e.kind() {
                    ErrorKind::Parameter => StatusCode::BAD_REQUEST,
                    ErrorKind::StockOut | ErrorKind::State => StatusCode::CONFLICT,
                    ErrorKind::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::Server => {
                        tracing::error!(error = %e, "request failed");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, ErrorBody { code: e.code(), msg: e.public_message() })
            }
        };
        (status, Json(body)).into_response()
    }
}

async fn place_order(State(s): State<AppState>, CurrentUser(user_id): CurrentUser, Json(req): Json<PlaceOrderRequest>) -> std::result::Result<Json<PlaceOrderResponse>, ApiError> {
    req.validate().map_err(|e| ApiError::Invalid(e.to_string()))?;
    let order_no = s.checkout.place_order(user_id, &req.cart_item_id_list, req.user_address_id).await?;
    Ok(Json(PlaceOrderResponse { order_no: order_no.to_string() }))
}

async fn get_order(State(s): State<AppState>, CurrentUser(user_id): CurrentUser, Path(order_no): Path<String>) -> std::result::Result<Json<Order>, ApiError> {
    Ok(Json(s.checkout.order_info(&order_no, user_id).await?))
}

async fn cancel_order(State(s): State<AppState>, CurrentUser(user_id): CurrentUser, Path(order_no): Path<String>) -> std::result::Result<Json<Order>, ApiError> {
    Ok(Json(s.checkout.cancel_order(&order_no, user_id).await?))
}
