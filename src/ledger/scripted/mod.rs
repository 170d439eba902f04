//! Atomic script ledger.
//!
//! Every line is moved by one server-side script call, which runs as a
//! single indivisible unit on the key-value store. Scripts are loaded once
//! and invoked by SHA; the store may forget them (restart, `SCRIPT FLUSH`),
//! in which case they are reloaded and the call retried once.
//!
//! Key layout per item:
//!
//! | key | type | content |
//! |---|---|---|
//! | `mall:stock:item:{id}` | hash | `item_id`, `stock`, `version`, `modified`, `init_stock` |
//! | `mall:stock:log:{id}` | list | JSON [`DeductionLog`] entries, append only |
//! | `mall:stock:lock:{id}` | string | short-lived guard, `SET NX PX 500` |
//! | `mall:stock:orders:{id}` | hash | order number → deducted quantity |
//!
//! Seeded item ids are collected in the `mall:stock:init` set.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::{LedgerError, LedgerKind, StockLedger, StockRequest};
use crate::domain::aggregates::{DeductionLog, StockItem, StockLine};
use crate::domain::value_objects::CommodityId;
use crate::store::Transaction;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryScriptStore;
pub use self::redis::RedisScriptStore;

/// Lifetime of the per-item guard key.
pub const LOCK_TTL_MS: u64 = 500;

const INIT_SET_KEY: &str = "mall:stock:init";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Script {
    Deduct,
    Recover,
    Init,
    Inspect,
}

impl Script {
    pub const ALL: [Script; 4] = [Script::Deduct, Script::Recover, Script::Init, Script::Inspect];

    pub fn name(self) -> &'static str {
        match self {
            Self::Deduct => "deduct_stock",
            Self::Recover => "recover_stock",
            Self::Init => "init_stock",
            Self::Inspect => "inspect_stock",
        }
    }

    pub fn source(self) -> &'static str {
        match self {
            Self::Deduct => include_str!("../../../resources/deduct_stock.lua"),
            Self::Recover => include_str!("../../../resources/recover_stock.lua"),
            Self::Init => include_str!("../../../resources/init_stock.lua"),
            Self::Inspect => include_str!("../../../resources/inspect_stock.lua"),
        }
    }
}

/// One element of a flattened script reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptValue {
    Int(i64),
    Text(String),
    Nil,
}

impl ScriptValue {
    fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(s) => s.parse().ok(),
            Self::Nil => None,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script is not loaded on the store")]
    NoScript,

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Key-value store able to run the ledger's scripts.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Register a script and return its SHA.
    async fn load(&self, script: Script) -> Result<String, ScriptError>;

    /// Run a registered script. Fails with [`ScriptError::NoScript`] if the
    /// store does not know `sha`.
    async fn eval(&self, sha: &str, keys: &[String], args: &[String]) -> Result<Vec<ScriptValue>, ScriptError>;
}

/// Keys touched by the scripts for one item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StockKeys { pub item: String, pub log: String, pub lock: String, pub orders: String }

impl StockKeys {
    pub fn for_item(item_id: CommodityId) -> Self {
        Self {
            item: format!("mall:stock:item:{item_id}"),
            log: format!("mall:stock:log:{item_id}"),
            lock: format!("mall:stock:lock:{item_id}"),
            orders: format!("mall:stock:orders:{item_id}"),
        }
    }

    fn movement(&self) -> Vec<String> {
        vec![self.item.clone(), self.log.clone(), self.lock.clone(), self.orders.clone()]
    }
}

enum Reply {
    Success(Vec<ScriptValue>),
    Failure { code: String, detail: ScriptValue },
}

fn parse_reply(values: Vec<ScriptValue>) -> Result<Reply, LedgerError> {
    let mut values = values.into_iter();
    match values.next() {
        Some(ScriptValue::Text(marker)) if marker == "SUCCESS" => Ok(Reply::Success(values.collect())),
        Some(ScriptValue::Text(marker)) if marker == "err" => {
            let code = values.next().and_then(|v| v.as_text().map(str::to_string)).unwrap_or_default();
            Ok(Reply::Failure { code, detail: values.next().unwrap_or(ScriptValue::Nil) })
        }
        other => Err(LedgerError::UnexpectedReply(format!("{other:?}"))),
    }
}

fn now() -> String { Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true) }

pub struct ScriptedLedger {
    store: Arc<dyn ScriptStore>,
    shas: Mutex<HashMap<Script, String>>,
}

impl ScriptedLedger {
    pub fn new(store: Arc<dyn ScriptStore>) -> Self { Self { store, shas: Mutex::new(HashMap::new()) } }

    /// Load every script up front so the first checkout does not pay for it.
    pub async fn preload(&self) -> Result<(), LedgerError> {
        for script in Script::ALL {
            self.reload(script).await?;
        }
        Ok(())
    }

    /// Create the stock record of an item. Each item can be seeded once.
    pub async fn seed_stock(&self, item_id: CommodityId, stock: i64) -> Result<(), LedgerError> {
        if stock < 0 {
            return Err(LedgerError::InvalidQuantity { commodity_id: item_id, quantity: stock });
        }
        let keys = vec![StockKeys::for_item(item_id).item, INIT_SET_KEY.to_string()];
        let args = vec![item_id.to_string(), stock.to_string(), now()];
        match parse_reply(self.run(Script::Init, &keys, &args).await?)? {
            Reply::Success(_) => {
                tracing::info!(item_id, stock, "stock seeded");
                Ok(())
            }
            Reply::Failure { code, .. } if code == "EXISTS" => Err(LedgerError::AlreadySeeded(item_id)),
            Reply::Failure { code, detail } => Err(LedgerError::UnexpectedReply(format!("{code} {detail:?}"))),
        }
    }

    pub async fn stock_item(&self, item_id: CommodityId) -> Result<Option<StockItem>, LedgerError> {
        let Some((item, _)) = self.inspect(item_id).await? else { return Ok(None) };
        Ok(Some(item))
    }

    /// Every log entry of an item, oldest first.
    pub async fn deduction_log(&self, item_id: CommodityId) -> Result<Vec<DeductionLog>, LedgerError> {
        Ok(self.inspect(item_id).await?.map(|(_, log)| log).unwrap_or_default())
    }

    async fn inspect(&self, item_id: CommodityId) -> Result<Option<(StockItem, Vec<DeductionLog>)>, LedgerError> {
        let keys = StockKeys::for_item(item_id);
        let reply = self.run(Script::Inspect, &[keys.item, keys.log], &[]).await?;
        let fields = match parse_reply(reply)? {
            Reply::Success(fields) => fields,
            Reply::Failure { code, .. } if code == "NOT_FOUND" => return Ok(None),
            Reply::Failure { code, detail } => return Err(LedgerError::UnexpectedReply(format!("{code} {detail:?}"))),
        };
        if fields.len() < 4 {
            return Err(LedgerError::UnexpectedReply(format!("stock record of {item_id} has {} fields", fields.len())));
        }

        let int = |i: usize| fields[i].as_int().ok_or_else(|| LedgerError::UnexpectedReply(format!("field {i} of {item_id}: {:?}", fields[i])));
        let modified = fields[2]
            .as_text()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| LedgerError::UnexpectedReply(format!("modified of {item_id}: {:?}", fields[2])))?;
        let item = StockItem { item_id, stock: int(0)?, version: int(1)?, modified, init_stock: int(3)? };

        let log = fields[4..]
            .iter()
            .map(|entry| {
                let json = entry.as_text().ok_or_else(|| LedgerError::UnexpectedReply(format!("log entry {entry:?}")))?;
                serde_json::from_str::<DeductionLog>(json).map_err(|e| LedgerError::UnexpectedReply(format!("log entry {json}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some((item, log)))
    }

    async fn move_line(&self, script: Script, request: &StockRequest, line: &StockLine) -> Result<(i64, i64), LedgerError> {
        let keys = StockKeys::for_item(line.commodity_id).movement();
        let args = vec![
            line.quantity.to_string(),
            request.order_no().to_string(),
            request.user_id().to_string(),
            LOCK_TTL_MS.to_string(),
            now(),
            line.commodity_id.to_string(),
        ];

        match parse_reply(self.run(script, &keys, &args).await?)? {
            Reply::Success(values) => match (values.first().and_then(ScriptValue::as_int), values.get(1).and_then(ScriptValue::as_int)) {
                (Some(before), Some(after)) => Ok((before, after)),
                _ => Err(LedgerError::UnexpectedReply(format!("{} success without stock: {values:?}", script.name()))),
            },
            Reply::Failure { code, detail } => Err(match code.as_str() {
                "STOCK_OUT" => LedgerError::StockOut {
                    commodity_id: line.commodity_id,
                    available: detail.as_int().unwrap_or_default(),
                    requested: line.quantity,
                },
                "LOCKED" => LedgerError::Locked { commodity_id: line.commodity_id },
                "NOT_FOUND" => LedgerError::CommodityNotFound(line.commodity_id),
                "DUPLICATE" => LedgerError::DuplicateDeduction { order_no: request.order_no().to_string(), commodity_id: line.commodity_id },
                _ => LedgerError::UnexpectedReply(format!("{code} {detail:?}")),
            }),
        }
    }

    /// Undo lines that were deducted before a later line failed.
    async fn compensate(&self, request: &StockRequest, deducted: &[StockLine]) {
        for line in deducted {
            if let Err(e) = self.move_line(Script::Recover, request, line).await {
                tracing::error!(order_no = %request.order_no(), commodity_id = line.commodity_id, quantity = line.quantity, error = %e, "failed to compensate deducted stock");
            }
        }
    }

    async fn run(&self, script: Script, keys: &[String], args: &[String]) -> Result<Vec<ScriptValue>, LedgerError> {
        let sha = match self.cached_sha(script)? {
            Some(sha) => sha,
            None => self.reload(script).await?,
        };
        match self.store.eval(&sha, keys, args).await {
            Err(ScriptError::NoScript) => {
                tracing::warn!(script = script.name(), "script missing on store, reloading");
                let sha = self.reload(script).await?;
                match self.store.eval(&sha, keys, args).await {
                    Err(ScriptError::NoScript) => Err(LedgerError::ScriptSetup(format!("{} is still not loaded after reload", script.name()))),
                    other => Ok(other?),
                }
            }
            other => Ok(other?),
        }
    }

    fn cached_sha(&self, script: Script) -> Result<Option<String>, LedgerError> {
        let shas = self.shas.lock().map_err(|_| LedgerError::ScriptSetup("script cache poisoned".into()))?;
        Ok(shas.get(&script).cloned())
    }

    async fn reload(&self, script: Script) -> Result<String, LedgerError> {
        let sha = self
            .store
            .load(script)
            .await
            .map_err(|e| LedgerError::ScriptSetup(format!("loading {}: {e}", script.name())))?;
        self.shas
            .lock()
            .map_err(|_| LedgerError::ScriptSetup("script cache poisoned".into()))?
            .insert(script, sha.clone());
        Ok(sha)
    }
}

#[async_trait]
impl StockLedger for ScriptedLedger {
    fn kind(&self) -> LedgerKind { LedgerKind::Scripted }

    async fn deduct(&self, _tx: &mut dyn Transaction, request: &StockRequest) -> Result<(), LedgerError> {
        let mut deducted = Vec::with_capacity(request.lines().len());
        for line in request.lines() {
            match self.move_line(Script::Deduct, request, line).await {
                Ok((before, after)) => {
                    tracing::debug!(order_no = %request.order_no(), commodity_id = line.commodity_id, before, after, "stock deducted");
                    deducted.push(*line);
                }
                Err(e) => {
                    tracing::warn!(order_no = %request.order_no(), commodity_id = line.commodity_id, error = %e, "stock deduction rejected");
                    self.compensate(request, &deducted).await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn recover(&self, request: &StockRequest) -> Result<(), LedgerError> {
        let mut first_error = None;
        for line in request.lines() {
            if let Err(e) = self.move_line(Script::Recover, request, line).await {
                tracing::error!(order_no = %request.order_no(), commodity_id = line.commodity_id, error = %e, "stock recovery failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(order_no = %request.order_no(), lines = request.lines().len(), "stock recovered");
                Ok(())
            }
        }
    }
}
