//! In-process script store.
//!
//! Runs native equivalents of the ledger's Lua scripts against in-memory
//! hashes, lists and sets. One mutex around the whole state gives every
//! script call the same all-or-nothing execution a Redis server does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{Script, ScriptError, ScriptStore, ScriptValue};
use crate::domain::aggregates::DeductionLog;

#[derive(Default)]
pub struct MemoryScriptStore { state: Mutex<State> }

#[derive(Default)]
struct State {
    scripts: HashMap<String, Script>,
    forget_on_load: bool,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
    sets: HashMap<String, HashSet<String>>,
    locks: HashMap<String, Instant>,
}

impl MemoryScriptStore {
    pub fn new() -> Self { Self::default() }

    /// Drop every registered script, like `SCRIPT FLUSH`.
    pub fn flush_scripts(&self) {
        self.lock().scripts.clear();
    }

    /// Make `load` report a SHA without registering the script.
    pub fn forget_scripts_on_load(&self, forget: bool) {
        self.lock().forget_on_load = forget;
    }

    /// Hold an item lock key as a foreign caller would.
    pub fn hold_lock(&self, key: &str, ttl: Duration) {
        self.lock().locks.insert(key.to_string(), Instant::now() + ttl);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ScriptStore for MemoryScriptStore {
    async fn load(&self, script: Script) -> Result<String, ScriptError> {
        let sha = format!("memory:{}", script.name());
        let mut state = self.lock();
        if !state.forget_on_load {
            state.scripts.insert(sha.clone(), script);
        }
        Ok(sha)
    }

    async fn eval(&self, sha: &str, keys: &[String], args: &[String]) -> Result<Vec<ScriptValue>, ScriptError> {
        let mut state = self.lock();
        let script = *state.scripts.get(sha).ok_or(ScriptError::NoScript)?;
        match script {
            Script::Deduct => state.deduct(keys, args),
            Script::Recover => state.recover(keys, args),
            Script::Init => state.init(keys, args),
            Script::Inspect => state.inspect(keys),
        }
    }
}

fn nth<'a>(values: &'a [String], i: usize, what: &str) -> Result<&'a str, ScriptError> {
    values.get(i).map(String::as_str).ok_or_else(|| ScriptError::Protocol(format!("missing {what} {}", i + 1)))
}

fn int_arg(args: &[String], i: usize) -> Result<i64, ScriptError> {
    let raw = nth(args, i, "argument")?;
    raw.parse().map_err(|_| ScriptError::Protocol(format!("argument {} is not an integer: {raw}", i + 1)))
}

fn failure(code: &str, detail: ScriptValue) -> Vec<ScriptValue> {
    vec![ScriptValue::Text("err".into()), ScriptValue::Text(code.into()), detail]
}

fn success(before: i64, after: i64) -> Vec<ScriptValue> {
    vec![ScriptValue::Text("SUCCESS".into()), ScriptValue::Int(before), ScriptValue::Int(after)]
}

/// Arguments shared by the deduct and recover scripts.
struct Movement<'a> {
    item: &'a str,
    log: &'a str,
    lock: &'a str,
    orders: &'a str,
    quantity: i64,
    order_no: &'a str,
    user_id: i64,
    ttl: Duration,
    timestamp: &'a str,
    at: DateTime<Utc>,
    item_id: i64,
}

impl<'a> Movement<'a> {
    fn parse(keys: &'a [String], args: &'a [String]) -> Result<Self, ScriptError> {
        Ok(Self {
            item: nth(keys, 0, "key")?,
            log: nth(keys, 1, "key")?,
            lock: nth(keys, 2, "key")?,
            orders: nth(keys, 3, "key")?,
            quantity: int_arg(args, 0)?,
            order_no: nth(args, 1, "argument")?,
            user_id: int_arg(args, 2)?,
            ttl: Duration::from_millis(int_arg(args, 3)?.max(0) as u64),
            timestamp: nth(args, 4, "argument")?,
            at: DateTime::parse_from_rfc3339(nth(args, 4, "argument")?)
                .map_err(|e| ScriptError::Protocol(format!("bad timestamp: {e}")))?
                .with_timezone(&Utc),
            item_id: int_arg(args, 5)?,
        })
    }

    fn entry(&self, old_stock: i64, new_stock: i64, is_rollback: bool, succeeded: bool) -> Result<String, ScriptError> {
        let entry = DeductionLog {
            order_id: self.order_no.to_string(),
            user_id: self.user_id,
            item_id: self.item_id,
            quantity: self.quantity,
            old_stock,
            new_stock,
            timestamp: self.at,
            is_rollback,
            succeeded,
        };
        serde_json::to_string(&entry).map_err(|e| ScriptError::Protocol(e.to_string()))
    }
}

impl State {
    fn try_lock(&mut self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        if self.locks.get(key).is_some_and(|expiry| *expiry > now) {
            return false;
        }
        self.locks.insert(key.to_string(), now + ttl);
        true
    }

    fn unlock(&mut self, key: &str) {
        self.locks.remove(key);
    }

    fn stock_of(&self, item: &str) -> Result<Option<i64>, ScriptError> {
        let Some(hash) = self.hashes.get(item) else { return Ok(None) };
        let raw = hash.get("stock").map(String::as_str).unwrap_or("0");
        raw.parse().map(Some).map_err(|_| ScriptError::Protocol(format!("{item} has non-integer stock {raw}")))
    }

    fn write_stock(&mut self, m: &Movement<'_>, stock: i64) {
        let hash = self.hashes.entry(m.item.to_string()).or_default();
        hash.insert("stock".into(), stock.to_string());
        hash.insert("modified".into(), m.timestamp.to_string());
        let version = hash.get("version").and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        hash.insert("version".into(), (version + 1).to_string());
    }

    fn deduct(&mut self, keys: &[String], args: &[String]) -> Result<Vec<ScriptValue>, ScriptError> {
        let m = Movement::parse(keys, args)?;
        let Some(stock) = self.stock_of(m.item)? else {
            return Ok(failure("NOT_FOUND", ScriptValue::Text(m.item_id.to_string())));
        };
        if self.hashes.get(m.orders).is_some_and(|orders| orders.contains_key(m.order_no)) {
            return Ok(failure("DUPLICATE", ScriptValue::Text(m.order_no.to_string())));
        }
        if !self.try_lock(m.lock, m.ttl) {
            return Ok(failure("LOCKED", ScriptValue::Text(m.item_id.to_string())));
        }

        if stock < m.quantity {
            let entry = m.entry(stock, stock, false, false)?;
            self.lists.entry(m.log.to_string()).or_default().push(entry);
            self.unlock(m.lock);
            return Ok(failure("STOCK_OUT", ScriptValue::Int(stock)));
        }

        let left = stock - m.quantity;
        let entry = m.entry(stock, left, false, true)?;
        self.write_stock(&m, left);
        self.lists.entry(m.log.to_string()).or_default().push(entry);
        self.hashes.entry(m.orders.to_string()).or_default().insert(m.order_no.to_string(), m.quantity.to_string());
        self.unlock(m.lock);
        Ok(success(stock, left))
    }

    fn recover(&mut self, keys: &[String], args: &[String]) -> Result<Vec<ScriptValue>, ScriptError> {
        let m = Movement::parse(keys, args)?;
        let Some(stock) = self.stock_of(m.item)? else {
            return Ok(failure("NOT_FOUND", ScriptValue::Text(m.item_id.to_string())));
        };
        if !self.try_lock(m.lock, m.ttl) {
            return Ok(failure("LOCKED", ScriptValue::Text(m.item_id.to_string())));
        }

        let restored = stock + m.quantity;
        let entry = m.entry(stock, restored, true, true)?;
        self.write_stock(&m, restored);
        self.lists.entry(m.log.to_string()).or_default().push(entry);
        if let Some(orders) = self.hashes.get_mut(m.orders) {
            orders.remove(m.order_no);
        }
        self.unlock(m.lock);
        Ok(success(stock, restored))
    }

    fn init(&mut self, keys: &[String], args: &[String]) -> Result<Vec<ScriptValue>, ScriptError> {
        let item = nth(keys, 0, "key")?;
        let seeded = nth(keys, 1, "key")?;
        let item_id = nth(args, 0, "argument")?;
        let stock = int_arg(args, 1)?;
        let timestamp = nth(args, 2, "argument")?;

        if self.sets.get(seeded).is_some_and(|s| s.contains(item_id)) {
            return Ok(failure("EXISTS", ScriptValue::Text(item_id.to_string())));
        }
        let hash = HashMap::from([
            ("item_id".to_string(), item_id.to_string()),
            ("stock".to_string(), stock.to_string()),
            ("version".to_string(), "0".to_string()),
            ("modified".to_string(), timestamp.to_string()),
            ("init_stock".to_string(), stock.to_string()),
        ]);
        self.hashes.insert(item.to_string(), hash);
        self.sets.entry(seeded.to_string()).or_default().insert(item_id.to_string());
        Ok(success(0, stock))
    }

    fn inspect(&self, keys: &[String]) -> Result<Vec<ScriptValue>, ScriptError> {
        let item = nth(keys, 0, "key")?;
        let log = nth(keys, 1, "key")?;
        let Some(hash) = self.hashes.get(item) else {
            return Ok(failure("NOT_FOUND", ScriptValue::Text(String::new())));
        };

        let int_field = |name: &str| hash.get(name).and_then(|v| v.parse().ok()).map_or(ScriptValue::Nil, ScriptValue::Int);
        let mut reply = vec![
            ScriptValue::Text("SUCCESS".into()),
            int_field("stock"),
            int_field("version"),
            hash.get("modified").cloned().map_or(ScriptValue::Nil, ScriptValue::Text),
            int_field("init_stock"),
        ];
        reply.extend(self.lists.get(log).into_iter().flatten().cloned().map(ScriptValue::Text));
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_sha_is_noscript() {
        let store = MemoryScriptStore::new();
        assert!(matches!(store.eval("nope", &[], &[]).await, Err(ScriptError::NoScript)));

        let sha = store.load(Script::Inspect).await.unwrap();
        store.flush_scripts();
        assert!(matches!(store.eval(&sha, &[], &[]).await, Err(ScriptError::NoScript)));
    }

    #[test]
    fn lock_expires_after_ttl() {
        let store = MemoryScriptStore::new();
        store.hold_lock("k", Duration::from_millis(0));
        let mut state = store.lock();
        assert!(state.try_lock("k", Duration::from_millis(500)));
        assert!(!state.try_lock("k", Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn malformed_arguments_are_protocol_errors() {
        let store = MemoryScriptStore::new();
        let sha = store.load(Script::Deduct).await.unwrap();
        let keys: Vec<String> = ["a", "b", "c", "d"].map(String::from).into();
        let args: Vec<String> = ["x", "1", "1", "500", "2026-01-01T00:00:00Z", "1"].map(String::from).into();
        assert!(matches!(store.eval(&sha, &keys, &args).await, Err(ScriptError::Protocol(_))));
    }
}
