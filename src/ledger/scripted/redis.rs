//! Redis script store (SCRIPT LOAD / EVALSHA).

use ::redis::aio::ConnectionManager;
use ::redis::{Client, ErrorKind, Value};
use async_trait::async_trait;

use super::{Script, ScriptError, ScriptStore, ScriptValue};

#[derive(Clone)]
pub struct RedisScriptStore { conn: ConnectionManager }

impl RedisScriptStore {
    pub async fn connect(url: &str) -> Result<Self, ScriptError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ScriptStore for RedisScriptStore {
    async fn load(&self, script: Script) -> Result<String, ScriptError> {
        let mut conn = self.conn.clone();
        let sha: String = ::redis::cmd("SCRIPT").arg("LOAD").arg(script.source()).query_async(&mut conn).await?;
        tracing::debug!(script = script.name(), sha = %sha, "script loaded");
        Ok(sha)
    }

    async fn eval(&self, sha: &str, keys: &[String], args: &[String]) -> Result<Vec<ScriptValue>, ScriptError> {
        let mut conn = self.conn.clone();
        let reply: Value = ::redis::cmd("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async(&mut conn)
            .await
            .map_err(|e| if e.kind() == ErrorKind::NoScriptError { ScriptError::NoScript } else { ScriptError::Redis(e) })?;
        flatten(reply)
    }
}

fn flatten(reply: Value) -> Result<Vec<ScriptValue>, ScriptError> {
    match reply {
        Value::Array(values) => values.into_iter().map(scalar).collect(),
        other => Ok(vec![scalar(other)?]),
    }
}

fn scalar(value: Value) -> Result<ScriptValue, ScriptError> {
    match value {
        Value::Nil => Ok(ScriptValue::Nil),
        Value::Int(v) => Ok(ScriptValue::Int(v)),
        Value::BulkString(bytes) => String::from_utf8(bytes)
            .map(ScriptValue::Text)
            .map_err(|e| ScriptError::Protocol(format!("non utf-8 reply: {e}"))),
        Value::SimpleString(s) => Ok(ScriptValue::Text(s)),
        Value::Okay => Ok(ScriptValue::Text("OK".into())),
        other => Err(ScriptError::Protocol(format!("unsupported reply {other:?}"))),
    }
}
