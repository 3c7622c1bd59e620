//! State-store implementations.
//!
//! Redis is the authoritative store for everything that must survive a
//! restart: the rotated refresh credential, open positions, and the
//! active-universe view. The in-memory store backs tests and "stateless"
//! runs when no `REDIS_URL` is configured.

use crate::domain::ports::StateStore;
use crate::domain::types::Uic;
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;

pub const REFRESH_TOKEN_KEY: &str = "saxotrader:refresh_token";
pub const POSITION_KEY_PREFIX: &str = "saxotrader:position:";
pub const ACTIVE_UNIVERSE_KEY: &str = "saxotrader:active_universe";

pub fn position_key(uic: Uic) -> String {
    format!("{POSITION_KEY_PREFIX}{uic}")
}

pub struct RedisStateStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStateStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid REDIS_URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.context("Redis GET failed")?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value)
            .await
            .context("Redis SET failed")?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.context("Redis DEL failed")?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{prefix}*"))
            .query_async(&mut conn)
            .await
            .context("Redis KEYS failed")?;
        Ok(keys)
    }
}

/// In-memory stand-in used by tests and by stateless runs.
#[derive(Default)]
pub struct MemoryStateStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .map
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Position;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStateStore::new();
        store.set("saxotrader:test", "value").await.unwrap();
        assert_eq!(
            store.get("saxotrader:test").await.unwrap().as_deref(),
            Some("value")
        );

        store.delete("saxotrader:test").await.unwrap();
        assert_eq!(store.get("saxotrader:test").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_filters_by_prefix() {
        let store = MemoryStateStore::new();
        store.set(&position_key(211), "{}").await.unwrap();
        store.set(&position_key(42), "{}").await.unwrap();
        store.set(REFRESH_TOKEN_KEY, "tok").await.unwrap();

        let keys = store.keys(POSITION_KEY_PREFIX).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.starts_with(POSITION_KEY_PREFIX)));
    }

    #[tokio::test]
    async fn test_position_persists_bit_for_bit() {
        let store = MemoryStateStore::new();
        let pos = Position {
            uic: 211,
            entry_price: 10.25,
            quantity: 10.0,
            peak_price: 10.75,
        };

        store
            .set(&position_key(pos.uic), &serde_json::to_string(&pos).unwrap())
            .await
            .unwrap();

        let raw = store.get(&position_key(211)).await.unwrap().unwrap();
        let restored: Position = serde_json::from_str(&raw).unwrap();
        assert_eq!(restored, pos);
    }
}
