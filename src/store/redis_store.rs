//! Redis-backed counter store.
//!
//! Lets several gate instances share counters, block flags and policies.
//!
//! ## Key layout
//!
//! - `{prefix}info::{identity}`: policy record as JSON, no TTL
//! - `{prefix}limit::{identity}`: window counter, TTL set on first increment
//! - `{prefix}blocked:{identity}`: block flag, TTL equal to the cooldown
//! - `{prefix}policy_id::{policy_id}`: identity owning the policy, no TTL
//!
//! Commands are not retried here. A failed command surfaces as
//! [`GateError::StoreUnavailable`] and the caller decides what to do.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::fmt;
use tracing::{debug, warn};

use super::{
    CounterStore, BLOCK_NAMESPACE, COUNTER_NAMESPACE, POLICY_ID_NAMESPACE, POLICY_NAMESPACE,
};
use crate::error::{GateError, Result};
use crate::ratelimit::LimitPolicy;

/// Increment and arm the TTL only when the key was just created, so traffic
/// inside a window never pushes its end back.
const INCREMENT_WITH_WINDOW: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Write the policy only when absent, indexing its id in the same step.
const SAVE_POLICY_IF_ABSENT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
    redis.call('SET', KEYS[2], ARGV[2])
    return 1
end
return 0
"#;

/// Page size hint for `SCAN` when listing policies.
const SCAN_COUNT: usize = 100;

/// Configuration for Redis storage.
#[derive(Debug, Clone, Default)]
pub struct RedisStoreConfig {
    /// Prefix prepended to every key (default: empty)
    pub key_prefix: String,
}

/// Counter store backed by a Redis server.
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    increment: Script,
    save_if_absent: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis with default configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// Fails if the server cannot be reached.
    pub async fn connect_with_config(url: &str, config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        debug!(url, prefix = %config.key_prefix, "Connected to Redis");

        Ok(Self {
            connection,
            config,
            increment: Script::new(INCREMENT_WITH_WINDOW),
            save_if_absent: Script::new(SAVE_POLICY_IF_ABSENT),
        })
    }

    /// Round-trip a `PING` to check the connection.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn key(&self, namespace: &str, key: &str) -> String {
        format!("{}{}{}", self.config.key_prefix, namespace, key)
    }

    fn policy_prefix(&self) -> String {
        format!("{}{}", self.config.key_prefix, POLICY_NAMESPACE)
    }

    fn encode_policy(redis_key: &str, policy: &LimitPolicy) -> Result<String> {
        serde_json::to_string(policy).map_err(|e| GateError::CorruptRecord {
            key: redis_key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_with_window(&self, key: &str, window_seconds: i64) -> Result<i64> {
        let redis_key = self.key(COUNTER_NAMESPACE, key);
        let mut conn = self.connection.clone();
        let count: i64 = self
            .increment
            .key(&redis_key)
            .arg(window_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(key = %redis_key, error = %e, "Failed to increment counter");
                GateError::from(e)
            })?;
        Ok(count)
    }

    async fn set_flag(&self, key: &str, ttl_seconds: i64) -> Result<()> {
        let redis_key = self.key(BLOCK_NAMESPACE, key);
        let mut conn = self.connection.clone();
        if ttl_seconds <= 0 {
            // SET with EX 0 is rejected by Redis; a zero cooldown means no flag.
            let _: () = conn.del(&redis_key).await?;
            return Ok(());
        }
        let _: () = conn
            .set_ex(&redis_key, 1, ttl_seconds as u64)
            .await
            .map_err(|e| {
                warn!(key = %redis_key, error = %e, "Failed to set block flag");
                GateError::from(e)
            })?;
        Ok(())
    }

    async fn get_flag(&self, key: &str) -> Result<bool> {
        let redis_key = self.key(BLOCK_NAMESPACE, key);
        let mut conn = self.connection.clone();
        let present: bool = conn.exists(&redis_key).await?;
        Ok(present)
    }

    async fn save_policy(&self, key: &str, policy: &LimitPolicy) -> Result<()> {
        let redis_key = self.key(POLICY_NAMESPACE, key);
        let index_key = self.key(POLICY_ID_NAMESPACE, &policy.policy_id);
        let json = Self::encode_policy(&redis_key, policy)?;
        let mut conn = self.connection.clone();
        let _: () = redis::pipe()
            .atomic()
            .set(&redis_key, json)
            .ignore()
            .set(&index_key, key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn save_policy_if_absent(&self, key: &str, policy: &LimitPolicy) -> Result<bool> {
        let redis_key = self.key(POLICY_NAMESPACE, key);
        let index_key = self.key(POLICY_ID_NAMESPACE, &policy.policy_id);
        let json = Self::encode_policy(&redis_key, policy)?;
        let mut conn = self.connection.clone();
        let written: i64 = self
            .save_if_absent
            .key(&redis_key)
            .key(&index_key)
            .arg(json)
            .arg(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn find_policy_key(&self, policy_id: &str) -> Result<Option<String>> {
        let index_key = self.key(POLICY_ID_NAMESPACE, policy_id);
        let mut conn = self.connection.clone();
        let key: Option<String> = conn.get(&index_key).await?;
        Ok(key)
    }

    async fn load_policy(&self, key: &str) -> Result<Option<LimitPolicy>> {
        let redis_key = self.key(POLICY_NAMESPACE, key);
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(&redis_key).await?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| GateError::CorruptRecord {
                key: redis_key.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    async fn list_policy_keys(&self) -> Result<Vec<String>> {
        let prefix = self.policy_prefix();
        let pattern = format!("{}*", prefix);
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;

            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string)),
            );

            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once across pages
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}
