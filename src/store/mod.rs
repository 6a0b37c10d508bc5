//! Shared counter store contract and its implementations.
//!
//! A store holds three independent record families per identity:
//! the fixed-window request counter, the cooldown block flag and the
//! persisted [`LimitPolicy`]. Implementations namespace them so the same
//! identity key can address all three without collision. Policies are also
//! indexed by their `policy_id`.

pub mod clock;
mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::LimitPolicy;

pub use clock::{Clock, SystemClock};
pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use redis_store::{RedisStore, RedisStoreConfig};

/// Key prefix for persisted policies.
pub const POLICY_NAMESPACE: &str = "info::";
/// Key prefix for window counters.
pub const COUNTER_NAMESPACE: &str = "limit::";
/// Key prefix for block flags.
pub const BLOCK_NAMESPACE: &str = "blocked:";
/// Key prefix for the `policy_id` to identity index.
pub const POLICY_ID_NAMESPACE: &str = "policy_id::";

/// Backing store consumed by the admission engine and the policy repository.
///
/// Every operation may fail with [`GateError::StoreUnavailable`](crate::error::GateError).
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter for `key` and return the new count.
    ///
    /// A missing or expired key is created at 1 with a TTL of `window_seconds`.
    /// An existing key is incremented without touching its remaining TTL.
    async fn increment_with_window(&self, key: &str, window_seconds: i64) -> Result<i64>;

    /// Set the block flag for `key`, expiring after `ttl_seconds`.
    ///
    /// A TTL of zero or less is already expired and leaves no flag behind.
    async fn set_flag(&self, key: &str, ttl_seconds: i64) -> Result<()>;

    /// Whether an unexpired block flag exists for `key`.
    async fn get_flag(&self, key: &str) -> Result<bool>;

    /// Persist a policy under `key` with no expiry, replacing any previous record.
    ///
    /// Also points the policy's `policy_id` at `key`.
    async fn save_policy(&self, key: &str, policy: &LimitPolicy) -> Result<()>;

    /// Persist a policy under `key` only if no record exists there.
    ///
    /// Returns `false`, writing nothing, when a record is already present.
    async fn save_policy_if_absent(&self, key: &str, policy: &LimitPolicy) -> Result<bool>;

    /// Load the policy stored under `key`.
    async fn load_policy(&self, key: &str) -> Result<Option<LimitPolicy>>;

    /// Key last saved with `policy_id`. Records written by older versions
    /// may be missing from the index.
    async fn find_policy_key(&self, policy_id: &str) -> Result<Option<String>>;

    /// Keys of every persisted policy, in no particular order.
    async fn list_policy_keys(&self) -> Result<Vec<String>>;

    /// Drop expired counters and flags. Stores with native expiry need not do anything.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}
