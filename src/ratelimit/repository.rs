//! Persistence of per-identity limit policies.

use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::policy::{DefaultLimits, IdentityKind, LimitPolicy, PolicyPatch};
use super::seed::PolicySeed;
use crate::error::{GateError, Result};
use crate::store::CounterStore;

/// Loads, fabricates and updates [`LimitPolicy`] records.
///
/// Records are always read and written whole, so a concurrent update is seen
/// either entirely or not at all.
pub struct PolicyRepository {
    store: Arc<dyn CounterStore>,
    defaults: DefaultLimits,
}

impl PolicyRepository {
    pub fn new(store: Arc<dyn CounterStore>, defaults: DefaultLimits) -> Self {
        Self { store, defaults }
    }

    pub fn defaults(&self) -> &DefaultLimits {
        &self.defaults
    }

    /// Return the stored policy, or persist and return the default for `kind`.
    ///
    /// The default is written only if no record exists, so a concurrent update
    /// is never overwritten by a fresh default.
    pub async fn get_policy(&self, identity: &str, kind: IdentityKind) -> Result<LimitPolicy> {
        if let Some(stored) = self.store.load_policy(identity).await? {
            return self.usable(identity, kind, stored).await;
        }

        let policy = self.defaults.policy_for(identity, kind);
        if self.store.save_policy_if_absent(identity, &policy).await? {
            debug!(
                identity,
                kind = %kind,
                policy_id = %policy.policy_id,
                max_requests = policy.max_requests,
                window_seconds = policy.window_seconds,
                "Created default policy"
            );
            return Ok(policy);
        }

        // Another writer stored a record between our load and save
        match self.store.load_policy(identity).await? {
            Some(stored) => self.usable(identity, kind, stored).await,
            None => Ok(policy),
        }
    }

    /// Return `stored` as is when valid. Otherwise replace its out-of-range
    /// fields with the defaults for `kind` and persist the result under the
    /// same `policy_id`.
    async fn usable(
        &self,
        identity: &str,
        kind: IdentityKind,
        stored: LimitPolicy,
    ) -> Result<LimitPolicy> {
        if stored.validate().is_ok() {
            return Ok(stored);
        }

        let fallback = self.defaults.policy_for(identity, kind);
        let repaired = LimitPolicy {
            window_seconds: if stored.window_seconds > 0 {
                stored.window_seconds
            } else {
                fallback.window_seconds
            },
            max_requests: if stored.max_requests >= 0 {
                stored.max_requests
            } else {
                fallback.max_requests
            },
            block_seconds: if stored.block_seconds >= 0 {
                stored.block_seconds
            } else {
                fallback.block_seconds
            },
            ..stored
        };
        self.store.save_policy(identity, &repaired).await?;

        warn!(
            identity,
            policy_id = %repaired.policy_id,
            window_seconds = repaired.window_seconds,
            max_requests = repaired.max_requests,
            block_seconds = repaired.block_seconds,
            "Replaced out-of-range fields of stored policy with defaults"
        );
        Ok(repaired)
    }

    /// Return the stored policy without fabricating one.
    pub async fn find_policy(&self, identity: &str) -> Result<Option<LimitPolicy>> {
        self.store.load_policy(identity).await
    }

    /// Find a policy by its generated id.
    ///
    /// Goes through the store's id index. Only ids the index does not know,
    /// such as records written before it existed, fall back to a full listing.
    pub async fn find_by_policy_id(&self, policy_id: &str) -> Result<Option<LimitPolicy>> {
        if let Some(key) = self.store.find_policy_key(policy_id).await? {
            if let Some(policy) = self.store.load_policy(&key).await? {
                if policy.policy_id == policy_id {
                    return Ok(Some(policy));
                }
            }
        }

        Ok(self
            .list_policies()
            .await?
            .into_iter()
            .find(|policy| policy.policy_id == policy_id))
    }

    /// Apply a partial update to an existing policy and persist the result.
    ///
    /// The merged policy is validated first; on failure nothing is written.
    pub async fn set_policy(&self, identity: &str, patch: &PolicyPatch) -> Result<LimitPolicy> {
        let current = self
            .store
            .load_policy(identity)
            .await?
            .ok_or_else(|| GateError::PolicyNotFound(identity.to_string()))?;

        let updated = current.merged(patch);
        updated.validate()?;
        self.store.save_policy(identity, &updated).await?;

        info!(
            identity,
            policy_id = %updated.policy_id,
            window_seconds = updated.window_seconds,
            max_requests = updated.max_requests,
            block_seconds = updated.block_seconds,
            "Policy updated"
        );
        Ok(updated)
    }

    /// Fabricate the default for `kind` if needed, then apply the patch.
    pub async fn upsert_policy(
        &self,
        identity: &str,
        kind: IdentityKind,
        patch: &PolicyPatch,
    ) -> Result<LimitPolicy> {
        let current = self.get_policy(identity, kind).await?;
        let updated = current.merged(patch);
        updated.validate()?;
        self.store.save_policy(identity, &updated).await?;

        info!(
            identity,
            kind = %kind,
            policy_id = %updated.policy_id,
            window_seconds = updated.window_seconds,
            max_requests = updated.max_requests,
            block_seconds = updated.block_seconds,
            "Policy updated"
        );
        Ok(updated)
    }

    /// Every stored policy, unordered.
    ///
    /// Records written or removed while listing may or may not appear.
    pub async fn list_policies(&self) -> Result<Vec<LimitPolicy>> {
        let keys = self.store.list_policy_keys().await?;
        let loaded = try_join_all(keys.iter().map(|key| self.store.load_policy(key))).await?;
        Ok(loaded.into_iter().flatten().collect())
    }

    /// Write seeded policies, keeping the policy id of any existing record.
    pub async fn apply_seeds(&self, seeds: &[PolicySeed]) -> Result<usize> {
        for seed in seeds {
            let policy = match self.store.load_policy(&seed.identity).await? {
                Some(existing) => existing.merged(&seed.as_patch()),
                None => LimitPolicy::new(
                    seed.identity.as_str(),
                    seed.window_seconds,
                    seed.max_requests,
                    seed.block_seconds,
                ),
            };
            policy.validate()?;
            self.store.save_policy(&seed.identity, &policy).await?;
        }
        if !seeds.is_empty() {
            info!(count = seeds.len(), "Applied policy seeds");
        }
        Ok(seeds.len())
    }
}
