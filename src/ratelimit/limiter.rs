//! Admission service tying locks, policies and the engine together.

use std::sync::Arc;
use tracing::trace;

use super::engine::{AdmissionEngine, Verdict};
use super::locks::IdentityLocks;
use super::policy::{DefaultLimits, Identity, LimitPolicy};
use super::repository::PolicyRepository;
use crate::error::Result;
use crate::store::CounterStore;

/// A verdict together with the policy it was computed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub policy: LimitPolicy,
    pub verdict: Verdict,
}

/// The per-request entry point of the gate.
///
/// Built once at start-up and shared by reference. It owns the identity lock
/// registry, so all decisions for one identity go through the same instance.
pub struct RateLimiter {
    locks: IdentityLocks,
    policies: PolicyRepository,
    engine: AdmissionEngine,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, defaults: DefaultLimits) -> Self {
        Self {
            locks: IdentityLocks::new(),
            policies: PolicyRepository::new(store.clone(), defaults),
            engine: AdmissionEngine::new(store),
        }
    }

    /// Decide on one request from `identity`.
    ///
    /// Holds the identity's lock from policy load through the verdict. The
    /// guard is released on every return path, store errors included.
    pub async fn check(&self, identity: &Identity) -> Result<Admission> {
        let key = identity.key();
        let _guard = self.locks.acquire(&key).await;
        trace!(identity = %key, kind = %identity.kind, "Acquired identity lock");

        let policy = self.policies.get_policy(&key, identity.kind).await?;
        let verdict = self.engine.decide(&key, &policy).await?;

        Ok(Admission { policy, verdict })
    }

    /// Policy storage, for administration.
    pub fn policies(&self) -> &PolicyRepository {
        &self.policies
    }

    /// Drop lock entries for identities with no request in flight.
    pub fn prune_idle_locks(&self) -> usize {
        self.locks.prune_idle()
    }

    /// Number of identities currently holding a lock entry.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}
