//! Fixed-window admission decisions with cooldown blocks.

use std::fmt;
use std::sync::Arc;
use tracing::{info, trace};

use super::policy::LimitPolicy;
use crate::error::Result;
use crate::store::CounterStore;

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// An unexpired block flag exists; the counter was not touched
    Blocked,
    /// This request pushed the window count past the limit and armed the block
    LimitExceeded { count: i64 },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Blocked => write!(f, "identity is in cooldown"),
            DenyReason::LimitExceeded { count } => {
                write!(f, "request limit exceeded ({} in window)", count)
            }
        }
    }
}

/// Outcome of a single admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed {
        /// Window count including this request
        count: i64,
        /// Requests left before the limit is exceeded
        remaining: i64,
    },
    Denied { reason: DenyReason },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed { .. })
    }
}

/// Decides allow/deny for one identity against its policy.
///
/// Callers must serialize decisions per identity; the block check and the
/// increment are separate store calls.
pub struct AdmissionEngine {
    store: Arc<dyn CounterStore>,
}

impl AdmissionEngine {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Decide whether the next request from `identity` is admitted.
    ///
    /// Store failures are returned as errors, never turned into a verdict.
    pub async fn decide(&self, identity: &str, policy: &LimitPolicy) -> Result<Verdict> {
        if self.store.get_flag(identity).await? {
            trace!(identity, "Denied, block flag present");
            return Ok(Verdict::Denied {
                reason: DenyReason::Blocked,
            });
        }

        let count = self
            .store
            .increment_with_window(identity, policy.window_seconds)
            .await?;

        if count > policy.max_requests {
            self.store.set_flag(identity, policy.block_seconds).await?;
            info!(
                identity,
                count,
                max_requests = policy.max_requests,
                block_seconds = policy.block_seconds,
                "Request limit exceeded, identity blocked"
            );
            return Ok(Verdict::Denied {
                reason: DenyReason::LimitExceeded { count },
            });
        }

        trace!(identity, count, max_requests = policy.max_requests, "Allowed");
        Ok(Verdict::Allowed {
            count,
            remaining: policy.max_requests - count,
        })
    }
}
