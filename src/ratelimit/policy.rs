//! Per-identity limit policies and the identities they govern.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GateError, Result};

/// How an identity was derived from a request.
///
/// The kind only selects which global default seeds a first-seen identity;
/// it is not persisted with the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    /// Client network address
    Address,
    /// Bearer credential subject
    Credential,
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKind::Address => write!(f, "address"),
            IdentityKind::Credential => write!(f, "credential"),
        }
    }
}

/// Prefix separating credential keys from address keys.
pub const CREDENTIAL_KEY_PREFIX: &str = "credential:";

/// The subject a rate limit is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub subject: String,
    pub kind: IdentityKind,
}

impl Identity {
    pub fn address(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            kind: IdentityKind::Address,
        }
    }

    pub fn credential(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            kind: IdentityKind::Credential,
        }
    }

    /// Key for this identity's policy, counter, flag and lock.
    ///
    /// Addresses are used as is; credentials carry [`CREDENTIAL_KEY_PREFIX`],
    /// so a credential spelled like an address never shares its state.
    pub fn key(&self) -> String {
        match self.kind {
            IdentityKind::Address => self.subject.clone(),
            IdentityKind::Credential => format!("{}{}", CREDENTIAL_KEY_PREFIX, self.subject),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Rate-limit policy persisted against a single identity.
///
/// Aliases accept records written with the legacy field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitPolicy {
    /// The subject this policy governs
    #[serde(alias = "key")]
    pub identity: String,
    /// Length of the fixed counting window
    #[serde(alias = "seconds")]
    pub window_seconds: i64,
    /// Requests allowed within one window before blocking
    pub max_requests: i64,
    /// Cooldown once blocked
    #[serde(alias = "block_duration")]
    pub block_seconds: i64,
    /// Stable identifier for external lookup and update
    #[serde(alias = "id")]
    pub policy_id: String,
}

impl LimitPolicy {
    /// Create a policy with a freshly generated policy id.
    pub fn new(
        identity: impl Into<String>,
        window_seconds: i64,
        max_requests: i64,
        block_seconds: i64,
    ) -> Self {
        Self {
            identity: identity.into(),
            window_seconds,
            max_requests,
            block_seconds,
            policy_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Check the numeric invariants a policy must satisfy before it is written.
    pub fn validate(&self) -> Result<()> {
        validate_limits(self.window_seconds, self.max_requests, self.block_seconds)
    }

    /// Return a copy with the patch's present fields applied.
    ///
    /// `identity` and `policy_id` are never touched by a patch.
    pub fn merged(&self, patch: &PolicyPatch) -> Self {
        Self {
            identity: self.identity.clone(),
            window_seconds: patch.window_seconds.unwrap_or(self.window_seconds),
            max_requests: patch.max_requests.unwrap_or(self.max_requests),
            block_seconds: patch.block_seconds.unwrap_or(self.block_seconds),
            policy_id: self.policy_id.clone(),
        }
    }
}

pub(crate) fn validate_limits(window_seconds: i64, max_requests: i64, block_seconds: i64) -> Result<()> {
    if window_seconds <= 0 {
        return Err(GateError::InvalidPolicy(format!(
            "window_seconds must be positive, got {}",
            window_seconds
        )));
    }
    if max_requests < 0 {
        return Err(GateError::InvalidPolicy(format!(
            "max_requests must not be negative, got {}",
            max_requests
        )));
    }
    if block_seconds < 0 {
        return Err(GateError::InvalidPolicy(format!(
            "block_seconds must not be negative, got {}",
            block_seconds
        )));
    }
    Ok(())
}

/// Partial policy update.
///
/// An absent field leaves the stored value as is. A present field overrides it,
/// zero included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPatch {
    #[serde(default, alias = "seconds", skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<i64>,
    #[serde(default, alias = "block_duration", skip_serializing_if = "Option::is_none")]
    pub block_seconds: Option<i64>,
}

impl PolicyPatch {
    pub fn is_empty(&self) -> bool {
        self.window_seconds.is_none() && self.max_requests.is_none() && self.block_seconds.is_none()
    }
}

/// Global defaults used to seed the policy of a first-seen identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultLimits {
    pub window_seconds: i64,
    pub block_seconds: i64,
    pub max_requests_by_address: i64,
    pub max_requests_by_credential: i64,
}

impl DefaultLimits {
    /// Build the default policy for an identity of the given kind.
    pub fn policy_for(&self, identity: &str, kind: IdentityKind) -> LimitPolicy {
        let max_requests = match kind {
            IdentityKind::Address => self.max_requests_by_address,
            IdentityKind::Credential => self.max_requests_by_credential,
        };
        LimitPolicy::new(identity, self.window_seconds, max_requests, self.block_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        validate_limits(self.window_seconds, self.max_requests_by_address, self.block_seconds)?;
        validate_limits(self.window_seconds, self.max_requests_by_credential, self.block_seconds)
    }
}
