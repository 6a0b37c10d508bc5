//! Admission control: policies, the fixed-window engine and per-identity serialization.

mod engine;
mod limiter;
mod locks;
mod policy;
mod repository;
mod seed;

pub use engine::{AdmissionEngine, DenyReason, Verdict};
pub use limiter::{Admission, RateLimiter};
pub use locks::IdentityLocks;
pub use policy::{
    DefaultLimits, Identity, IdentityKind, LimitPolicy, PolicyPatch, CREDENTIAL_KEY_PREFIX,
};
pub use repository::PolicyRepository;
pub use seed::{PolicySeed, PolicySeedFile};
