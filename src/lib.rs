//! Turnstile - HTTP Request Admission Gate
//!
//! This crate decides, per client identity (network address or bearer
//! credential), whether a request is forwarded or rejected. Each identity
//! gets a fixed-window request limit and an automatic cooldown once the
//! limit is exceeded. Counters live in a shared store, and decisions for
//! the same identity are serialized so concurrent requests cannot race on
//! the counter.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
