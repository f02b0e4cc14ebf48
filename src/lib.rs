//! Turnstile - In-process Request Admission Control
//!
//! This crate decides, for every inbound request, whether it may proceed.
//! Decisions come from rules keyed by endpoint pattern and caller identity,
//! each counted with one of several windowing algorithms. All state lives in
//! memory inside a [`RateLimiter`] instance; there are no global registries.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use ratelimit::{
    Algorithm, BurstProtection, RateLimitResult, RateLimiter, Reason, Request, Rule,
};
