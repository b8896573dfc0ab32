//! Ratewarden - Distributed Admission Control
//!
//! This crate lets many independent server processes agree on whether a
//! caller may proceed right now. Every decision is made by the Generic Cell
//! Rate Algorithm evaluated atomically inside a shared store (Redis), so no
//! process holds authoritative rate limit state of its own.
//!
//! When the store is unreachable the limiter fails open by default: traffic
//! is admitted rather than blocked. Rate limiting therefore degrades silently
//! during store outages unless [`config::FailurePolicy::FailClosed`] is set.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
