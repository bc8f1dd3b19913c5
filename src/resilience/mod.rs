//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to store / L2 / bus:
//!     → timeouts.rs (enforce per-call deadline)
//!     → circuit_breaker.rs (flag store only: track outages, fail fast
//!       while open, single probe when half-open)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - No hidden retry loops: conflicts and outages go back to the caller
//! - The breaker is an explicit state machine with caller-visible state

pub mod circuit_breaker;
pub mod timeouts;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState};
