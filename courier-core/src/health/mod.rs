//! Relay health tracking with circuit breaking and exponential backoff.
//!
//! # Circuit Breaker
//!
//! ```text
//!            failure_threshold consecutive failures
//!   Closed ─────────────────────────────────────────▶ Open
//!     ▲                                                │
//!     │ success_threshold                              │ open_duration elapsed
//!     │ consecutive successes                          ▼
//!     └────────────────────────────────────────── HalfOpen
//!                                                      │
//!                     any failure (fresh cooldown) ────┘──▶ Open
//! ```
//!
//! The health score (healthy=3, degraded=2, unhealthy=1, unknown=0) only
//! orders relays for publishing. Excluding a relay is the breaker's job.

mod monitor;
mod types;

pub use monitor::HealthMonitor;
pub use types::{CircuitState, HealthStatus, RelayHealthMetrics};
