//! Runtime metrics sampler for the agent.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │                 Sampler                  │
//! │  poll()        keeps the latest stats    │
//! │  take_batch()  27 gauges + PollCount     │
//! │                + RandomValue             │
//! └────────────────────┬─────────────────────┘
//!                      │
//!               ┌──────▼──────┐
//!               │ StatsSource │ (trait)
//!               └──────┬──────┘
//!           ┌──────────┴──────────┐
//!    ┌──────▼──────┐       ┌──────▼──────┐
//!    │  jemalloc   │       │ FixedStats  │
//!    │  (agent)    │       │ (testing)   │
//!    └─────────────┘       └─────────────┘
//! ```

pub mod mock;
mod sampler;
mod source;

pub use mock::FixedStats;
pub use sampler::{POLL_COUNT, RANDOM_VALUE, Sampler};
pub use source::{GAUGE_NAMES, RuntimeStats, SampleError, StatsSource};
