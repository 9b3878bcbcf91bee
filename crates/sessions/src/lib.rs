//! Cursor Session Pool (§4.2): ordered pool of Cursor credentials with
//! round-robin selection, health tracking, and daily-boundary arithmetic
//! for the Scheduler's periodic tasks.

pub mod daily;
pub mod pool;

pub use daily::crossed_hour_boundary;
pub use pool::{ProbeOutcome, SessionPool, MAX_FAILURE_COUNT};
