//! Background clean-up of the run catalog.
//!
//! The two reapers never touch the same rows: retention only selects terminal
//! runs, the stuck-run reaper only pending or running ones.

pub mod retention;
pub mod stuck;

pub use retention::{RetentionReaper, RetentionReport};
pub use stuck::{StuckRunReaper, StuckTimeouts};
