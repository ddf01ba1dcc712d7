//! Background task substrate.
//!
//! A [`Task`] wraps a fallible async closure with a stop protocol:
//! - `run_once` / `run_every` start it in the background
//! - `stop` asks it to quit, waits for the acknowledgement, then runs the
//!   task's stop hook
//!
//! [`first_error`] reduces the outcomes of many tasks to the first error, and
//! [`TaskManager`] stops every task of a role in one call.

pub mod handle;
pub mod manager;

pub use handle::{Outcome, Task};
pub use manager::{first_error, TaskManager};
