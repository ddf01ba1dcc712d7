//! Local job execution.
//!
//! - [`CommandRunner`]: runs one attempt of a job's command; [`ShellRunner`]
//!   spawns `sh -c <command>` and captures its output
//! - [`Supervisor`]: retries a claimed job up to its per-occurrence budget and
//!   reports [`ChronosError::ExhaustedRetries`](crate::error::ChronosError::ExhaustedRetries)
//!   when every attempt failed. Exhausted occurrences are dropped, never
//!   escalated to the agent.

pub mod runner;
pub mod supervisor;

pub use runner::{CommandRunner, ExecutionResult, ExecutionStatus, ShellRunner};
pub use supervisor::Supervisor;
