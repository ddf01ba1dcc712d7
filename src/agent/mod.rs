//! The agent: one member of the scheduling fleet.
//!
//! Every agent runs the same state machine:
//!
//! ```text
//! Init -> Connecting -> Negotiating -> Scheduler | Executor -> Recovery
//!                           ^                  |
//!                           +---- failover ----+
//! ```
//!
//! The [`state`] module holds the pure transition function, [`node`] the
//! side effects of each state.

pub mod node;
pub mod state;
pub mod timer;

pub use node::Agent;
pub use state::{transition, AgentEvent, AgentState};
