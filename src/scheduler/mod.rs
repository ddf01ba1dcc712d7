//! Local scheduling: jobs, cron triggers and the time-ordered queues that
//! decide which job runs next.

pub mod calendar_queue;
pub mod engine;
pub mod job;
pub mod priority_queue;
pub mod trigger;

pub use calendar_queue::{allocate_bucket, CalendarQueue};
pub use engine::{Scheduler, TimeQueue};
pub use job::{Job, JOB_FORMAT_VERSION, REPEAT_FOREVER};
pub use priority_queue::{PqType, PriorityQueue};
pub use trigger::Trigger;
