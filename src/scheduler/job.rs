use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChronosError, Result};
use crate::scheduler::trigger::Trigger;

/// Version stamped on every encoded job.
pub const JOB_FORMAT_VERSION: u32 = 1;

/// `times_to_repeat` value for jobs that repeat forever.
pub const REPEAT_FOREVER: i64 = -1;

/// A scheduled command and the bookkeeping for its current occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub disabled: bool,
    /// `None` for one-shot jobs
    pub trigger: Option<Trigger>,
    pub next_run_at: DateTime<Utc>,
    /// Occurrences after the first one; [`REPEAT_FOREVER`] for no limit
    pub times_to_repeat: i64,
    pub remaining: i64,
    /// Attempts allowed per occurrence
    pub retries: u32,
    /// Attempts made so far for the occurrence in flight
    pub current_retries: u32,
}

#[derive(Serialize)]
struct WireJobRef<'a> {
    version: u32,
    #[serde(flatten)]
    job: &'a Job,
}

#[derive(Deserialize)]
struct WireJob {
    version: u32,
    #[serde(flatten)]
    job: Job,
}

impl Job {
    /// Create a repeating job. The first occurrence is the next one after one
    /// second before now, so a job due at definition time fires immediately.
    pub fn new(id: impl Into<String>, command: impl Into<String>, trigger: Trigger) -> Result<Self> {
        let id = id.into();
        let since = Utc::now() - chrono::Duration::seconds(1);
        let next_run_at = trigger.next_after(since).ok_or_else(|| {
            ChronosError::InvalidSchedule(format!(
                "{} has no upcoming occurrence for job {}",
                trigger, id
            ))
        })?;

        Ok(Self {
            id,
            command: command.into(),
            disabled: false,
            trigger: Some(trigger),
            next_run_at,
            times_to_repeat: REPEAT_FOREVER,
            remaining: REPEAT_FOREVER,
            retries: 1,
            current_retries: 0,
        })
    }

    /// Create a job that runs a single time at `at`.
    pub fn once(id: impl Into<String>, command: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            disabled: false,
            trigger: None,
            next_run_at: at,
            times_to_repeat: 0,
            remaining: 0,
            retries: 1,
            current_retries: 0,
        }
    }

    pub fn with_repeat(mut self, times_to_repeat: i64) -> Self {
        let times = if times_to_repeat < 0 {
            REPEAT_FOREVER
        } else {
            times_to_repeat
        };
        self.times_to_repeat = times;
        self.remaining = times;
        self
    }

    /// Every occurrence gets at least one attempt.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Attempts for the current occurrence are used up.
    pub fn failed(&self) -> bool {
        self.current_retries >= self.retries
    }

    pub fn record_attempt(&mut self) {
        self.current_retries = self.current_retries.saturating_add(1);
    }

    /// Heap priority: nanoseconds since the epoch of the next run.
    pub fn priority(&self) -> i64 {
        self.next_run_at.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now
    }

    /// Time left until the next run, zero when overdue.
    pub fn wait(&self) -> Duration {
        (self.next_run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn has_repeats_left(&self) -> bool {
        self.trigger.is_some() && self.remaining != 0
    }

    /// The occurrence that follows this one, or `None` when the job is done.
    pub fn reschedule(&self, now: DateTime<Utc>) -> Option<Job> {
        if !self.has_repeats_left() {
            return None;
        }
        let trigger = self.trigger.as_ref()?;
        let next_run_at = trigger.next_after(now.max(self.next_run_at))?;

        let mut next = self.clone();
        next.next_run_at = next_run_at;
        next.current_retries = 0;
        if next.remaining > 0 {
            next.remaining -= 1;
        }
        Some(next)
    }

    /// Move a stale occurrence forward to the next one after one second
    /// before `now`. One-shot jobs stay overdue and fire right away.
    pub fn catch_up(&mut self, now: DateTime<Utc>) {
        if self.next_run_at >= now {
            return;
        }
        if let Some(trigger) = &self.trigger {
            if let Some(next) = trigger.next_after(now - chrono::Duration::seconds(1)) {
                self.next_run_at = next;
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&WireJobRef {
            version: JOB_FORMAT_VERSION,
            job: self,
        })?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let wire: WireJob = serde_json::from_slice(bytes)?;
        Self::check_version(wire)
    }

    pub fn encode_to_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&WireJobRef {
            version: JOB_FORMAT_VERSION,
            job: self,
        })?)
    }

    pub fn decode_from_string(encoded: &str) -> Result<Self> {
        let wire: WireJob = serde_json::from_str(encoded)?;
        Self::check_version(wire)
    }

    fn check_version(wire: WireJob) -> Result<Self> {
        if wire.version > JOB_FORMAT_VERSION {
            return Err(ChronosError::Internal(format!(
                "unsupported job format version {} for job {}",
                wire.version, wire.job.id
            )));
        }
        Ok(wire.job)
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "job[id={}, command={:?}, next_run_at={}]",
            self.id,
            self.command,
            self.next_run_at.to_rfc3339()
        )
    }
}
