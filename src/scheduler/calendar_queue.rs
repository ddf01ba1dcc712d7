//! Calendar queue: a bucketed priority queue for future-dated jobs.
//!
//! The timeline starting at the queue's epoch is cut into windows of
//! `bucket_width`. Window `w` lands in bucket `w mod bucket_count`, so a bucket
//! holds jobs from many windows ("cycles"). Each bucket is a min-ordered
//! [`PriorityQueue`].
//!
//! Finding the next job walks windows forward from a cursor that is never later
//! than any queued job. A bucket's head is accepted only when it lies before the
//! end of the window being scanned; otherwise it belongs to a later cycle and the
//! walk moves on. After one full wrap without a hit the walk jumps to the cycle
//! of the earliest bucket head instead of crawling through empty cycles.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::scheduler::engine::TimeQueue;
use crate::scheduler::job::Job;
use crate::scheduler::priority_queue::{PqType, PriorityQueue};

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX).max(1)
}

fn timestamp_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Index of the window containing `at_ns`; anything before the reference
/// falls in window 0.
fn window_index(reference_ns: i64, at_ns: i64, width_ns: i64) -> i64 {
    at_ns.saturating_sub(reference_ns).max(0) / width_ns
}

/// Bucket for a job due at `at`, relative to `now`:
/// `floor((at - now) / bucket_width) mod bucket_count`, overdue jobs map to
/// the current bucket.
pub fn allocate_bucket(
    now: DateTime<Utc>,
    at: DateTime<Utc>,
    bucket_width: Duration,
    bucket_count: usize,
) -> usize {
    let count = bucket_count.max(1) as i64;
    let window = window_index(
        timestamp_nanos(now),
        timestamp_nanos(at),
        duration_nanos(bucket_width),
    );
    (window % count) as usize
}

pub struct CalendarQueue {
    buckets: Vec<PriorityQueue<Job>>,
    bucket_width: Duration,
    width_ns: i64,
    epoch: DateTime<Utc>,
    epoch_ns: i64,
    total_events: RwLock<usize>,
    // Lower bound on the due time of every queued job
    cursor: Mutex<i64>,
}

impl CalendarQueue {
    /// `bucket_count` works best at about twice the number of queued jobs.
    pub fn new(bucket_width: Duration, bucket_count: usize) -> Self {
        let epoch = Utc::now();
        let buckets = (0..bucket_count.max(1))
            .map(|_| PriorityQueue::new(PqType::Min))
            .collect();

        Self {
            buckets,
            bucket_width,
            width_ns: duration_nanos(bucket_width),
            epoch,
            epoch_ns: timestamp_nanos(epoch),
            total_events: RwLock::new(0),
            cursor: Mutex::new(i64::MAX),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_width(&self) -> Duration {
        self.bucket_width
    }

    /// Bucket a job due at `at` is stored in.
    pub fn allocate_bucket(&self, at: DateTime<Utc>) -> usize {
        allocate_bucket(self.epoch, at, self.bucket_width, self.buckets.len())
    }

    fn bucket_of(&self, priority: i64) -> usize {
        let window = window_index(self.epoch_ns, priority, self.width_ns);
        (window % self.buckets.len() as i64) as usize
    }

    fn window_top(&self, window: i64) -> i64 {
        self.epoch_ns
            .saturating_add(window.saturating_add(1).saturating_mul(self.width_ns))
    }

    pub fn size(&self) -> usize {
        *self.total_events.read()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn enqueue(&self, job: Job) {
        let priority = job.priority();
        let bucket = self.bucket_of(priority);

        // Push and lower the cursor as one step so a concurrent pop never
        // scans past the new job.
        let mut cursor = self.cursor.lock();
        self.buckets[bucket].push(job, priority);
        *cursor = (*cursor).min(priority);
        *self.total_events.write() += 1;
    }

    /// Peek at the job due soonest.
    pub fn next(&self) -> Option<Job> {
        if self.is_empty() {
            return None;
        }
        let cursor = self.cursor.lock();
        self.find_next(*cursor).map(|(_, job)| job)
    }

    /// Remove and return the job due soonest.
    pub fn pop_next(&self) -> Option<Job> {
        if self.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock();
        let (bucket, _) = self.find_next(*cursor)?;
        let (job, priority) = self.buckets[bucket].pop()?;
        *cursor = priority;
        drop(cursor);

        self.decrement();
        Some(job)
    }

    /// Remove `job` if it is the head of its bucket.
    pub fn dequeue(&self, job: &Job) -> bool {
        let bucket = self.bucket_of(job.priority());
        let _cursor = self.cursor.lock();
        match self.buckets[bucket].head() {
            Some((head, _)) if head.id == job.id => {
                self.buckets[bucket].pop();
                self.decrement();
                true
            }
            _ => false,
        }
    }

    fn decrement(&self) {
        let mut total = self.total_events.write();
        *total = total.saturating_sub(1);
    }

    fn find_next(&self, cursor: i64) -> Option<(usize, Job)> {
        let count = self.buckets.len() as i64;
        let mut window = window_index(self.epoch_ns, cursor, self.width_ns);
        let mut cycle = 0u64;
        let mut scanned = 0;

        loop {
            let bucket = (window % count) as usize;
            if let Some((job, priority)) = self.buckets[bucket].head() {
                if priority < self.window_top(window) {
                    return Some((bucket, job));
                }
            }

            window += 1;
            scanned += 1;
            if scanned == count {
                // Full wrap without a hit: skip straight to the earliest cycle in use.
                let earliest = self
                    .buckets
                    .iter()
                    .filter_map(PriorityQueue::head_priority)
                    .min()?;
                window = window_index(self.epoch_ns, earliest, self.width_ns);
                scanned = 0;
                cycle += 1;
                tracing::trace!(cycle, window, "Calendar queue advanced to next cycle");
            }
        }
    }
}

impl TimeQueue for CalendarQueue {
    fn enqueue(&self, job: Job) {
        CalendarQueue::enqueue(self, job);
    }

    fn peek(&self) -> Option<Job> {
        self.next()
    }

    fn pop(&self) -> Option<Job> {
        self.pop_next()
    }

    fn len(&self) -> usize {
        self.size()
    }
}
