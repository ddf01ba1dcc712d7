use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::QueueConfig;
use crate::scheduler::calendar_queue::CalendarQueue;
use crate::scheduler::job::Job;
use crate::scheduler::priority_queue::{PqType, PriorityQueue};

/// A time-ordered job queue: `peek`/`pop` yield the job due soonest.
pub trait TimeQueue: Send + Sync {
    fn enqueue(&self, job: Job);
    fn peek(&self) -> Option<Job>;
    fn pop(&self) -> Option<Job>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Only min-ordered heaps make sense here; the scheduler never builds a max one.
impl TimeQueue for PriorityQueue<Job> {
    fn enqueue(&self, job: Job) {
        let priority = job.priority();
        self.push(job, priority);
    }

    fn peek(&self) -> Option<Job> {
        self.head().map(|(job, _)| job)
    }

    fn pop(&self) -> Option<Job> {
        PriorityQueue::pop(self).map(|(job, _)| job)
    }

    fn len(&self) -> usize {
        self.size()
    }
}

#[derive(Default)]
struct Ledger {
    // Latest priority scheduled per job id; anything else popped is stale
    scheduled: HashMap<String, i64>,
    // Priority of the last occurrence handed out per job id
    delivered: HashMap<String, i64>,
}

/// Local schedule of the leader.
///
/// Holds future occurrences in a [`TimeQueue`] and hands each one to a
/// channel when it falls due. Enqueueing a job id that is already scheduled
/// replaces the earlier occurrence, and an occurrence is handed out at most
/// once.
pub struct Scheduler {
    queue: Box<dyn TimeQueue>,
    ledger: Mutex<Ledger>,
    wake: Notify,
}

impl Scheduler {
    pub fn new(config: &QueueConfig) -> Self {
        let queue: Box<dyn TimeQueue> = match config {
            QueueConfig::Heap => Box::new(PriorityQueue::<Job>::new(PqType::Min)),
            QueueConfig::Calendar {
                bucket_width,
                bucket_count,
            } => Box::new(CalendarQueue::new(*bucket_width, *bucket_count)),
        };
        Self::with_queue(queue)
    }

    pub fn with_queue(queue: Box<dyn TimeQueue>) -> Self {
        Self {
            queue,
            ledger: Mutex::new(Ledger::default()),
            wake: Notify::new(),
        }
    }

    /// Schedule `job`. Returns false, ignoring the job, when an occurrence at
    /// or after its due time was already handed out.
    pub fn enqueue(&self, job: Job) -> bool {
        let priority = job.priority();
        {
            let mut ledger = self.ledger.lock();
            if ledger
                .delivered
                .get(&job.id)
                .is_some_and(|&delivered| priority <= delivered)
            {
                debug!(job_id = %job.id, next_run_at = %job.next_run_at, "Occurrence already delivered");
                return false;
            }
            ledger.scheduled.insert(job.id.clone(), priority);
        }

        debug!(job_id = %job.id, next_run_at = %job.next_run_at, "Job scheduled");
        self.queue.enqueue(job);
        self.wake.notify_one();
        true
    }

    /// Entries held by the underlying queue.
    pub fn size(&self) -> usize {
        self.queue.len()
    }

    pub fn is_scheduled(&self, job_id: &str) -> bool {
        self.ledger.lock().scheduled.contains_key(job_id)
    }

    /// Pop the head and return it if it is still the current occurrence of its job.
    fn pop_current(&self) -> Option<Job> {
        let job = self.queue.pop()?;
        let priority = job.priority();
        let mut ledger = self.ledger.lock();
        if ledger.scheduled.get(&job.id) == Some(&priority) {
            ledger.scheduled.remove(&job.id);
            ledger.delivered.insert(job.id.clone(), priority);
            Some(job)
        } else {
            trace!(job_id = %job.id, "Dropping superseded occurrence");
            None
        }
    }

    /// Deliver jobs on `due_tx` as they fall due, in due-time order.
    ///
    /// Waits for an enqueue while the queue is empty and for the earlier of
    /// the head's due time or an enqueue otherwise. Returns, dropping `due_tx`,
    /// once `stop` is cancelled or the receiver is gone.
    pub async fn notify(self: Arc<Self>, due_tx: mpsc::Sender<Job>, stop: CancellationToken) {
        loop {
            let wait = match self.queue.peek() {
                None => None,
                Some(head) if head.is_due(Utc::now()) => {
                    let Some(job) = self.pop_current() else {
                        continue;
                    };
                    debug!(job_id = %job.id, "Job due");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        sent = due_tx.send(job) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }
                Some(head) => Some(head.wait()),
            };

            match wait {
                None => {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = self.wake.notified() => {}
                    }
                }
                Some(wait) => {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
        debug!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn due_in(id: &str, millis: i64) -> Job {
        Job::once(id, "true", Utc::now() + chrono::Duration::milliseconds(millis))
    }

    #[test]
    fn test_heap_time_queue_is_min_ordered() {
        let queue = PriorityQueue::<Job>::new(PqType::Min);
        TimeQueue::enqueue(&queue, due_in("late", 5_000));
        TimeQueue::enqueue(&queue, due_in("early", 1_000));

        assert_eq!(TimeQueue::len(&queue), 2);
        assert_eq!(queue.peek().unwrap().id, "early");
        assert_eq!(TimeQueue::pop(&queue).unwrap().id, "early");
        assert_eq!(TimeQueue::pop(&queue).unwrap().id, "late");
        assert!(TimeQueue::is_empty(&queue));
    }

    #[test]
    fn test_reenqueue_supersedes_previous_occurrence() {
        let scheduler = Scheduler::new(&QueueConfig::Heap);
        scheduler.enqueue(due_in("a", -1_000));
        scheduler.enqueue(due_in("a", -500));
        assert_eq!(scheduler.size(), 2);

        let first = scheduler.pop_current();
        assert!(first.is_none());
        let second = scheduler.pop_current().unwrap();
        assert_eq!(second.id, "a");
        assert!(!scheduler.is_scheduled("a"));
    }

    #[test]
    fn test_delivered_occurrence_is_not_rescheduled() {
        let scheduler = Scheduler::new(&QueueConfig::Heap);
        let job = due_in("a", -1_000);
        assert!(scheduler.enqueue(job.clone()));
        assert!(scheduler.pop_current().is_some());

        assert!(!scheduler.enqueue(job));
        assert_eq!(scheduler.size(), 0);
        assert!(scheduler.enqueue(due_in("a", 60_000)));
    }

    #[tokio::test]
    async fn test_overdue_job_is_delivered_immediately() {
        let scheduler = Arc::new(Scheduler::new(&QueueConfig::Heap));
        scheduler.enqueue(due_in("late", -10_000));

        let (tx, mut rx) = mpsc::channel(4);
        let stop = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().notify(tx, stop.clone()));

        let job = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, "late");

        stop.cancel();
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_wakes_idle_loop() {
        let scheduler = Arc::new(Scheduler::new(&QueueConfig::Calendar {
            bucket_width: Duration::from_secs(1),
            bucket_count: 8,
        }));
        let (tx, mut rx) = mpsc::channel(4);
        let stop = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().notify(tx, stop.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.enqueue(due_in("x", 50));

        let job = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, "x");
        assert_eq!(scheduler.size(), 0);

        stop.cancel();
        handle.await.unwrap();
    }
}
