use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

use crate::error::{ChronosError, Result};

type WorkFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type WorkFn = Arc<dyn Fn() -> WorkFuture + Send + Sync>;
type StopHook = Box<dyn FnOnce() + Send>;

/// Outcome of one task run: `Ok(())` when the work finished cleanly.
pub type Outcome = Result<()>;

/// A background operation with a stop protocol and a single-slot outcome.
///
/// The outcome channel holds one value. Work completion, tick failures and
/// cancellation all report with `try_send`, so the first of them to land is
/// the one observed and later ones are dropped.
pub struct Task {
    id: String,
    work: WorkFn,
    outcome_tx: mpsc::Sender<Outcome>,
    outcome_rx: Mutex<Option<mpsc::Receiver<Outcome>>>,
    stop_tx: mpsc::Sender<oneshot::Sender<()>>,
    stop_rx: Mutex<Option<mpsc::Receiver<oneshot::Sender<()>>>>,
    stop_hook: Mutex<Option<StopHook>>,
    started: AtomicBool,
}

impl Task {
    pub fn new<F, Fut>(id: impl Into<String>, work: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (outcome_tx, outcome_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let work: WorkFn = Arc::new(move || Box::pin(work()) as WorkFuture);

        Arc::new(Self {
            id: id.into(),
            work,
            outcome_tx,
            outcome_rx: Mutex::new(Some(outcome_rx)),
            stop_tx,
            stop_rx: Mutex::new(Some(stop_rx)),
            stop_hook: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Callback run once a stop has been acknowledged.
    pub fn set_stop_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.stop_hook.lock() = Some(Box::new(hook));
    }

    /// Take the outcome receiver. Only the first caller gets it.
    pub fn take_outcomes(&self) -> Option<mpsc::Receiver<Outcome>> {
        self.outcome_rx.lock().take()
    }

    fn start(&self) -> Option<mpsc::Receiver<oneshot::Sender<()>>> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(task = %self.id, "Task already started");
            return None;
        }
        self.stop_rx.lock().take()
    }

    /// Run the work once in the background.
    ///
    /// A stop request drops the work if it is still running and reports
    /// [`ChronosError::Canceled`].
    pub fn run_once(&self) {
        let Some(mut stop_rx) = self.start() else {
            return;
        };
        let id = self.id.clone();
        let work = self.work.clone();
        let outcome_tx = self.outcome_tx.clone();

        tokio::spawn(async move {
            let running = work();
            tokio::pin!(running);
            let mut finished = false;

            loop {
                tokio::select! {
                    result = &mut running, if !finished => {
                        finished = true;
                        if let Err(e) = &result {
                            debug!(task = %id, error = %e, "Task failed");
                        }
                        let _ = outcome_tx.try_send(result);
                    }
                    ack = stop_rx.recv() => {
                        acknowledge(&id, ack, &outcome_tx);
                        break;
                    }
                }
            }
        });
    }

    /// Run the work every `every`, first tick one period from now, until stopped.
    /// A failing tick reports its error and the ticker keeps going.
    pub fn run_every(&self, every: Duration) {
        let Some(mut stop_rx) = self.start() else {
            return;
        };
        if every.is_zero() {
            warn!(task = %self.id, "Periodic task needs a non-zero period");
            let _ = self.outcome_tx.try_send(Err(ChronosError::Config(format!(
                "task {} has a zero period",
                self.id
            ))));
            return;
        }
        let id = self.id.clone();
        let work = self.work.clone();
        let outcome_tx = self.outcome_tx.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    ack = stop_rx.recv() => {
                        acknowledge(&id, ack, &outcome_tx);
                        break;
                    }
                    _ = ticker.tick() => {
                        tokio::select! {
                            ack = stop_rx.recv() => {
                                acknowledge(&id, ack, &outcome_tx);
                                break;
                            }
                            result = work() => {
                                if let Err(e) = result {
                                    warn!(task = %id, error = %e, "Periodic task tick failed");
                                    let _ = outcome_tx.try_send(Err(e));
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    /// Request a stop and wait for the acknowledgement, then run the stop hook.
    pub async fn stop(&self) {
        if self.started.load(Ordering::SeqCst) {
            let (ack_tx, ack_rx) = oneshot::channel();
            if self.stop_tx.send(ack_tx).await.is_ok() {
                let _ = ack_rx.await;
            }
        }

        let hook = self.stop_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        debug!(task = %self.id, "Task stopped");
    }
}

fn acknowledge(id: &str, ack: Option<oneshot::Sender<()>>, outcome_tx: &mpsc::Sender<Outcome>) {
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
    debug!(task = %id, "Task canceled");
    let _ = outcome_tx.try_send(Err(ChronosError::Canceled));
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_run_once_reports_success() {
        let task = Task::new("ok", || async { Ok(()) });
        let mut outcomes = task.take_outcomes().unwrap();
        task.run_once();

        assert!(matches!(outcomes.recv().await, Some(Ok(()))));
        task.stop().await;
    }

    #[tokio::test]
    async fn test_run_once_reports_error() {
        let task = Task::new("fails", || async {
            Err(ChronosError::Internal("boom".into()))
        });
        let mut outcomes = task.take_outcomes().unwrap();
        task.run_once();

        assert!(matches!(
            outcomes.recv().await,
            Some(Err(ChronosError::Internal(_)))
        ));
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_work() {
        let task = Task::new("blocked", || async {
            std::future::pending::<()>().await;
            Ok(())
        });
        let mut outcomes = task.take_outcomes().unwrap();
        task.run_once();
        task.stop().await;

        assert!(matches!(outcomes.recv().await, Some(Err(ChronosError::Canceled))));
    }

    #[tokio::test]
    async fn test_stop_runs_hook_after_ack() {
        let hooked = Arc::new(AtomicBool::new(false));
        let task = Task::new("hooked", || async { Ok(()) });
        let flag = hooked.clone();
        task.set_stop_hook(move || flag.store(true, Ordering::SeqCst));

        task.run_every(Duration::from_secs(60));
        task.stop().await;
        assert!(hooked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_before_start_returns() {
        let task = Task::new("idle", || async { Ok(()) });
        task.stop().await;
        task.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_ignored() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = Task::new("twice", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let mut outcomes = task.take_outcomes().unwrap();
        task.run_once();
        task.run_once();

        assert!(matches!(outcomes.recv().await, Some(Ok(()))));
        task.stop().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(task.take_outcomes().is_none());
    }
}
