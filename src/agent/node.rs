use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::state::{transition, AgentEvent, AgentState};
use crate::agent::timer::random_negotiation_delay;
use crate::cluster::ClusterClient;
use crate::config::AgentConfig;
use crate::error::{ChronosError, Result};
use crate::executor::{CommandRunner, Supervisor};
use crate::scheduler::{Job, Scheduler};
use crate::task::{first_error, Task, TaskManager};

const JOB_STREAM_BUFFER: usize = 64;

/// One member of the fleet.
///
/// `run` drives the role state machine until the agent reaches `Recovery`:
/// connect, contest leadership, then serve as scheduler or executor until a
/// failover sends it back to negotiation or an error ends it.
pub struct Agent {
    config: AgentConfig,
    client: Arc<dyn ClusterClient>,
    supervisor: Arc<Supervisor>,
    tasks: TaskManager,
    scheduler: RwLock<Option<Arc<Scheduler>>>,
    state_tx: watch::Sender<AgentState>,
    last_error: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        client: Arc<dyn ClusterClient>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let supervisor = Arc::new(Supervisor::new(runner, config.supervisor.clone()));
        let (state_tx, _) = watch::channel(AgentState::Init);

        Self {
            config,
            client,
            supervisor,
            tasks: TaskManager::new(),
            scheduler: RwLock::new(None),
            state_tx,
            last_error: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop the agent when `parent` is cancelled, in addition to [`Agent::shutdown`].
    pub fn with_shutdown_token(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    pub fn id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn state(&self) -> AgentState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.state_tx.subscribe()
    }

    pub fn is_scheduler(&self) -> bool {
        self.state() == AgentState::Scheduler
    }

    /// The local schedule while this agent leads.
    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.read().clone()
    }

    /// Error that sent the agent to recovery, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Ask the agent to stop; `run` then returns `Ok(())`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Drive the state machine to completion.
    ///
    /// Returns `Ok(())` after a requested shutdown and the terminating error
    /// for any other way into recovery.
    pub async fn run(&self) -> Result<()> {
        let mut state = self.state();
        let mut event = AgentEvent::Start;
        let mut cause: Option<ChronosError> = None;
        let mut failed_over = false;

        loop {
            if self.shutdown.is_cancelled() && event != AgentEvent::ShutdownRequested {
                event = AgentEvent::ShutdownRequested;
                cause = Some(ChronosError::Canceled);
            }

            let next = transition(state, event);
            info!(
                agent_id = %self.config.agent_id,
                from = %state,
                to = %next,
                event = %event,
                "State transition"
            );
            state = next;
            self.state_tx.send_replace(state);

            let outcome = match state {
                AgentState::Init => Err(ChronosError::Internal("agent restarted".into())),
                AgentState::Connecting => self.connect().await,
                AgentState::Negotiating => self.negotiate(failed_over).await,
                AgentState::Scheduler => self.run_scheduler_role().await,
                AgentState::Executor => self.run_executor_role().await,
                AgentState::Recovery => break,
            };

            event = match outcome {
                Ok(event) => event,
                Err(ChronosError::Canceled) => {
                    cause = Some(ChronosError::Canceled);
                    AgentEvent::ShutdownRequested
                }
                Err(e) if e.is_failover() => {
                    info!(agent_id = %self.config.agent_id, reason = %e, "Failing over");
                    AgentEvent::Failover
                }
                Err(e) => {
                    let event = failure_event(state);
                    cause = Some(e);
                    event
                }
            };
            failed_over = event == AgentEvent::Failover;
        }

        self.recover(cause).await
    }

    async fn connect(&self) -> Result<AgentEvent> {
        self.config.cluster.validate()?;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ChronosError::Canceled),
            connected = self.client.connect() => {
                connected?;
                info!(agent_id = %self.config.agent_id, "Connected to cluster");
                Ok(AgentEvent::Connected)
            }
        }
    }

    async fn negotiate(&self, after_failover: bool) -> Result<AgentEvent> {
        if after_failover {
            let delay = random_negotiation_delay(
                self.config.negotiate_delay_min_ms,
                self.config.negotiate_delay_max_ms,
            );
            debug!(agent_id = %self.config.agent_id, delay_ms = delay.as_millis() as u64, "Waiting before negotiation");
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ChronosError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.client.register_as_scheduler(&self.config.address).await? {
            info!(agent_id = %self.config.agent_id, address = %self.config.address, "Elected as scheduler");
            Ok(AgentEvent::Elected)
        } else {
            let leader = self.client.current_scheduler().await?;
            info!(agent_id = %self.config.agent_id, leader = ?leader, "Following existing scheduler");
            Ok(AgentEvent::LeaderExists)
        }
    }

    async fn run_scheduler_role(&self) -> Result<AgentEvent> {
        let scheduler = Arc::new(Scheduler::new(&self.config.queue));
        *self.scheduler.write() = Some(scheduler.clone());

        self.client
            .register_as_executor(&self.config.agent_id, &self.config.address)
            .await?;

        let stop = CancellationToken::new();
        let tasks = vec![
            self.renew_leadership_task(),
            self.schedule_jobs_task(scheduler.clone(), stop.clone()),
            self.publish_jobs_task(scheduler, stop.clone()),
            self.advertise_executor_task(),
            self.take_offers_task(stop.clone()),
            self.failure_watcher_task(stop.clone()),
        ];

        let result = self.supervise_role(tasks, &stop).await;
        *self.scheduler.write() = None;
        result
    }

    async fn run_executor_role(&self) -> Result<AgentEvent> {
        self.client
            .register_as_executor(&self.config.agent_id, &self.config.address)
            .await?;

        let stop = CancellationToken::new();
        let tasks = vec![
            self.advertise_executor_task(),
            self.take_offers_task(stop.clone()),
            self.failure_watcher_task(stop.clone()),
        ];

        self.supervise_role(tasks, &stop).await
    }

    /// Start the role's tasks and wait for the first error among them or a
    /// shutdown. Every task is stopped before returning.
    async fn supervise_role(
        &self,
        tasks: Vec<(Arc<Task>, Cadence)>,
        stop: &CancellationToken,
    ) -> Result<AgentEvent> {
        let handles: Vec<Arc<Task>> = tasks.iter().map(|(task, _)| task.clone()).collect();
        let mut errors = first_error(&handles);

        for (task, cadence) in tasks {
            let role_stop = stop.clone();
            task.set_stop_hook(move || role_stop.cancel());
            match cadence {
                Cadence::Once => task.run_once(),
                Cadence::Every => task.run_every(self.config.cluster.heartbeat),
            }
            self.tasks.register(task);
        }
        debug!(agent_id = %self.config.agent_id, tasks = ?self.tasks.task_ids(), "Role tasks started");

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(ChronosError::Canceled),
            first = errors.recv() => Err(first.unwrap_or(ChronosError::RoleTasksExited)),
        };

        self.tasks.stop_all_tasks().await;
        stop.cancel();
        result
    }

    fn renew_leadership_task(&self) -> (Arc<Task>, Cadence) {
        let client = self.client.clone();
        let address = self.config.address.clone();

        let task = Task::new("renew-leadership", move || {
            let client = client.clone();
            let address = address.clone();
            async move {
                if client.renew_scheduler(&address).await? {
                    debug!(address = %address, "Leadership renewed");
                    return Ok(());
                }
                let holder = client
                    .current_scheduler()
                    .await?
                    .unwrap_or_else(|| "nobody".to_string());
                warn!(address = %address, holder = %holder, "Leadership renewal rejected");
                Err(ChronosError::LeadershipLost(holder))
            }
        });
        (task, Cadence::Every)
    }

    fn schedule_jobs_task(
        &self,
        scheduler: Arc<Scheduler>,
        stop: CancellationToken,
    ) -> (Arc<Task>, Cadence) {
        let client = self.client.clone();

        let task = Task::new("schedule-jobs", move || {
            let client = client.clone();
            let scheduler = scheduler.clone();
            let stop = stop.clone();
            async move {
                let (tx, mut rx) = mpsc::channel::<Job>(JOB_STREAM_BUFFER);
                let watching = client.watch_jobs_to_schedule(tx, stop);
                let intake = async {
                    while let Some(mut job) = rx.recv().await {
                        if job.disabled {
                            debug!(job_id = %job.id, "Skipping disabled job");
                            continue;
                        }
                        job.catch_up(Utc::now());
                        scheduler.enqueue(job);
                    }
                };
                let (watched, _) = tokio::join!(watching, intake);
                watched
            }
        });
        (task, Cadence::Once)
    }

    fn publish_jobs_task(
        &self,
        scheduler: Arc<Scheduler>,
        stop: CancellationToken,
    ) -> (Arc<Task>, Cadence) {
        let client = self.client.clone();

        let task = Task::new("publish-jobs", move || {
            let client = client.clone();
            let scheduler = scheduler.clone();
            let stop = stop.clone();
            async move {
                let (due_tx, mut due_rx) = mpsc::channel::<Job>(JOB_STREAM_BUFFER);
                let notifying = scheduler.clone().notify(due_tx, stop);
                let publishing = async {
                    while let Some(job) = due_rx.recv().await {
                        publish_due_job(client.as_ref(), &scheduler, job).await?;
                    }
                    Ok::<(), ChronosError>(())
                };
                tokio::select! {
                    _ = notifying => Ok(()),
                    published = publishing => published,
                }
            }
        });
        (task, Cadence::Once)
    }

    fn advertise_executor_task(&self) -> (Arc<Task>, Cadence) {
        let client = self.client.clone();
        let agent_id = self.config.agent_id.clone();
        let address = self.config.address.clone();

        let task = Task::new("advertise-executor", move || {
            let client = client.clone();
            let agent_id = agent_id.clone();
            let address = address.clone();
            async move { client.register_as_executor(&agent_id, &address).await }
        });
        (task, Cadence::Every)
    }

    fn take_offers_task(&self, stop: CancellationToken) -> (Arc<Task>, Cadence) {
        let client = self.client.clone();
        let supervisor = self.supervisor.clone();
        let address = self.config.address.clone();

        let task = Task::new("take-offers", move || {
            let client = client.clone();
            let supervisor = supervisor.clone();
            let address = address.clone();
            let stop = stop.clone();
            async move {
                let (tx, mut rx) = mpsc::channel::<Job>(JOB_STREAM_BUFFER);
                let watching = client.watch_job_offers(tx, stop);
                let claiming = async {
                    while let Some(job) = rx.recv().await {
                        if !client.take_job_offer(&job, &address).await? {
                            debug!(job_id = %job.id, "Job offer claimed elsewhere");
                            continue;
                        }
                        info!(job_id = %job.id, address = %address, "Job offer taken");
                        let supervisor = supervisor.clone();
                        tokio::spawn(async move {
                            let mut job = job;
                            if let Err(e) = supervisor.run_it(&mut job).await {
                                error!(job_id = %job.id, error = %e, "Job occurrence dropped");
                            }
                        });
                    }
                    Ok::<(), ChronosError>(())
                };
                tokio::select! {
                    watched = watching => watched,
                    claimed = claiming => claimed,
                }
            }
        });
        (task, Cadence::Once)
    }

    fn failure_watcher_task(&self, stop: CancellationToken) -> (Arc<Task>, Cadence) {
        let client = self.client.clone();

        let task = Task::new("scheduler-failure-watcher", move || {
            let client = client.clone();
            let stop = stop.clone();
            async move {
                let (tx, mut rx) = mpsc::channel(1);
                client.scheduler_failure_watcher(tx, stop).await?;
                if rx.try_recv().is_ok() {
                    return Err(ChronosError::NoSchedulerDetected);
                }
                Ok(())
            }
        });
        (task, Cadence::Once)
    }

    async fn recover(&self, cause: Option<ChronosError>) -> Result<()> {
        self.tasks.stop_all_tasks().await;
        *self.scheduler.write() = None;

        match self.client.resign_scheduler(&self.config.address).await {
            Ok(true) => info!(agent_id = %self.config.agent_id, "Resigned scheduler leadership"),
            Ok(false) => {}
            Err(e) => debug!(agent_id = %self.config.agent_id, error = %e, "Could not resign leadership"),
        }
        if let Err(e) = self.client.disconnect().await {
            warn!(agent_id = %self.config.agent_id, error = %e, "Disconnect failed");
        }

        match cause {
            None | Some(ChronosError::Canceled) => {
                info!(agent_id = %self.config.agent_id, "Agent stopped");
                Ok(())
            }
            Some(e) => {
                error!(agent_id = %self.config.agent_id, error = %e, "Agent entered recovery");
                *self.last_error.lock() = Some(e.to_string());
                Err(e)
            }
        }
    }
}

/// How a role task is started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cadence {
    Once,
    /// Every cluster heartbeat
    Every,
}

fn failure_event(state: AgentState) -> AgentEvent {
    match state {
        AgentState::Connecting => AgentEvent::ConnectFailed,
        AgentState::Negotiating => AgentEvent::ElectionFailed,
        _ => AgentEvent::TaskFailed,
    }
}

/// Offer a due job to the cluster and schedule its next occurrence.
///
/// Jobs removed from the registry are dropped. The next occurrence is written
/// back to the registry so a new leader resumes from it; a job with no
/// occurrences left is unregistered.
async fn publish_due_job(
    client: &dyn ClusterClient,
    scheduler: &Scheduler,
    job: Job,
) -> Result<()> {
    if !client.is_job_registered(&job.id).await? {
        info!(job_id = %job.id, "Job no longer registered, dropping");
        return Ok(());
    }

    client.make_job_offer(&job).await?;
    info!(job_id = %job.id, next_run_at = %job.next_run_at, "Job offered");

    match job.reschedule(Utc::now()) {
        Some(next) => {
            client.register_job(&next).await?;
            scheduler.enqueue(next);
        }
        None => {
            client.unregister_job(&job.id).await?;
            info!(job_id = %job.id, "Job schedule complete");
        }
    }
    Ok(())
}
