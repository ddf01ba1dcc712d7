use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::store::{EventKind, MemoryStore, StoreWatch};
use crate::cluster::ClusterClient;
use crate::config::ClusterConfig;
use crate::error::{ChronosError, Result};
use crate::scheduler::Job;

/// [`ClusterClient`] over a shared [`MemoryStore`]. Every agent of a process
/// gets its own client on the same store.
pub struct MemoryClusterClient {
    store: Arc<MemoryStore>,
    config: ClusterConfig,
    connected: AtomicBool,
}

impl MemoryClusterClient {
    pub fn new(store: Arc<MemoryStore>, config: ClusterConfig) -> Self {
        Self {
            store,
            config,
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    fn session(&self) -> Result<&MemoryStore> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(&self.store)
        } else {
            Err(ChronosError::ConnectionFailed("client is not connected".into()))
        }
    }

    /// Send decoded jobs found under `prefix` until `stop`: the existing keys
    /// first, then every `Put`.
    async fn stream_jobs(
        &self,
        prefix: String,
        notify: mpsc::Sender<Job>,
        stop: CancellationToken,
    ) -> Result<()> {
        let store = self.session()?;
        // Subscribe before listing so nothing published in between is missed
        let mut watch: StoreWatch = store.watch(&prefix);

        for (key, value) in store.list_prefix(&prefix)? {
            let Some(job) = decode_job(&key, &value) else {
                continue;
            };
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                sent = notify.send(job) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                event = watch.next() => event,
            };
            let Some(event) = event else {
                return Err(ChronosError::Cluster(format!("watch on {} closed", prefix)));
            };
            if event.kind != EventKind::Put {
                continue;
            }
            let Some(job) = decode_job(&event.key, &event.value) else {
                continue;
            };
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                sent = notify.send(job) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn decode_job(key: &str, value: &str) -> Option<Job> {
    match Job::decode_from_string(value) {
        Ok(job) => Some(job),
        Err(e) => {
            warn!(key = %key, error = %e, "Skipping undecodable job");
            None
        }
    }
}

#[async_trait]
impl ClusterClient for MemoryClusterClient {
    async fn connect(&self) -> Result<()> {
        if !self.store.is_available() {
            return Err(ChronosError::ConnectionFailed(
                "coordination store unreachable".into(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!(namespace = %self.config.namespace, "Connected to coordination store");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        debug!("Disconnected from coordination store");
        Ok(())
    }

    async fn register_as_scheduler(&self, address: &str) -> Result<bool> {
        self.session()?.create(
            &self.config.scheduler_key(),
            address,
            Some(self.config.scheduler_ttl),
        )
    }

    async fn renew_scheduler(&self, address: &str) -> Result<bool> {
        self.session()?.compare_and_swap(
            &self.config.scheduler_key(),
            address,
            address,
            Some(self.config.scheduler_ttl),
        )
    }

    async fn resign_scheduler(&self, address: &str) -> Result<bool> {
        let resigned = self
            .session()?
            .compare_and_delete(&self.config.scheduler_key(), address)?;
        if resigned {
            info!(address = %address, "Released scheduler leadership");
        }
        Ok(resigned)
    }

    async fn current_scheduler(&self) -> Result<Option<String>> {
        self.session()?.get(&self.config.scheduler_key())
    }

    async fn scheduler_failure_watcher(
        &self,
        notify: mpsc::Sender<()>,
        stop: CancellationToken,
    ) -> Result<()> {
        let store = self.session()?;
        let key = self.config.scheduler_key();
        let mut watch = store.watch(&key);

        if store.get(&key)?.is_none() {
            debug!("No scheduler registered");
            let _ = notify.send(()).await;
            return Ok(());
        }

        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                event = watch.next() => event,
            };
            let Some(event) = event else {
                return Err(ChronosError::Cluster("scheduler watch closed".into()));
            };
            if event.key == key && matches!(event.kind, EventKind::Delete | EventKind::Expire) {
                info!(previous = %event.value, kind = ?event.kind, "Scheduler key gone");
                let _ = notify.send(()).await;
                return Ok(());
            }
        }
    }

    async fn register_as_executor(&self, agent_id: &str, address: &str) -> Result<()> {
        self.session()?.set(
            &self.config.executor_key(agent_id),
            address,
            Some(self.config.executor_ttl),
        )
    }

    async fn executors(&self) -> Result<Vec<(String, String)>> {
        let prefix = self.config.executor_key("");
        Ok(self
            .session()?
            .list_prefix(&prefix)?
            .into_iter()
            .map(|(key, address)| (key[prefix.len()..].to_string(), address))
            .collect())
    }

    async fn make_job_offer(&self, job: &Job) -> Result<()> {
        let encoded = job.encode_to_string()?;
        self.session()?
            .set(&self.config.offer_key(&job.id), &encoded, None)?;
        debug!(job_id = %job.id, "Job offered");
        Ok(())
    }

    async fn watch_job_offers(
        &self,
        notify: mpsc::Sender<Job>,
        stop: CancellationToken,
    ) -> Result<()> {
        self.stream_jobs(self.config.offers_prefix(), notify, stop)
            .await
    }

    async fn take_job_offer(&self, job: &Job, address: &str) -> Result<bool> {
        let store = self.session()?;
        let lock_key = self.config.job_lock_key(&job.id);
        let offer_key = self.config.offer_key(&job.id);

        // The lock only lives while the winner is decided; the TTL covers a
        // taker that dies in between.
        if !store.create(&lock_key, address, Some(self.config.scheduler_ttl))? {
            debug!(job_id = %job.id, "Job offer already being taken");
            return Ok(false);
        }

        let outcome = match store.get(&offer_key) {
            Ok(Some(current)) => match Job::decode_from_string(&current) {
                // Only this occurrence's offer may be claimed
                Ok(offered) if offered.next_run_at == job.next_run_at => {
                    store.compare_and_delete(&offer_key, &current)
                }
                _ => Ok(false),
            },
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };

        store.delete(&lock_key)?;
        let taken = outcome?;
        if taken {
            debug!(job_id = %job.id, address = %address, "Job offer taken");
        }
        Ok(taken)
    }

    async fn register_job(&self, job: &Job) -> Result<()> {
        let encoded = job.encode_to_string()?;
        self.session()?.set(&self.config.job_key(&job.id), &encoded, None)?;
        info!(job_id = %job.id, "Job registered");
        Ok(())
    }

    async fn unregister_job(&self, job_id: &str) -> Result<bool> {
        self.session()?.delete(&self.config.job_key(job_id))
    }

    async fn is_job_registered(&self, job_id: &str) -> Result<bool> {
        Ok(self.session()?.get(&self.config.job_key(job_id))?.is_some())
    }

    async fn watch_jobs_to_schedule(
        &self,
        notify: mpsc::Sender<Job>,
        stop: CancellationToken,
    ) -> Result<()> {
        self.stream_jobs(self.config.jobs_prefix(), notify, stop).await
    }
}
