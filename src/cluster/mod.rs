//! Coordination store access.
//!
//! Agents never talk to each other directly. Leadership, executor presence,
//! job registration and job offers all live in a shared store reached through
//! a [`ClusterClient`]:
//!
//! - leadership is a create-if-absent key with a TTL, renewed by the leader
//! - an offer is a published job waiting to be claimed
//! - a take creates a per-job lock; whoever creates it and still finds the
//!   offer wins, then removes both

pub mod memory;
pub mod store;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::scheduler::Job;

pub use memory::MemoryClusterClient;
pub use store::{EventKind, MemoryStore, StoreWatch, WatchEvent};

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Try to create the leadership key. `Ok(false)` means another agent holds it.
    async fn register_as_scheduler(&self, address: &str) -> Result<bool>;

    /// Refresh the leadership key's TTL. `Ok(false)` means the key is no
    /// longer held by `address`.
    async fn renew_scheduler(&self, address: &str) -> Result<bool>;

    /// Release the leadership key if `address` still holds it.
    async fn resign_scheduler(&self, address: &str) -> Result<bool>;

    /// Address of the current leader, if any.
    async fn current_scheduler(&self) -> Result<Option<String>>;

    /// Wait until the leadership key disappears, then send once on `notify`.
    /// Returns immediately after notifying if there is no leader at all.
    async fn scheduler_failure_watcher(
        &self,
        notify: mpsc::Sender<()>,
        stop: CancellationToken,
    ) -> Result<()>;

    /// Write or refresh this agent's presence key.
    async fn register_as_executor(&self, agent_id: &str, address: &str) -> Result<()>;

    /// Live executors as `(agent_id, address)`.
    async fn executors(&self) -> Result<Vec<(String, String)>>;

    async fn make_job_offer(&self, job: &Job) -> Result<()>;

    /// Stream offers to `notify` until `stop`: the ones pending at call time
    /// first, then every newly published one.
    async fn watch_job_offers(&self, notify: mpsc::Sender<Job>, stop: CancellationToken)
        -> Result<()>;

    /// Claim the offer for this occurrence of `job`. Exactly one concurrent
    /// caller gets `Ok(true)`.
    async fn take_job_offer(&self, job: &Job, address: &str) -> Result<bool>;

    async fn register_job(&self, job: &Job) -> Result<()>;

    async fn unregister_job(&self, job_id: &str) -> Result<bool>;

    async fn is_job_registered(&self, job_id: &str) -> Result<bool>;

    /// Stream registered jobs to `notify` until `stop`: every job registered
    /// at call time first, then each new or updated registration.
    async fn watch_jobs_to_schedule(
        &self,
        notify: mpsc::Sender<Job>,
        stop: CancellationToken,
    ) -> Result<()>;
}
