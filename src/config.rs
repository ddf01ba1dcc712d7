use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ChronosError, Result};
use crate::scheduler::{Job, Trigger, REPEAT_FOREVER};

/// Coordination store layout and lease timings.
///
/// Every key an agent touches is derived from `namespace`:
/// - `<ns>/lock/scheduler`: leadership key, created with `scheduler_ttl`
/// - `<ns>/offers/<job_id>`: published job offers, no expiry
/// - `<ns>/lock/job/<job_id>`: take locks, deleted once the winner is decided
/// - `<ns>/executor/<agent_id>`: executor presence, refreshed with `executor_ttl`
/// - `<ns>/jobs/<job_id>`: registered jobs waiting to be scheduled
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub namespace: String,
    /// Maximum time the cluster runs without a scheduler
    pub scheduler_ttl: Duration,
    /// Maximum time an executor stays registered without a heartbeat
    pub executor_ttl: Duration,
    /// Renewal interval for both the leadership and executor keys
    pub heartbeat: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "/xchronos".to_string(),
            scheduler_ttl: Duration::from_secs(30),
            executor_ttl: Duration::from_secs(60),
            heartbeat: Duration::from_secs(20),
        }
    }
}

impl ClusterConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_timings(
        mut self,
        scheduler_ttl: Duration,
        executor_ttl: Duration,
        heartbeat: Duration,
    ) -> Self {
        self.scheduler_ttl = scheduler_ttl;
        self.executor_ttl = executor_ttl;
        self.heartbeat = heartbeat;
        self
    }

    /// The heartbeat must fire strictly before either lease can expire.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.is_zero() {
            return Err(ChronosError::Config("heartbeat must be non-zero".into()));
        }
        if self.heartbeat >= self.scheduler_ttl {
            return Err(ChronosError::Config(format!(
                "heartbeat {:?} must be shorter than scheduler ttl {:?}",
                self.heartbeat, self.scheduler_ttl
            )));
        }
        if self.heartbeat >= self.executor_ttl {
            return Err(ChronosError::Config(format!(
                "heartbeat {:?} must be shorter than executor ttl {:?}",
                self.heartbeat, self.executor_ttl
            )));
        }
        Ok(())
    }

    pub fn scheduler_key(&self) -> String {
        format!("{}/lock/scheduler", self.namespace)
    }

    pub fn offers_prefix(&self) -> String {
        format!("{}/offers/", self.namespace)
    }

    pub fn offer_key(&self, job_id: &str) -> String {
        format!("{}{}", self.offers_prefix(), job_id)
    }

    pub fn job_lock_key(&self, job_id: &str) -> String {
        format!("{}/lock/job/{}", self.namespace, job_id)
    }

    pub fn executor_key(&self, agent_id: &str) -> String {
        format!("{}/executor/{}", self.namespace, agent_id)
    }

    pub fn jobs_prefix(&self) -> String {
        format!("{}/jobs/", self.namespace)
    }

    pub fn job_key(&self, job_id: &str) -> String {
        format!("{}{}", self.jobs_prefix(), job_id)
    }
}

/// Which time-ordered structure backs the local scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueConfig {
    /// A single min-ordered binary heap
    #[default]
    Heap,
    /// Calendar queue; `bucket_count` is best sized at twice the expected job count
    Calendar {
        bucket_width: Duration,
        bucket_count: usize,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    /// Fixed pause between attempts of the same occurrence
    pub retry_delay: Duration,
    /// Upper bound for a single attempt
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    /// Address published as the value of leadership, executor and take-lock keys
    pub address: String,
    pub cluster: ClusterConfig,
    pub queue: QueueConfig,
    pub supervisor: SupervisorConfig,
    pub negotiate_delay_min_ms: u64,
    pub negotiate_delay_max_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: uuid::Uuid::new_v4().to_string(),
            address: "127.0.0.1".to_string(),
            cluster: ClusterConfig::default(),
            queue: QueueConfig::default(),
            supervisor: SupervisorConfig::default(),
            negotiate_delay_min_ms: 150,
            negotiate_delay_max_ms: 300,
        }
    }
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_negotiate_delay(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.negotiate_delay_min_ms = min_ms;
        self.negotiate_delay_max_ms = max_ms.max(min_ms);
        self
    }
}

fn default_max_executions() -> i64 {
    -1
}

fn default_retries() -> u32 {
    1
}

/// A single job entry of a jobs file.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub exec: String,
    pub cron: String,
    /// Total runs of the job; -1 runs forever
    #[serde(default = "default_max_executions")]
    pub max_executions: i64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub disabled: bool,
}

impl JobDefinition {
    pub fn to_job(&self) -> Result<Job> {
        let repeats = match self.max_executions {
            -1 => REPEAT_FOREVER,
            runs if runs >= 1 => runs - 1,
            runs => {
                return Err(ChronosError::Config(format!(
                    "job {}: max_executions must be -1 or at least 1, got {}",
                    self.name, runs
                )))
            }
        };
        let trigger = Trigger::parse(&self.cron)?;
        Ok(Job::new(self.name.clone(), self.exec.clone(), trigger)?
            .with_repeat(repeats)
            .with_retries(self.retries)
            .with_disabled(self.disabled))
    }
}

/// Job definitions loaded from a JSON document.
#[derive(Debug, Clone, Deserialize)]
pub struct JobsFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl JobsFile {
    pub fn parse(text: &str) -> Result<Self> {
        let file: JobsFile = serde_json::from_str(text)?;
        let mut seen = std::collections::HashSet::new();
        for job in &file.jobs {
            if job.name.is_empty() {
                return Err(ChronosError::Config("job name must not be empty".into()));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(ChronosError::Config(format!(
                    "duplicate job name: {}",
                    job.name
                )));
            }
        }
        Ok(file)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn to_jobs(&self) -> Result<Vec<Job>> {
        self.jobs.iter().map(JobDefinition::to_job).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cluster_config_default() {
        let cfg = ClusterConfig::default();
        assert_eq!(cfg.namespace, "/xchronos");
        assert_eq!(cfg.scheduler_ttl, Duration::from_secs(30));
        assert_eq!(cfg.executor_ttl, Duration::from_secs(60));
        assert_eq!(cfg.heartbeat, Duration::from_secs(20));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn cluster_config_keys() {
        let cfg = ClusterConfig::default().with_namespace("/test");
        assert_eq!(cfg.scheduler_key(), "/test/lock/scheduler");
        assert_eq!(cfg.offer_key("backup"), "/test/offers/backup");
        assert_eq!(cfg.job_lock_key("backup"), "/test/lock/job/backup");
        assert_eq!(cfg.executor_key("agent_1"), "/test/executor/agent_1");
        assert_eq!(cfg.job_key("backup"), "/test/jobs/backup");
        assert!(cfg.offer_key("x").starts_with(&cfg.offers_prefix()));
    }

    #[test]
    fn heartbeat_must_be_shorter_than_ttls() {
        let cfg = ClusterConfig::default().with_timings(
            Duration::from_secs(10),
            Duration::from_secs(60),
            Duration::from_secs(10),
        );
        assert!(cfg.validate().is_err());

        let cfg = ClusterConfig::default().with_timings(
            Duration::from_secs(30),
            Duration::from_secs(5),
            Duration::from_secs(10),
        );
        assert!(cfg.validate().is_err());

        let cfg = ClusterConfig::default().with_timings(
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::ZERO,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn agent_config_new() {
        let cfg = AgentConfig::new("agent_1", "10.0.0.1");
        assert_eq!(cfg.agent_id, "agent_1");
        assert_eq!(cfg.address, "10.0.0.1");
        assert_eq!(cfg.queue, QueueConfig::Heap);
        assert!(cfg.supervisor.retry_delay.is_zero());
    }

    #[test]
    fn agent_config_default_id_is_unique() {
        let a = AgentConfig::default();
        let b = AgentConfig::default();
        assert_ne!(a.agent_id, b.agent_id);
    }

    #[test]
    fn negotiate_delay_is_ordered() {
        let cfg = AgentConfig::default().with_negotiate_delay(100, 10);
        assert_eq!(cfg.negotiate_delay_min_ms, 100);
        assert_eq!(cfg.negotiate_delay_max_ms, 100);
    }

    #[test]
    fn jobs_file_parse() {
        let text = r#"{
            "version": "1",
            "jobs": [
                { "name": "backup", "exec": "echo backup", "cron": "0 * * * *", "retries": 3 },
                { "name": "report", "exec": "echo report", "cron": "@daily",
                  "max_executions": 2, "disabled": true }
            ]
        }"#;
        let file = JobsFile::parse(text).unwrap();
        assert_eq!(file.version.as_deref(), Some("1"));
        assert_eq!(file.jobs.len(), 2);
        assert_eq!(file.jobs[0].max_executions, -1);
        assert_eq!(file.jobs[1].retries, 1);

        let jobs = file.to_jobs().unwrap();
        assert_eq!(jobs[0].id, "backup");
        assert_eq!(jobs[0].retries, 3);
        assert!(jobs[1].disabled);
        assert_eq!(jobs[1].times_to_repeat, 1);
    }

    fn runs_of(max_executions: i64) -> Result<usize> {
        let text = format!(
            r#"{{ "jobs": [ {{ "name": "tick", "exec": "true", "cron": "* * * * * *",
                "max_executions": {} }} ] }}"#,
            max_executions
        );
        let mut job = JobsFile::parse(&text)?.to_jobs()?.remove(0);
        let mut runs = 1;
        while let Some(next) = job.reschedule(job.next_run_at) {
            job = next;
            runs += 1;
            if runs > 100 {
                break;
            }
        }
        Ok(runs)
    }

    #[test]
    fn max_executions_counts_every_run() {
        assert_eq!(runs_of(1).unwrap(), 1);
        assert_eq!(runs_of(3).unwrap(), 3);
        assert_eq!(runs_of(-1).unwrap(), 101, "-1 keeps running");
        assert!(matches!(runs_of(0), Err(ChronosError::Config(_))));
        assert!(matches!(runs_of(-2), Err(ChronosError::Config(_))));
    }

    #[test]
    fn jobs_file_rejects_duplicates() {
        let text = r#"{ "jobs": [
            { "name": "a", "exec": "true", "cron": "* * * * *" },
            { "name": "a", "exec": "true", "cron": "* * * * *" }
        ] }"#;
        assert!(matches!(
            JobsFile::parse(text),
            Err(ChronosError::Config(_))
        ));
    }

    #[test]
    fn jobs_file_rejects_bad_cron() {
        let text = r#"{ "jobs": [ { "name": "a", "exec": "true", "cron": "not a cron" } ] }"#;
        let file = JobsFile::parse(text).unwrap();
        assert!(matches!(
            file.to_jobs(),
            Err(ChronosError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn jobs_file_load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "jobs": [ {{ "name": "tick", "exec": "true", "cron": "* * * * * *" }} ] }}"#
        )
        .unwrap();

        let loaded = JobsFile::load(file.path()).unwrap();
        assert_eq!(loaded.jobs.len(), 1);
        assert_eq!(loaded.jobs[0].name, "tick");
    }

    #[test]
    fn jobs_file_missing_path() {
        assert!(matches!(
            JobsFile::load("/definitely/not/here.json"),
            Err(ChronosError::Io(_))
        ));
    }
}
