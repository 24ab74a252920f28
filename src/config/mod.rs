use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite connection string (e.g., "sqlite://jobs.db").
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Size of the SQLite connection pool. Kept small: the storage engine
    /// serializes writers anyway.
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,

    /// Number of workers launched by the supervisor.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Duration of a claim before the reaper may reclaim the job.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: i64,

    /// Seconds between reaper scans.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval: u64,

    /// Max rows processed per reaper scan.
    #[serde(default = "default_batch")]
    pub batch: i64,

    /// Retry cap before a job is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,

    /// Milliseconds before the supervisor relaunches a crashed task.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// Max seconds to wait for in-flight work to drain at shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,

    /// Upload size limit in bytes.
    #[serde(default = "default_max_text_bytes")]
    pub max_text_bytes: usize,

    /// Probability in [0,1] of injecting a transform error, for testing
    /// robustness.
    #[serde(default)]
    pub fault_rate: f64,

    /// Artificial delay before completion, simulating work.
    #[serde(default = "default_work_delay_ms")]
    pub work_delay_ms: u64,

    /// Capacity of the in-memory job id queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_url() -> String {
    "sqlite://jobs.db".to_string()
}

fn default_db_pool_size() -> u32 {
    5
}

fn default_worker_count() -> usize {
    1
}

fn default_lease_seconds() -> i64 {
    30
}

fn default_reaper_interval() -> u64 {
    5
}

fn default_batch() -> i64 {
    100
}

fn default_max_retries() -> i64 {
    3
}

fn default_restart_backoff_ms() -> u64 {
    1000
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_max_text_bytes() -> usize {
    1_048_576
}

fn default_work_delay_ms() -> u64 {
    2000
}

fn default_queue_capacity() -> usize {
    10_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
