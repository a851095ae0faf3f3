use std::time::Duration;

/// Configuration for one queue handle.
///
/// The endpoint and queue name are required and go through
/// [`QueueConfig::new`]; everything else has a serviceable default and
/// can be adjusted with the `with_*` methods.  The struct round-trips
/// through serde so deployments can keep it in a config file.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QueueConfig {
    /// Redis host.
    pub server: String,
    /// Redis port.
    pub port: u16,
    /// Logical queue name; drives every key this queue touches.
    pub queue_name: String,
    /// Logical Redis database, selected once at connect time.
    #[serde(default)]
    pub db: i64,
    /// Items sitting in the working sublist longer than this are
    /// considered abandoned and become eligible for reclamation.  Must
    /// exceed the worst-case processing time of a healthy consumer.
    #[serde(default = "default_busy_expiry_time")]
    pub busy_expiry_time: Duration,
    /// How long a blocking claim waits for work before giving up.
    #[serde(default = "default_claim_wait_timeout")]
    pub claim_wait_timeout: Duration,
    /// Once an item's process count exceeds this, a busy requeue parks
    /// it in the failed sublist instead of retrying.
    #[serde(default = "default_requeue_limit")]
    pub requeue_limit: u64,
    /// Emit a diagnostic for every requeued item.
    #[serde(default)]
    pub warn_on_requeue: bool,
}

fn default_busy_expiry_time() -> Duration {
    Duration::from_secs(30)
}

fn default_claim_wait_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_requeue_limit() -> u64 {
    5
}

impl QueueConfig {
    pub fn new(server: impl Into<String>, port: u16, queue_name: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port,
            queue_name: queue_name.into(),
            db: 0,
            busy_expiry_time: default_busy_expiry_time(),
            claim_wait_timeout: default_claim_wait_timeout(),
            requeue_limit: default_requeue_limit(),
            warn_on_requeue: false,
        }
    }

    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    pub fn with_busy_expiry_time(mut self, busy_expiry_time: Duration) -> Self {
        self.busy_expiry_time = busy_expiry_time;
        self
    }

    pub fn with_claim_wait_timeout(mut self, claim_wait_timeout: Duration) -> Self {
        self.claim_wait_timeout = claim_wait_timeout;
        self
    }

    pub fn with_requeue_limit(mut self, requeue_limit: u64) -> Self {
        self.requeue_limit = requeue_limit;
        self
    }

    pub fn with_warn_on_requeue(mut self, warn_on_requeue: bool) -> Self {
        self.warn_on_requeue = warn_on_requeue;
        self
    }

    /// The connection URL handed to the Redis client.  Encoding the
    /// database in the path makes the client issue the `SELECT` once
    /// at connect time.
    pub(crate) fn redis_url(&self) -> String {
        format!("redis://{}:{}/{}", self.server, self.port, self.db)
    }
}
