use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub host_lock: HostLockConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub registry: RegistryConfig,
}

impl ControlConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs_err::read_to_string(path)?;
        let conf: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("Couldn't parse {}", path.display()))?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host_lock.max_per_host == 0 {
            bail!("hostLock.maxPerHost must be at least 1");
        }
        if self.node.outbound_buffer == 0 {
            bail!("node.outboundBuffer must be at least 1");
        }
        if self.store.default_concurrency > self.store.max_concurrency {
            bail!(
                "store.defaultConcurrency ({}) exceeds store.maxConcurrency ({})",
                self.store.default_concurrency,
                self.store.max_concurrency
            );
        }
        if self.store.default_concurrency == 0 {
            bail!("store.defaultConcurrency must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    #[serde(default = "default_node_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            outbound_buffer: default_outbound_buffer(),
            poll_interval_ms: default_node_poll_ms(),
        }
    }
}

impl NodeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_outbound_buffer() -> usize {
    10
}

fn default_node_poll_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostLockConfig {
    #[serde(default = "default_max_per_host")]
    pub max_per_host: usize,

    #[serde(default = "default_lock_ttl_secs")]
    pub default_ttl_secs: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    #[serde(default)]
    pub on_expire: ExpiryPolicy,
}

impl Default for HostLockConfig {
    fn default() -> Self {
        Self {
            max_per_host: default_max_per_host(),
            default_ttl_secs: default_lock_ttl_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            on_expire: ExpiryPolicy::default(),
        }
    }
}

impl HostLockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_max_per_host() -> usize {
    8
}

fn default_lock_ttl_secs() -> u64 {
    15 * 60
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

/// What the sweep does with the live count of a host when it evicts an
/// expired lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpiryPolicy {
    /// Give the slot back
    #[default]
    Release,
    /// Only forget the entry, the slot stays taken
    Forget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(default = "default_store_concurrency")]
    pub default_concurrency: i64,

    #[serde(default = "default_store_max_concurrency")]
    pub max_concurrency: i64,

    #[serde(default = "default_feedback_window_secs")]
    pub feedback_window_secs: u64,

    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,

    #[serde(default = "default_admission_poll_ms")]
    pub admission_poll_ms: u64,

    #[serde(default = "default_touch_interval_ms")]
    pub touch_interval_ms: u64,

    #[serde(default = "default_requeue_backoff_ms")]
    pub requeue_backoff_ms: u64,

    #[serde(default = "default_parse_ttl_secs")]
    pub default_parse_ttl_secs: u64,

    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_store_concurrency(),
            max_concurrency: default_store_max_concurrency(),
            feedback_window_secs: default_feedback_window_secs(),
            reclaim_interval_ms: default_reclaim_interval_ms(),
            admission_poll_ms: default_admission_poll_ms(),
            touch_interval_ms: default_touch_interval_ms(),
            requeue_backoff_ms: default_requeue_backoff_ms(),
            default_parse_ttl_secs: default_parse_ttl_secs(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
        }
    }
}

impl StoreConfig {
    pub fn feedback_window(&self) -> Duration {
        Duration::from_secs(self.feedback_window_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    pub fn admission_poll(&self) -> Duration {
        Duration::from_millis(self.admission_poll_ms)
    }

    pub fn touch_interval(&self) -> Duration {
        Duration::from_millis(self.touch_interval_ms)
    }

    pub fn requeue_backoff(&self) -> Duration {
        Duration::from_millis(self.requeue_backoff_ms)
    }

    pub fn default_parse_ttl(&self) -> Duration {
        Duration::from_secs(self.default_parse_ttl_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

fn default_store_concurrency() -> i64 {
    3
}

fn default_store_max_concurrency() -> i64 {
    10
}

fn default_feedback_window_secs() -> u64 {
    5 * 60
}

fn default_reclaim_interval_ms() -> u64 {
    5_000
}

fn default_admission_poll_ms() -> u64 {
    200
}

fn default_touch_interval_ms() -> u64 {
    30_000
}

fn default_requeue_backoff_ms() -> u64 {
    5_000
}

fn default_parse_ttl_secs() -> u64 {
    60
}

fn default_reconcile_interval_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    #[serde(default = "default_pop_timeout_ms")]
    pub pop_timeout_ms: u64,

    #[serde(default = "default_node_wait_secs")]
    pub node_wait_secs: u64,

    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,

    #[serde(default = "default_retry_sweep_ms")]
    pub retry_sweep_ms: u64,

    #[serde(default = "default_retry_batch")]
    pub retry_batch: usize,

    #[serde(default = "default_dedupe_ttl_secs")]
    pub dedupe_ttl_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pop_timeout_ms: default_pop_timeout_ms(),
            node_wait_secs: default_node_wait_secs(),
            lock_retry_ms: default_lock_retry_ms(),
            retry_sweep_ms: default_retry_sweep_ms(),
            retry_batch: default_retry_batch(),
            dedupe_ttl_secs: default_dedupe_ttl_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn node_wait(&self) -> Duration {
        Duration::from_secs(self.node_wait_secs)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }

    pub fn retry_sweep(&self) -> Duration {
        Duration::from_millis(self.retry_sweep_ms)
    }

    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_secs(self.dedupe_ttl_secs)
    }
}

fn default_pop_timeout_ms() -> u64 {
    1_000
}

fn default_node_wait_secs() -> u64 {
    30
}

fn default_lock_retry_ms() -> u64 {
    50
}

fn default_retry_sweep_ms() -> u64 {
    5_000
}

fn default_retry_batch() -> usize {
    500
}

fn default_dedupe_ttl_secs() -> u64 {
    15 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(default = "default_crawler_ttl_secs")]
    pub crawler_ttl_secs: u64,

    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            crawler_ttl_secs: default_crawler_ttl_secs(),
            watch_interval_ms: default_watch_interval_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn crawler_ttl(&self) -> Duration {
        Duration::from_secs(self.crawler_ttl_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}

fn default_crawler_ttl_secs() -> u64 {
    60
}

fn default_watch_interval_ms() -> u64 {
    30_000
}
