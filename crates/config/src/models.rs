use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use yggdrasil_domain::{Capability, HostDescriptor};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "defaults::host_priority")]
    pub priority: i64,
    #[serde(default = "defaults::host_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl HostConfig {
    pub fn descriptor(&self) -> HostDescriptor {
        HostDescriptor {
            name: self.name.clone(),
            url: self.url.clone(),
            model: self.model.clone(),
            capabilities: self
                .capabilities
                .iter()
                .filter_map(|c| Capability::parse(c))
                .collect(),
            priority: self.priority,
            timeout: Duration::from_secs(self.timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "defaults::retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "defaults::retry_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "defaults::retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "defaults::retry_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "defaults::retry_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::retry_max_attempts(),
            initial_delay_ms: defaults::retry_initial_delay_ms(),
            max_delay_ms: defaults::retry_max_delay_ms(),
            exponential_base: defaults::retry_exponential_base(),
            jitter: defaults::retry_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "defaults::breaker_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "defaults::breaker_cooldown_minutes")]
    pub cooldown_minutes: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::breaker_failure_threshold(),
            cooldown_minutes: defaults::breaker_cooldown_minutes(),
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "defaults::cloud_credential_env")]
    pub credential_env: String,
    /// Task types eligible for cloud fallback (model-inference types).
    #[serde(default = "defaults::cloud_task_types")]
    pub task_types: Vec<String>,
    #[serde(default = "defaults::cloud_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            model: String::new(),
            credential_env: defaults::cloud_credential_env(),
            task_types: defaults::cloud_task_types(),
            timeout_seconds: defaults::cloud_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default = "defaults::enabled")]
    pub enable_metrics: bool,
    #[serde(default = "defaults::metrics_port")]
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            enable_metrics: true,
            metrics_port: defaults::metrics_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "defaults::ledger_path")]
    pub path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: defaults::ledger_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    /// task type -> ordered capability names; merged over built-in routes.
    #[serde(default)]
    pub routing: HashMap<String, Vec<String>>,
    /// host name -> semaphore size.
    #[serde(default)]
    pub concurrency: HashMap<String, u32>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub default_host: Option<String>,
    #[serde(default = "defaults::poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "defaults::shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
    #[serde(default = "defaults::health_probe_interval_seconds")]
    pub health_probe_interval_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            routing: HashMap::new(),
            concurrency: HashMap::new(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            cloud: CloudConfig::default(),
            observability: ObservabilityConfig::default(),
            ledger: LedgerConfig::default(),
            default_host: None,
            poll_interval_seconds: defaults::poll_interval_seconds(),
            shutdown_timeout_seconds: defaults::shutdown_timeout_seconds(),
            health_probe_interval_seconds: defaults::health_probe_interval_seconds(),
        }
    }
}

impl AppConfig {
    pub fn host_descriptors(&self) -> Vec<HostDescriptor> {
        self.hosts.iter().map(HostConfig::descriptor).collect()
    }

    /// Semaphore size for a host; unlisted hosts default to 2 slots.
    pub fn concurrency_for(&self, host: &str) -> usize {
        self.concurrency
            .get(host)
            .copied()
            .unwrap_or(defaults::HOST_CONCURRENCY) as usize
    }

    /// Routing table with built-in routes filled in under any
    /// user-supplied overrides.
    pub fn routing_capabilities(&self) -> HashMap<String, Vec<Capability>> {
        let mut table: HashMap<String, Vec<Capability>> = defaults::builtin_routes();
        for (task_type, caps) in &self.routing {
            table.insert(
                task_type.clone(),
                caps.iter().filter_map(|c| Capability::parse(c)).collect(),
            );
        }
        table
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_secs(self.health_probe_interval_seconds)
    }
}

pub(crate) mod defaults {
    use std::collections::HashMap;

    use yggdrasil_domain::Capability;

    pub const HOST_CONCURRENCY: u32 = 2;

    pub fn enabled() -> bool {
        true
    }
    pub fn host_priority() -> i64 {
        1
    }
    pub fn host_timeout_seconds() -> u64 {
        120
    }
    pub fn retry_max_attempts() -> u32 {
        3
    }
    pub fn retry_initial_delay_ms() -> u64 {
        100
    }
    pub fn retry_max_delay_ms() -> u64 {
        5000
    }
    pub fn retry_exponential_base() -> f64 {
        2.0
    }
    pub fn retry_jitter() -> bool {
        true
    }
    pub fn breaker_failure_threshold() -> u32 {
        3
    }
    pub fn breaker_cooldown_minutes() -> u64 {
        5
    }
    pub fn cloud_credential_env() -> String {
        "ANTHROPIC_API_KEY".to_string()
    }
    pub fn cloud_task_types() -> Vec<String> {
        [
            "code-generation",
            "text-processing",
            "reasoning",
            "summarize",
            "general",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
    pub fn cloud_timeout_seconds() -> u64 {
        60
    }
    pub fn metrics_port() -> u16 {
        8888
    }
    pub fn ledger_path() -> String {
        "yggdrasil.sqlite".to_string()
    }
    pub fn poll_interval_seconds() -> u64 {
        2
    }
    pub fn shutdown_timeout_seconds() -> u64 {
        60
    }
    pub fn health_probe_interval_seconds() -> u64 {
        60
    }

    pub fn builtin_routes() -> HashMap<String, Vec<Capability>> {
        let mut routes = HashMap::new();
        routes.insert("code-generation".into(), vec![Capability::Code]);
        routes.insert("code-refactor".into(), vec![Capability::Code]);
        routes.insert("code-review".into(), vec![Capability::Code]);
        routes.insert("text-processing".into(), vec![Capability::Text]);
        routes.insert("text-generation".into(), vec![Capability::Text]);
        routes.insert("summarize".into(), vec![Capability::Text]);
        routes.insert("reasoning".into(), vec![Capability::Reasoning]);
        routes.insert("analyze".into(), vec![Capability::Reasoning]);
        routes.insert(
            "general".into(),
            vec![Capability::Reasoning, Capability::General],
        );
        routes
    }
}
