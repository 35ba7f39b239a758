use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::RwLock;

/// Rolling window over which duration percentiles are computed.
const PERCENTILE_WINDOW: Duration = Duration::from_secs(300);

#[derive(Default)]
struct MetricsInner {
    /// (host, status) -> completion count.
    tasks_total: HashMap<(String, String), u64>,
    /// host -> (recorded_at, duration_ms), pruned to the rolling window.
    durations: HashMap<String, VecDeque<(Instant, f64)>>,
    /// (host, direction) -> token count, direction is "in" or "out".
    tokens_total: HashMap<(String, String), u64>,
}

/// In-process metrics registry exported as Prometheus text and JSON.
pub struct MetricsCollector {
    started: Instant,
    inner: RwLock<MetricsInner>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            inner: RwLock::new(MetricsInner::default()),
        }
    }

    pub async fn record_task(&self, host: &str, status: &str, duration_ms: f64) {
        let mut inner = self.inner.write().await;
        *inner
            .tasks_total
            .entry((host.to_string(), status.to_string()))
            .or_insert(0) += 1;

        let window = inner.durations.entry(host.to_string()).or_default();
        window.push_back((Instant::now(), duration_ms));
        prune(window);
    }

    pub async fn record_tokens(&self, host: &str, tokens_in: u64, tokens_out: u64) {
        let mut inner = self.inner.write().await;
        *inner
            .tokens_total
            .entry((host.to_string(), "in".to_string()))
            .or_insert(0) += tokens_in;
        *inner
            .tokens_total
            .entry((host.to_string(), "out".to_string()))
            .or_insert(0) += tokens_out;
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub async fn export_prometheus(&self) -> String {
        let mut inner = self.inner.write().await;
        for window in inner.durations.values_mut() {
            prune(window);
        }

        let mut output = Vec::new();
        output.push("# HELP ygg_tasks_total Task completion count".to_string());
        output.push("# TYPE ygg_tasks_total counter".to_string());
        let mut task_keys: Vec<_> = inner.tasks_total.keys().cloned().collect();
        task_keys.sort();
        for (host, status) in task_keys {
            let count = inner.tasks_total[&(host.clone(), status.clone())];
            output.push(format!(
                "ygg_tasks_total{{host=\"{host}\",status=\"{status}\"}} {count}"
            ));
        }

        output.push(String::new());
        output.push("# HELP ygg_task_duration_ms Task duration in milliseconds".to_string());
        output.push("# TYPE ygg_task_duration_ms gauge".to_string());
        let mut hosts: Vec<_> = inner.durations.keys().cloned().collect();
        hosts.sort();
        for host in &hosts {
            let window = &inner.durations[host];
            for percentile in [50u8, 95, 99] {
                let value = percentile_of(window, percentile);
                output.push(format!(
                    "ygg_task_duration_ms{{host=\"{host}\",percentile=\"{percentile}\"}} {value}"
                ));
            }
        }

        output.push(String::new());
        output.push("# HELP ygg_tokens_total Token usage counter".to_string());
        output.push("# TYPE ygg_tokens_total counter".to_string());
        let mut token_keys: Vec<_> = inner.tokens_total.keys().cloned().collect();
        token_keys.sort();
        for (host, direction) in token_keys {
            let count = inner.tokens_total[&(host.clone(), direction.clone())];
            output.push(format!(
                "ygg_tokens_total{{host=\"{host}\",type=\"{direction}\"}} {count}"
            ));
        }

        output.push(String::new());
        output.push("# HELP ygg_uptime_seconds Dispatcher uptime".to_string());
        output.push("# TYPE ygg_uptime_seconds gauge".to_string());
        output.push(format!("ygg_uptime_seconds {}", self.uptime_seconds()));
        output.push(String::new());

        output.join("\n")
    }

    pub async fn export_json(&self) -> Value {
        let mut inner = self.inner.write().await;
        for window in inner.durations.values_mut() {
            prune(window);
        }

        let mut tasks: HashMap<String, HashMap<String, u64>> = HashMap::new();
        for ((host, status), count) in &inner.tasks_total {
            tasks
                .entry(host.clone())
                .or_default()
                .insert(status.clone(), *count);
        }

        let mut latency: HashMap<String, Value> = HashMap::new();
        for (host, window) in &inner.durations {
            latency.insert(
                host.clone(),
                json!({
                    "p50": percentile_of(window, 50),
                    "p95": percentile_of(window, 95),
                    "p99": percentile_of(window, 99),
                }),
            );
        }

        let mut tokens: HashMap<String, HashMap<String, u64>> = HashMap::new();
        for ((host, direction), count) in &inner.tokens_total {
            tokens
                .entry(host.clone())
                .or_default()
                .insert(direction.clone(), *count);
        }

        json!({
            "tasks": tasks,
            "latency_ms": latency,
            "tokens": tokens,
            "uptime_seconds": self.uptime_seconds(),
        })
    }
}

fn prune(window: &mut VecDeque<(Instant, f64)>) {
    let Some(cutoff) = Instant::now().checked_sub(PERCENTILE_WINDOW) else {
        return;
    };
    while window.front().is_some_and(|(at, _)| *at < cutoff) {
        window.pop_front();
    }
}

fn percentile_of(window: &VecDeque<(Instant, f64)>, percentile: u8) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let mut durations: Vec<f64> = window.iter().map(|(_, d)| *d).collect();
    durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = (durations.len() * percentile as usize / 100).min(durations.len() - 1);
    durations[index]
}
