use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use yggdrasil_domain::{Capability, HostDescriptor, Task};
use yggdrasil_errors::{DispatchError, DispatchResult};
use yggdrasil_observability::{event, Event, EventLog};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

struct HostState {
    descriptor: HostDescriptor,
    healthy: AtomicBool,
}

/// Task-type -> capability -> host resolution, plus periodic health
/// probing. Hosts start healthy and are marked down on a failed probe.
pub struct Router {
    hosts: Vec<HostState>,
    routing: HashMap<String, Vec<Capability>>,
    default_host: Option<String>,
    round_robin: AtomicUsize,
    http: reqwest::Client,
    events: Arc<EventLog>,
}

impl Router {
    pub fn new(
        hosts: Vec<HostDescriptor>,
        routing: HashMap<String, Vec<Capability>>,
        default_host: Option<String>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            hosts: hosts
                .into_iter()
                .map(|descriptor| HostState {
                    descriptor,
                    healthy: AtomicBool::new(true),
                })
                .collect(),
            routing,
            default_host,
            round_robin: AtomicUsize::new(0),
            http: reqwest::Client::new(),
            events,
        }
    }

    /// Primary host for a task.
    pub fn route(&self, task: &Task) -> DispatchResult<HostDescriptor> {
        self.candidates(task)
            .into_iter()
            .next()
            .ok_or_else(|| DispatchError::AllHostsUnavailable {
                task_type: task.effective_type().to_string(),
            })
    }

    /// Ordered fallback chain for a task: healthy hosts before unhealthy,
    /// then ascending priority, round-robin among equal-priority leaders.
    /// A label naming a host pins the task to it, bypassing capability
    /// matching (breaker state still applies downstream).
    pub fn candidates(&self, task: &Task) -> Vec<HostDescriptor> {
        for label in &task.labels {
            if let Some(state) = self.hosts.iter().find(|h| &h.descriptor.name == label) {
                debug!(task_id = %task.id, host = label.as_str(), "label override routing");
                return vec![state.descriptor.clone()];
            }
        }

        let task_type = task.effective_type();
        let capabilities = self
            .routing
            .get(task_type)
            .cloned()
            .unwrap_or_else(|| vec![Capability::General]);

        let mut chain: Vec<HostDescriptor> = Vec::new();
        for capability in capabilities {
            for host in self.hosts_for_capability(capability) {
                if !chain.iter().any(|h| h.name == host.name) {
                    chain.push(host);
                }
            }
        }

        if let Some(default) = &self.default_host {
            if !chain.iter().any(|h| &h.name == default) {
                if let Some(state) = self.hosts.iter().find(|h| &h.descriptor.name == default) {
                    chain.push(state.descriptor.clone());
                }
            }
        }

        chain
    }

    fn hosts_for_capability(&self, capability: Capability) -> Vec<HostDescriptor> {
        let mut matching: Vec<(bool, i64, HostDescriptor)> = self
            .hosts
            .iter()
            .filter(|h| h.descriptor.has_capability(capability))
            .map(|h| {
                (
                    h.healthy.load(Ordering::Relaxed),
                    h.descriptor.priority,
                    h.descriptor.clone(),
                )
            })
            .collect();

        // Healthy first (false sorts after true via negation), then priority.
        matching.sort_by_key(|(healthy, priority, _)| (!*healthy, *priority));

        // Rotate the leading tie group so equal-priority healthy hosts
        // take turns as the primary.
        let lead = matching
            .iter()
            .take_while(|(healthy, priority, _)| {
                matching
                    .first()
                    .is_some_and(|(h0, p0, _)| healthy == h0 && priority == p0)
            })
            .count();
        if lead > 1 {
            let shift = self.round_robin.fetch_add(1, Ordering::Relaxed) % lead;
            matching[..lead].rotate_left(shift);
        }

        matching.into_iter().map(|(_, _, host)| host).collect()
    }

    pub fn is_healthy(&self, host: &str) -> bool {
        self.hosts
            .iter()
            .find(|h| h.descriptor.name == host)
            .map(|h| h.healthy.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Flip a host's health flag; returns true if the flag changed. Also
    /// called by startup wiring and tests; probing is the usual driver.
    pub fn set_healthy(&self, host: &str, healthy: bool) -> bool {
        let Some(state) = self.hosts.iter().find(|h| h.descriptor.name == host) else {
            return false;
        };
        state.healthy.swap(healthy, Ordering::Relaxed) != healthy
    }

    /// Probe every host's `/health` endpoint once. Non-200 or timeout
    /// marks the host unhealthy; a later successful probe restores it.
    pub async fn probe_once(&self) {
        for state in &self.hosts {
            let name = state.descriptor.name.clone();
            let url = format!(
                "{}/health",
                state.descriptor.url.trim_end_matches('/')
            );
            let healthy = match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
                Ok(response) => response.status().is_success(),
                Err(e) => {
                    debug!(host = name.as_str(), error = %e, "health probe failed");
                    false
                }
            };

            if self.set_healthy(&name, healthy) {
                if healthy {
                    info!(host = name.as_str(), "host back to healthy");
                } else {
                    warn!(host = name.as_str(), "host marked unhealthy");
                    self.events
                        .emit(
                            Event::new(event::HOST_UNHEALTHY)
                                .warning()
                                .field("host", name.as_str()),
                        )
                        .await;
                }
            }
        }
    }

    /// Background probe loop; exits on the shutdown signal.
    pub fn spawn_probe_loop(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(interval) => router.probe_once().await,
                }
            }
        })
    }
}
