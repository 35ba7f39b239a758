use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use yggdrasil_domain::CircuitState;

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Per-host circuit breakers. A host that fails `failure_threshold`
/// consecutive retryable calls is suppressed for `cooldown`, after which a
/// single trial call decides between closing again and re-opening.
pub struct BreakerRegistry {
    failure_threshold: u32,
    cooldown: Duration,
    entries: RwLock<HashMap<String, BreakerEntry>>,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Whether an outbound call to this host is currently allowed. An open
    /// breaker whose cooldown has elapsed moves to half-open and admits
    /// one trial call.
    pub async fn check(&self, host: &str) -> bool {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(host.to_string())
            .or_insert_with(BreakerEntry::new);

        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    debug!(host, "breaker cooldown elapsed, admitting trial call");
                    entry.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Returns true when the host recovered (breaker was not closed).
    pub async fn record_success(&self, host: &str) -> bool {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(host.to_string())
            .or_insert_with(BreakerEntry::new);

        let recovered = entry.state != CircuitState::Closed;
        entry.state = CircuitState::Closed;
        entry.consecutive_failures = 0;
        entry.opened_at = None;
        if recovered {
            debug!(host, "breaker closed after successful call");
        }
        recovered
    }

    /// Returns true when this failure opened the breaker.
    pub async fn record_failure(&self, host: &str) -> bool {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(host.to_string())
            .or_insert_with(BreakerEntry::new);

        entry.consecutive_failures += 1;

        let opens = match entry.state {
            CircuitState::Closed => entry.consecutive_failures >= self.failure_threshold,
            // A failed trial call re-opens immediately and restarts cooldown.
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if opens {
            warn!(
                host,
                failures = entry.consecutive_failures,
                "circuit breaker opened"
            );
            entry.state = CircuitState::Open;
            entry.opened_at = Some(Instant::now());
        }
        opens
    }

    pub async fn state(&self, host: &str) -> CircuitState {
        self.entries
            .read()
            .await
            .get(host)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Per-host state snapshot for status reporting.
    pub async fn snapshot(&self) -> HashMap<String, CircuitState> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(host, entry)| (host.clone(), entry.state))
            .collect()
    }
}
