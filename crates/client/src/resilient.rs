use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use yggdrasil_domain::HostDescriptor;
use yggdrasil_errors::{DispatchError, DispatchResult};
use yggdrasil_observability::{event, Event, EventLog};

use crate::breaker::BreakerRegistry;
use crate::http::{call_chat, call_executor, CallOutput};
use crate::retry::RetryPolicy;

/// Cloud endpoint used when every in-fleet candidate is exhausted.
/// Only task types listed in `task_types` qualify, and the cloud gets
/// exactly one attempt.
#[derive(Debug, Clone)]
pub struct CloudFallback {
    pub endpoint: String,
    pub model: String,
    pub credential_env: String,
    pub task_types: Vec<String>,
    pub timeout: Duration,
}

enum CallKind<'a> {
    Chat { prompt: &'a str },
    Execute { params: &'a Value },
}

/// Outbound call executor combining retry, per-host circuit breaking, and
/// cloud fallback. Holds no per-task state; one instance is shared by all
/// task-processing units.
pub struct ResilientClient {
    http: reqwest::Client,
    policy: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
    cloud: Option<CloudFallback>,
    events: Arc<EventLog>,
}

impl ResilientClient {
    pub fn new(
        policy: RetryPolicy,
        breakers: Arc<BreakerRegistry>,
        cloud: Option<CloudFallback>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            policy,
            breakers,
            cloud,
            events,
        }
    }

    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    /// LLM chat completion through the candidate chain.
    pub async fn chat(
        &self,
        task_id: &str,
        task_type: &str,
        candidates: &[HostDescriptor],
        prompt: &str,
    ) -> DispatchResult<CallOutput> {
        self.execute_chain(task_id, task_type, candidates, CallKind::Chat { prompt })
            .await
    }

    /// Executor dispatch through the candidate chain.
    pub async fn dispatch_to_executor(
        &self,
        task_id: &str,
        task_type: &str,
        candidates: &[HostDescriptor],
        params: &Value,
    ) -> DispatchResult<CallOutput> {
        self.execute_chain(task_id, task_type, candidates, CallKind::Execute { params })
            .await
    }

    async fn execute_chain(
        &self,
        task_id: &str,
        task_type: &str,
        candidates: &[HostDescriptor],
        kind: CallKind<'_>,
    ) -> DispatchResult<CallOutput> {
        let mut last_error: Option<DispatchError> = None;
        let mut attempts_made: u32 = 0;

        for host in candidates {
            if !self.breakers.check(&host.name).await {
                debug!(host = %host.name, "breaker open, skipping candidate");
                continue;
            }

            for attempt in 1..=self.policy.max_attempts {
                attempts_made += 1;
                match self.call_host(host, task_id, task_type, &kind).await {
                    Ok(mut output) => {
                        output.attempts = attempts_made;
                        if self.breakers.record_success(&host.name).await {
                            self.events
                                .emit(
                                    Event::new(event::BREAKER_CLOSED)
                                        .field("host", host.name.as_str()),
                                )
                                .await;
                        }
                        return Ok(output);
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(
                            host = %host.name,
                            attempt,
                            error = %e,
                            "outbound call failed, retryable"
                        );
                        if self.breakers.record_failure(&host.name).await {
                            self.events
                                .emit(
                                    Event::new(event::BREAKER_OPENED)
                                        .warning()
                                        .task(task_id)
                                        .field("host", host.name.as_str()),
                                )
                                .await;
                        }
                        if attempt < self.policy.max_attempts {
                            let delay = self.policy.delay(attempt);
                            self.events
                                .emit(
                                    Event::new(event::TASK_RETRY_SCHEDULED)
                                        .warning()
                                        .task(task_id)
                                        .field("host", host.name.as_str())
                                        .field("attempt", attempt + 1)
                                        .field("delay_ms", delay.as_millis() as u64)
                                        .field("error", e.to_string()),
                                )
                                .await;
                            tokio::time::sleep(delay).await;
                        }
                        last_error = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if let (Some(cloud), CallKind::Chat { prompt }) = (&self.cloud, &kind) {
            if cloud.task_types.iter().any(|t| t == task_type) {
                debug!(task_id, endpoint = %cloud.endpoint, "falling back to cloud");
                let credential = std::env::var(&cloud.credential_env).ok();
                attempts_made += 1;
                match call_chat(
                    &self.http,
                    &cloud.endpoint,
                    &cloud.model,
                    prompt,
                    cloud.timeout,
                    credential.as_deref(),
                )
                .await
                {
                    Ok(mut output) => {
                        output.attempts = attempts_made;
                        return Ok(output);
                    }
                    Err(e) => {
                        warn!(error = %e, "cloud fallback failed");
                        last_error = Some(e);
                    }
                }
            }
        }

        self.events
            .emit(
                Event::new(event::TASK_FAILED_MAX_RETRIES)
                    .error()
                    .task(task_id)
                    .field("task_type", task_type)
                    .field(
                        "error",
                        last_error.map(|e| e.to_string()).unwrap_or_default(),
                    ),
            )
            .await;
        Err(DispatchError::AllHostsUnavailable {
            task_type: task_type.to_string(),
        })
    }

    async fn call_host(
        &self,
        host: &HostDescriptor,
        task_id: &str,
        task_type: &str,
        kind: &CallKind<'_>,
    ) -> DispatchResult<CallOutput> {
        let result = match kind {
            CallKind::Chat { prompt } => {
                call_chat(&self.http, &host.url, &host.model, prompt, host.timeout, None).await
            }
            CallKind::Execute { params } => {
                call_executor(&self.http, &host.url, task_id, task_type, params, host.timeout)
                    .await
            }
        };

        result.map_err(|e| match e {
            DispatchError::MemoryExhausted { message, .. } => DispatchError::MemoryExhausted {
                host: host.name.clone(),
                message,
            },
            other => other,
        })
    }
}
