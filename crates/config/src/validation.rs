use std::collections::HashSet;

use yggdrasil_domain::Capability;
use yggdrasil_errors::{DispatchError, DispatchResult};

use crate::models::AppConfig;

impl AppConfig {
    /// Startup validation. Any failure here aborts the process with the
    /// configuration exit code before the ledger is touched.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.hosts.is_empty() {
            return Err(DispatchError::config_error("no hosts configured"));
        }

        let mut names = HashSet::new();
        for host in &self.hosts {
            if host.name.is_empty() {
                return Err(DispatchError::config_error("host with empty name"));
            }
            if host.url.is_empty() {
                return Err(DispatchError::config_error(format!(
                    "host {} has no url",
                    host.name
                )));
            }
            if !names.insert(host.name.as_str()) {
                return Err(DispatchError::config_error(format!(
                    "duplicate host name: {}",
                    host.name
                )));
            }
            if host.timeout_seconds == 0 || host.timeout_seconds > 3600 {
                return Err(DispatchError::config_error(format!(
                    "host {} timeout_seconds must be in 1..=3600",
                    host.name
                )));
            }
            for cap in &host.capabilities {
                if Capability::parse(cap).is_none() {
                    return Err(DispatchError::config_error(format!(
                        "host {} has unknown capability {cap:?}",
                        host.name
                    )));
                }
            }
        }

        for (host, limit) in &self.concurrency {
            if !(1..=16).contains(limit) {
                return Err(DispatchError::config_error(format!(
                    "concurrency.{host} must be in 1..=16, got {limit}"
                )));
            }
            if !names.contains(host.as_str()) {
                return Err(DispatchError::config_error(format!(
                    "concurrency entry for unknown host {host}"
                )));
            }
        }

        if !(1..=10).contains(&self.retry.max_attempts) {
            return Err(DispatchError::config_error(
                "retry.max_attempts must be in 1..=10",
            ));
        }
        if self.retry.initial_delay_ms == 0 {
            return Err(DispatchError::config_error(
                "retry.initial_delay_ms must be positive",
            ));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(DispatchError::config_error(
                "retry.max_delay_ms must be >= retry.initial_delay_ms",
            ));
        }
        if !(1.1..=5.0).contains(&self.retry.exponential_base) {
            return Err(DispatchError::config_error(
                "retry.exponential_base must be in 1.1..=5.0",
            ));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(DispatchError::config_error(
                "breaker.failure_threshold must be positive",
            ));
        }
        if self.breaker.cooldown_minutes == 0 {
            return Err(DispatchError::config_error(
                "breaker.cooldown_minutes must be positive",
            ));
        }

        if self.observability.enable_metrics && self.observability.metrics_port < 1024 {
            return Err(DispatchError::config_error(
                "observability.metrics_port must be >= 1024",
            ));
        }

        if let Some(default_host) = &self.default_host {
            if !names.contains(default_host.as_str()) {
                return Err(DispatchError::config_error(format!(
                    "default_host {default_host} is not a configured host"
                )));
            }
        }

        for (task_type, caps) in &self.routing {
            for cap in caps {
                if Capability::parse(cap).is_none() {
                    return Err(DispatchError::config_error(format!(
                        "routing.{task_type} names unknown capability {cap:?}"
                    )));
                }
            }
        }

        if self.cloud.enabled {
            if self.cloud.endpoint.is_empty() {
                return Err(DispatchError::config_error(
                    "cloud.enabled requires cloud.endpoint",
                ));
            }
            if self.cloud.credential_env.is_empty() {
                return Err(DispatchError::config_error(
                    "cloud.enabled requires cloud.credential_env",
                ));
            }
            if std::env::var(&self.cloud.credential_env).is_err() {
                return Err(DispatchError::config_error(format!(
                    "cloud fallback enabled but {} is not set",
                    self.cloud.credential_env
                )));
            }
        }

        if self.poll_interval_seconds == 0 {
            return Err(DispatchError::config_error(
                "poll_interval_seconds must be positive",
            ));
        }
        if self.shutdown_timeout_seconds == 0 {
            return Err(DispatchError::config_error(
                "shutdown_timeout_seconds must be positive",
            ));
        }

        Ok(())
    }
}
