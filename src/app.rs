use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use yggdrasil_client::{BreakerRegistry, CloudFallback, ResilientClient, RetryPolicy};
use yggdrasil_config::AppConfig;
use yggdrasil_dispatcher::{Dispatcher, HandlerRegistry, HostPool, Router};
use yggdrasil_errors::DispatchResult;
use yggdrasil_ledger::Ledger;
use yggdrasil_observability::{ErrorTracker, EventLog, MetricsCollector, MetricsServer};

use crate::shutdown::ShutdownManager;

/// Owns the wiring: ledger, router, host pool, resilient client, handler
/// registry, and observability, assembled once from validated config.
pub struct Application {
    config: AppConfig,
    ledger: Ledger,
}

impl Application {
    /// Opens the ledger. A failure here is fatal I/O (exit code 3).
    pub async fn new(config: AppConfig) -> DispatchResult<Self> {
        let ledger = Ledger::open(&config.ledger.path).await?;
        Ok(Self { config, ledger })
    }

    pub async fn run(self, shutdown: ShutdownManager) -> DispatchResult<()> {
        let config = &self.config;

        let (events, errors) = if config.observability.enabled {
            let log_dir = config
                .observability
                .log_dir
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(default_log_dir);
            (
                Arc::new(EventLog::open(&log_dir).await?),
                Arc::new(ErrorTracker::open(&log_dir).await?),
            )
        } else {
            (
                Arc::new(EventLog::disabled()),
                Arc::new(ErrorTracker::disabled()),
            )
        };

        let hosts = config.host_descriptors();
        info!(hosts = hosts.len(), ledger = %config.ledger.path, "starting dispatcher");

        let router = Arc::new(Router::new(
            hosts.clone(),
            config.routing_capabilities(),
            config.default_host.clone(),
            Arc::clone(&events),
        ));
        router.probe_once().await;
        let probe_handle =
            router.spawn_probe_loop(config.health_probe_interval(), shutdown.subscribe());

        let pool = Arc::new(HostPool::new(
            hosts
                .iter()
                .map(|h| (h.name.clone(), config.concurrency_for(&h.name))),
        ));

        let policy = RetryPolicy {
            max_attempts: config.retry.max_attempts,
            initial_delay: std::time::Duration::from_millis(config.retry.initial_delay_ms),
            max_delay: std::time::Duration::from_millis(config.retry.max_delay_ms),
            exponential_base: config.retry.exponential_base,
            jitter: config.retry.jitter,
        };
        let breakers = Arc::new(BreakerRegistry::new(
            config.breaker.failure_threshold,
            config.breaker.cooldown(),
        ));
        let cloud = config.cloud.enabled.then(|| CloudFallback {
            endpoint: config.cloud.endpoint.clone(),
            model: config.cloud.model.clone(),
            credential_env: config.cloud.credential_env.clone(),
            task_types: config.cloud.task_types.clone(),
            timeout: std::time::Duration::from_secs(config.cloud.timeout_seconds),
        });
        let client = Arc::new(ResilientClient::new(
            policy,
            breakers,
            cloud,
            Arc::clone(&events),
        ));

        let metrics = Arc::new(MetricsCollector::new());
        let metrics_handle = if config.observability.enabled && config.observability.enable_metrics
        {
            let addr = ([0, 0, 0, 0], config.observability.metrics_port).into();
            let server = MetricsServer::bind(addr, Arc::clone(&metrics)).await?;
            Some(tokio::spawn(server.run(shutdown.subscribe())))
        } else {
            None
        };

        let dispatcher = Dispatcher::new(
            self.ledger.clone(),
            router,
            pool,
            HandlerRegistry::builtin(),
            client,
            events,
            metrics,
            errors,
            config.poll_interval(),
            config.shutdown_timeout(),
        );

        dispatcher.run(shutdown.subscribe()).await;

        if let Err(e) = probe_handle.await {
            warn!(error = %e, "health probe loop ended abnormally");
        }
        if let Some(handle) = metrics_handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "metrics server ended abnormally"),
                Err(e) => warn!(error = %e, "metrics server task ended abnormally"),
            }
        }

        self.ledger.close().await;
        Ok(())
    }
}

fn default_log_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache/yggdrasil")
}
