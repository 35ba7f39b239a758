use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use yggdrasil_errors::{DispatchError, DispatchResult};

use crate::metrics::MetricsCollector;

/// Serves `GET /metrics` (Prometheus text) and `GET /metrics.json`.
pub struct MetricsServer {
    listener: TcpListener,
    collector: Arc<MetricsCollector>,
}

impl MetricsServer {
    pub async fn bind(
        addr: SocketAddr,
        collector: Arc<MetricsCollector>,
    ) -> DispatchResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DispatchError::internal(format!("bind metrics server {addr}: {e}")))?;
        Ok(Self { listener, collector })
    }

    pub fn local_addr(&self) -> DispatchResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| DispatchError::internal(format!("metrics server addr: {e}")))
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> DispatchResult<()> {
        let addr = self.local_addr()?;
        let app = Router::new()
            .route("/metrics", get(prometheus_metrics))
            .route("/metrics.json", get(json_metrics))
            .with_state(self.collector);

        info!(%addr, "metrics server listening");
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await
            .map_err(|e| DispatchError::internal(format!("metrics server: {e}")))
    }
}

async fn prometheus_metrics(State(collector): State<Arc<MetricsCollector>>) -> impl IntoResponse {
    let body = collector.export_prometheus().await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn json_metrics(State(collector): State<Arc<MetricsCollector>>) -> impl IntoResponse {
    Json(collector.export_json().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_prometheus_text_and_json() {
        let collector = Arc::new(MetricsCollector::new());
        collector.record_task("fenrir-chat", "success", 42.0).await;

        let server = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), collector)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(server.run(shutdown_rx));

        let text = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(text.contains("ygg_tasks_total{host=\"fenrir-chat\",status=\"success\"} 1"));

        let json: serde_json::Value = reqwest::get(format!("http://{addr}/metrics.json"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(json["tasks"]["fenrir-chat"]["success"], 1);
        assert!(json["uptime_seconds"].as_f64().unwrap() >= 0.0);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
