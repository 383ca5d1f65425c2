use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, routing::get, Router};

use crate::metrics::registry::Metrics;

/// Standalone HTTP server exposing `GET /metrics` in Prometheus text
/// format, on its own port so scrapes never touch the consensus path.
pub struct MetricsServer {
    pub listen_addr: String,
    pub metrics: Arc<Metrics>,
}

impl MetricsServer {
    pub fn new(listen_addr: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            metrics,
        }
    }

    pub async fn run(self) -> Result<(), anyhow::Error> {
        let app = Router::new()
            .route("/metrics", get(handle_metrics))
            .with_state(self.metrics);

        let addr: SocketAddr = self.listen_addr.parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn handle_metrics(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.encode()
}
