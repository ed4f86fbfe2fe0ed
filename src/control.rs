//! Control surface (spec §4.10): status/metrics/health queries and
//! start/stop/reload commands, decoupled from whatever transport exposes
//! them (a local Unix socket, an admin HTTP endpoint, a CLI subcommand).

use crate::cert_store::CertificateStore;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::state_machine::State;
use crate::tunnel::StatisticsSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Status,
    Metrics,
    Health,
    Start,
    Stop,
    Reload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointMetrics {
    pub address: String,
    pub active: u32,
    pub total: u64,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub tunnel: StatisticsSnapshot,
    pub endpoints: Vec<EndpointMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub state: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Status(StatusResponse),
    Metrics(Metrics),
    Health(HealthResponse),
    Ack,
}

/// A transport-agnostic handler for control commands. Implementors wire
/// this to whatever local channel (Unix socket, HTTP, SNMP agent) the
/// deployment exposes; the core logic lives here so every transport behaves
/// identically.
#[async_trait::async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, command: Command) -> Result<Response>;
}

/// The canonical handler, backed directly by the running service's state.
pub struct ServiceControlHandler {
    state_machine: Arc<crate::state_machine::StateMachine>,
    stats: Arc<crate::tunnel::Statistics>,
    endpoints: Arc<dyn Fn() -> Vec<Arc<Endpoint>> + Send + Sync>,
    cert_store: Option<Arc<CertificateStore>>,
    started_at: std::time::Instant,
}

impl ServiceControlHandler {
    pub fn new(
        state_machine: Arc<crate::state_machine::StateMachine>,
        stats: Arc<crate::tunnel::Statistics>,
        endpoints: Arc<dyn Fn() -> Vec<Arc<Endpoint>> + Send + Sync>,
    ) -> Self {
        Self {
            state_machine,
            stats,
            endpoints,
            cert_store: None,
            started_at: std::time::Instant::now(),
        }
    }

    /// Attach the certificate store so `Command::Reload` can actually
    /// re-read and re-validate the cert/key files instead of being a no-op.
    pub fn with_cert_store(mut self, cert_store: Arc<CertificateStore>) -> Self {
        self.cert_store = Some(cert_store);
        self
    }

    async fn status(&self) -> StatusResponse {
        StatusResponse {
            state: self.state_machine.current().await.to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    async fn metrics(&self) -> Metrics {
        let endpoints = (self.endpoints)()
            .iter()
            .map(|e| EndpointMetrics {
                address: e.descriptor.address.to_string(),
                active: e.stats.active(),
                total: e.stats.total.load(std::sync::atomic::Ordering::Relaxed),
                healthy: e.is_healthy(),
            })
            .collect();
        Metrics {
            tunnel: self.stats.snapshot(),
            endpoints,
        }
    }

    async fn health(&self) -> HealthResponse {
        let state = self.state_machine.current().await;
        let healthy = matches!(state, State::Running | State::Ready);
        HealthResponse {
            healthy,
            state: state.to_string(),
            detail: if healthy {
                None
            } else {
                Some(format!("service is in state {state}, not serving traffic"))
            },
        }
    }
}

#[async_trait::async_trait]
impl ControlHandler for ServiceControlHandler {
    async fn handle(&self, command: Command) -> Result<Response> {
        match command {
            Command::Status => Ok(Response::Status(self.status().await)),
            Command::Metrics => Ok(Response::Metrics(self.metrics().await)),
            Command::Health => Ok(Response::Health(self.health().await)),
            Command::Start => {
                self.state_machine.transition(State::Starting).await?;
                Ok(Response::Ack)
            }
            Command::Stop => {
                self.state_machine.transition(State::Stopping).await?;
                Ok(Response::Ack)
            }
            Command::Reload => {
                if let Some(cert_store) = &self.cert_store {
                    cert_store.reload()?;
                }
                Ok(Response::Ack)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::StateMachine;
    use crate::tunnel::Statistics;

    #[tokio::test]
    async fn status_reports_current_state() {
        let sm = Arc::new(StateMachine::new());
        let stats = Arc::new(Statistics::default());
        let handler = ServiceControlHandler::new(sm.clone(), stats, Arc::new(Vec::new));
        sm.transition(crate::state_machine::State::Initializing)
            .await
            .unwrap();
        let response = handler.handle(Command::Status).await.unwrap();
        match response {
            Response::Status(s) => assert_eq!(s.state, "initializing"),
            _ => panic!("expected Status response"),
        }
    }

    #[tokio::test]
    async fn health_is_false_before_running() {
        let sm = Arc::new(StateMachine::new());
        let stats = Arc::new(Statistics::default());
        let handler = ServiceControlHandler::new(sm, stats, Arc::new(Vec::new));
        let response = handler.handle(Command::Health).await.unwrap();
        match response {
            Response::Health(h) => assert!(!h.healthy),
            _ => panic!("expected Health response"),
        }
    }

    #[tokio::test]
    async fn metrics_reflects_endpoint_snapshot() {
        use std::net::SocketAddr;
        let sm = Arc::new(StateMachine::new());
        let stats = Arc::new(Statistics::default());
        let endpoint = Arc::new(Endpoint::new("127.0.0.1:9000".parse::<SocketAddr>().unwrap(), 1));
        let endpoint2 = endpoint.clone();
        let handler = ServiceControlHandler::new(
            sm,
            stats,
            Arc::new(move || vec![endpoint2.clone()]),
        );
        let response = handler.handle(Command::Metrics).await.unwrap();
        match response {
            Response::Metrics(m) => assert_eq!(m.endpoints.len(), 1),
            _ => panic!("expected Metrics response"),
        }
    }
}
