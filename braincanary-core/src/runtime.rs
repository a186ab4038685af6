use std::sync::Arc;

use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clock::SharedClock;
use crate::config::DeploymentConfig;
use crate::controller::{ControllerError, DeploymentSnapshot, StageController};
use crate::events::EventBus;
use crate::monitor::{MonitorParams, MonitorSignal, ScoreMonitor};
use crate::query::QueryClient;
use crate::router::{route, RouteDecision};
use crate::store::DeploymentStore;

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("monitor already running")]
    MonitorRunning,
}

/// Owns construction and teardown of the controller, monitor, and event bus
/// for the single deployment a host runs at a time.
///
/// Monitor signals flow through one forwarding task, so controller callbacks
/// are processed strictly one at a time. Shutdown halts the timers and joins
/// the tasks; it transitions nothing, and the persisted snapshot is picked up
/// again on the next construction.
pub struct DeploymentRuntime {
    controller: Arc<StageController>,
    bus: EventBus,
    query: Arc<dyn QueryClient>,
    monitor: Mutex<Option<Arc<ScoreMonitor>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl DeploymentRuntime {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        query: Arc<dyn QueryClient>,
        clock: SharedClock,
    ) -> RuntimeResult<Self> {
        let bus = EventBus::default();
        let controller = Arc::new(StageController::new(store, bus.clone(), clock)?);
        Ok(Self {
            controller,
            bus,
            query,
            monitor: Mutex::new(None),
            forwarder: Mutex::new(None),
        })
    }

    pub fn controller(&self) -> Arc<StageController> {
        self.controller.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Starts a new deployment and brings up its score monitor.
    pub async fn launch(&self, config: DeploymentConfig) -> RuntimeResult<DeploymentSnapshot> {
        let snapshot = self.controller.start_deployment(config).await?;
        self.start_monitor(&snapshot).await?;
        Ok(snapshot)
    }

    /// Restarts monitoring for a deployment recovered from the store, if any.
    pub async fn resume_active(&self) -> RuntimeResult<Option<DeploymentSnapshot>> {
        let Some(snapshot) = self.controller.snapshot() else {
            return Ok(None);
        };
        if snapshot.state.is_terminal() {
            return Ok(None);
        }
        self.start_monitor(&snapshot).await?;
        Ok(Some(snapshot))
    }

    async fn start_monitor(&self, snapshot: &DeploymentSnapshot) -> RuntimeResult<()> {
        let mut slot = self.monitor.lock().await;
        if slot.is_some() {
            return Err(RuntimeError::MonitorRunning);
        }
        let params = MonitorParams {
            deployment_id: snapshot.id.clone(),
            project: snapshot.config.project.clone(),
            poll_interval: snapshot.config.monitor.poll_interval.as_std(),
            stage_started_at: snapshot.stage_entered_at,
            scorers: snapshot.config.scorer_names(),
            scorer_lag_grace: snapshot.config.monitor.scorer_lag_grace.as_chrono(),
        };
        let (monitor, mut signals) = ScoreMonitor::spawn(params, self.query.clone());
        self.controller.attach_monitor(monitor.clone()).await;
        *slot = Some(monitor);

        let controller = self.controller.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let outcome = match signal {
                    MonitorSignal::Scores(update) => controller.on_score_update(update).await,
                    MonitorSignal::Health(health) => controller.on_monitor_health(health).await,
                };
                if let Err(err) = outcome {
                    // Durable state could not keep up with in-memory state;
                    // surface loudly and keep the loop alive for the next
                    // snapshot.
                    error!(
                        target: "deployment_runtime",
                        error = %err,
                        "failed to apply monitor signal"
                    );
                }
            }
        });
        *self.forwarder.lock().await = Some(forwarder);
        Ok(())
    }

    /// Routing decision for one request against the current snapshot.
    pub fn route(&self, sticky: Option<&str>) -> RouteDecision {
        let snapshot = self.controller.snapshot();
        let draw = rand::thread_rng().gen::<f64>();
        route(snapshot.as_ref(), sticky, draw)
    }

    /// Halts the monitor and the forwarding task. No state transitions.
    pub async fn shutdown(&self) {
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.stop().await;
        }
        if let Some(forwarder) = self.forwarder.lock().await.take() {
            // The monitor's sender is gone, so the loop drains and ends.
            let _ = forwarder.await;
        }
        info!(target: "deployment_runtime", "runtime shut down");
    }
}
