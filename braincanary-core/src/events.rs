use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::controller::FinalState;
use crate::gates::GateResult;
use crate::query::QueryHealth;
use crate::stats::SampleSummary;

/// What the controller intends to do after a gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Hold,
    AutoPromote,
    Rollback,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScorerScores {
    pub baseline: SampleSummary,
    pub canary: SampleSummary,
}

/// Typed lifecycle envelope published for every observable mutation.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub deployment_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    DeploymentStarted {
        name: String,
        stage_index: usize,
        canary_weight: u32,
    },
    ScoreUpdate {
        scores: BTreeMap<String, ScorerScores>,
    },
    GateStatus {
        gates: Vec<GateResult>,
        next_action: NextAction,
        time_remaining_ms: i64,
    },
    StageChange {
        from: usize,
        to: usize,
        canary_weight: u32,
    },
    Paused {
        stage_index: usize,
    },
    Resumed {
        stage_index: usize,
    },
    RollbackTriggered {
        reason: String,
        stage_index: usize,
        canary_weight: u32,
    },
    DeploymentComplete {
        final_state: FinalState,
    },
    MonitorHealth(QueryHealth),
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::DeploymentStarted { .. } => "deployment_started",
            EventPayload::ScoreUpdate { .. } => "score_update",
            EventPayload::GateStatus { .. } => "gate_status",
            EventPayload::StageChange { .. } => "stage_change",
            EventPayload::Paused { .. } => "paused",
            EventPayload::Resumed { .. } => "resumed",
            EventPayload::RollbackTriggered { .. } => "rollback_triggered",
            EventPayload::DeploymentComplete { .. } => "deployment_complete",
            EventPayload::MonitorHealth(_) => "monitor_health",
        }
    }
}

/// In-process fan-out for lifecycle events.
///
/// Subscribers receive events in emission order. Transports (socket
/// broadcasters, webhook dispatchers) subscribe here and must not call back
/// into the controller from the delivery path.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is fine; events are already durable in the store.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
