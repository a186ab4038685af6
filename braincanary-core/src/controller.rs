use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::{ConfigError, DeploymentConfig, RollbackPolicy, Stage};
use crate::events::{Event, EventBus, EventPayload, NextAction, ScorerScores};
use crate::gates::{evaluate_gate, GateResult, GateStatus, VersionSample};
use crate::monitor::{ScoreMonitor, ScoreUpdate};
use crate::query::QueryHealth;
use crate::store::{DeploymentStore, ScoreSnapshotRow, StoreError, TransitionRecord};

pub type ControllerResult<T> = std::result::Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("transition from {from} to {to} is not allowed")]
    InvalidTransition {
        from: DeploymentState,
        to: DeploymentState,
    },
    #[error("no active deployment")]
    NoActiveDeployment,
    #[error("deployment {deployment_id} is still active")]
    AlreadyActive { deployment_id: String },
    #[error("promotion blocked: {reason}")]
    PromoteBlocked { reason: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    Idle,
    Pending,
    Stage,
    Paused,
    RollingBack,
    RolledBack,
    Promoted,
}

impl DeploymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Idle => "IDLE",
            DeploymentState::Pending => "PENDING",
            DeploymentState::Stage => "STAGE",
            DeploymentState::Paused => "PAUSED",
            DeploymentState::RollingBack => "ROLLING_BACK",
            DeploymentState::RolledBack => "ROLLED_BACK",
            DeploymentState::Promoted => "PROMOTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IDLE" => Some(DeploymentState::Idle),
            "PENDING" => Some(DeploymentState::Pending),
            "STAGE" => Some(DeploymentState::Stage),
            "PAUSED" => Some(DeploymentState::Paused),
            "ROLLING_BACK" => Some(DeploymentState::RollingBack),
            "ROLLED_BACK" => Some(DeploymentState::RolledBack),
            "PROMOTED" => Some(DeploymentState::Promoted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentState::RolledBack | DeploymentState::Promoted)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalState {
    Promoted,
    RolledBack,
}

impl FinalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalState::Promoted => "PROMOTED",
            FinalState::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PROMOTED" => Some(FinalState::Promoted),
            "ROLLED_BACK" => Some(FinalState::RolledBack),
            _ => None,
        }
    }
}

/// The controller's single source of truth for one deployment; persisted on
/// every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSnapshot {
    pub id: String,
    pub name: String,
    pub config: DeploymentConfig,
    pub state: DeploymentState,
    pub stage_index: usize,
    pub stage_entered_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_state: Option<FinalState>,
    pub paused_stage_index: Option<usize>,
    pub canary_weight: u32,
    pub reason: Option<String>,
}

impl DeploymentSnapshot {
    pub fn current_stage(&self) -> &Stage {
        &self.config.stages[self.stage_index.min(self.config.stages.len() - 1)]
    }
}

fn allowed_transition(from: DeploymentState, to: DeploymentState) -> bool {
    use DeploymentState::*;
    matches!(
        (from, to),
        (Idle, Pending)
            | (Pending, Stage)
            | (Pending, RollingBack)
            | (Stage, Stage)
            | (Stage, Paused)
            | (Stage, RollingBack)
            | (Stage, Promoted)
            | (Paused, Stage)
            | (Paused, RollingBack)
            | (RollingBack, RolledBack)
    )
}

/// Checks the rollback tripwires against the latest gate results, most
/// decisive evidence first. Gates without enough data contribute nothing.
pub fn evaluate_rollback(
    gates: &[GateResult],
    canary_error_rate: f64,
    policy: &RollbackPolicy,
) -> Option<String> {
    for gate in gates {
        if gate.status == GateStatus::Failing {
            if let Some(p) = gate.p_value {
                if p < 0.01 {
                    return Some(format!("score_regression:{}", gate.scorer));
                }
            }
        }
    }
    for gate in gates {
        if gate.status != GateStatus::InsufficientData
            && gate.baseline_mean - gate.canary_mean > policy.on_score_drop
        {
            return Some(format!("absolute_drop:{}", gate.scorer));
        }
    }
    if canary_error_rate > policy.on_error_rate {
        return Some("error_rate_exceeded".to_string());
    }
    None
}

struct StageDecision {
    next_action: NextAction,
    rollback_reason: Option<String>,
    time_remaining_ms: i64,
}

struct ControllerInner {
    snapshot: Option<DeploymentSnapshot>,
    latest_scores: Option<ScoreUpdate>,
    latest_gates: Vec<GateResult>,
    monitor: Option<Arc<ScoreMonitor>>,
    monitor_epoch: u64,
}

/// Owner of the sole mutable deployment snapshot.
///
/// Every mutation goes through one private transition helper that validates
/// the move against the state table, persists the patched snapshot and a
/// transition record, and only then lets the corresponding event out. Monitor
/// callbacks and manual operations serialize on one internal lock; the
/// request-path router reads a cloned snapshot without ever touching it.
pub struct StageController {
    store: Arc<dyn DeploymentStore>,
    bus: EventBus,
    clock: SharedClock,
    inner: Mutex<ControllerInner>,
    current: RwLock<Option<DeploymentSnapshot>>,
}

impl StageController {
    /// Builds the controller, adopting the most recent non-terminal
    /// deployment from the store if one exists.
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        bus: EventBus,
        clock: SharedClock,
    ) -> ControllerResult<Self> {
        let recovered = store.active_deployment()?;
        if let Some(snapshot) = &recovered {
            let elapsed = clock.now() - snapshot.stage_entered_at;
            info!(
                target: "stage_controller",
                deployment_id = %snapshot.id,
                state = %snapshot.state,
                stage_index = snapshot.stage_index,
                stage_elapsed_s = elapsed.num_seconds(),
                "recovered active deployment"
            );
        }
        Ok(Self {
            store,
            bus,
            clock,
            current: RwLock::new(recovered.clone()),
            inner: Mutex::new(ControllerInner {
                snapshot: recovered,
                latest_scores: None,
                latest_gates: Vec::new(),
                monitor: None,
                monitor_epoch: 0,
            }),
        })
    }

    /// Stable reference snapshot for request-path readers; never blocks on a
    /// transition beyond the pointer swap.
    pub fn snapshot(&self) -> Option<DeploymentSnapshot> {
        self.current.read().unwrap().clone()
    }

    pub async fn latest_gates(&self) -> Vec<GateResult> {
        self.inner.lock().await.latest_gates.clone()
    }

    /// Hands the controller the monitor it resets on stage entry. The monitor
    /// starts at epoch 0, matching the controller's initial expectation.
    pub async fn attach_monitor(&self, monitor: Arc<ScoreMonitor>) {
        let mut inner = self.inner.lock().await;
        inner.monitor = Some(monitor);
        inner.monitor_epoch = 0;
    }

    pub async fn start_deployment(
        &self,
        config: DeploymentConfig,
    ) -> ControllerResult<DeploymentSnapshot> {
        config.validate()?;
        let mut inner = self.inner.lock().await;
        if let Some(existing) = &inner.snapshot {
            if !existing.state.is_terminal() {
                return Err(ControllerError::AlreadyActive {
                    deployment_id: existing.id.clone(),
                });
            }
        }

        let now = self.clock.now();
        let snapshot = DeploymentSnapshot {
            id: format!("dep-{}", Uuid::new_v4().simple()),
            name: config.name.clone(),
            state: DeploymentState::Pending,
            stage_index: 0,
            stage_entered_at: now,
            started_at: now,
            completed_at: None,
            final_state: None,
            paused_stage_index: None,
            canary_weight: config.stages[0].weight,
            reason: None,
            config,
        };
        self.store.save_snapshot(&snapshot)?;
        self.store.append_transition(&TransitionRecord {
            deployment_id: snapshot.id.clone(),
            from_state: DeploymentState::Idle,
            to_state: DeploymentState::Pending,
            reason: Some("deployment_started".to_string()),
            scores_snapshot_json: None,
            ts: now,
        })?;
        *self.current.write().unwrap() = Some(snapshot.clone());
        inner.snapshot = Some(snapshot.clone());
        inner.latest_scores = None;
        inner.latest_gates.clear();

        info!(
            target: "stage_controller",
            deployment_id = %snapshot.id,
            name = %snapshot.name,
            canary_weight = snapshot.canary_weight,
            "deployment started"
        );
        self.emit(
            &snapshot.id,
            EventPayload::DeploymentStarted {
                name: snapshot.name.clone(),
                stage_index: 0,
                canary_weight: snapshot.canary_weight,
            },
        )?;
        self.apply_transition(&mut inner, DeploymentState::Stage, None, None, |_| {})?;

        inner
            .snapshot
            .clone()
            .ok_or(ControllerError::NoActiveDeployment)
    }

    /// Entry point for the monitor's score stream.
    pub async fn on_score_update(&self, update: ScoreUpdate) -> ControllerResult<()> {
        let mut inner = self.inner.lock().await;
        if update.epoch != inner.monitor_epoch {
            debug!(
                target: "stage_controller",
                got = update.epoch,
                expected = inner.monitor_epoch,
                "dropping score update from a superseded stage"
            );
            return Ok(());
        }
        let Some(snapshot) = inner.snapshot.clone() else {
            return Ok(());
        };
        if snapshot.state.is_terminal() {
            return Ok(());
        }

        let now = self.clock.now();
        let score_rows: Vec<ScoreSnapshotRow> = update
            .scorers
            .iter()
            .map(|(scorer, sample)| ScoreSnapshotRow {
                deployment_id: snapshot.id.clone(),
                stage_index: snapshot.stage_index,
                scorer: scorer.clone(),
                baseline: sample.baseline.summary,
                canary: sample.canary.summary,
                ts: now,
            })
            .collect();
        self.store.append_score_rows(&score_rows)?;
        inner.latest_scores = Some(update.clone());

        self.emit(
            &snapshot.id,
            EventPayload::ScoreUpdate {
                scores: score_map(&update),
            },
        )?;

        if snapshot.state != DeploymentState::Stage {
            return Ok(());
        }

        let gates = evaluate_stage_gates(&snapshot, &update);
        inner.latest_gates = gates.clone();
        let decision = self.stage_decision(&snapshot, &gates, &update);
        self.emit(
            &snapshot.id,
            EventPayload::GateStatus {
                gates,
                next_action: decision.next_action,
                time_remaining_ms: decision.time_remaining_ms,
            },
        )?;

        match decision.next_action {
            NextAction::Rollback => {
                let reason = decision
                    .rollback_reason
                    .unwrap_or_else(|| "rollback".to_string());
                self.perform_rollback(&mut inner, &reason)?;
            }
            NextAction::AutoPromote => {
                self.advance_stage(&mut inner, "auto_promote").await?;
            }
            NextAction::Hold => {}
        }
        Ok(())
    }

    /// Entry point for the monitor's health stream. Quiet once the
    /// deployment is terminal so deployment_complete stays the last word.
    pub async fn on_monitor_health(&self, health: QueryHealth) -> ControllerResult<()> {
        let inner = self.inner.lock().await;
        let Some(snapshot) = &inner.snapshot else {
            return Ok(());
        };
        if snapshot.state.is_terminal() {
            return Ok(());
        }
        self.emit(&snapshot.id, EventPayload::MonitorHealth(health))
    }

    pub async fn pause(&self) -> ControllerResult<DeploymentSnapshot> {
        let mut inner = self.inner.lock().await;
        let stage_index = self.require_snapshot(&inner)?.stage_index;
        self.apply_transition(&mut inner, DeploymentState::Paused, None, None, |snap| {
            snap.paused_stage_index = Some(snap.stage_index);
        })?;
        let snapshot = self.require_snapshot(&inner)?.clone();
        self.emit(&snapshot.id, EventPayload::Paused { stage_index })?;
        Ok(snapshot)
    }

    /// Returns to STAGE at the paused index; the stage timer restarts.
    pub async fn resume(&self) -> ControllerResult<DeploymentSnapshot> {
        let mut inner = self.inner.lock().await;
        {
            let snapshot = self.require_snapshot(&inner)?;
            if snapshot.state != DeploymentState::Paused {
                return Err(ControllerError::InvalidTransition {
                    from: snapshot.state,
                    to: DeploymentState::Stage,
                });
            }
        }
        let now = self.clock.now();
        self.apply_transition(&mut inner, DeploymentState::Stage, None, None, |snap| {
            snap.stage_entered_at = now;
            snap.paused_stage_index = None;
        })?;
        let snapshot = self.require_snapshot(&inner)?.clone();
        self.emit(
            &snapshot.id,
            EventPayload::Resumed {
                stage_index: snapshot.stage_index,
            },
        )?;
        Ok(snapshot)
    }

    /// Manual promotion. From STAGE without `force`, the current stage must
    /// already qualify for auto-promotion; from PAUSED it is always allowed.
    pub async fn promote(&self, force: bool) -> ControllerResult<DeploymentSnapshot> {
        let mut inner = self.inner.lock().await;
        let state = self.require_snapshot(&inner)?.state;
        match state {
            DeploymentState::Stage => {
                if !force {
                    let snapshot = self.require_snapshot(&inner)?.clone();
                    let update = inner.latest_scores.clone().ok_or_else(|| {
                        ControllerError::PromoteBlocked {
                            reason: "no score snapshot received yet".to_string(),
                        }
                    })?;
                    let gates = evaluate_stage_gates(&snapshot, &update);
                    let decision = self.stage_decision(&snapshot, &gates, &update);
                    if decision.next_action != NextAction::AutoPromote {
                        return Err(ControllerError::PromoteBlocked {
                            reason: format!(
                                "stage decision is {:?}, not auto_promote",
                                decision.next_action
                            ),
                        });
                    }
                }
                self.advance_stage(&mut inner, "manual_promote").await?;
            }
            DeploymentState::Paused => {
                self.advance_stage(&mut inner, "manual_promote").await?;
            }
            other => {
                return Err(ControllerError::InvalidTransition {
                    from: other,
                    to: DeploymentState::Stage,
                });
            }
        }
        Ok(self.require_snapshot(&inner)?.clone())
    }

    /// Cuts canary traffic immediately, then records the terminal state.
    pub async fn rollback(&self, reason: impl Into<String>) -> ControllerResult<DeploymentSnapshot> {
        let mut inner = self.inner.lock().await;
        let reason = reason.into();
        self.perform_rollback(&mut inner, &reason)?;
        Ok(self.require_snapshot(&inner)?.clone())
    }

    fn require_snapshot<'a>(
        &self,
        inner: &'a ControllerInner,
    ) -> ControllerResult<&'a DeploymentSnapshot> {
        inner
            .snapshot
            .as_ref()
            .ok_or(ControllerError::NoActiveDeployment)
    }

    /// The one path every mutation takes: validate, patch a copy, persist the
    /// snapshot and the transition record, then swap the copy in. A store
    /// failure leaves the in-memory snapshot untouched and suppresses any
    /// event that would have followed.
    fn apply_transition(
        &self,
        inner: &mut ControllerInner,
        to: DeploymentState,
        reason: Option<&str>,
        scores_snapshot_json: Option<String>,
        patch: impl FnOnce(&mut DeploymentSnapshot),
    ) -> ControllerResult<()> {
        let current = inner
            .snapshot
            .as_mut()
            .ok_or(ControllerError::NoActiveDeployment)?;
        let from = current.state;
        if !allowed_transition(from, to) {
            return Err(ControllerError::InvalidTransition { from, to });
        }

        let mut next = current.clone();
        next.state = to;
        if let Some(reason) = reason {
            next.reason = Some(reason.to_string());
        }
        patch(&mut next);

        self.store.save_snapshot(&next)?;
        self.store.append_transition(&TransitionRecord {
            deployment_id: next.id.clone(),
            from_state: from,
            to_state: to,
            reason: reason.map(str::to_string),
            scores_snapshot_json,
            ts: self.clock.now(),
        })?;

        debug!(
            target: "stage_controller",
            deployment_id = %next.id,
            from = %from,
            to = %to,
            stage_index = next.stage_index,
            canary_weight = next.canary_weight,
            "transition applied"
        );
        *current = next.clone();
        *self.current.write().unwrap() = Some(next);
        Ok(())
    }

    fn emit(&self, deployment_id: &str, payload: EventPayload) -> ControllerResult<()> {
        let event = Event {
            deployment_id: deployment_id.to_string(),
            timestamp: self.clock.now(),
            payload,
        };
        self.store.append_event(&event)?;
        self.bus.publish(event);
        Ok(())
    }

    fn stage_decision(
        &self,
        snapshot: &DeploymentSnapshot,
        gates: &[GateResult],
        update: &ScoreUpdate,
    ) -> StageDecision {
        let stage = snapshot.current_stage();
        let now = self.clock.now();
        let (duration_elapsed, time_remaining_ms) = match stage.duration {
            Some(duration) => {
                let deadline = snapshot.stage_entered_at + duration.as_chrono();
                (now >= deadline, (deadline - now).num_milliseconds().max(0))
            }
            None => (true, 0),
        };
        let samples_reached = gates
            .iter()
            .all(|gate| gate.canary_n >= stage.min_samples);
        // A stage without gates is a pure soak: nothing to fail, so the
        // duration and sample requirements alone decide promotion.
        let all_passing = gates.iter().all(|gate| gate.status == GateStatus::Passing);
        let rollback_reason = evaluate_rollback(
            gates,
            update.canary_error_rate(),
            &snapshot.config.rollback,
        );

        let next_action = if rollback_reason.is_some() {
            NextAction::Rollback
        } else if all_passing && duration_elapsed && samples_reached {
            NextAction::AutoPromote
        } else {
            NextAction::Hold
        };
        StageDecision {
            next_action,
            rollback_reason,
            time_remaining_ms,
        }
    }

    /// Moves to the next stage, or to PROMOTED past the last one. Stages with
    /// nothing to observe (no gates, no duration) are passed through in the
    /// same call, so reaching a bare 100% stage completes the deployment.
    async fn advance_stage(
        &self,
        inner: &mut ControllerInner,
        reason: &str,
    ) -> ControllerResult<()> {
        loop {
            let snapshot = self.require_snapshot(inner)?.clone();
            let from_index = snapshot.stage_index;
            let next_index = from_index + 1;
            let scores_json = latest_scores_json(inner);

            if next_index >= snapshot.config.stages.len() {
                if snapshot.state == DeploymentState::Paused {
                    // The table has no PAUSED -> PROMOTED edge; route through
                    // STAGE so the terminal transition stays on the table.
                    self.apply_transition(inner, DeploymentState::Stage, None, None, |_| {})?;
                }
                let now = self.clock.now();
                self.apply_transition(
                    inner,
                    DeploymentState::Promoted,
                    Some(reason),
                    scores_json,
                    |snap| {
                        snap.canary_weight = 100;
                        snap.final_state = Some(FinalState::Promoted);
                        snap.completed_at = Some(now);
                    },
                )?;
                info!(
                    target: "stage_controller",
                    deployment_id = %snapshot.id,
                    reason,
                    "deployment promoted"
                );
                self.emit(
                    &snapshot.id,
                    EventPayload::DeploymentComplete {
                        final_state: FinalState::Promoted,
                    },
                )?;
                return Ok(());
            }

            let now = self.clock.now();
            let weight = snapshot.config.stages[next_index].weight;
            self.apply_transition(
                inner,
                DeploymentState::Stage,
                Some(reason),
                scores_json,
                |snap| {
                    snap.stage_index = next_index;
                    snap.stage_entered_at = now;
                    snap.canary_weight = weight;
                    snap.paused_stage_index = None;
                },
            )?;

            // Reset the monitor before the stage_change event goes out, so
            // every score update observed after it belongs to the new stage.
            if let Some(monitor) = inner.monitor.clone() {
                inner.monitor_epoch = monitor.reset_for_stage(now).await;
            }
            inner.latest_scores = None;
            inner.latest_gates.clear();

            info!(
                target: "stage_controller",
                deployment_id = %snapshot.id,
                from = from_index,
                to = next_index,
                canary_weight = weight,
                reason,
                "stage advanced"
            );
            self.emit(
                &snapshot.id,
                EventPayload::StageChange {
                    from: from_index,
                    to: next_index,
                    canary_weight: weight,
                },
            )?;

            let entered = &self.require_snapshot(inner)?.config.stages[next_index];
            if entered.gates.is_empty() && entered.duration.is_none() {
                continue;
            }
            return Ok(());
        }
    }

    fn perform_rollback(
        &self,
        inner: &mut ControllerInner,
        reason: &str,
    ) -> ControllerResult<()> {
        let snapshot = self.require_snapshot(inner)?.clone();
        if snapshot.state.is_terminal() {
            return Err(ControllerError::InvalidTransition {
                from: snapshot.state,
                to: DeploymentState::RollingBack,
            });
        }
        let scores_json = latest_scores_json(inner);

        if snapshot.state != DeploymentState::RollingBack {
            self.apply_transition(
                inner,
                DeploymentState::RollingBack,
                Some(reason),
                scores_json.clone(),
                |snap| {
                    snap.canary_weight = 0;
                },
            )?;
            warn!(
                target: "stage_controller",
                deployment_id = %snapshot.id,
                reason,
                stage_index = snapshot.stage_index,
                "rollback triggered, canary traffic cut"
            );
            self.emit(
                &snapshot.id,
                EventPayload::RollbackTriggered {
                    reason: reason.to_string(),
                    stage_index: snapshot.stage_index,
                    canary_weight: 0,
                },
            )?;
        }

        let now = self.clock.now();
        self.apply_transition(
            inner,
            DeploymentState::RolledBack,
            Some(reason),
            scores_json,
            |snap| {
                snap.final_state = Some(FinalState::RolledBack);
                snap.completed_at = Some(now);
            },
        )?;
        self.emit(
            &snapshot.id,
            EventPayload::DeploymentComplete {
                final_state: FinalState::RolledBack,
            },
        )?;
        Ok(())
    }
}

fn evaluate_stage_gates(snapshot: &DeploymentSnapshot, update: &ScoreUpdate) -> Vec<GateResult> {
    let stage = snapshot.current_stage();
    stage
        .gates
        .iter()
        .map(|gate| {
            let (baseline, canary) = match update.scorers.get(&gate.scorer) {
                Some(sample) => (sample.baseline.clone(), sample.canary.clone()),
                None => (VersionSample::empty(), VersionSample::empty()),
            };
            evaluate_gate(gate, stage.min_samples, &baseline, &canary)
        })
        .collect()
}

fn score_map(update: &ScoreUpdate) -> BTreeMap<String, ScorerScores> {
    update
        .scorers
        .iter()
        .map(|(scorer, sample)| {
            (
                scorer.clone(),
                ScorerScores {
                    baseline: sample.baseline.summary,
                    canary: sample.canary.summary,
                },
            )
        })
        .collect()
}

fn latest_scores_json(inner: &ControllerInner) -> Option<String> {
    inner
        .latest_scores
        .as_ref()
        .and_then(|update| serde_json::to_string(&score_map(update)).ok())
}
