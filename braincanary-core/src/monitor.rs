use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::gates::VersionSample;
use crate::query::{QueryClient, QueryError, QueryHealth, TraceRow};
use crate::stats::RunningStats;

pub const VERSION_BASELINE: &str = "baseline";
pub const VERSION_CANARY: &str = "canary";

pub type MonitorResult<T> = std::result::Result<T, MonitorError>;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("query failed: {0}")]
    Query(#[from] QueryError),
}

#[derive(Debug, Clone)]
pub struct MonitorParams {
    pub deployment_id: String,
    pub project: String,
    pub poll_interval: StdDuration,
    pub stage_started_at: DateTime<Utc>,
    pub scorers: Vec<String>,
    /// Slack subtracted from the watermark when querying, to absorb scoring
    /// latency. Rows re-delivered inside the grace window are dropped by id.
    pub scorer_lag_grace: Duration,
}

/// Per-scorer sample pair carried from the monitor to the controller. Raw
/// samples are shared slices of the reservoir snapshot, so gate evaluation
/// runs on real observations rather than moments.
#[derive(Debug, Clone)]
pub struct ScorerSample {
    pub baseline: VersionSample,
    pub canary: VersionSample,
}

/// One poll cycle's aggregate, tagged with the stage epoch that produced it
/// so snapshots from a superseded stage can be discarded downstream.
#[derive(Debug, Clone)]
pub struct ScoreUpdate {
    pub epoch: u64,
    pub scorers: BTreeMap<String, ScorerSample>,
    pub canary_total: u64,
    pub canary_errors: u64,
}

impl ScoreUpdate {
    pub fn canary_error_rate(&self) -> f64 {
        if self.canary_total == 0 {
            0.0
        } else {
            self.canary_errors as f64 / self.canary_total as f64
        }
    }
}

#[derive(Debug)]
pub enum MonitorSignal {
    Scores(ScoreUpdate),
    Health(QueryHealth),
}

struct VersionIngest {
    watermark: DateTime<Utc>,
    seen: HashSet<String>,
    stats: BTreeMap<String, RunningStats>,
}

impl VersionIngest {
    fn new(start: DateTime<Utc>, scorers: &[String]) -> Self {
        Self {
            watermark: start,
            seen: HashSet::new(),
            stats: scorers
                .iter()
                .map(|name| (name.clone(), RunningStats::new()))
                .collect(),
        }
    }

    fn reset(&mut self, start: DateTime<Utc>) {
        self.watermark = start;
        self.seen.clear();
        for stats in self.stats.values_mut() {
            stats.reset();
        }
    }

    /// Folds rows into the running stats, advancing the watermark to the
    /// maximum `created` observed. Returns only rows not seen before.
    fn ingest(&mut self, rows: Vec<TraceRow>) -> Vec<TraceRow> {
        let mut fresh = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(id) = &row.id {
                if !self.seen.insert(id.clone()) {
                    continue;
                }
            }
            if row.created > self.watermark {
                self.watermark = row.created;
            }
            for (scorer, stats) in &mut self.stats {
                if let Some(Some(value)) = row.scores.get(scorer) {
                    if value.is_finite() {
                        stats.add(*value);
                    }
                }
            }
            fresh.push(row);
        }
        fresh
    }

    fn sample(&self, scorer: &str) -> VersionSample {
        match self.stats.get(scorer) {
            Some(stats) => VersionSample {
                summary: stats.summary(),
                samples: Arc::from(stats.samples().to_vec()),
            },
            None => VersionSample::empty(),
        }
    }
}

struct MonitorState {
    epoch: u64,
    baseline: VersionIngest,
    canary: VersionIngest,
    canary_total: u64,
    canary_errors: u64,
}

impl MonitorState {
    fn new(params: &MonitorParams) -> Self {
        Self {
            epoch: 0,
            baseline: VersionIngest::new(params.stage_started_at, &params.scorers),
            canary: VersionIngest::new(params.stage_started_at, &params.scorers),
            canary_total: 0,
            canary_errors: 0,
        }
    }

    fn reset_for_stage(&mut self, start: DateTime<Utc>) -> u64 {
        self.epoch += 1;
        self.baseline.reset(start);
        self.canary.reset(start);
        self.canary_total = 0;
        self.canary_errors = 0;
        self.epoch
    }

    fn build_update(&self, scorers: &[String]) -> ScoreUpdate {
        let scorers = scorers
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    ScorerSample {
                        baseline: self.baseline.sample(name),
                        canary: self.canary.sample(name),
                    },
                )
            })
            .collect();
        ScoreUpdate {
            epoch: self.epoch,
            scorers,
            canary_total: self.canary_total,
            canary_errors: self.canary_errors,
        }
    }
}

/// Watermark-driven polling aggregator for one deployment.
///
/// A single background task ticks every `poll_interval` (first tick fires
/// immediately); ticks run strictly one at a time and late ticks are skipped
/// rather than queued. Each tick pulls newly scored baseline and canary
/// traces, folds them into per-scorer running stats, and pushes a
/// [`ScoreUpdate`] plus a health report down the signal channel. A failed
/// tick advances nothing and reports degraded health instead.
pub struct ScoreMonitor {
    params: MonitorParams,
    state: Arc<Mutex<MonitorState>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScoreMonitor {
    pub fn spawn(
        params: MonitorParams,
        query: Arc<dyn QueryClient>,
    ) -> (Arc<Self>, mpsc::Receiver<MonitorSignal>) {
        let (signals, receiver) = mpsc::channel(64);
        let state = Arc::new(Mutex::new(MonitorState::new(&params)));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            params.clone(),
            query,
            state.clone(),
            signals,
            shutdown_rx,
        ));
        info!(
            target: "score_monitor",
            deployment_id = %params.deployment_id,
            poll_interval_ms = params.poll_interval.as_millis() as u64,
            "score monitor started"
        );
        let monitor = Arc::new(Self {
            params,
            state,
            shutdown,
            task: Mutex::new(Some(task)),
        });
        (monitor, receiver)
    }

    /// Rebases both watermarks on the new stage start and clears all counters
    /// and running stats. Returns the new epoch; snapshots tagged with an
    /// older epoch are stale.
    pub async fn reset_for_stage(&self, stage_started_at: DateTime<Utc>) -> u64 {
        let mut state = self.state.lock().await;
        let epoch = state.reset_for_stage(stage_started_at);
        debug!(
            target: "score_monitor",
            deployment_id = %self.params.deployment_id,
            epoch,
            "monitor reset for new stage"
        );
        epoch
    }

    /// Stops the poll loop and joins the background task, waiting out any
    /// tick already in flight.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn run_loop(
    params: MonitorParams,
    query: Arc<dyn QueryClient>,
    state: Arc<Mutex<MonitorState>>,
    signals: mpsc::Sender<MonitorSignal>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(params.poll_interval);
    // Ticks are strictly sequential; a tick that overruns the interval causes
    // later ticks to be skipped, never stacked.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match run_tick(&params, query.as_ref(), &state).await {
                    Ok(update) => {
                        if signals.send(MonitorSignal::Scores(update)).await.is_err() {
                            break;
                        }
                        if signals.send(MonitorSignal::Health(query.health())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(
                            target: "score_monitor",
                            deployment_id = %params.deployment_id,
                            error = %err,
                            "poll tick failed; watermarks unchanged"
                        );
                        if signals.send(MonitorSignal::Health(query.health())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!(target: "score_monitor", deployment_id = %params.deployment_id, "poll loop stopped");
}

async fn run_tick(
    params: &MonitorParams,
    query: &dyn QueryClient,
    state: &Mutex<MonitorState>,
) -> MonitorResult<ScoreUpdate> {
    let mut state = state.lock().await;

    // Fetch both versions before touching any state, so a failed tick leaves
    // watermarks and stats exactly as they were.
    let baseline_since = state.baseline.watermark - params.scorer_lag_grace;
    let baseline_sql = build_query(
        &params.project,
        &params.deployment_id,
        VERSION_BASELINE,
        baseline_since,
    );
    let baseline_rows = query.query(&baseline_sql).await?;

    let canary_since = state.canary.watermark - params.scorer_lag_grace;
    let canary_sql = build_query(
        &params.project,
        &params.deployment_id,
        VERSION_CANARY,
        canary_since,
    );
    let canary_rows = query.query(&canary_sql).await?;

    let state = &mut *state;
    state.baseline.ingest(baseline_rows);
    let fresh_canary = state.canary.ingest(canary_rows);
    for row in &fresh_canary {
        state.canary_total += 1;
        if row.error.is_some() {
            state.canary_errors += 1;
        }
    }

    Ok(state.build_update(&params.scorers))
}

fn sql_literal(value: &str) -> String {
    value.replace('\'', "''")
}

pub(crate) fn build_query(
    project: &str,
    deployment_id: &str,
    version: &str,
    since: DateTime<Utc>,
) -> String {
    format!(
        "SELECT id, scores, metadata, created, error \
         FROM project_logs('{}', shape => 'traces') \
         WHERE metadata.\"braincanary.deployment_id\" = '{}' \
           AND metadata.\"braincanary.version\" = '{}' \
           AND created > '{}' \
         ORDER BY created ASC",
        sql_literal(project),
        sql_literal(deployment_id),
        sql_literal(version),
        since.to_rfc3339_opts(SecondsFormat::Micros, true),
    )
}
