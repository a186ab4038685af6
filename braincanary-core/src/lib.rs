pub mod clock;
pub mod config;
pub mod controller;
pub mod events;
pub mod gates;
pub mod monitor;
pub mod query;
pub mod router;
pub mod runtime;
pub mod sqlite;
pub mod stats;
pub mod store;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    load_deployment_config, parse_duration, ConfigError, ConfigResult, DeploymentConfig,
    DurationSpec, Gate, GateComparison, MonitorSection, QuerySection, RollbackPolicy, Stage,
    VariantSpec,
};
pub use controller::{
    evaluate_rollback, ControllerError, ControllerResult, DeploymentSnapshot, DeploymentState,
    FinalState, StageController,
};
pub use events::{Event, EventBus, EventPayload, NextAction, ScorerScores};
pub use gates::{evaluate_gate, GateResult, GateStatus, VersionSample, MIN_BASELINE_SAMPLES};
pub use monitor::{
    MonitorError, MonitorParams, MonitorResult, MonitorSignal, ScoreMonitor, ScoreUpdate,
    ScorerSample, VERSION_BASELINE, VERSION_CANARY,
};
pub use query::{
    HttpQueryClient, QueryClient, QueryError, QueryHealth, QueryHealthStatus, QueryResult,
    TraceRow,
};
pub use router::{route, stable_hash, RouteDecision, Variant};
pub use runtime::{DeploymentRuntime, RuntimeError, RuntimeResult};
pub use stats::{
    student_t_cdf, student_t_quantile, welch_t_test, RunningStats, SampleSummary, StatsError,
    StatsResult, WelchTTest, RESERVOIR_CAPACITY,
};
pub use store::{
    DeploymentStore, ScoreSnapshotRow, SqliteDeploymentStore, SqliteDeploymentStoreBuilder,
    StoreError, StoreResult, StoredEvent, TransitionRecord,
};
