use braincanary_core::{
    DeploymentConfig, DeploymentSnapshot, DeploymentState, DeploymentStore, DurationSpec, Event,
    EventPayload, FinalState, Gate, GateComparison, MonitorSection, QuerySection, RollbackPolicy,
    SampleSummary, ScoreSnapshotRow, SqliteDeploymentStore, Stage, TransitionRecord, VariantSpec,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn config() -> DeploymentConfig {
    DeploymentConfig {
        name: "summarizer-rollout".into(),
        project: "support".into(),
        baseline: VariantSpec {
            model: "small-model".into(),
            prompt: None,
            system_prompt: None,
        },
        canary: VariantSpec {
            model: "large-model".into(),
            prompt: Some("Summarize the ticket.".into()),
            system_prompt: Some("Be factual.".into()),
        },
        stages: vec![
            Stage {
                weight: 10,
                duration: Some(DurationSpec::from_millis(1_800_000)),
                min_samples: 50,
                gates: vec![Gate {
                    scorer: "Factuality".into(),
                    threshold: 0.7,
                    comparison: GateComparison::NotWorseThanBaseline,
                    confidence: 0.95,
                }],
            },
            Stage {
                weight: 100,
                duration: None,
                min_samples: 1,
                gates: Vec::new(),
            },
        ],
        rollback: RollbackPolicy {
            on_score_drop: 0.05,
            on_error_rate: 0.1,
            cooldown: DurationSpec::from_millis(3_600_000),
        },
        monitor: MonitorSection {
            poll_interval: DurationSpec::from_millis(30_000),
            sticky_key: Some("user_id".into()),
            scorer_lag_grace: DurationSpec::from_millis(120_000),
            query: QuerySection {
                api_url: "https://api.example.test".into(),
                path: "/btql".into(),
                api_key: "sk-test".into(),
                timeout_ms: 10_000,
                max_retries: 5,
            },
        },
    }
}

fn snapshot(id: &str, state: DeploymentState, started_at: DateTime<Utc>) -> DeploymentSnapshot {
    DeploymentSnapshot {
        id: id.to_string(),
        name: "summarizer-rollout".into(),
        config: config(),
        state,
        stage_index: 0,
        stage_entered_at: started_at,
        started_at,
        completed_at: None,
        final_state: None,
        paused_stage_index: None,
        canary_weight: 10,
        reason: None,
    }
}

fn temp_store(dir: &TempDir) -> SqliteDeploymentStore {
    let store = SqliteDeploymentStore::builder()
        .path(dir.path().join("deployments.sqlite"))
        .create_if_missing(true)
        .build()
        .expect("create store");
    store.initialize().expect("initialize store");
    store
}

#[test]
fn snapshot_round_trips_exactly() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(&dir);

    let mut original = snapshot("dep-rt", DeploymentState::Stage, t0());
    original.paused_stage_index = Some(0);
    original.reason = Some("manual_promote".into());
    store.save_snapshot(&original).unwrap();

    let loaded = store.load_snapshot("dep-rt").unwrap().expect("row exists");
    assert_eq!(loaded, original);

    assert!(store.load_snapshot("dep-missing").unwrap().is_none());
}

#[test]
fn save_is_an_upsert() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(&dir);

    let mut snap = snapshot("dep-up", DeploymentState::Stage, t0());
    store.save_snapshot(&snap).unwrap();

    snap.state = DeploymentState::Promoted;
    snap.stage_index = 1;
    snap.canary_weight = 100;
    snap.final_state = Some(FinalState::Promoted);
    snap.completed_at = Some(t0() + Duration::hours(1));
    store.save_snapshot(&snap).unwrap();

    let loaded = store.load_snapshot("dep-up").unwrap().unwrap();
    assert_eq!(loaded, snap);
    assert_eq!(store.history(10).unwrap().len(), 1);
}

#[test]
fn active_deployment_skips_terminal_rows() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(&dir);

    let mut done = snapshot("dep-a", DeploymentState::Promoted, t0());
    done.final_state = Some(FinalState::Promoted);
    store.save_snapshot(&done).unwrap();

    let live = snapshot("dep-b", DeploymentState::Stage, t0() + Duration::hours(1));
    store.save_snapshot(&live).unwrap();

    let mut rolled = snapshot(
        "dep-c",
        DeploymentState::RolledBack,
        t0() + Duration::hours(2),
    );
    rolled.final_state = Some(FinalState::RolledBack);
    store.save_snapshot(&rolled).unwrap();

    let active = store.active_deployment().unwrap().expect("dep-b is live");
    assert_eq!(active.id, "dep-b");

    // Once everything is terminal there is nothing to recover.
    let mut finished = live;
    finished.state = DeploymentState::RolledBack;
    finished.final_state = Some(FinalState::RolledBack);
    store.save_snapshot(&finished).unwrap();
    assert!(store.active_deployment().unwrap().is_none());
}

#[test]
fn history_is_recency_ordered_and_limited() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(&dir);

    for (index, offset_hours) in [0i64, 2, 1].into_iter().enumerate() {
        let snap = snapshot(
            &format!("dep-{index}"),
            DeploymentState::Stage,
            t0() + Duration::hours(offset_hours),
        );
        store.save_snapshot(&snap).unwrap();
    }

    let history = store.history(2).unwrap();
    let ids: Vec<&str> = history.iter().map(|snap| snap.id.as_str()).collect();
    assert_eq!(ids, vec!["dep-1", "dep-2"]);
}

#[test]
fn transitions_append_and_read_back_in_order() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(&dir);
    store
        .save_snapshot(&snapshot("dep-t", DeploymentState::Stage, t0()))
        .unwrap();

    let records = [
        TransitionRecord {
            deployment_id: "dep-t".into(),
            from_state: DeploymentState::Idle,
            to_state: DeploymentState::Pending,
            reason: Some("deployment_started".into()),
            scores_snapshot_json: None,
            ts: t0(),
        },
        TransitionRecord {
            deployment_id: "dep-t".into(),
            from_state: DeploymentState::Pending,
            to_state: DeploymentState::Stage,
            reason: None,
            scores_snapshot_json: None,
            ts: t0() + Duration::seconds(1),
        },
        TransitionRecord {
            deployment_id: "dep-t".into(),
            from_state: DeploymentState::Stage,
            to_state: DeploymentState::RollingBack,
            reason: Some("score_regression:Factuality".into()),
            scores_snapshot_json: Some(r#"{"Factuality":{"baseline":{"mean":0.9}}}"#.into()),
            ts: t0() + Duration::seconds(2),
        },
    ];
    for record in &records {
        store.append_transition(record).unwrap();
    }

    let loaded = store.transitions("dep-t").unwrap();
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded, records.to_vec());
    assert!(store.transitions("dep-other").unwrap().is_empty());
}

#[test]
fn score_rows_and_events_are_append_only() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(&dir);
    store
        .save_snapshot(&snapshot("dep-s", DeploymentState::Stage, t0()))
        .unwrap();

    let rows = vec![
        ScoreSnapshotRow {
            deployment_id: "dep-s".into(),
            stage_index: 0,
            scorer: "Factuality".into(),
            baseline: SampleSummary {
                mean: 0.9,
                std: 0.01,
                n: 120,
            },
            canary: SampleSummary {
                mean: 0.89,
                std: 0.02,
                n: 40,
            },
            ts: t0(),
        },
        ScoreSnapshotRow {
            deployment_id: "dep-s".into(),
            stage_index: 0,
            scorer: "Tone".into(),
            baseline: SampleSummary {
                mean: 0.8,
                std: 0.05,
                n: 120,
            },
            canary: SampleSummary {
                mean: 0.82,
                std: 0.04,
                n: 40,
            },
            ts: t0(),
        },
    ];
    store.append_score_rows(&rows).unwrap();

    for (index, payload) in [
        EventPayload::DeploymentStarted {
            name: "summarizer-rollout".into(),
            stage_index: 0,
            canary_weight: 10,
        },
        EventPayload::Paused { stage_index: 0 },
        EventPayload::Resumed { stage_index: 0 },
    ]
    .into_iter()
    .enumerate()
    {
        store
            .append_event(&Event {
                deployment_id: "dep-s".into(),
                timestamp: t0() + Duration::seconds(index as i64),
                payload,
            })
            .unwrap();
    }

    let events = store.recent_events("dep-s", 2).unwrap();
    assert_eq!(events.len(), 2);
    // Most recent first.
    assert_eq!(events[0].event_type, "resumed");
    assert_eq!(events[1].event_type, "paused");
    assert_eq!(events[1].payload["type"], "paused");
    assert_eq!(events[1].payload["data"]["stage_index"], 0);

    let all = store.recent_events("dep-s", 10).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[2].event_type, "deployment_started");
}
