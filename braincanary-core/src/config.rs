use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: &'static str },
    #[error("invalid deployment config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Duration literal in the `<integer><ms|s|m|h>` grammar, e.g. `30s` or `1h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationSpec(Duration);

impl DurationSpec {
    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub fn as_std(&self) -> Duration {
        self.0
    }

    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.0.as_millis() as i64)
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis() as u64;
        if millis % 3_600_000 == 0 {
            write!(f, "{}h", millis / 3_600_000)
        } else if millis % 60_000 == 0 {
            write!(f, "{}m", millis / 60_000)
        } else if millis % 1_000 == 0 {
            write!(f, "{}s", millis / 1_000)
        } else {
            write!(f, "{millis}ms")
        }
    }
}

impl Serialize for DurationSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DurationSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw)
            .map(DurationSpec)
            .map_err(D::Error::custom)
    }
}

pub fn parse_duration(value: &str) -> ConfigResult<Duration> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::InvalidDuration {
            value: value.to_string(),
            reason: "missing unit suffix",
        })?;
    let (digits, unit) = trimmed.split_at(split);
    let magnitude: u64 = digits.parse().map_err(|_| ConfigError::InvalidDuration {
        value: value.to_string(),
        reason: "missing magnitude",
    })?;
    if magnitude == 0 {
        return Err(ConfigError::InvalidDuration {
            value: value.to_string(),
            reason: "must be positive",
        });
    }
    let millis = match unit {
        "ms" => magnitude,
        "s" => magnitude * 1_000,
        "m" => magnitude * 60_000,
        "h" => magnitude * 3_600_000,
        _ => {
            return Err(ConfigError::InvalidDuration {
                value: value.to_string(),
                reason: "unit must be one of ms, s, m, h",
            })
        }
    };
    Ok(Duration::from_millis(millis))
}

/// One prompt/model bundle under evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub model: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Quality assertion on a named scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub scorer: String,
    pub threshold: f64,
    pub comparison: GateComparison,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateComparison {
    NotWorseThanBaseline,
    BetterThanBaseline,
    AbsoluteOnly,
}

/// One step of the rollout: a target canary traffic share plus the criteria
/// that must hold before traffic moves on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub weight: u32,
    #[serde(default)]
    pub duration: Option<DurationSpec>,
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
    #[serde(default)]
    pub gates: Vec<Gate>,
}

fn default_min_samples() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPolicy {
    pub on_score_drop: f64,
    pub on_error_rate: f64,
    #[serde(default = "default_cooldown")]
    pub cooldown: DurationSpec,
}

fn default_cooldown() -> DurationSpec {
    DurationSpec::from_millis(10 * 60_000)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSection {
    pub poll_interval: DurationSpec,
    #[serde(default)]
    pub sticky_key: Option<String>,
    pub scorer_lag_grace: DurationSpec,
    pub query: QuerySection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySection {
    pub api_url: String,
    #[serde(default = "default_query_path")]
    pub path: String,
    pub api_key: String,
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_query_max_retries")]
    pub max_retries: u32,
}

fn default_query_path() -> String {
    "/btql".to_string()
}

fn default_query_timeout_ms() -> u64 {
    10_000
}

fn default_query_max_retries() -> u32 {
    5
}

/// Immutable description of one rollout: the two variants, the stage ladder,
/// the rollback tripwires, and the monitor wiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub name: String,
    pub project: String,
    pub baseline: VariantSpec,
    pub canary: VariantSpec,
    pub stages: Vec<Stage>,
    pub rollback: RollbackPolicy,
    pub monitor: MonitorSection,
}

impl DeploymentConfig {
    /// Construction-time validation. A config that passes here is safe to
    /// hand to the controller.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("deployment name is empty".into()));
        }
        if self.project.trim().is_empty() {
            return Err(ConfigError::Invalid("project is empty".into()));
        }
        if self.stages.is_empty() {
            return Err(ConfigError::Invalid("at least one stage is required".into()));
        }

        let mut previous_weight = 0u32;
        for (index, stage) in self.stages.iter().enumerate() {
            if !(1..=100).contains(&stage.weight) {
                return Err(ConfigError::Invalid(format!(
                    "stage {index} weight {} outside 1..=100",
                    stage.weight
                )));
            }
            if stage.weight <= previous_weight {
                return Err(ConfigError::Invalid(format!(
                    "stage {index} weight {} does not increase over {}",
                    stage.weight, previous_weight
                )));
            }
            previous_weight = stage.weight;
            if stage.min_samples < 1 {
                return Err(ConfigError::Invalid(format!(
                    "stage {index} min_samples must be at least 1"
                )));
            }
            for gate in &stage.gates {
                if gate.scorer.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "stage {index} has a gate with an empty scorer name"
                    )));
                }
                if !(0.0..=1.0).contains(&gate.threshold) {
                    return Err(ConfigError::Invalid(format!(
                        "gate {:?} threshold {} outside [0, 1]",
                        gate.scorer, gate.threshold
                    )));
                }
                if !(0.5..=0.999).contains(&gate.confidence) {
                    return Err(ConfigError::Invalid(format!(
                        "gate {:?} confidence {} outside [0.5, 0.999]",
                        gate.scorer, gate.confidence
                    )));
                }
            }
        }

        if self.stages.last().map(|stage| stage.weight) != Some(100) {
            return Err(ConfigError::Invalid(
                "final stage weight must be 100".into(),
            ));
        }
        let gated = self.stages[..self.stages.len() - 1]
            .iter()
            .any(|stage| !stage.gates.is_empty());
        if !gated {
            return Err(ConfigError::Invalid(
                "at least one non-final stage must define a gate".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.rollback.on_score_drop) {
            return Err(ConfigError::Invalid(format!(
                "rollback.on_score_drop {} outside [0, 1]",
                self.rollback.on_score_drop
            )));
        }
        if !(0.0..=1.0).contains(&self.rollback.on_error_rate) {
            return Err(ConfigError::Invalid(format!(
                "rollback.on_error_rate {} outside [0, 1]",
                self.rollback.on_error_rate
            )));
        }
        Ok(())
    }

    /// Unique scorer names across every stage, in first-seen order.
    pub fn scorer_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for stage in &self.stages {
            for gate in &stage.gates {
                if !names.contains(&gate.scorer) {
                    names.push(gate.scorer.clone());
                }
            }
        }
        names
    }
}

pub fn load_deployment_config<P: AsRef<Path>>(path: P) -> ConfigResult<DeploymentConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let config: DeploymentConfig =
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            source,
            path: path.to_path_buf(),
        })?;
    config.validate()?;
    Ok(config)
}
