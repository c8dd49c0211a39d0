//! Plan documents and typed task configuration.
//!
//! A plan is read once, validated, and then treated as immutable for the
//! lifetime of the run. The loosely typed `config` object of every task is
//! converted into a [`TaskConfig`] variant selected by the declared `type`.

use crate::core::task::{TaskId, TaskType};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// A task exactly as declared in the plan document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub config: Value,
}

impl TaskSpec {
    /// Parse `config` into the variant matching `task_type`.
    pub fn typed_config(&self) -> Result<TaskConfig> {
        let raw = match &self.config {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        let invalid = |e: serde_json::Error| {
            Error::Validation(format!(
                "task {}: invalid {} config: {}",
                self.task_id, self.task_type, e
            ))
        };
        let config = match self.task_type {
            TaskType::Analyze => TaskConfig::Analyze(serde_json::from_value(raw).map_err(invalid)?),
            TaskType::Extract => TaskConfig::Extract(serde_json::from_value(raw).map_err(invalid)?),
            TaskType::QualityGate => {
                TaskConfig::QualityGate(serde_json::from_value(raw).map_err(invalid)?)
            }
            TaskType::Divergence => {
                TaskConfig::Divergence(serde_json::from_value(raw).map_err(invalid)?)
            }
            TaskType::Arbitrate => {
                TaskConfig::Arbitrate(serde_json::from_value(raw).map_err(invalid)?)
            }
            TaskType::Calculate => {
                TaskConfig::Calculate(serde_json::from_value(raw).map_err(invalid)?)
            }
            TaskType::Synthesize => TaskConfig::Synthesize,
        };
        Ok(config)
    }
}

/// Typed per-task configuration, one variant per [`TaskType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TaskConfig {
    Analyze(AnalyzeConfig),
    Extract(ExtractConfig),
    QualityGate(QualityGateConfig),
    Divergence(DivergenceTaskConfig),
    Arbitrate(ArbitrateConfig),
    Calculate(CalculateConfig),
    Synthesize,
}

impl TaskConfig {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskConfig::Analyze(_) => TaskType::Analyze,
            TaskConfig::Extract(_) => TaskType::Extract,
            TaskConfig::QualityGate(_) => TaskType::QualityGate,
            TaskConfig::Divergence(_) => TaskType::Divergence,
            TaskConfig::Arbitrate(_) => TaskType::Arbitrate,
            TaskConfig::Calculate(_) => TaskType::Calculate,
            TaskConfig::Synthesize => TaskType::Synthesize,
        }
    }
}

/// One external analysis call: a single agent over a single input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeConfig {
    pub input_id: String,
    pub agent_id: String,
    pub input_text: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractConfig {
    #[serde(default)]
    pub max_repair_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityGateConfig {
    #[serde(default)]
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DivergenceTaskConfig {
    #[serde(default)]
    pub default_tolerance: Option<f64>,
    #[serde(default)]
    pub tolerances: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArbitrateConfig {
    #[serde(default)]
    pub max_rounds: Option<u32>,
    #[serde(default)]
    pub margin: Option<f64>,
    #[serde(default)]
    pub min_score: Option<f64>,
    /// Reference values per dimension used for calibration alignment.
    #[serde(default)]
    pub calibration: BTreeMap<String, f64>,
    /// Valid `[min, max]` range per dimension; `[0, 1]` when absent.
    #[serde(default)]
    pub bounds: BTreeMap<String, [f64; 2]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalculateConfig {
    #[serde(default)]
    pub formulas: Vec<Formula>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    pub expression: String,
}

/// Separators used when ids are joined into case ids and checkpoint keys.
pub const RESERVED_ID_CHARS: [char; 2] = [':', '/'];

fn check_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", kind)));
    }
    if id.contains(RESERVED_ID_CHARS) {
        return Err(Error::Validation(format!(
            "{} '{}' must not contain ':' or '/'",
            kind, id
        )));
    }
    Ok(())
}

/// A validated plan document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub run_id: String,
    pub tasks: Vec<TaskSpec>,
}

impl Plan {
    pub fn from_json(text: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(text)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let plan: Self = toml::from_str(text)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Load a plan, choosing TOML for `.toml` files and JSON otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&text),
            _ => Self::from_json(&text),
        }
    }

    /// Structural checks: ids, dependencies and typed configs.
    ///
    /// Cycles are rejected when the DAG is built.
    pub fn validate(&self) -> Result<()> {
        if self.run_id.trim().is_empty() {
            return Err(Error::Validation("plan run_id must not be empty".into()));
        }
        if self.tasks.is_empty() {
            return Err(Error::Validation("plan declares no tasks".into()));
        }

        let mut seen = HashSet::new();
        for spec in &self.tasks {
            check_id("task_id", spec.task_id.as_str())?;
            if !seen.insert(&spec.task_id) {
                return Err(Error::Validation(format!("duplicate task_id {}", spec.task_id)));
            }
        }

        for spec in &self.tasks {
            for dep in &spec.depends_on {
                if !seen.contains(dep) {
                    return Err(Error::Validation(format!(
                        "task {} depends on unknown task {}",
                        spec.task_id, dep
                    )));
                }
            }
            if let TaskConfig::Analyze(config) = spec.typed_config()? {
                check_id("input_id", &config.input_id)?;
                check_id("agent_id", &config.agent_id)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| &t.task_id == id)
    }

    /// Stable digest of the plan, recorded in the chronolog at run start.
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }
}
