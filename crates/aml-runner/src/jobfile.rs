//! Job files: YAML description of one workspace → compute → dataset →
//! experiment submission.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::compute::{ComputeSpec, ComputeTarget};
use crate::config::{AutoMlConfig, AutoMlConfigBuilder, Featurization, PrimaryMetric, Task};
use crate::dataset::TabularDataset;
use crate::error::{Error, Result};
use crate::wait::WaitOptions;
use crate::workspace::{WorkspaceConfig, DEFAULT_TOKEN_ENV};

pub const JOB_FILE_VERSION: &str = "0.1";
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 10;

pub const JOB_FILE_TEMPLATE: &str = "\
version: '0.1'
workspace:
  endpoint: ''                        # REQUIRED: platform management endpoint
  subscription_id: ''                 # REQUIRED unless config_path is set
  resource_group: ''                  # REQUIRED unless config_path is set
  workspace_name: ''                  # REQUIRED unless config_path is set
  # config_path: config.json          # downloaded workspace config file
  token_env: AML_TOKEN
compute:
  name: cpu-cluster
  vm_size: STANDARD_D2_V2
  min_nodes: 0
  max_nodes: 4
dataset:
  name: ''                            # REQUIRED: registered tabular dataset
  drop_columns: []
experiment:
  name: ''                            # REQUIRED
job:
  task: classification                # classification | regression | forecasting
  primary_metric: accuracy
  label_column_name: ''               # REQUIRED
  n_cross_validations: 5
  experiment_timeout_hours: 0.25
  max_concurrent_iterations: 4
  iteration_timeout_minutes: 5
wait:
  provisioning_timeout_minutes: 20
  run_timeout_minutes: 120
  poll_interval_seconds: 10
";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceSection {
    pub endpoint: String,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub resource_group: Option<String>,
    #[serde(default)]
    pub workspace_name: Option<String>,
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetSection {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub drop_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentSection {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSection {
    pub task: Task,
    pub primary_metric: PrimaryMetric,
    pub label_column_name: String,
    #[serde(default)]
    pub n_cross_validations: Option<u32>,
    #[serde(default)]
    pub experiment_timeout_hours: Option<f64>,
    #[serde(default)]
    pub max_concurrent_iterations: Option<u32>,
    #[serde(default)]
    pub iteration_timeout_minutes: Option<u32>,
    #[serde(default)]
    pub time_column_name: Option<String>,
    #[serde(default)]
    pub forecast_horizon: Option<u32>,
    #[serde(default)]
    pub enable_early_stopping: Option<bool>,
    #[serde(default)]
    pub featurization: Option<Featurization>,
    #[serde(default)]
    pub blocked_models: Vec<String>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub experiment_exit_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitSection {
    pub provisioning_timeout_minutes: u64,
    pub run_timeout_minutes: u64,
    #[serde(default)]
    pub poll_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobFile {
    pub version: String,
    pub workspace: WorkspaceSection,
    pub compute: ComputeSpec,
    pub dataset: DatasetSection,
    pub experiment: ExperimentSection,
    pub job: JobSection,
    pub wait: WaitSection,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl JobFile {
    /// Workspace identity, either inline or from `config_path` (relative
    /// paths resolve against the job file's directory).
    pub fn workspace_config(&self) -> Result<WorkspaceConfig> {
        let ws = &self.workspace;
        if let Some(rel) = ws.config_path.as_deref().filter(|p| !p.is_empty()) {
            let path = if Path::new(rel).is_absolute() {
                PathBuf::from(rel)
            } else {
                self.base_dir.join(rel)
            };
            return WorkspaceConfig::from_file(&path, &ws.endpoint, &ws.token_env);
        }
        let config = WorkspaceConfig {
            endpoint: ws.endpoint.clone(),
            subscription_id: ws.subscription_id.clone().unwrap_or_default(),
            resource_group: ws.resource_group.clone().unwrap_or_default(),
            workspace_name: ws.workspace_name.clone().unwrap_or_default(),
            token_env: ws.token_env.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    fn poll_interval(&self) -> Result<Duration> {
        match self.wait.poll_interval_seconds {
            Some(0) => Err(Error::invalid_config(
                "wait.poll_interval_seconds must be at least 1",
            )),
            Some(seconds) => Ok(Duration::from_secs(seconds)),
            None => Ok(Duration::from_secs(DEFAULT_POLL_INTERVAL_SECONDS)),
        }
    }

    pub fn provisioning_wait(&self) -> Result<WaitOptions> {
        Ok(WaitOptions::new(
            minutes("wait.provisioning_timeout_minutes", self.wait.provisioning_timeout_minutes)?,
            self.poll_interval()?,
        ))
    }

    pub fn run_wait(&self) -> Result<WaitOptions> {
        Ok(WaitOptions::new(
            minutes("wait.run_timeout_minutes", self.wait.run_timeout_minutes)?,
            self.poll_interval()?,
        ))
    }

    /// Builder carrying every job setting from the file; nothing is added.
    pub fn config_builder(
        &self,
        training_data: TabularDataset,
        compute: &ComputeTarget,
    ) -> AutoMlConfigBuilder {
        let job = &self.job;
        let mut builder = AutoMlConfig::builder()
            .task(job.task)
            .primary_metric(job.primary_metric)
            .training_data(training_data)
            .label_column_name(job.label_column_name.clone())
            .compute_target(compute)
            .blocked_models(job.blocked_models.clone())
            .allowed_models(job.allowed_models.clone());
        if let Some(folds) = job.n_cross_validations {
            builder = builder.n_cross_validations(folds);
        }
        if let Some(hours) = job.experiment_timeout_hours {
            builder = builder.experiment_timeout_hours(hours);
        }
        if let Some(limit) = job.max_concurrent_iterations {
            builder = builder.max_concurrent_iterations(limit);
        }
        if let Some(minutes) = job.iteration_timeout_minutes {
            builder = builder.iteration_timeout_minutes(minutes);
        }
        if let Some(column) = &job.time_column_name {
            builder = builder.time_column_name(column.clone());
        }
        if let Some(horizon) = job.forecast_horizon {
            builder = builder.forecast_horizon(horizon);
        }
        if let Some(enabled) = job.enable_early_stopping {
            builder = builder.enable_early_stopping(enabled);
        }
        if let Some(mode) = job.featurization {
            builder = builder.featurization(mode);
        }
        if let Some(score) = job.experiment_exit_score {
            builder = builder.experiment_exit_score(score);
        }
        builder
    }
}

fn minutes(field: &str, value: u64) -> Result<Duration> {
    value
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::invalid_config(format!("{} is too large: {}", field, value)))
}

/// Reads a job file, applies `--set` overrides, checks required fields and
/// returns the typed result.
pub fn load_job_file(path: &Path, overrides: &BTreeMap<String, Value>) -> Result<JobFile> {
    let raw = fs::read_to_string(path)?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw)?;
    let mut json_value: Value = serde_json::to_value(yaml_value)?;
    for (key, value) in overrides {
        let pointer = format!("/{}", key.split('.').collect::<Vec<_>>().join("/"));
        set_json_pointer_value(&mut json_value, &pointer, value.clone())?;
    }
    validate_required_fields(&json_value)?;
    let version = json_value
        .pointer("/version")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if version != JOB_FILE_VERSION {
        return Err(Error::invalid_config(format!(
            "unsupported job file version '{}': expected '{}'",
            version, JOB_FILE_VERSION
        )));
    }
    let mut job: JobFile = serde_json::from_value(json_value)
        .map_err(|e| Error::invalid_config(format!("{}: {}", path.display(), e)))?;
    job.base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    job.provisioning_wait()?;
    job.run_wait()?;
    Ok(job)
}

/// Parses repeated `key=value` arguments. Values are read as JSON when they
/// parse, otherwise kept as strings.
pub fn parse_set_bindings(values: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (key, val_raw) = raw.split_once('=').ok_or_else(|| {
            Error::invalid_config(format!("invalid --set '{}': expected k=v", raw))
        })?;
        if key.trim().is_empty() {
            return Err(Error::invalid_config(format!(
                "invalid --set '{}': key cannot be empty",
                raw
            )));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.insert(key.to_string(), parsed);
    }
    Ok(out)
}

fn validate_required_fields(json_value: &Value) -> Result<()> {
    let mut required: Vec<&str> = vec![
        "/version",
        "/workspace/endpoint",
        "/compute/name",
        "/compute/vm_size",
        "/compute/max_nodes",
        "/dataset/name",
        "/experiment/name",
        "/job/task",
        "/job/primary_metric",
        "/job/label_column_name",
        "/wait/provisioning_timeout_minutes",
        "/wait/run_timeout_minutes",
    ];
    let has_config_path = json_value
        .pointer("/workspace/config_path")
        .and_then(|v| v.as_str())
        .map_or(false, |s| !s.is_empty());
    if !has_config_path {
        required.extend([
            "/workspace/subscription_id",
            "/workspace/resource_group",
            "/workspace/workspace_name",
        ]);
    }
    let zero_is_missing: &[&str] = &[
        "/compute/max_nodes",
        "/wait/provisioning_timeout_minutes",
        "/wait/run_timeout_minutes",
    ];
    let mut missing = Vec::new();
    for pointer in required {
        let is_missing = match json_value.pointer(pointer) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Number(n)) => n.as_u64() == Some(0) && zero_is_missing.contains(&pointer),
            _ => false,
        };
        if is_missing {
            missing.push(pointer);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::invalid_config(format!(
            "job file missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        )))
    }
}

fn decode_pointer_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn set_json_pointer_value(root: &mut Value, pointer: &str, new_value: Value) -> Result<()> {
    if !pointer.starts_with('/') {
        return Err(Error::invalid_config(format!(
            "json pointer must start with '/': {}",
            pointer
        )));
    }
    let tokens: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(decode_pointer_token)
        .collect();
    let Some((last, parents)) = tokens.split_last() else {
        *root = new_value;
        return Ok(());
    };

    let mut cur = root;
    for token in parents {
        match cur {
            Value::Object(map) => {
                cur = map.entry(token.clone()).or_insert_with(|| json!({}));
            }
            Value::Array(arr) => {
                let idx = array_index(token, arr.len(), pointer)?;
                cur = &mut arr[idx];
            }
            _ => {
                return Err(Error::invalid_config(format!(
                    "override {} traverses a scalar at '{}'",
                    pointer, token
                )));
            }
        }
    }

    match cur {
        Value::Object(map) => {
            map.insert(last.clone(), new_value);
            Ok(())
        }
        Value::Array(arr) => {
            let idx = array_index(last, arr.len(), pointer)?;
            arr[idx] = new_value;
            Ok(())
        }
        _ => Err(Error::invalid_config(format!(
            "override target is not an object or array: {}",
            pointer
        ))),
    }
}

fn array_index(token: &str, len: usize, pointer: &str) -> Result<usize> {
    let idx: usize = token.parse().map_err(|_| {
        Error::invalid_config(format!(
            "'{}' is not a valid array index in {}",
            token, pointer
        ))
    })?;
    if idx >= len {
        return Err(Error::invalid_config(format!(
            "array index {} out of bounds in {}",
            idx, pointer
        )));
    }
    Ok(idx)
}
