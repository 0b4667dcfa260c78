//! Automated model-selection job configuration.
//!
//! [`AutoMlConfig`] is an immutable request value. Optional settings stay
//! `None` unless the caller sets them and are left out of the wire payload,
//! so the platform sees exactly what was asked for.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::compute::ComputeTarget;
use crate::dataset::TabularDataset;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Classification,
    Regression,
    Forecasting,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Classification => "classification",
            Task::Regression => "regression",
            Task::Forecasting => "forecasting",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Task {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "classification" => Ok(Task::Classification),
            "regression" => Ok(Task::Regression),
            "forecasting" => Ok(Task::Forecasting),
            other => Err(Error::invalid_config(format!(
                "unknown task '{}': expected classification|regression|forecasting",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimaryMetric {
    #[serde(rename = "accuracy")]
    Accuracy,
    #[serde(rename = "AUC_weighted")]
    AucWeighted,
    #[serde(rename = "average_precision_score_weighted")]
    AveragePrecisionScoreWeighted,
    #[serde(rename = "norm_macro_recall")]
    NormMacroRecall,
    #[serde(rename = "precision_score_weighted")]
    PrecisionScoreWeighted,
    #[serde(rename = "spearman_correlation")]
    SpearmanCorrelation,
    #[serde(rename = "normalized_root_mean_squared_error")]
    NormalizedRootMeanSquaredError,
    #[serde(rename = "r2_score")]
    R2Score,
    #[serde(rename = "normalized_mean_absolute_error")]
    NormalizedMeanAbsoluteError,
}

const ALL_METRICS: [PrimaryMetric; 9] = [
    PrimaryMetric::Accuracy,
    PrimaryMetric::AucWeighted,
    PrimaryMetric::AveragePrecisionScoreWeighted,
    PrimaryMetric::NormMacroRecall,
    PrimaryMetric::PrecisionScoreWeighted,
    PrimaryMetric::SpearmanCorrelation,
    PrimaryMetric::NormalizedRootMeanSquaredError,
    PrimaryMetric::R2Score,
    PrimaryMetric::NormalizedMeanAbsoluteError,
];

impl PrimaryMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimaryMetric::Accuracy => "accuracy",
            PrimaryMetric::AucWeighted => "AUC_weighted",
            PrimaryMetric::AveragePrecisionScoreWeighted => "average_precision_score_weighted",
            PrimaryMetric::NormMacroRecall => "norm_macro_recall",
            PrimaryMetric::PrecisionScoreWeighted => "precision_score_weighted",
            PrimaryMetric::SpearmanCorrelation => "spearman_correlation",
            PrimaryMetric::NormalizedRootMeanSquaredError => "normalized_root_mean_squared_error",
            PrimaryMetric::R2Score => "r2_score",
            PrimaryMetric::NormalizedMeanAbsoluteError => "normalized_mean_absolute_error",
        }
    }

    pub fn supports(&self, task: Task) -> bool {
        let classification = matches!(
            self,
            PrimaryMetric::Accuracy
                | PrimaryMetric::AucWeighted
                | PrimaryMetric::AveragePrecisionScoreWeighted
                | PrimaryMetric::NormMacroRecall
                | PrimaryMetric::PrecisionScoreWeighted
        );
        match task {
            Task::Classification => classification,
            Task::Regression | Task::Forecasting => !classification,
        }
    }
}

impl fmt::Display for PrimaryMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrimaryMetric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ALL_METRICS
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::invalid_config(format!("unknown primary metric '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Featurization {
    Auto,
    Off,
}

/// Wire shape of a submitted job. Built only through [`AutoMlConfigBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoMlConfig {
    task: Task,
    primary_metric: PrimaryMetric,
    training_data: TabularDataset,
    label_column_name: String,
    compute_target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    n_cross_validations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    experiment_timeout_hours: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_concurrent_iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iteration_timeout_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_column_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    forecast_horizon: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_early_stopping: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    featurization: Option<Featurization>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    blocked_models: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    allowed_models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    experiment_exit_score: Option<f64>,
}

impl AutoMlConfig {
    pub fn builder() -> AutoMlConfigBuilder {
        AutoMlConfigBuilder::default()
    }

    pub fn task(&self) -> Task {
        self.task
    }

    pub fn primary_metric(&self) -> PrimaryMetric {
        self.primary_metric
    }

    pub fn training_data(&self) -> &TabularDataset {
        &self.training_data
    }

    pub fn label_column_name(&self) -> &str {
        &self.label_column_name
    }

    pub fn compute_target(&self) -> &str {
        &self.compute_target
    }

    pub fn n_cross_validations(&self) -> Option<u32> {
        self.n_cross_validations
    }

    pub fn experiment_timeout_hours(&self) -> Option<f64> {
        self.experiment_timeout_hours
    }

    pub fn max_concurrent_iterations(&self) -> Option<u32> {
        self.max_concurrent_iterations
    }

    pub fn iteration_timeout_minutes(&self) -> Option<u32> {
        self.iteration_timeout_minutes
    }

    pub fn time_column_name(&self) -> Option<&str> {
        self.time_column_name.as_deref()
    }

    pub fn forecast_horizon(&self) -> Option<u32> {
        self.forecast_horizon
    }

    pub fn enable_early_stopping(&self) -> Option<bool> {
        self.enable_early_stopping
    }

    pub fn featurization(&self) -> Option<Featurization> {
        self.featurization
    }

    pub fn blocked_models(&self) -> &[String] {
        &self.blocked_models
    }

    pub fn allowed_models(&self) -> &[String] {
        &self.allowed_models
    }

    pub fn experiment_exit_score(&self) -> Option<f64> {
        self.experiment_exit_score
    }
}

#[derive(Debug, Clone, Default)]
pub struct AutoMlConfigBuilder {
    task: Option<Task>,
    primary_metric: Option<PrimaryMetric>,
    training_data: Option<TabularDataset>,
    label_column_name: Option<String>,
    compute_target: Option<String>,
    compute_max_nodes: Option<u32>,
    n_cross_validations: Option<u32>,
    experiment_timeout_hours: Option<f64>,
    max_concurrent_iterations: Option<u32>,
    iteration_timeout_minutes: Option<u32>,
    time_column_name: Option<String>,
    forecast_horizon: Option<u32>,
    enable_early_stopping: Option<bool>,
    featurization: Option<Featurization>,
    blocked_models: Vec<String>,
    allowed_models: Vec<String>,
    experiment_exit_score: Option<f64>,
}

impl AutoMlConfigBuilder {
    pub fn task(mut self, task: Task) -> Self {
        self.task = Some(task);
        self
    }

    pub fn primary_metric(mut self, metric: PrimaryMetric) -> Self {
        self.primary_metric = Some(metric);
        self
    }

    pub fn training_data(mut self, dataset: TabularDataset) -> Self {
        self.training_data = Some(dataset);
        self
    }

    pub fn label_column_name(mut self, name: impl Into<String>) -> Self {
        self.label_column_name = Some(name.into());
        self
    }

    pub fn compute_target(mut self, target: &ComputeTarget) -> Self {
        self.compute_target = Some(target.name.clone());
        self.compute_max_nodes = Some(target.max_nodes);
        self
    }

    pub fn n_cross_validations(mut self, folds: u32) -> Self {
        self.n_cross_validations = Some(folds);
        self
    }

    pub fn experiment_timeout_hours(mut self, hours: f64) -> Self {
        self.experiment_timeout_hours = Some(hours);
        self
    }

    pub fn max_concurrent_iterations(mut self, limit: u32) -> Self {
        self.max_concurrent_iterations = Some(limit);
        self
    }

    pub fn iteration_timeout_minutes(mut self, minutes: u32) -> Self {
        self.iteration_timeout_minutes = Some(minutes);
        self
    }

    pub fn time_column_name(mut self, name: impl Into<String>) -> Self {
        self.time_column_name = Some(name.into());
        self
    }

    pub fn forecast_horizon(mut self, horizon: u32) -> Self {
        self.forecast_horizon = Some(horizon);
        self
    }

    pub fn enable_early_stopping(mut self, enabled: bool) -> Self {
        self.enable_early_stopping = Some(enabled);
        self
    }

    pub fn featurization(mut self, mode: Featurization) -> Self {
        self.featurization = Some(mode);
        self
    }

    pub fn blocked_models(mut self, models: Vec<String>) -> Self {
        self.blocked_models = models;
        self
    }

    pub fn allowed_models(mut self, models: Vec<String>) -> Self {
        self.allowed_models = models;
        self
    }

    pub fn experiment_exit_score(mut self, score: f64) -> Self {
        self.experiment_exit_score = Some(score);
        self
    }

    pub fn build(self) -> Result<AutoMlConfig> {
        let mut missing = Vec::new();
        if self.task.is_none() {
            missing.push("task");
        }
        if self.primary_metric.is_none() {
            missing.push("primary_metric");
        }
        if self.training_data.is_none() {
            missing.push("training_data");
        }
        if self.label_column_name.as_deref().map_or(true, |s| s.is_empty()) {
            missing.push("label_column_name");
        }
        if self.compute_target.is_none() {
            missing.push("compute_target");
        }
        if !missing.is_empty() {
            return Err(Error::invalid_config(format!(
                "job config missing required fields: {}",
                missing.join(", ")
            )));
        }
        let (
            Some(task),
            Some(primary_metric),
            Some(training_data),
            Some(label_column_name),
            Some(compute_target),
        ) = (
            self.task,
            self.primary_metric,
            self.training_data,
            self.label_column_name,
            self.compute_target,
        )
        else {
            return Err(Error::invalid_config("job config incomplete"));
        };

        if !primary_metric.supports(task) {
            return Err(Error::invalid_config(format!(
                "primary metric '{}' is not valid for task '{}'",
                primary_metric, task
            )));
        }

        let mut problems = Vec::new();
        if let Some(folds) = self.n_cross_validations {
            if folds < 2 {
                problems.push(format!("n_cross_validations must be at least 2, got {}", folds));
            }
        }
        if let Some(hours) = self.experiment_timeout_hours {
            if !hours.is_finite() || hours <= 0.0 {
                problems.push(format!(
                    "experiment_timeout_hours must be positive, got {}",
                    hours
                ));
            }
        }
        if self.iteration_timeout_minutes == Some(0) {
            problems.push("iteration_timeout_minutes must be at least 1".to_string());
        }
        if self.max_concurrent_iterations == Some(0) {
            problems.push("max_concurrent_iterations must be at least 1".to_string());
        }
        if self.forecast_horizon == Some(0) {
            problems.push("forecast_horizon must be at least 1".to_string());
        }
        if let Some(score) = self.experiment_exit_score {
            if !score.is_finite() {
                problems.push("experiment_exit_score must be finite".to_string());
            }
        }
        let overlap: Vec<&str> = self
            .allowed_models
            .iter()
            .filter(|m| self.blocked_models.contains(m))
            .map(|m| m.as_str())
            .collect();
        if !overlap.is_empty() {
            problems.push(format!(
                "models both allowed and blocked: {}",
                overlap.join(", ")
            ));
        }
        if task == Task::Forecasting && self.time_column_name.is_none() {
            problems.push("forecasting requires time_column_name".to_string());
        }
        if !problems.is_empty() {
            return Err(Error::invalid_config(problems.join("; ")));
        }

        let mut absent = Vec::new();
        if !training_data.has_column(&label_column_name) {
            absent.push(label_column_name.clone());
        }
        if let Some(time_column) = &self.time_column_name {
            if !training_data.has_column(time_column) {
                absent.push(time_column.clone());
            }
        }
        if !absent.is_empty() {
            return Err(Error::schema_mismatch(
                format!("training data '{}'", training_data.name),
                absent,
            ));
        }

        if let (Some(limit), Some(max_nodes)) =
            (self.max_concurrent_iterations, self.compute_max_nodes)
        {
            if limit > max_nodes {
                warn!(
                    max_concurrent_iterations = limit,
                    max_nodes,
                    compute = %compute_target,
                    "concurrency limit exceeds compute max_nodes; platform will cap it"
                );
            }
        }

        Ok(AutoMlConfig {
            task,
            primary_metric,
            training_data,
            label_column_name,
            compute_target,
            n_cross_validations: self.n_cross_validations,
            experiment_timeout_hours: self.experiment_timeout_hours,
            max_concurrent_iterations: self.max_concurrent_iterations,
            iteration_timeout_minutes: self.iteration_timeout_minutes,
            time_column_name: self.time_column_name,
            forecast_horizon: self.forecast_horizon,
            enable_early_stopping: self.enable_early_stopping,
            featurization: self.featurization,
            blocked_models: self.blocked_models,
            allowed_models: self.allowed_models,
            experiment_exit_score: self.experiment_exit_score,
        })
    }
}
