use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AutoMlConfig;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::wait::{poll_until, Poll, WaitOptions};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    NotStarted,
    Queued,
    Preparing,
    Starting,
    Provisioning,
    Running,
    Finalizing,
    CancelRequested,
    Completed,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::NotStarted => "NotStarted",
            RunStatus::Queued => "Queued",
            RunStatus::Preparing => "Preparing",
            RunStatus::Starting => "Starting",
            RunStatus::Provisioning => "Provisioning",
            RunStatus::Running => "Running",
            RunStatus::Finalizing => "Finalizing",
            RunStatus::CancelRequested => "CancelRequested",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
            RunStatus::Canceled => "Canceled",
            RunStatus::Unknown => "Unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

/// Reference to an asynchronous remote run. `status` is the state observed
/// at submission and is not refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: String,
    pub experiment_name: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portal_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDetails {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

/// One trial inside an automated model-selection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRun {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestOutput {
    pub run: ChildRun,
    pub model: ModelArtifact,
}

pub fn validate_experiment_name(name: &str) -> Result<()> {
    let starts_ok = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);
    let chars_ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if starts_ok && chars_ok && name.len() <= 255 {
        Ok(())
    } else {
        Err(Error::invalid_config(format!(
            "invalid experiment name '{}': use 1-255 of [A-Za-z0-9_-], starting with a letter or digit",
            name
        )))
    }
}

/// Sends `config` to the named experiment. Every call creates a new run.
pub fn submit(
    platform: &dyn Platform,
    workspace: &Workspace,
    experiment_name: &str,
    config: AutoMlConfig,
) -> Result<RunHandle> {
    validate_experiment_name(experiment_name)?;
    info!(
        experiment = %experiment_name,
        task = %config.task(),
        primary_metric = %config.primary_metric(),
        compute = %config.compute_target(),
        "submitting automl run"
    );
    let run = platform.submit_run(workspace, experiment_name, &config)?;
    info!(
        experiment = %run.experiment_name,
        run_id = %run.run_id,
        status = run.status.as_str(),
        "run submitted"
    );
    Ok(run)
}

pub fn list_child_runs(
    platform: &dyn Platform,
    workspace: &Workspace,
    run: &RunHandle,
) -> Result<Vec<ChildRun>> {
    platform.list_child_runs(workspace, run)
}

/// Blocks until `run` is terminal. Only `Completed` is a success.
///
/// With `show_output` every status transition is logged together with the
/// number of child runs seen so far.
pub fn wait_for_completion(
    platform: &dyn Platform,
    workspace: &Workspace,
    run: &RunHandle,
    wait: &WaitOptions,
    show_output: bool,
) -> Result<RunDetails> {
    let operation = format!("run {}", run.run_id);
    let mut last_status = None;
    let details = poll_until(&operation, wait, || {
        let details = platform.get_run(workspace, run)?;
        if last_status != Some(details.status) {
            if show_output {
                match platform.list_child_runs(workspace, run) {
                    Ok(children) => info!(
                        run_id = %run.run_id,
                        status = details.status.as_str(),
                        child_runs = children.len(),
                        "run status"
                    ),
                    Err(e) => {
                        info!(run_id = %run.run_id, status = details.status.as_str(), "run status");
                        warn!(run_id = %run.run_id, error = %e, "could not list child runs");
                    }
                }
            } else {
                debug!(run_id = %run.run_id, status = details.status.as_str(), "run status");
            }
            last_status = Some(details.status);
        }
        if details.status.is_terminal() {
            Ok(Poll::Ready(details))
        } else {
            Ok(Poll::Pending)
        }
    })?;
    match details.status {
        RunStatus::Completed => Ok(details),
        status => Err(Error::RunFailed {
            run_id: details.run_id.clone(),
            status: status.as_str().to_string(),
            message: details
                .error
                .clone()
                .unwrap_or_else(|| "no error detail reported".to_string()),
        }),
    }
}

/// Waits for `run` to complete, then fetches the platform's best child run
/// and its model. Never yields a value for a run that did not complete.
pub fn get_best_output(
    platform: &dyn Platform,
    workspace: &Workspace,
    run: &RunHandle,
    wait: &WaitOptions,
    metric: Option<&str>,
) -> Result<BestOutput> {
    wait_for_completion(platform, workspace, run, wait, false)?;
    fetch_best(platform, workspace, run, metric)
}

/// Non-blocking variant of [`get_best_output`].
pub fn best_output_if_complete(
    platform: &dyn Platform,
    workspace: &Workspace,
    run: &RunHandle,
    metric: Option<&str>,
) -> Result<BestOutput> {
    let details = platform.get_run(workspace, run)?;
    match details.status {
        RunStatus::Completed => fetch_best(platform, workspace, run, metric),
        RunStatus::Failed | RunStatus::Canceled => Err(Error::RunFailed {
            run_id: details.run_id,
            status: details.status.as_str().to_string(),
            message: details
                .error
                .unwrap_or_else(|| "no error detail reported".to_string()),
        }),
        status => Err(Error::RunNotComplete {
            run_id: details.run_id,
            status: status.as_str().to_string(),
        }),
    }
}

fn fetch_best(
    platform: &dyn Platform,
    workspace: &Workspace,
    run: &RunHandle,
    metric: Option<&str>,
) -> Result<BestOutput> {
    let best = platform.get_best_child(workspace, run, metric)?;
    info!(
        run_id = %run.run_id,
        best_run = %best.run.run_id,
        algorithm = best.run.algorithm.as_deref().unwrap_or("unknown"),
        model = %best.model.name,
        "retrieved best model"
    );
    Ok(best)
}
