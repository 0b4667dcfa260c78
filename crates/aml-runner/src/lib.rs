//! Client for submitting automated model-selection jobs to a managed ML
//! platform: workspace → compute → dataset → config → run → best model.
//!
//! Every remote call goes through [`Platform`]; [`HttpPlatform`] is the
//! production backend.

pub mod compute;
pub mod config;
pub mod dataset;
pub mod error;
pub mod http;
pub mod jobfile;
pub mod platform;
pub mod run;
pub mod wait;
pub mod workspace;

use serde::Serialize;
use tracing::info;

pub use compute::{
    resolve_compute, wait_for_provisioning, ComputeSpec, ComputeTarget, ProvisioningState,
};
pub use config::{AutoMlConfig, AutoMlConfigBuilder, Featurization, PrimaryMetric, Task};
pub use dataset::{load_dataset, TabularDataset};
pub use error::{Error, Result};
pub use http::HttpPlatform;
pub use jobfile::{load_job_file, parse_set_bindings, JobFile, JOB_FILE_TEMPLATE};
pub use platform::Platform;
pub use run::{
    best_output_if_complete, get_best_output, list_child_runs, submit, wait_for_completion,
    BestOutput, ChildRun, ModelArtifact, RunDetails, RunHandle, RunStatus,
};
pub use wait::WaitOptions;
pub use workspace::{resolve_workspace, Workspace, WorkspaceConfig};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Block until the run is terminal and fetch the best model.
    pub wait: bool,
    /// Log run status transitions while waiting.
    pub show_output: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub workspace: Workspace,
    pub compute: ComputeTarget,
    pub dataset: TabularDataset,
    pub run: RunHandle,
    pub details: Option<RunDetails>,
    pub best: Option<BestOutput>,
}

/// Runs the whole flow for `job`, one step after another. The first failure
/// ends the flow; nothing is retried.
pub fn run_job(platform: &dyn Platform, job: &JobFile, options: &RunOptions) -> Result<JobOutcome> {
    let workspace = resolve_workspace(platform, &job.workspace_config()?)?;
    let provisioning_wait = job.provisioning_wait()?;
    let compute = resolve_compute(platform, &workspace, &job.compute, &provisioning_wait)?;
    let dataset = load_dataset(
        platform,
        &workspace,
        &job.dataset.name,
        job.dataset.version.as_deref(),
        &job.dataset.drop_columns,
    )?;
    let config = job.config_builder(dataset.clone(), &compute).build()?;
    let run = submit(platform, &workspace, &job.experiment.name, config)?;

    let (details, best) = if options.wait {
        let run_wait = job.run_wait()?;
        let details =
            wait_for_completion(platform, &workspace, &run, &run_wait, options.show_output)?;
        let best = get_best_output(platform, &workspace, &run, &run_wait, None)?;
        (Some(details), Some(best))
    } else {
        info!(run_id = %run.run_id, "not waiting for run completion");
        (None, None)
    };

    Ok(JobOutcome {
        workspace,
        compute,
        dataset,
        run,
        details,
        best,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory [`Platform`] shared by the unit tests.

    use std::cell::{Cell, RefCell};
    use std::collections::{BTreeMap, VecDeque};
    use std::time::Duration;

    use serde_json::Value;

    use super::*;

    pub(crate) struct FakePlatform {
        computes: RefCell<BTreeMap<String, ComputeTarget>>,
        provisioning: RefCell<VecDeque<ProvisioningState>>,
        datasets: BTreeMap<String, TabularDataset>,
        run_statuses: RefCell<VecDeque<RunStatus>>,
        best: BestOutput,
        fail_auth: bool,
        fail_children: bool,
        pub create_calls: Cell<usize>,
        pub submit_calls: Cell<usize>,
        pub get_run_calls: Cell<usize>,
        pub best_calls: Cell<usize>,
        pub submitted: RefCell<Vec<Value>>,
        pub last_metric: RefCell<Option<String>>,
    }

    /// Pops the next scripted value; the last one repeats forever.
    fn next_scripted<T: Copy>(script: &RefCell<VecDeque<T>>) -> Option<T> {
        let mut script = script.borrow_mut();
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().copied()
        }
    }

    impl FakePlatform {
        pub(crate) fn new() -> Self {
            let mut metrics = BTreeMap::new();
            metrics.insert("accuracy".to_string(), 0.91);
            Self {
                computes: RefCell::new(BTreeMap::new()),
                provisioning: RefCell::new(VecDeque::new()),
                datasets: BTreeMap::new(),
                run_statuses: RefCell::new(VecDeque::from(vec![RunStatus::Completed])),
                best: BestOutput {
                    run: ChildRun {
                        run_id: "AutoML_1_7".to_string(),
                        status: RunStatus::Completed,
                        algorithm: Some("VotingEnsemble".to_string()),
                        metrics,
                    },
                    model: ModelArtifact {
                        name: "AutoML1best".to_string(),
                        algorithm: Some("VotingEnsemble".to_string()),
                        uri: "azureml://models/AutoML1best/1".to_string(),
                    },
                },
                fail_auth: false,
                fail_children: false,
                create_calls: Cell::new(0),
                submit_calls: Cell::new(0),
                get_run_calls: Cell::new(0),
                best_calls: Cell::new(0),
                submitted: RefCell::new(Vec::new()),
                last_metric: RefCell::new(None),
            }
        }

        pub(crate) fn with_compute(self, target: ComputeTarget) -> Self {
            self.computes
                .borrow_mut()
                .insert(target.name.clone(), target);
            self
        }

        /// States reported by successive lookups once a target exists.
        pub(crate) fn with_provisioning(self, states: Vec<ProvisioningState>) -> Self {
            *self.provisioning.borrow_mut() = VecDeque::from(states);
            self
        }

        pub(crate) fn with_dataset(mut self, dataset: TabularDataset) -> Self {
            self.datasets.insert(dataset.name.clone(), dataset);
            self
        }

        pub(crate) fn with_run_statuses(self, statuses: Vec<RunStatus>) -> Self {
            *self.run_statuses.borrow_mut() = VecDeque::from(statuses);
            self
        }

        pub(crate) fn failing_auth(mut self) -> Self {
            self.fail_auth = true;
            self
        }

        pub(crate) fn failing_children(mut self) -> Self {
            self.fail_children = true;
            self
        }
    }

    impl Platform for FakePlatform {
        fn get_workspace(&self, config: &WorkspaceConfig) -> Result<Workspace> {
            if self.fail_auth {
                return Err(Error::Auth("token expired".to_string()));
            }
            Ok(Workspace {
                id: config.scope(),
                name: config.workspace_name.clone(),
                subscription_id: config.subscription_id.clone(),
                resource_group: config.resource_group.clone(),
                location: "eastus".to_string(),
            })
        }

        fn get_compute(&self, _workspace: &Workspace, name: &str) -> Result<Option<ComputeTarget>> {
            let mut computes = self.computes.borrow_mut();
            let Some(target) = computes.get_mut(name) else {
                return Ok(None);
            };
            if let Some(state) = next_scripted(&self.provisioning) {
                target.provisioning_state = state;
            }
            Ok(Some(target.clone()))
        }

        fn create_compute(&self, _workspace: &Workspace, spec: &ComputeSpec) -> Result<ComputeTarget> {
            self.create_calls.set(self.create_calls.get() + 1);
            let target = ComputeTarget {
                name: spec.name.clone(),
                vm_size: spec.vm_size.clone(),
                min_nodes: spec.min_nodes,
                max_nodes: spec.max_nodes,
                provisioning_state: ProvisioningState::Creating,
                errors: Vec::new(),
            };
            self.computes
                .borrow_mut()
                .insert(spec.name.clone(), target.clone());
            Ok(target)
        }

        fn get_dataset(
            &self,
            _workspace: &Workspace,
            name: &str,
            _version: Option<&str>,
        ) -> Result<TabularDataset> {
            self.datasets
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NotFound {
                    kind: "dataset",
                    name: name.to_string(),
                })
        }

        fn submit_run(
            &self,
            _workspace: &Workspace,
            experiment: &str,
            config: &AutoMlConfig,
        ) -> Result<RunHandle> {
            let n = self.submit_calls.get() + 1;
            self.submit_calls.set(n);
            self.submitted.borrow_mut().push(serde_json::to_value(config)?);
            Ok(RunHandle {
                run_id: format!("AutoML_{}", n),
                experiment_name: experiment.to_string(),
                status: RunStatus::NotStarted,
                portal_url: None,
            })
        }

        fn get_run(&self, _workspace: &Workspace, run: &RunHandle) -> Result<RunDetails> {
            self.get_run_calls.set(self.get_run_calls.get() + 1);
            let status = next_scripted(&self.run_statuses).unwrap_or(RunStatus::Completed);
            Ok(RunDetails {
                run_id: run.run_id.clone(),
                status,
                error: (status == RunStatus::Failed).then(|| "iteration crashed".to_string()),
                start_time: None,
                end_time: None,
            })
        }

        fn list_child_runs(&self, _workspace: &Workspace, _run: &RunHandle) -> Result<Vec<ChildRun>> {
            if self.fail_children {
                return Err(Error::Api {
                    status: 503,
                    message: "children unavailable".to_string(),
                });
            }
            Ok(vec![self.best.run.clone()])
        }

        fn get_best_child(
            &self,
            _workspace: &Workspace,
            _run: &RunHandle,
            metric: Option<&str>,
        ) -> Result<BestOutput> {
            self.best_calls.set(self.best_calls.get() + 1);
            *self.last_metric.borrow_mut() = metric.map(|m| m.to_string());
            Ok(self.best.clone())
        }
    }

    pub(crate) fn fast_wait() -> WaitOptions {
        WaitOptions::new(Duration::from_secs(5), Duration::from_millis(1))
    }

    pub(crate) fn test_workspace_config() -> WorkspaceConfig {
        WorkspaceConfig {
            endpoint: "https://ml.example.com".to_string(),
            subscription_id: "sub-123".to_string(),
            resource_group: "ml-rg".to_string(),
            workspace_name: "papers-ws".to_string(),
            token_env: "AML_TOKEN".to_string(),
        }
    }

    pub(crate) fn test_workspace() -> Workspace {
        let config = test_workspace_config();
        Workspace {
            id: config.scope(),
            name: config.workspace_name,
            subscription_id: config.subscription_id,
            resource_group: config.resource_group,
            location: "eastus".to_string(),
        }
    }

    pub(crate) fn ready_compute(name: &str, max_nodes: u32) -> ComputeTarget {
        ComputeTarget {
            name: name.to_string(),
            vm_size: "STANDARD_D2_V2".to_string(),
            min_nodes: 0,
            max_nodes,
            provisioning_state: ProvisioningState::Succeeded,
            errors: Vec::new(),
        }
    }

    /// Columns {sha, title, cluster, vec1..vec10}.
    pub(crate) fn sample_dataset() -> TabularDataset {
        let mut columns = vec!["sha".to_string(), "title".to_string(), "cluster".to_string()];
        columns.extend((1..=10).map(|i| format!("vec{}", i)));
        TabularDataset {
            id: "ds-papers-1".to_string(),
            name: "papers".to_string(),
            version: "1".to_string(),
            columns,
            row_count: Some(1_000),
            dropped_columns: Vec::new(),
        }
    }

    pub(crate) fn papers_config() -> AutoMlConfig {
        let training = sample_dataset()
            .drop_columns(&["sha", "title"])
            .expect("projection");
        AutoMlConfig::builder()
            .task(Task::Classification)
            .primary_metric(PrimaryMetric::Accuracy)
            .training_data(training)
            .label_column_name("cluster")
            .compute_target(&ready_compute("cpu-cluster", 4))
            .n_cross_validations(5)
            .experiment_timeout_hours(0.25)
            .max_concurrent_iterations(4)
            .iteration_timeout_minutes(5)
            .build()
            .expect("papers config")
    }
}
