//! The seam between the orchestration flow and the remote ML platform.
//!
//! Every flow step talks to the platform only through [`Platform`], so the
//! HTTP backend can be swapped for a scripted one in tests.

use crate::compute::{ComputeSpec, ComputeTarget};
use crate::config::AutoMlConfig;
use crate::dataset::TabularDataset;
use crate::error::Result;
use crate::run::{BestOutput, ChildRun, RunDetails, RunHandle};
use crate::workspace::{Workspace, WorkspaceConfig};

pub trait Platform {
    fn get_workspace(&self, config: &WorkspaceConfig) -> Result<Workspace>;

    /// `Ok(None)` when no compute target exists under `name`.
    fn get_compute(&self, workspace: &Workspace, name: &str) -> Result<Option<ComputeTarget>>;

    fn create_compute(&self, workspace: &Workspace, spec: &ComputeSpec) -> Result<ComputeTarget>;

    fn get_dataset(
        &self,
        workspace: &Workspace,
        name: &str,
        version: Option<&str>,
    ) -> Result<TabularDataset>;

    /// Creates a new remote run on every call.
    fn submit_run(
        &self,
        workspace: &Workspace,
        experiment: &str,
        config: &AutoMlConfig,
    ) -> Result<RunHandle>;

    fn get_run(&self, workspace: &Workspace, run: &RunHandle) -> Result<RunDetails>;

    fn list_child_runs(&self, workspace: &Workspace, run: &RunHandle) -> Result<Vec<ChildRun>>;

    /// Ranking is done by the platform, by `metric` or the run's primary metric.
    fn get_best_child(
        &self,
        workspace: &Workspace,
        run: &RunHandle,
        metric: Option<&str>,
    ) -> Result<BestOutput>;
}
