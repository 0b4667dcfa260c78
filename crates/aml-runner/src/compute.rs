use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::wait::{poll_until, Poll, WaitOptions};
use crate::workspace::Workspace;

/// Provisioning request for an autoscaling compute cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComputeSpec {
    pub name: String,
    pub vm_size: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_seconds_before_scaledown: Option<u64>,
}

impl ComputeSpec {
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("name must not be empty".to_string());
        }
        if self.vm_size.trim().is_empty() {
            problems.push("vm_size must not be empty".to_string());
        }
        if self.max_nodes == 0 {
            problems.push("max_nodes must be at least 1".to_string());
        }
        if self.min_nodes > self.max_nodes {
            problems.push(format!(
                "min_nodes ({}) exceeds max_nodes ({})",
                self.min_nodes, self.max_nodes
            ));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_config(format!(
                "compute '{}': {}",
                self.name,
                problems.join("; ")
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningState {
    Creating,
    Updating,
    Succeeded,
    Failed,
    Canceled,
    Deleting,
    #[serde(other)]
    Unknown,
}

impl ProvisioningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningState::Creating => "Creating",
            ProvisioningState::Updating => "Updating",
            ProvisioningState::Succeeded => "Succeeded",
            ProvisioningState::Failed => "Failed",
            ProvisioningState::Canceled => "Canceled",
            ProvisioningState::Deleting => "Deleting",
            ProvisioningState::Unknown => "Unknown",
        }
    }
}

/// A named compute cluster. Identity is the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeTarget {
    pub name: String,
    pub vm_size: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub provisioning_state: ProvisioningState,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ComputeTarget {
    fn differs_from(&self, spec: &ComputeSpec) -> bool {
        !self.vm_size.eq_ignore_ascii_case(&spec.vm_size)
            || self.min_nodes != spec.min_nodes
            || self.max_nodes != spec.max_nodes
    }

    fn failure_message(&self) -> String {
        if self.errors.is_empty() {
            format!("provisioning state {}", self.provisioning_state.as_str())
        } else {
            self.errors.join("; ")
        }
    }
}

/// Returns the compute target named by `spec`, provisioning it if absent.
///
/// An existing target is returned as found; its size is never changed.
/// When the name is absent exactly one create request is issued, then the
/// call blocks until the platform reports the cluster ready, reports a
/// failure, or `wait.timeout` elapses.
pub fn resolve_compute(
    platform: &dyn Platform,
    workspace: &Workspace,
    spec: &ComputeSpec,
    wait: &WaitOptions,
) -> Result<ComputeTarget> {
    if let Some(existing) = platform.get_compute(workspace, &spec.name)? {
        info!(
            compute = %existing.name,
            state = existing.provisioning_state.as_str(),
            "found existing compute target"
        );
        if existing.differs_from(spec) {
            warn!(
                compute = %existing.name,
                vm_size = %existing.vm_size,
                min_nodes = existing.min_nodes,
                max_nodes = existing.max_nodes,
                "existing compute target differs from requested spec; using it as-is"
            );
        }
        return match existing.provisioning_state {
            ProvisioningState::Succeeded => Ok(existing),
            ProvisioningState::Creating | ProvisioningState::Updating => {
                wait_for_provisioning(platform, workspace, &spec.name, wait)
            }
            _ => Err(Error::Provisioning {
                name: existing.name.clone(),
                message: existing.failure_message(),
            }),
        };
    }

    spec.validate()?;
    info!(
        compute = %spec.name,
        vm_size = %spec.vm_size,
        min_nodes = spec.min_nodes,
        max_nodes = spec.max_nodes,
        "creating compute target"
    );
    let created = platform.create_compute(workspace, spec)?;
    if created.provisioning_state == ProvisioningState::Succeeded {
        return Ok(created);
    }
    wait_for_provisioning(platform, workspace, &spec.name, wait)
}

/// Blocks until the named compute target reaches `Succeeded`.
pub fn wait_for_provisioning(
    platform: &dyn Platform,
    workspace: &Workspace,
    name: &str,
    wait: &WaitOptions,
) -> Result<ComputeTarget> {
    let operation = format!("provisioning of compute '{}'", name);
    let mut last_state = None;
    let target = poll_until(&operation, wait, || {
        let target = platform
            .get_compute(workspace, name)?
            .ok_or_else(|| Error::Provisioning {
                name: name.to_string(),
                message: "compute target disappeared while provisioning".to_string(),
            })?;
        if last_state != Some(target.provisioning_state) {
            info!(
                compute = %name,
                state = target.provisioning_state.as_str(),
                "compute provisioning state"
            );
            last_state = Some(target.provisioning_state);
        }
        match target.provisioning_state {
            ProvisioningState::Succeeded => Ok(Poll::Ready(target)),
            ProvisioningState::Failed
            | ProvisioningState::Canceled
            | ProvisioningState::Deleting => Err(Error::Provisioning {
                name: name.to_string(),
                message: target.failure_message(),
            }),
            _ => Ok(Poll::Pending),
        }
    })?;
    info!(compute = %name, "compute target ready");
    Ok(target)
}
