use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::platform::Platform;

pub const DEFAULT_TOKEN_ENV: &str = "AML_TOKEN";

/// Everything needed to reach a workspace. Passed explicitly; nothing is
/// discovered from the process environment except the token variable it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub endpoint: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub workspace_name: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

/// Layout of a downloaded workspace config file.
#[derive(Debug, Deserialize)]
struct WorkspaceFile {
    subscription_id: String,
    resource_group: String,
    workspace_name: String,
}

impl WorkspaceConfig {
    /// Reads subscription, resource group and workspace name from `path`;
    /// endpoint and token variable are supplied by the caller.
    pub fn from_file(path: &Path, endpoint: &str, token_env: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::Workspace(format!(
                "cannot read workspace config {}: {}",
                path.display(),
                e
            ))
        })?;
        let file: WorkspaceFile = serde_json::from_str(&raw)?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            subscription_id: file.subscription_id,
            resource_group: file.resource_group,
            workspace_name: file.workspace_name,
            token_env: token_env.to_string(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("endpoint", &self.endpoint),
            ("subscription_id", &self.subscription_id),
            ("resource_group", &self.resource_group),
            ("workspace_name", &self.workspace_name),
            ("token_env", &self.token_env),
        ];
        let empty: Vec<&str> = fields
            .iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(k, _)| *k)
            .collect();
        if empty.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_config(format!(
                "workspace config has empty fields: {}",
                empty.join(", ")
            )))
        }
    }

    /// Resource path prefix that scopes every workspace-level call.
    pub fn scope(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/workspaces/{}",
            self.subscription_id, self.resource_group, self.workspace_name
        )
    }
}

/// A resolved workspace. Read-only for the rest of the flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub subscription_id: String,
    pub resource_group: String,
    #[serde(default)]
    pub location: String,
}

impl Workspace {
    pub fn scope(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/workspaces/{}",
            self.subscription_id, self.resource_group, self.name
        )
    }
}

pub fn resolve_workspace(platform: &dyn Platform, config: &WorkspaceConfig) -> Result<Workspace> {
    config.validate()?;
    let workspace = platform.get_workspace(config)?;
    info!(
        workspace = %workspace.name,
        resource_group = %workspace.resource_group,
        location = %workspace.location,
        "resolved workspace"
    );
    Ok(workspace)
}
