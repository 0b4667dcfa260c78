use std::env;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::compute::{ComputeSpec, ComputeTarget};
use crate::config::AutoMlConfig;
use crate::dataset::TabularDataset;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::run::{BestOutput, ChildRun, RunDetails, RunHandle, RunStatus};
use crate::workspace::{Workspace, WorkspaceConfig};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// [`Platform`] over the workspace's JSON REST API.
pub struct HttpPlatform {
    client: Client,
    base: Url,
    token: String,
}

#[derive(Debug, Deserialize)]
struct WorkspaceResponse {
    id: String,
    name: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    run_id: String,
    status: RunStatus,
    #[serde(default)]
    portal_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    value: Vec<T>,
}

impl HttpPlatform {
    pub fn new(endpoint: &str, token: impl Into<String>) -> Result<Self> {
        let base = Url::parse(endpoint)
            .map_err(|e| Error::invalid_config(format!("invalid endpoint '{}': {}", endpoint, e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::invalid_config(format!(
                "endpoint cannot be a base URL: {}",
                endpoint
            )));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("aml/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base,
            token: token.into(),
        })
    }

    /// Reads the bearer token from the variable named by `config.token_env`.
    pub fn from_config(config: &WorkspaceConfig) -> Result<Self> {
        let token = env::var(&config.token_env).map_err(|_| {
            Error::Auth(format!(
                "environment variable {} is not set",
                config.token_env
            ))
        })?;
        if token.trim().is_empty() {
            return Err(Error::Auth(format!(
                "environment variable {} is empty",
                config.token_env
            )));
        }
        Self::new(&config.endpoint, token)
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::invalid_config(format!("endpoint cannot be a base URL: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn workspace_url(&self, workspace: &Workspace, rest: &[&str]) -> Result<Url> {
        let mut segments = vec![
            "subscriptions",
            workspace.subscription_id.as_str(),
            "resourceGroups",
            workspace.resource_group.as_str(),
            "workspaces",
            workspace.name.as_str(),
        ];
        segments.extend_from_slice(rest);
        self.url(&segments)
    }

    fn run_url(&self, workspace: &Workspace, run: &RunHandle, rest: &[&str]) -> Result<Url> {
        let mut segments = vec![
            "experiments",
            run.experiment_name.as_str(),
            "runs",
            run.run_id.as_str(),
        ];
        segments.extend_from_slice(rest);
        self.workspace_url(workspace, &segments)
    }

    fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.bearer_auth(&self.token).send()?;
        debug!(url = %response.url(), status = response.status().as_u16(), "platform response");
        Ok(response)
    }

    fn get_json<T: DeserializeOwned>(&self, url: Url, kind: &'static str, name: &str) -> Result<T> {
        let response = self.send(self.client.get(url))?;
        if !response.status().is_success() {
            let (status, message) = read_error(response);
            return Err(map_status(status, message, kind, name));
        }
        Ok(response.json()?)
    }
}

/// Pulls `error.message` out of an error body, falling back to the raw text.
fn read_error(response: Response) -> (u16, String) {
    let status = response.status().as_u16();
    let text = response.text().unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.pointer("/message"))
                .and_then(|m| m.as_str())
                .map(|m| m.to_string())
        })
        .unwrap_or_else(|| {
            if text.is_empty() {
                format!("HTTP {}", status)
            } else {
                text
            }
        });
    (status, message)
}

fn map_status(status: u16, message: String, kind: &'static str, name: &str) -> Error {
    match status {
        401 | 403 => Error::Auth(message),
        404 => Error::NotFound {
            kind,
            name: name.to_string(),
        },
        _ => Error::Api { status, message },
    }
}

impl Platform for HttpPlatform {
    fn get_workspace(&self, config: &WorkspaceConfig) -> Result<Workspace> {
        let url = self.url(&[
            "subscriptions",
            config.subscription_id.as_str(),
            "resourceGroups",
            config.resource_group.as_str(),
            "workspaces",
            config.workspace_name.as_str(),
        ])?;
        let response: WorkspaceResponse = self
            .get_json(url, "workspace", &config.workspace_name)
            .map_err(|e| match e {
                Error::NotFound { name, .. } => {
                    Error::Workspace(format!("workspace '{}' not found", name))
                }
                other => other,
            })?;
        Ok(Workspace {
            id: response.id,
            name: response.name,
            subscription_id: config.subscription_id.clone(),
            resource_group: config.resource_group.clone(),
            location: response.location.unwrap_or_default(),
        })
    }

    fn get_compute(&self, workspace: &Workspace, name: &str) -> Result<Option<ComputeTarget>> {
        let url = self.workspace_url(workspace, &["computes", name])?;
        match self.get_json(url, "compute", name) {
            Ok(target) => Ok(Some(target)),
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_compute(&self, workspace: &Workspace, spec: &ComputeSpec) -> Result<ComputeTarget> {
        let url = self.workspace_url(workspace, &["computes", spec.name.as_str()])?;
        let response = self.send(self.client.put(url).json(spec))?;
        if !response.status().is_success() {
            let (status, message) = read_error(response);
            return Err(match status {
                409 | 429 => Error::Provisioning {
                    name: spec.name.clone(),
                    message,
                },
                _ => map_status(status, message, "compute", &spec.name),
            });
        }
        Ok(response.json()?)
    }

    fn get_dataset(
        &self,
        workspace: &Workspace,
        name: &str,
        version: Option<&str>,
    ) -> Result<TabularDataset> {
        let mut url = self.workspace_url(workspace, &["datasets", name])?;
        if let Some(version) = version {
            url.query_pairs_mut().append_pair("version", version);
        }
        self.get_json(url, "dataset", name)
    }

    fn submit_run(
        &self,
        workspace: &Workspace,
        experiment: &str,
        config: &AutoMlConfig,
    ) -> Result<RunHandle> {
        let url = self.workspace_url(workspace, &["experiments", experiment, "runs"])?;
        let response = self.send(self.client.post(url).json(config))?;
        if !response.status().is_success() {
            let (status, message) = read_error(response);
            return Err(match status {
                400 | 422 => Error::SubmissionRejected(message),
                _ => map_status(status, message, "experiment", experiment),
            });
        }
        let submitted: SubmitResponse = response.json()?;
        Ok(RunHandle {
            run_id: submitted.run_id,
            experiment_name: experiment.to_string(),
            status: submitted.status,
            portal_url: submitted.portal_url,
        })
    }

    fn get_run(&self, workspace: &Workspace, run: &RunHandle) -> Result<RunDetails> {
        let url = self.run_url(workspace, run, &[])?;
        self.get_json(url, "run", &run.run_id)
    }

    fn list_child_runs(&self, workspace: &Workspace, run: &RunHandle) -> Result<Vec<ChildRun>> {
        let url = self.run_url(workspace, run, &["children"])?;
        let list: ListResponse<ChildRun> = self.get_json(url, "run", &run.run_id)?;
        Ok(list.value)
    }

    fn get_best_child(
        &self,
        workspace: &Workspace,
        run: &RunHandle,
        metric: Option<&str>,
    ) -> Result<BestOutput> {
        let mut url = self.run_url(workspace, run, &["best"])?;
        if let Some(metric) = metric {
            url.query_pairs_mut().append_pair("metric", metric);
        }
        self.get_json(url, "best child run", &run.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{papers_config, test_workspace, test_workspace_config};
    use std::io::Read;
    use std::thread;
    use tiny_http::{Response as HttpResponse, Server};

    struct Seen {
        method: String,
        url: String,
        auth: Option<String>,
        body: String,
    }

    /// Serves one scripted response per request, in order.
    fn serve(script: Vec<(u16, &'static str)>) -> (String, thread::JoinHandle<Vec<Seen>>) {
        let server = Server::http("127.0.0.1:0").expect("bind loopback");
        let addr = server.server_addr().to_ip().expect("ip listener");
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for (status, body) in script {
                let mut request = server.recv().expect("request");
                let mut payload = String::new();
                let _ = request.as_reader().read_to_string(&mut payload);
                seen.push(Seen {
                    method: request.method().to_string(),
                    url: request.url().to_string(),
                    auth: request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv("Authorization"))
                        .map(|h| h.value.as_str().to_string()),
                    body: payload,
                });
                request
                    .respond(HttpResponse::from_string(body).with_status_code(status))
                    .expect("respond");
            }
            seen
        });
        (format!("http://{}", addr), handle)
    }

    #[test]
    fn absent_compute_maps_to_none() {
        let (endpoint, server) = serve(vec![(404, r#"{"error":{"message":"not found"}}"#)]);
        let platform = HttpPlatform::new(&endpoint, "tok").expect("client");
        let found = platform
            .get_compute(&test_workspace(), "cpu-cluster")
            .expect("lookup");
        assert!(found.is_none());

        let seen = server.join().expect("server thread");
        assert_eq!(seen[0].method, "GET");
        assert_eq!(
            seen[0].url,
            "/subscriptions/sub-123/resourceGroups/ml-rg/workspaces/papers-ws/computes/cpu-cluster"
        );
        assert_eq!(seen[0].auth.as_deref(), Some("Bearer tok"));
    }

    #[test]
    fn create_compute_sends_spec_and_maps_quota_errors() {
        let (endpoint, server) = serve(vec![(
            429,
            r#"{"error":{"message":"quota exceeded for STANDARD_D2_V2"}}"#,
        )]);
        let platform = HttpPlatform::new(&endpoint, "tok").expect("client");
        let spec = ComputeSpec {
            name: "cpu-cluster".to_string(),
            vm_size: "STANDARD_D2_V2".to_string(),
            min_nodes: 0,
            max_nodes: 4,
            idle_seconds_before_scaledown: None,
        };
        let err = platform
            .create_compute(&test_workspace(), &spec)
            .expect_err("quota");
        match err {
            Error::Provisioning { message, .. } => assert!(message.contains("quota exceeded")),
            other => panic!("unexpected error: {}", other),
        }
        let seen = server.join().expect("server thread");
        assert_eq!(seen[0].method, "PUT");
        let body: Value = serde_json::from_str(&seen[0].body).expect("json body");
        assert_eq!(body["max_nodes"], 4);
        assert!(body.get("idle_seconds_before_scaledown").is_none());
    }

    #[test]
    fn create_compute_maps_conflict_to_provisioning_and_bad_request_to_api() {
        let (endpoint, server) = serve(vec![
            (409, r#"{"error":{"message":"compute name in use"}}"#),
            (400, r#"{"error":{"message":"unknown vm size"}}"#),
        ]);
        let platform = HttpPlatform::new(&endpoint, "tok").expect("client");
        let spec = ComputeSpec {
            name: "cpu-cluster".to_string(),
            vm_size: "STANDARD_D2_V2".to_string(),
            min_nodes: 0,
            max_nodes: 4,
            idle_seconds_before_scaledown: Some(120),
        };

        let err = platform
            .create_compute(&test_workspace(), &spec)
            .expect_err("conflict");
        assert!(matches!(err, Error::Provisioning { .. }), "unexpected: {}", err);

        let err = platform
            .create_compute(&test_workspace(), &spec)
            .expect_err("bad request");
        match err {
            Error::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "unknown vm size");
            }
            other => panic!("unexpected error: {}", other),
        }
        server.join().expect("server thread");
    }

    #[test]
    fn rejected_submission_surfaces_platform_message() {
        let (endpoint, server) = serve(vec![(
            400,
            r#"{"error":{"message":"label column not found"}}"#,
        )]);
        let platform = HttpPlatform::new(&endpoint, "tok").expect("client");
        let err = platform
            .submit_run(&test_workspace(), "papers-automl", &papers_config())
            .expect_err("rejected");
        match err {
            Error::SubmissionRejected(message) => assert_eq!(message, "label column not found"),
            other => panic!("unexpected error: {}", other),
        }
        let seen = server.join().expect("server thread");
        assert_eq!(seen[0].method, "POST");
        assert!(seen[0].url.ends_with("/experiments/papers-automl/runs"));
        let body: Value = serde_json::from_str(&seen[0].body).expect("json body");
        assert_eq!(body["label_column_name"], "cluster");
        assert_eq!(body["n_cross_validations"], 5);
    }

    #[test]
    fn unauthorized_workspace_is_an_auth_error() {
        let (endpoint, server) = serve(vec![(401, "")]);
        let platform = HttpPlatform::new(&endpoint, "expired").expect("client");
        let err = platform
            .get_workspace(&test_workspace_config())
            .expect_err("unauthorized");
        assert!(matches!(err, Error::Auth(_)), "unexpected: {}", err);
        server.join().expect("server thread");
    }

    #[test]
    fn run_lifecycle_calls_parse_platform_payloads() {
        let (endpoint, server) = serve(vec![
            (
                201,
                r#"{"run_id":"AutoML_42","status":"NotStarted","portal_url":"https://portal/runs/AutoML_42"}"#,
            ),
            (200, r#"{"run_id":"AutoML_42","status":"Completed"}"#),
            (
                200,
                r#"{"value":[{"run_id":"AutoML_42_0","status":"Completed","algorithm":"LightGBM","metrics":{"accuracy":0.88}}]}"#,
            ),
            (
                200,
                r#"{"run":{"run_id":"AutoML_42_0","status":"Completed","algorithm":"LightGBM","metrics":{"accuracy":0.88}},"model":{"name":"AutoML42best","algorithm":"LightGBM","uri":"azureml://models/AutoML42best/1"}}"#,
            ),
        ]);
        let platform = HttpPlatform::new(&endpoint, "tok").expect("client");
        let ws = test_workspace();

        let run = platform
            .submit_run(&ws, "papers-automl", &papers_config())
            .expect("submit");
        assert_eq!(run.run_id, "AutoML_42");
        assert_eq!(run.experiment_name, "papers-automl");

        let details = platform.get_run(&ws, &run).expect("status");
        assert_eq!(details.status, RunStatus::Completed);

        let children = platform.list_child_runs(&ws, &run).expect("children");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].algorithm.as_deref(), Some("LightGBM"));

        let best = platform
            .get_best_child(&ws, &run, Some("accuracy"))
            .expect("best");
        assert_eq!(best.model.name, "AutoML42best");

        let seen = server.join().expect("server thread");
        assert!(seen[1].url.ends_with("/experiments/papers-automl/runs/AutoML_42"));
        assert!(seen[2].url.ends_with("/runs/AutoML_42/children"));
        assert!(seen[3].url.ends_with("/runs/AutoML_42/best?metric=accuracy"));
    }

    #[test]
    fn dataset_version_is_sent_as_query() {
        let (endpoint, server) = serve(vec![(
            200,
            r#"{"id":"ds-1","name":"papers","version":"3","columns":["sha","cluster"],"row_count":10}"#,
        )]);
        let platform = HttpPlatform::new(&endpoint, "tok").expect("client");
        let ds = platform
            .get_dataset(&test_workspace(), "papers", Some("3"))
            .expect("dataset");
        assert_eq!(ds.version, "3");
        assert!(ds.dropped_columns.is_empty());
        let seen = server.join().expect("server thread");
        assert!(seen[0].url.ends_with("/datasets/papers?version=3"));
    }

    #[test]
    fn missing_token_variable_is_an_auth_error() {
        let mut config = test_workspace_config();
        config.token_env = "AML_TOKEN_FOR_TEST_THAT_IS_NEVER_SET".to_string();
        let err = HttpPlatform::from_config(&config).err().expect("no token");
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn endpoint_must_be_a_base_url() {
        assert!(HttpPlatform::new("not a url", "tok").is_err());
        assert!(HttpPlatform::new("mailto:ops@example.com", "tok").is_err());
    }
}
