use anyhow::Result;
use aml_runner::{
    best_output_if_complete, get_best_output, load_job_file, parse_set_bindings,
    resolve_compute, resolve_workspace, run_job, BestOutput, ComputeTarget, HttpPlatform, JobFile,
    JobOutcome, RunHandle, RunOptions, RunStatus, JOB_FILE_TEMPLATE,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "aml", version, about = "Automated model-selection job client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a job file template.
    Init {
        #[arg(long, default_value = "automl.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    /// Load and validate a job file without contacting the platform.
    Describe {
        job: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Resolve the workspace and the compute target only.
    Compute {
        job: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Provision, submit, and (by default) wait for the best model.
    Run {
        job: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        no_wait: bool,
        #[arg(long)]
        show_output: bool,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Fetch the best child run and model of an existing run.
    Best {
        job: PathBuf,
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        metric: Option<String>,
        #[arg(long)]
        no_wait: bool,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<aml_runner::Error>()
                    .map(|e| e.code())
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_job(job: &Path, set_values: &[String]) -> Result<JobFile> {
    let overrides = parse_set_bindings(set_values)?;
    Ok(load_job_file(job, &overrides)?)
}

fn connect(job: &JobFile) -> Result<HttpPlatform> {
    let config = job.workspace_config()?;
    Ok(HttpPlatform::from_config(&config)?)
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Init { path, force, json } => {
            if !force && path.exists() {
                return Err(anyhow::anyhow!(
                    "job file already exists (use --force): {}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, JOB_FILE_TEMPLATE)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "init",
                    "path": path.display().to_string(),
                })));
            }
            println!("wrote: {}", path.display());
            println!("next: edit {} and fill in all fields marked REQUIRED", path.display());
            println!("next: aml describe {}", path.display());
        }
        Commands::Describe {
            job,
            set_values,
            json,
        } => {
            let job = load_job(&job, &set_values)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "job": job_to_json(&job),
                })));
            }
            print_job(&job);
        }
        Commands::Compute {
            job,
            set_values,
            json,
        } => {
            let job = load_job(&job, &set_values)?;
            let platform = connect(&job)?;
            let workspace = resolve_workspace(&platform, &job.workspace_config()?)?;
            let wait = job.provisioning_wait()?;
            let target = resolve_compute(&platform, &workspace, &job.compute, &wait)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "compute",
                    "workspace": workspace.name,
                    "compute": compute_to_json(&target),
                })));
            }
            println!("workspace: {}", workspace.name);
            print_compute(&target);
        }
        Commands::Run {
            job,
            set_values,
            no_wait,
            show_output,
            out,
            json,
        } => {
            let job = load_job(&job, &set_values)?;
            let platform = connect(&job)?;
            let options = RunOptions {
                wait: !no_wait,
                show_output,
            };
            let outcome = run_job(&platform, &job, &options)?;
            if let Some(out) = &out {
                write_outcome(out, &outcome)?;
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "outcome": outcome_to_json(&outcome),
                    "out": out.as_ref().map(|p| p.display().to_string()),
                })));
            }
            print_outcome(&outcome);
            if let Some(out) = &out {
                println!("out: {}", out.display());
            }
        }
        Commands::Best {
            job,
            run_id,
            metric,
            no_wait,
            set_values,
            json,
        } => {
            let job = load_job(&job, &set_values)?;
            let platform = connect(&job)?;
            let workspace = resolve_workspace(&platform, &job.workspace_config()?)?;
            let run = RunHandle {
                run_id,
                experiment_name: job.experiment.name.clone(),
                status: RunStatus::Unknown,
                portal_url: None,
            };
            let best = if no_wait {
                best_output_if_complete(&platform, &workspace, &run, metric.as_deref())?
            } else {
                get_best_output(
                    &platform,
                    &workspace,
                    &run,
                    &job.run_wait()?,
                    metric.as_deref(),
                )?
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "best",
                    "run_id": run.run_id,
                    "best": best_to_json(&best),
                })));
            }
            println!("run_id: {}", run.run_id);
            print_best(&best);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Init { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Compute { json, .. }
        | Commands::Run { json, .. }
        | Commands::Best { json, .. } => *json,
    }
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("outcome");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_outcome(path: &Path, outcome: &JobOutcome) -> Result<()> {
    let payload = json!({
        "schema_version": "aml_outcome_v1",
        "written_at": Utc::now().to_rfc3339(),
        "outcome": outcome_to_json(outcome),
    });
    atomic_write_bytes(path, &serde_json::to_vec_pretty(&payload)?)
}

fn job_to_json(job: &JobFile) -> Value {
    json!({
        "workspace": {
            "endpoint": job.workspace.endpoint,
            "workspace_name": job.workspace.workspace_name,
            "config_path": job.workspace.config_path,
            "token_env": job.workspace.token_env,
        },
        "compute": job.compute,
        "dataset": job.dataset,
        "experiment": job.experiment.name,
        "job": job.job,
        "wait": job.wait,
    })
}

fn compute_to_json(target: &ComputeTarget) -> Value {
    json!({
        "name": target.name,
        "vm_size": target.vm_size,
        "min_nodes": target.min_nodes,
        "max_nodes": target.max_nodes,
        "provisioning_state": target.provisioning_state.as_str(),
    })
}

fn best_to_json(best: &BestOutput) -> Value {
    json!({
        "run_id": best.run.run_id,
        "algorithm": best.run.algorithm,
        "metrics": best.run.metrics,
        "model": best.model,
    })
}

fn outcome_to_json(outcome: &JobOutcome) -> Value {
    json!({
        "workspace": outcome.workspace.name,
        "compute": compute_to_json(&outcome.compute),
        "dataset": {
            "name": outcome.dataset.name,
            "version": outcome.dataset.version,
            "columns": outcome.dataset.columns,
            "dropped_columns": outcome.dataset.dropped_columns,
        },
        "run": outcome.run,
        "status": outcome.details.as_ref().map(|d| d.status.as_str()),
        "best": outcome.best.as_ref().map(best_to_json),
    })
}

fn print_job(job: &JobFile) {
    println!("endpoint: {}", job.workspace.endpoint);
    match &job.workspace.config_path {
        Some(path) => println!("workspace_config: {}", path),
        None => println!(
            "workspace: {}",
            job.workspace.workspace_name.as_deref().unwrap_or("")
        ),
    }
    println!(
        "compute: {} ({}, {}..{} nodes)",
        job.compute.name, job.compute.vm_size, job.compute.min_nodes, job.compute.max_nodes
    );
    println!("dataset: {}", job.dataset.name);
    if !job.dataset.drop_columns.is_empty() {
        println!("drop_columns: {}", job.dataset.drop_columns.join(", "));
    }
    println!("experiment: {}", job.experiment.name);
    println!("task: {}", job.job.task);
    println!("primary_metric: {}", job.job.primary_metric);
    println!("label_column_name: {}", job.job.label_column_name);
    if let Some(folds) = job.job.n_cross_validations {
        println!("n_cross_validations: {}", folds);
    }
    if let Some(hours) = job.job.experiment_timeout_hours {
        println!("experiment_timeout_hours: {}", hours);
    }
    if let Some(limit) = job.job.max_concurrent_iterations {
        println!("max_concurrent_iterations: {}", limit);
    }
    if let Some(minutes) = job.job.iteration_timeout_minutes {
        println!("iteration_timeout_minutes: {}", minutes);
    }
    println!(
        "provisioning_timeout_minutes: {}",
        job.wait.provisioning_timeout_minutes
    );
    println!("run_timeout_minutes: {}", job.wait.run_timeout_minutes);
}

fn print_compute(target: &ComputeTarget) {
    println!("compute: {}", target.name);
    println!("vm_size: {}", target.vm_size);
    println!("nodes: {}..{}", target.min_nodes, target.max_nodes);
    println!("state: {}", target.provisioning_state.as_str());
}

fn print_best(best: &BestOutput) {
    println!("best_run: {}", best.run.run_id);
    if let Some(algorithm) = &best.run.algorithm {
        println!("algorithm: {}", algorithm);
    }
    for (name, value) in &best.run.metrics {
        println!("metric.{}: {}", name, value);
    }
    println!("model: {}", best.model.name);
    println!("model_uri: {}", best.model.uri);
}

fn print_outcome(outcome: &JobOutcome) {
    println!("workspace: {}", outcome.workspace.name);
    print_compute(&outcome.compute);
    println!("dataset: {}", outcome.dataset.name);
    println!("columns: {}", outcome.dataset.columns.len());
    println!("experiment: {}", outcome.run.experiment_name);
    println!("run_id: {}", outcome.run.run_id);
    if let Some(url) = &outcome.run.portal_url {
        println!("portal_url: {}", url);
    }
    if let Some(details) = &outcome.details {
        println!("status: {}", details.status.as_str());
    }
    if let Some(best) = &outcome.best {
        print_best(best);
    }
}
