use chrono::{DateTime, Utc};
use harness_core::layout::{PARAMETERS_SNAPSHOT_FILE, RUN_LOG_FILE, RUN_MANIFEST_FILE};
use harness_core::{
    atomic_write_json_pretty, ensure_dir, sha256_file, HarnessError, Parameters, Result,
    WildcardContext,
};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::embedded::EmbeddedRunner;
use crate::external::ExternalRunner;
use crate::logger::RunLogger;
use crate::model::ModelRegistry;
use crate::native::NativeRunner;
use crate::output::RunOutputDir;
use crate::project::{project_dir, ProjectManifest};
use crate::runner::{Invocation, Runner, RunnerKind};
use crate::stop::StopSignal;

pub const DEFAULT_INPUT_DIR: &str = "input_data";
const RUN_MANIFEST_SCHEMA: &str = "run_manifest_v1";

/// One request to execute a model.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub model_path: PathBuf,
    pub output_path: PathBuf,
    pub run_id: String,
    pub project: String,
    /// Input directory, relative to the project directory.
    pub input_dir: String,
    pub param_file: PathBuf,
    pub dry_run: bool,
    /// Overrides the interpreter named by the project manifest.
    pub interpreter: Option<String>,
    pub seed: Option<u64>,
}

impl RunRequest {
    pub fn new(
        model_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        run_id: impl Into<String>,
        project: impl Into<String>,
        param_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            model_path: model_path.into(),
            output_path: output_path.into(),
            run_id: run_id.into(),
            project: project.into(),
            input_dir: DEFAULT_INPUT_DIR.to_string(),
            param_file: param_file.into(),
            dry_run: false,
            interpreter: None,
            seed: None,
        }
    }

    pub fn input_path(&self) -> PathBuf {
        project_dir(&self.model_path, &self.project).join(&self.input_dir)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Terminated,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Terminated => "terminated",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::Failed | RunStatus::Terminated => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub runner: Option<RunnerKind>,
    /// Where the run's directory ended up; `None` if it was never created.
    pub output_dir: Option<PathBuf>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl RunReport {
    pub fn exit_code(&self) -> u8 {
        self.status.exit_code()
    }

    fn not_started(req: &RunRequest, err: &HarnessError, elapsed: Duration) -> Self {
        tracing::warn!(run_id = %req.run_id, "run could not start: {}", err);
        Self {
            run_id: req.run_id.clone(),
            status: RunStatus::Failed,
            runner: None,
            output_dir: None,
            elapsed,
            error: Some(err.to_string()),
        }
    }
}

struct Plan {
    manifest: ProjectManifest,
    params: Parameters,
    input_path: PathBuf,
    project_dir: PathBuf,
}

/// Executes runs against a registry of native models and embedded engines.
#[derive(Debug, Clone, Default)]
pub struct Harness {
    registry: ModelRegistry,
    stop: StopSignal,
}

impl Harness {
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry,
            stop: StopSignal::new(),
        }
    }

    /// Shares `stop` with every external interpreter this harness starts.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Runs one model to completion. Never fails: every error ends up in the
    /// report, and in the run log when the run got far enough to have one.
    pub fn execute(&self, req: &RunRequest) -> RunReport {
        let clock = Instant::now();
        let started_at = Utc::now();

        let plan = match self.plan(req) {
            Ok(plan) => plan,
            Err(err) => return RunReport::not_started(req, &err, clock.elapsed()),
        };
        let (out, log) = match open_output(req) {
            Ok(pair) => pair,
            Err(err) => return RunReport::not_started(req, &err, clock.elapsed()),
        };

        let outcome = self.run_in(req, &plan, &out, &log);
        let elapsed = clock.elapsed();
        let (mut status, mut error) = match &outcome {
            Ok(()) => {
                log.info(format!("Run {} succeeded.", req.run_id));
                (RunStatus::Succeeded, None)
            }
            Err(err) if err.is_termination() => {
                log.warn(format!("Run {} was terminated: {}", req.run_id, err));
                (RunStatus::Terminated, Some(err.to_string()))
            }
            Err(err) => {
                log.warn(format!("Run {} failed: {}", req.run_id, err));
                if let Some(detail) = error_detail(err) {
                    log.debug(detail);
                }
                (RunStatus::Failed, Some(err.to_string()))
            }
        };

        let manifest = run_manifest(req, &plan, &out, status, started_at, elapsed);
        let manifest_path = out.metadata_path().join(RUN_MANIFEST_FILE);
        if let Err(err) = atomic_write_json_pretty(&manifest_path, &manifest) {
            log.warn(format!("could not write run manifest: {}", err));
        }

        let output_dir = match out.finish(status == RunStatus::Succeeded) {
            Ok(dest) => {
                log.debug(format!("run output is in {}", dest.display()));
                Some(dest)
            }
            Err(err) => {
                log.warn(format!("could not finalize output directory: {}", err));
                status = RunStatus::Failed;
                error = Some(err.to_string());
                None
            }
        };

        RunReport {
            run_id: req.run_id.clone(),
            status,
            runner: Some(plan.manifest.runner),
            output_dir,
            elapsed,
            error,
        }
    }

    fn plan(&self, req: &RunRequest) -> Result<Plan> {
        if req.run_id.trim().is_empty() {
            return Err(HarnessError::config("run id must not be empty"));
        }
        if req.project.trim().is_empty() {
            return Err(HarnessError::config("project name must not be empty"));
        }
        let manifest = ProjectManifest::load(&req.model_path, &req.project)?.unwrap_or_default();
        let loaded = Parameters::from_json_file(&req.param_file)?;
        let params = match &manifest.base_parameters {
            Some(base) => base.merge(&loaded),
            None => loaded,
        };
        Ok(Plan {
            input_path: req.input_path(),
            project_dir: project_dir(&req.model_path, &req.project),
            manifest,
            params,
        })
    }

    fn run_in(
        &self,
        req: &RunRequest,
        plan: &Plan,
        out: &RunOutputDir,
        log: &RunLogger,
    ) -> Result<()> {
        let wildcards = WildcardContext {
            run_id: req.run_id.clone(),
            model_path: req.model_path.clone(),
            output_path: out.path().to_path_buf(),
            output_metadata_path: out.metadata_path(),
        };
        let params = plan.params.replace_wildcards(&wildcards);
        params.to_json_file(&out.metadata_path().join(PARAMETERS_SNAPSHOT_FILE))?;
        let work_dir = out.work_path();
        ensure_dir(&work_dir)?;

        let runner = self.build_runner(req, plan, &work_dir)?;

        log.debug("=".repeat(60));
        log.info(format!(
            "Executing run: {} (project {}, {} runner)",
            req.run_id,
            req.project,
            runner.kind().as_str()
        ));
        log.debug(format!("Outputting temporary files to {}", out.path().display()));
        log.debug("=".repeat(60));

        let inv = Invocation {
            model_path: &req.model_path,
            input_path: &plan.input_path,
            output_path: out.path(),
            run_id: &req.run_id,
            flags: &plan.manifest.flags,
        };
        let start = Instant::now();
        let result = runner.run(&inv, &params, log);
        log.info(format_elapsed(start.elapsed()));
        result
    }

    fn build_runner(
        &self,
        req: &RunRequest,
        plan: &Plan,
        work_dir: &Path,
    ) -> Result<Box<dyn Runner>> {
        let manifest = &plan.manifest;
        let interpreter = req
            .interpreter
            .clone()
            .or_else(|| manifest.interpreter.clone());
        let script_root = manifest.resolved_script_root(&plan.project_dir);
        let mut external = ExternalRunner::new(work_dir)
            .with_script_root(&script_root)
            .with_dry_run(req.dry_run)
            .with_seed(req.seed)
            .with_stop_signal(self.stop.clone());
        if let Some(interpreter) = interpreter {
            external = external.with_interpreter(interpreter);
        }

        match manifest.runner {
            RunnerKind::External => match &manifest.script {
                Some(script) => Ok(Box::new(external.with_script(script))),
                None => Ok(Box::new(external)),
            },
            RunnerKind::Native => {
                let name = manifest.model_name(&req.project);
                let factory = self.registry.resolve(&req.project, name).ok_or_else(|| {
                    HarnessError::config(format!(
                        "no native model named `{}` is registered for project {}",
                        name, req.project
                    ))
                })?;
                Ok(Box::new(
                    NativeRunner::new(name, factory)
                        .with_seed(req.seed)
                        .with_external(external),
                ))
            }
            RunnerKind::Embedded => {
                let (Some(engine_name), Some(entry)) = (&manifest.engine, &manifest.entry) else {
                    return Err(HarnessError::config(
                        "embedded runner needs both `engine` and `entry`",
                    ));
                };
                let engine = self.registry.engine(engine_name).ok_or_else(|| {
                    HarnessError::config(format!("no script engine named `{}`", engine_name))
                })?;
                Ok(Box::new(
                    EmbeddedRunner::new(engine, entry.clone()).with_script_root(script_root),
                ))
            }
        }
    }
}

fn open_output(req: &RunRequest) -> Result<(RunOutputDir, RunLogger)> {
    let out = RunOutputDir::begin(&req.output_path)?;
    let log = RunLogger::with_log_file(&req.run_id, &out.metadata_path().join(RUN_LOG_FILE))?;
    Ok((out, log))
}

fn error_detail(err: &HarnessError) -> Option<String> {
    match err {
        HarnessError::ModelExecution(inner) => inner.detail(),
        HarnessError::Environment { source, .. } => Some(format!("{:?}", source)),
        HarnessError::Configuration(_) => None,
    }
}

fn run_manifest(
    req: &RunRequest,
    plan: &Plan,
    out: &RunOutputDir,
    status: RunStatus,
    started_at: DateTime<Utc>,
    elapsed: Duration,
) -> serde_json::Value {
    let snapshot = out.metadata_path().join(PARAMETERS_SNAPSHOT_FILE);
    let digest = sha256_file(&snapshot).ok();
    json!({
        "schema_version": RUN_MANIFEST_SCHEMA,
        "run_id": req.run_id,
        "project": req.project,
        "runner": plan.manifest.runner,
        "status": status,
        "model_path": req.model_path,
        "started_at": started_at.to_rfc3339(),
        "finished_at": Utc::now().to_rfc3339(),
        "elapsed_seconds": elapsed.as_secs_f64(),
        "dry_run": req.dry_run,
        "seed": req.seed,
        "parameters_digest": digest,
    })
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("Run took {} min(s) {} second(s)", secs / 60, secs % 60)
}
