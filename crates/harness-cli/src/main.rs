use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harness_aggregate::{AggregateOptions, AggregateSummary, RunSelector};
use harness_runner::{
    Harness, ModelRegistry, RunReport, RunRequest, RunStatus, StopSignal, DEFAULT_INPUT_DIR,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "harness", version, about = "Run models and aggregate their results")]
struct Cli {
    /// Log debug output to the console.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one model run.
    Run {
        #[arg(long)]
        model_path: PathBuf,
        #[arg(long)]
        output_path: PathBuf,
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        project: String,
        /// Input directory, relative to the project directory.
        #[arg(long, default_value = DEFAULT_INPUT_DIR)]
        input_dir: String,
        #[arg(long)]
        param_file: PathBuf,
        /// Write the interpreter variables but do not start the interpreter.
        #[arg(long)]
        dry_run: bool,
        #[arg(long, env = "HARNESS_INTERPRETER")]
        interpreter: Option<String>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Copy the output files of finished runs into one directory.
    Aggregate {
        /// Comma-separated run ids, or `*` for every run.
        #[arg(long)]
        run_ids: String,
        #[arg(long)]
        output_dir: PathBuf,
        /// Directory holding the run output directories [default: $HOME/harness/outputdata]
        #[arg(long, env = "HARNESS_OUTPUT_ROOT")]
        source_root: Option<PathBuf>,
        #[arg(long)]
        create_output_dir: bool,
        #[arg(long)]
        json: bool,
    },
}

struct CommandOutput {
    payload: Option<Value>,
    success: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(output) => {
            if let Some(payload) = &output.payload {
                emit_json(payload);
            }
            if output.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
            } else {
                eprintln!("error: {:#}", err);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

fn run_command(command: Commands) -> Result<CommandOutput> {
    match command {
        Commands::Run {
            model_path,
            output_path,
            run_id,
            project,
            input_dir,
            param_file,
            dry_run,
            interpreter,
            seed,
            json,
        } => {
            let mut req = RunRequest::new(model_path, output_path, run_id, project, param_file);
            req.input_dir = input_dir;
            req.dry_run = dry_run;
            req.interpreter = interpreter;
            req.seed = seed;

            let stop = StopSignal::new();
            stop.install_handlers()
                .context("installing termination signal handlers")?;
            let harness = Harness::new(ModelRegistry::with_builtins()).with_stop_signal(stop);
            let report = harness.execute(&req);
            let success = report.status == RunStatus::Succeeded;
            if json {
                return Ok(CommandOutput {
                    payload: Some(json!({
                        "ok": success,
                        "command": "run",
                        "run": run_report_to_json(&report, &req),
                    })),
                    success,
                });
            }
            println!("run_id: {}", report.run_id);
            println!("status: {}", report.status.as_str());
            if let Some(dir) = &report.output_dir {
                println!("output_dir: {}", dir.display());
            }
            if let Some(error) = &report.error {
                println!("error: {}", error);
            }
            Ok(CommandOutput {
                payload: None,
                success,
            })
        }
        Commands::Aggregate {
            run_ids,
            output_dir,
            source_root,
            create_output_dir,
            json,
        } => {
            let selector: RunSelector = run_ids
                .parse()
                .with_context(|| format!("invalid run id list `{}`", run_ids))?;
            let source_root = source_root.unwrap_or_else(harness_aggregate::default_source_root);
            let summary = harness_aggregate::aggregate(
                &selector,
                &source_root,
                &output_dir,
                AggregateOptions { create_output_dir },
            )
            .with_context(|| format!("aggregating runs from {}", source_root.display()))?;
            if json {
                return Ok(CommandOutput {
                    payload: Some(json!({
                        "ok": true,
                        "command": "aggregate",
                        "summary": aggregate_summary_to_json(&summary, &output_dir),
                    })),
                    success: true,
                });
            }
            println!("runs_copied: {}", summary.runs.len());
            println!("files_copied: {}", summary.files_copied);
            println!("output_dir: {}", output_dir.display());
            Ok(CommandOutput {
                payload: None,
                success: true,
            })
        }
    }
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
        Commands::Run { json, .. } | Commands::Aggregate { json, .. } => *json,
    }
}

fn run_report_to_json(report: &RunReport, req: &RunRequest) -> Value {
    json!({
        "run_id": report.run_id,
        "project": req.project,
        "status": report.status,
        "runner": report.runner,
        "output_dir": report.output_dir.as_ref().map(|d| d.display().to_string()),
        "elapsed_seconds": report.elapsed.as_secs_f64(),
        "dry_run": req.dry_run,
        "error": report.error,
    })
}

fn aggregate_summary_to_json(summary: &AggregateSummary, output_dir: &std::path::Path) -> Value {
    json!({
        "runs": summary.runs,
        "files_copied": summary.files_copied,
        "output_dir": output_dir.display().to_string(),
    })
}
