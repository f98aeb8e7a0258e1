use harness_core::{ensure_dir, HarnessError, ModelExecutionError, Parameters, Result, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::logger::RunLogger;
use crate::runner::{Invocation, Runner, RunnerKind};
use crate::stop::{StopSignal, STOPPED_EXIT_CODE};

pub const DEFAULT_INTERPRETER: &str = "Rscript";
pub const VARIABLES_FILE: &str = "variables.R";
pub const LEASE_FILE: &str = ".harness.lock";

const STOP_POLL: Duration = Duration::from_millis(50);

/// Runs a model in a separate interpreter process.
///
/// The qualified parameters are handed over through `variables.R` in the
/// working directory. The directory is leased for the duration of a run, so
/// two runners pointed at the same directory cannot overwrite each other's
/// variables file.
#[derive(Debug, Clone)]
pub struct ExternalRunner {
    interpreter: String,
    working_dir: PathBuf,
    script: Option<String>,
    script_root: Option<PathBuf>,
    dry_run: bool,
    seed: Option<u64>,
    stop: Option<StopSignal>,
}

impl ExternalRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: DEFAULT_INTERPRETER.to_string(),
            working_dir: working_dir.into(),
            script: None,
            script_root: None,
            dry_run: false,
            seed: None,
            stop: None,
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Script passed to the interpreter after the invocation flags. A relative
    /// script is resolved against the script root.
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Defaults to the model path of each invocation.
    pub fn with_script_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.script_root = Some(root.into());
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Kill the interpreter when `stop` is raised and report the run as
    /// terminated.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn variables_path(&self) -> PathBuf {
        self.working_dir.join(VARIABLES_FILE)
    }

    fn command_for(&self, inv: &Invocation<'_>) -> Vec<String> {
        let mut command = Vec::with_capacity(inv.flags.len() + 2);
        command.push(self.interpreter.clone());
        command.extend(inv.flags.iter().cloned());
        if let Some(script) = &self.script {
            let root = self.script_root.as_deref().unwrap_or(inv.model_path);
            command.push(resolve_script(script, root));
        }
        command
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().is_some_and(StopSignal::is_requested)
    }
}

impl Runner for ExternalRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::External
    }

    fn run(&self, inv: &Invocation<'_>, params: &Parameters, log: &RunLogger) -> Result<()> {
        let qualified = params.qualify(inv.input_path, inv.output_path)?;
        ensure_dir(&self.working_dir)?;
        let _lease = WorkDirLease::acquire(&self.working_dir)?;

        let variables_path = self.variables_path();
        write_variables(&variables_path, &qualified)?;
        log.debug(format!(
            "wrote {} variables to {}",
            qualified.len(),
            variables_path.display()
        ));

        let command = self.command_for(inv);
        let command_line = shell_join(&command);
        if self.dry_run {
            log.debug(format!("dry run, would have run: {}", command_line));
            return Ok(());
        }
        if self.stop_requested() {
            log.warn(format!("stop requested, not starting `{}`", command_line));
            return Err(ModelExecutionError::Terminated {
                code: STOPPED_EXIT_CODE,
            }
            .into());
        }

        log.debug(format!("running: {}", command_line));
        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..]);
        cmd.current_dir(&self.working_dir);
        cmd.env("HARNESS_RUN_ID", inv.run_id);
        cmd.env("HARNESS_OUTPUT_PATH", inv.output_path);
        cmd.env("HARNESS_INPUT_PATH", inv.input_path);
        if let Some(seed) = self.seed {
            cmd.env("HARNESS_SEED", seed.to_string());
        }
        let finished = run_streaming(cmd, &command_line, log, self.stop.as_ref())?;
        if finished.stopped {
            log.warn(format!("stopped `{}` on request", command_line));
            return Err(ModelExecutionError::Terminated {
                code: STOPPED_EXIT_CODE,
            }
            .into());
        }
        match finished.status.code() {
            Some(0) => {
                log.debug(format!("`{}` completed successfully", command_line));
                Ok(())
            }
            Some(code) => Err(ModelExecutionError::NonZeroExit {
                command: command_line,
                code,
            }
            .into()),
            None => match termination_signal(&finished.status) {
                Some(sig) => {
                    log.warn(format!("`{}` was terminated by signal {}", command_line, sig));
                    Err(ModelExecutionError::Terminated { code: 128 + sig }.into())
                }
                None => Err(ModelExecutionError::Signalled {
                    command: command_line,
                }
                .into()),
            },
        }
    }
}

struct Finished {
    status: ExitStatus,
    /// The child was killed because a stop was requested.
    stopped: bool,
}

/// Spawns `cmd` with stderr folded into stdout and forwards each line to the
/// run log as it arrives. With a stop signal, a watcher thread kills the child
/// once the signal is raised.
fn run_streaming(
    mut cmd: Command,
    command_line: &str,
    log: &RunLogger,
    stop: Option<&StopSignal>,
) -> Result<Finished> {
    let spawn_err = |e| HarnessError::env(format!("spawning `{}`", command_line), e);
    let (reader, writer) = std::io::pipe().map_err(spawn_err)?;
    let err_writer = writer.try_clone().map_err(spawn_err)?;
    cmd.stdin(Stdio::null());
    cmd.stdout(writer);
    cmd.stderr(err_writer);

    let child = Arc::new(Mutex::new(cmd.spawn().map_err(spawn_err)?));
    // The command holds the parent's copies of the write end.
    drop(cmd);

    let exited = Arc::new(AtomicBool::new(false));
    let watcher = stop.cloned().map(|stop| {
        let child = Arc::clone(&child);
        let exited = Arc::clone(&exited);
        thread::spawn(move || {
            while !exited.load(Ordering::SeqCst) {
                if stop.is_requested() {
                    let _ = lock_child(&child).kill();
                    return true;
                }
                thread::sleep(STOP_POLL);
            }
            false
        })
    });

    let streamed = stream_lines(reader, command_line, log);
    let status = wait_child(&child, command_line);
    exited.store(true, Ordering::SeqCst);
    let stopped = watcher.is_some_and(|w| w.join().unwrap_or(false));
    streamed?;
    Ok(Finished {
        status: status?,
        stopped,
    })
}

fn stream_lines(reader: std::io::PipeReader, command_line: &str, log: &RunLogger) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| HarnessError::env(format!("reading output of `{}`", command_line), e))?;
        if n == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        log.debug(line.trim_end_matches(['\n', '\r']));
    }
}

/// Polls instead of blocking in `wait` so the watcher can take the lock.
fn wait_child(child: &Mutex<Child>, command_line: &str) -> Result<ExitStatus> {
    loop {
        let polled = lock_child(child)
            .try_wait()
            .map_err(|e| HarnessError::env(format!("waiting for `{}`", command_line), e))?;
        if let Some(status) = polled {
            return Ok(status);
        }
        thread::sleep(STOP_POLL);
    }
}

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Signals that mean the child was asked to go away rather than crashing.
#[cfg(unix)]
fn termination_signal(status: &ExitStatus) -> Option<i32> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGKILL, SIGQUIT, SIGTERM};
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .filter(|sig| [SIGHUP, SIGINT, SIGKILL, SIGQUIT, SIGTERM].contains(sig))
}

#[cfg(not(unix))]
fn termination_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn write_variables(path: &Path, qualified: &BTreeMap<String, Value>) -> Result<()> {
    let context = || format!("writing {}", path.display());
    let mut file = fs::File::create(path).map_err(|e| HarnessError::env(context(), e))?;
    file.write_all(render_variables(qualified).as_bytes())
        .and_then(|_| file.flush())
        .and_then(|_| file.sync_all())
        .map_err(|e| HarnessError::env(context(), e))
}

pub fn render_variables(qualified: &BTreeMap<String, Value>) -> String {
    let mut out = String::new();
    for (name, value) in qualified {
        out.push_str(&r_name(name));
        out.push_str(" <- ");
        out.push_str(&r_literal(value));
        out.push('\n');
    }
    out
}

fn r_literal(value: &Value) -> String {
    match value {
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Text(s) => {
            let mut quoted = String::with_capacity(s.len() + 2);
            quoted.push('"');
            for c in s.chars() {
                match c {
                    '\\' => quoted.push_str("\\\\"),
                    '"' => quoted.push_str("\\\""),
                    '\n' => quoted.push_str("\\n"),
                    other => quoted.push(other),
                }
            }
            quoted.push('"');
            quoted
        }
        other => other.to_string(),
    }
}

const R_RESERVED: &[&str] = &[
    "if", "else", "repeat", "while", "function", "for", "in", "next", "break", "TRUE", "FALSE",
    "NULL", "Inf", "NaN", "NA",
];

fn r_name(name: &str) -> String {
    let mut chars = name.chars();
    let syntactic = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => true,
        Some('.') => !name[1..].starts_with(|c: char| c.is_ascii_digit()),
        _ => false,
    } && name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
    if syntactic && !R_RESERVED.contains(&name) {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

struct WorkDirLease {
    path: PathBuf,
}

impl WorkDirLease {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LEASE_FILE);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(WorkDirLease { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(HarnessError::config(format!(
                    "working directory {} is in use by another run (lease file {})",
                    dir.display(),
                    path.display()
                )))
            }
            Err(e) => Err(HarnessError::env(
                format!("creating lease {}", path.display()),
                e,
            )),
        }
    }
}

impl Drop for WorkDirLease {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn resolve_script(script: &str, root: &Path) -> String {
    let path = Path::new(script);
    if path.is_absolute() {
        return script.to_string();
    }
    normalize_path(&root.join(path)).to_string_lossy().into_owned()
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub(crate) fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_core::layout::RUN_LOG_FILE;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "harness_external_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn sample_params() -> Parameters {
        let mut vars = BTreeMap::new();
        vars.insert("a".to_string(), Value::Integer(1));
        vars.insert("b".to_string(), Value::from("x"));
        vars.insert("c".to_string(), Value::Bool(true));
        Parameters::from_variables(vars)
    }

    fn invoke(
        runner: &ExternalRunner,
        root: &Path,
        flags: &[String],
        params: &Parameters,
        log: &RunLogger,
    ) -> Result<()> {
        let input = root.join("input");
        let output = root.join("output");
        let inv = Invocation {
            model_path: root,
            input_path: &input,
            output_path: &output,
            run_id: "7",
            flags,
        };
        runner.run(&inv, params, log)
    }

    #[test]
    fn dry_run_writes_variables_without_spawning() {
        let root = temp_dir("dry");
        let work = root.join("work");
        let marker = root.join("spawned");
        let runner = ExternalRunner::new(&work)
            .with_interpreter("sh")
            .with_dry_run(true);
        let flags = vec!["-c".to_string(), format!("touch {}", marker.display())];
        invoke(&runner, &root, &flags, &sample_params(), &RunLogger::new("7"))
            .expect("dry run");

        let text = fs::read_to_string(work.join(VARIABLES_FILE)).expect("variables file");
        assert_eq!(text, "a <- 1\nb <- \"x\"\nc <- TRUE\n");
        assert!(!marker.exists());
        assert!(!work.join(LEASE_FILE).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn qualified_file_paths_are_written_absolute() {
        let mut inputs = BTreeMap::new();
        inputs.insert("grid".to_string(), "grid.csv".to_string());
        let params = Parameters::new(BTreeMap::new(), inputs, BTreeMap::new()).unwrap();
        let mut qualified = params
            .qualify(Path::new("/data/in"), Path::new("/data/out"))
            .unwrap();
        qualified.insert("flag".to_string(), Value::Bool(false));
        qualified.insert("my var".to_string(), Value::from("a\"b\\c"));
        let text = render_variables(&qualified);
        assert!(text.contains("flag <- FALSE\n"), "{text}");
        assert!(text.contains("grid <- \"/data/in/grid.csv\"\n"), "{text}");
        assert!(text.contains("`my var` <- \"a\\\"b\\\\c\"\n"), "{text}");
    }

    #[cfg(unix)]
    #[test]
    fn zero_exit_succeeds_and_streams_output() {
        let root = temp_dir("ok");
        let log_path = root.join(RUN_LOG_FILE);
        let log = RunLogger::with_log_file("7", &log_path).unwrap();
        let runner = ExternalRunner::new(root.join("work")).with_interpreter("sh");
        let flags = vec![
            "-c".to_string(),
            "echo out-line; echo err-line >&2; echo run=$HARNESS_RUN_ID".to_string(),
        ];
        invoke(&runner, &root, &flags, &sample_params(), &log).expect("run succeeds");

        let text = fs::read_to_string(&log_path).unwrap();
        let out = text.find("out-line").expect("stdout captured");
        let err = text.find("err-line").expect("stderr captured");
        assert!(out < err);
        assert!(text.contains("run=7"));
        assert!(!root.join("work").join(LEASE_FILE).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_reports_code_and_command() {
        let root = temp_dir("fail");
        let runner = ExternalRunner::new(root.join("work")).with_interpreter("sh");
        let flags = vec!["-c".to_string(), "exit 1".to_string()];
        let err = invoke(&runner, &root, &flags, &sample_params(), &RunLogger::new("7"))
            .expect_err("exit 1 must fail");
        match err {
            HarnessError::ModelExecution(ModelExecutionError::NonZeroExit { command, code }) => {
                assert_eq!(code, 1);
                assert!(command.starts_with("sh -c"), "{command}");
            }
            other => panic!("unexpected error: {other}"),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn variables_file_is_overwritten_each_run() {
        let root = temp_dir("overwrite");
        let runner = ExternalRunner::new(root.join("work"))
            .with_interpreter("sh")
            .with_dry_run(true);
        let flags = vec!["-c".to_string(), "true".to_string()];
        invoke(&runner, &root, &flags, &sample_params(), &RunLogger::new("7")).unwrap();
        let mut vars = BTreeMap::new();
        vars.insert("z".to_string(), Value::Integer(9));
        invoke(
            &runner,
            &root,
            &flags,
            &Parameters::from_variables(vars),
            &RunLogger::new("8"),
        )
        .unwrap();
        let text = fs::read_to_string(runner.variables_path()).unwrap();
        assert_eq!(text, "z <- 9\n");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn leased_working_directory_rejects_a_second_run() {
        let root = temp_dir("lease");
        let work = root.join("work");
        fs::create_dir_all(&work).unwrap();
        let held = WorkDirLease::acquire(&work).expect("first lease");
        let runner = ExternalRunner::new(&work).with_dry_run(true);
        let err = invoke(&runner, &root, &[], &sample_params(), &RunLogger::new("7"))
            .expect_err("second run must be refused");
        assert!(matches!(err, HarnessError::Configuration(_)), "{err}");
        assert!(!work.join(VARIABLES_FILE).exists());
        drop(held);
        invoke(&runner, &root, &[], &sample_params(), &RunLogger::new("7"))
            .expect("lease released");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn flags_pass_through_and_only_the_script_is_resolved() {
        let root = temp_dir("script");
        let log_path = root.join(RUN_LOG_FILE);
        let log = RunLogger::with_log_file("7", &log_path).unwrap();
        let runner = ExternalRunner::new(root.join("work"))
            .with_script("./lib/../model.R")
            .with_script_root("/models/fish")
            .with_dry_run(true);
        let flags = vec![
            "--vanilla".to_string(),
            "-e".to_string(),
            "cat(1/2)".to_string(),
            "x=a/b".to_string(),
        ];
        invoke(&runner, &root, &flags, &sample_params(), &log).expect("dry run");

        let text = fs::read_to_string(&log_path).unwrap();
        assert!(
            text.contains("would have run: Rscript --vanilla -e 'cat(1/2)' x=a/b /models/fish/model.R"),
            "{text}"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn script_defaults_to_the_model_path_and_keeps_absolute_paths() {
        let runner = ExternalRunner::new("/tmp/work").with_script("model.R");
        let inv = Invocation {
            model_path: Path::new("/models/cod"),
            input_path: Path::new("/in"),
            output_path: Path::new("/out"),
            run_id: "1",
            flags: &[],
        };
        assert_eq!(runner.command_for(&inv), vec!["Rscript", "/models/cod/model.R"]);

        let runner = runner.with_script("/abs/x.R");
        assert_eq!(runner.command_for(&inv), vec!["Rscript", "/abs/x.R"]);
    }

    #[cfg(unix)]
    #[test]
    fn child_killed_by_sigterm_is_terminated() {
        let root = temp_dir("sigterm");
        let runner = ExternalRunner::new(root.join("work")).with_interpreter("sh");
        let flags = vec!["-c".to_string(), "kill -TERM $$".to_string()];
        let err = invoke(&runner, &root, &flags, &sample_params(), &RunLogger::new("7"))
            .expect_err("signalled child must fail");
        assert!(err.is_termination(), "{err}");
        assert!(
            matches!(
                err,
                HarnessError::ModelExecution(ModelExecutionError::Terminated { code: 143 })
            ),
            "{err}"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn crash_signal_is_not_a_termination() {
        let root = temp_dir("sigsegv");
        let runner = ExternalRunner::new(root.join("work")).with_interpreter("sh");
        let flags = vec!["-c".to_string(), "kill -SEGV $$".to_string()];
        let err = invoke(&runner, &root, &flags, &sample_params(), &RunLogger::new("7"))
            .expect_err("crashed child must fail");
        assert!(
            matches!(
                err,
                HarnessError::ModelExecution(ModelExecutionError::Signalled { .. })
            ),
            "{err}"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn raised_stop_signal_prevents_spawning() {
        let root = temp_dir("prestop");
        let marker = root.join("spawned");
        let stop = StopSignal::new();
        stop.request();
        let runner = ExternalRunner::new(root.join("work"))
            .with_interpreter("sh")
            .with_stop_signal(stop);
        let flags = vec!["-c".to_string(), format!("touch {}", marker.display())];
        let err = invoke(&runner, &root, &flags, &sample_params(), &RunLogger::new("7"))
            .expect_err("stopped run must fail");
        assert!(err.is_termination(), "{err}");
        assert!(!marker.exists());
        assert!(!root.join("work").join(LEASE_FILE).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn stop_requested_mid_run_kills_the_child() {
        let root = temp_dir("midstop");
        let stop = StopSignal::new();
        let runner = ExternalRunner::new(root.join("work"))
            .with_interpreter("sh")
            .with_stop_signal(stop.clone());
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            stop.request();
        });
        let flags = vec!["-c".to_string(), "echo started; exec sleep 30".to_string()];
        let started = std::time::Instant::now();
        let err = invoke(&runner, &root, &flags, &sample_params(), &RunLogger::new("7"))
            .expect_err("stopped run must fail");
        trigger.join().unwrap();
        assert!(
            matches!(
                err,
                HarnessError::ModelExecution(ModelExecutionError::Terminated {
                    code: STOPPED_EXIT_CODE
                })
            ),
            "{err}"
        );
        assert!(started.elapsed() < Duration::from_secs(10));
        let _ = fs::remove_dir_all(root);
    }
}
