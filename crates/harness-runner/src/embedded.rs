use harness_core::{ModelExecutionError, Parameters, Result, Value};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::logger::RunLogger;
use crate::runner::{panic_message, Invocation, Runner, RunnerKind};

/// An interpreter hosted inside the harness process.
pub trait ScriptEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Calls `entry` with the bridge as its only argument.
    fn invoke(&self, entry: &str, bridge: &ParameterBridge) -> std::result::Result<(), ScriptError>;
}

/// Failure reported by a script engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptError {
    Raised {
        kind: String,
        message: String,
        traceback: Option<String>,
    },
    /// The script asked the interpreter to exit.
    Exit { code: i32 },
}

/// What script code sees of the run: parameters, paths and the log.
#[derive(Debug)]
pub struct ParameterBridge {
    run_id: String,
    model_path: PathBuf,
    script_root: PathBuf,
    input_path: PathBuf,
    output_path: PathBuf,
    params: Parameters,
    qualified: BTreeMap<String, Value>,
    log: RunLogger,
}

impl ParameterBridge {
    pub fn new(inv: &Invocation<'_>, params: &Parameters, log: &RunLogger) -> Result<Self> {
        let params = params.normalized();
        let qualified = params.qualify(inv.input_path, inv.output_path)?;
        Ok(Self {
            run_id: inv.run_id.to_string(),
            model_path: inv.model_path.to_path_buf(),
            script_root: inv.model_path.to_path_buf(),
            input_path: inv.input_path.to_path_buf(),
            output_path: inv.output_path.to_path_buf(),
            params,
            qualified,
            log: log.clone(),
        })
    }

    /// Directory that relative entry scripts are loaded from. Defaults to the
    /// model path.
    pub fn with_script_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.script_root = root.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn script_root(&self) -> &Path {
        &self.script_root
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Normalized, unqualified parameters.
    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    pub fn qualified(&self) -> &BTreeMap<String, Value> {
        &self.qualified
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.qualified.get(name)
    }

    pub fn log(&self) -> &RunLogger {
        &self.log
    }
}

/// Runs model code through an embedded [`ScriptEngine`].
///
/// Errors, exit requests and panics from the engine never escape `run`; they
/// are logged and returned as [`ModelExecutionError`].
#[derive(Clone)]
pub struct EmbeddedRunner {
    engine: Arc<dyn ScriptEngine>,
    entry: String,
    script_root: Option<PathBuf>,
}

impl EmbeddedRunner {
    pub fn new(engine: Arc<dyn ScriptEngine>, entry: impl Into<String>) -> Self {
        Self {
            engine,
            entry: entry.into(),
            script_root: None,
        }
    }

    pub fn with_script_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.script_root = Some(root.into());
        self
    }
}

impl Runner for EmbeddedRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Embedded
    }

    fn run(&self, inv: &Invocation<'_>, params: &Parameters, log: &RunLogger) -> Result<()> {
        let mut bridge = ParameterBridge::new(inv, params, log)?;
        if let Some(root) = &self.script_root {
            bridge = bridge.with_script_root(root);
        }
        let engine = self.engine.name().to_string();
        log.debug(format!("invoking {} in {} engine", self.entry, engine));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.engine.invoke(&self.entry, &bridge)
        }));
        let err = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(ScriptError::Exit { code })) => {
                log.warn(format!("{} code requested exit with code {}", engine, code));
                ModelExecutionError::Terminated { code }
            }
            Ok(Err(ScriptError::Raised {
                kind,
                message,
                traceback,
            })) => {
                log.warn(format!("{}: {}", kind, message));
                if let Some(tb) = &traceback {
                    log.debug(tb);
                }
                ModelExecutionError::Raised {
                    engine,
                    kind,
                    message,
                    traceback,
                }
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                log.warn(format!("{} engine panicked: {}", engine, msg));
                ModelExecutionError::Panicked(msg)
            }
        };
        Err(err.into())
    }
}
