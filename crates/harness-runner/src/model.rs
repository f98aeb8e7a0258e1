use harness_core::{HarnessError, Parameters, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::embedded::ScriptEngine;
use crate::external::ExternalRunner;
use crate::logger::RunLogger;
use crate::runner::{Invocation, Runner};

/// A model written in Rust and linked into the harness.
///
/// Implementations are built by a [`ModelFactory`] from the [`RunContext`]
/// of the run they belong to, and get the normalized parameters on `execute`.
/// Return [`harness_core::TerminationRequested`] to stop the run without it
/// being counted as a crash.
pub trait Model {
    fn execute(&self, params: &Parameters) -> anyhow::Result<()>;
}

pub type ModelFactory = Arc<dyn Fn(RunContext) -> Box<dyn Model> + Send + Sync>;

/// Everything a model instance knows about its run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub model_path: PathBuf,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub seed: Option<u64>,
    pub log: RunLogger,
    pub(crate) external: Option<ExternalRunner>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        model_path: impl Into<PathBuf>,
        input_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        log: RunLogger,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            model_path: model_path.into(),
            input_path: input_path.into(),
            output_path: output_path.into(),
            seed: None,
            log,
            external: None,
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_external(mut self, runner: ExternalRunner) -> Self {
        self.external = Some(runner);
        self
    }

    /// Runs `script` in the external interpreter with `params`, with
    /// `extra` merged over them when given.
    pub fn run_external(
        &self,
        script: &str,
        params: &Parameters,
        extra: Option<&Parameters>,
    ) -> Result<()> {
        let runner = self.external.as_ref().ok_or_else(|| {
            HarnessError::config("this run has no external interpreter configured")
        })?;
        let merged;
        let params = match extra {
            Some(extra) => {
                merged = params.merge(extra);
                &merged
            }
            None => params,
        };
        let inv = Invocation {
            model_path: &self.model_path,
            input_path: &self.input_path,
            output_path: &self.output_path,
            run_id: &self.run_id,
            flags: &[],
        };
        runner.clone().with_script(script).run(&inv, params, &self.log)
    }
}

/// Named native models and embedded engines available to the harness.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelFactory>,
    engines: BTreeMap<String, Arc<dyn ScriptEngine>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `null` and `sleep` smoke-test models, plus the
    /// `rhai` engine when that feature is enabled.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin::register(&mut registry);
        #[cfg(feature = "rhai")]
        registry.register_engine(Arc::new(crate::rhai_engine::RhaiEngine::new()));
        registry
    }

    pub fn register_model<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(RunContext) -> Box<dyn Model> + Send + Sync + 'static,
    {
        self.models.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_engine(&mut self, engine: Arc<dyn ScriptEngine>) -> &mut Self {
        self.engines.insert(engine.name().to_string(), engine);
        self
    }

    pub fn model(&self, name: &str) -> Option<ModelFactory> {
        self.models.get(name).cloned()
    }

    pub fn engine(&self, name: &str) -> Option<Arc<dyn ScriptEngine>> {
        self.engines.get(name).cloned()
    }

    /// Looks up `<project>.<name>` first, then the bare `name`.
    pub fn resolve(&self, project: &str, name: &str) -> Option<ModelFactory> {
        self.model(&format!("{}.{}", project, name))
            .or_else(|| self.model(name))
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .finish()
    }
}
