use harness_core::{ModelExecutionError, Parameters, Result};
use std::panic::{self, AssertUnwindSafe};

use crate::external::ExternalRunner;
use crate::logger::RunLogger;
use crate::model::{ModelFactory, RunContext};
use crate::runner::{panic_message, Invocation, Runner, RunnerKind};

/// Runs a model linked into the harness.
#[derive(Clone)]
pub struct NativeRunner {
    name: String,
    factory: ModelFactory,
    seed: Option<u64>,
    external: Option<ExternalRunner>,
}

impl NativeRunner {
    pub fn new(name: impl Into<String>, factory: ModelFactory) -> Self {
        Self {
            name: name.into(),
            factory,
            seed: None,
            external: None,
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Interpreter the model may call through [`RunContext::run_external`].
    pub fn with_external(mut self, runner: ExternalRunner) -> Self {
        self.external = Some(runner);
        self
    }
}

impl Runner for NativeRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Native
    }

    fn run(&self, inv: &Invocation<'_>, params: &Parameters, log: &RunLogger) -> Result<()> {
        let mut ctx = RunContext::new(
            inv.run_id,
            inv.model_path,
            inv.input_path,
            inv.output_path,
            log.clone(),
        )
        .with_seed(self.seed);
        if let Some(external) = &self.external {
            ctx = ctx.with_external(external.clone());
        }
        let params = params.normalized();
        log.debug(format!("executing native model {}", self.name));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let model = (self.factory)(ctx);
            model.execute(&params)
        }));
        let err = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => ModelExecutionError::from(e),
            Err(payload) => ModelExecutionError::Panicked(panic_message(payload.as_ref())),
        };
        match &err {
            ModelExecutionError::Terminated { code } => {
                log.warn(format!("model {} requested termination with code {}", self.name, code))
            }
            other => log.warn(format!("model {} failed: {}", self.name, other)),
        }
        Err(err.into())
    }
}
