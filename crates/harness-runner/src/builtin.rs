//! Models shipped with the harness for checking a deployment end to end.

use anyhow::{bail, Context};
use harness_core::{Parameters, Value};
use std::time::Duration;

use crate::model::{Model, ModelRegistry, RunContext};

pub const NULL_MODEL: &str = "null";
pub const SLEEP_MODEL: &str = "sleep";
const DEFAULT_SLEEP_MS: u64 = 5000;

pub(crate) fn register(registry: &mut ModelRegistry) {
    registry.register_model(NULL_MODEL, |ctx| Box::new(NullModel { ctx }));
    registry.register_model(SLEEP_MODEL, |ctx| Box::new(SleepModel { ctx }));
}

/// Does nothing and succeeds.
pub struct NullModel {
    ctx: RunContext,
}

impl Model for NullModel {
    fn execute(&self, params: &Parameters) -> anyhow::Result<()> {
        self.ctx.log.info(format!(
            "null model called with {} parameters",
            params.len()
        ));
        Ok(())
    }
}

/// Sleeps for `duration_ms` milliseconds, then succeeds.
pub struct SleepModel {
    ctx: RunContext,
}

impl Model for SleepModel {
    fn execute(&self, params: &Parameters) -> anyhow::Result<()> {
        let ms = match params.variables().get("duration_ms") {
            None => DEFAULT_SLEEP_MS,
            Some(Value::Integer(ms)) => {
                u64::try_from(*ms).context("duration_ms must not be negative")?
            }
            Some(other) => bail!("duration_ms must be an integer, got {}", other),
        };
        self.ctx.log.info(format!("sleeping for {} ms", ms));
        std::thread::sleep(Duration::from_millis(ms));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::RunLogger;
    use std::collections::BTreeMap;
    use std::time::Instant;

    fn build(name: &str) -> Box<dyn Model> {
        let registry = ModelRegistry::with_builtins();
        let factory = registry.model(name).expect("builtin registered");
        factory(RunContext::new("1", "/m", "/m/in", "/out", RunLogger::new("1")))
    }

    #[test]
    fn null_model_succeeds() {
        build(NULL_MODEL)
            .execute(&Parameters::default())
            .expect("null model");
    }

    #[test]
    fn sleep_model_honours_duration() {
        let mut vars = BTreeMap::new();
        vars.insert("duration_ms".to_string(), Value::Integer(20));
        let start = Instant::now();
        build(SLEEP_MODEL)
            .execute(&Parameters::from_variables(vars))
            .expect("sleep");
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn sleep_model_rejects_bad_duration() {
        let mut vars = BTreeMap::new();
        vars.insert("duration_ms".to_string(), Value::from("soon"));
        let err = build(SLEEP_MODEL)
            .execute(&Parameters::from_variables(vars))
            .unwrap_err();
        assert!(err.to_string().contains("duration_ms"));

        let mut vars = BTreeMap::new();
        vars.insert("duration_ms".to_string(), Value::Integer(-1));
        assert!(build(SLEEP_MODEL)
            .execute(&Parameters::from_variables(vars))
            .is_err());
    }
}
