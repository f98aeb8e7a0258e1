use harness_core::{Parameters, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::path::Path;

use crate::logger::RunLogger;

/// Where and how a model should be run.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub model_path: &'a Path,
    pub input_path: &'a Path,
    pub output_path: &'a Path,
    pub run_id: &'a str,
    pub flags: &'a [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    Native,
    Embedded,
    External,
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerKind::Native => "native",
            RunnerKind::Embedded => "embedded",
            RunnerKind::External => "external",
        }
    }
}

/// Executes a model in one particular runtime.
///
/// Runners hold configuration only; everything run-specific arrives through
/// the arguments, so one runner value can serve many sequential runs.
pub trait Runner {
    fn kind(&self) -> RunnerKind;

    fn run(&self, inv: &Invocation<'_>, params: &Parameters, log: &RunLogger) -> Result<()>;
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
