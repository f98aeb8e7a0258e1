use std::io;
use thiserror::Error;

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    ModelExecution(#[from] ModelExecutionError),
    #[error("{context}: {source}")]
    Environment {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl HarnessError {
    pub fn config(message: impl Into<String>) -> Self {
        HarnessError::Configuration(message.into())
    }

    pub fn env(context: impl Into<String>, source: io::Error) -> Self {
        HarnessError::Environment {
            context: context.into(),
            source,
        }
    }

    /// True when the run stopped because it was asked to, rather than crashing.
    pub fn is_termination(&self) -> bool {
        matches!(
            self,
            HarnessError::ModelExecution(ModelExecutionError::Terminated { .. })
        )
    }
}

#[derive(Debug, Error)]
pub enum ModelExecutionError {
    #[error("command `{command}` exited with code {code}")]
    NonZeroExit { command: String, code: i32 },
    #[error("command `{command}` was terminated by a signal")]
    Signalled { command: String },
    #[error("{kind} raised in {engine} engine: {message}")]
    Raised {
        engine: String,
        kind: String,
        message: String,
        traceback: Option<String>,
    },
    #[error("model requested termination with exit code {code}")]
    Terminated { code: i32 },
    #[error("model panicked: {0}")]
    Panicked(String),
    #[error("model failed: {:#}", .0)]
    Failed(anyhow::Error),
}

impl ModelExecutionError {
    /// Multi-line detail for the debug-level trace that follows a failure summary.
    pub fn detail(&self) -> Option<String> {
        match self {
            ModelExecutionError::Raised { traceback, .. } => traceback.clone(),
            ModelExecutionError::Failed(err) => Some(format!("{:?}", err)),
            _ => None,
        }
    }
}

/// Returned by model code to ask the harness to stop the run.
///
/// The harness reports this as a termination, not as a crash.
#[derive(Debug, Error)]
#[error("termination requested with exit code {code}")]
pub struct TerminationRequested {
    pub code: i32,
}

impl From<anyhow::Error> for ModelExecutionError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<TerminationRequested>() {
            Some(t) => ModelExecutionError::Terminated { code: t.code },
            None => match err.downcast::<HarnessError>() {
                Ok(HarnessError::ModelExecution(inner)) => inner,
                Ok(other) => ModelExecutionError::Failed(anyhow::Error::new(other)),
                Err(err) => ModelExecutionError::Failed(err),
            },
        }
    }
}
