//! Model execution: the model contract, the three runners and the harness
//! entry point that ties a run together.

pub mod builtin;
pub mod embedded;
pub mod external;
pub mod harness;
pub mod logger;
pub mod model;
pub mod native;
pub mod output;
pub mod project;
#[cfg(feature = "rhai")]
pub mod rhai_engine;
pub mod runner;
pub mod stop;

pub use embedded::{EmbeddedRunner, ParameterBridge, ScriptEngine, ScriptError};
pub use external::ExternalRunner;
pub use harness::{Harness, RunReport, RunRequest, RunStatus, DEFAULT_INPUT_DIR};
pub use logger::RunLogger;
pub use model::{Model, ModelFactory, ModelRegistry, RunContext};
pub use native::NativeRunner;
pub use output::RunOutputDir;
pub use project::ProjectManifest;
#[cfg(feature = "rhai")]
pub use rhai_engine::RhaiEngine;
pub use runner::{Invocation, Runner, RunnerKind};
pub use stop::StopSignal;
