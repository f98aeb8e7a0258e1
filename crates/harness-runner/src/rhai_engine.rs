//! Embedded engine for model scripts written in Rhai.
//!
//! An entry names a script file and optionally a function in it:
//! `model.rhai` or `model.rhai::simulate`. The function defaults to `execute`
//! and is called with two object maps: the qualified parameters and the run
//! (`run_id`, `model_path`, `input_path`, `output_path`). `print` and `debug`
//! go to the run log; `terminate(code)` ends the run as a termination.

use harness_core::Value;
use rhai::{Dynamic, Engine, EvalAltResult, Map, Position, Scope, INT};
use std::path::Path;

use crate::embedded::{ParameterBridge, ScriptEngine, ScriptError};

pub const ENGINE_NAME: &str = "rhai";
pub const DEFAULT_FUNCTION: &str = "execute";

#[derive(Debug, Clone, Default)]
pub struct RhaiEngine {
    max_operations: Option<u64>,
}

impl RhaiEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort scripts that run more than `limit` operations.
    pub fn with_max_operations(mut self, limit: u64) -> Self {
        self.max_operations = Some(limit);
        self
    }

    fn engine_for(&self, bridge: &ParameterBridge) -> Engine {
        let mut engine = Engine::new();
        if let Some(limit) = self.max_operations {
            engine.set_max_operations(limit);
        }
        let log = bridge.log().clone();
        engine.on_print(move |text| log.info(text));
        let log = bridge.log().clone();
        engine.on_debug(move |text, _source, pos| {
            if pos.is_none() {
                log.debug(text);
            } else {
                log.debug(format!("{} ({})", text, pos));
            }
        });
        engine.register_fn("terminate", |code: INT| -> Result<(), Box<EvalAltResult>> {
            Err(EvalAltResult::ErrorTerminated(Dynamic::from(code), Position::NONE).into())
        });
        engine.register_fn("terminate", || -> Result<(), Box<EvalAltResult>> {
            Err(EvalAltResult::ErrorTerminated(Dynamic::from(0 as INT), Position::NONE).into())
        });
        engine
    }
}

impl ScriptEngine for RhaiEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn invoke(&self, entry: &str, bridge: &ParameterBridge) -> Result<(), ScriptError> {
        let (script, function) = split_entry(entry);
        let path = bridge.script_root().join(script);
        let engine = self.engine_for(bridge);
        bridge
            .log()
            .debug(format!("loading {} for {}()", path.display(), function));
        let ast = engine.compile_file(path).map_err(script_error)?;

        let mut scope = Scope::new();
        engine
            .call_fn::<Dynamic>(
                &mut scope,
                &ast,
                function,
                (parameter_map(bridge), run_map(bridge)),
            )
            .map(|_| ())
            .map_err(script_error)
    }
}

fn split_entry(entry: &str) -> (&str, &str) {
    match entry.rsplit_once("::") {
        Some((script, function)) if !function.is_empty() => (script, function),
        _ => (entry, DEFAULT_FUNCTION),
    }
}

fn parameter_map(bridge: &ParameterBridge) -> Map {
    bridge
        .qualified()
        .iter()
        .map(|(name, value)| (name.as_str().into(), to_dynamic(value)))
        .collect()
}

fn run_map(bridge: &ParameterBridge) -> Map {
    let mut run = Map::new();
    run.insert("run_id".into(), Dynamic::from(bridge.run_id().to_string()));
    run.insert("model_path".into(), path_dynamic(bridge.model_path()));
    run.insert("input_path".into(), path_dynamic(bridge.input_path()));
    run.insert("output_path".into(), path_dynamic(bridge.output_path()));
    run
}

fn path_dynamic(path: &Path) -> Dynamic {
    Dynamic::from(path.display().to_string())
}

/// Rhai floats are `f64`; decimals that do not parse stay text.
fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Bool(b) => Dynamic::from(*b),
        Value::Integer(i) => Dynamic::from(*i),
        Value::Text(s) => Dynamic::from(s.clone()),
        other => {
            let text = other.to_string();
            match text.parse::<f64>() {
                Ok(f) => Dynamic::from(f),
                Err(_) => Dynamic::from(text),
            }
        }
    }
}

fn innermost(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
        | EvalAltResult::ErrorInModule(_, inner, _) => innermost(inner),
        other => other,
    }
}

fn script_error(err: Box<EvalAltResult>) -> ScriptError {
    let cause = innermost(&err);
    if let EvalAltResult::ErrorTerminated(token, _) = cause {
        let code = token.as_int().unwrap_or(1);
        return ScriptError::Exit {
            code: i32::try_from(code).unwrap_or(1),
        };
    }
    let (kind, message) = match cause {
        EvalAltResult::ErrorRuntime(value, _) => ("RuntimeError", value.to_string()),
        EvalAltResult::ErrorParsing(..) => ("ParseError", cause.to_string()),
        EvalAltResult::ErrorFunctionNotFound(..) => ("FunctionNotFound", cause.to_string()),
        EvalAltResult::ErrorVariableNotFound(..) => ("VariableNotFound", cause.to_string()),
        EvalAltResult::ErrorArithmetic(..) => ("ArithmeticError", cause.to_string()),
        EvalAltResult::ErrorMismatchDataType(..) | EvalAltResult::ErrorMismatchOutputType(..) => {
            ("TypeError", cause.to_string())
        }
        EvalAltResult::ErrorSystem(..) => ("SystemError", cause.to_string()),
        _ => ("ScriptError", cause.to_string()),
    };
    ScriptError::Raised {
        kind: kind.to_string(),
        message,
        traceback: Some(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::RunLogger;
    use crate::runner::Invocation;
    use harness_core::Parameters;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::PathBuf;

    fn script_dir(tag: &str, body: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "harness_rhai_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("model.rhai"), body).unwrap();
        dir
    }

    fn invoke(dir: &Path, entry: &str, log: &RunLogger) -> Result<(), ScriptError> {
        let mut vars = BTreeMap::new();
        vars.insert("years".to_string(), Value::Integer(10));
        vars.insert("name".to_string(), Value::from("cod"));
        vars.insert(
            "rate".to_string(),
            Value::Foreign(harness_core::ForeignNumber::new("0.5")),
        );
        let mut outputs = BTreeMap::new();
        outputs.insert("result".to_string(), "result.csv".to_string());
        let params = Parameters::new(vars, BTreeMap::new(), outputs).unwrap();
        let inv = Invocation {
            model_path: dir,
            input_path: Path::new("/data/in"),
            output_path: Path::new("/data/out"),
            run_id: "21",
            flags: &[],
        };
        let bridge = ParameterBridge::new(&inv, &params, log).unwrap();
        RhaiEngine::new().invoke(entry, &bridge)
    }

    #[test]
    fn entry_names_script_and_function() {
        assert_eq!(split_entry("model.rhai"), ("model.rhai", "execute"));
        assert_eq!(split_entry("lib/m.rhai::simulate"), ("lib/m.rhai", "simulate"));
        assert_eq!(split_entry("m.rhai::"), ("m.rhai::", "execute"));
    }

    #[test]
    fn script_sees_parameters_and_run() {
        let dir = script_dir(
            "ok",
            r#"
fn execute(params, run) {
    print("years " + params.years + " for " + params.name + " in run " + run.run_id);
    if params.rate != 0.5 { throw "rate was " + params.rate; }
    if params.result != "/data/out/result.csv" { throw "result was " + params.result; }
}
"#,
        );
        let log_path = dir.join("run.log");
        let log = RunLogger::with_log_file("21", &log_path).unwrap();
        invoke(&dir, "model.rhai", &log).expect("script succeeds");
        let text = fs::read_to_string(&log_path).unwrap();
        assert!(text.contains("years 10 for cod in run 21"), "{text}");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn named_function_is_called() {
        let dir = script_dir("named", "fn simulate(params, run) { print(\"simulating\"); }");
        let log_path = dir.join("run.log");
        let log = RunLogger::with_log_file("21", &log_path).unwrap();
        invoke(&dir, "model.rhai::simulate", &log).expect("script succeeds");
        assert!(fs::read_to_string(&log_path).unwrap().contains("simulating"));

        let err = invoke(&dir, "model.rhai", &log).unwrap_err();
        match err {
            ScriptError::Raised { kind, .. } => assert_eq!(kind, "FunctionNotFound"),
            other => panic!("unexpected: {other:?}"),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn thrown_value_is_raised_with_message() {
        let dir = script_dir("throw", "fn execute(params, run) { throw \"bad rate\"; }");
        let err = invoke(&dir, "model.rhai", &RunLogger::new("21")).unwrap_err();
        match err {
            ScriptError::Raised {
                kind,
                message,
                traceback,
            } => {
                assert_eq!(kind, "RuntimeError");
                assert_eq!(message, "bad rate");
                assert!(traceback.is_some());
            }
            other => panic!("unexpected: {other:?}"),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn terminate_becomes_exit() {
        let dir = script_dir("exit", "fn execute(params, run) { terminate(3); print(\"unreached\"); }");
        let err = invoke(&dir, "model.rhai", &RunLogger::new("21")).unwrap_err();
        assert_eq!(err, ScriptError::Exit { code: 3 });
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn runaway_script_is_stopped_by_operation_limit() {
        let dir = script_dir("limit", "fn execute(params, run) { loop { } }");
        let inv = Invocation {
            model_path: &dir,
            input_path: Path::new("/data/in"),
            output_path: Path::new("/data/out"),
            run_id: "21",
            flags: &[],
        };
        let log = RunLogger::new("21");
        let bridge = ParameterBridge::new(&inv, &Parameters::default(), &log).unwrap();
        let err = RhaiEngine::new()
            .with_max_operations(10_000)
            .invoke("model.rhai", &bridge)
            .unwrap_err();
        assert!(
            matches!(&err, ScriptError::Raised { kind, .. } if kind == "ScriptError"),
            "{err:?}"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn syntax_error_and_missing_file_are_raised() {
        let dir = script_dir("syntax", "fn execute(params, run) { let = ; }");
        let err = invoke(&dir, "model.rhai", &RunLogger::new("21")).unwrap_err();
        assert!(
            matches!(&err, ScriptError::Raised { kind, .. } if kind == "ParseError"),
            "{err:?}"
        );
        let err = invoke(&dir, "absent.rhai", &RunLogger::new("21")).unwrap_err();
        assert!(
            matches!(&err, ScriptError::Raised { kind, .. } if kind == "SystemError"),
            "{err:?}"
        );
        let _ = fs::remove_dir_all(dir);
    }
}
