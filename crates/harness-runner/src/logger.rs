use chrono::Local;
use harness_core::{HarnessError, Result};
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Log handle for one run.
///
/// Every line becomes a `tracing` event under the `harness::run` target and,
/// when a log file is attached, is appended to it immediately so a hung model
/// still leaves a visible trail.
#[derive(Clone)]
pub struct RunLogger {
    inner: Arc<Inner>,
}

struct Inner {
    run_id: String,
    file: Option<Mutex<LineWriter<File>>>,
}

impl RunLogger {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                run_id: run_id.into(),
                file: None,
            }),
        }
    }

    pub fn with_log_file(run_id: impl Into<String>, path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| HarnessError::env(format!("opening run log {}", path.display()), e))?;
        Ok(Self {
            inner: Arc::new(Inner {
                run_id: run_id.into(),
                file: Some(Mutex::new(LineWriter::new(file))),
            }),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::debug!(target: "harness::run", run_id = %self.inner.run_id, "{}", msg);
        self.append("DEBUG", msg);
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::info!(target: "harness::run", run_id = %self.inner.run_id, "{}", msg);
        self.append("INFO", msg);
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::warn!(target: "harness::run", run_id = %self.inner.run_id, "{}", msg);
        self.append("WARN", msg);
    }

    fn append(&self, level: &str, msg: &str) {
        let Some(file) = &self.inner.file else {
            return;
        };
        if let Ok(mut w) = file.lock() {
            let _ = writeln!(w, "[{}|{}]: {}", level, Local::now().format("%H:%M:%S"), msg);
        }
    }
}

impl std::fmt::Debug for RunLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLogger")
            .field("run_id", &self.inner.run_id)
            .field("log_file", &self.inner.file.is_some())
            .finish()
    }
}
