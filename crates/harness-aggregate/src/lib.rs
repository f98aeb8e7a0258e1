//! Collects the output files of finished runs into one flat directory.
//!
//! Each run directory under the source root is named so that its run id is
//! the segment after the last `_`. Every regular file found anywhere under a
//! selected run is copied to `<output>/<run id>_<file name>`.

use harness_core::layout::{is_in_progress, run_id_from_dir_name};
use harness_core::{HarnessError, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{self, FileTimes};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

/// Which runs to collect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSelector {
    All,
    Ids(BTreeSet<String>),
}

impl RunSelector {
    pub fn matches(&self, run_id: &str) -> bool {
        match self {
            RunSelector::All => true,
            RunSelector::Ids(ids) => ids.contains(run_id),
        }
    }
}

impl FromStr for RunSelector {
    type Err = HarnessError;

    /// A comma-separated id list; a `*` anywhere in it selects everything.
    fn from_str(s: &str) -> Result<Self> {
        let ids: BTreeSet<String> = s
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if ids.contains("*") {
            return Ok(RunSelector::All);
        }
        if ids.is_empty() {
            return Err(HarnessError::config("no run ids given"));
        }
        Ok(RunSelector::Ids(ids))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateOptions {
    /// Create the output directory instead of failing when it is missing.
    pub create_output_dir: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateSummary {
    /// Ids of the runs that were copied, in the order they were visited.
    pub runs: Vec<String>,
    pub files_copied: usize,
}

/// Default location of run output directories: `$HOME/harness/outputdata`.
pub fn default_source_root() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join("harness").join("outputdata")
}

pub fn aggregate(
    selector: &RunSelector,
    source_root: &Path,
    output_dir: &Path,
    opts: AggregateOptions,
) -> Result<AggregateSummary> {
    if !output_dir.is_dir() {
        if !opts.create_output_dir {
            return Err(HarnessError::config(format!(
                "output directory {} does not exist",
                output_dir.display()
            )));
        }
        harness_core::ensure_dir(output_dir)?;
    }

    let mut run_dirs = Vec::new();
    let entries = fs::read_dir(source_root).map_err(|e| {
        HarnessError::env(format!("listing runs in {}", source_root.display()), e)
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| {
            HarnessError::env(format!("listing runs in {}", source_root.display()), e)
        })?;
        let Ok(name) = entry.file_name().into_string() else {
            tracing::debug!(path = %entry.path().display(), "skipping non-UTF-8 directory name");
            continue;
        };
        if is_in_progress(&name) || !entry.path().is_dir() {
            continue;
        }
        run_dirs.push((name, entry.path()));
    }
    run_dirs.sort();

    let mut summary = AggregateSummary::default();
    let mut written = BTreeSet::new();
    for (name, path) in run_dirs {
        let run_id = run_id_from_dir_name(&name);
        if !selector.matches(run_id) {
            continue;
        }
        tracing::info!(run_id, "copying run");
        summary.files_copied += copy_run(run_id, &path, output_dir, &mut written)?;
        summary.runs.push(run_id.to_string());
    }
    Ok(summary)
}

fn copy_run(
    run_id: &str,
    run_dir: &Path,
    output_dir: &Path,
    written: &mut BTreeSet<PathBuf>,
) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(run_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let context = format!("walking {}", run_dir.display());
            HarnessError::env(context, e.into())
        })?;
        // Follows symlinks so linked result files are copied too.
        if !entry.path().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        let target = output_dir.join(format!("{}_{}", run_id, file_name));
        if !written.insert(target.clone()) {
            tracing::warn!(
                source = %entry.path().display(),
                target = %target.display(),
                "file name already copied for this run; overwriting"
            );
        }
        copy_preserving_times(entry.path(), &target)?;
        copied += 1;
    }
    Ok(copied)
}

fn copy_preserving_times(src: &Path, dst: &Path) -> Result<()> {
    let context = || format!("copying {} to {}", src.display(), dst.display());
    fs::copy(src, dst).map_err(|e| HarnessError::env(context(), e))?;
    let meta = fs::metadata(src).map_err(|e| HarnessError::env(context(), e))?;
    let mut times = FileTimes::new();
    if let Ok(accessed) = meta.accessed() {
        times = times.set_accessed(accessed);
    }
    if let Ok(modified) = meta.modified() {
        times = times.set_modified(modified);
    }
    fs::File::options()
        .write(true)
        .open(dst)
        .and_then(|f| f.set_times(times))
        .map_err(|e| HarnessError::env(context(), e))
}
