use harness_core::layout::{
    with_suffix, FAILED_SUFFIX, IN_PROGRESS_SUFFIX, METADATA_DIR, WORK_DIR,
};
use harness_core::{ensure_dir, HarnessError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Output directory of a run that has not finished yet.
///
/// Everything is written under `<output>.inprogress`. [`RunOutputDir::finish`]
/// renames it to `<output>` or `<output>.failed`; dropping the guard without
/// finishing marks the run failed.
#[derive(Debug)]
pub struct RunOutputDir {
    target: PathBuf,
    in_progress: PathBuf,
    finished: bool,
}

impl RunOutputDir {
    pub fn begin(output_path: &Path) -> Result<Self> {
        let in_progress = with_suffix(output_path, IN_PROGRESS_SUFFIX);
        remove_stale(&in_progress)?;
        ensure_dir(&in_progress.join(METADATA_DIR))?;
        Ok(Self {
            target: output_path.to_path_buf(),
            in_progress,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.in_progress
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.in_progress.join(METADATA_DIR)
    }

    pub fn work_path(&self) -> PathBuf {
        self.metadata_path().join(WORK_DIR)
    }

    pub fn destination(&self, success: bool) -> PathBuf {
        if success {
            self.target.clone()
        } else {
            with_suffix(&self.target, FAILED_SUFFIX)
        }
    }

    pub fn finish(mut self, success: bool) -> Result<PathBuf> {
        self.finished = true;
        let dest = self.destination(success);
        remove_stale(&dest)?;
        fs::rename(&self.in_progress, &dest).map_err(|e| {
            HarnessError::env(
                format!(
                    "renaming {} to {}",
                    self.in_progress.display(),
                    dest.display()
                ),
                e,
            )
        })?;
        Ok(dest)
    }
}

impl Drop for RunOutputDir {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let dest = self.destination(false);
        if remove_stale(&dest).is_ok() {
            let _ = fs::rename(&self.in_progress, &dest);
        }
    }
}

fn remove_stale(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    tracing::warn!(path = %path.display(), "removing existing output directory");
    fs::remove_dir_all(path)
        .map_err(|e| HarnessError::env(format!("removing {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "harness_output_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn success_renames_to_final_path() {
        let root = temp_root("ok");
        let target = root.join("run_1");
        let out = RunOutputDir::begin(&target).unwrap();
        assert!(out.metadata_path().is_dir());
        fs::write(out.path().join("result.csv"), "x").unwrap();
        let dest = out.finish(true).unwrap();
        assert_eq!(dest, target);
        assert!(target.join("result.csv").is_file());
        assert!(!root.join("run_1.inprogress").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn stale_directories_are_replaced() {
        let root = temp_root("stale");
        let target = root.join("run_2");
        fs::create_dir_all(root.join("run_2.inprogress").join("old")).unwrap();
        fs::create_dir_all(target.join("old")).unwrap();
        let out = RunOutputDir::begin(&target).unwrap();
        assert!(!out.path().join("old").exists());
        out.finish(true).unwrap();
        assert!(!target.join("old").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unfinished_run_is_marked_failed() {
        let root = temp_root("drop");
        let target = root.join("run_3");
        {
            let _out = RunOutputDir::begin(&target).unwrap();
        }
        assert!(root.join("run_3.failed").join(METADATA_DIR).is_dir());
        assert!(!target.exists());
        assert!(!root.join("run_3.inprogress").exists());
        let _ = fs::remove_dir_all(root);
    }
}
