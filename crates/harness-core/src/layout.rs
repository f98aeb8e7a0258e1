//! Naming conventions for run output directories.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Suffix of an output directory whose run has not finished yet.
pub const IN_PROGRESS_SUFFIX: &str = ".inprogress";
pub const FAILED_SUFFIX: &str = ".failed";
pub const METADATA_DIR: &str = "metadata";
pub const RUN_LOG_FILE: &str = "logging.log";
pub const PARAMETERS_SNAPSHOT_FILE: &str = "parameters.json";
pub const RUN_MANIFEST_FILE: &str = "run_manifest.json";
pub const WORK_DIR: &str = "work";

pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

pub fn is_in_progress(dir_name: &str) -> bool {
    dir_name.ends_with(IN_PROGRESS_SUFFIX)
}

/// Run id encoded in an output directory name: everything after the last `_`.
///
/// A name without `_` is its own id. Ids that themselves contain `_` cannot be
/// recovered; that ambiguity is part of the directory naming format.
pub fn run_id_from_dir_name(dir_name: &str) -> &str {
    dir_name.rsplit('_').next().unwrap_or(dir_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_is_last_underscore_segment() {
        assert_eq!(run_id_from_dir_name("run_abc_1"), "1");
        assert_eq!(run_id_from_dir_name("42"), "42");
        assert_eq!(run_id_from_dir_name("trailing_"), "");
    }

    #[test]
    fn suffixes_append_to_the_base_name() {
        let p = with_suffix(Path::new("/out/run_7"), IN_PROGRESS_SUFFIX);
        assert_eq!(p, PathBuf::from("/out/run_7.inprogress"));
        assert!(is_in_progress("run_7.inprogress"));
        assert!(!is_in_progress("run_7.failed"));
    }
}
