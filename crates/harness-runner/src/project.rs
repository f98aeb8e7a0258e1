use harness_core::{HarnessError, Parameters, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::runner::RunnerKind;

pub const PROJECTS_DIR: &str = "projects";
pub const MANIFEST_FILE: &str = "project.yaml";

/// Per-project run settings, read from `projects/<project>/project.yaml`
/// under the model path.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectManifest {
    #[serde(default = "default_runner")]
    pub runner: RunnerKind,
    /// Native model name. Defaults to the project name.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub entry: Option<String>,
    /// Script handed to the external interpreter after `flags`. Only the
    /// script is resolved against the script root; flags pass through as
    /// written.
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub interpreter: Option<String>,
    /// Relative paths are taken from the project directory.
    #[serde(default)]
    pub script_root: Option<PathBuf>,
    #[serde(default)]
    pub base_parameters: Option<Parameters>,
}

fn default_runner() -> RunnerKind {
    RunnerKind::Native
}

impl Default for ProjectManifest {
    fn default() -> Self {
        Self {
            runner: default_runner(),
            model: None,
            engine: None,
            entry: None,
            script: None,
            flags: Vec::new(),
            interpreter: None,
            script_root: None,
            base_parameters: None,
        }
    }
}

impl ProjectManifest {
    /// Reads the manifest for `project`; `None` when the project has none.
    pub fn load(model_path: &Path, project: &str) -> Result<Option<Self>> {
        let path = manifest_path(model_path, project);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(HarnessError::env(
                    format!("reading project manifest {}", path.display()),
                    e,
                ))
            }
        };
        let manifest: ProjectManifest = serde_yaml::from_str(&data).map_err(|e| {
            HarnessError::config(format!("invalid project manifest {}: {}", path.display(), e))
        })?;
        manifest.validate(&path)?;
        Ok(Some(manifest))
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let missing = |field: &str| {
            HarnessError::config(format!(
                "project manifest {} selects the {} runner but has no `{}`",
                path.display(),
                self.runner.as_str(),
                field
            ))
        };
        match self.runner {
            RunnerKind::Native => Ok(()),
            RunnerKind::Embedded if self.engine.is_none() => Err(missing("engine")),
            RunnerKind::Embedded if self.entry.is_none() => Err(missing("entry")),
            RunnerKind::Embedded => Ok(()),
            RunnerKind::External if self.script.is_none() && self.flags.is_empty() => {
                Err(missing("script"))
            }
            RunnerKind::External => Ok(()),
        }
    }

    pub fn model_name<'a>(&'a self, project: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(project)
    }

    pub fn resolved_script_root(&self, project_dir: &Path) -> PathBuf {
        match &self.script_root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => project_dir.join(root),
            None => project_dir.to_path_buf(),
        }
    }
}

pub fn project_dir(model_path: &Path, project: &str) -> PathBuf {
    model_path.join(PROJECTS_DIR).join(project)
}

pub fn manifest_path(model_path: &Path, project: &str) -> PathBuf {
    project_dir(model_path, project).join(MANIFEST_FILE)
}
