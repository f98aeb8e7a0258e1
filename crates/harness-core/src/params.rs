use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{HarnessError, Result};
use crate::value::{normalize_numeric, Value};
use crate::wildcard::WildcardContext;

/// The parameter set for one run.
///
/// Names are unique across all three categories. Instances are never mutated;
/// [`Parameters::merge`] and friends build new values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawParameters")]
pub struct Parameters {
    variables: BTreeMap<String, Value>,
    #[serde(rename = "inputFiles")]
    input_files: BTreeMap<String, String>,
    #[serde(rename = "outputFiles")]
    output_files: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawParameters {
    #[serde(default)]
    variables: BTreeMap<String, serde_json::Value>,
    #[serde(default, rename = "inputFiles", alias = "input_files")]
    input_files: BTreeMap<String, String>,
    #[serde(default, rename = "outputFiles", alias = "output_files")]
    output_files: BTreeMap<String, String>,
}

impl TryFrom<RawParameters> for Parameters {
    type Error = HarnessError;

    fn try_from(raw: RawParameters) -> Result<Self> {
        let mut variables = BTreeMap::new();
        for (name, value) in raw.variables {
            let value = Value::from_json(&name, value)?;
            variables.insert(name, value);
        }
        Parameters::new(variables, raw.input_files, raw.output_files)
    }
}

impl Parameters {
    pub fn new(
        variables: BTreeMap<String, Value>,
        input_files: BTreeMap<String, String>,
        output_files: BTreeMap<String, String>,
    ) -> Result<Self> {
        let params = Self {
            variables,
            input_files,
            output_files,
        };
        params.check_names()?;
        params.check_collisions()?;
        Ok(params)
    }

    pub fn from_variables(variables: BTreeMap<String, Value>) -> Self {
        Self {
            variables,
            ..Self::default()
        }
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| HarnessError::config(format!("invalid parameter blob: {}", e)))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| {
            HarnessError::env(format!("reading parameter file {}", path.display()), e)
        })?;
        Self::from_json_str(&data).map_err(|e| match e {
            HarnessError::Configuration(msg) => {
                HarnessError::config(format!("{} ({})", msg, path.display()))
            }
            other => other,
        })
    }

    /// Writes a pretty JSON snapshot. Refuses to overwrite an existing file.
    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let context = || format!("writing parameters to {}", path.display());
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| HarnessError::env(context(), e.into()))?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| HarnessError::env(context(), e))?;
        file.write_all(&bytes)
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.sync_all())
            .map_err(|e| HarnessError::env(context(), e))
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    pub fn input_files(&self) -> &BTreeMap<String, String> {
        &self.input_files
    }

    pub fn output_files(&self) -> &BTreeMap<String, String> {
        &self.output_files
    }

    pub fn len(&self) -> usize {
        self.variables.len() + self.input_files.len() + self.output_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat view of all parameters with file references made absolute.
    pub fn qualify(&self, input_root: &Path, output_root: &Path) -> Result<BTreeMap<String, Value>> {
        self.check_collisions()?;
        let mut qualified = self.variables.clone();
        for (name, rel) in &self.input_files {
            qualified.insert(name.clone(), Value::Text(absolute_under(input_root, rel)?));
        }
        for (name, rel) in &self.output_files {
            qualified.insert(name.clone(), Value::Text(absolute_under(output_root, rel)?));
        }
        Ok(qualified)
    }

    /// Per-category union of `self` and `overrides`; `overrides` wins on key clashes.
    pub fn merge(&self, overrides: &Parameters) -> Parameters {
        Parameters {
            variables: merged(&self.variables, &overrides.variables),
            input_files: merged(&self.input_files, &overrides.input_files),
            output_files: merged(&self.output_files, &overrides.output_files),
        }
    }

    /// Same parameters with every foreign number in `variables` converted to a decimal.
    pub fn normalized(&self) -> Parameters {
        Parameters {
            variables: self
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), normalize_numeric(v.clone())))
                .collect(),
            input_files: self.input_files.clone(),
            output_files: self.output_files.clone(),
        }
    }

    pub fn replace_wildcards(&self, ctx: &WildcardContext) -> Parameters {
        let variables = self
            .variables
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::Text(s) => Value::Text(ctx.replace(s)),
                    other => other.clone(),
                };
                (k.clone(), v)
            })
            .collect();
        let replace_all = |files: &BTreeMap<String, String>| {
            files
                .iter()
                .map(|(k, v)| (k.clone(), ctx.replace(v)))
                .collect::<BTreeMap<_, _>>()
        };
        Parameters {
            variables,
            input_files: replace_all(&self.input_files),
            output_files: replace_all(&self.output_files),
        }
    }

    fn check_names(&self) -> Result<()> {
        let empty = self
            .variables
            .keys()
            .chain(self.input_files.keys())
            .chain(self.output_files.keys())
            .any(|name| name.trim().is_empty());
        if empty {
            return Err(HarnessError::config("parameter names must not be empty"));
        }
        Ok(())
    }

    fn check_collisions(&self) -> Result<()> {
        let mut dupes = Vec::new();
        for name in self.input_files.keys().chain(self.output_files.keys()) {
            if self.variables.contains_key(name) {
                dupes.push(name.as_str());
            }
        }
        for name in self.output_files.keys() {
            if self.input_files.contains_key(name) {
                dupes.push(name.as_str());
            }
        }
        if dupes.is_empty() {
            return Ok(());
        }
        dupes.sort_unstable();
        dupes.dedup();
        Err(HarnessError::config(format!(
            "parameter names defined in more than one of variables/inputFiles/outputFiles: {}",
            dupes.join(", ")
        )))
    }
}

fn merged<T: Clone>(base: &BTreeMap<String, T>, overrides: &BTreeMap<String, T>) -> BTreeMap<String, T> {
    let mut out = base.clone();
    out.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

fn absolute_under(root: &Path, rel: &str) -> Result<String> {
    let joined = root.join(rel);
    let abs = std::path::absolute(&joined)
        .map_err(|e| HarnessError::env(format!("resolving {}", joined.display()), e))?;
    Ok(abs.to_string_lossy().into_owned())
}
