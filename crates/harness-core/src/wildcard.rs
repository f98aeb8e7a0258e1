use std::path::{Path, PathBuf, MAIN_SEPARATOR};

/// Runtime values substituted for `$$name$$` markers in parameter values.
#[derive(Debug, Clone)]
pub struct WildcardContext {
    pub run_id: String,
    pub model_path: PathBuf,
    pub output_path: PathBuf,
    pub output_metadata_path: PathBuf,
}

impl WildcardContext {
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "run_id" => Some(self.run_id.clone()),
            "model_path" => Some(dir_string(&self.model_path)),
            "output_path" => Some(dir_string(&self.output_path)),
            "output_metadata_path" => Some(dir_string(&self.output_metadata_path)),
            _ => None,
        }
    }

    /// Replaces every known wildcard in `text`. Unknown wildcards stay verbatim.
    pub fn replace(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("$$") {
            let after = &rest[start + 2..];
            let Some(end) = after.find("$$") else {
                break;
            };
            let name = &after[..end];
            out.push_str(&rest[..start]);
            if !is_wildcard_name(name) {
                out.push_str("$$");
                rest = after;
                continue;
            }
            match self.lookup(name) {
                Some(value) => out.push_str(&value),
                None => {
                    tracing::warn!(wildcard = name, "unmatched wildcard in parameters");
                    out.push_str("$$");
                    out.push_str(name);
                    out.push_str("$$");
                }
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        out
    }
}

fn is_wildcard_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c.is_whitespace() || c == '(' || c == '$')
}

fn dir_string(path: &Path) -> String {
    let mut s = path.to_string_lossy().into_owned();
    if !s.ends_with(MAIN_SEPARATOR) {
        s.push(MAIN_SEPARATOR);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> WildcardContext {
        WildcardContext {
            run_id: "17".to_string(),
            model_path: PathBuf::from("/models/proj"),
            output_path: PathBuf::from("/out/run_17"),
            output_metadata_path: PathBuf::from("/out/run_17/metadata"),
        }
    }

    #[test]
    fn replaces_known_wildcards_inside_text() {
        let c = ctx();
        assert_eq!(c.replace("run-$$run_id$$.csv"), "run-17.csv");
        assert_eq!(
            c.replace("$$output_path$$plots/a.png"),
            format!("/out/run_17{}plots/a.png", MAIN_SEPARATOR)
        );
        assert_eq!(c.replace("$$run_id$$_$$run_id$$"), "17_17");
    }

    #[test]
    fn unknown_and_malformed_markers_are_left_alone() {
        let c = ctx();
        assert_eq!(c.replace("$$nope$$-$$run_id$$"), "$$nope$$-17");
        assert_eq!(c.replace("cost $$ 5 $$run_id$$"), "cost $$ 5 17");
        assert_eq!(c.replace("dangling $$run_id"), "dangling $$run_id");
        assert_eq!(c.replace("plain"), "plain");
    }
}
