use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{HarnessError, Result};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| HarnessError::env(format!("creating directory {}", path.display()), e))
}

/// Writes through a temp file in the same directory, then renames over `path`.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let context = || format!("writing {}", path.display());
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, std::process::id(), nanos));
    let mut file = fs::File::create(&tmp).map_err(|e| HarnessError::env(context(), e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| HarnessError::env(context(), e))?;
    fs::rename(&tmp, path).map_err(|e| HarnessError::env(context(), e))?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &serde_json::Value) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| HarnessError::env(format!("encoding {}", path.display()), e.into()))?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .map_err(|e| HarnessError::env(format!("reading {}", path.display()), e))?;
    Ok(sha256_bytes(&bytes))
}
