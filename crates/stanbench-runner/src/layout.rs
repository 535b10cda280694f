//! Uniquely named files and directories inside scoped directories.
//!
//! Names are `<prefix><random><suffix>` and are created with `O_EXCL`
//! semantics, so an existing file is never overwritten. Nothing here is
//! removed on drop.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::Result;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Creates a fresh, empty directory `<parent>/<prefix><random>`.
pub fn fresh_dir(parent: &Path, prefix: &str) -> Result<PathBuf> {
    ensure_dir(parent)?;
    let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(parent)?;
    Ok(dir.keep())
}

/// Writes `bytes` into a freshly created `<dir>/<prefix><random><suffix>`.
pub fn write_fresh_file(dir: &Path, prefix: &str, suffix: &str, bytes: &[u8]) -> Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Indented JSON with object keys sorted at every level.
pub fn to_sorted_json_pretty(value: &Value) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(&sort_keys(value))?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sort_keys(&map[key.as_str()]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
