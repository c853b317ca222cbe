//! Target file writer.
//!
//! Translations are merged into the existing target file: keys that are not
//! being written keep their current values, so hand-edited entries survive.
//! The merged document goes to a temp file in the same directory and is
//! renamed over the target, so readers never see a half-written file.

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonWriter;

impl JsonWriter {
    pub fn new() -> Self {
        Self
    }

    /// Merge `entries` (flat key paths) into the JSON file at `path`.
    pub fn write<'a, I>(&self, path: &Path, entries: I) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut root = load_document(path)?;

        let mut written = 0;
        for (key_path, text) in entries {
            set_path(&mut root, key_path, text)
                .with_context(|| format!("Failed to place key {} in {}", key_path, path.display()))?;
            written += 1;
        }

        write_atomic(path, &root)?;
        debug!("Wrote {} entries to {}", written, path.display());
        Ok(written)
    }
}

fn load_document(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(Value::Object(Map::new()));
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read target file {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse target file {}", path.display()))?;
    if !value.is_object() {
        bail!("{} must contain a JSON object at the top level", path.display());
    }
    Ok(value)
}

/// Set a dot-delimited path, creating intermediate objects as needed.
///
/// A numeric segment indexes into an existing array; anywhere else it is an
/// ordinary object key.
fn set_path(root: &mut Value, key_path: &str, text: &str) -> Result<()> {
    let segments: Vec<&str> = key_path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        bail!("empty key path");
    };

    let mut current = root;
    for segment in parents {
        current = child_mut(current, segment)?;
    }

    match current {
        Value::Array(items) => {
            let index: usize = last
                .parse()
                .with_context(|| format!("'{}' is not an array index", last))?;
            if index < items.len() {
                items[index] = Value::String(text.to_string());
            } else if index == items.len() {
                items.push(Value::String(text.to_string()));
            } else {
                bail!("array index {} is out of range", index);
            }
        }
        Value::Object(map) => {
            map.insert(last.to_string(), Value::String(text.to_string()));
        }
        _ => bail!("parent of '{}' is not an object", last),
    }
    Ok(())
}

fn child_mut<'v>(value: &'v mut Value, segment: &str) -> Result<&'v mut Value> {
    match value {
        Value::Array(items) => {
            let index: usize = segment
                .parse()
                .with_context(|| format!("'{}' is not an array index", segment))?;
            if index == items.len() {
                items.push(Value::Object(Map::new()));
            }
            match items.get_mut(index) {
                Some(item) => Ok(item),
                None => bail!("array index {} is out of range", index),
            }
        }
        Value::Object(map) => {
            let entry = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            // A string sitting where an object is needed gets replaced
            if !entry.is_object() && !entry.is_array() {
                *entry = Value::Object(Map::new());
            }
            Ok(entry)
        }
        _ => bail!("cannot descend into '{}'", segment),
    }
}

fn write_atomic(path: &Path, document: &Value) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let mut temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut temp, document).context("Failed to serialize target file")?;
    temp.write_all(b"\n")?;
    temp.flush()?;

    temp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
