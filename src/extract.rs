//! JSON source extraction.
//!
//! Nested objects are flattened into dot-delimited key paths in document
//! order. Array elements are addressed by index (`steps.0`). Only string
//! leaves are translatable. A sibling key with the `@context` suffix
//! (`"save@context": "button label"`) attaches a translator hint to `save`
//! and is not itself a unit.

use crate::model::SourceUnit;
use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const CONTEXT_SUFFIX: &str = "@context";

/// Current schema version stamped on extracted units.
pub const SCHEMA_VERSION: u32 = 1;

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

#[derive(Default)]
struct Flattened {
    strings: Vec<(String, String)>,
    contexts: HashMap<String, String>,
}

fn flatten_object(map: &Map<String, Value>, prefix: &str, out: &mut Flattened) {
    for (key, value) in map {
        if let Some(base) = key.strip_suffix(CONTEXT_SUFFIX) {
            if let Value::String(hint) = value {
                out.contexts.insert(join_key(prefix, base), hint.clone());
            }
            continue;
        }
        flatten_value(value, &join_key(prefix, key), out);
    }
}

fn flatten_value(value: &Value, path: &str, out: &mut Flattened) {
    match value {
        Value::String(text) => out.strings.push((path.to_string(), text.clone())),
        Value::Object(map) => flatten_object(map, path, out),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_value(item, &join_key(path, &index.to_string()), out);
            }
        }
        Value::Number(_) | Value::Bool(_) | Value::Null => {}
    }
}

fn parse_root(content: &str, origin: &str) -> Result<Map<String, Value>> {
    let value: Value =
        serde_json::from_str(content).with_context(|| format!("Failed to parse JSON in {}", origin))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("{} must contain a JSON object at the top level", origin),
    }
}

/// Extracts [`SourceUnit`]s from JSON translation files.
#[derive(Debug, Clone, Copy)]
pub struct JsonExtractor {
    schema_version: u32,
}

impl Default for JsonExtractor {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
        }
    }
}

impl JsonExtractor {
    pub fn new(schema_version: u32) -> Self {
        Self { schema_version }
    }

    pub fn extract(&self, path: &Path) -> Result<Vec<SourceUnit>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read source file {}", path.display()))?;
        self.extract_str(&content, &path.to_string_lossy())
    }

    /// Extract units from JSON text; `source_file` feeds the unit ids.
    pub fn extract_str(&self, content: &str, source_file: &str) -> Result<Vec<SourceUnit>> {
        let root = parse_root(content, source_file)?;
        let mut flat = Flattened::default();
        flatten_object(&root, "", &mut flat);

        let units = flat
            .strings
            .into_iter()
            .map(|(key_path, text)| {
                let context = flat.contexts.get(&key_path).cloned();
                let unit = SourceUnit::new(key_path, text, source_file, self.schema_version);
                match context {
                    Some(hint) => unit.with_context(hint),
                    None => unit,
                }
            })
            .collect();

        Ok(units)
    }
}

/// Flat `key_path -> text` view of an existing target file.
///
/// A missing file is an empty map; an unreadable or malformed one is an error.
pub fn read_flat(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read target file {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let root = parse_root(&content, &path.to_string_lossy())?;
    let mut flat = Flattened::default();
    flatten_object(&root, "", &mut flat);
    Ok(flat.strings.into_iter().collect())
}
