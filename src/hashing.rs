//! Content hashing and placeholder extraction.
//!
//! Everything here is a pure function. The ledger treats `compute_hash` as the
//! oracle for "did this text change", so its output format must never change
//! for an existing ledger.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Length of the identifiers produced by [`generate_unit_id`].
pub const UNIT_ID_LENGTH: usize = 16;

// One regex per supported syntax, compiled once
static DOUBLE_BRACE_REGEX: OnceLock<Regex> = OnceLock::new();
static SINGLE_BRACE_REGEX: OnceLock<Regex> = OnceLock::new();
static DOLLAR_BRACE_REGEX: OnceLock<Regex> = OnceLock::new();
static PRINTF_REGEX: OnceLock<Regex> = OnceLock::new();
static POSITIONAL_REGEX: OnceLock<Regex> = OnceLock::new();

/// Compute the SHA-256 digest of `content` as 64 lowercase hex characters.
pub fn compute_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Extract every placeholder token from `text`.
///
/// Supported syntaxes are `{name}`, `{{name}}`, `${name}`, `%s`/`%d`/`%i`/`%f`
/// and `$1`, `$2`, ... The result is the deduplicated, sorted union of the
/// literal matches of every syntax. Because the syntaxes overlap, `{{count}}`
/// yields both `{{count}}` and `{count}`, and `${var}` yields both `${var}`
/// and `{var}`.
pub fn extract_placeholders(text: &str) -> Vec<String> {
    let patterns = [
        DOUBLE_BRACE_REGEX.get_or_init(|| Regex::new(r"\{\{\w+\}\}").unwrap()),
        SINGLE_BRACE_REGEX.get_or_init(|| Regex::new(r"\{\w+\}").unwrap()),
        DOLLAR_BRACE_REGEX.get_or_init(|| Regex::new(r"\$\{\w+\}").unwrap()),
        PRINTF_REGEX.get_or_init(|| Regex::new(r"%[sdif]").unwrap()),
        POSITIONAL_REGEX.get_or_init(|| Regex::new(r"\$\d+").unwrap()),
    ];

    let found: BTreeSet<String> = patterns
        .iter()
        .flat_map(|regex| regex.find_iter(text).map(|m| m.as_str().to_string()))
        .collect();

    found.into_iter().collect()
}

/// Derive a stable short identifier for a unit from its file and key path.
///
/// The identifier is the first [`UNIT_ID_LENGTH`] hex characters of
/// `compute_hash("<source_file>:<key_path>")`.
pub fn generate_unit_id(key_path: &str, source_file: &str) -> String {
    let mut digest = compute_hash(&format!("{}:{}", source_file, key_path));
    digest.truncate(UNIT_ID_LENGTH);
    digest
}
