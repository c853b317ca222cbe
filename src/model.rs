//! Core data model shared by the ledger, planner and validator.

use crate::hashing::{compute_hash, extract_placeholders, generate_unit_id};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One translatable string extracted from a source file.
///
/// Built fresh on every extraction pass. Only `source_hash` is ever persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    pub unit_id: String,
    pub key_path: String,
    pub source_text: String,
    pub source_hash: String,
    pub placeholders: Vec<String>,
    pub source_file: String,
    pub schema_version: u32,
    pub context: Option<String>,
}

impl SourceUnit {
    /// Build a unit, deriving its id, hash and placeholder set from the text.
    pub fn new(
        key_path: impl Into<String>,
        source_text: impl Into<String>,
        source_file: impl Into<String>,
        schema_version: u32,
    ) -> Self {
        let key_path = key_path.into();
        let source_text = source_text.into();
        let source_file = source_file.into();

        Self {
            unit_id: generate_unit_id(&key_path, &source_file),
            source_hash: compute_hash(&source_text),
            placeholders: extract_placeholders(&source_text),
            key_path,
            source_text,
            source_file,
            schema_version,
            context: None,
        }
    }

    /// Attach a free-text hint for the translator.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Sync status of one `(key_path, lang_code)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncState {
    Clean,
    Dirty,
    Failed,
    Manual,
    Skipped,
}

impl SyncState {
    pub const ALL: [SyncState; 5] = [
        SyncState::Clean,
        SyncState::Dirty,
        SyncState::Failed,
        SyncState::Manual,
        SyncState::Skipped,
    ];

    /// The literal stored in the ledger's `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Clean => "CLEAN",
            SyncState::Dirty => "DIRTY",
            SyncState::Failed => "FAILED",
            SyncState::Manual => "MANUAL",
            SyncState::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// A row of the `source_hashes` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHashRecord {
    pub key_path: String,
    pub value_hash: String,
    pub context_sig: Option<String>,
    pub last_seen_run: Option<String>,
}

/// A row of the `sync_status` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRecord {
    pub key_path: String,
    pub lang_code: String,
    pub target_hash: String,
    pub status: SyncState,
    pub model_fingerprint: Option<String>,
    pub prompt_version: Option<String>,
    pub updated_at: String,
}

/// A row of the `run_history` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub model_used: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_estimate_usd: f64,
    pub config_hash: String,
}

/// An existing translation to be recorded as `CLEAN` without a provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    pub key_path: String,
    pub lang_code: String,
    pub source_hash: String,
    pub target_hash: String,
}

/// Outcome counts of a bulk import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProjectStats {
    pub total_keys: usize,
    pub manual_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LanguageStats {
    pub translated: usize,
    pub failed: usize,
    pub pending: usize,
    pub manual: usize,
}

/// Why the planner included a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    NewKey,
    Modified,
    Retry,
}

/// Units destined for one target language, sent to a provider together.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationBatch {
    pub lang_code: String,
    pub units: Vec<SourceUnit>,
    pub reasons: Vec<PlanReason>,
    /// Hash of the members' source hashes. Audit only.
    pub deduplication_key: String,
}

impl TranslationBatch {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Per-language view of a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LanguagePlanSummary {
    pub lang_code: String,
    pub new_keys: usize,
    pub modified: usize,
    pub retries: usize,
    pub manual_protected: usize,
    pub up_to_date: usize,
}

impl LanguagePlanSummary {
    pub fn included(&self) -> usize {
        self.new_keys + self.modified + self.retries
    }
}

/// Everything a run needs to translate, computed from scratch each run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslationPlan {
    pub batches: Vec<TranslationBatch>,
    pub total_units: usize,
    pub estimated_cost: f64,
    pub languages: Vec<LanguagePlanSummary>,
}

impl TranslationPlan {
    pub fn is_empty(&self) -> bool {
        self.total_units == 0
    }
}

/// One translated string returned by a provider, matched to its unit by position.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationResult {
    pub translated_text: String,
    pub confidence: Option<f64>,
}

impl TranslationResult {
    pub fn new(translated_text: impl Into<String>) -> Self {
        Self {
            translated_text: translated_text.into(),
            confidence: None,
        }
    }
}
