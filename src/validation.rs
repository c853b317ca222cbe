//! Translation quality gate.
//!
//! Runs a fixed sequence of independent checks over one provider result:
//!
//! 1. non-empty (error, short-circuits with confidence 0)
//! 2. placeholder preservation (error, optional)
//! 3. length ratio (warning)
//! 4. source leakage (error, optional)
//! 5. brand-name protection (warning, optional)
//!
//! Errors make a result invalid. Warnings only lower the confidence score.
//! Nothing here touches the ledger; the caller turns the verdict into a
//! `CLEAN` or `FAILED` status.

use crate::hashing::extract_placeholders;
use crate::model::{SourceUnit, TranslationResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

const PLACEHOLDER_PENALTY: f64 = 0.5;
const LENGTH_RATIO_PENALTY: f64 = 0.8;
const LEAKAGE_PENALTY: f64 = 0.3;

/// Share of source words that may reappear in a translation before it is
/// treated as untranslated.
const LEAKAGE_WORD_OVERLAP: f64 = 0.8;

/// The validation knobs read from the `validation` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationConfig {
    pub preserve_placeholders: bool,
    pub max_length_ratio: f64,
    pub prevent_source_leakage: bool,
    pub brand_names: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            preserve_placeholders: true,
            max_length_ratio: 3.0,
            prevent_source_leakage: true,
            brand_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationErrorKind {
    EmptyTranslation,
    MissingPlaceholder,
    ExtraPlaceholder,
    SourceLeakage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationWarningKind {
    LengthRatioExceeded,
    MissingBrandName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub message: String,
    /// The placeholder concerned, for placeholder errors.
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationWarning {
    pub kind: ValidationWarningKind,
    pub message: String,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationErrorKind::EmptyTranslation => "EMPTY_TRANSLATION",
            ValidationErrorKind::MissingPlaceholder => "MISSING_PLACEHOLDER",
            ValidationErrorKind::ExtraPlaceholder => "EXTRA_PLACEHOLDER",
            ValidationErrorKind::SourceLeakage => "SOURCE_LEAKAGE",
        };
        f.write_str(name)
    }
}

/// Verdict for one translation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    /// Product of every applied penalty, in `[0, 1]`.
    pub confidence: f64,
}

impl ValidationResult {
    pub fn has_error(&self, kind: ValidationErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }

    pub fn has_warning(&self, kind: ValidationWarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    /// Comma-separated error kinds, for log lines.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.kind.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Accumulates findings while the checks run.
struct Findings {
    errors: Vec<ValidationError>,
    warnings: Vec<ValidationWarning>,
    confidence: f64,
}

impl Findings {
    fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            confidence: 1.0,
        }
    }

    fn error(&mut self, kind: ValidationErrorKind, message: String, token: Option<String>) {
        self.errors.push(ValidationError {
            kind,
            message,
            token,
        });
    }

    fn warning(&mut self, kind: ValidationWarningKind, message: String) {
        self.warnings.push(ValidationWarning { kind, message });
    }

    fn finish(self) -> ValidationResult {
        ValidationResult {
            is_valid: self.errors.is_empty(),
            errors: self.errors,
            warnings: self.warnings,
            confidence: self.confidence.clamp(0.0, 1.0),
        }
    }
}

/// Stateless validator configured once per run.
#[derive(Debug, Clone, Default)]
pub struct ValidationPipeline {
    config: ValidationConfig,
}

impl ValidationPipeline {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validate one provider result against the unit it translates.
    pub fn validate(&self, result: &TranslationResult, unit: &SourceUnit) -> ValidationResult {
        let translated = result.translated_text.as_str();
        let mut findings = Findings::new();

        if translated.trim().is_empty() {
            findings.error(
                ValidationErrorKind::EmptyTranslation,
                format!("Translation for '{}' is empty", unit.key_path),
                None,
            );
            findings.confidence = 0.0;
            return findings.finish();
        }

        if self.config.preserve_placeholders {
            check_placeholders(&mut findings, unit, translated);
        }

        check_length_ratio(&mut findings, unit, translated, self.config.max_length_ratio);

        if self.config.prevent_source_leakage {
            check_source_leakage(&mut findings, unit, translated);
        }

        if !self.config.brand_names.is_empty() {
            check_brand_names(&mut findings, unit, translated, &self.config.brand_names);
        }

        findings.finish()
    }
}

fn check_placeholders(findings: &mut Findings, unit: &SourceUnit, translated: &str) {
    let expected: BTreeSet<&str> = unit.placeholders.iter().map(String::as_str).collect();
    let found_list = extract_placeholders(translated);
    let found: BTreeSet<&str> = found_list.iter().map(String::as_str).collect();

    let mut failed = false;

    for missing in expected.difference(&found) {
        findings.error(
            ValidationErrorKind::MissingPlaceholder,
            format!("Placeholder {} is missing from the translation", missing),
            Some(missing.to_string()),
        );
        failed = true;
    }

    for extra in found.difference(&expected) {
        findings.error(
            ValidationErrorKind::ExtraPlaceholder,
            format!("Placeholder {} does not exist in the source", extra),
            Some(extra.to_string()),
        );
        failed = true;
    }

    if failed {
        findings.confidence *= PLACEHOLDER_PENALTY;
    }
}

fn check_length_ratio(findings: &mut Findings, unit: &SourceUnit, translated: &str, max: f64) {
    let source_len = unit.source_text.chars().count();
    if source_len == 0 {
        return;
    }

    let ratio = translated.chars().count() as f64 / source_len as f64;
    if ratio > max {
        findings.warning(
            ValidationWarningKind::LengthRatioExceeded,
            format!(
                "Translation is {:.1}x the source length (max {:.1}x)",
                ratio, max
            ),
        );
        findings.confidence *= LENGTH_RATIO_PENALTY;
    }
}

fn check_source_leakage(findings: &mut Findings, unit: &SourceUnit, translated: &str) {
    let source = unit.source_text.trim().to_lowercase();
    let target = translated.trim().to_lowercase();

    let leaked = if source == target {
        true
    } else {
        let source_words: Vec<&str> = source.split_whitespace().collect();
        let target_words: HashSet<&str> = target.split_whitespace().collect();
        if source_words.is_empty() {
            false
        } else {
            let shared = source_words
                .iter()
                .filter(|word| target_words.contains(*word))
                .count();
            shared as f64 / source_words.len() as f64 > LEAKAGE_WORD_OVERLAP
        }
    };

    if leaked {
        findings.error(
            ValidationErrorKind::SourceLeakage,
            format!("Translation for '{}' looks untranslated", unit.key_path),
            None,
        );
        findings.confidence *= LEAKAGE_PENALTY;
    }
}

fn check_brand_names(findings: &mut Findings, unit: &SourceUnit, translated: &str, brands: &[String]) {
    for brand in brands {
        if brand.is_empty() || !unit.source_text.contains(brand.as_str()) {
            continue;
        }
        if !translated.contains(brand.as_str()) {
            findings.warning(
                ValidationWarningKind::MissingBrandName,
                format!("Brand name '{}' was not preserved", brand),
            );
        }
    }
}
