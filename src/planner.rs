//! Incremental translation planning.
//!
//! For every `(unit, language)` pair the planner compares the unit's current
//! source hash with the ledger and decides whether the pair needs work.
//! Decisions, in precedence order:
//!
//! | stored status        | source changed | decision          |
//! |----------------------|----------------|-------------------|
//! | none                 | any            | include (new key) |
//! | `MANUAL`             | any            | exclude           |
//! | any other            | yes            | include (modified)|
//! | `FAILED` / `DIRTY`   | no             | include (retry)   |
//! | `CLEAN` / `SKIPPED`  | no             | exclude           |
//!
//! The planner only reads the ledger.

use crate::hashing::compute_hash;
use crate::ledger::Ledger;
use crate::model::{
    LanguagePlanSummary, PlanReason, SourceUnit, SyncState, TranslationBatch, TranslationPlan,
};
use anyhow::{Context, Result};
use tracing::{debug, info};

pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Rough token count per unit used for the advisory cost estimate.
pub const AVERAGE_TOKENS_PER_UNIT: f64 = 100.0;

/// Rough USD price per 1k tokens used for the advisory cost estimate.
pub const AVERAGE_COST_PER_1K_TOKENS: f64 = 0.01;

/// What to do with one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairDecision {
    Include(PlanReason),
    ExcludeManual,
    ExcludeUpToDate,
}

/// Pure decision table, kept separate from ledger access so it can be
/// checked exhaustively.
pub fn decide(status: Option<SyncState>, source_changed: bool) -> PairDecision {
    match status {
        None => PairDecision::Include(PlanReason::NewKey),
        Some(SyncState::Manual) => PairDecision::ExcludeManual,
        Some(_) if source_changed => PairDecision::Include(PlanReason::Modified),
        Some(SyncState::Failed) | Some(SyncState::Dirty) => PairDecision::Include(PlanReason::Retry),
        Some(SyncState::Clean) | Some(SyncState::Skipped) => PairDecision::ExcludeUpToDate,
    }
}

/// Advisory cost estimate for `total_units` units.
pub fn estimate_cost(total_units: usize) -> f64 {
    total_units as f64 * AVERAGE_TOKENS_PER_UNIT / 1000.0 * AVERAGE_COST_PER_1K_TOKENS
}

/// Audit key of a batch: the hash of its members' source hashes, in order.
pub fn deduplication_key(units: &[SourceUnit]) -> String {
    let joined: String = units.iter().map(|u| u.source_hash.as_str()).collect();
    compute_hash(&joined)
}

pub struct IncrementalPlanner<'a> {
    ledger: &'a Ledger,
    batch_size: usize,
}

impl<'a> IncrementalPlanner<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self::with_batch_size(ledger, DEFAULT_BATCH_SIZE)
    }

    /// A batch size of 0 is treated as 1.
    pub fn with_batch_size(ledger: &'a Ledger, batch_size: usize) -> Self {
        Self {
            ledger,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Build the plan for `units` across `target_languages`.
    ///
    /// Only ledger read failures produce an error.
    pub fn create_plan(
        &self,
        units: &[SourceUnit],
        target_languages: &[String],
    ) -> Result<TranslationPlan> {
        let mut plan = TranslationPlan::default();

        for lang in target_languages {
            let mut summary = LanguagePlanSummary {
                lang_code: lang.clone(),
                ..LanguagePlanSummary::default()
            };
            let mut selected: Vec<(SourceUnit, PlanReason)> = Vec::new();

            for unit in units {
                let stored_hash = self
                    .ledger
                    .get_source_hash(&unit.key_path)
                    .with_context(|| format!("Failed to read source hash for {}", unit.key_path))?;
                let source_changed = stored_hash.as_deref() != Some(unit.source_hash.as_str());

                let status = self
                    .ledger
                    .get_sync_status(&unit.key_path, lang)
                    .with_context(|| {
                        format!("Failed to read sync status for {} ({})", unit.key_path, lang)
                    })?
                    .map(|record| record.status);

                match decide(status, source_changed) {
                    PairDecision::Include(reason) => {
                        match reason {
                            PlanReason::NewKey => summary.new_keys += 1,
                            PlanReason::Modified => summary.modified += 1,
                            PlanReason::Retry => summary.retries += 1,
                        }
                        selected.push((unit.clone(), reason));
                    }
                    PairDecision::ExcludeManual => {
                        debug!("Skipping manual override {} ({})", unit.key_path, lang);
                        summary.manual_protected += 1;
                    }
                    PairDecision::ExcludeUpToDate => summary.up_to_date += 1,
                }
            }

            plan.total_units += selected.len();
            plan.batches.extend(self.make_batches(lang, selected));

            info!(
                "Plan for {}: {} new, {} modified, {} retry, {} manual, {} up to date",
                lang,
                summary.new_keys,
                summary.modified,
                summary.retries,
                summary.manual_protected,
                summary.up_to_date
            );
            plan.languages.push(summary);
        }

        plan.estimated_cost = estimate_cost(plan.total_units);
        Ok(plan)
    }

    fn make_batches(
        &self,
        lang: &str,
        selected: Vec<(SourceUnit, PlanReason)>,
    ) -> Vec<TranslationBatch> {
        selected
            .chunks(self.batch_size)
            .map(|chunk| {
                let units: Vec<SourceUnit> = chunk.iter().map(|(u, _)| u.clone()).collect();
                TranslationBatch {
                    lang_code: lang.to_string(),
                    reasons: chunk.iter().map(|(_, r)| *r).collect(),
                    deduplication_key: deduplication_key(&units),
                    units,
                }
            })
            .collect()
    }
}
