//! Sync orchestration.
//!
//! A sync run goes through these steps:
//!
//! 1. extract source units
//! 2. record blank units as `SKIPPED`
//! 3. on `--force`, reset in-scope pairs to `DIRTY`
//! 4. detect hand edits in every target file and mark them `MANUAL`
//! 5. plan
//! 6. mark planned pairs `DIRTY` and store the new source hashes; the other
//!    pairs of a changed key go back to `DIRTY` too
//! 7. translate batches concurrently, then validate, write and commit each one
//! 8. close the run and prune history
//!
//! Steps 2-6 run in one ledger transaction. A dry run performs steps 2-5
//! inside a rolled-back transaction and stops without touching a provider. Once step 6 has committed, a
//! crash leaves every unfinished pair `DIRTY`, which the next plan retries.

use crate::config::Config;
use crate::error::{LedgerError, LedgerResult};
use crate::extract::{read_flat, JsonExtractor};
use crate::hashing::compute_hash;
use crate::ledger::Ledger;
use crate::manual_override::ManualOverrideDetector;
use crate::model::{
    ImportRecord, ImportSummary, LanguagePlanSummary, LanguageStats, ProjectStats, RunRecord,
    SourceUnit, SyncRecord, SyncState, TranslationBatch, TranslationPlan,
};
use crate::planner::IncrementalPlanner;
use crate::provider::{PromptBuilder, ProviderResponse, TranslationProvider, PROMPT_VERSION};
use crate::validation::ValidationPipeline;
use crate::writer::JsonWriter;
use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Runs shown by `status`.
const RECENT_RUN_LIMIT: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub dry_run: bool,
    /// Regenerate every in-scope pair, including manual overrides.
    pub force: bool,
    /// Restrict the run to these target locales. Empty means all.
    pub languages: Vec<String>,
    /// Only retry pairs currently `FAILED`.
    pub only_failed: bool,
}

impl SyncOptions {
    pub fn retry(languages: Vec<String>) -> Self {
        Self {
            languages,
            only_failed: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// `None` for dry runs, which are not recorded.
    pub run_id: Option<String>,
    pub planned_units: usize,
    pub translated_units: usize,
    pub failed_units: usize,
    pub skipped_units: usize,
    /// Pairs held back because they are manual overrides.
    pub manual_overrides: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub estimated_cost: f64,
    pub languages: Vec<LanguagePlanSummary>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LanguageStatus {
    pub lang_code: String,
    #[serde(flatten)]
    pub stats: LanguageStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub project: ProjectStats,
    pub languages: Vec<LanguageStatus>,
    pub failed: Vec<SyncRecord>,
    pub recent_runs: Vec<RunRecord>,
}

/// Result of the pre-translation steps.
struct Prepared {
    plan: TranslationPlan,
    skipped: usize,
    detected_manual: usize,
}

pub struct Compiler<'a> {
    config: &'a Config,
    ledger: &'a Ledger,
    extractor: JsonExtractor,
    writer: JsonWriter,
    validator: ValidationPipeline,
    prompts: PromptBuilder,
}

impl<'a> Compiler<'a> {
    pub fn new(config: &'a Config, ledger: &'a Ledger) -> Self {
        Self {
            config,
            ledger,
            extractor: JsonExtractor::default(),
            writer: JsonWriter::new(),
            validator: ValidationPipeline::new(config.validation.clone()),
            prompts: PromptBuilder::new(
                config.source_locale.clone(),
                config.validation.brand_names.clone(),
            ),
        }
    }

    // ==================== Sync ====================

    pub async fn sync(
        &self,
        provider: &dyn TranslationProvider,
        options: &SyncOptions,
    ) -> Result<SyncReport> {
        if options.dry_run {
            return self.plan_only(options);
        }

        let languages = self.languages_in_scope(&options.languages)?;
        let units = self.extract_units()?;
        let (blank, translatable): (Vec<SourceUnit>, Vec<SourceUnit>) =
            units.iter().cloned().partition(is_blank);
        let mut report = SyncReport::default();

        let run_id = self
            .ledger
            .start_run(&provider.model_fingerprint(), &self.config.config_hash())
            .context("Failed to record run start")?;
        info!("Starting run {}", run_id);

        let prepared = self.ledger.transaction(|_| {
            let prepared = self.prepare(&blank, &translatable, &languages, options)?;
            self.mark_planned_dirty(&prepared.plan)?;
            self.record_source_hashes(&units, &run_id)?;
            Ok::<_, anyhow::Error>(prepared)
        })?;
        report.run_id = Some(run_id.clone());
        report.apply_plan(&prepared);

        if prepared.plan.is_empty() {
            info!("Everything is up to date");
        } else {
            info!(
                "Translating {} units in {} batches",
                prepared.plan.total_units,
                prepared.plan.batches.len()
            );
            self.dispatch(provider, prepared.plan.batches, &mut report)
                .await?;
        }

        report.cost_usd = provider.estimate_cost(report.tokens_in, report.tokens_out);
        self.ledger
            .complete_run(&run_id, report.tokens_in, report.tokens_out, report.cost_usd)
            .context("Failed to record run completion")?;
        self.ledger
            .cleanup_history(self.config.advanced.history_retention)
            .context("Failed to prune run history")?;

        info!(
            "Run {} finished: {} translated, {} failed, {} manual, {} skipped",
            run_id,
            report.translated_units,
            report.failed_units,
            report.manual_overrides,
            report.skipped_units
        );
        Ok(report)
    }

    /// Work out what a sync with `options` would translate, without a
    /// provider and without persisting anything.
    pub fn plan_only(&self, options: &SyncOptions) -> Result<SyncReport> {
        let languages = self.languages_in_scope(&options.languages)?;
        let units = self.extract_units()?;
        let (blank, translatable): (Vec<SourceUnit>, Vec<SourceUnit>) =
            units.into_iter().partition(is_blank);

        let prepared = self
            .ledger
            .with_rollback(|_| self.prepare(&blank, &translatable, &languages, options))?;
        let mut report = SyncReport {
            dry_run: true,
            ..SyncReport::default()
        };
        report.apply_plan(&prepared);
        info!(
            "Dry run: {} units in {} batches would be translated (est. ${:.4})",
            report.planned_units,
            prepared.plan.batches.len(),
            report.estimated_cost
        );
        Ok(report)
    }

    /// Sync restricted to `FAILED` pairs.
    pub async fn retry(
        &self,
        provider: &dyn TranslationProvider,
        languages: Vec<String>,
    ) -> Result<SyncReport> {
        self.sync(provider, &SyncOptions::retry(languages)).await
    }

    fn languages_in_scope(&self, requested: &[String]) -> Result<Vec<String>> {
        if let Some(unknown) = requested
            .iter()
            .find(|lang| !self.config.target_locales.contains(lang))
        {
            bail!("'{}' is not a configured target locale", unknown);
        }

        Ok(self
            .config
            .target_locales
            .iter()
            .filter(|lang| requested.is_empty() || requested.contains(lang))
            .cloned()
            .collect())
    }

    fn extract_units(&self) -> Result<Vec<SourceUnit>> {
        let path = self.config.source_path();
        let units = self.extractor.extract(&path)?;
        info!("Extracted {} units from {}", units.len(), path.display());
        Ok(units)
    }

    fn prepare(
        &self,
        blank: &[SourceUnit],
        translatable: &[SourceUnit],
        languages: &[String],
        options: &SyncOptions,
    ) -> Result<Prepared> {
        let skipped = self.record_skipped(blank, languages)?;
        if options.force {
            self.reset_pairs(translatable, languages)?;
        }
        // Every locale, so a hand edit outside the run's scope is protected
        // before a source change can invalidate it
        let detected_manual =
            self.detect_manual_edits(translatable, &self.config.target_locales)?;
        let plan = self.plan(translatable, languages, options.only_failed)?;

        Ok(Prepared {
            plan,
            skipped,
            detected_manual,
        })
    }

    fn record_skipped(&self, blank: &[SourceUnit], languages: &[String]) -> Result<usize> {
        for unit in blank {
            for lang in languages {
                let current = self.ledger.get_sync_status(&unit.key_path, lang)?;
                if current.map(|r| r.status) != Some(SyncState::Skipped) {
                    self.ledger.update_sync_status(
                        &unit.key_path,
                        lang,
                        "",
                        SyncState::Skipped,
                        None,
                        None,
                    )?;
                }
            }
        }
        Ok(blank.len() * languages.len())
    }

    /// Forced regeneration: move every existing pair back to `DIRTY`.
    fn reset_pairs(&self, units: &[SourceUnit], languages: &[String]) -> Result<()> {
        let mut reset = 0;
        for unit in units {
            for lang in languages {
                let Some(record) = self.ledger.get_sync_status(&unit.key_path, lang)? else {
                    continue;
                };
                if record.status != SyncState::Dirty {
                    set_status_keeping_hash(self.ledger, &record, SyncState::Dirty)?;
                    reset += 1;
                }
            }
        }
        info!("Forced regeneration of {} pairs", reset);
        Ok(())
    }

    /// Compare target files against the ledger and flag hand edits.
    fn detect_manual_edits(&self, units: &[SourceUnit], languages: &[String]) -> Result<usize> {
        let detector = ManualOverrideDetector::new(self.ledger);
        let mut detected = 0;

        for lang in languages {
            let target_path = self.config.output_path(lang);
            let current = read_flat(&target_path)?;

            for unit in units {
                let Some(record) = self.ledger.get_sync_status(&unit.key_path, lang)? else {
                    continue;
                };
                if record.status != SyncState::Clean {
                    continue;
                }

                match current.get(&unit.key_path) {
                    Some(text) => {
                        let current_hash = compute_hash(text);
                        if detector.is_manual_override(&unit.key_path, lang, &current_hash)? {
                            detector.mark_as_manual_override(&unit.key_path, lang, &current_hash)?;
                            detected += 1;
                        }
                    }
                    None => {
                        // Removed from the target file, so write it again
                        debug!(
                            "{} missing from {}, scheduling regeneration",
                            unit.key_path,
                            target_path.display()
                        );
                        set_status_keeping_hash(self.ledger, &record, SyncState::Dirty)?;
                    }
                }
            }
        }

        if detected > 0 {
            info!("Detected {} new manual overrides", detected);
        }
        Ok(detected)
    }

    fn plan(
        &self,
        units: &[SourceUnit],
        languages: &[String],
        only_failed: bool,
    ) -> Result<TranslationPlan> {
        let planner =
            IncrementalPlanner::with_batch_size(self.ledger, self.config.advanced.batch_size);
        if !only_failed {
            return planner.create_plan(units, languages);
        }

        let mut plan = TranslationPlan::default();
        for lang in languages {
            let failed: HashSet<String> = self
                .ledger
                .get_failed_items(Some(lang))?
                .into_iter()
                .map(|record| record.key_path)
                .collect();
            let retry_units: Vec<SourceUnit> = units
                .iter()
                .filter(|unit| failed.contains(&unit.key_path))
                .cloned()
                .collect();

            let partial = planner.create_plan(&retry_units, std::slice::from_ref(lang))?;
            plan.total_units += partial.total_units;
            plan.estimated_cost += partial.estimated_cost;
            plan.batches.extend(partial.batches);
            plan.languages.extend(partial.languages);
        }
        Ok(plan)
    }

    fn mark_planned_dirty(&self, plan: &TranslationPlan) -> Result<()> {
        for batch in &plan.batches {
            for unit in &batch.units {
                match self.ledger.get_sync_status(&unit.key_path, &batch.lang_code)? {
                    Some(record) => set_status_keeping_hash(self.ledger, &record, SyncState::Dirty)?,
                    None => self.ledger.update_sync_status(
                        &unit.key_path,
                        &batch.lang_code,
                        "",
                        SyncState::Dirty,
                        None,
                        None,
                    )?,
                }
            }
        }
        Ok(())
    }

    /// Store the hashes this run planned against.
    ///
    /// A changed key also invalidates the pairs the run did not plan (other
    /// languages on a `--lang` run, non-failed pairs on a retry), so a later
    /// full sync still picks them up.
    fn record_source_hashes(&self, units: &[SourceUnit], run_id: &str) -> Result<()> {
        let mut invalidated = 0;
        for unit in units {
            let context_sig = unit.context.as_deref().map(compute_hash);
            if is_blank(unit) {
                // Blank units keep their SKIPPED rows
                self.ledger.update_source_hash(
                    &unit.key_path,
                    &unit.source_hash,
                    context_sig.as_deref(),
                    Some(run_id),
                )?;
            } else {
                invalidated += self.ledger.advance_source_hash(
                    &unit.key_path,
                    &unit.source_hash,
                    context_sig.as_deref(),
                    Some(run_id),
                )?;
            }
        }
        if invalidated > 0 {
            info!("{} pairs outside this run's plan were invalidated by source edits", invalidated);
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        provider: &dyn TranslationProvider,
        batches: Vec<TranslationBatch>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let fingerprint = provider.model_fingerprint();
        let prompts = &self.prompts;

        let mut outcomes = stream::iter(batches)
            .map(move |batch| async move {
                let prompt = prompts.build(&batch);
                let outcome = provider.translate(&batch, &prompt).await;
                (batch, outcome)
            })
            .buffer_unordered(self.config.advanced.concurrency.max(1));

        while let Some((batch, outcome)) = outcomes.next().await {
            match outcome {
                Ok(response) => self.commit_batch(&batch, response, &fingerprint, report)?,
                Err(e) => {
                    warn!(
                        "Batch of {} units for {} failed: {}",
                        batch.len(),
                        batch.lang_code,
                        e
                    );
                    // Unparseable replies are still billed
                    let (tokens_in, tokens_out) = e.usage();
                    report.tokens_in += tokens_in;
                    report.tokens_out += tokens_out;
                    self.ledger.transaction(|ledger| {
                        for unit in &batch.units {
                            mark_failed(ledger, &unit.key_path, &batch.lang_code, &fingerprint)?;
                        }
                        Ok::<_, LedgerError>(())
                    })?;
                    report.failed_units += batch.len();
                }
            }
        }
        Ok(())
    }

    /// Validate one batch, write the accepted translations, then commit.
    fn commit_batch(
        &self,
        batch: &TranslationBatch,
        response: ProviderResponse,
        fingerprint: &str,
        report: &mut SyncReport,
    ) -> Result<()> {
        report.tokens_in += response.tokens_in;
        report.tokens_out += response.tokens_out;

        let mut accepted: Vec<(&SourceUnit, String)> = Vec::new();
        let mut rejected: Vec<&SourceUnit> = Vec::new();

        for (unit, result) in batch.units.iter().zip(response.results) {
            let verdict = self.validator.validate(&result, unit);
            if verdict.is_valid {
                if !verdict.warnings.is_empty() {
                    debug!(
                        "{} ({}) accepted with confidence {:.2}",
                        unit.key_path, batch.lang_code, verdict.confidence
                    );
                }
                accepted.push((unit, result.translated_text));
            } else {
                warn!(
                    "Rejected translation of {} ({}): {}",
                    unit.key_path,
                    batch.lang_code,
                    verdict.error_summary()
                );
                rejected.push(unit);
            }
        }
        // Units without a matching result
        let answered = accepted.len() + rejected.len();
        rejected.extend(batch.units.iter().skip(answered));

        if !accepted.is_empty() {
            let path = self.config.output_path(&batch.lang_code);
            self.writer
                .write(
                    &path,
                    accepted
                        .iter()
                        .map(|(unit, text)| (unit.key_path.as_str(), text.as_str())),
                )
                .with_context(|| format!("Failed to write translations to {}", path.display()))?;
        }

        self.ledger.transaction(|ledger| {
            for (unit, text) in &accepted {
                ledger.update_sync_status(
                    &unit.key_path,
                    &batch.lang_code,
                    &compute_hash(text),
                    SyncState::Clean,
                    Some(fingerprint),
                    Some(PROMPT_VERSION),
                )?;
            }
            for unit in &rejected {
                mark_failed(ledger, &unit.key_path, &batch.lang_code, fingerprint)?;
            }
            Ok::<_, LedgerError>(())
        })?;

        report.translated_units += accepted.len();
        report.failed_units += rejected.len();
        Ok(())
    }

    // ==================== Import / Status ====================

    /// Bootstrap the ledger from translations already present on disk.
    pub fn import_existing(&self) -> Result<ImportSummary> {
        let units = self.extract_units()?;
        let mut records = Vec::new();

        for lang in &self.config.target_locales {
            let path = self.config.output_path(lang);
            let existing = read_flat(&path)?;
            if existing.is_empty() {
                debug!("No existing translations at {}", path.display());
                continue;
            }

            records.extend(units.iter().filter_map(|unit| {
                existing
                    .get(&unit.key_path)
                    .filter(|text| !text.trim().is_empty())
                    .map(|text| ImportRecord {
                        key_path: unit.key_path.clone(),
                        lang_code: lang.clone(),
                        source_hash: unit.source_hash.clone(),
                        target_hash: compute_hash(text),
                    })
            }));
        }

        let summary = self
            .ledger
            .bulk_import_translations(&records)
            .context("Failed to import existing translations")?;
        Ok(summary)
    }

    pub fn status(&self) -> Result<StatusReport> {
        let languages = self
            .config
            .target_locales
            .iter()
            .map(|lang| {
                Ok(LanguageStatus {
                    lang_code: lang.clone(),
                    stats: self.ledger.get_language_stats(lang)?,
                })
            })
            .collect::<LedgerResult<Vec<_>>>()?;

        Ok(StatusReport {
            project: self.ledger.get_project_stats()?,
            languages,
            failed: self.ledger.get_failed_items(None)?,
            recent_runs: self.ledger.recent_runs(RECENT_RUN_LIMIT)?,
        })
    }

    /// Keep only the `keep` most recent runs.
    pub fn prune_history(&self, keep: usize) -> Result<usize> {
        let deleted = self.ledger.cleanup_history(keep)?;
        info!("Removed {} run history entries", deleted);
        Ok(deleted)
    }
}

impl SyncReport {
    fn apply_plan(&mut self, prepared: &Prepared) {
        self.planned_units = prepared.plan.total_units;
        self.estimated_cost = prepared.plan.estimated_cost;
        self.skipped_units = prepared.skipped;
        self.manual_overrides = prepared
            .plan
            .languages
            .iter()
            .map(|summary| summary.manual_protected)
            .sum();
        self.languages = prepared.plan.languages.clone();
        debug!("{} manual overrides detected this run", prepared.detected_manual);
    }
}

fn is_blank(unit: &SourceUnit) -> bool {
    unit.source_text.trim().is_empty()
}

fn set_status_keeping_hash(ledger: &Ledger, record: &SyncRecord, status: SyncState) -> LedgerResult<()> {
    ledger.update_sync_status(
        &record.key_path,
        &record.lang_code,
        &record.target_hash,
        status,
        record.model_fingerprint.as_deref(),
        record.prompt_version.as_deref(),
    )
}

fn mark_failed(ledger: &Ledger, key_path: &str, lang_code: &str, fingerprint: &str) -> LedgerResult<()> {
    let previous_hash = ledger
        .get_sync_status(key_path, lang_code)?
        .map(|record| record.target_hash)
        .unwrap_or_default();
    ledger.update_sync_status(
        key_path,
        lang_code,
        &previous_hash,
        SyncState::Failed,
        Some(fingerprint),
        Some(PROMPT_VERSION),
    )
}
