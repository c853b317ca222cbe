//! Persistent translation ledger.
//!
//! The ledger is the only owner of persisted state: source content hashes,
//! per-(key, language) sync status and run history. Every write is a single
//! `INSERT ... ON CONFLICT DO UPDATE` that replaces the whole row, so a
//! crash between statements can never leave a half-updated row behind.
//!
//! A `Ledger` owns one SQLite connection. Open it once at the start of a run,
//! pass it by reference to the planner and detector, and drop (or
//! [`Ledger::close`]) it at the end.

use crate::error::{LedgerError, LedgerResult};
use crate::model::{
    ImportRecord, ImportSummary, LanguageStats, ProjectStats, RunRecord, SourceHashRecord,
    SyncRecord, SyncState,
};
use chrono::{SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Highest schema version this build understands.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS ledger_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS source_hashes (
        key_path TEXT PRIMARY KEY,
        value_hash TEXT NOT NULL,
        context_sig TEXT,
        last_seen_run TEXT,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sync_status (
        key_path TEXT NOT NULL,
        lang_code TEXT NOT NULL,
        target_hash TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('CLEAN', 'DIRTY', 'FAILED', 'MANUAL', 'SKIPPED')),
        model_fingerprint TEXT,
        prompt_version TEXT,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (key_path, lang_code)
    );

    CREATE INDEX IF NOT EXISTS idx_sync_status_lang ON sync_status (lang_code, status);

    CREATE TABLE IF NOT EXISTS run_history (
        run_id TEXT PRIMARY KEY,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        model_used TEXT NOT NULL,
        tokens_in INTEGER NOT NULL DEFAULT 0,
        tokens_out INTEGER NOT NULL DEFAULT 0,
        cost_estimate_usd REAL NOT NULL DEFAULT 0,
        config_hash TEXT NOT NULL
    );
";

const SYNC_COLUMNS: &str =
    "key_path, lang_code, target_hash, status, model_fingerprint, prompt_version, updated_at";

const RUN_COLUMNS: &str = "run_id, started_at, finished_at, model_used, tokens_in, tokens_out, \
     cost_estimate_usd, config_hash";

impl ToSql for SyncState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SyncState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|raw: String| {
            FromSqlError::Other(Box::new(LedgerError::InvalidStatus(raw)))
        })
    }
}

/// RFC 3339 timestamp with fixed precision so that string order is time order.
fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("run_{}_{}", Utc::now().format("%Y%m%d%H%M%S"), &suffix[..8])
}

fn row_to_sync_record(row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
    Ok(SyncRecord {
        key_path: row.get(0)?,
        lang_code: row.get(1)?,
        target_hash: row.get(2)?,
        status: row.get(3)?,
        model_fingerprint: row.get(4)?,
        prompt_version: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_run_record(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        run_id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        model_used: row.get(3)?,
        tokens_in: row.get(4)?,
        tokens_out: row.get(5)?,
        cost_estimate_usd: row.get(6)?,
        config_hash: row.get(7)?,
    })
}

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Open (or create) the ledger file at `path`, creating parent directories.
    pub fn open(path: &Path) -> LedgerResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let ledger = Self::init(conn)?;
        info!("Opened ledger at {}", path.display());
        Ok(ledger)
    }

    /// Open a throwaway ledger that lives only as long as the value.
    pub fn open_in_memory() -> LedgerResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> LedgerResult<Self> {
        conn.execute_batch(SCHEMA)?;

        let found: Option<String> = conn
            .query_row(
                "SELECT value FROM ledger_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match found.and_then(|v| v.parse::<i64>().ok()) {
            Some(version) if version > SCHEMA_VERSION => {
                return Err(LedgerError::SchemaVersion {
                    found: version,
                    supported: SCHEMA_VERSION,
                });
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT OR REPLACE INTO ledger_meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
        }

        Ok(Self { conn })
    }

    /// Close the connection, surfacing any error SQLite reports on close.
    pub fn close(self) -> LedgerResult<()> {
        self.conn.close().map_err(|(_, e)| LedgerError::Storage(e))
    }

    // ==================== Transactions ====================

    /// Run `f` with all of its ledger writes applied atomically.
    ///
    /// The transaction commits only if `f` returns `Ok`; any error (or panic)
    /// rolls every write back. Transactions do not nest.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<LedgerError>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(LedgerError::from)?;
        let value = f(self)?;
        tx.commit().map_err(LedgerError::from)?;
        Ok(value)
    }

    /// Run `f` inside a transaction that is always rolled back.
    ///
    /// Lets a caller see the effect of its writes on later reads without
    /// persisting anything.
    pub fn with_rollback<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<LedgerError>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(LedgerError::from)?;
        let value = f(self);
        tx.rollback().map_err(LedgerError::from)?;
        value
    }

    // ==================== Source Hashes ====================

    pub fn get_source_hash(&self, key_path: &str) -> LedgerResult<Option<String>> {
        let hash = self
            .conn
            .query_row(
                "SELECT value_hash FROM source_hashes WHERE key_path = ?1",
                params![key_path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    pub fn get_source_record(&self, key_path: &str) -> LedgerResult<Option<SourceHashRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT key_path, value_hash, context_sig, last_seen_run
                 FROM source_hashes WHERE key_path = ?1",
                params![key_path],
                |row| {
                    Ok(SourceHashRecord {
                        key_path: row.get(0)?,
                        value_hash: row.get(1)?,
                        context_sig: row.get(2)?,
                        last_seen_run: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Upsert the source hash for `key_path`.
    ///
    /// Every column is overwritten, so omitting `context_sig` or `run_id`
    /// stores NULL rather than keeping the previous value.
    pub fn update_source_hash(
        &self,
        key_path: &str,
        hash: &str,
        context_sig: Option<&str>,
        run_id: Option<&str>,
    ) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO source_hashes (key_path, value_hash, context_sig, last_seen_run, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (key_path) DO UPDATE SET
                value_hash = excluded.value_hash,
                context_sig = excluded.context_sig,
                last_seen_run = excluded.last_seen_run,
                updated_at = excluded.updated_at",
            params![key_path, hash, context_sig, run_id, now_timestamp()],
        )?;
        Ok(())
    }

    /// Store a new source hash, invalidating translations of the old text.
    ///
    /// Source hashes are shared by every language. When the stored hash
    /// differs from `hash`, each `CLEAN` or `SKIPPED` pair of the key, in any
    /// language, is reset to `DIRTY` before the hash moves, so the change stays
    /// visible to pairs the current run does not touch. `MANUAL` pairs are
    /// left alone. Returns the number of pairs reset.
    pub fn advance_source_hash(
        &self,
        key_path: &str,
        hash: &str,
        context_sig: Option<&str>,
        run_id: Option<&str>,
    ) -> LedgerResult<usize> {
        let mut reset = 0;
        let changed = self
            .get_source_hash(key_path)?
            .is_some_and(|stored| stored != hash);

        if changed {
            for record in self.get_sync_records_for_key(key_path)? {
                if matches!(record.status, SyncState::Clean | SyncState::Skipped) {
                    self.update_sync_status(
                        &record.key_path,
                        &record.lang_code,
                        &record.target_hash,
                        SyncState::Dirty,
                        record.model_fingerprint.as_deref(),
                        record.prompt_version.as_deref(),
                    )?;
                    reset += 1;
                }
            }
            if reset > 0 {
                debug!("Source of {} changed, reset {} pairs to DIRTY", key_path, reset);
            }
        }

        self.update_source_hash(key_path, hash, context_sig, run_id)?;
        Ok(reset)
    }

    // ==================== Sync Status ====================

    pub fn get_sync_status(
        &self,
        key_path: &str,
        lang_code: &str,
    ) -> LedgerResult<Option<SyncRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM sync_status WHERE key_path = ?1 AND lang_code = ?2",
                    SYNC_COLUMNS
                ),
                params![key_path, lang_code],
                row_to_sync_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Replace the whole sync row for `(key_path, lang_code)`.
    pub fn update_sync_status(
        &self,
        key_path: &str,
        lang_code: &str,
        target_hash: &str,
        status: SyncState,
        model_fingerprint: Option<&str>,
        prompt_version: Option<&str>,
    ) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO sync_status
                (key_path, lang_code, target_hash, status, model_fingerprint, prompt_version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (key_path, lang_code) DO UPDATE SET
                target_hash = excluded.target_hash,
                status = excluded.status,
                model_fingerprint = excluded.model_fingerprint,
                prompt_version = excluded.prompt_version,
                updated_at = excluded.updated_at",
            params![
                key_path,
                lang_code,
                target_hash,
                status,
                model_fingerprint,
                prompt_version,
                now_timestamp()
            ],
        )?;
        Ok(())
    }

    /// Every sync row of `key_path`, ordered by language.
    pub fn get_sync_records_for_key(&self, key_path: &str) -> LedgerResult<Vec<SyncRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sync_status WHERE key_path = ?1 ORDER BY lang_code",
            SYNC_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![key_path], row_to_sync_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Delete the sync row for a pair. Returns whether a row existed.
    pub fn clear_sync_status(&self, key_path: &str, lang_code: &str) -> LedgerResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM sync_status WHERE key_path = ?1 AND lang_code = ?2",
            params![key_path, lang_code],
        )?;
        Ok(removed > 0)
    }

    /// Keys for `lang_code` whose status is `DIRTY` or `FAILED`.
    pub fn get_dirty_keys(&self, lang_code: &str) -> LedgerResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT key_path FROM sync_status
             WHERE lang_code = ?1 AND status IN ('DIRTY', 'FAILED')
             ORDER BY key_path",
        )?;
        let keys = stmt
            .query_map(params![lang_code], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// All `FAILED` rows, optionally limited to one language.
    pub fn get_failed_items(&self, lang_code: Option<&str>) -> LedgerResult<Vec<SyncRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sync_status
             WHERE status = 'FAILED' AND (?1 IS NULL OR lang_code = ?1)
             ORDER BY lang_code, key_path",
            SYNC_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![lang_code], row_to_sync_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Distinct language codes that have at least one sync row.
    pub fn tracked_languages(&self) -> LedgerResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT lang_code FROM sync_status ORDER BY lang_code")?;
        let langs = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(langs)
    }

    // ==================== Import ====================

    /// Record an existing translation as `CLEAN` without calling a provider.
    ///
    /// The source hash is stored too, so the planner sees the pair as
    /// unchanged on the next run. If that moves the key's hash, the other
    /// languages' translations of the old text are reset to `DIRTY`.
    pub fn import_existing_translation(
        &self,
        key_path: &str,
        lang_code: &str,
        source_hash: &str,
        target_hash: &str,
    ) -> LedgerResult<()> {
        self.advance_source_hash(key_path, source_hash, None, None)?;
        self.update_sync_status(
            key_path,
            lang_code,
            target_hash,
            SyncState::Clean,
            Some("import"),
            None,
        )
    }

    /// Import many records in one transaction.
    ///
    /// Pairs that are already `CLEAN` when the import starts are skipped and
    /// left untouched, as are repeated records for the same pair. Records with
    /// an empty key or language are counted as errors and skipped. A storage
    /// failure rolls back the whole import.
    pub fn bulk_import_translations(&self, records: &[ImportRecord]) -> LedgerResult<ImportSummary> {
        let summary = self.transaction(|ledger| {
            let mut summary = ImportSummary::default();
            let mut seen = HashSet::new();
            let mut pending = Vec::new();

            // Decide every record before writing: importing one language can
            // reset another language's pairs to DIRTY.
            for record in records {
                if record.key_path.is_empty() || record.lang_code.is_empty() {
                    debug!("Skipping malformed import record: {:?}", record);
                    summary.errors += 1;
                    continue;
                }

                let existing = ledger.get_sync_status(&record.key_path, &record.lang_code)?;
                let clean = matches!(existing, Some(ref r) if r.status == SyncState::Clean);
                if clean || !seen.insert((record.key_path.as_str(), record.lang_code.as_str())) {
                    summary.skipped += 1;
                    continue;
                }
                pending.push(record);
            }

            for record in pending {
                ledger.import_existing_translation(
                    &record.key_path,
                    &record.lang_code,
                    &record.source_hash,
                    &record.target_hash,
                )?;
                summary.imported += 1;
            }

            Ok::<_, LedgerError>(summary)
        })?;

        info!(
            "Bulk import: {} imported, {} skipped, {} errors",
            summary.imported, summary.skipped, summary.errors
        );
        Ok(summary)
    }

    // ==================== Run History ====================

    /// Persist a new run row and return its id.
    pub fn start_run(&self, model_used: &str, config_hash: &str) -> LedgerResult<String> {
        let run_id = new_run_id();
        self.conn.execute(
            "INSERT INTO run_history (run_id, started_at, model_used, config_hash)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, now_timestamp(), model_used, config_hash],
        )?;
        debug!("Started run {}", run_id);
        Ok(run_id)
    }

    /// Record the finish time and usage of a run. Unknown run ids are ignored.
    pub fn complete_run(
        &self,
        run_id: &str,
        tokens_in: u64,
        tokens_out: u64,
        cost_estimate_usd: f64,
    ) -> LedgerResult<()> {
        let updated = self.conn.execute(
            "UPDATE run_history
             SET finished_at = ?1, tokens_in = ?2, tokens_out = ?3, cost_estimate_usd = ?4
             WHERE run_id = ?5",
            params![
                now_timestamp(),
                tokens_in as i64,
                tokens_out as i64,
                cost_estimate_usd,
                run_id
            ],
        )?;
        if updated == 0 {
            debug!("complete_run: no run with id {}", run_id);
        }
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> LedgerResult<Option<RunRecord>> {
        let run = self
            .conn
            .query_row(
                &format!("SELECT {} FROM run_history WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id],
                row_to_run_record,
            )
            .optional()?;
        Ok(run)
    }

    /// Most recent runs first.
    pub fn recent_runs(&self, limit: usize) -> LedgerResult<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM run_history ORDER BY started_at DESC, rowid DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(params![limit as i64], row_to_run_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Delete all but the `keep_last` most recent runs. Returns rows deleted.
    pub fn cleanup_history(&self, keep_last: usize) -> LedgerResult<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM run_history WHERE run_id NOT IN (
                SELECT run_id FROM run_history ORDER BY started_at DESC, rowid DESC LIMIT ?1
            )",
            params![keep_last as i64],
        )?;
        if deleted > 0 {
            debug!("Pruned {} run history rows", deleted);
        }
        Ok(deleted)
    }

    // ==================== Stats ====================

    pub fn get_project_stats(&self) -> LedgerResult<ProjectStats> {
        let total_keys: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM source_hashes", [], |row| row.get(0))?;
        let manual_count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_status WHERE status = 'MANUAL'",
            [],
            |row| row.get(0),
        )?;

        Ok(ProjectStats {
            total_keys: total_keys as usize,
            manual_count: manual_count as usize,
        })
    }

    pub fn get_language_stats(&self, lang_code: &str) -> LedgerResult<LanguageStats> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM sync_status WHERE lang_code = ?1 GROUP BY status",
        )?;
        let counts = stmt
            .query_map(params![lang_code], |row| {
                Ok((row.get::<_, SyncState>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = LanguageStats::default();
        for (status, count) in counts {
            match status {
                SyncState::Clean => stats.translated = count,
                SyncState::Failed => stats.failed = count,
                SyncState::Dirty => stats.pending = count,
                SyncState::Manual => stats.manual = count,
                SyncState::Skipped => {}
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::compute_hash;
    use tempfile::TempDir;

    // ==================== Helper Functions ====================

    /// Create a temporary file-backed ledger for testing
    fn create_test_ledger() -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("ledger.db");
        let ledger = Ledger::open(&path).expect("Failed to open ledger");
        (ledger, temp_dir)
    }

    fn import_record(key: &str, lang: &str) -> ImportRecord {
        ImportRecord {
            key_path: key.to_string(),
            lang_code: lang.to_string(),
            source_hash: compute_hash(&format!("source {}", key)),
            target_hash: compute_hash(&format!("target {} {}", key, lang)),
        }
    }

    // ==================== Open / Schema Tests ====================

    #[test]
    fn test_open_creates_empty_ledger() {
        let (ledger, _temp_dir) = create_test_ledger();

        let stats = ledger.get_project_stats().expect("Should get stats");
        assert_eq!(stats, ProjectStats::default());
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("nested").join("dir").join("ledger.db");

        let ledger = Ledger::open(&path).expect("Should create nested dirs");
        ledger.close().expect("Should close");
        assert!(path.exists());
    }

    #[test]
    fn test_reopen_preserves_state() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("ledger.db");

        {
            let ledger = Ledger::open(&path).expect("open");
            ledger
                .update_source_hash("greeting", "h1", None, None)
                .expect("update");
            ledger.close().expect("close");
        }

        let ledger = Ledger::open(&path).expect("reopen");
        assert_eq!(
            ledger.get_source_hash("greeting").expect("get"),
            Some("h1".to_string())
        );
    }

    #[test]
    fn test_open_rejects_newer_schema() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("ledger.db");

        {
            let conn = Connection::open(&path).expect("open raw");
            conn.execute_batch(SCHEMA).expect("schema");
            conn.execute(
                "INSERT INTO ledger_meta (key, value) VALUES ('schema_version', '99')",
                [],
            )
            .expect("insert version");
        }

        match Ledger::open(&path) {
            Err(LedgerError::SchemaVersion { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            other => panic!("Expected schema version error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_open_invalid_path_fails() {
        let temp_dir = TempDir::new().expect("temp dir");
        // A directory cannot be opened as a database file
        let result = Ledger::open(temp_dir.path());
        assert!(result.is_err());
    }

    // ==================== Source Hash Tests ====================

    #[test]
    fn test_get_source_hash_absent() {
        let (ledger, _temp_dir) = create_test_ledger();
        assert_eq!(ledger.get_source_hash("missing").expect("get"), None);
    }

    #[test]
    fn test_update_source_hash_last_write_wins() {
        let (ledger, _temp_dir) = create_test_ledger();

        ledger
            .update_source_hash("title", "h1", Some("ctx"), Some("run_1"))
            .expect("first");
        ledger
            .update_source_hash("title", "h2", None, None)
            .expect("second");

        let record = ledger
            .get_source_record("title")
            .expect("get")
            .expect("exists");
        assert_eq!(record.value_hash, "h2");
        assert_eq!(record.context_sig, None, "Omitted context should be cleared");
        assert_eq!(record.last_seen_run, None);
        assert_eq!(ledger.get_project_stats().expect("stats").total_keys, 1);
    }

    #[test]
    fn test_advance_source_hash_resets_pairs_of_changed_key() {
        let (ledger, _temp_dir) = create_test_ledger();
        ledger.update_source_hash("greeting", "old", None, None).expect("seed hash");
        for (lang, status) in [
            ("de", SyncState::Clean),
            ("es", SyncState::Manual),
            ("fr", SyncState::Failed),
            ("it", SyncState::Skipped),
        ] {
            ledger
                .update_sync_status("greeting", lang, "tgt", status, Some("fp"), Some("2"))
                .expect("seed status");
        }

        let reset = ledger
            .advance_source_hash("greeting", "new", None, Some("run_1"))
            .expect("advance");

        assert_eq!(reset, 2);
        let status = |lang: &str| {
            ledger
                .get_sync_status("greeting", lang)
                .expect("get")
                .expect("exists")
        };
        assert_eq!(status("de").status, SyncState::Dirty);
        assert_eq!(status("de").target_hash, "tgt");
        assert_eq!(status("de").model_fingerprint.as_deref(), Some("fp"));
        assert_eq!(status("it").status, SyncState::Dirty);
        assert_eq!(status("es").status, SyncState::Manual);
        assert_eq!(status("fr").status, SyncState::Failed);
        assert_eq!(
            ledger.get_source_hash("greeting").expect("get"),
            Some("new".to_string())
        );
    }

    #[test]
    fn test_advance_source_hash_keeps_pairs_when_unchanged() {
        let (ledger, _temp_dir) = create_test_ledger();
        ledger
            .update_sync_status("greeting", "de", "tgt", SyncState::Clean, None, None)
            .expect("seed status");

        // First sighting of the key: nothing to invalidate
        let first = ledger
            .advance_source_hash("greeting", "h1", None, None)
            .expect("first");
        let again = ledger
            .advance_source_hash("greeting", "h1", None, None)
            .expect("again");

        assert_eq!(first, 0);
        assert_eq!(again, 0);
        let record = ledger.get_sync_status("greeting", "de").expect("get").expect("exists");
        assert_eq!(record.status, SyncState::Clean);
    }

    // ==================== Sync Status Tests ====================

    #[test]
    fn test_get_sync_status_absent() {
        let (ledger, _temp_dir) = create_test_ledger();
        assert!(ledger.get_sync_status("k", "fr").expect("get").is_none());
    }

    #[test]
    fn test_update_sync_status_full_row_replace() {
        let (ledger, _temp_dir) = create_test_ledger();

        ledger
            .update_sync_status("k", "fr", "t1", SyncState::Clean, Some("openai:gpt"), Some("v1"))
            .expect("first");
        ledger
            .update_sync_status("k", "fr", "t2", SyncState::Failed, None, None)
            .expect("second");

        let record = ledger.get_sync_status("k", "fr").expect("get").expect("exists");
        assert_eq!(record.target_hash, "t2");
        assert_eq!(record.status, SyncState::Failed);
        assert_eq!(record.model_fingerprint, None);
        assert_eq!(record.prompt_version, None);
    }

    #[test]
    fn test_sync_status_is_keyed_by_pair() {
        let (ledger, _temp_dir) = create_test_ledger();

        ledger
            .update_sync_status("k", "fr", "t-fr", SyncState::Clean, None, None)
            .expect("fr");
        ledger
            .update_sync_status("k", "de", "t-de", SyncState::Failed, None, None)
            .expect("de");

        let fr = ledger.get_sync_status("k", "fr").expect("get").expect("fr");
        let de = ledger.get_sync_status("k", "de").expect("get").expect("de");
        assert_eq!(fr.status, SyncState::Clean);
        assert_eq!(de.status, SyncState::Failed);
    }

    #[test]
    fn test_sync_status_timestamp_is_rfc3339() {
        let (ledger, _temp_dir) = create_test_ledger();

        let before = Utc::now();
        ledger
            .update_sync_status("k", "fr", "t", SyncState::Clean, None, None)
            .expect("update");
        let after = Utc::now();

        let record = ledger.get_sync_status("k", "fr").expect("get").expect("exists");
        let updated_at = chrono::DateTime::parse_from_rfc3339(&record.updated_at)
            .expect("Should be valid RFC3339")
            .with_timezone(&Utc);
        assert!(updated_at >= before - chrono::Duration::milliseconds(1));
        assert!(updated_at <= after);
    }

    #[test]
    fn test_check_constraint_rejects_unknown_status() {
        let (ledger, _temp_dir) = create_test_ledger();

        let result = ledger.conn.execute(
            "INSERT INTO sync_status (key_path, lang_code, target_hash, status, updated_at)
             VALUES ('k', 'fr', 't', 'PENDING', 'now')",
            [],
        );
        assert!(result.is_err(), "CHECK constraint should reject PENDING");
    }

    #[test]
    fn test_clear_sync_status() {
        let (ledger, _temp_dir) = create_test_ledger();

        ledger
            .update_sync_status("k", "fr", "t", SyncState::Manual, None, None)
            .expect("update");
        assert!(ledger.clear_sync_status("k", "fr").expect("clear"));
        assert!(!ledger.clear_sync_status("k", "fr").expect("clear again"));
        assert!(ledger.get_sync_status("k", "fr").expect("get").is_none());
    }

    #[test]
    fn test_get_dirty_keys_includes_dirty_and_failed() {
        let (ledger, _temp_dir) = create_test_ledger();

        for (key, status) in [
            ("a", SyncState::Clean),
            ("b", SyncState::Dirty),
            ("c", SyncState::Failed),
            ("d", SyncState::Manual),
            ("e", SyncState::Skipped),
        ] {
            ledger
                .update_sync_status(key, "fr", "t", status, None, None)
                .expect("update");
        }
        ledger
            .update_sync_status("z", "de", "t", SyncState::Dirty, None, None)
            .expect("other language");

        assert_eq!(ledger.get_dirty_keys("fr").expect("dirty"), vec!["b", "c"]);
    }

    #[test]
    fn test_get_failed_items_with_and_without_language() {
        let (ledger, _temp_dir) = create_test_ledger();

        ledger
            .update_sync_status("a", "fr", "t", SyncState::Failed, None, None)
            .expect("a");
        ledger
            .update_sync_status("b", "de", "t", SyncState::Failed, None, None)
            .expect("b");
        ledger
            .update_sync_status("c", "de", "t", SyncState::Clean, None, None)
            .expect("c");

        let all = ledger.get_failed_items(None).expect("all");
        assert_eq!(all.len(), 2);

        let de = ledger.get_failed_items(Some("de")).expect("de");
        assert_eq!(de.len(), 1);
        assert_eq!(de[0].key_path, "b");
        assert_eq!(de[0].status, SyncState::Failed);
    }

    #[test]
    fn test_tracked_languages() {
        let (ledger, _temp_dir) = create_test_ledger();

        ledger
            .update_sync_status("a", "fr", "t", SyncState::Clean, None, None)
            .expect("fr");
        ledger
            .update_sync_status("a", "de", "t", SyncState::Clean, None, None)
            .expect("de");

        assert_eq!(ledger.tracked_languages().expect("langs"), vec!["de", "fr"]);
    }

    // ==================== Transaction Tests ====================

    #[test]
    fn test_transaction_commits_on_success() {
        let (ledger, _temp_dir) = create_test_ledger();

        ledger
            .transaction(|l| {
                l.update_source_hash("a", "h1", None, None)?;
                l.update_source_hash("b", "h2", None, None)?;
                Ok::<_, LedgerError>(())
            })
            .expect("transaction");

        assert_eq!(ledger.get_project_stats().expect("stats").total_keys, 2);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let (ledger, _temp_dir) = create_test_ledger();

        let result: anyhow::Result<()> = ledger.transaction(|l| {
            l.update_source_hash("a", "h1", None, None)?;
            anyhow::bail!("abort halfway");
        });

        assert!(result.is_err());
        assert_eq!(ledger.get_source_hash("a").expect("get"), None);
    }

    #[test]
    fn test_with_rollback_discards_writes() {
        let (ledger, _temp_dir) = create_test_ledger();

        let seen = ledger
            .with_rollback(|l| {
                l.update_source_hash("a", "h1", None, None)?;
                l.get_source_hash("a")
            })
            .expect("rollback scope");

        assert_eq!(seen.as_deref(), Some("h1"));
        assert_eq!(ledger.get_source_hash("a").expect("get"), None);
    }

    // ==================== Import Tests ====================

    #[test]
    fn test_import_existing_translation_marks_clean() {
        let (ledger, _temp_dir) = create_test_ledger();

        ledger
            .import_existing_translation("greeting", "fr", "src-h", "tgt-h")
            .expect("import");

        let record = ledger
            .get_sync_status("greeting", "fr")
            .expect("get")
            .expect("exists");
        assert_eq!(record.status, SyncState::Clean);
        assert_eq!(record.target_hash, "tgt-h");
        assert_eq!(
            ledger.get_source_hash("greeting").expect("get"),
            Some("src-h".to_string())
        );
    }

    #[test]
    fn test_bulk_import_counts() {
        let (ledger, _temp_dir) = create_test_ledger();

        let mut malformed = import_record("", "fr");
        malformed.key_path = String::new();
        let records = vec![import_record("a", "fr"), import_record("b", "fr"), malformed];

        let summary = ledger.bulk_import_translations(&records).expect("import");
        assert_eq!(
            summary,
            ImportSummary {
                imported: 2,
                skipped: 0,
                errors: 1
            }
        );
    }

    #[test]
    fn test_bulk_import_is_idempotent() {
        let (ledger, _temp_dir) = create_test_ledger();
        let records = vec![import_record("greeting", "fr")];

        ledger.bulk_import_translations(&records).expect("first");
        let before = ledger
            .get_sync_status("greeting", "fr")
            .expect("get")
            .expect("exists");

        let second = ledger.bulk_import_translations(&records).expect("second");
        assert_eq!(second.imported, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(second.errors, 0);

        let after = ledger
            .get_sync_status("greeting", "fr")
            .expect("get")
            .expect("exists");
        assert_eq!(before, after, "Row should be unchanged after re-import");
    }

    #[test]
    fn test_bulk_import_overwrites_failed_pair() {
        let (ledger, _temp_dir) = create_test_ledger();

        ledger
            .update_sync_status("a", "fr", "old", SyncState::Failed, None, None)
            .expect("seed");
        let summary = ledger
            .bulk_import_translations(&[import_record("a", "fr")])
            .expect("import");

        assert_eq!(summary.imported, 1);
        let record = ledger.get_sync_status("a", "fr").expect("get").expect("exists");
        assert_eq!(record.status, SyncState::Clean);
    }

    #[test]
    fn test_import_with_new_source_invalidates_other_languages() {
        let (ledger, _temp_dir) = create_test_ledger();
        ledger.update_source_hash("a", "old-src", None, None).expect("seed hash");
        ledger
            .update_sync_status("a", "de", "de-old", SyncState::Clean, None, None)
            .expect("seed de");
        ledger
            .update_sync_status("a", "fr", "fr-old", SyncState::Failed, None, None)
            .expect("seed fr");

        // The de record is still in the target file, but it was CLEAN against
        // the old source and must not be re-imported as current.
        let records = vec![
            ImportRecord {
                key_path: "a".to_string(),
                lang_code: "fr".to_string(),
                source_hash: "new-src".to_string(),
                target_hash: "fr-new".to_string(),
            },
            ImportRecord {
                key_path: "a".to_string(),
                lang_code: "de".to_string(),
                source_hash: "new-src".to_string(),
                target_hash: "de-old".to_string(),
            },
        ];
        let summary = ledger.bulk_import_translations(&records).expect("import");

        assert_eq!(summary.imported, 1);
        assert_eq!(summary.skipped, 1);
        let fr = ledger.get_sync_status("a", "fr").expect("get").expect("exists");
        let de = ledger.get_sync_status("a", "de").expect("get").expect("exists");
        assert_eq!(fr.status, SyncState::Clean);
        assert_eq!(de.status, SyncState::Dirty);
        assert_eq!(de.target_hash, "de-old");
        assert_eq!(ledger.get_source_hash("a").expect("get"), Some("new-src".to_string()));
    }

    #[test]
    fn test_bulk_import_skips_repeated_pair() {
        let (ledger, _temp_dir) = create_test_ledger();
        let records = vec![import_record("a", "fr"), import_record("a", "fr")];

        let summary = ledger.bulk_import_translations(&records).expect("import");
        assert_eq!(summary.imported, 1);
        assert_eq!(summary.skipped, 1);
    }

    // ==================== Run History Tests ====================

    #[test]
    fn test_start_run_persists_row() {
        let (ledger, _temp_dir) = create_test_ledger();

        let run_id = ledger.start_run("openai:gpt-4o-mini", "cfg").expect("start");
        assert!(run_id.starts_with("run_"));

        let run = ledger.get_run(&run_id).expect("get").expect("exists");
        assert_eq!(run.model_used, "openai:gpt-4o-mini");
        assert_eq!(run.config_hash, "cfg");
        assert!(run.finished_at.is_none());
    }

    #[test]
    fn test_run_ids_are_unique() {
        let (ledger, _temp_dir) = create_test_ledger();

        let ids: std::collections::HashSet<String> = (0..50)
            .map(|_| ledger.start_run("m", "c").expect("start"))
            .collect();
        assert_eq!(ids.len(), 50);
    }

    #[test]
    fn test_complete_run_records_usage() {
        let (ledger, _temp_dir) = create_test_ledger();

        let run_id = ledger.start_run("m", "c").expect("start");
        ledger
            .complete_run(&run_id, 1200, 800, 0.042)
            .expect("complete");

        let run = ledger.get_run(&run_id).expect("get").expect("exists");
        assert!(run.finished_at.is_some());
        assert_eq!(run.tokens_in, 1200);
        assert_eq!(run.tokens_out, 800);
        assert!((run.cost_estimate_usd - 0.042).abs() < f64::EPSILON);
    }

    #[test]
    fn test_complete_unknown_run_is_noop() {
        let (ledger, _temp_dir) = create_test_ledger();

        ledger
            .complete_run("run_missing", 1, 1, 0.0)
            .expect("Should silently ignore unknown run");
        assert!(ledger.recent_runs(10).expect("runs").is_empty());
    }

    #[test]
    fn test_cleanup_history_keeps_most_recent() {
        let (ledger, _temp_dir) = create_test_ledger();

        let ids: Vec<String> = (0..15)
            .map(|_| ledger.start_run("m", "c").expect("start"))
            .collect();

        let deleted = ledger.cleanup_history(10).expect("cleanup");
        assert_eq!(deleted, 5);

        let remaining = ledger.recent_runs(100).expect("runs");
        assert_eq!(remaining.len(), 10);
        assert_eq!(remaining[0].run_id, ids[14], "Newest run should survive");
        assert!(remaining.iter().all(|r| !ids[..5].contains(&r.run_id)));
    }

    #[test]
    fn test_cleanup_history_keep_zero_removes_all() {
        let (ledger, _temp_dir) = create_test_ledger();

        ledger.start_run("m", "c").expect("start");
        ledger.start_run("m", "c").expect("start");

        assert_eq!(ledger.cleanup_history(0).expect("cleanup"), 2);
        assert!(ledger.recent_runs(10).expect("runs").is_empty());
    }

    // ==================== Stats Tests ====================

    #[test]
    fn test_project_stats() {
        let (ledger, _temp_dir) = create_test_ledger();

        ledger.update_source_hash("a", "h", None, None).expect("a");
        ledger.update_source_hash("b", "h", None, None).expect("b");
        ledger
            .update_sync_status("a", "fr", "t", SyncState::Manual, None, None)
            .expect("manual");
        ledger
            .update_sync_status("b", "fr", "t", SyncState::Clean, None, None)
            .expect("clean");

        let stats = ledger.get_project_stats().expect("stats");
        assert_eq!(stats.total_keys, 2);
        assert_eq!(stats.manual_count, 1);
    }

    #[test]
    fn test_language_stats() {
        let (ledger, _temp_dir) = create_test_ledger();

        for (key, status) in [
            ("a", SyncState::Clean),
            ("b", SyncState::Clean),
            ("c", SyncState::Failed),
            ("d", SyncState::Dirty),
            ("e", SyncState::Manual),
        ] {
            ledger
                .update_sync_status(key, "fr", "t", status, None, None)
                .expect("update");
        }

        let stats = ledger.get_language_stats("fr").expect("stats");
        assert_eq!(stats.translated, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.manual, 1);

        assert_eq!(
            ledger.get_language_stats("de").expect("stats"),
            LanguageStats::default()
        );
    }
}
