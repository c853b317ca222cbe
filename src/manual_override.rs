//! Detection and marking of hand-edited translations.
//!
//! A pair is a manual override when its stored status is `MANUAL`, or when it
//! is `CLEAN` but the target file no longer hashes to what the ledger last
//! wrote. Once marked, the flag sticks until the caller explicitly resets
//! the status (forced regeneration).

use crate::ledger::Ledger;
use crate::model::SyncState;
use anyhow::{Context, Result};
use tracing::info;

pub struct ManualOverrideDetector<'a> {
    ledger: &'a Ledger,
}

impl<'a> ManualOverrideDetector<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self { ledger }
    }

    /// Whether `(key_path, lang_code)` must be protected from regeneration.
    ///
    /// `current_target_hash` is the hash of the value currently in the target
    /// file.
    pub fn is_manual_override(
        &self,
        key_path: &str,
        lang_code: &str,
        current_target_hash: &str,
    ) -> Result<bool> {
        let record = self
            .ledger
            .get_sync_status(key_path, lang_code)
            .with_context(|| format!("Failed to read sync status for {} ({})", key_path, lang_code))?;

        Ok(match record {
            None => false,
            Some(r) => match r.status {
                SyncState::Manual => true,
                SyncState::Clean => r.target_hash != current_target_hash,
                SyncState::Dirty | SyncState::Failed | SyncState::Skipped => false,
            },
        })
    }

    /// Flag a pair as manually maintained.
    pub fn mark_as_manual_override(
        &self,
        key_path: &str,
        lang_code: &str,
        target_hash: &str,
    ) -> Result<()> {
        self.ledger
            .update_sync_status(key_path, lang_code, target_hash, SyncState::Manual, None, None)
            .with_context(|| format!("Failed to mark {} ({}) as manual", key_path, lang_code))?;
        info!("Marked {} ({}) as manual override", key_path, lang_code);
        Ok(())
    }
}
