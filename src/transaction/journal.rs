//! Bounded journal of transaction records.
//!
//! The journal lives next to the snapshots as `journal.json`. Each record is
//! upserted while its transaction runs, so an interrupted transaction still
//! shows which diffs were applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{KeystoneError, Result, SerializationError, StateError};
use crate::planner::DiffMetadata;
use crate::serialization::JOURNAL_DOCUMENT;
use crate::state::StateStore;

use super::state::TransactionState;

/// Default number of records kept.
pub const JOURNAL_LIMIT: usize = 100;

/// Audit record of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Transaction id.
    pub id: String,
    /// When the transaction began.
    pub started_at: DateTime<Utc>,
    /// When the transaction reached a final state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// State at the time of recording.
    pub status: TransactionState,
    /// Model diffs of the transaction.
    #[serde(default)]
    pub model_diffs: Vec<DiffMetadata>,
    /// Diffs applied so far, in apply order.
    #[serde(default)]
    pub applied: Vec<DiffMetadata>,
    /// Fingerprints of the documents written.
    #[serde(default)]
    pub fingerprints: BTreeMap<String, String>,
    /// Error that stopped the transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Most recent transaction records, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Journal {
    records: Vec<TransactionRecord>,
}

impl Journal {
    /// Loads the journal, returning an empty one when none was saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the document is malformed.
    pub async fn load<S: StateStore + ?Sized>(store: &S) -> Result<Self> {
        match store.get_state(JOURNAL_DOCUMENT).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                KeystoneError::Serialization(SerializationError::json(JOURNAL_DOCUMENT, e))
            }),
            Err(KeystoneError::State(StateError::NoState { .. })) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Saves the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn save<S: StateStore + ?Sized>(&self, store: &S) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| {
            KeystoneError::Serialization(SerializationError::json(JOURNAL_DOCUMENT, e))
        })?;
        store.save_state(JOURNAL_DOCUMENT, &bytes).await
    }

    /// Inserts or replaces the record with the same id, keeping at most
    /// `limit` records.
    pub fn upsert(&mut self, record: TransactionRecord, limit: usize) {
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
        if self.records.len() > limit {
            let excess = self.records.len() - limit;
            self.records.drain(..excess);
            debug!("Trimmed {excess} journal records");
        }
    }

    /// Records, oldest first.
    #[must_use]
    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    /// Most recent record.
    #[must_use]
    pub fn latest(&self) -> Option<&TransactionRecord> {
        self.records.last()
    }

    /// Record with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&TransactionRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no transaction was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Appends or updates `record` in the stored journal.
///
/// # Errors
///
/// Returns an error if the journal cannot be loaded or saved.
pub async fn record<S: StateStore + ?Sized>(
    store: &S,
    record: TransactionRecord,
    limit: usize,
) -> Result<()> {
    let mut journal = Journal::load(store).await?;
    journal.upsert(record, limit);
    journal.save(store).await
}
