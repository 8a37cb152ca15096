use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::profile::MigrationProfile;
use crate::record::{CandidateRecord, JoinRecord, Partition};
use crate::store::Cursor;

/// One fixed-size window of a partition's candidate records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub records: Vec<CandidateRecord>,
    /// Resumes the scan after the last record. `None` on an empty page.
    #[serde(skip)]
    pub cursor: Option<Cursor>,
    /// True iff the window came back full.
    pub has_more: bool,
    pub batch_number: u32,
    /// Records fetched across every page of the session so far.
    pub total_processed: u64,
    pub fetched_at: DateTime<Utc>,
}

impl Page {
    pub fn empty() -> Self {
        Page {
            records: Vec::new(),
            cursor: None,
            has_more: false,
            batch_number: 0,
            total_processed: 0,
            fetched_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Per-record failure while assembling a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFailure {
    pub id: String,
    pub reason: String,
}

/// Result of writing one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub batch_number: u32,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    pub updated_ids: Vec<String>,
    pub failures: Vec<RecordFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Entry of a session's debug log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub context: Option<serde_json::Value>,
}

/// The state of one end-to-end migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub seed: Option<CandidateRecord>,
    pub join_record: Option<JoinRecord>,
    pub partition_key: Option<String>,
    pub target_value: Option<String>,
    pub current_page: Page,
    pub pages: Vec<Page>,
    pub total_updated: u64,
    pub total_skipped: u64,
    pub total_errors: u64,
    pub is_complete: bool,
    pub no_eligible_candidates: bool,
    pub migration_complete: bool,
    pub batch_results: Vec<BatchOutcome>,
    /// Ids written during this session; never written twice.
    pub migrated_ids: HashSet<String>,
    pub debug_log: Vec<DebugEntry>,
}

impl MigrationSession {
    /// A session over a selected partition, starting at its first page.
    pub fn new(
        seed: CandidateRecord,
        join_record: JoinRecord,
        partition_key: String,
        target_value: String,
        first_page: Page,
    ) -> Self {
        let is_complete = !first_page.has_more;
        MigrationSession {
            session_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            seed: Some(seed),
            join_record: Some(join_record),
            partition_key: Some(partition_key),
            target_value: Some(target_value),
            current_page: first_page.clone(),
            pages: vec![first_page],
            total_updated: 0,
            total_skipped: 0,
            total_errors: 0,
            is_complete,
            no_eligible_candidates: false,
            migration_complete: false,
            batch_results: Vec::new(),
            migrated_ids: HashSet::new(),
            debug_log: Vec::new(),
        }
    }

    /// Terminal session for a store with nothing to migrate.
    pub fn empty() -> Self {
        MigrationSession {
            session_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            seed: None,
            join_record: None,
            partition_key: None,
            target_value: None,
            current_page: Page::empty(),
            pages: Vec::new(),
            total_updated: 0,
            total_skipped: 0,
            total_errors: 0,
            is_complete: true,
            no_eligible_candidates: true,
            migration_complete: true,
            batch_results: Vec::new(),
            migrated_ids: HashSet::new(),
            debug_log: Vec::new(),
        }
    }

    /// True once the sentinel flags froze the session.
    pub fn is_frozen(&self) -> bool {
        self.no_eligible_candidates || self.migration_complete
    }

    /// The session's partition. The seed carries the stored key value; a
    /// session without a matching seed falls back to the key as a string.
    pub fn partition(&self, profile: &MigrationProfile) -> Option<Partition> {
        let key = self.partition_key.as_deref()?;
        self.seed
            .as_ref()
            .and_then(|seed| seed.partition(profile))
            .filter(|p| p.key == key)
            .or_else(|| Some(Partition::from_key(key)))
    }

    pub fn push_page(&mut self, page: Page) {
        self.is_complete = !page.has_more;
        self.current_page = page.clone();
        self.pages.push(page);
    }

    pub fn apply_outcome(&mut self, outcome: &BatchOutcome) {
        self.total_updated += outcome.updated;
        self.total_skipped += outcome.skipped;
        self.total_errors += outcome.errors;
        self.migrated_ids.extend(outcome.updated_ids.iter().cloned());
        self.batch_results.push(outcome.clone());
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>, context: Option<serde_json::Value>) {
        self.debug_log.push(DebugEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            context,
        });
    }

    pub fn errors(&self) -> impl Iterator<Item = &DebugEntry> {
        self.debug_log.iter().filter(|e| e.level == LogLevel::Error)
    }

    pub fn summary(&self) -> MigrationSummary {
        let duration_ms = (Utc::now() - self.started_at).num_milliseconds().max(0) as u64;
        MigrationSummary {
            session_id: self.session_id.clone(),
            partition_key: self.partition_key.clone(),
            target_value: self.target_value.clone(),
            batches_loaded: self.pages.len() as u32,
            batches_processed: self.batch_results.len() as u32,
            total_records: self.current_page.total_processed,
            total_updated: self.total_updated,
            total_skipped: self.total_skipped,
            total_errors: self.total_errors,
            is_complete: self.is_complete,
            no_eligible_candidates: self.no_eligible_candidates,
            started_at: self.started_at,
            duration_ms,
            logged_errors: self.errors().count() as u64,
        }
    }
}

/// Flattened counters for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSummary {
    pub session_id: String,
    pub partition_key: Option<String>,
    pub target_value: Option<String>,
    pub batches_loaded: u32,
    pub batches_processed: u32,
    pub total_records: u64,
    pub total_updated: u64,
    pub total_skipped: u64,
    pub total_errors: u64,
    pub is_complete: bool,
    pub no_eligible_candidates: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub logged_errors: u64,
}

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    Uninitialized,
    Selecting,
    ScanningFirstPage,
    Ready,
    Processing,
    LoadingNext,
    Complete,
}

/// Point-in-time view of the engine for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    pub phase: EnginePhase,
    pub is_initializing: bool,
    pub is_loading: bool,
    pub debug_mode: bool,
    pub session: Option<MigrationSession>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: u32, len: usize, has_more: bool, total: u64) -> Page {
        Page {
            records: (0..len)
                .map(|i| CandidateRecord {
                    id: format!("b{n}-{i}"),
                    partition_key: Some("s1".into()),
                    target: None,
                    attributes: serde_json::Map::new(),
                })
                .collect(),
            cursor: None,
            has_more,
            batch_number: n,
            total_processed: total,
            fetched_at: Utc::now(),
        }
    }

    fn join() -> JoinRecord {
        JoinRecord {
            id: "s1".into(),
            target: Some("ACME".into()),
            attributes: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_push_page_tracks_completion() {
        let first = page(1, 10, true, 10);
        let seed = first.records[0].clone();
        let mut session = MigrationSession::new(seed, join(), "s1".into(), "ACME".into(), first);
        assert!(!session.is_complete);

        session.push_page(page(2, 3, false, 13));
        assert!(session.is_complete);
        assert_eq!(session.pages.len(), 2);
        assert_eq!(session.current_page.batch_number, 2);
    }

    #[test]
    fn test_empty_session_is_frozen() {
        let session = MigrationSession::empty();
        assert!(session.is_frozen());
        assert!(session.is_complete);
        assert!(session.current_page.is_empty());
        assert_eq!(session.summary().batches_loaded, 0);
    }

    #[test]
    fn test_apply_outcome_accumulates() {
        let first = page(1, 2, false, 2);
        let seed = first.records[0].clone();
        let mut session = MigrationSession::new(seed, join(), "s1".into(), "ACME".into(), first);
        session.apply_outcome(&BatchOutcome {
            batch_number: 1,
            updated: 2,
            skipped: 1,
            errors: 0,
            updated_ids: vec!["a".into(), "b".into()],
            failures: vec![],
        });
        assert_eq!(session.total_updated, 2);
        assert!(session.migrated_ids.contains("a"));
        assert_eq!(session.summary().batches_processed, 1);
    }
}
