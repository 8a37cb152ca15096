use napi_derive::napi;

use backfill_core::{BatchOutcome, MigrationProgress, MigrationSummary};

/// Result of processing one batch, exposed to JS.
#[napi(object)]
pub struct JsBatchOutcome {
    pub batch_number: u32,
    pub updated: i64,
    pub skipped: i64,
    pub errors: i64,
    pub updated_ids: Vec<String>,
    /// `"<id>: <reason>"` per record that could not be queued.
    pub failures: Vec<String>,
}

#[napi(object)]
pub struct JsMigrationSummary {
    pub session_id: String,
    pub partition_key: Option<String>,
    pub target_value: Option<String>,
    pub batches_loaded: u32,
    pub batches_processed: u32,
    pub total_records: i64,
    pub total_updated: i64,
    pub total_skipped: i64,
    pub total_errors: i64,
    pub is_complete: bool,
    pub no_eligible_candidates: bool,
    pub started_at: String,
    pub duration_ms: i64,
    pub logged_errors: i64,
}

/// Progress snapshot. Unknown totals are `-1`.
#[napi(object)]
pub struct JsProgress {
    pub current_batch_number: u32,
    pub total_batches: i64,
    pub processed_count: i64,
    pub remaining_count: i64,
    pub estimated_total: i64,
    pub progress_percentage: f64,
    pub session_id: String,
}

#[napi(object)]
pub struct JsProcessAllResult {
    pub outcomes: Vec<JsBatchOutcome>,
    pub summary: JsMigrationSummary,
}

// ---- Conversion helpers ----

fn count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl From<BatchOutcome> for JsBatchOutcome {
    fn from(o: BatchOutcome) -> Self {
        JsBatchOutcome {
            batch_number: o.batch_number,
            updated: count(o.updated),
            skipped: count(o.skipped),
            errors: count(o.errors),
            updated_ids: o.updated_ids,
            failures: o
                .failures
                .into_iter()
                .map(|f| format!("{}: {}", f.id, f.reason))
                .collect(),
        }
    }
}

impl From<MigrationSummary> for JsMigrationSummary {
    fn from(s: MigrationSummary) -> Self {
        JsMigrationSummary {
            session_id: s.session_id,
            partition_key: s.partition_key,
            target_value: s.target_value,
            batches_loaded: s.batches_loaded,
            batches_processed: s.batches_processed,
            total_records: count(s.total_records),
            total_updated: count(s.total_updated),
            total_skipped: count(s.total_skipped),
            total_errors: count(s.total_errors),
            is_complete: s.is_complete,
            no_eligible_candidates: s.no_eligible_candidates,
            started_at: s.started_at.to_rfc3339(),
            duration_ms: count(s.duration_ms),
            logged_errors: count(s.logged_errors),
        }
    }
}

impl From<MigrationProgress> for JsProgress {
    fn from(p: MigrationProgress) -> Self {
        JsProgress {
            current_batch_number: p.current_batch_number,
            total_batches: p.total_batches,
            processed_count: count(p.processed_count),
            remaining_count: p.remaining_count,
            estimated_total: p.estimated_total,
            progress_percentage: p.progress_percentage,
            session_id: p.session_id,
        }
    }
}
