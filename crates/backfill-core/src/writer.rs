use std::collections::HashSet;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::cache::{InvalidationKind, MigrationCache};
use crate::config::EngineConfig;
use crate::error::{BackfillError, Result};
use crate::profile::MigrationProfile;
use crate::record::CandidateRecord;
use crate::retry::with_retry;
use crate::session::{BatchOutcome, RecordFailure};
use crate::store::{DocumentStore, WriteBatch};

pub const FIELD_UPDATED_AT: &str = "updated_at";
pub const FIELD_MIGRATION_SOURCE: &str = "migration_source";
pub const FIELD_MIGRATION_TIMESTAMP: &str = "migration_timestamp";
pub const FIELD_MIGRATION_PARTITION_KEY: &str = "migration_partition_key";
pub const FIELD_MIGRATION_BATCH_NUMBER: &str = "migration_batch_number";
pub const FIELD_MIGRATION_SESSION_ID: &str = "migration_session_id";

/// Everything a write needs to know about the session.
pub struct WriteContext<'a> {
    pub session_id: &'a str,
    pub partition_key: &'a str,
    /// Written verbatim into the target field.
    pub target_value: &'a Value,
    pub batch_number: u32,
    /// Ids already written in this session.
    pub already_written: &'a HashSet<String>,
}

pub struct BatchWriter<'a> {
    pub store: &'a dyn DocumentStore,
    pub cache: &'a MigrationCache,
    pub profile: &'a MigrationProfile,
    pub config: &'a EngineConfig,
}

impl BatchWriter<'_> {
    fn patch(&self, ctx: &WriteContext<'_>) -> Map<String, Value> {
        let now = Utc::now().to_rfc3339();
        let mut patch = Map::new();
        patch.insert(self.profile.target_field.clone(), ctx.target_value.clone());
        patch.insert(FIELD_UPDATED_AT.into(), Value::String(now.clone()));
        patch.insert(
            FIELD_MIGRATION_SOURCE.into(),
            Value::String(self.profile.source_tag.clone()),
        );
        patch.insert(FIELD_MIGRATION_TIMESTAMP.into(), Value::String(now));
        patch.insert(
            FIELD_MIGRATION_PARTITION_KEY.into(),
            Value::String(ctx.partition_key.to_string()),
        );
        patch.insert(FIELD_MIGRATION_BATCH_NUMBER.into(), Value::from(ctx.batch_number));
        patch.insert(
            FIELD_MIGRATION_SESSION_ID.into(),
            Value::String(ctx.session_id.to_string()),
        );
        patch
    }

    fn queue(
        &self,
        batch: &mut WriteBatch,
        record: &CandidateRecord,
        patch: &Map<String, Value>,
    ) -> Result<()> {
        if record.id.trim().is_empty() {
            return Err(BackfillError::InvalidArgument("record has no id".to_string()));
        }
        batch.update(&self.profile.candidate_collection, &record.id, patch.clone());
        Ok(())
    }

    /// Write the target value onto every record of the page that still needs
    /// it. Commit failures propagate and nothing counts as updated.
    pub async fn write(
        &self,
        records: &[CandidateRecord],
        ctx: &WriteContext<'_>,
    ) -> Result<BatchOutcome> {
        let to_update: Vec<&CandidateRecord> = records
            .iter()
            .filter(|r| r.needs_update(ctx.partition_key) && !ctx.already_written.contains(&r.id))
            .collect();
        let skipped = (records.len() - to_update.len()) as u64;

        let mut outcome = BatchOutcome {
            batch_number: ctx.batch_number,
            skipped,
            ..Default::default()
        };
        if to_update.is_empty() {
            return Ok(outcome);
        }

        let patch = self.patch(ctx);
        let mut batch = WriteBatch::new();
        let mut queued = Vec::with_capacity(to_update.len());
        for record in to_update {
            match self.queue(&mut batch, record, &patch) {
                Ok(()) => queued.push(record.id.clone()),
                Err(e) => {
                    warn!(target: "backfill", record_id = %record.id, error = %e, "failed to queue update");
                    outcome.errors += 1;
                    outcome.failures.push(RecordFailure {
                        id: record.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        if batch.is_empty() {
            return Ok(outcome);
        }

        with_retry(&self.config.retry, "batch commit", || {
            self.store.commit_batch(batch.clone())
        })
        .await?;

        self.cache
            .invalidate_after_update(self.profile, ctx.partition_key, InvalidationKind::Candidates);

        outcome.updated = queued.len() as u64;
        outcome.updated_ids = queued;
        info!(
            target: "backfill",
            session_id = ctx.session_id,
            batch_number = ctx.batch_number,
            updated = outcome.updated,
            skipped = outcome.skipped,
            errors = outcome.errors,
            "batch committed"
        );
        Ok(outcome)
    }
}
