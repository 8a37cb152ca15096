//! Sample-based eligibility pre-check.
//!
//! Reads a bounded, ordered slice of the candidate collection and buckets
//! every record, so a session can bail out early when there is nothing to
//! migrate and can seed partition selection from real eligible records.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::MigrationCache;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::profile::MigrationProfile;
use crate::record::{CandidateRecord, JoinRecord};
use crate::retry::with_retry;
use crate::store::{Direction, DocumentStore, Query};

/// An eligible record together with the join record that resolves it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibleCandidate {
    pub record: CandidateRecord,
    pub join: JoinRecord,
    pub target_value: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityReport {
    pub scanned: usize,
    pub already_migrated: usize,
    pub missing_partition_key: usize,
    pub partition_unresolved: usize,
    pub eligible: usize,
    /// Join lookups that failed outright (also counted as unresolved).
    pub validation_errors: usize,
    pub has_eligible: bool,
    /// Bounded subset of the eligible records.
    pub sample: Vec<EligibleCandidate>,
}

/// Outcome of checking one record against its join record.
pub(crate) enum Classification {
    AlreadyMigrated,
    MissingPartitionKey,
    Unresolved { lookup_failed: bool },
    Eligible(EligibleCandidate),
}

/// Classify a record. Order matters: migrated first, then the partition
/// key, then the join lookup.
pub(crate) async fn classify(
    store: &dyn DocumentStore,
    cache: &MigrationCache,
    profile: &MigrationProfile,
    config: &EngineConfig,
    record: CandidateRecord,
) -> Classification {
    if record.is_migrated() {
        return Classification::AlreadyMigrated;
    }
    let Some(partition_key) = record.partition_key.clone() else {
        return Classification::MissingPartitionKey;
    };
    match cache
        .join_record(store, profile, &config.retry, &partition_key)
        .await
    {
        Ok(Some(join)) if join.has_target() => {
            let target_value = join.target.clone().unwrap_or_default();
            Classification::Eligible(EligibleCandidate {
                record,
                join,
                target_value,
            })
        }
        Ok(_) => Classification::Unresolved {
            lookup_failed: false,
        },
        Err(e) => {
            warn!(
                target: "backfill",
                record_id = %record.id,
                partition_key = %partition_key,
                error = %e,
                "join lookup failed during validation"
            );
            Classification::Unresolved {
                lookup_failed: true,
            }
        }
    }
}

pub async fn probe_eligibility(
    store: &dyn DocumentStore,
    cache: &MigrationCache,
    profile: &MigrationProfile,
    config: &EngineConfig,
) -> Result<EligibilityReport> {
    let query = Query::new(&profile.candidate_collection)
        .not_null(&profile.partition_field)
        .order_by(&profile.partition_field, Direction::Asc)
        .limit(config.probe_sample_size.saturating_mul(2));

    let rows = with_retry(&config.retry, "eligibility probe", || store.query(&query)).await?;

    let mut report = EligibilityReport {
        scanned: rows.len(),
        ..Default::default()
    };

    for snapshot in rows {
        let record = CandidateRecord::from_document(&snapshot.document, profile);
        match classify(store, cache, profile, config, record).await {
            Classification::AlreadyMigrated => report.already_migrated += 1,
            Classification::MissingPartitionKey => report.missing_partition_key += 1,
            Classification::Unresolved { lookup_failed } => {
                report.partition_unresolved += 1;
                if lookup_failed {
                    report.validation_errors += 1;
                }
            }
            Classification::Eligible(candidate) => {
                report.eligible += 1;
                if report.sample.len() < config.eligible_sample_limit {
                    report.sample.push(candidate);
                }
            }
        }
    }
    report.has_eligible = report.eligible > 0;

    debug!(target: "backfill", retained = report.sample.len(), "probe sample retained");
    info!(
        target: "backfill",
        collection = %profile.candidate_collection,
        scanned = report.scanned,
        eligible = report.eligible,
        already_migrated = report.already_migrated,
        missing_partition_key = report.missing_partition_key,
        partition_unresolved = report.partition_unresolved,
        validation_errors = report.validation_errors,
        "eligibility probe finished"
    );
    Ok(report)
}
