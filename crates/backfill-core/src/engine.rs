//! The migration session state machine.
//!
//! ```text
//! uninitialized -> selecting -> scanning-first-page -> ready
//! ready <-> processing
//! ready <-> loading-next
//! ready -> complete
//! ```
//!
//! Every operation takes `&self`. Session state sits behind a mutex that is
//! never held across an `.await`; re-entrancy of `initialize_migration` and
//! `load_next_batch` is rejected through in-flight flags, and `reset` bumps
//! an epoch so results of operations started before it are discarded.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::cache::MigrationCache;
use crate::config::EngineConfig;
use crate::error::{BackfillError, Result};
use crate::probe::probe_eligibility;
use crate::profile::MigrationProfile;
use crate::progress::{MigrationProgress, ProgressReporter, Subscription};
use crate::record::{key_value, CandidateRecord};
use crate::retry::with_retry;
use crate::scanner::BatchScanner;
use crate::selector::{PartitionSelector, Selection, SelectionTracker};
use crate::session::{
    BatchOutcome, EnginePhase, LogLevel, MigrationSession, MigrationState, MigrationSummary,
};
use crate::store::DocumentStore;
use crate::writer::{BatchWriter, WriteContext};

struct EngineInner {
    phase: EnginePhase,
    session: Option<MigrationSession>,
}

/// Clears its flag on drop, unless a reset happened in the meantime and the
/// flag now belongs to a newer operation.
struct InFlight<'a> {
    flag: &'a AtomicBool,
    epoch: &'a AtomicU64,
    acquired_at: u64,
}

impl<'a> InFlight<'a> {
    fn acquire(
        flag: &'a AtomicBool,
        epoch: &'a AtomicU64,
        operation: &'static str,
    ) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BackfillError::AlreadyInProgress { operation })?;
        Ok(InFlight {
            flag,
            epoch,
            acquired_at: epoch.load(Ordering::SeqCst),
        })
    }

    fn rebase(&mut self) {
        self.acquired_at = self.epoch.load(Ordering::SeqCst);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.epoch.load(Ordering::SeqCst) == self.acquired_at {
            self.flag.store(false, Ordering::Release);
        }
    }
}

fn settled_phase(session: &MigrationSession) -> EnginePhase {
    if session.is_frozen() {
        return EnginePhase::Complete;
    }
    let current = session.current_page.batch_number;
    let processed = session
        .batch_results
        .iter()
        .any(|b| b.batch_number == current);
    if session.is_complete && processed {
        EnginePhase::Complete
    } else {
        EnginePhase::Ready
    }
}

fn progress_of(session: &MigrationSession) -> MigrationProgress {
    MigrationProgress::new(
        &session.session_id,
        session.current_page.batch_number,
        session.current_page.total_processed,
        session.is_complete,
    )
}

/// Drives one migration session at a time over an injected store and cache.
pub struct MigrationEngine {
    store: Arc<dyn DocumentStore>,
    cache: Arc<MigrationCache>,
    profile: MigrationProfile,
    config: EngineConfig,
    reporter: ProgressReporter,
    rng: Mutex<StdRng>,
    inner: Mutex<EngineInner>,
    initializing: AtomicBool,
    loading: AtomicBool,
    debug_mode: AtomicBool,
    epoch: AtomicU64,
}

impl MigrationEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        profile: MigrationProfile,
        config: EngineConfig,
    ) -> Result<Self> {
        let cache = Arc::new(MigrationCache::new(config.cache_ttl()));
        Self::with_cache(store, cache, profile, config)
    }

    pub fn with_cache(
        store: Arc<dyn DocumentStore>,
        cache: Arc<MigrationCache>,
        profile: MigrationProfile,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(MigrationEngine {
            store,
            cache,
            profile,
            debug_mode: AtomicBool::new(config.debug_mode),
            config,
            reporter: ProgressReporter::new(),
            rng: Mutex::new(rng),
            inner: Mutex::new(EngineInner {
                phase: EnginePhase::Uninitialized,
                session: None,
            }),
            initializing: AtomicBool::new(false),
            loading: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        })
    }

    pub fn profile(&self) -> &MigrationProfile {
        &self.profile
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &MigrationCache {
        &self.cache
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    pub fn subscribe_progress<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&MigrationProgress) + Send + Sync + 'static,
    {
        self.reporter.subscribe(callback)
    }

    pub fn set_debug_mode(&self, enabled: bool) {
        self.debug_mode.store(enabled, Ordering::Relaxed);
        info!(target: "backfill", enabled, "debug mode changed");
    }

    fn inner(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_phase(&self, phase: EnginePhase) {
        self.inner().phase = phase;
    }

    fn check_epoch(&self, epoch: u64) -> Result<()> {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(BackfillError::SessionReset);
        }
        Ok(())
    }

    fn scanner(&self) -> BatchScanner<'_> {
        BatchScanner {
            store: self.store.as_ref(),
            cache: &self.cache,
            profile: &self.profile,
            config: &self.config,
        }
    }

    fn selector(&self) -> PartitionSelector<'_> {
        PartitionSelector {
            store: self.store.as_ref(),
            cache: &self.cache,
            profile: &self.profile,
            config: &self.config,
            rng: &self.rng,
        }
    }

    fn writer(&self) -> BatchWriter<'_> {
        BatchWriter {
            store: self.store.as_ref(),
            cache: &self.cache,
            profile: &self.profile,
            config: &self.config,
        }
    }

    /// Emit a log event and mirror it into the session's debug log. Errors
    /// are always mirrored; other levels only in debug mode.
    fn log_event(&self, level: LogLevel, message: &str, context: Option<Value>) {
        let ctx = context.clone().unwrap_or(Value::Null);
        match level {
            LogLevel::Debug => debug!(target: "backfill", context = %ctx, "{message}"),
            LogLevel::Info => info!(target: "backfill", context = %ctx, "{message}"),
            LogLevel::Warn => warn!(target: "backfill", context = %ctx, "{message}"),
            LogLevel::Error => error!(target: "backfill", context = %ctx, "{message}"),
        }
        let mirror = level == LogLevel::Error || self.debug_mode.load(Ordering::Relaxed);
        if mirror {
            if let Some(session) = self.inner().session.as_mut() {
                session.log(level, message, context);
            }
        }
    }

    /// Drop the session, in-flight flags, cached lookups and progress
    /// observers. Subscribe again after a reset to keep receiving snapshots.
    pub fn reset(&self) {
        self.clear_state();
        self.reporter.unsubscribe_all();
        self.initializing.store(false, Ordering::Release);
        info!(target: "backfill", "migration engine reset");
    }

    fn clear_state(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut inner = self.inner();
            inner.session = None;
            inner.phase = EnginePhase::Uninitialized;
        }
        self.loading.store(false, Ordering::Release);
        self.cache.clear();
        self.reporter.clear();
    }

    pub async fn initialize_migration(&self) -> Result<MigrationSession> {
        let mut guard =
            InFlight::acquire(&self.initializing, &self.epoch, "migration initialization")?;
        self.clear_state();
        guard.rebase();
        let epoch = guard.acquired_at;

        self.set_phase(EnginePhase::Selecting);
        info!(
            target: "backfill",
            profile = %self.profile.name,
            collection = %self.profile.candidate_collection,
            "initializing migration"
        );

        match self.build_session().await {
            Ok(session) => {
                self.check_epoch(epoch)?;
                let progress = progress_of(&session);
                {
                    let mut inner = self.inner();
                    inner.phase = settled_phase(&session);
                    inner.session = Some(session.clone());
                }
                self.reporter.emit(progress);
                info!(
                    target: "backfill",
                    session_id = %session.session_id,
                    partition_key = session.partition_key.as_deref().unwrap_or(""),
                    no_eligible_candidates = session.no_eligible_candidates,
                    first_batch = session.current_page.len(),
                    has_more = session.current_page.has_more,
                    "migration initialized"
                );
                Ok(session)
            }
            Err(e) => {
                if self.check_epoch(epoch).is_ok() {
                    self.set_phase(EnginePhase::Uninitialized);
                }
                if matches!(e, BackfillError::DiscoveryExhausted { .. }) {
                    error!(
                        target: "backfill",
                        error = %e,
                        "probe and discovery disagree about eligible records"
                    );
                } else {
                    error!(target: "backfill", error = %e, "migration initialization failed");
                }
                Err(e)
            }
        }
    }

    async fn build_session(&self) -> Result<MigrationSession> {
        let report =
            probe_eligibility(self.store.as_ref(), &self.cache, &self.profile, &self.config)
                .await?;
        if !report.has_eligible {
            info!(
                target: "backfill",
                scanned = report.scanned,
                "no eligible candidates, migration complete"
            );
            return Ok(MigrationSession::empty());
        }

        let selector = self.selector();
        let scanner = self.scanner();
        let mut tracker = SelectionTracker::new();

        for round in 1..=self.config.max_selection_attempts {
            let candidate = match selector.select(&report, &tracker).await? {
                Selection::NoEligible => return Ok(MigrationSession::empty()),
                Selection::Selected(candidate) => candidate,
            };
            let Some(partition) = candidate.record.partition(&self.profile) else {
                tracker.mark_record(&candidate.record.id);
                continue;
            };
            tracker.mark_record(&candidate.record.id);

            let seed = match self.refresh_record(&candidate.record.id).await? {
                Some(fresh)
                    if !fresh.is_migrated()
                        && fresh.partition(&self.profile).as_ref() == Some(&partition) =>
                {
                    fresh
                }
                _ => {
                    debug!(
                        target: "backfill",
                        record_id = %candidate.record.id,
                        "seed changed since the probe, looking for an alternative"
                    );
                    match selector
                        .find_alternative_candidate(&partition, &tracker)
                        .await?
                    {
                        Some(alternative) => {
                            tracker.mark_record(&alternative.id);
                            alternative
                        }
                        None => {
                            tracker.mark_partition(&partition.key);
                            continue;
                        }
                    }
                }
            };

            self.set_phase(EnginePhase::ScanningFirstPage);
            match scanner.fetch_first_page(&partition).await {
                Ok(page) => {
                    return Ok(MigrationSession::new(
                        seed,
                        candidate.join,
                        partition.key,
                        candidate.target_value,
                        page,
                    ));
                }
                Err(e @ BackfillError::EmptyPartition { .. }) => {
                    warn!(target: "backfill", round, error = %e, "selected partition is empty");
                    tracker.mark_partition(&partition.key);
                    self.set_phase(EnginePhase::Selecting);
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            target: "backfill",
            rounds = self.config.max_selection_attempts,
            partitions_tried = tracker.attempted_partitions(),
            "no selection round produced a usable partition"
        );
        Err(BackfillError::SelectionFailed {
            attempts: self.config.max_selection_attempts,
        })
    }

    async fn refresh_record(&self, id: &str) -> Result<Option<CandidateRecord>> {
        let snapshot = with_retry(&self.config.retry, "seed refresh", || {
            self.store.get(&self.profile.candidate_collection, id)
        })
        .await?;
        Ok(snapshot.map(|s| CandidateRecord::from_document(&s.document, &self.profile)))
    }

    /// Fetch the next page of the session's partition. Returns `false` when
    /// there is nothing more to load.
    pub async fn load_next_batch(&self) -> Result<bool> {
        let guard = InFlight::acquire(&self.loading, &self.epoch, "batch loading")?;
        let epoch = guard.acquired_at;

        let (partition, cursor, next_number, processed_so_far) = {
            let mut inner = self.inner();
            let session = inner.session.as_mut().ok_or(BackfillError::NoSession)?;
            if session.is_frozen() {
                return Ok(false);
            }
            if !session.current_page.has_more {
                session.is_complete = true;
                let phase = settled_phase(session);
                inner.phase = phase;
                return Ok(false);
            }
            let partition = session.partition(&self.profile).ok_or_else(|| {
                BackfillError::InvalidArgument("session has no partition key".to_string())
            })?;
            let page = &session.current_page;
            let next = (
                partition,
                page.cursor.clone(),
                page.batch_number + 1,
                page.total_processed,
            );
            inner.phase = EnginePhase::LoadingNext;
            next
        };
        let partition_key = partition.key.as_str();

        let scanner = self.scanner();
        let cursor = match cursor {
            Some(cursor) => cursor,
            None => {
                self.log_event(
                    LogLevel::Warn,
                    "cursor missing while more records remain, re-fetching first page",
                    Some(json!({ "partitionKey": partition_key, "batchNumber": next_number })),
                );
                let recovered = match scanner.fetch_first_page(&partition).await {
                    Ok(page) => page.cursor,
                    Err(e) => {
                        warn!(target: "backfill", error = %e, "cursor recovery failed");
                        None
                    }
                };
                match recovered {
                    Some(cursor) => cursor,
                    None => {
                        self.check_epoch(epoch)?;
                        self.log_event(
                            LogLevel::Warn,
                            "cursor could not be recovered, completing session early",
                            Some(json!({ "partitionKey": partition_key })),
                        );
                        let progress = {
                            let mut inner = self.inner();
                            let session =
                                inner.session.as_mut().ok_or(BackfillError::NoSession)?;
                            session.is_complete = true;
                            session.current_page.has_more = false;
                            let progress = progress_of(session);
                            inner.phase = EnginePhase::Complete;
                            progress
                        };
                        self.reporter.emit(progress);
                        return Ok(false);
                    }
                }
            }
        };

        match scanner
            .fetch_next_page(&partition, Some(&cursor), next_number, processed_so_far)
            .await
        {
            Ok(page) => {
                self.check_epoch(epoch)?;
                let (progress, len, has_more) = {
                    let mut inner = self.inner();
                    let session = inner.session.as_mut().ok_or(BackfillError::NoSession)?;
                    let len = page.len();
                    let has_more = page.has_more;
                    session.push_page(page);
                    let progress = progress_of(session);
                    inner.phase = EnginePhase::Ready;
                    (progress, len, has_more)
                };
                self.reporter.emit(progress);
                self.log_event(
                    LogLevel::Debug,
                    "loaded next batch",
                    Some(json!({
                        "partitionKey": partition_key,
                        "batchNumber": next_number,
                        "records": len,
                        "hasMore": has_more,
                    })),
                );
                Ok(true)
            }
            Err(e) => {
                if self.check_epoch(epoch).is_ok() {
                    self.set_phase(EnginePhase::Ready);
                    self.log_event(
                        LogLevel::Error,
                        &format!("failed to load batch {next_number}: {e}"),
                        Some(json!({ "partitionKey": partition_key, "batchNumber": next_number })),
                    );
                }
                Err(e)
            }
        }
    }

    /// Write the target value onto the current page. A no-op on a session
    /// frozen by the sentinel flags.
    pub async fn process_current_batch(&self) -> Result<BatchOutcome> {
        let epoch = self.epoch.load(Ordering::SeqCst);

        let (records, session_id, partition_key, target_value, batch_number, already_written) = {
            let mut inner = self.inner();
            let session = inner.session.as_ref().ok_or(BackfillError::NoSession)?;
            if session.is_frozen() {
                return Ok(BatchOutcome::default());
            }
            let target_key = session.target_value.clone().ok_or_else(|| {
                BackfillError::InvalidArgument("no target value resolved".to_string())
            })?;
            // Written as stored on the join record, so a numeric id stays numeric.
            let target_value = session
                .join_record
                .as_ref()
                .and_then(|join| join.target_value(&self.profile))
                .filter(|raw| key_value(Some(raw)).as_deref() == Some(target_key.as_str()))
                .unwrap_or(Value::String(target_key));
            let partition_key = session.partition_key.clone().ok_or_else(|| {
                BackfillError::InvalidArgument("session has no partition key".to_string())
            })?;
            if session.pages.is_empty() {
                return Err(BackfillError::InvalidArgument(
                    "no current batch to process".to_string(),
                ));
            }
            let snapshot = (
                session.current_page.records.clone(),
                session.session_id.clone(),
                partition_key,
                target_value,
                session.current_page.batch_number,
                session.migrated_ids.clone(),
            );
            inner.phase = EnginePhase::Processing;
            snapshot
        };

        let writer = self.writer();
        let ctx = WriteContext {
            session_id: &session_id,
            partition_key: &partition_key,
            target_value: &target_value,
            batch_number,
            already_written: &already_written,
        };

        match writer.write(&records, &ctx).await {
            Ok(outcome) => {
                self.check_epoch(epoch)?;
                {
                    let mut inner = self.inner();
                    let session = inner.session.as_mut().ok_or(BackfillError::NoSession)?;
                    session.apply_outcome(&outcome);
                    let phase = settled_phase(session);
                    inner.phase = phase;
                }
                if outcome.errors > 0 {
                    self.log_event(
                        LogLevel::Warn,
                        &format!("batch {batch_number} had {} record errors", outcome.errors),
                        Some(json!({ "failures": outcome.failures })),
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                if self.check_epoch(epoch).is_ok() {
                    self.set_phase(EnginePhase::Ready);
                    self.log_event(
                        LogLevel::Error,
                        &format!("failed to process batch {batch_number}: {e}"),
                        Some(json!({
                            "partitionKey": partition_key,
                            "batchNumber": batch_number,
                            "records": records.len(),
                        })),
                    );
                }
                Err(e)
            }
        }
    }

    /// Process the current page, then keep loading and processing until the
    /// partition is exhausted.
    pub async fn process_all_batches<F>(&self, mut on_batch_complete: F) -> Result<MigrationSummary>
    where
        F: FnMut(&BatchOutcome) + Send,
    {
        let mut needs_processing = {
            let inner = self.inner();
            let session = inner.session.as_ref().ok_or(BackfillError::NoSession)?;
            if session.is_frozen() {
                return Ok(session.summary());
            }
            let current = session.current_page.batch_number;
            !session.batch_results.iter().any(|b| b.batch_number == current)
        };

        let mut processed_batches = 0usize;
        loop {
            if needs_processing {
                if processed_batches >= self.config.max_batches {
                    let err = BackfillError::SafetyLimitExceeded {
                        limit: self.config.max_batches,
                    };
                    self.log_event(LogLevel::Error, &err.to_string(), None);
                    return Err(err);
                }
                match self.process_current_batch().await {
                    Ok(outcome) => {
                        processed_batches += 1;
                        on_batch_complete(&outcome);
                    }
                    Err(e) if e.is_cursor_error() => {
                        self.complete_after_cursor_error(&e);
                        break;
                    }
                    Err(e) => {
                        error!(target: "backfill", error = %e, "batch processing aborted");
                        return Err(e);
                    }
                }
            }

            let complete = {
                let inner = self.inner();
                inner
                    .session
                    .as_ref()
                    .ok_or(BackfillError::NoSession)?
                    .is_complete
            };
            if complete {
                break;
            }

            match self.load_next_batch().await {
                Ok(true) => needs_processing = true,
                Ok(false) => break,
                Err(e) if e.is_cursor_error() => {
                    self.complete_after_cursor_error(&e);
                    break;
                }
                Err(e) => {
                    error!(target: "backfill", error = %e, "batch loading aborted");
                    return Err(e);
                }
            }
        }

        let summary = self.get_migration_summary().ok_or(BackfillError::NoSession)?;
        info!(
            target: "backfill",
            session_id = %summary.session_id,
            batches = processed_batches,
            updated = summary.total_updated,
            skipped = summary.total_skipped,
            errors = summary.total_errors,
            "all batches processed"
        );
        Ok(summary)
    }

    fn complete_after_cursor_error(&self, e: &BackfillError) {
        self.log_event(
            LogLevel::Warn,
            &format!("pagination cursor problem, completing session: {e}"),
            None,
        );
        let mut inner = self.inner();
        if let Some(session) = inner.session.as_mut() {
            session.is_complete = true;
            session.current_page.has_more = false;
            inner.phase = EnginePhase::Complete;
        }
    }

    /// Adopt a previously exported session. Cursors do not survive
    /// serialization, so the next load goes through cursor recovery.
    pub fn resume_session(&self, session: MigrationSession) -> Result<()> {
        let _guard =
            InFlight::acquire(&self.initializing, &self.epoch, "migration initialization")?;
        let progress = progress_of(&session);
        {
            let mut inner = self.inner();
            if inner.session.is_some() {
                return Err(BackfillError::InvalidArgument(
                    "a session is already active; reset first".to_string(),
                ));
            }
            inner.phase = settled_phase(&session);
            info!(
                target: "backfill",
                session_id = %session.session_id,
                batch_number = session.current_page.batch_number,
                "resuming migration session"
            );
            inner.session = Some(session);
        }
        self.reporter.emit(progress);
        Ok(())
    }

    pub fn session(&self) -> Option<MigrationSession> {
        self.inner().session.clone()
    }

    pub fn phase(&self) -> EnginePhase {
        self.inner().phase
    }

    pub fn get_migration_state(&self) -> MigrationState {
        let inner = self.inner();
        MigrationState {
            phase: inner.phase,
            is_initializing: self.initializing.load(Ordering::Acquire),
            is_loading: self.loading.load(Ordering::Acquire),
            debug_mode: self.debug_mode.load(Ordering::Relaxed),
            session: inner.session.clone(),
        }
    }

    pub fn get_migration_summary(&self) -> Option<MigrationSummary> {
        self.inner().session.as_ref().map(|s| s.summary())
    }
}
