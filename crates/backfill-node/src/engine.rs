use napi::bindgen_prelude::*;
use napi_derive::napi;
use std::sync::Arc;

use backfill_core::{
    BackfillError, EngineConfig, MigrationEngine, MigrationProfile, MigrationSession, SqliteStore,
};

use crate::types::{JsBatchOutcome, JsMigrationSummary, JsProcessAllResult, JsProgress};

fn to_napi(e: BackfillError) -> Error {
    let status = if e.is_precondition() {
        Status::InvalidArg
    } else {
        Status::GenericFailure
    };
    Error::new(status, e.to_string())
}

/// Napi-rs wrapper around backfill_core::MigrationEngine.
#[napi]
pub struct JsMigrationEngine {
    inner: Arc<MigrationEngine>,
}

#[napi]
impl JsMigrationEngine {
    /// Open (or create) a SQLite document store and build an engine for the
    /// named profile (`"products"` or `"quotations"`). `config_json` is a
    /// camelCase `EngineConfig` object; missing fields take their defaults.
    #[napi(factory)]
    pub async fn open(
        db_path: String,
        profile: String,
        config_json: Option<String>,
    ) -> Result<JsMigrationEngine> {
        let profile = MigrationProfile::by_name(&profile).map_err(to_napi)?;
        let config = match config_json {
            Some(raw) => EngineConfig::from_json_str(&raw)
                .map_err(|e| Error::new(Status::InvalidArg, e.to_string()))?,
            None => EngineConfig::default(),
        };
        let store = SqliteStore::new(&db_path).await.map_err(to_napi)?;
        let engine = MigrationEngine::new(Arc::new(store), profile, config).map_err(to_napi)?;
        Ok(JsMigrationEngine {
            inner: Arc::new(engine),
        })
    }

    /// Pick a partition and load its first page. Resolves to the summary of
    /// the new session.
    #[napi]
    pub async fn initialize_migration(&self) -> Result<JsMigrationSummary> {
        let engine = self.inner.clone();
        let session = engine.initialize_migration().await.map_err(to_napi)?;
        Ok(JsMigrationSummary::from(session.summary()))
    }

    #[napi]
    pub async fn process_current_batch(&self) -> Result<JsBatchOutcome> {
        let engine = self.inner.clone();
        let outcome = engine.process_current_batch().await.map_err(to_napi)?;
        Ok(JsBatchOutcome::from(outcome))
    }

    /// Returns false when the partition has no further pages.
    #[napi]
    pub async fn load_next_batch(&self) -> Result<bool> {
        let engine = self.inner.clone();
        engine.load_next_batch().await.map_err(to_napi)
    }

    #[napi]
    pub async fn process_all_batches(&self) -> Result<JsProcessAllResult> {
        let engine = self.inner.clone();
        let mut outcomes = Vec::new();
        let summary = engine
            .process_all_batches(|outcome| outcomes.push(JsBatchOutcome::from(outcome.clone())))
            .await
            .map_err(to_napi)?;
        Ok(JsProcessAllResult {
            outcomes,
            summary: JsMigrationSummary::from(summary),
        })
    }

    /// Full engine state as a JSON string.
    #[napi]
    pub fn get_migration_state(&self) -> Result<String> {
        serde_json::to_string(&self.inner.get_migration_state())
            .map_err(|e| Error::new(Status::GenericFailure, e.to_string()))
    }

    #[napi]
    pub fn get_migration_summary(&self) -> Option<JsMigrationSummary> {
        self.inner.get_migration_summary().map(JsMigrationSummary::from)
    }

    /// The most recent progress snapshot, or null before initialization.
    #[napi]
    pub fn latest_progress(&self) -> Option<JsProgress> {
        self.inner.reporter().latest().map(JsProgress::from)
    }

    #[napi]
    pub fn reset(&self) {
        self.inner.reset();
    }

    #[napi]
    pub fn set_debug_mode(&self, enabled: bool) {
        self.inner.set_debug_mode(enabled);
    }

    /// The active session as a JSON string, for `resumeSession`.
    #[napi]
    pub fn export_session(&self) -> Result<Option<String>> {
        self.inner
            .session()
            .map(|s| serde_json::to_string(&s))
            .transpose()
            .map_err(|e| Error::new(Status::GenericFailure, e.to_string()))
    }

    #[napi]
    pub fn resume_session(&self, session_json: String) -> Result<()> {
        let session: MigrationSession = serde_json::from_str(&session_json)
            .map_err(|e| Error::new(Status::InvalidArg, format!("invalid session JSON: {}", e)))?;
        self.inner.resume_session(session).map_err(to_napi)
    }
}
