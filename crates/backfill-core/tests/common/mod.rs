//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backfill_core::{
    BackfillError, Document, DocumentStore, EngineConfig, MemoryStore, MigrationEngine,
    MigrationProfile, Query, Result, RetryPolicy, Snapshot, WriteBatch,
};
use serde_json::{json, Value};

/// Deterministic config with no retry delays.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::immediate(3),
        random_seed: Some(7),
        ..Default::default()
    }
}

pub async fn put(store: &dyn DocumentStore, collection: &str, id: &str, fields: Value) {
    store
        .put(collection, Document::from_value(id, fields))
        .await
        .unwrap();
}

/// One seller with a company and `count` unmigrated products.
pub async fn seed_partition(store: &dyn DocumentStore, seller: &str, company: &str, count: usize) {
    put(store, "sellers", seller, json!({ "company_id": company })).await;
    for i in 0..count {
        put(
            store,
            "products",
            &format!("{seller}-{i:03}"),
            json!({ "seller_id": seller, "name": format!("product {i}") }),
        )
        .await;
    }
}

pub fn engine(store: Arc<dyn DocumentStore>, config: EngineConfig) -> MigrationEngine {
    MigrationEngine::new(store, MigrationProfile::products(), config).unwrap()
}

/// Memory store with injectable failures and latency.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    latency: Option<Duration>,
    /// Remaining commit failures; `usize::MAX` fails forever.
    commit_failures: AtomicUsize,
    fail_queries: AtomicBool,
    fail_gets: AtomicBool,
    pub commit_attempts: AtomicUsize,
    pub query_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        FlakyStore {
            latency: Some(latency),
            ..Default::default()
        }
    }

    pub fn fail_commits(&self, times: usize) {
        self.commit_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_commits_forever(&self) {
        self.fail_commits(usize::MAX);
    }

    pub fn fail_queries(&self, enabled: bool) {
        self.fail_queries.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, enabled: bool) {
        self.fail_gets.store(enabled, Ordering::SeqCst);
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn query(&self, query: &Query) -> Result<Vec<Snapshot>> {
        self.pause().await;
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(BackfillError::Store("query unavailable".into()));
        }
        self.inner.query(query).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Snapshot>> {
        self.pause().await;
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(BackfillError::Store("read unavailable".into()));
        }
        self.inner.get(collection, id).await
    }

    async fn commit_batch(&self, batch: WriteBatch) -> Result<()> {
        self.pause().await;
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.commit_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.commit_failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(BackfillError::Store("commit rejected".into()));
        }
        self.inner.commit_batch(batch).await
    }

    async fn put(&self, collection: &str, document: Document) -> Result<()> {
        self.inner.put(collection, document).await
    }
}
