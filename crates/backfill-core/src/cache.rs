//! Lookup cache shared by the prober, selector, scanner and writer.
//!
//! Holds join records and full partition record lists. Entries expire after
//! a TTL and are invalidated explicitly after every successful write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use tracing::debug;

use crate::config::RetryPolicy;
use crate::error::Result;
use crate::profile::MigrationProfile;
use crate::record::{CandidateRecord, JoinRecord};
use crate::retry::with_retry;
use crate::store::DocumentStore;

const MAX_JOIN_ENTRIES: u64 = 10_000;
const MAX_PAGE_ENTRIES: u64 = 1_000;

/// What a write touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationKind {
    /// Candidate records of the partition changed.
    Candidates,
    /// The join record of the partition changed.
    Join,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub join_hits: u64,
    pub join_misses: u64,
    pub page_hits: u64,
    pub page_misses: u64,
}

pub struct MigrationCache {
    // `None` caches a confirmed miss.
    joins: Cache<String, Option<JoinRecord>>,
    pages: Cache<String, Arc<Vec<CandidateRecord>>>,
    join_hits: AtomicU64,
    join_misses: AtomicU64,
    page_hits: AtomicU64,
    page_misses: AtomicU64,
}

impl MigrationCache {
    pub fn new(ttl: Duration) -> Self {
        MigrationCache {
            joins: Cache::builder()
                .max_capacity(MAX_JOIN_ENTRIES)
                .time_to_live(ttl)
                .build(),
            pages: Cache::builder()
                .max_capacity(MAX_PAGE_ENTRIES)
                .time_to_live(ttl)
                .build(),
            join_hits: AtomicU64::new(0),
            join_misses: AtomicU64::new(0),
            page_hits: AtomicU64::new(0),
            page_misses: AtomicU64::new(0),
        }
    }

    /// Resolve the join record for a partition key, reading through to the
    /// store on a miss.
    pub async fn join_record(
        &self,
        store: &dyn DocumentStore,
        profile: &MigrationProfile,
        retry: &RetryPolicy,
        partition_key: &str,
    ) -> Result<Option<JoinRecord>> {
        let key = format!("{}/{}", profile.join_collection, partition_key);
        if let Some(cached) = self.joins.get(&key) {
            self.join_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }
        self.join_misses.fetch_add(1, Ordering::Relaxed);

        let snapshot = with_retry(retry, "join lookup", || {
            store.get(&profile.join_collection, partition_key)
        })
        .await?;
        let record = snapshot.map(|s| JoinRecord::from_document(&s.document, profile));
        self.joins.insert(key, record.clone());
        Ok(record)
    }

    pub fn cached_page(
        &self,
        profile: &MigrationProfile,
        partition_key: &str,
    ) -> Option<Arc<Vec<CandidateRecord>>> {
        let hit = self.pages.get(&page_key(profile, partition_key));
        match hit {
            Some(_) => self.page_hits.fetch_add(1, Ordering::Relaxed),
            None => self.page_misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    pub fn store_page(
        &self,
        profile: &MigrationProfile,
        partition_key: &str,
        records: Vec<CandidateRecord>,
    ) {
        self.pages
            .insert(page_key(profile, partition_key), Arc::new(records));
    }

    pub fn invalidate_after_update(
        &self,
        profile: &MigrationProfile,
        partition_key: &str,
        kind: InvalidationKind,
    ) {
        debug!(target: "backfill", partition_key, ?kind, "invalidating cache");
        if kind == InvalidationKind::Candidates {
            self.pages.invalidate(&page_key(profile, partition_key));
        }
        if kind == InvalidationKind::Join {
            self.joins
                .invalidate(&format!("{}/{}", profile.join_collection, partition_key));
        }
    }

    pub fn clear(&self) {
        self.joins.invalidate_all();
        self.pages.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            join_hits: self.join_hits.load(Ordering::Relaxed),
            join_misses: self.join_misses.load(Ordering::Relaxed),
            page_hits: self.page_hits.load(Ordering::Relaxed),
            page_misses: self.page_misses.load(Ordering::Relaxed),
        }
    }
}

fn page_key(profile: &MigrationProfile, partition_key: &str) -> String {
    format!("{}/{}", profile.candidate_collection, partition_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Document, MemoryStore};
    use serde_json::json;

    fn record(id: &str) -> CandidateRecord {
        CandidateRecord {
            id: id.to_string(),
            partition_key: Some("s1".to_string()),
            target: None,
            attributes: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_join_lookup_is_cached() {
        let store = MemoryStore::new();
        store
            .put("sellers", Document::from_value("s1", json!({"company_id": "ACME"})))
            .await
            .unwrap();
        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        let retry = RetryPolicy::immediate(1);

        let first = cache.join_record(&store, &profile, &retry, "s1").await.unwrap();
        assert_eq!(first.unwrap().target.as_deref(), Some("ACME"));

        // A changed join record stays hidden until invalidated.
        store
            .put("sellers", Document::from_value("s1", json!({"company_id": "GLOBEX"})))
            .await
            .unwrap();
        let second = cache.join_record(&store, &profile, &retry, "s1").await.unwrap();
        assert_eq!(second.unwrap().target.as_deref(), Some("ACME"));
        assert_eq!(cache.stats().join_hits, 1);

        cache.invalidate_after_update(&profile, "s1", InvalidationKind::Join);
        let third = cache.join_record(&store, &profile, &retry, "s1").await.unwrap();
        assert_eq!(third.unwrap().target.as_deref(), Some("GLOBEX"));
    }

    #[tokio::test]
    async fn test_missing_join_record_is_cached_as_none() {
        let store = MemoryStore::new();
        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        let retry = RetryPolicy::immediate(1);
        assert!(cache.join_record(&store, &profile, &retry, "ghost").await.unwrap().is_none());
        assert!(cache.join_record(&store, &profile, &retry, "ghost").await.unwrap().is_none());
        assert_eq!(cache.stats().join_misses, 1);
    }

    #[test]
    fn test_page_invalidation() {
        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        cache.store_page(&profile, "s1", vec![record("p1"), record("p2")]);
        assert_eq!(cache.cached_page(&profile, "s1").unwrap().len(), 2);

        cache.invalidate_after_update(&profile, "s1", InvalidationKind::Candidates);
        assert!(cache.cached_page(&profile, "s1").is_none());
    }

    #[test]
    fn test_clear() {
        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        cache.store_page(&profile, "s1", vec![record("p1")]);
        cache.clear();
        assert!(cache.cached_page(&profile, "s1").is_none());
    }
}
