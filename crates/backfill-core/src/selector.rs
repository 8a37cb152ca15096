//! Random partition selection.
//!
//! The cheap path picks uniformly among the eligible records retained by the
//! probe. When that sample is exhausted (every retained record was already
//! tried during this initialization) a bounded discovery loop queries other
//! slices of the collection.

use std::collections::HashSet;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cache::MigrationCache;
use crate::config::EngineConfig;
use crate::error::{BackfillError, Result};
use crate::probe::{classify, Classification, EligibilityReport, EligibleCandidate};
use crate::profile::MigrationProfile;
use crate::record::{CandidateRecord, Partition};
use crate::retry::with_retry;
use crate::store::{Direction, DocumentStore, Query};

/// Partitions and records already tried during one initialization.
#[derive(Debug, Clone, Default)]
pub struct SelectionTracker {
    partitions: HashSet<String>,
    records: HashSet<String>,
}

impl SelectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_record(&mut self, id: &str) {
        self.records.insert(id.to_string());
    }

    pub fn mark_partition(&mut self, partition_key: &str) {
        self.partitions.insert(partition_key.to_string());
    }

    pub fn record_tried(&self, id: &str) -> bool {
        self.records.contains(id)
    }

    pub fn is_excluded(&self, record: &CandidateRecord) -> bool {
        self.records.contains(&record.id)
            || record
                .partition_key
                .as_ref()
                .is_some_and(|k| self.partitions.contains(k))
    }

    pub fn attempted_partitions(&self) -> usize {
        self.partitions.len()
    }
}

#[derive(Debug, Clone)]
pub enum Selection {
    /// Nothing in the store can be migrated. Not an error.
    NoEligible,
    Selected(EligibleCandidate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetFilter {
    Null,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DiscoveryStrategy {
    direction: Direction,
    target: TargetFilter,
    limit: usize,
}

/// Strategy for a zero-based discovery attempt. Direction alternates, the
/// target filter flips every two attempts, and the final attempt doubles
/// the page size.
fn strategy_for(attempt: usize, attempts: usize, page_size: usize) -> DiscoveryStrategy {
    DiscoveryStrategy {
        direction: if attempt % 2 == 0 {
            Direction::Asc
        } else {
            Direction::Desc
        },
        target: if (attempt / 2) % 2 == 0 {
            TargetFilter::Null
        } else {
            TargetFilter::Empty
        },
        limit: if attempt + 1 == attempts {
            page_size.saturating_mul(2)
        } else {
            page_size
        },
    }
}

pub struct PartitionSelector<'a> {
    pub store: &'a dyn DocumentStore,
    pub cache: &'a MigrationCache,
    pub profile: &'a MigrationProfile,
    pub config: &'a EngineConfig,
    pub rng: &'a Mutex<StdRng>,
}

impl PartitionSelector<'_> {
    fn choose(&self, candidates: &[EligibleCandidate]) -> Option<EligibleCandidate> {
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        candidates.choose(&mut *rng).cloned()
    }

    pub async fn select(
        &self,
        report: &EligibilityReport,
        tracker: &SelectionTracker,
    ) -> Result<Selection> {
        if !report.has_eligible {
            return Ok(Selection::NoEligible);
        }

        let fresh: Vec<EligibleCandidate> = report
            .sample
            .iter()
            .filter(|c| !tracker.is_excluded(&c.record))
            .cloned()
            .collect();

        if let Some(choice) = self.choose(&fresh) {
            debug!(
                target: "backfill",
                record_id = %choice.record.id,
                pool = fresh.len(),
                "selected candidate from probe sample"
            );
            return Ok(Selection::Selected(choice));
        }

        info!(
            target: "backfill",
            eligible = report.eligible,
            "probe sample exhausted, starting discovery"
        );
        self.discover(tracker).await.map(Selection::Selected)
    }

    async fn discover(&self, tracker: &SelectionTracker) -> Result<EligibleCandidate> {
        let attempts = self.config.discovery_attempts;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.retry.delay_for(attempt as u32);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            let strategy = strategy_for(attempt, attempts, self.config.discovery_page_size);
            let target_value = match strategy.target {
                TargetFilter::Null => Value::Null,
                TargetFilter::Empty => Value::String(String::new()),
            };
            let query = Query::new(&self.profile.candidate_collection)
                .not_null(&self.profile.partition_field)
                .eq(&self.profile.target_field, target_value)
                .order_by(&self.profile.partition_field, strategy.direction)
                .limit(strategy.limit);

            let rows = match with_retry(&self.config.retry, "discovery query", || {
                self.store.query(&query)
            })
            .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(target: "backfill", attempt = attempt + 1, error = %e, "discovery query failed");
                    continue;
                }
            };

            let mut found = Vec::new();
            for snapshot in rows {
                if found.len() >= self.config.discovery_pick_limit {
                    break;
                }
                let record = CandidateRecord::from_document(&snapshot.document, self.profile);
                if tracker.is_excluded(&record) {
                    continue;
                }
                if let Classification::Eligible(candidate) =
                    classify(self.store, self.cache, self.profile, self.config, record).await
                {
                    found.push(candidate);
                }
            }

            debug!(
                target: "backfill",
                attempt = attempt + 1,
                ?strategy,
                found = found.len(),
                "discovery attempt finished"
            );
            if let Some(choice) = self.choose(&found) {
                return Ok(choice);
            }
        }

        error!(
            target: "backfill",
            attempts,
            "probe reported eligible records but discovery found none"
        );
        Err(BackfillError::DiscoveryExhausted { attempts })
    }

    /// Find a not-yet-tried, unmigrated record in the same partition. The
    /// full partition listing is cached for the scanner's first page.
    pub async fn find_alternative_candidate(
        &self,
        partition: &Partition,
        tracker: &SelectionTracker,
    ) -> Result<Option<CandidateRecord>> {
        let query = Query::new(&self.profile.candidate_collection)
            .eq(&self.profile.partition_field, partition.value.clone())
            .limit(self.config.alternative_scan_limit);

        let rows = with_retry(&self.config.retry, "alternative candidate query", || {
            self.store.query(&query)
        })
        .await?;

        let records: Vec<CandidateRecord> = rows
            .iter()
            .map(|s| CandidateRecord::from_document(&s.document, self.profile))
            .collect();

        let alternative = records
            .iter()
            .find(|r| !tracker.record_tried(&r.id) && !r.is_migrated())
            .cloned();

        self.cache.store_page(self.profile, &partition.key, records);
        Ok(alternative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::probe::probe_eligibility;
    use crate::store::{Document, MemoryStore};
    use rand::SeedableRng;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy::immediate(1),
            ..Default::default()
        }
    }

    async fn put(store: &MemoryStore, collection: &str, id: &str, fields: Value) {
        store.put(collection, Document::from_value(id, fields)).await.unwrap();
    }

    #[test]
    fn test_strategy_rotation() {
        let s: Vec<_> = (0..5).map(|i| strategy_for(i, 5, 50)).collect();
        assert_eq!(s[0].direction, Direction::Asc);
        assert_eq!(s[0].target, TargetFilter::Null);
        assert_eq!(s[1].direction, Direction::Desc);
        assert_eq!(s[2].target, TargetFilter::Empty);
        assert_eq!(s[3].direction, Direction::Desc);
        assert_eq!(s[3].target, TargetFilter::Empty);
        assert_eq!(s[4].limit, 100);
        assert_eq!(s[3].limit, 50);
    }

    #[tokio::test]
    async fn test_never_selects_unresolved_partition() {
        let store = MemoryStore::new();
        put(&store, "sellers", "good", json!({"company_id": "ACME"})).await;
        put(&store, "sellers", "bad", json!({})).await;
        for i in 0..5 {
            put(&store, "products", &format!("g{i}"), json!({"seller_id": "good"})).await;
            put(&store, "products", &format!("b{i}"), json!({"seller_id": "bad"})).await;
        }

        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        let config = config();
        let rng = Mutex::new(StdRng::seed_from_u64(1));
        let selector = PartitionSelector {
            store: &store,
            cache: &cache,
            profile: &profile,
            config: &config,
            rng: &rng,
        };
        let report = probe_eligibility(&store, &cache, &profile, &config).await.unwrap();

        for _ in 0..20 {
            match selector.select(&report, &SelectionTracker::new()).await.unwrap() {
                Selection::Selected(c) => {
                    assert_eq!(c.record.partition_key.as_deref(), Some("good"));
                    assert_eq!(c.target_value, "ACME");
                }
                Selection::NoEligible => panic!("expected a selection"),
            }
        }
    }

    #[tokio::test]
    async fn test_no_eligible() {
        let store = MemoryStore::new();
        put(&store, "products", "p1", json!({"seller_id": "s1", "company_id": "X"})).await;
        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        let config = config();
        let rng = Mutex::new(StdRng::seed_from_u64(1));
        let selector = PartitionSelector {
            store: &store,
            cache: &cache,
            profile: &profile,
            config: &config,
            rng: &rng,
        };
        let report = probe_eligibility(&store, &cache, &profile, &config).await.unwrap();
        assert!(matches!(
            selector.select(&report, &SelectionTracker::new()).await.unwrap(),
            Selection::NoEligible
        ));
    }

    #[tokio::test]
    async fn test_discovery_runs_when_sample_is_exhausted() {
        let store = MemoryStore::new();
        put(&store, "sellers", "s1", json!({"company_id": "ACME"})).await;
        put(&store, "sellers", "s2", json!({"company_id": "GLOBEX"})).await;
        put(&store, "products", "a1", json!({"seller_id": "s1"})).await;
        put(&store, "products", "z1", json!({"seller_id": "s2", "company_id": ""})).await;

        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        let config = EngineConfig {
            eligible_sample_limit: 1,
            ..config()
        };
        let rng = Mutex::new(StdRng::seed_from_u64(3));
        let selector = PartitionSelector {
            store: &store,
            cache: &cache,
            profile: &profile,
            config: &config,
            rng: &rng,
        };
        let report = probe_eligibility(&store, &cache, &profile, &config).await.unwrap();
        assert_eq!(report.sample.len(), 1);
        assert_eq!(report.sample[0].record.id, "a1");

        // s1 was tried already; only the empty-string record in s2 remains,
        // which the null-target attempts cannot see.
        let mut tracker = SelectionTracker::new();
        tracker.mark_partition("s1");
        match selector.select(&report, &tracker).await.unwrap() {
            Selection::Selected(c) => assert_eq!(c.record.id, "z1"),
            Selection::NoEligible => panic!("expected discovery to find z1"),
        }
    }

    #[tokio::test]
    async fn test_discovery_exhausted_is_an_error() {
        let store = MemoryStore::new();
        put(&store, "sellers", "s1", json!({"company_id": "ACME"})).await;
        put(&store, "products", "a1", json!({"seller_id": "s1"})).await;

        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        let config = config();
        let rng = Mutex::new(StdRng::seed_from_u64(3));
        let selector = PartitionSelector {
            store: &store,
            cache: &cache,
            profile: &profile,
            config: &config,
            rng: &rng,
        };
        let report = probe_eligibility(&store, &cache, &profile, &config).await.unwrap();
        let mut tracker = SelectionTracker::new();
        tracker.mark_record("a1");
        let err = selector.select(&report, &tracker).await.unwrap_err();
        assert!(matches!(err, BackfillError::DiscoveryExhausted { attempts: 5 }));
    }

    #[tokio::test]
    async fn test_find_alternative_candidate() {
        let store = MemoryStore::new();
        put(&store, "products", "p1", json!({"seller_id": "s1"})).await;
        put(&store, "products", "p2", json!({"seller_id": "s1", "company_id": "ACME"})).await;
        put(&store, "products", "p3", json!({"seller_id": "s1"})).await;
        put(&store, "products", "q1", json!({"seller_id": "s2"})).await;

        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        let config = config();
        let rng = Mutex::new(StdRng::seed_from_u64(1));
        let selector = PartitionSelector {
            store: &store,
            cache: &cache,
            profile: &profile,
            config: &config,
            rng: &rng,
        };

        let mut tracker = SelectionTracker::new();
        tracker.mark_record("p1");
        let alt = selector.find_alternative_candidate(&Partition::from_key("s1"), &tracker).await.unwrap();
        assert_eq!(alt.unwrap().id, "p3");
        assert_eq!(cache.cached_page(&profile, "s1").unwrap().len(), 3);

        tracker.mark_record("p3");
        assert!(selector.find_alternative_candidate(&Partition::from_key("s1"), &tracker).await.unwrap().is_none());
    }
}
