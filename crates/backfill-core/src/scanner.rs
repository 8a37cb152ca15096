use chrono::Utc;
use tracing::{debug, warn};

use crate::cache::MigrationCache;
use crate::config::EngineConfig;
use crate::error::{BackfillError, Result};
use crate::profile::MigrationProfile;
use crate::record::{CandidateRecord, Partition};
use crate::retry::with_retry;
use crate::session::Page;
use crate::store::{Cursor, DocumentStore, Query, Snapshot};

/// Resumable, fixed-size enumeration of one partition's candidate records,
/// ordered by document id.
pub struct BatchScanner<'a> {
    pub store: &'a dyn DocumentStore,
    pub cache: &'a MigrationCache,
    pub profile: &'a MigrationProfile,
    pub config: &'a EngineConfig,
}

impl BatchScanner<'_> {
    fn partition_query(&self, partition: &Partition) -> Query {
        Query::new(&self.profile.candidate_collection)
            .eq(&self.profile.partition_field, partition.value.clone())
            .limit(self.config.batch_size)
    }

    fn page_from(&self, rows: Vec<Snapshot>, batch_number: u32, processed_so_far: u64) -> Page {
        let cursor = rows.last().map(|s| s.cursor.clone());
        let records: Vec<CandidateRecord> = rows
            .iter()
            .map(|s| CandidateRecord::from_document(&s.document, self.profile))
            .collect();
        Page {
            has_more: records.len() == self.config.batch_size,
            total_processed: processed_so_far + records.len() as u64,
            records,
            cursor,
            batch_number,
            fetched_at: Utc::now(),
        }
    }

    async fn fresh_first_page(&self, partition: &Partition) -> Result<Page> {
        let query = &self.partition_query(partition);
        let partition_key = partition.key.as_str();
        let store = self.store;
        let rows = with_retry(&self.config.retry, "first page query", move || async move {
            let rows = store.query(query).await?;
            if rows.is_empty() {
                return Err(BackfillError::EmptyPartition {
                    partition_key: partition_key.to_string(),
                });
            }
            Ok(rows)
        })
        .await?;
        Ok(self.page_from(rows, 1, 0))
    }

    pub async fn fetch_first_page(&self, partition: &Partition) -> Result<Page> {
        let partition_key = partition.key.as_str();
        let Some(cached) = self.cache.cached_page(self.profile, partition_key) else {
            return self.fresh_first_page(partition).await;
        };
        if cached.is_empty() {
            return self.fresh_first_page(partition).await;
        }

        let batch_size = self.config.batch_size;
        let records: Vec<CandidateRecord> = cached.iter().take(batch_size).cloned().collect();
        let more_remaining = cached.len() > batch_size;
        debug!(
            target: "backfill",
            partition_key,
            cached = cached.len(),
            "first page served from cache"
        );

        if !more_remaining {
            return Ok(Page {
                total_processed: records.len() as u64,
                records,
                cursor: None,
                has_more: false,
                batch_number: 1,
                fetched_at: Utc::now(),
            });
        }

        // Cached records carry no cursor; re-read the last one directly.
        let last_id = records.last().map(|r| r.id.clone()).unwrap_or_default();
        let direct = with_retry(&self.config.retry, "cursor document read", || {
            self.store.get(&self.profile.candidate_collection, &last_id)
        })
        .await;

        let cursor: Option<Cursor> = match direct {
            Ok(Some(snapshot)) => Some(snapshot.cursor),
            Ok(None) => None,
            Err(e) => {
                warn!(target: "backfill", partition_key, error = %e, "direct cursor read failed");
                None
            }
        };

        if let Some(cursor) = cursor {
            return Ok(Page {
                total_processed: records.len() as u64,
                records,
                cursor: Some(cursor),
                has_more: true,
                batch_number: 1,
                fetched_at: Utc::now(),
            });
        }

        warn!(
            target: "backfill",
            partition_key,
            "cursor document unavailable, re-querying first page"
        );
        match self.fresh_first_page(partition).await {
            Ok(page) if page.cursor.is_some() => Ok(page),
            Ok(mut page) => {
                page.has_more = false;
                Ok(page)
            }
            Err(e) => {
                warn!(
                    target: "backfill",
                    partition_key,
                    error = %e,
                    "cursor resolution failed, serving cached page without continuation"
                );
                Ok(Page {
                    total_processed: records.len() as u64,
                    records,
                    cursor: None,
                    has_more: false,
                    batch_number: 1,
                    fetched_at: Utc::now(),
                })
            }
        }
    }

    pub async fn fetch_next_page(
        &self,
        partition: &Partition,
        cursor: Option<&Cursor>,
        page_number: u32,
        processed_so_far: u64,
    ) -> Result<Page> {
        let Some(cursor) = cursor else {
            return Err(BackfillError::MissingCursor {
                partition_key: partition.key.clone(),
            });
        };
        let query = self.partition_query(partition).start_after(cursor.clone());
        let rows = with_retry(&self.config.retry, "next page query", || self.store.query(&query))
            .await?;
        Ok(self.page_from(rows, page_number, processed_so_far))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::store::{Document, MemoryStore};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy::immediate(1),
            ..Default::default()
        }
    }

    fn s1() -> Partition {
        Partition::from_key("s1")
    }

    async fn seeded(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        for i in 0..n {
            store
                .put(
                    "products",
                    Document::from_value(format!("p{i:02}"), json!({"seller_id": "s1"})),
                )
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_pages_through_partition() {
        let store = seeded(25).await;
        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        let config = config();
        let scanner = BatchScanner {
            store: &store,
            cache: &cache,
            profile: &profile,
            config: &config,
        };

        let first = scanner.fetch_first_page(&s1()).await.unwrap();
        assert_eq!(first.len(), 10);
        assert!(first.has_more);

        let second = scanner
            .fetch_next_page(&s1(), first.cursor.as_ref(), 2, first.total_processed)
            .await
            .unwrap();
        assert_eq!(second.records[0].id, "p10");
        assert_eq!(second.total_processed, 20);

        let third = scanner
            .fetch_next_page(&s1(), second.cursor.as_ref(), 3, second.total_processed)
            .await
            .unwrap();
        assert_eq!(third.len(), 5);
        assert!(!third.has_more);
        assert_eq!(third.total_processed, 25);
    }

    #[tokio::test]
    async fn test_numeric_partition_value_is_queried_as_stored() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store
                .put(
                    "products",
                    Document::from_value(format!("n{i}"), json!({"seller_id": 42})),
                )
                .await
                .unwrap();
        }
        store
            .put("products", Document::from_value("t0", json!({"seller_id": "42"})))
            .await
            .unwrap();
        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        let config = config();
        let scanner = BatchScanner {
            store: &store,
            cache: &cache,
            profile: &profile,
            config: &config,
        };
        let numeric = Partition {
            key: "42".to_string(),
            value: json!(42),
        };
        let page = scanner.fetch_first_page(&numeric).await.unwrap();
        let ids: Vec<_> = page.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["n0", "n1", "n2"]);
    }

    #[tokio::test]
    async fn test_empty_partition_is_an_error() {
        let store = seeded(3).await;
        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        let config = config();
        let scanner = BatchScanner {
            store: &store,
            cache: &cache,
            profile: &profile,
            config: &config,
        };
        let err = scanner.fetch_first_page(&Partition::from_key("nobody")).await.unwrap_err();
        assert!(matches!(err, BackfillError::EmptyPartition { .. }));
    }

    #[tokio::test]
    async fn test_missing_cursor_fails_fast() {
        let store = seeded(3).await;
        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        let config = config();
        let scanner = BatchScanner {
            store: &store,
            cache: &cache,
            profile: &profile,
            config: &config,
        };
        let err = scanner.fetch_next_page(&s1(), None, 2, 10).await.unwrap_err();
        assert!(err.is_cursor_error());
    }

    #[tokio::test]
    async fn test_cached_first_page_resolves_cursor_directly() {
        let store = seeded(15).await;
        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        let config = config();
        let records: Vec<_> = (0..15)
            .map(|i| {
                let doc = Document::from_value(format!("p{i:02}"), json!({"seller_id": "s1"}));
                CandidateRecord::from_document(&doc, &profile)
            })
            .collect();
        cache.store_page(&profile, "s1", records);

        let scanner = BatchScanner {
            store: &store,
            cache: &cache,
            profile: &profile,
            config: &config,
        };
        let first = scanner.fetch_first_page(&s1()).await.unwrap();
        assert_eq!(first.len(), 10);
        assert!(first.has_more);

        let next = scanner
            .fetch_next_page(&s1(), first.cursor.as_ref(), 2, 10)
            .await
            .unwrap();
        assert_eq!(next.len(), 5);
        assert_eq!(next.records[0].id, "p10");
    }

    #[tokio::test]
    async fn test_cached_page_with_vanished_cursor_document_falls_back() {
        // The last record of the cached window no longer exists in the
        // store, so the cursor has to come from a fresh query.
        let store = seeded(10).await;
        let cache = MigrationCache::new(Duration::from_secs(60));
        let profile = MigrationProfile::products();
        let config = config();
        let mut records: Vec<_> = (0..12)
            .map(|i| {
                let doc = Document::from_value(format!("p{i:02}"), json!({"seller_id": "s1"}));
                CandidateRecord::from_document(&doc, &profile)
            })
            .collect();
        records[9].id = "ghost".to_string();
        cache.store_page(&profile, "s1", records);

        let scanner = BatchScanner {
            store: &store,
            cache: &cache,
            profile: &profile,
            config: &config,
        };
        let first = scanner.fetch_first_page(&s1()).await.unwrap();
        // Fresh query: exactly 10 rows, full window, cursor present.
        assert_eq!(first.len(), 10);
        assert_eq!(first.records[9].id, "p09");
        assert!(first.cursor.is_some());
    }
}
