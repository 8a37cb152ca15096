//! Full migration over the SQLite backend.

#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;

use backfill_core::writer::FIELD_MIGRATION_BATCH_NUMBER;
use backfill_core::{DocumentStore, MigrationEngine, MigrationProfile, SqliteStore};
use common::{fast_config, put, seed_partition};
use serde_json::json;

#[tokio::test]
async fn test_quotation_migration_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backfill.db");
    let path = path.to_str().unwrap();

    {
        let store = SqliteStore::new(path).await.unwrap();
        put(&store, "users", "U1", json!({"company_id": "INITECH"})).await;
        for i in 0..23 {
            put(
                &store,
                "quotations",
                &format!("q{i:03}"),
                json!({"seller_id": "U1", "total": i * 10}),
            )
            .await;
        }
        put(&store, "quotations", "done", json!({"seller_id": "U1", "company_id": "INITECH"})).await;
    }

    let store = Arc::new(SqliteStore::new(path).await.unwrap());
    let engine =
        MigrationEngine::new(store.clone(), MigrationProfile::quotations(), fast_config()).unwrap();
    engine.initialize_migration().await.unwrap();

    let mut batches = 0;
    let summary = engine.process_all_batches(|_| batches += 1).await.unwrap();
    assert_eq!(batches, 3);
    assert_eq!(summary.total_updated, 23);
    assert_eq!(summary.total_skipped, 1);
    assert_eq!(summary.total_records, 24);

    let q = store.get("quotations", "q022").await.unwrap().unwrap().document;
    assert_eq!(q.field("company_id"), json!("INITECH"));
    assert_eq!(q.field("total"), json!(220));
    assert_eq!(q.field(FIELD_MIGRATION_BATCH_NUMBER), json!(3));
    assert_eq!(q.field("migration_source"), json!("quotation-migration"));
}

#[tokio::test]
async fn test_sqlite_unresolved_partition_is_left_alone() {
    let store = Arc::new(SqliteStore::new(":memory:").await.unwrap());
    seed_partition(store.as_ref(), "S1", "ACME", 4).await;
    put(store.as_ref(), "products", "orphan", json!({"seller_id": "nobody"})).await;

    let engine =
        MigrationEngine::new(store.clone(), MigrationProfile::products(), fast_config()).unwrap();
    engine.initialize_migration().await.unwrap();
    let summary = engine.process_all_batches(|_| {}).await.unwrap();
    assert_eq!(summary.total_updated, 4);

    let orphan = store.get("products", "orphan").await.unwrap().unwrap().document;
    assert!(orphan.field("company_id").is_null());
}
