use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{
    compare_documents, matches_filters, Cursor, Document, DocumentStore, Query, Snapshot,
    WriteBatch,
};
use crate::error::{BackfillError, Result};

type Collection = BTreeMap<String, serde_json::Map<String, Value>>;

/// In-process document store. Used for tests, dry runs and as the reference
/// semantics for other backends.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// The cursor carries the full document it was taken from, so resuming stays
// well defined after that document is updated or deleted.
fn snapshot_of(document: Document) -> Result<Snapshot> {
    let token = serde_json::to_string(&document)?;
    Ok(Snapshot {
        document,
        cursor: Cursor::new(token),
    })
}

fn decode_cursor(cursor: &Cursor) -> Result<Document> {
    serde_json::from_str(cursor.token())
        .map_err(|e| BackfillError::InvalidCursor(e.to_string()))
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn query(&self, query: &Query) -> Result<Vec<Snapshot>> {
        let order = query.effective_order();
        let anchor = match &query.start_after {
            Some(cursor) => Some(decode_cursor(cursor)?),
            None => None,
        };

        let mut docs: Vec<Document> = {
            let collections = self.collections.read().await;
            let Some(collection) = collections.get(&query.collection) else {
                return Ok(Vec::new());
            };
            collection
                .iter()
                .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                .filter(|doc| matches_filters(doc, &query.filters))
                .collect()
        };

        docs.sort_by(|a, b| compare_documents(a, b, &order));

        if let Some(anchor) = anchor {
            docs.retain(|doc| compare_documents(doc, &anchor, &order) == Ordering::Greater);
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }

        docs.into_iter().map(snapshot_of).collect()
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Snapshot>> {
        let collections = self.collections.read().await;
        match collections.get(collection).and_then(|c| c.get(id)) {
            Some(fields) => snapshot_of(Document::new(id, fields.clone())).map(Some),
            None => Ok(None),
        }
    }

    async fn commit_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut collections = self.collections.write().await;

        // Validate everything before touching anything.
        for update in batch.updates() {
            let exists = collections
                .get(&update.collection)
                .is_some_and(|c| c.contains_key(&update.id));
            if !exists {
                return Err(BackfillError::NotFound {
                    collection: update.collection.clone(),
                    id: update.id.clone(),
                });
            }
        }

        for update in batch.updates() {
            if let Some(fields) = collections
                .get_mut(&update.collection)
                .and_then(|c| c.get_mut(&update.id))
            {
                for (key, value) in &update.patch {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    async fn put(&self, collection: &str, document: Document) -> Result<()> {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(document.id, document.fields);
        Ok(())
    }
}
