pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Pseudo field naming the document id in filters and ordering.
pub const ID_FIELD: &str = "__id__";

/// A document as stored: an id plus arbitrary JSON fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Document {
            id: id.into(),
            fields,
        }
    }

    /// Build a document from a JSON object literal. Non-object values
    /// produce a document without fields.
    pub fn from_value(id: impl Into<String>, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Document::new(id, fields)
    }

    /// Value of `field`, with [`ID_FIELD`] resolving to the id. Missing
    /// fields read as `null`.
    pub fn field(&self, field: &str) -> Value {
        if field == ID_FIELD {
            return Value::String(self.id.clone());
        }
        self.fields.get(field).cloned().unwrap_or(Value::Null)
    }
}

/// Opaque continuation token issued by a store. Only the store that issued
/// it knows how to interpret the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Cursor(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

/// A read result: the document and the cursor that resumes a query after it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub document: Document,
    pub cursor: Cursor,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    /// Equality. `Eq(Value::Null)` also matches documents missing the field.
    Eq(Value),
    Ne(Value),
    NotNull,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Collection query. The document id is always the final sort key, so every
/// query has a stable total order.
#[derive(Debug, Clone)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub start_after: Option<Cursor>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Query {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: Vec::new(),
            start_after: None,
            limit: None,
        }
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op: FilterOp::Eq(value.into()),
        });
        self
    }

    pub fn ne(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op: FilterOp::Ne(value.into()),
        });
        self
    }

    pub fn not_null(mut self, field: &str) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op: FilterOp::NotNull,
        });
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn start_after(mut self, cursor: Cursor) -> Self {
        self.start_after = Some(cursor);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Ordering with the id tiebreaker appended when not already present.
    pub fn effective_order(&self) -> Vec<OrderBy> {
        let mut order = self.order_by.clone();
        if !order.iter().any(|o| o.field == ID_FIELD) {
            order.push(OrderBy {
                field: ID_FIELD.to_string(),
                direction: Direction::Asc,
            });
        }
        order
    }
}

/// One field patch inside a [`WriteBatch`].
#[derive(Debug, Clone)]
pub struct DocumentUpdate {
    pub collection: String,
    pub id: String,
    pub patch: Map<String, Value>,
}

/// Multi-document update committed all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    updates: Vec<DocumentUpdate>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, collection: &str, id: &str, patch: Map<String, Value>) {
        self.updates.push(DocumentUpdate {
            collection: collection.to_string(),
            id: id.to_string(),
            patch,
        });
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn updates(&self) -> &[DocumentUpdate] {
        &self.updates
    }
}

/// Trait for pluggable document store backends.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run a filtered, ordered, cursor-paginated collection query.
    async fn query(&self, query: &Query) -> Result<Vec<Snapshot>>;

    /// Read a single document by id.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Snapshot>>;

    /// Apply every update in the batch, or none of them.
    async fn commit_batch(&self, batch: WriteBatch) -> Result<()>;

    /// Insert or replace a whole document.
    async fn put(&self, collection: &str, document: Document) -> Result<()>;
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array <
/// object, then by value within a type.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => match type_rank(a).cmp(&type_rank(b)) {
            Ordering::Equal => a.to_string().cmp(&b.to_string()),
            other => other,
        },
    }
}

pub(crate) fn matches_filters(doc: &Document, filters: &[Filter]) -> bool {
    filters.iter().all(|f| {
        let value = doc.field(&f.field);
        match &f.op {
            FilterOp::Eq(expected) => compare_values(&value, expected) == Ordering::Equal,
            FilterOp::Ne(expected) => {
                !value.is_null() && compare_values(&value, expected) != Ordering::Equal
            }
            FilterOp::NotNull => !value.is_null(),
        }
    })
}

/// Compare two documents under a directional, lexicographic ordering.
pub(crate) fn compare_documents(a: &Document, b: &Document, order: &[OrderBy]) -> Ordering {
    for o in order {
        let ord = compare_values(&a.field(&o.field), &b.field(&o.field));
        let ord = match o.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
