use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::OptionalExtension;
use serde_json::{Map, Value};
use tokio_rusqlite::Connection;

use super::{
    Cursor, Direction, Document, DocumentStore, FilterOp, Query, Snapshot, WriteBatch, ID_FIELD,
};
use crate::error::{BackfillError, Result};

/// SQLite-backed document store. Every collection shares one `documents`
/// table; fields are stored as a JSON object and queried with `json_extract`.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub async fn new(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
                .await
                .map_err(|e: rusqlite::Error| BackfillError::Store(e.to_string()))?
        } else {
            Connection::open(path)
                .await
                .map_err(|e: rusqlite::Error| BackfillError::Store(e.to_string()))?
        };

        let store = SqliteStore { conn };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        self.conn
            .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode = WAL;
                    PRAGMA synchronous = NORMAL;
                    PRAGMA busy_timeout = 5000;
                    ",
                )?;

                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS documents (
                        collection TEXT NOT NULL,
                        id TEXT NOT NULL,
                        data TEXT NOT NULL,
                        updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                        PRIMARY KEY (collection, id)
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(|e: tokio_rusqlite::Error| BackfillError::Store(e.to_string()))
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// SQL expression for a field, pushing any path parameter it needs.
fn field_expr(field: &str, params: &mut Vec<SqlValue>) -> Result<String> {
    if field == ID_FIELD {
        return Ok("id".to_string());
    }
    if field.contains('"') || field.is_empty() {
        return Err(BackfillError::InvalidArgument(format!(
            "unsupported field name: {field:?}"
        )));
    }
    params.push(SqlValue::Text(format!("$.\"{field}\"")));
    Ok("json_extract(data, ?)".to_string())
}

/// Compile a query to SQL plus positional parameters, in textual order.
fn compile(query: &Query) -> Result<(String, Vec<SqlValue>)> {
    let mut sql = "SELECT id, data FROM documents WHERE collection = ?".to_string();
    let mut params = vec![SqlValue::Text(query.collection.clone())];

    for filter in &query.filters {
        match &filter.op {
            FilterOp::Eq(Value::Null) => {
                let expr = field_expr(&filter.field, &mut params)?;
                sql.push_str(&format!(" AND {expr} IS NULL"));
            }
            FilterOp::Eq(v) => {
                let expr = field_expr(&filter.field, &mut params)?;
                sql.push_str(&format!(" AND {expr} = ?"));
                params.push(to_sql(v));
            }
            FilterOp::Ne(v) => {
                let expr = field_expr(&filter.field, &mut params)?;
                let expr2 = field_expr(&filter.field, &mut params)?;
                sql.push_str(&format!(" AND {expr} IS NOT NULL AND {expr2} <> ?"));
                params.push(to_sql(v));
            }
            FilterOp::NotNull => {
                let expr = field_expr(&filter.field, &mut params)?;
                sql.push_str(&format!(" AND {expr} IS NOT NULL"));
            }
        }
    }

    let order = query.effective_order();

    if let Some(cursor) = &query.start_after {
        let anchor: Document = serde_json::from_str(cursor.token())
            .map_err(|e| BackfillError::InvalidCursor(e.to_string()))?;

        // Keyset predicate: (k0 > x0) OR (k0 = x0 AND k1 > x1) OR ...
        // SQLite sorts NULL first, so NULL anchors need explicit handling.
        let mut branches = Vec::new();
        for (i, key) in order.iter().enumerate() {
            let mut terms = Vec::new();
            for prev in &order[..i] {
                let expr = field_expr(&prev.field, &mut params)?;
                terms.push(format!("{expr} IS ?"));
                params.push(to_sql(&anchor.field(&prev.field)));
            }
            let anchor_value = anchor.field(&key.field);
            let expr = field_expr(&key.field, &mut params)?;
            let term = match (key.direction, anchor_value.is_null()) {
                (Direction::Asc, true) => format!("{expr} IS NOT NULL"),
                (Direction::Asc, false) => {
                    params.push(to_sql(&anchor_value));
                    format!("{expr} > ?")
                }
                // Nothing sorts after NULL in descending order.
                (Direction::Desc, true) => format!("({expr} IS NULL AND 0)"),
                (Direction::Desc, false) => {
                    params.push(to_sql(&anchor_value));
                    let expr2 = field_expr(&key.field, &mut params)?;
                    format!("({expr} < ? OR {expr2} IS NULL)")
                }
            };
            terms.push(term);
            branches.push(format!("({})", terms.join(" AND ")));
        }
        sql.push_str(&format!(" AND ({})", branches.join(" OR ")));
    }

    let mut order_terms = Vec::new();
    for o in &order {
        let expr = field_expr(&o.field, &mut params)?;
        let dir = match o.direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        order_terms.push(format!("{expr} {dir}"));
    }
    sql.push_str(&format!(" ORDER BY {}", order_terms.join(", ")));

    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        params.push(SqlValue::Integer(limit as i64));
    }

    Ok((sql, params))
}

fn to_snapshot(id: String, data: &str) -> Result<Snapshot> {
    let fields: Map<String, Value> = serde_json::from_str(data)?;
    let document = Document::new(id, fields);
    let token = serde_json::to_string(&document)?;
    Ok(Snapshot {
        document,
        cursor: Cursor::new(token),
    })
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn query(&self, query: &Query) -> Result<Vec<Snapshot>> {
        let (sql, params) = compile(query)?;

        let rows = self
            .conn
            .call(move |conn| -> std::result::Result<Vec<(String, String)>, rusqlite::Error> {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
            .map_err(|e: tokio_rusqlite::Error| BackfillError::Store(e.to_string()))?;

        rows.into_iter()
            .map(|(id, data)| to_snapshot(id, &data))
            .collect()
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Snapshot>> {
        let collection = collection.to_string();
        let id = id.to_string();
        let key = id.clone();

        let data = self
            .conn
            .call(move |conn| -> std::result::Result<Option<String>, rusqlite::Error> {
                let mut stmt =
                    conn.prepare("SELECT data FROM documents WHERE collection = ?1 AND id = ?2")?;
                let result = stmt
                    .query_row(rusqlite::params![collection, key], |row| row.get::<_, String>(0))
                    .optional()?;
                Ok(result)
            })
            .await
            .map_err(|e: tokio_rusqlite::Error| BackfillError::Store(e.to_string()))?;

        data.map(|d| to_snapshot(id, &d)).transpose()
    }

    async fn commit_batch(&self, batch: WriteBatch) -> Result<()> {
        let updates = batch.updates().to_vec();

        // The closure reports the first missing document instead of failing,
        // so the transaction rolls back on drop.
        let missing = self
            .conn
            .call(move |conn| -> std::result::Result<Option<(String, String)>, rusqlite::Error> {
                let tx = conn.transaction()?;
                for update in &updates {
                    let data: Option<String> = tx
                        .query_row(
                            "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
                            rusqlite::params![update.collection, update.id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    let Some(data) = data else {
                        return Ok(Some((update.collection.clone(), update.id.clone())));
                    };
                    let mut fields: Map<String, Value> = serde_json::from_str(&data)
                        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                    for (key, value) in &update.patch {
                        fields.insert(key.clone(), value.clone());
                    }
                    let merged = serde_json::to_string(&fields)
                        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                    tx.execute(
                        "UPDATE documents SET data = ?1, updated_at = datetime('now') WHERE collection = ?2 AND id = ?3",
                        rusqlite::params![merged, update.collection, update.id],
                    )?;
                }
                tx.commit()?;
                Ok(None)
            })
            .await
            .map_err(|e: tokio_rusqlite::Error| BackfillError::Store(e.to_string()))?;

        match missing {
            Some((collection, id)) => Err(BackfillError::NotFound { collection, id }),
            None => Ok(()),
        }
    }

    async fn put(&self, collection: &str, document: Document) -> Result<()> {
        let collection = collection.to_string();
        let data = serde_json::to_string(&document.fields)?;
        let id = document.id;

        self.conn
            .call(move |conn| -> std::result::Result<(), rusqlite::Error> {
                conn.execute(
                    "INSERT OR REPLACE INTO documents (collection, id, data) VALUES (?1, ?2, ?3)",
                    rusqlite::params![collection, id, data],
                )?;
                Ok(())
            })
            .await
            .map_err(|e: tokio_rusqlite::Error| BackfillError::Store(e.to_string()))
    }
}
