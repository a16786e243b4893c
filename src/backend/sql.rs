//! The relational-SQL exemplar backend (SQLite via `sqlx`), grounded in the
//! teacher's `SqlxCatalogManager`/`SqliteCatalogManager` (`src/catalog/*`):
//! same `SqlitePool::connect` + `CREATE TABLE IF NOT EXISTS` + migration
//! bootstrap shape, generalized from a fixed catalog schema to an arbitrary
//! store/index schema.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value as Record;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::{broadcast, RwLock};

use crate::backend::layout::{self, OUT_OF_LINE_KEY_COLUMN, VALUE_COLUMN};
use crate::backend::{BackendDriver, KeySelector, Transaction, TransactionJob, TxMode};
use crate::error::{Error, Result};
use crate::key::{Key, KeyType};
use crate::keyrange::quote_ident;
use crate::query::compile_sql::execute_sql;
use crate::query::QueryIr;
use crate::record::extract_key;
use crate::schema::{Schema, StoreSchema};

/// Decodes a key column whose declared type is known up front (a store's
/// primary key, or a single-path index key).
pub(crate) fn decode_key_cell(row: &SqliteRow, idx: usize, key_type: KeyType) -> Result<Key> {
    match key_type {
        KeyType::Number => Ok(Key::Number(row.try_get::<f64, _>(idx)?)),
        KeyType::String => Ok(Key::Text(row.try_get::<String, _>(idx)?)),
        KeyType::Date => {
            let s: String = row.try_get(idx)?;
            let dt = DateTime::parse_from_rfc3339(&s)
                .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
            Ok(Key::Date(dt.with_timezone(&Utc)))
        }
        KeyType::Tuple => unreachable!("tuple keys decode component-by-component"),
    }
}

/// Decodes a tuple component column whose type wasn't fixed at schema
/// declaration time (see `record::infer_leaf_key`): try numeric, then
/// RFC3339 date, then fall back to plain text.
pub(crate) fn decode_inferred_cell(row: &SqliteRow, idx: usize) -> Result<Key> {
    if let Ok(n) = row.try_get::<f64, _>(idx) {
        return Ok(Key::Number(n));
    }
    let s: String = row.try_get(idx)?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Ok(Key::Date(dt.with_timezone(&Utc)));
    }
    Ok(Key::Text(s))
}

pub(crate) fn bind_key(
    mut query: sqlx::query::Query<'_, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'_>>,
    key: &Key,
) -> sqlx::query::Query<'_, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    match key {
        Key::Number(n) => query.bind(*n),
        Key::Date(d) => query.bind(d.to_rfc3339()),
        Key::Text(s) => query.bind(s.clone()),
        Key::Tuple(components) => {
            for component in components {
                query = bind_key(query, component);
            }
            query
        }
    }
}

/// Decodes the full row of primary-key columns declared for `store`.
pub(crate) fn decode_primary_key(row: &SqliteRow, store: &StoreSchema) -> Result<Key> {
    let cols = layout::primary_key_columns(store);
    if cols.len() == 1 {
        decode_key_cell(row, 0, store.key_type)
    } else {
        let mut components = Vec::with_capacity(cols.len());
        for i in 0..cols.len() {
            components.push(decode_inferred_cell(row, i)?);
        }
        Ok(Key::Tuple(components))
    }
}

/// Relational backend over a single SQLite database file (or `:memory:`).
#[derive(Debug)]
pub struct SqlBackend {
    path: String,
    pool: RwLock<Option<SqlitePool>>,
    ready: AtomicBool,
    disconnect: broadcast::Sender<()>,
    schema: RwLock<Option<Schema>>,
}

impl SqlBackend {
    pub fn new(path: impl Into<String>) -> Self {
        let (disconnect, _) = broadcast::channel(8);
        SqlBackend {
            path: path.into(),
            pool: RwLock::new(None),
            ready: AtomicBool::new(false),
            disconnect,
            schema: RwLock::new(None),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    async fn pool(&self) -> Result<SqlitePool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::invalid_state("backend is not connected"))
    }

    pub(crate) async fn schema_snapshot(&self) -> Result<Schema> {
        self.schema
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::invalid_state("backend is not connected"))
    }

    async fn ensure_store_table(pool: &SqlitePool, store: &StoreSchema) -> Result<()> {
        sqlx::query(&layout::create_table_sql(store))
            .execute(pool)
            .await?;
        for index in &store.indexes {
            for stmt in layout::add_index_columns_sql(&store.name, index) {
                // Ignore "duplicate column" failures — ALTER TABLE ADD
                // COLUMN has no IF NOT EXISTS in SQLite.
                let _ = sqlx::query(&stmt).execute(pool).await;
            }
            if index.unique {
                let cols = layout::index_columns(index)
                    .into_iter()
                    .map(|c| quote_ident(&c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let stmt = format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
                    quote_ident(&format!("uniq__{}__{}", store.name, index.name)),
                    layout::table_name(&store.name),
                    cols
                );
                sqlx::query(&stmt).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// Runs `job` against a concrete `&mut SqlTransaction`, for callers
    /// (the cursor and query-compiler SQL path) that need the relational
    /// backend's own connection rather than the type-erased `dyn
    /// Transaction`. The trait's `do_transaction` is implemented in terms
    /// of this.
    pub async fn do_sql_transaction<F>(&self, job: F) -> Result<()>
    where
        F: for<'a> FnOnce(&'a mut SqlTransaction) -> BoxFuture<'a, Result<()>> + Send,
    {
        let pool = self.pool().await?;
        let schema = self.schema_snapshot().await?;
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN").execute(&mut *conn).await?;

        let mut tx = SqlTransaction { conn, schema };
        let result = job(&mut tx).await;

        match &result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *tx.conn).await?;
            }
            Err(_) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *tx.conn).await;
            }
        }
        result
    }
}

#[async_trait]
impl BackendDriver for SqlBackend {
    fn backend_id(&self) -> &'static str {
        "relational-sql"
    }

    async fn connect(&self, _name: &str, schema: &Schema) -> Result<()> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{}?mode=rwc", self.path))
            .await?;

        for store_name in schema.store_names() {
            if let Some(store) = schema.get_store(store_name) {
                Self::ensure_store_table(&pool, store).await?;
            }
        }

        *self.pool.write().await = Some(pool);
        *self.schema.write().await = Some(schema.clone());
        self.ready.store(true, AtomicOrdering::SeqCst);
        tracing::info!(backend = "relational-sql", "connection ready");
        Ok(())
    }

    async fn persisted_schema(&self) -> Option<Schema> {
        self.schema.read().await.clone()
    }

    async fn do_transaction(
        &self,
        _stores: &[String],
        _mode: TxMode,
        job: TransactionJob,
    ) -> Result<()> {
        self.do_sql_transaction(move |tx| job(tx)).await
    }

    fn is_ready(&self) -> bool {
        self.ready.load(AtomicOrdering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        self.ready.store(false, AtomicOrdering::SeqCst);
        let _ = self.disconnect.send(());
        Ok(())
    }

    fn subscribe_disconnected(&self) -> broadcast::Receiver<()> {
        self.disconnect.subscribe()
    }
}

pub struct SqlTransaction {
    pub(crate) conn: sqlx::pool::PoolConnection<sqlx::Sqlite>,
    pub(crate) schema: Schema,
}

impl SqlTransaction {
    fn store(&self, name: &str) -> Result<&StoreSchema> {
        self.schema
            .get_store(name)
            .ok_or_else(|| Error::argument(format!("unknown store '{name}'")))
    }

    fn resolve_key(&self, store: &StoreSchema, record: &Record, key: Option<Key>) -> Result<Key> {
        match (&store.key_path, key) {
            (Some(path), _) => extract_key(record, path, store.key_type),
            (None, Some(k)) => Ok(k),
            (None, None) => Err(Error::argument(
                "store has no key path; an out-of-line key is required",
            )),
        }
    }
}

#[async_trait]
impl Transaction for SqlTransaction {
    async fn put(&mut self, store_name: &str, record: Record, key: Option<Key>) -> Result<Key> {
        let store = self.store(store_name)?.clone();
        let key = self.resolve_key(&store, &record, key)?;
        let value_json = serde_json::to_string(&record).map_err(|e| Error::Internal(e.into()))?;

        let pk_cols = layout::primary_key_columns(&store);
        let mut cols: Vec<String> = pk_cols.iter().map(|c| quote_ident(c)).collect();
        cols.push(quote_ident(VALUE_COLUMN));
        let mut index_values: Vec<(Vec<String>, Key)> = Vec::new();
        for index in &store.indexes {
            if let Ok(index_key) = extract_key(&record, &index.key_path, index.key_type) {
                let idx_cols = layout::index_columns(index);
                for col in &idx_cols {
                    cols.push(quote_ident(col));
                }
                index_values.push((idx_cols, index_key));
            }
        }

        let placeholders = vec!["?"; cols.len()].join(", ");
        let conflict_cols = pk_cols
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let update_assignments = {
            let mut assigns = vec![format!("{} = excluded.{}", quote_ident(VALUE_COLUMN), quote_ident(VALUE_COLUMN))];
            for (idx_cols, _) in &index_values {
                for col in idx_cols {
                    assigns.push(format!("{} = excluded.{}", quote_ident(col), quote_ident(col)));
                }
            }
            assigns.join(", ")
        };

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
            layout::table_name(store_name),
            cols.join(", "),
            placeholders,
            conflict_cols,
            update_assignments
        );

        let mut q = sqlx::query(&sql);
        q = bind_key(q, &key);
        let value_json_owned = value_json;
        q = q.bind(value_json_owned);
        for (_, index_key) in &index_values {
            q = bind_key(q, index_key);
        }
        q.execute(&mut *self.conn).await?;

        Ok(key)
    }

    async fn add(&mut self, store_name: &str, record: Record, key: Option<Key>) -> Result<Key> {
        let store = self.store(store_name)?.clone();
        let resolved = self.resolve_key(&store, &record, key.clone())?;
        if self.get(store_name, &resolved).await?.is_some() {
            return Err(Error::constraint(format!(
                "key already exists in store '{store_name}'"
            )));
        }
        self.put(store_name, record, key.or(Some(resolved))).await
    }

    async fn get(&mut self, store_name: &str, key: &Key) -> Result<Option<Record>> {
        let store = self.store(store_name)?.clone();
        let pk_cols = layout::primary_key_columns(&store);
        let where_clause = pk_cols
            .iter()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            quote_ident(VALUE_COLUMN),
            layout::table_name(store_name),
            where_clause
        );
        let mut q = sqlx::query(&sql);
        q = bind_key(q, key);
        let row = q.fetch_optional(&mut *self.conn).await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let text: String = row.try_get(0)?;
                Ok(Some(
                    serde_json::from_str(&text).map_err(|e| Error::Internal(e.into()))?,
                ))
            }
        }
    }

    async fn list(&mut self, store_name: &str, selector: KeySelector) -> Result<Vec<Record>> {
        let store = self.store(store_name)?.clone();
        let pk_cols = layout::primary_key_columns(&store);
        let order_by = pk_cols
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let (where_sql, params): (Option<String>, Vec<Key>) = match selector {
            KeySelector::Keys(keys) => {
                if keys.is_empty() {
                    (None, vec![])
                } else {
                    let clauses: Vec<String> = keys
                        .iter()
                        .map(|_| {
                            pk_cols
                                .iter()
                                .map(|c| format!("{} = ?", quote_ident(c)))
                                .collect::<Vec<_>>()
                                .join(" AND ")
                        })
                        .map(|clause| format!("({clause})"))
                        .collect();
                    (Some(clauses.join(" OR ")), keys)
                }
            }
            KeySelector::Range(range) => {
                if pk_cols.len() == 1 {
                    match range.to_sql_where(&pk_cols[0]) {
                        Some(frag) => (Some(frag.sql), frag.params),
                        None => (None, vec![]),
                    }
                } else {
                    (None, vec![])
                }
            }
        };

        let sql = match &where_sql {
            Some(w) => format!(
                "SELECT {} FROM {} WHERE {} ORDER BY {}",
                quote_ident(VALUE_COLUMN),
                layout::table_name(store_name),
                w,
                order_by
            ),
            None => format!(
                "SELECT {} FROM {} ORDER BY {}",
                quote_ident(VALUE_COLUMN),
                layout::table_name(store_name),
                order_by
            ),
        };

        let mut q = sqlx::query(&sql);
        for key in &params {
            q = bind_key(q, key);
        }
        let rows = q.fetch_all(&mut *self.conn).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row.try_get(0)?;
            out.push(serde_json::from_str(&text).map_err(|e| Error::Internal(e.into()))?);
        }
        Ok(out)
    }

    async fn count(&mut self, store_name: &str, range: Option<crate::keyrange::KeyRange>) -> Result<u64> {
        let store = self.store(store_name)?.clone();
        let pk_cols = layout::primary_key_columns(&store);
        let (where_sql, params): (Option<String>, Vec<Key>) = match range {
            Some(range) if pk_cols.len() == 1 => match range.to_sql_where(&pk_cols[0]) {
                Some(frag) => (Some(frag.sql), frag.params),
                None => (None, vec![]),
            },
            _ => (None, vec![]),
        };
        let sql = match &where_sql {
            Some(w) => format!(
                "SELECT COUNT(*) FROM {} WHERE {}",
                layout::table_name(store_name),
                w
            ),
            None => format!("SELECT COUNT(*) FROM {}", layout::table_name(store_name)),
        };
        let mut q = sqlx::query(&sql);
        for key in &params {
            q = bind_key(q, key);
        }
        let row = q.fetch_one(&mut *self.conn).await?;
        let n: i64 = row.try_get(0)?;
        Ok(n as u64)
    }

    async fn clear_store(&mut self, store_name: &str) -> Result<()> {
        self.store(store_name)?;
        let sql = format!("DELETE FROM {}", layout::table_name(store_name));
        sqlx::query(&sql).execute(&mut *self.conn).await?;
        Ok(())
    }

    async fn remove(&mut self, store_name: &str, selector: KeySelector) -> Result<u64> {
        let store = self.store(store_name)?.clone();
        let pk_cols = layout::primary_key_columns(&store);

        let (where_sql, params): (Option<String>, Vec<Key>) = match selector {
            KeySelector::Keys(keys) => {
                let clauses: Vec<String> = keys
                    .iter()
                    .map(|_| {
                        pk_cols
                            .iter()
                            .map(|c| format!("{} = ?", quote_ident(c)))
                            .collect::<Vec<_>>()
                            .join(" AND ")
                    })
                    .map(|clause| format!("({clause})"))
                    .collect();
                (Some(clauses.join(" OR ")), keys)
            }
            KeySelector::Range(range) => {
                if pk_cols.len() == 1 {
                    match range.to_sql_where(&pk_cols[0]) {
                        Some(frag) => (Some(frag.sql), frag.params),
                        None => (None, vec![]),
                    }
                } else {
                    (None, vec![])
                }
            }
        };

        let sql = match &where_sql {
            Some(w) => format!("DELETE FROM {} WHERE {}", layout::table_name(store_name), w),
            None => format!("DELETE FROM {}", layout::table_name(store_name)),
        };
        let mut q = sqlx::query(&sql);
        for key in &params {
            q = bind_key(q, key);
        }
        let result = q.execute(&mut *self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn run_query(&mut self, ir: &QueryIr, schema: &Schema) -> Result<serde_json::Value> {
        execute_sql(ir, self, schema).await
    }
}

/// Column name used for an out-of-line primary key, re-exported for tests
/// that build records without a declared key path.
pub const OUT_OF_LINE_KEY: &str = OUT_OF_LINE_KEY_COLUMN;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{IndexSchema, KeyPath};

    fn person_store() -> StoreSchema {
        StoreSchema::new("people", Some(KeyPath::Single("id".into())), KeyType::Number).with_index(
            IndexSchema {
                name: "name".into(),
                key_path: KeyPath::Single("name".into()),
                key_type: KeyType::String,
                unique: false,
                multi_entry: false,
            },
        )
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let backend = SqlBackend::in_memory();
        let schema = Schema::fixed(vec![person_store()]);
        backend.connect("t", &schema).await.unwrap();

        backend
            .do_transaction(
                &["people".into()],
                TxMode::ReadWrite,
                Box::new(|tx| {
                    Box::pin(async move {
                        tx.put(
                            "people",
                            serde_json::json!({"id": 1.0, "name": "ada"}),
                            None,
                        )
                        .await?;
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();

        backend
            .do_transaction(
                &["people".into()],
                TxMode::ReadOnly,
                Box::new(|tx| {
                    Box::pin(async move {
                        let got = tx.get("people", &Key::Number(1.0)).await?;
                        assert_eq!(got.unwrap()["name"], "ada");
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn add_rejects_duplicate_key() {
        let backend = SqlBackend::in_memory();
        let schema = Schema::fixed(vec![person_store()]);
        backend.connect("t", &schema).await.unwrap();

        backend
            .do_transaction(
                &["people".into()],
                TxMode::ReadWrite,
                Box::new(|tx| {
                    Box::pin(async move {
                        tx.put("people", serde_json::json!({"id": 7.0, "v": "a"}), None)
                            .await?;
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();

        let result = backend
            .do_transaction(
                &["people".into()],
                TxMode::ReadWrite,
                Box::new(|tx| {
                    Box::pin(async move {
                        tx.add("people", serde_json::json!({"id": 7.0, "v": "b"}), None)
                            .await?;
                        Ok(())
                    })
                }),
            )
            .await;

        assert!(result.is_err());
    }
}
