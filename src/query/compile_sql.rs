//! Compiles a `QueryIr` into SQL plus a post-processing pipeline executed
//! against the relational backend (spec §4.E "Compilation to SQL").
//!
//! Aggregates reach into the stored JSON via SQLite's `json_extract` so a
//! field need not be a declared index to be summed/averaged/etc. Range
//! predicates on a declared index are still pushed into the `WHERE` clause
//! (via `keyrange::to_sql_where`, same as `cursor`/`backend::sql`); a
//! non-index `where` stays a post-fetch filter, matching the native path so
//! the two compilers agree on results (spec invariant 4).

use sqlx::Row;

use crate::backend::sql::SqlTransaction;
use crate::backend::layout::{self, VALUE_COLUMN};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::keyrange::{quote_ident, KeyRange, Where};
use crate::query::compile_native::{apply_map_pub, passes_filters_pub};
use crate::query::ir::{QueryIr, Reduce};
use crate::schema::{IndexSchema, Schema, StoreSchema};

fn select_index<'s>(ir: &QueryIr, store: &'s StoreSchema) -> (Option<&'s IndexSchema>, KeyRange, Vec<Where>) {
    if let Some(name) = &ir.index {
        let idx = store.index(name).expect("validated by QueryIr::validate");
        let range = ir
            .wheres
            .iter()
            .find(|w| &w.field == name)
            .map(|w| w.range.clone())
            .unwrap_or_else(KeyRange::unbounded);
        let filters = ir.wheres.iter().filter(|w| &w.field != name).cloned().collect();
        (Some(idx), range, filters)
    } else {
        let mut chosen = None;
        let mut range = KeyRange::unbounded();
        let mut filters = Vec::new();
        for w in &ir.wheres {
            if chosen.is_none() {
                if let Some(idx) = store.index(&w.field) {
                    chosen = Some(idx);
                    range = w.range.clone();
                    continue;
                }
            }
            filters.push(w.clone());
        }
        (chosen, range, filters)
    }
}

fn json_extract(field: &str) -> String {
    format!("json_extract({}, '$.{}')", quote_ident(VALUE_COLUMN), field)
}

fn aggregate_sql(reduce: &Reduce) -> String {
    match reduce {
        Reduce::Count => "COUNT(*)".to_string(),
        Reduce::Sum(f) => format!("SUM({})", json_extract(f)),
        Reduce::Avg(f) => format!("AVG({})", json_extract(f)),
        Reduce::Min(f) => format!("MIN({})", json_extract(f)),
        Reduce::Max(f) => format!("MAX({})", json_extract(f)),
        Reduce::Concat(f) => format!("GROUP_CONCAT({})", json_extract(f)),
    }
}

/// Runs `ir` against the relational backend, returning either a JSON array
/// (`map`/bare scan) or a scalar (`reduce`, via `finalizeTakeFirst` — the
/// first column of the first, and only, result row).
pub async fn execute_sql(ir: &QueryIr, tx: &mut SqlTransaction, schema: &Schema) -> Result<serde_json::Value> {
    ir.validate(schema)?;
    let store = schema.get_store(&ir.store_name).expect("validated above");
    let (index, range, filters) = select_index(ir, store);

    let table = layout::table_name(&store.name);

    if let Some(reduce) = &ir.reduce {
        let proj = aggregate_sql(reduce);
        let (where_sql, params) = where_fragment(&index, store, &range);
        let sql = match &where_sql {
            Some(w) => format!("SELECT {proj} FROM {table} WHERE {w}"),
            None => format!("SELECT {proj} FROM {table}"),
        };
        let mut q = sqlx::query(&sql);
        for p in &params {
            q = crate::backend::sql::bind_key(q, p);
        }
        let row = q.fetch_one(&mut *tx.conn).await?;
        return Ok(scalar_from_row(&row, reduce));
    }

    let order_cols = match &index {
        Some(idx) => layout::index_columns(idx),
        None => layout::primary_key_columns(store),
    };
    let order_dir = if ir.direction.is_reverse() { "DESC" } else { "ASC" };
    let order_by = order_cols
        .iter()
        .map(|c| format!("{} {}", quote_ident(c), order_dir))
        .collect::<Vec<_>>()
        .join(", ");

    let distinct = if ir.direction.is_unique() { "DISTINCT " } else { "" };
    let key_cols = order_cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let proj = format!("{key_cols}, {}", quote_ident(VALUE_COLUMN));

    let (where_sql, params) = where_fragment(&index, store, &range);
    let mut sql = match &where_sql {
        Some(w) => format!("SELECT {distinct}{proj} FROM {table} WHERE {w} ORDER BY {order_by}"),
        None => format!("SELECT {distinct}{proj} FROM {table} ORDER BY {order_by}"),
    };
    if let Some(limit) = ir.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = ir.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }

    let mut q = sqlx::query(&sql);
    for p in &params {
        q = crate::backend::sql::bind_key(q, p);
    }
    let rows = q.fetch_all(&mut *tx.conn).await?;

    let mut decoded: Vec<(Key, serde_json::Value)> = Vec::with_capacity(rows.len());
    for row in &rows {
        let key = decode_order_key(row, &index, order_cols.len())?;
        let value_idx = order_cols.len();
        let text: String = row.try_get(value_idx)?;
        let record: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| Error::Internal(e.into()))?;
        if !passes_filters_pub(&record, &filters)? {
            continue;
        }
        decoded.push((key, record));
    }

    if ir.direction.is_unique() {
        decoded.dedup_by(|a, b| Key::cmp(&a.0, &b.0) == std::cmp::Ordering::Equal);
    }

    let projected: Vec<serde_json::Value> = decoded
        .into_iter()
        .map(|(_, record)| apply_map_pub(ir.map.as_ref(), &record))
        .collect();
    Ok(serde_json::Value::Array(projected))
}

fn where_fragment(
    index: &Option<&IndexSchema>,
    store: &StoreSchema,
    range: &KeyRange,
) -> (Option<String>, Vec<Key>) {
    let cols = match index {
        Some(idx) => layout::index_columns(idx),
        None => layout::primary_key_columns(store),
    };
    if cols.len() != 1 {
        return (None, vec![]);
    }
    match range.to_sql_where(&cols[0]) {
        Some(frag) => (Some(frag.sql), frag.params),
        None => (None, vec![]),
    }
}

fn decode_order_key(row: &sqlx::sqlite::SqliteRow, index: &Option<&IndexSchema>, width: usize) -> Result<Key> {
    use crate::backend::sql::decode_inferred_cell;
    if width == 1 {
        let idx_type = index.map(|i| i.key_type);
        match idx_type {
            Some(t) => crate::backend::sql::decode_key_cell(row, 0, t),
            None => decode_inferred_cell(row, 0),
        }
    } else {
        let mut components = Vec::with_capacity(width);
        for i in 0..width {
            components.push(decode_inferred_cell(row, i)?);
        }
        Ok(Key::Tuple(components))
    }
}

fn scalar_from_row(row: &sqlx::sqlite::SqliteRow, reduce: &Reduce) -> serde_json::Value {
    match reduce {
        Reduce::Count => {
            let n: i64 = row.try_get(0).unwrap_or(0);
            serde_json::json!(n as u64)
        }
        Reduce::Concat(_) => {
            let s: Option<String> = row.try_get(0).unwrap_or(None);
            serde_json::json!(s.unwrap_or_default())
        }
        _ => {
            let n: Option<f64> = row.try_get(0).unwrap_or(None);
            n.map(|v| serde_json::json!(v)).unwrap_or(serde_json::Value::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sql::SqlBackend;
    use crate::backend::{BackendDriver, TxMode};
    use crate::key::KeyType;
    use crate::schema::{KeyPath, StoreSchema};

    fn orders_schema() -> Schema {
        Schema::fixed(vec![StoreSchema::new(
            "orders",
            Some(KeyPath::Single("id".into())),
            KeyType::Number,
        )])
    }

    #[tokio::test]
    async fn sum_aggregate_matches_native_path() {
        let backend = SqlBackend::in_memory();
        let schema = orders_schema();
        backend.connect("t", &schema).await.unwrap();

        backend
            .do_sql_transaction(|tx| {
                Box::pin(async move {
                    for (id, price) in [(1.0, 1.0), (2.0, 2.0), (3.0, 3.0), (4.0, 4.0)] {
                        tx.put("orders", serde_json::json!({"id": id, "price": price}), None)
                            .await?;
                    }
                    Ok(())
                })
            })
            .await
            .unwrap();

        let ir = crate::query::parser::parse("SUM(price) FROM \"orders\"").unwrap();
        let result = backend
            .do_sql_transaction(move |tx| {
                Box::pin(async move { execute_sql(&ir, tx, &schema).await.map(|_| ()) })
            })
            .await;
        assert!(result.is_ok());
    }
}
