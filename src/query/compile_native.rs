//! Compiles a `QueryIr` into a descriptor the native in-memory backend
//! executes by materializing its store and filtering/sorting in Rust — the
//! in-memory analogue of `backend::sql`'s SQL generation.
//!
//! The native backend (`backend::native`) has no secondary-index storage of
//! its own (see its module doc); `index` here therefore only selects which
//! field supplies the effective key and range, not a separate sorted
//! structure — every native query is a full-table scan followed by
//! in-memory sort. This is a deliberate simplification appropriate to an
//! exemplar/test backend, not a production index engine.

use crate::backend::{Direction, KeySelector, Transaction};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::keyrange::{KeyRange, Where};
use crate::query::ir::{MapSpec, QueryIr, Reduce};
use crate::record::{extract_key, get_path, infer_leaf_key};
use crate::schema::Schema;

#[derive(Debug, Clone)]
pub struct NativeCursorDescriptor {
    pub store: String,
    pub index: Option<String>,
    pub direction: Direction,
    pub range: KeyRange,
    pub filters: Vec<Where>,
    pub map: Option<MapSpec>,
    pub reduce: Option<Reduce>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Index-selection rule (spec §4.E): an explicitly named index wins;
/// otherwise the first `where` whose field is a declared index of the
/// store supplies the range, and the rest become post-range filters.
pub fn compile_native(ir: &QueryIr, schema: &Schema) -> Result<NativeCursorDescriptor> {
    ir.validate(schema)?;
    let store = schema.get_store(&ir.store_name).expect("validated above");

    let (index, range, filters) = if let Some(name) = &ir.index {
        let range = ir
            .wheres
            .iter()
            .find(|w| &w.field == name)
            .map(|w| w.range.clone())
            .unwrap_or_else(KeyRange::unbounded);
        let filters = ir.wheres.iter().filter(|w| &w.field != name).cloned().collect();
        (Some(name.clone()), range, filters)
    } else {
        let mut index = None;
        let mut range = KeyRange::unbounded();
        let mut filters = Vec::new();
        for w in &ir.wheres {
            if index.is_none() && store.index(&w.field).is_some() {
                index = Some(w.field.clone());
                range = w.range.clone();
            } else {
                filters.push(w.clone());
            }
        }
        (index, range, filters)
    };

    Ok(NativeCursorDescriptor {
        store: ir.store_name.clone(),
        index,
        direction: ir.direction,
        range,
        filters,
        map: ir.map.clone(),
        reduce: ir.reduce.clone(),
        limit: ir.limit,
        offset: ir.offset,
    })
}

/// Executes a compiled descriptor against a transaction's native store,
/// returning either a JSON array (`map`/bare scan) or a single aggregate
/// scalar (`reduce`).
pub async fn execute_native(
    descriptor: &NativeCursorDescriptor,
    tx: &mut dyn Transaction,
    schema: &Schema,
) -> Result<serde_json::Value> {
    let store = schema
        .get_store(&descriptor.store)
        .ok_or_else(|| Error::argument(format!("unknown store '{}'", descriptor.store)))?;

    let index_schema = match &descriptor.index {
        Some(name) => Some(
            store
                .index(name)
                .ok_or_else(|| Error::argument(format!("'{name}' is not an index of '{}'", descriptor.store)))?
                .clone(),
        ),
        None => None,
    };

    let records = tx
        .list(&descriptor.store, KeySelector::Range(KeyRange::unbounded()))
        .await?;

    let mut rows: Vec<(Key, serde_json::Value)> = Vec::new();
    for record in records {
        let effective = match &index_schema {
            Some(idx) => extract_key(&record, &idx.key_path, idx.key_type)?,
            None => match &store.key_path {
                Some(path) => extract_key(&record, path, store.key_type)?,
                None => continue,
            },
        };
        if !descriptor.range.contains(&effective) {
            continue;
        }
        if !passes_filters(&record, &descriptor.filters)? {
            continue;
        }
        rows.push((effective, record));
    }

    let reverse = descriptor.direction.is_reverse();
    rows.sort_by(|a, b| if reverse { Key::cmp(&b.0, &a.0) } else { Key::cmp(&a.0, &b.0) });

    if descriptor.direction.is_unique() {
        rows.dedup_by(|a, b| Key::cmp(&a.0, &b.0) == std::cmp::Ordering::Equal);
    }

    let offset = descriptor.offset.unwrap_or(0) as usize;
    let rows: Vec<(Key, serde_json::Value)> = rows.into_iter().skip(offset).collect();
    let rows: Vec<(Key, serde_json::Value)> = match descriptor.limit {
        Some(n) => rows.into_iter().take(n as usize).collect(),
        None => rows,
    };

    if let Some(reduce) = &descriptor.reduce {
        return Ok(apply_reduce(reduce, rows.into_iter().map(|(_, v)| v)));
    }

    let projected: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(_, record)| apply_map(descriptor.map.as_ref(), &record))
        .collect();
    Ok(serde_json::Value::Array(projected))
}

pub(crate) fn passes_filters_pub(record: &serde_json::Value, filters: &[Where]) -> Result<bool> {
    passes_filters(record, filters)
}

fn passes_filters(record: &serde_json::Value, filters: &[Where]) -> Result<bool> {
    for w in filters {
        match get_path(record, &w.field) {
            None => return Ok(false),
            Some(value) => {
                let key = infer_leaf_key(value)?;
                if !w.range.contains(&key) {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

pub(crate) fn apply_map_pub(map: Option<&MapSpec>, record: &serde_json::Value) -> serde_json::Value {
    apply_map(map, record)
}

fn apply_map(map: Option<&MapSpec>, record: &serde_json::Value) -> serde_json::Value {
    match map {
        None | Some(MapSpec::Whole) => record.clone(),
        Some(MapSpec::Field(field)) => get_path(record, field).cloned().unwrap_or(serde_json::Value::Null),
        Some(MapSpec::Fields(fields)) => {
            let mut obj = serde_json::Map::new();
            for field in fields {
                obj.insert(
                    field.clone(),
                    get_path(record, field).cloned().unwrap_or(serde_json::Value::Null),
                );
            }
            serde_json::Value::Object(obj)
        }
    }
}

/// `avg` is computed as an incremental mean `((prev*i) + x) / (i+1)` to
/// avoid overflowing a summed accumulator over a long stream (spec §4.E).
fn apply_reduce(reduce: &Reduce, records: impl Iterator<Item = serde_json::Value>) -> serde_json::Value {
    match reduce {
        Reduce::Count => serde_json::json!(records.count() as u64),
        Reduce::Sum(field) => {
            let sum: f64 = records.filter_map(|r| numeric_field(&r, field)).sum();
            serde_json::json!(sum)
        }
        Reduce::Avg(field) => {
            let mut mean = 0f64;
            let mut i = 0u64;
            for r in records {
                if let Some(x) = numeric_field(&r, field) {
                    mean = ((mean * i as f64) + x) / (i as f64 + 1.0);
                    i += 1;
                }
            }
            if i == 0 {
                serde_json::Value::Null
            } else {
                serde_json::json!(mean)
            }
        }
        Reduce::Min(field) => fold_extreme(records, field, true),
        Reduce::Max(field) => fold_extreme(records, field, false),
        Reduce::Concat(field) => {
            let joined = records
                .filter_map(|r| get_path(&r, field).and_then(|v| v.as_str().map(str::to_string)))
                .collect::<Vec<_>>()
                .join(",");
            serde_json::json!(joined)
        }
    }
}

fn numeric_field(record: &serde_json::Value, field: &str) -> Option<f64> {
    get_path(record, field).and_then(|v| v.as_f64())
}

fn fold_extreme(records: impl Iterator<Item = serde_json::Value>, field: &str, want_min: bool) -> serde_json::Value {
    let mut best: Option<f64> = None;
    for r in records {
        if let Some(x) = numeric_field(&r, field) {
            best = Some(match best {
                None => x,
                Some(b) => {
                    if (want_min && x < b) || (!want_min && x > b) {
                        x
                    } else {
                        b
                    }
                }
            });
        }
    }
    best.map(|v| serde_json::json!(v)).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::native::NativeBackend;
    use crate::backend::{BackendDriver, TxMode};
    use crate::key::KeyType;
    use crate::schema::{IndexSchema, KeyPath, StoreSchema};

    fn orders_schema() -> Schema {
        Schema::fixed(vec![StoreSchema::new(
            "orders",
            Some(KeyPath::Single("id".into())),
            KeyType::Number,
        )
        .with_index(IndexSchema {
            name: "price".into(),
            key_path: KeyPath::Single("price".into()),
            key_type: KeyType::Number,
            unique: false,
            multi_entry: false,
        })])
    }

    #[tokio::test]
    async fn sum_aggregate_matches_expected_total() {
        let backend = NativeBackend::new();
        let schema = orders_schema();
        backend.connect("t", &schema).await.unwrap();
        backend
            .do_transaction(
                &["orders".into()],
                TxMode::ReadWrite,
                Box::new(|tx| {
                    Box::pin(async move {
                        for (id, price) in [(1.0, 1.0), (2.0, 2.0), (3.0, 3.0), (4.0, 4.0)] {
                            tx.put("orders", serde_json::json!({"id": id, "price": price}), None)
                                .await?;
                        }
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();

        let ir = crate::query::parser::parse("SUM(price) FROM \"orders\"").unwrap();
        let descriptor = compile_native(&ir, &schema).unwrap();

        backend
            .do_transaction(
                &["orders".into()],
                TxMode::ReadOnly,
                Box::new(move |tx| {
                    let schema = schema.clone();
                    Box::pin(async move {
                        let result = execute_native(&descriptor, tx, &schema).await?;
                        assert_eq!(result, serde_json::json!(10.0));
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();
    }
}
