//! Maps store/index schemas onto flat SQL table/column names.
//!
//! Each store becomes one table: one column per primary-key path component
//! (or a single `_key` column for out-of-line keys), one `_value` TEXT
//! column holding the full JSON record, and one column (or set of columns,
//! for a tuple index) per declared index, kept in sync at write time.
//! Columns are declared with no type affinity (SQLite's default "BLOB"
//! affinity) so values round-trip through sqlx without numeric/text
//! coercion — the same reasoning the teacher applies by storing
//! `arrow_schema_json` verbatim rather than decomposing it.

use crate::keyrange::quote_ident;
use crate::schema::{IndexSchema, KeyPath, StoreSchema};

pub const VALUE_COLUMN: &str = "_value";
pub const OUT_OF_LINE_KEY_COLUMN: &str = "_key";

fn sanitize_path(path: &str) -> String {
    path.replace('.', "__")
}

/// Column name(s) backing a store's primary key, in declared order.
pub fn primary_key_columns(store: &StoreSchema) -> Vec<String> {
    match &store.key_path {
        None => vec![OUT_OF_LINE_KEY_COLUMN.to_string()],
        Some(KeyPath::Single(path)) => vec![sanitize_path(path)],
        Some(KeyPath::Tuple(paths)) => paths.iter().map(|p| sanitize_path(p)).collect(),
    }
}

/// Column name(s) backing an index's key, in declared order.
pub fn index_columns(index: &IndexSchema) -> Vec<String> {
    let prefix = format!("idx__{}", index.name);
    match &index.key_path {
        KeyPath::Single(_) => vec![prefix],
        KeyPath::Tuple(paths) => (0..paths.len()).map(|i| format!("{prefix}__{i}")).collect(),
    }
}

pub fn table_name(store: &str) -> String {
    quote_ident(store)
}

/// DDL for a fresh store table: key columns, `_value`, and one column set
/// per declared index, with a composite primary key over the key columns.
pub fn create_table_sql(store: &StoreSchema) -> String {
    let mut cols: Vec<String> = primary_key_columns(store)
        .into_iter()
        .map(|c| quote_ident(&c))
        .collect();
    let pk_cols = cols.clone();
    cols.push(format!("{} TEXT", quote_ident(VALUE_COLUMN)));
    for index in &store.indexes {
        for col in index_columns(index) {
            cols.push(quote_ident(&col));
        }
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
        table_name(&store.name),
        cols.join(", "),
        pk_cols.join(", ")
    )
}

/// DDL to add the columns for a newly-declared index to an existing table.
pub fn add_index_columns_sql(store_name: &str, index: &IndexSchema) -> Vec<String> {
    index_columns(index)
        .into_iter()
        .map(|col| {
            format!(
                "ALTER TABLE {} ADD COLUMN {}",
                table_name(store_name),
                quote_ident(&col)
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyType;

    #[test]
    fn primary_key_columns_for_single_path() {
        let store = StoreSchema::new("st", Some(KeyPath::Single("id".into())), KeyType::Number);
        assert_eq!(primary_key_columns(&store), vec!["id".to_string()]);
    }

    #[test]
    fn primary_key_columns_for_out_of_line_key() {
        let store = StoreSchema::new("st", None, KeyType::Number);
        assert_eq!(primary_key_columns(&store), vec!["_key".to_string()]);
    }

    #[test]
    fn index_columns_for_tuple_index() {
        let index = IndexSchema {
            name: "composite".into(),
            key_path: KeyPath::Tuple(vec!["a".into(), "b".into()]),
            key_type: KeyType::Tuple,
            unique: false,
            multi_entry: false,
        };
        assert_eq!(
            index_columns(&index),
            vec!["idx__composite__0".to_string(), "idx__composite__1".to_string()]
        );
    }
}
