//! Schema model (component 4.A).
//!
//! `Schema` is the tagged variant from the design notes: `Fixed` schemas
//! reject `add_store` at the type level (the method simply isn't on that
//! variant's happy path — see `Schema::add_store`, which still returns the
//! spec's `ConstraintError` for the one case the type system can't prevent:
//! an `Editable` schema that the backend refuses to extend).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::key::KeyType;

/// A dotted path (`"a.b.c"`) or tuple of such paths designating where, inside
/// a record, a key value lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    Single(String),
    Tuple(Vec<String>),
}

impl KeyPath {
    /// Normalizes a single string or array-of-strings into a `KeyPath`. A
    /// tuple key path implies a tuple key type (spec §4.A).
    pub fn normalize(paths: &[&str]) -> Self {
        match paths {
            [single] => KeyPath::Single(single.to_string()),
            many => KeyPath::Tuple(many.iter().map(|s| s.to_string()).collect()),
        }
    }

    pub fn implied_key_type(&self) -> Option<KeyType> {
        match self {
            KeyPath::Tuple(_) => Some(KeyType::Tuple),
            KeyPath::Single(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub key_path: KeyPath,
    #[serde(rename = "type")]
    pub key_type: KeyType,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub multi_entry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key_path: Option<KeyPath>,
    pub key_type: KeyType,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}

impl StoreSchema {
    pub fn new(name: impl Into<String>, key_path: Option<KeyPath>, key_type: KeyType) -> Self {
        StoreSchema {
            name: name.into(),
            key_path,
            key_type,
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index(&self, field: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == field)
    }

    /// Two store schemas are "similar" iff they agree on every field;
    /// similarity governs whether a schema change requires a version
    /// upgrade (spec §3).
    pub fn similar(&self, other: &StoreSchema) -> bool {
        self.name == other.name
            && self.key_path == other.key_path
            && self.key_type == other.key_type
            && self.indexes.len() == other.indexes.len()
            && self
                .indexes
                .iter()
                .zip(other.indexes.iter())
                .all(|(a, b)| a == b)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemaDoc {
    stores: Vec<StoreSchema>,
    #[serde(default)]
    auto_schema: bool,
    #[serde(default)]
    auto_version: bool,
}

/// Database schema: a set of store schemas plus the `autoSchema` flag. The
/// `Fixed`/`Editable` split makes `add_store` on a non-editable schema a
/// compile-time non-option rather than a runtime check wherever the caller's
/// schema value is statically known.
#[derive(Debug, Clone)]
pub enum Schema {
    Fixed(BTreeMap<String, StoreSchema>),
    Editable(BTreeMap<String, StoreSchema>),
}

impl Schema {
    pub fn fixed(stores: impl IntoIterator<Item = StoreSchema>) -> Self {
        Schema::Fixed(stores.into_iter().map(|s| (s.name.clone(), s)).collect())
    }

    pub fn editable(stores: impl IntoIterator<Item = StoreSchema>) -> Self {
        Schema::Editable(stores.into_iter().map(|s| (s.name.clone(), s)).collect())
    }

    pub fn auto_schema(&self) -> bool {
        matches!(self, Schema::Editable(_))
    }

    fn stores(&self) -> &BTreeMap<String, StoreSchema> {
        match self {
            Schema::Fixed(s) | Schema::Editable(s) => s,
        }
    }

    fn stores_mut(&mut self) -> &mut BTreeMap<String, StoreSchema> {
        match self {
            Schema::Fixed(s) | Schema::Editable(s) => s,
        }
    }

    pub fn get_store(&self, name: &str) -> Option<&StoreSchema> {
        self.stores().get(name)
    }

    pub fn store_names(&self) -> impl Iterator<Item = &str> {
        self.stores().keys().map(|s| s.as_str())
    }

    pub fn has_index(&self, store_name: &str, field: &str) -> bool {
        self.get_store(store_name)
            .map(|s| s.index(field).is_some())
            .unwrap_or(false)
    }

    /// Adds a store. Only valid on an `Editable` schema; otherwise fails
    /// with `ConstraintError` (spec §4.A).
    pub fn add_store(&mut self, store: StoreSchema) -> Result<()> {
        match self {
            Schema::Fixed(_) => Err(Error::constraint(format!(
                "schema is not auto-schema; cannot add store '{}'",
                store.name
            ))),
            Schema::Editable(stores) => {
                stores.insert(store.name.clone(), store);
                Ok(())
            }
        }
    }

    /// Two database schemas are similar iff every store present in either
    /// schema is similar (or absent) in the other.
    pub fn similar(&self, other: &Schema) -> bool {
        let a = self.stores();
        let b = other.stores();
        if a.len() != b.len() {
            return false;
        }
        a.iter().all(|(name, store)| match b.get(name) {
            Some(other_store) => store.similar(other_store),
            None => false,
        })
    }

    /// Stable-field-order JSON serialization (stores sorted by name via the
    /// underlying `BTreeMap`).
    pub fn to_json(&self) -> Result<String> {
        let doc = SchemaDoc {
            stores: self.stores().values().cloned().collect(),
            auto_schema: self.auto_schema(),
            auto_version: false,
        };
        serde_json::to_string(&doc).map_err(|e| Error::Internal(e.into()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let doc: SchemaDoc =
            serde_json::from_str(text).map_err(|e| Error::argument(e.to_string()))?;
        Ok(if doc.auto_schema {
            Schema::editable(doc.stores)
        } else {
            Schema::fixed(doc.stores)
        })
    }

    /// Applies a version-change delta: any store in `other` that isn't
    /// `similar` to the current one is created or replaced. Used by the
    /// connection manager's schema-reconciliation path (spec §4.G).
    pub(crate) fn merge_from(&mut self, other: &Schema) {
        for (name, store) in other.stores() {
            let needs_update = self
                .get_store(name)
                .map(|existing| !existing.similar(store))
                .unwrap_or(true);
            if needs_update {
                self.stores_mut().insert(name.clone(), store.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoreSchema {
        StoreSchema::new("st", Some(KeyPath::Single("id".into())), KeyType::Number).with_index(
            IndexSchema {
                name: "k".into(),
                key_path: KeyPath::Single("k".into()),
                key_type: KeyType::String,
                unique: false,
                multi_entry: false,
            },
        )
    }

    #[test]
    fn add_store_fails_on_fixed_schema() {
        let mut schema = Schema::fixed(vec![]);
        let err = schema.add_store(sample()).unwrap_err();
        assert_eq!(err.kind(), "ConstraintError");
    }

    #[test]
    fn add_store_succeeds_on_editable_schema() {
        let mut schema = Schema::editable(vec![]);
        schema.add_store(sample()).unwrap();
        assert!(schema.get_store("st").is_some());
    }

    #[test]
    fn similar_schemas_round_trip_json() {
        let schema = Schema::editable(vec![sample()]);
        let json = schema.to_json().unwrap();
        let parsed = Schema::from_json(&json).unwrap();
        assert!(schema.similar(&parsed));
    }

    #[test]
    fn has_index_reflects_declared_indexes() {
        let schema = Schema::fixed(vec![sample()]);
        assert!(schema.has_index("st", "k"));
        assert!(!schema.has_index("st", "missing"));
    }
}
