//! Query IR (spec §3's `{ storeName, index?, direction, wheres[], map?,
//! reduce?, limit?, offset? }`). Either built directly or produced by
//! `query::parser` from the restricted SQL grammar.

use crate::backend::Direction;
use crate::error::{Error, Result};
use crate::keyrange::Where;
use crate::schema::Schema;

/// What a `SELECT` verb's `args` projects a record down to.
#[derive(Debug, Clone, PartialEq)]
pub enum MapSpec {
    /// `SELECT *` — the whole record, unchanged.
    Whole,
    Field(String),
    Fields(Vec<String>),
}

/// The aggregate a non-`SELECT` verb lowers to, carrying the field its
/// `args` named (ignored for `Count`, which accepts `*` or a field
/// interchangeably).
#[derive(Debug, Clone, PartialEq)]
pub enum Reduce {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
    Concat(String),
}

#[derive(Debug, Clone)]
pub struct QueryIr {
    pub store_name: String,
    pub index: Option<String>,
    pub direction: Direction,
    pub wheres: Vec<Where>,
    pub map: Option<MapSpec>,
    pub reduce: Option<Reduce>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryIr {
    pub fn new(store_name: impl Into<String>) -> Self {
        QueryIr {
            store_name: store_name.into(),
            index: None,
            direction: Direction::Next,
            wheres: Vec::new(),
            map: None,
            reduce: None,
            limit: None,
            offset: None,
        }
    }

    /// Checks the IR against a schema: `storeName` exists, `index` (if
    /// any) is declared on that store, and no field appears in more than
    /// one `where`.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        let store = schema
            .get_store(&self.store_name)
            .ok_or_else(|| Error::argument(format!("unknown store '{}'", self.store_name)))?;

        if let Some(index_name) = &self.index {
            if store.index(index_name).is_none() {
                return Err(Error::argument(format!(
                    "'{index_name}' is not a declared index of store '{}'",
                    self.store_name
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for w in &self.wheres {
            if !seen.insert(w.field.clone()) {
                return Err(Error::sql_parse(
                    format!("duplicate where clause on field '{}'", w.field),
                    w.field.clone(),
                ));
            }
        }

        Ok(())
    }
}
