//! Relational cursor state machine (component 4.D).
//!
//! Mirrors the positioned-iterator shape without a dedicated teacher
//! analogue; grounded in the cursor/pagination pattern from
//! `datafetch::native` (materialize once, walk a `Vec` by index) combined
//! with the SQL projection conventions of `backend::sql`/`backend::layout`.
//! The result set is materialized once at `open`/`restart` time and walked
//! by position; nothing here issues SQL outside those two calls.

use std::cmp::Ordering;

use sqlx::Row;

use crate::backend::layout::{self, VALUE_COLUMN};
use crate::backend::sql::{decode_inferred_cell, decode_key_cell, decode_primary_key, SqlTransaction};
use crate::backend::{Direction, KeySelector, Transaction};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::keyrange::{quote_ident, KeyRange};
use crate::schema::{IndexSchema, KeyPath, StoreSchema};

#[derive(Debug, Clone)]
struct MaterializedRow {
    primary_key: Key,
    index_key: Option<Key>,
    value: serde_json::Value,
}

impl MaterializedRow {
    fn effective_key(&self) -> &Key {
        self.index_key.as_ref().unwrap_or(&self.primary_key)
    }
}

/// A positioned, seekable iterator over a materialized SQL result set.
/// Owns no connection of its own — `open`/`restart`/`update`/`clear` all
/// take the owning transaction by reference, matching the "cursor is
/// bound by reference to a live backend transaction" ownership rule.
pub struct RelationalCursor {
    store: StoreSchema,
    index: Option<IndexSchema>,
    direction: Direction,
    range: KeyRange,
    rows: Vec<MaterializedRow>,
    position: usize,
}

impl RelationalCursor {
    /// Issues the cursor's SELECT, materializes every matching row in
    /// cursor order, and returns a cursor positioned at 0.
    pub async fn open(
        tx: &mut SqlTransaction,
        store: StoreSchema,
        index: Option<IndexSchema>,
        direction: Direction,
        range: KeyRange,
    ) -> Result<Self> {
        let rows = Self::materialize(tx, &store, &index, direction, &range).await?;
        Ok(RelationalCursor {
            store,
            index,
            direction,
            range,
            rows,
            position: 0,
        })
    }

    async fn materialize(
        tx: &mut SqlTransaction,
        store: &StoreSchema,
        index: &Option<IndexSchema>,
        direction: Direction,
        range: &KeyRange,
    ) -> Result<Vec<MaterializedRow>> {
        let pk_cols = layout::primary_key_columns(store);
        let order_cols = match index {
            Some(idx) => layout::index_columns(idx),
            None => pk_cols.clone(),
        };

        let mut select_cols: Vec<String> = pk_cols.iter().map(|c| quote_ident(c)).collect();
        if index.is_some() {
            select_cols.extend(order_cols.iter().map(|c| quote_ident(c)));
        }
        select_cols.push(quote_ident(VALUE_COLUMN));

        let order_dir = if direction.is_reverse() { "DESC" } else { "ASC" };
        let mut order_parts: Vec<String> = order_cols
            .iter()
            .map(|c| format!("{} {}", quote_ident(c), order_dir))
            .collect();
        if index.is_some() {
            order_parts.extend(pk_cols.iter().map(|c| format!("{} {}", quote_ident(c), order_dir)));
        }

        // A single-field range projects straight to SQL; tuple/composite
        // ranges are filtered in memory below after decode instead, since
        // the materialized set is small enough to hold entirely in the
        // cursor already.
        let (where_sql, params) = if order_cols.len() == 1 {
            match range.to_sql_where(&order_cols[0]) {
                Some(frag) => (Some(frag.sql), frag.params),
                None => (None, vec![]),
            }
        } else {
            (None, vec![])
        };

        let sql = match &where_sql {
            Some(w) => format!(
                "SELECT {} FROM {} WHERE {} ORDER BY {}",
                select_cols.join(", "),
                layout::table_name(&store.name),
                w,
                order_parts.join(", ")
            ),
            None => format!(
                "SELECT {} FROM {} ORDER BY {}",
                select_cols.join(", "),
                layout::table_name(&store.name),
                order_parts.join(", ")
            ),
        };

        let mut q = sqlx::query(&sql);
        for key in &params {
            q = crate::backend::sql::bind_key(q, key);
        }
        let sql_rows = q.fetch_all(&mut *tx.conn).await?;

        let mut out = Vec::with_capacity(sql_rows.len());
        for row in &sql_rows {
            let primary_key = decode_primary_key(row, store)?;

            let index_key = match index {
                None => None,
                Some(idx) => {
                    let base = pk_cols.len();
                    Some(match &idx.key_path {
                        KeyPath::Single(_) => decode_key_cell(row, base, idx.key_type)?,
                        KeyPath::Tuple(paths) => {
                            let mut components = Vec::with_capacity(paths.len());
                            for i in 0..paths.len() {
                                components.push(decode_inferred_cell(row, base + i)?);
                            }
                            Key::Tuple(components)
                        }
                    })
                }
            };

            let value_col_idx = pk_cols.len() + order_cols.len() * (index.is_some() as usize);
            let text: String = row.try_get(value_col_idx)?;
            let value: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| Error::Internal(e.into()))?;

            out.push(MaterializedRow {
                primary_key,
                index_key,
                value,
            });
        }

        out.retain(|row| range.contains(row.effective_key()));

        if direction.is_unique() {
            // Rows are already ordered by effective key (then primary key)
            // in the cursor's direction of travel, so duplicate effective
            // keys are always adjacent here — keep the first of each run,
            // matching spec property #3 ("duplicates suppressed iff d is
            // nextUnique/prevUnique").
            let mut deduped: Vec<MaterializedRow> = Vec::with_capacity(out.len());
            for row in out {
                let is_dup = deduped
                    .last()
                    .map(|prev: &MaterializedRow| prev.effective_key() == row.effective_key())
                    .unwrap_or(false);
                if !is_dup {
                    deduped.push(row);
                }
            }
            out = deduped;
        }

        Ok(out)
    }

    /// Orders `a` relative to `b` as "progress in the cursor's direction of
    /// travel": ascending for `next*`, descending for `prev*`.
    fn directed_cmp(&self, a: &Key, b: &Key) -> Ordering {
        let natural = Key::cmp(a, b);
        if self.direction.is_reverse() {
            natural.reverse()
        } else {
            natural
        }
    }

    pub fn has_cursor(&self) -> bool {
        self.position < self.rows.len()
    }

    fn current(&self) -> Option<&MaterializedRow> {
        self.rows.get(self.position)
    }

    pub fn get_primary_key(&self) -> Option<Key> {
        self.current().map(|r| r.primary_key.clone())
    }

    pub fn get_index_key(&self) -> Option<Key> {
        self.current().and_then(|r| r.index_key.clone())
    }

    pub fn get_value(&self) -> Option<serde_json::Value> {
        self.current().map(|r| r.value.clone())
    }

    /// Advances the position by `n` (`n >= 1`).
    pub fn advance(&mut self, n: u64) -> Result<()> {
        if n == 0 {
            return Err(Error::argument("advance(n) requires n >= 1"));
        }
        self.position = self.position.saturating_add(n as usize);
        Ok(())
    }

    pub fn continue_effective_key(&mut self, target: Key) -> Result<()> {
        if !self.has_cursor() {
            return Err(Error::invalid_state("cursor is not active"));
        }
        let current = self.current().unwrap().effective_key().clone();
        if self.directed_cmp(&target, &current) == Ordering::Less {
            return Err(Error::invalid_operation(
                "continueEffectiveKey target is behind the cursor's current position",
            ));
        }
        while self.position < self.rows.len() {
            let key = self.rows[self.position].effective_key();
            if self.directed_cmp(&target, key) == Ordering::Greater {
                self.position += 1;
            } else {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Same as `continue_effective_key`, but additionally stops the moment
    /// the effective (index) key changes from the starting position's
    /// value, even if `target` has not been reached — primary-key
    /// continuation is defined only within one index-key equivalence
    /// class. The chosen tie-break (an open question in the original
    /// source): when the class boundary is hit before `target`, the
    /// cursor is exhausted rather than left on the differing row.
    pub fn continue_primary_key(&mut self, target: Key) -> Result<()> {
        if !self.has_cursor() {
            return Err(Error::invalid_state("cursor is not active"));
        }
        let start_effective = self.current().unwrap().effective_key().clone();
        let current_primary = self.current().unwrap().primary_key.clone();
        if self.directed_cmp(&target, &current_primary) == Ordering::Less {
            return Err(Error::invalid_operation(
                "continuePrimaryKey target is behind the cursor's current position",
            ));
        }

        loop {
            let next_pos = self.position + 1;
            if next_pos >= self.rows.len() {
                self.position = self.rows.len();
                return Ok(());
            }
            let next_effective = self.rows[next_pos].effective_key();
            if Key::cmp(next_effective, &start_effective) != Ordering::Equal {
                self.position = self.rows.len();
                return Ok(());
            }
            self.position = next_pos;
            let primary = &self.rows[self.position].primary_key;
            if self.directed_cmp(&target, primary) != Ordering::Greater {
                return Ok(());
            }
        }
    }

    /// Rewrites the record at the current primary key via an upsert.
    /// Disallowed when inactive, or when this cursor is over a secondary
    /// index (conflict policy for index-scoped writes isn't implemented).
    pub async fn update(&mut self, tx: &mut SqlTransaction, record: serde_json::Value) -> Result<Key> {
        if self.index.is_some() {
            return Err(Error::not_implemented(
                "cursor.update is not implemented for secondary-index cursors",
            ));
        }
        let row = self
            .current()
            .ok_or_else(|| Error::invalid_state("cursor is not active"))?;
        let key = row.primary_key.clone();
        let store_name = self.store.name.clone();
        tx.put(&store_name, record.clone(), Some(key.clone())).await?;
        if let Some(row) = self.rows.get_mut(self.position) {
            row.value = record;
        }
        Ok(key)
    }

    /// Deletes the record at the current primary key, returning rows
    /// affected (0 or 1).
    pub async fn clear(&mut self, tx: &mut SqlTransaction) -> Result<u64> {
        if !self.has_cursor() {
            return Ok(0);
        }
        let key = self.rows[self.position].primary_key.clone();
        let store_name = self.store.name.clone();
        let removed = tx.remove(&store_name, KeySelector::Keys(vec![key])).await?;
        if removed > 0 {
            self.rows.remove(self.position);
        }
        Ok(removed)
    }

    /// Re-issues the cursor's statement with its lower (or upper, for
    /// reverse directions) bound tightened to `effective_key`, then skips
    /// forward past any row whose primary key is still before
    /// `primary_key` in the cursor's direction (or equal to it, when
    /// `exclusive` is set).
    pub async fn restart(
        &mut self,
        tx: &mut SqlTransaction,
        effective_key: Key,
        primary_key: Key,
        exclusive: bool,
    ) -> Result<()> {
        self.range = if self.direction.is_reverse() {
            self.range.with_tightened_upper(effective_key.clone(), false)
        } else {
            self.range.with_tightened_lower(effective_key.clone(), false)
        };

        self.rows = Self::materialize(tx, &self.store, &self.index, self.direction, &self.range).await?;
        self.position = 0;

        while self.position < self.rows.len() {
            let row = &self.rows[self.position];
            if Key::cmp(row.effective_key(), &effective_key) != Ordering::Equal {
                break;
            }
            let cmp = self.directed_cmp(&primary_key, &row.primary_key);
            let should_skip = cmp == Ordering::Greater || (exclusive && cmp == Ordering::Equal);
            if should_skip {
                self.position += 1;
            } else {
                break;
            }
        }
        Ok(())
    }
}
