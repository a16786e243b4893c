//! Key-range model (component 4.B).

use crate::key::Key;

/// A half-open/closed range over `Key` values. Either bound may be absent
/// (unbounded).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyRange {
    pub lower: Option<Key>,
    pub upper: Option<Key>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    pub fn bound(lower: Key, upper: Key, lower_open: bool, upper_open: bool) -> Self {
        KeyRange {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        }
    }

    pub fn lower_bound(lower: Key, open: bool) -> Self {
        KeyRange {
            lower: Some(lower),
            upper: None,
            lower_open: open,
            upper_open: false,
        }
    }

    pub fn upper_bound(upper: Key, open: bool) -> Self {
        KeyRange {
            lower: None,
            upper: Some(upper),
            lower_open: false,
            upper_open: open,
        }
    }

    pub fn only(value: Key) -> Self {
        KeyRange {
            lower: Some(value.clone()),
            upper: Some(value),
            lower_open: false,
            upper_open: false,
        }
    }

    pub fn unbounded() -> Self {
        KeyRange::default()
    }

    /// Whether `key` falls within this range.
    pub fn contains(&self, key: &Key) -> bool {
        if let Some(lower) = &self.lower {
            let ord = Key::cmp(key, lower);
            if ord == std::cmp::Ordering::Less
                || (self.lower_open && ord == std::cmp::Ordering::Equal)
            {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            let ord = Key::cmp(key, upper);
            if ord == std::cmp::Ordering::Greater
                || (self.upper_open && ord == std::cmp::Ordering::Equal)
            {
                return false;
            }
        }
        true
    }

    /// Tighten the lower bound to `key`, choosing open/closed per the
    /// iteration direction (used by the cursor's `restart`, spec §4.D).
    pub fn with_tightened_lower(&self, key: Key, open: bool) -> KeyRange {
        KeyRange {
            lower: Some(key),
            upper: self.upper.clone(),
            lower_open: open,
            upper_open: self.upper_open,
        }
    }

    pub fn with_tightened_upper(&self, key: Key, open: bool) -> KeyRange {
        KeyRange {
            lower: self.lower.clone(),
            upper: Some(key),
            lower_open: self.lower_open,
            upper_open: open,
        }
    }
}

/// `(field, lower, upper, lowerOpen, upperOpen)` — a single-field range
/// predicate carried in the query IR (spec §3 "Where clause").
#[derive(Debug, Clone, PartialEq)]
pub struct Where {
    pub field: String,
    pub range: KeyRange,
}

impl Where {
    pub fn new(field: impl Into<String>, range: KeyRange) -> Self {
        Where {
            field: field.into(),
            range,
        }
    }
}

/// SQL fragment produced by projecting a key or range onto a column.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<Key>,
}

/// Quotes a SQL identifier using the relational backend's quoting rule
/// (double quotes, doubled internally — the SQLite/ANSI convention).
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl KeyRange {
    /// Projects this range to a `WHERE` fragment against `column`.
    ///
    /// A tuple-valued range projects to a conjunction over `column__0`,
    /// `column__1`, ... component columns, matching how tuple keys are
    /// stored by the relational backend (see `cursor`).
    pub fn to_sql_where(&self, column: &str) -> Option<SqlFragment> {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if let Some(lower) = &self.lower {
            project_bound(column, lower, self.lower_open, ">", &mut clauses, &mut params);
        }
        if let Some(upper) = &self.upper {
            project_bound(column, upper, self.upper_open, "<", &mut clauses, &mut params);
        }

        if clauses.is_empty() {
            None
        } else {
            Some(SqlFragment {
                sql: clauses.join(" AND "),
                params,
            })
        }
    }
}

fn project_bound(
    column: &str,
    key: &Key,
    open: bool,
    direction: &str,
    clauses: &mut Vec<String>,
    params: &mut Vec<Key>,
) {
    match key {
        Key::Tuple(components) => {
            for (i, component) in components.iter().enumerate() {
                let col = quote_ident(&format!("{column}__{i}"));
                let op = format!("{direction}{}", if open { "" } else { "=" });
                clauses.push(format!("{col} {op} ?"));
                params.push(component.clone());
            }
        }
        other => {
            let col = quote_ident(column);
            let op = format!("{direction}{}", if open { "" } else { "=" });
            clauses.push(format!("{col} {op} ?"));
            params.push(other.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_scan_contains_half_open() {
        let range = KeyRange::bound(
            Key::Text("m".into()),
            Key::Text("t".into()),
            false,
            true,
        );
        let keys = ["l", "m", "p", "t", "u"].map(|s| Key::Text(s.into()));
        let matched: Vec<&str> = keys
            .iter()
            .filter(|k| range.contains(k))
            .map(|k| match k {
                Key::Text(s) => s.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(matched, vec!["m", "p"]);
    }

    #[test]
    fn to_sql_where_projects_both_bounds() {
        let range = KeyRange::bound(Key::Number(1.0), Key::Number(4.0), false, true);
        let frag = range.to_sql_where("price").unwrap();
        assert_eq!(frag.sql, "\"price\" >= ? AND \"price\" < ?");
        assert_eq!(frag.params.len(), 2);
    }

    #[test]
    fn only_produces_closed_singleton_range() {
        let range = KeyRange::only(Key::Number(7.0));
        assert!(range.contains(&Key::Number(7.0)));
        assert!(!range.contains(&Key::Number(7.1)));
    }
}
