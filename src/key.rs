//! Primary-key / index-key value model (spec §3, component 4.A/4.B).
//!
//! `Key` is the union of the supported primary-key types. The total order is
//! numbers < dates < strings < tuples, with tuples compared lexicographically
//! and element-wise type-respecting comparison inside a tuple.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Number(f64),
    Date(DateTime<Utc>),
    Text(String),
    Tuple(Vec<Key>),
}

/// The declared type of a store's primary key or an index's key, independent
/// of any particular value (spec §3 "primary-key type").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Number,
    String,
    Date,
    Tuple,
}

impl Key {
    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::Date(_) => 1,
            Key::Text(_) => 2,
            Key::Tuple(_) => 3,
        }
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            Key::Number(_) => KeyType::Number,
            Key::Date(_) => KeyType::Date,
            Key::Text(_) => KeyType::String,
            Key::Tuple(_) => KeyType::Tuple,
        }
    }

    /// Total order over the union of supported key types, per spec §3.
    pub fn cmp(a: &Key, b: &Key) -> Ordering {
        match (a, b) {
            (Key::Number(x), Key::Number(y)) => {
                x.partial_cmp(y).unwrap_or(Ordering::Equal)
            }
            (Key::Date(x), Key::Date(y)) => x.cmp(y),
            (Key::Text(x), Key::Text(y)) => x.cmp(y),
            (Key::Tuple(x), Key::Tuple(y)) => {
                for (xi, yi) in x.iter().zip(y.iter()) {
                    let ord = Key::cmp(xi, yi);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                x.len().cmp(&y.len())
            }
            _ => a.rank().cmp(&b.rank()),
        }
    }
}

impl Eq for Key {}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        Key::cmp(self, other)
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_before_dates_before_strings_before_tuples() {
        let n = Key::Number(1e9);
        let d = Key::Date(Utc::now());
        let s = Key::Text("a".into());
        let t = Key::Tuple(vec![Key::Number(0.0)]);
        assert_eq!(Key::cmp(&n, &d), Ordering::Less);
        assert_eq!(Key::cmp(&d, &s), Ordering::Less);
        assert_eq!(Key::cmp(&s, &t), Ordering::Less);
    }

    #[test]
    fn tuple_lexicographic_order() {
        let a = Key::Tuple(vec![Key::Number(1.0), Key::Text("a".into())]);
        let b = Key::Tuple(vec![Key::Number(1.0), Key::Text("b".into())]);
        assert_eq!(Key::cmp(&a, &b), Ordering::Less);
    }

    #[test]
    fn string_range_scan_order() {
        let mut keys: Vec<Key> = ["m", "p", "l", "u", "t"]
            .iter()
            .map(|s| Key::Text(s.to_string()))
            .collect();
        keys.sort();
        let ordered: Vec<&str> = keys
            .iter()
            .map(|k| match k {
                Key::Text(s) => s.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ordered, vec!["l", "m", "p", "t", "u"]);
    }
}
