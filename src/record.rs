//! Record ⇄ key extraction helpers shared by the relational backend and the
//! cursor state machine.

use chrono::{DateTime, Utc};
use serde_json::Value as Record;

use crate::error::{Error, Result};
use crate::key::{Key, KeyType};
use crate::schema::KeyPath;

/// Resolves a dotted path (`"a.b.c"`) against a JSON record.
pub fn get_path<'a>(record: &'a Record, path: &str) -> Option<&'a Record> {
    path.split('.')
        .try_fold(record, |value, segment| value.get(segment))
}

fn json_leaf_to_key(value: &Record, key_type: KeyType, path: &str) -> Result<Key> {
    match key_type {
        KeyType::Number => value
            .as_f64()
            .map(Key::Number)
            .ok_or_else(|| Error::argument(format!("field '{path}' is not a number"))),
        KeyType::String => value
            .as_str()
            .map(|s| Key::Text(s.to_string()))
            .ok_or_else(|| Error::argument(format!("field '{path}' is not a string"))),
        KeyType::Date => value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| Key::Date(dt.with_timezone(&Utc)))
            .ok_or_else(|| Error::argument(format!("field '{path}' is not an RFC3339 date"))),
        KeyType::Tuple => infer_leaf_key(value),
    }
}

/// Tuple *component* types aren't separately declared by the schema model
/// (spec §3 enumerates `tuple-of-those` as one type, not per-component
/// types), so a component's variant is inferred from its JSON shape: numbers
/// become `Key::Number`, RFC3339-parseable strings become `Key::Date`,
/// everything else becomes `Key::Text`.
pub(crate) fn infer_leaf_key(value: &Record) -> Result<Key> {
    if let Some(n) = value.as_f64() {
        return Ok(Key::Number(n));
    }
    if let Some(s) = value.as_str() {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Key::Date(dt.with_timezone(&Utc)));
        }
        return Ok(Key::Text(s.to_string()));
    }
    Err(Error::argument("key component is neither number nor string"))
}

/// Extracts the key designated by `key_path` out of `record`.
pub fn extract_key(record: &Record, key_path: &KeyPath, key_type: KeyType) -> Result<Key> {
    match key_path {
        KeyPath::Single(path) => {
            let value = get_path(record, path)
                .ok_or_else(|| Error::argument(format!("record missing key path '{path}'")))?;
            json_leaf_to_key(value, key_type, path)
        }
        KeyPath::Tuple(paths) => {
            let mut components = Vec::with_capacity(paths.len());
            for path in paths {
                let value = get_path(record, path).ok_or_else(|| {
                    Error::argument(format!("record missing key path '{path}'"))
                })?;
                components.push(infer_leaf_key(value)?);
            }
            Ok(Key::Tuple(components))
        }
    }
}

/// Renders a `Key` back into the equivalent JSON scalar, used when decoding
/// persisted rows back into record-shaped values.
pub fn key_to_json(key: &Key) -> Record {
    match key {
        Key::Number(n) => serde_json::json!(n),
        Key::Date(d) => serde_json::json!(d.to_rfc3339()),
        Key::Text(s) => serde_json::json!(s),
        Key::Tuple(components) => Record::Array(components.iter().map(key_to_json).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_nested_single_path() {
        let record = serde_json::json!({"user": {"id": 7}});
        let key = extract_key(
            &record,
            &KeyPath::Single("user.id".into()),
            KeyType::Number,
        )
        .unwrap();
        assert_eq!(key, Key::Number(7.0));
    }

    #[test]
    fn extracts_tuple_path() {
        let record = serde_json::json!({"a": 1, "b": "x"});
        let key = extract_key(
            &record,
            &KeyPath::Tuple(vec!["a".into(), "b".into()]),
            KeyType::Tuple,
        )
        .unwrap();
        assert_eq!(key, Key::Tuple(vec![Key::Number(1.0), Key::Text("x".into())]));
    }

    #[test]
    fn missing_path_is_argument_error() {
        let record = serde_json::json!({});
        let err = extract_key(&record, &KeyPath::Single("missing".into()), KeyType::Number)
            .unwrap_err();
        assert_eq!(err.kind(), "ArgumentException");
    }
}
