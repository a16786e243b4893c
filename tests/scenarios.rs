use polystore::backend::sql::SqlBackend;
use polystore::backend::{BackendDriver, Direction, KeySelector, Transaction};
use polystore::connection::{Connection, ConnectionOptions};
use polystore::cursor::RelationalCursor;
use polystore::key::{Key, KeyType};
use polystore::keyrange::KeyRange;
use polystore::schema::{IndexSchema, KeyPath, Schema, StoreSchema};

fn native_options() -> ConnectionOptions {
    ConnectionOptions {
        mechanisms: vec!["native-memory".to_string()],
        ..ConnectionOptions::default()
    }
}

fn sql_options() -> ConnectionOptions {
    ConnectionOptions {
        mechanisms: vec!["relational-sql".to_string()],
        ..ConnectionOptions::default()
    }
}

#[tokio::test]
async fn add_collision_leaves_prior_value_unchanged() {
    let schema = Schema::fixed(vec![StoreSchema::new(
        "st",
        Some(KeyPath::Single("id".into())),
        KeyType::Number,
    )]);
    let conn = Connection::open("t", schema, native_options()).await.unwrap();

    conn.put("st", serde_json::json!({"id": 7.0, "v": "a"}), None)
        .await
        .unwrap();
    let err = conn
        .add("st", serde_json::json!({"id": 7.0, "v": "b"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ConstraintError");

    let got = conn.get("st", Key::Number(7.0)).await.unwrap().unwrap();
    assert_eq!(got["v"], "a");
}

#[tokio::test]
async fn clear_counts_across_multiple_stores() {
    let schema = Schema::fixed(vec![
        StoreSchema::new("st", Some(KeyPath::Single("id".into())), KeyType::Number),
        StoreSchema::new("st2", Some(KeyPath::Single("id".into())), KeyType::Number),
        StoreSchema::new("st3", Some(KeyPath::Single("id".into())), KeyType::Number),
    ]);
    let conn = Connection::open("t", schema, native_options()).await.unwrap();

    for store in ["st", "st2", "st3"] {
        conn.put(store, serde_json::json!({"id": 1.0}), None).await.unwrap();
    }

    assert_eq!(conn.clear(&["st"]).await.unwrap(), 1);
    assert_eq!(conn.clear(&["st2", "st3"]).await.unwrap(), 2);

    for store in ["st", "st2", "st3"] {
        conn.put(store, serde_json::json!({"id": 2.0}), None).await.unwrap();
    }
    assert_eq!(conn.clear(&[]).await.unwrap(), 3);

    for store in ["st", "st2", "st3"] {
        assert!(conn.get(store, Key::Number(1.0)).await.unwrap().is_none());
        assert!(conn.get(store, Key::Number(2.0)).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn unique_index_iteration_suppresses_duplicate_effective_keys() {
    // The SQL grammar has no `nextUnique` spelling, so this property is
    // exercised directly against the cursor state machine rather than
    // through `Connection::query`.
    let store = StoreSchema::new("letters", Some(KeyPath::Single("id".into())), KeyType::Number).with_index(
        IndexSchema {
            name: "k".into(),
            key_path: KeyPath::Single("k".into()),
            key_type: KeyType::String,
            unique: false,
            multi_entry: false,
        },
    );
    let schema = Schema::fixed(vec![store.clone()]);
    let backend = SqlBackend::in_memory();
    backend.connect("t", &schema).await.unwrap();

    backend
        .do_sql_transaction(|tx| {
            Box::pin(async move {
                tx.put("letters", serde_json::json!({"id": 1.0, "k": "a"}), None).await?;
                tx.put("letters", serde_json::json!({"id": 2.0, "k": "a"}), None).await?;
                tx.put("letters", serde_json::json!({"id": 3.0, "k": "b"}), None).await?;
                Ok(())
            })
        })
        .await
        .unwrap();

    backend
        .do_sql_transaction(move |tx| {
            let store = store.clone();
            Box::pin(async move {
                let mut cursor = RelationalCursor::open(
                    tx,
                    store.clone(),
                    store.index("k").cloned(),
                    Direction::NextUnique,
                    KeyRange::unbounded(),
                )
                .await?;

                // Duplicate effective-key suppression is the cursor's own
                // job under `NextUnique` — no consumer-side tracking needed.
                let mut seen = Vec::new();
                while cursor.has_cursor() {
                    if let Key::Text(s) = cursor.get_index_key().unwrap() {
                        seen.push(s);
                    }
                    cursor.advance(1)?;
                }
                assert_eq!(seen, vec!["a", "b"]);
                Ok(())
            })
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn range_scan_yields_ordered_subset() {
    let store = StoreSchema::new("letters", Some(KeyPath::Single("k".into())), KeyType::String);
    let schema = Schema::fixed(vec![store]);
    let conn = Connection::open("t", schema, native_options()).await.unwrap();

    for k in ["l", "m", "p", "t", "u"] {
        conn.put("letters", serde_json::json!({"k": k}), None).await.unwrap();
    }

    let range = KeyRange::bound(Key::Text("m".into()), Key::Text("t".into()), false, true);
    let rows = conn.list("letters", KeySelector::Range(range)).await.unwrap();
    let keys: Vec<&str> = rows.iter().map(|r| r["k"].as_str().unwrap()).collect();
    assert_eq!(keys, vec!["m", "p"]);
}

#[tokio::test]
async fn sum_aggregate_agrees_across_backends() {
    let schema = || {
        Schema::fixed(vec![StoreSchema::new(
            "orders",
            Some(KeyPath::Single("id".into())),
            KeyType::Number,
        )])
    };

    for options in [native_options(), sql_options()] {
        let conn = Connection::open("t", schema(), options).await.unwrap();
        for (id, price) in [(1.0, 1.0), (2.0, 2.0), (3.0, 3.0), (4.0, 4.0)] {
            conn.put("orders", serde_json::json!({"id": id, "price": price}), None)
                .await
                .unwrap();
        }
        let result = conn.query("SUM(price) FROM \"orders\"").await.unwrap();
        assert_eq!(result, serde_json::json!(10.0));
    }
}

#[tokio::test]
async fn queue_preserves_strict_fifo_ordering() {
    let schema = Schema::fixed(vec![StoreSchema::new(
        "log",
        Some(KeyPath::Single("id".into())),
        KeyType::Number,
    )]);
    let conn = Connection::open("t", schema, native_options()).await.unwrap();

    conn.put("log", serde_json::json!({"id": 1.0}), None).await.unwrap();
    conn.put("log", serde_json::json!({"id": 2.0}), None).await.unwrap();
    conn.put("log", serde_json::json!({"id": 3.0}), None).await.unwrap();

    let rows = conn.list("log", KeySelector::Range(KeyRange::unbounded())).await.unwrap();
    let ids: Vec<f64> = rows.iter().map(|r| r["id"].as_f64().unwrap()).collect();
    assert_eq!(ids, vec![1.0, 2.0, 3.0]);
}
