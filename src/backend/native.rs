//! The native in-process exemplar backend: an ordered in-memory store keyed
//! by `Key`, exercising the contract without any external engine. Grounded
//! in the teacher's `storage::FilesystemStorage` — a second, simpler
//! `StorageManager` implementation living beside the primary one, used here
//! the same way: as the lightweight reference driver the test suite runs
//! against.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as Record;
use tokio::sync::{broadcast, Mutex};

use crate::backend::{BackendDriver, KeySelector, Transaction, TransactionJob, TxMode};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::keyrange::KeyRange;
use crate::query::compile_native::{compile_native, execute_native};
use crate::query::QueryIr;
use crate::record::extract_key;
use crate::schema::Schema;

type StoreTable = BTreeMap<Key, Record>;

#[derive(Debug, Default)]
struct Database {
    stores: BTreeMap<String, StoreTable>,
}

/// In-memory `BackendDriver`. One instance owns one database's worth of
/// stores; `connect` seeds empty tables for any store schema not already
/// present.
#[derive(Debug)]
pub struct NativeBackend {
    db: Mutex<Database>,
    schema: Mutex<Option<Schema>>,
    ready: AtomicBool,
    disconnect: broadcast::Sender<()>,
    /// Serializes `do_transaction` calls the way an IndexedDB-like engine
    /// serializes writers against a single store set; readers and writers
    /// share this lock since the in-memory table has no MVCC.
    tx_lock: Arc<Mutex<()>>,
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBackend {
    pub fn new() -> Self {
        let (disconnect, _) = broadcast::channel(8);
        NativeBackend {
            db: Mutex::new(Database::default()),
            schema: Mutex::new(None),
            ready: AtomicBool::new(false),
            disconnect,
            tx_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl BackendDriver for NativeBackend {
    fn backend_id(&self) -> &'static str {
        "native-memory"
    }

    async fn connect(&self, _name: &str, schema: &Schema) -> Result<()> {
        let mut db = self.db.lock().await;
        for name in schema.store_names() {
            db.stores.entry(name.to_string()).or_default();
        }
        *self.schema.lock().await = Some(schema.clone());
        self.ready.store(true, AtomicOrdering::SeqCst);
        tracing::info!(backend = "native-memory", "connection ready");
        Ok(())
    }

    async fn persisted_schema(&self) -> Option<Schema> {
        self.schema.lock().await.clone()
    }

    async fn do_transaction(
        &self,
        _stores: &[String],
        _mode: TxMode,
        job: TransactionJob,
    ) -> Result<()> {
        let _guard = self.tx_lock.lock().await;
        let schema = self
            .schema
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::invalid_state("backend is not connected"))?;

        let mut snapshot = self.db.lock().await.stores.clone();
        let mut tx = NativeTransaction {
            stores: &mut snapshot,
            schema,
        };
        let result = job(&mut tx).await;
        if result.is_ok() {
            self.db.lock().await.stores = snapshot;
        }
        result
    }

    fn is_ready(&self) -> bool {
        self.ready.load(AtomicOrdering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.ready.store(false, AtomicOrdering::SeqCst);
        let _ = self.disconnect.send(());
        Ok(())
    }

    fn subscribe_disconnected(&self) -> broadcast::Receiver<()> {
        self.disconnect.subscribe()
    }
}

struct NativeTransaction<'a> {
    stores: &'a mut BTreeMap<String, StoreTable>,
    schema: Schema,
}

impl<'a> NativeTransaction<'a> {
    fn table_mut(&mut self, name: &str) -> Result<&mut StoreTable> {
        self.stores
            .get_mut(name)
            .ok_or_else(|| Error::argument(format!("unknown store '{name}'")))
    }

    fn table(&self, name: &str) -> Result<&StoreTable> {
        self.stores
            .get(name)
            .ok_or_else(|| Error::argument(format!("unknown store '{name}'")))
    }
}

#[async_trait]
impl<'a> Transaction for NativeTransaction<'a> {
    async fn put(&mut self, store: &str, record: Record, key: Option<Key>) -> Result<Key> {
        let store_schema = self
            .schema
            .get_store(store)
            .ok_or_else(|| Error::argument(format!("unknown store '{store}'")))?
            .clone();
        let resolved = match (&store_schema.key_path, key) {
            (Some(path), _) => extract_key(&record, path, store_schema.key_type)?,
            (None, Some(k)) => k,
            (None, None) => {
                return Err(Error::argument(
                    "store has no key path; an out-of-line key is required",
                ))
            }
        };
        self.table_mut(store)?.insert(resolved.clone(), record);
        Ok(resolved)
    }

    async fn add(&mut self, store: &str, record: Record, key: Option<Key>) -> Result<Key> {
        let store_schema = self
            .schema
            .get_store(store)
            .ok_or_else(|| Error::argument(format!("unknown store '{store}'")))?
            .clone();
        let resolved = match (&store_schema.key_path, &key) {
            (Some(path), _) => extract_key(&record, path, store_schema.key_type)?,
            (None, Some(k)) => k.clone(),
            (None, None) => {
                return Err(Error::argument(
                    "store has no key path; an out-of-line key is required",
                ))
            }
        };
        if self.table(store)?.contains_key(&resolved) {
            return Err(Error::constraint(format!(
                "key already exists in store '{store}'"
            )));
        }
        self.table_mut(store)?.insert(resolved.clone(), record);
        Ok(resolved)
    }

    async fn get(&mut self, store: &str, key: &Key) -> Result<Option<Record>> {
        Ok(self.table(store)?.get(key).cloned())
    }

    async fn list(&mut self, store: &str, selector: KeySelector) -> Result<Vec<Record>> {
        let table = self.table(store)?;
        Ok(match selector {
            KeySelector::Keys(keys) => keys
                .iter()
                .filter_map(|k| table.get(k).cloned())
                .collect(),
            KeySelector::Range(range) => table
                .iter()
                .filter(|(k, _)| range.contains(k))
                .map(|(_, v)| v.clone())
                .collect(),
        })
    }

    async fn count(&mut self, store: &str, range: Option<KeyRange>) -> Result<u64> {
        let table = self.table(store)?;
        Ok(match range {
            Some(range) => table.keys().filter(|k| range.contains(k)).count() as u64,
            None => table.len() as u64,
        })
    }

    async fn clear_store(&mut self, store: &str) -> Result<()> {
        self.table_mut(store)?.clear();
        Ok(())
    }

    async fn remove(&mut self, store: &str, selector: KeySelector) -> Result<u64> {
        let table = self.table_mut(store)?;
        match selector {
            KeySelector::Keys(keys) => {
                let mut removed = 0;
                for key in &keys {
                    if table.remove(key).is_some() {
                        removed += 1;
                    }
                }
                Ok(removed)
            }
            KeySelector::Range(range) => {
                let victims: Vec<Key> = table
                    .keys()
                    .filter(|k| range.contains(k))
                    .cloned()
                    .collect();
                for k in &victims {
                    table.remove(k);
                }
                Ok(victims.len() as u64)
            }
        }
    }

    async fn run_query(&mut self, ir: &QueryIr, schema: &Schema) -> Result<serde_json::Value> {
        let descriptor = compile_native(ir, schema)?;
        execute_native(&descriptor, self, schema).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyType;
    use crate::schema::{KeyPath, StoreSchema};

    fn schema() -> Schema {
        Schema::fixed(vec![StoreSchema::new(
            "items",
            Some(KeyPath::Single("id".into())),
            KeyType::Number,
        )])
    }

    #[tokio::test]
    async fn put_and_get_round_trip() {
        let backend = NativeBackend::new();
        backend.connect("t", &schema()).await.unwrap();
        backend
            .do_transaction(
                &["items".into()],
                TxMode::ReadWrite,
                Box::new(|tx| {
                    Box::pin(async move {
                        tx.put("items", serde_json::json!({"id": 1.0}), None).await?;
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();

        backend
            .do_transaction(
                &["items".into()],
                TxMode::ReadOnly,
                Box::new(|tx| {
                    Box::pin(async move {
                        let got = tx.get("items", &Key::Number(1.0)).await?;
                        assert!(got.is_some());
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back_snapshot() {
        let backend = NativeBackend::new();
        backend.connect("t", &schema()).await.unwrap();

        let result = backend
            .do_transaction(
                &["items".into()],
                TxMode::ReadWrite,
                Box::new(|tx| {
                    Box::pin(async move {
                        tx.put("items", serde_json::json!({"id": 2.0}), None).await?;
                        Err(Error::invalid_operation("abort"))
                    })
                }),
            )
            .await;
        assert!(result.is_err());

        backend
            .do_transaction(
                &["items".into()],
                TxMode::ReadOnly,
                Box::new(|tx| {
                    Box::pin(async move {
                        let count = tx.count("items", None).await?;
                        assert_eq!(count, 0);
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn add_rejects_duplicate_key() {
        let backend = NativeBackend::new();
        backend.connect("t", &schema()).await.unwrap();
        backend
            .do_transaction(
                &["items".into()],
                TxMode::ReadWrite,
                Box::new(|tx| {
                    Box::pin(async move {
                        tx.add("items", serde_json::json!({"id": 3.0}), None).await?;
                        let err = tx
                            .add("items", serde_json::json!({"id": 3.0}), None)
                            .await
                            .unwrap_err();
                        assert_eq!(err.kind(), "ConstraintError");
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();
    }
}
