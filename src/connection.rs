//! Connection manager (component 4.G).
//!
//! Selects a backend, reconciles schema on connect, and is the sole public
//! entry point for CRUD/query operations, each of which is submitted as a
//! transaction request to the `queue` module. Grounded in the connect/open
//! shape of `catalog::sqlite_manager::SqliteCatalogManager::new` (open a
//! pool, run migrations, wrap in a manager struct) generalized to a
//! mechanism list instead of one fixed backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, RwLock};

use crate::backend::native::NativeBackend;
use crate::backend::sql::SqlBackend;
use crate::backend::{BackendDriver, KeySelector, Transaction, TxMode};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::keyrange::KeyRange;
use crate::query::{parser, QueryIr};
use crate::queue::{TransactionQueue, TransactionRequest};
use crate::schema::{KeyPath, Schema, StoreSchema};

/// Reserved store name backing the default-text-store convenience methods
/// (spec §6, "Default-text-store convenience").
const TEXT_STORE: &str = "__text_store__";

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Backend identifiers to try, in order. Defaults to every backend this
    /// crate ships, native first (spec §4.G's default order collapses here
    /// to the two exemplar mechanisms this crate actually implements).
    pub mechanisms: Vec<String>,
    pub size: Option<u64>,
    pub auto_schema: bool,
    pub auto_version: bool,
    pub use_text_store: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            mechanisms: vec!["native-memory".to_string(), "relational-sql".to_string()],
            size: None,
            auto_schema: false,
            auto_version: false,
            use_text_store: false,
        }
    }
}

/// Lifecycle notifications (spec §4.G "Events").
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Fail(String),
}

/// The public handle applications hold. Owns the selected backend, the
/// reconciled schema, and the transaction queue that serializes every
/// operation against the backend (spec §5 "single logical executor").
pub struct Connection {
    name: String,
    backend: Arc<dyn BackendDriver>,
    schema: RwLock<Schema>,
    queue: Arc<TransactionQueue>,
    events: broadcast::Sender<ConnectionEvent>,
    ready: AtomicBool,
    version_change_pending: AtomicBool,
    schema_version: RwLock<Option<u64>>,
}

/// Read-only snapshot for observability (spec §6 addition). Logged via
/// `tracing` at call sites rather than exposed as its own error surface.
#[derive(Debug, Clone, Copy)]
pub struct TransactionMetrics {
    pub queue_depth: usize,
    pub version_change_pending: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("backend", &self.backend.backend_id())
            .field("ready", &self.ready.load(Ordering::SeqCst))
            .finish()
    }
}

fn backend_for(mechanism: &str) -> Option<Arc<dyn BackendDriver>> {
    match mechanism {
        "native-memory" => Some(Arc::new(NativeBackend::new())),
        "relational-sql" => Some(Arc::new(SqlBackend::in_memory())),
        _ => None,
    }
}

/// `autoVersion`'s schema hash: the first 8 bytes of a SHA-256 digest of the
/// schema's canonical JSON, read big-endian as a `u64`. Two
/// structurally-similar schemas hash identically; any drift in store/index
/// shape changes the version without a hand-maintained counter.
/// Schema reconciliation (spec §4.G "Schema reconciliation"): compares the
/// backend's persisted schema, if any, against the one the caller supplied.
/// A non-similar difference is a version change — the persisted schema
/// absorbs the caller's delta (new/changed stores) and is returned in place
/// of the caller's schema, along with `true`. A backend with no persisted
/// schema yet (first connect) or an unchanged schema returns the caller's
/// schema unmodified and `false`.
async fn reconcile_schema(backend: &dyn BackendDriver, schema: Schema) -> (Schema, bool) {
    match backend.persisted_schema().await {
        Some(mut persisted) if !persisted.similar(&schema) => {
            persisted.merge_from(&schema);
            (persisted, true)
        }
        _ => (schema, false),
    }
}

pub fn schema_hash(schema: &Schema) -> Result<u64> {
    let canonical = schema.to_json()?;
    let digest = Sha256::digest(canonical.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    Ok(u64::from_be_bytes(buf))
}

impl Connection {
    /// Opens a connection: selects the first supported mechanism, connects
    /// it, reconciles schema via a `versionchange` transaction if needed,
    /// then marks ready. On failure, emits `fail` and purges nothing (the
    /// queue does not exist yet at this point — requests submitted after a
    /// failed `open` simply see `is_ready() == false` until retried by the
    /// caller).
    pub async fn open(name: impl Into<String>, schema: Schema, options: ConnectionOptions) -> Result<Self> {
        let name = name.into();
        let mut schema = schema;
        if options.use_text_store && schema.get_store(TEXT_STORE).is_none() {
            let store = StoreSchema::new(TEXT_STORE, Some(KeyPath::Single("key".into())), crate::key::KeyType::Text);
            // the text store is always editable regardless of the caller's schema kind
            match &mut schema {
                Schema::Editable(_) => {
                    schema.add_store(store).ok();
                }
                Schema::Fixed(stores) => {
                    stores.insert(TEXT_STORE.to_string(), store);
                }
            }
        }

        let backend = options
            .mechanisms
            .iter()
            .find_map(|m| backend_for(m).filter(|_| true))
            .ok_or_else(|| Error::constraint("No storage mechanism found"))?;

        let (events, _) = broadcast::channel(16);

        let version_change_pending = AtomicBool::new(false);
        let (mut schema, drifted) = reconcile_schema(backend.as_ref(), schema).await;
        if drifted {
            version_change_pending.store(true, Ordering::SeqCst);
            tracing::info!(name = %name, "schema drift detected, applying version-change delta");
        }

        match backend.connect(&name, &schema).await {
            Ok(()) => {
                tracing::info!(name = %name, backend = backend.backend_id(), "connection ready");
                let _ = events.send(ConnectionEvent::Connected);
            }
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "connection open failed");
                let _ = events.send(ConnectionEvent::Fail(e.to_string()));
                return Err(e);
            }
        }
        version_change_pending.store(false, Ordering::SeqCst);

        let schema_version = if options.auto_version {
            Some(schema_hash(&schema)?)
        } else {
            None
        };

        Ok(Connection {
            name,
            backend,
            schema: RwLock::new(schema),
            queue: Arc::new(TransactionQueue::new()),
            events,
            ready: AtomicBool::new(true),
            version_change_pending,
            schema_version: RwLock::new(schema_version),
        })
    }

    /// The `autoVersion`-derived schema hash (spec "auto-version flag"),
    /// `None` when the connection was opened without `auto_version`.
    pub async fn schema_version(&self) -> Option<u64> {
        *self.schema_version.read().await
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_id()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.backend.is_ready()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn get_schema(&self) -> Schema {
        self.schema.read().await.clone()
    }

    /// Adds a store to an editable schema, then runs a `versionchange`
    /// transaction so the backend creates the underlying table (spec §4.A).
    pub async fn add_store_schema(&self, store: StoreSchema) -> Result<()> {
        {
            let mut schema = self.schema.write().await;
            schema.add_store(store)?;
        }
        let schema_after = self.schema.read().await.clone();
        self.backend.connect(&self.name, &schema_after).await
    }

    /// Runs `job` as a queued transaction scoped to `stores` in `mode`,
    /// waiting for its result (spec §4.C/§4.F; the public `transaction`
    /// admin op from spec §6).
    pub async fn transaction(&self, stores: &[&str], mode: TxMode, job: crate::backend::TransactionJob) -> Result<()> {
        let request = TransactionRequest {
            stores: stores.iter().map(|s| s.to_string()).collect(),
            mode,
            job,
        };
        if mode == TxMode::VersionChange {
            self.version_change_pending.store(true, Ordering::SeqCst);
        }
        let handle = self.queue.submit(request).await;
        self.run_head_if_idle().await;
        let result = handle.wait().await;
        if mode == TxMode::VersionChange {
            self.version_change_pending.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Read-only snapshot of queue depth and whether a `VersionChange`
    /// transaction is currently in flight (the one mode exclusive with every
    /// other, per spec §5).
    pub async fn transaction_metrics(&self) -> TransactionMetrics {
        TransactionMetrics {
            queue_depth: self.queue.len().await,
            version_change_pending: self.version_change_pending.load(Ordering::SeqCst),
        }
    }

    /// The queue has no background worker task; each submitting caller
    /// drains the head itself after enqueuing, honoring the strict FIFO
    /// contract without spawning a persistent driver task per connection.
    async fn run_head_if_idle(&self) {
        while !self.queue.is_empty().await {
            self.queue.run_one(self.backend.as_ref()).await;
        }
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.len().await
    }

    pub async fn close(&self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        self.queue.purge("connection closed").await;
        self.backend.close().await
    }

    // ---- CRUD surface (spec §6) ----

    pub async fn put(&self, store: &str, record: serde_json::Value, key: Option<Key>) -> Result<Key> {
        let store_name = store.to_string();
        let job_store = store_name.clone();
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        self.transaction(
            &[&store_name],
            TxMode::ReadWrite,
            Box::new(move |tx| {
                Box::pin(async move {
                    let outcome = tx.put(&job_store, record, key).await;
                    let _ = result_tx.send(outcome);
                    Ok(())
                })
            }),
        )
        .await?;
        result_rx.await.map_err(|_| Error::invalid_state("transaction dropped its result"))?
    }

    pub async fn add(&self, store: &str, record: serde_json::Value) -> Result<Key> {
        let store_name = store.to_string();
        let job_store = store_name.clone();
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        self.transaction(
            &[&store_name],
            TxMode::ReadWrite,
            Box::new(move |tx| {
                Box::pin(async move {
                    let outcome = tx.add(&job_store, record, None).await;
                    let _ = result_tx.send(outcome);
                    Ok(())
                })
            }),
        )
        .await?;
        result_rx.await.map_err(|_| Error::invalid_state("transaction dropped its result"))?
    }

    pub async fn get(&self, store: &str, key: Key) -> Result<Option<serde_json::Value>> {
        let store_name = store.to_string();
        let job_store = store_name.clone();
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        self.transaction(
            &[&store_name],
            TxMode::ReadOnly,
            Box::new(move |tx| {
                Box::pin(async move {
                    let outcome = tx.get(&job_store, &key).await;
                    let _ = result_tx.send(outcome);
                    Ok(())
                })
            }),
        )
        .await?;
        result_rx.await.map_err(|_| Error::invalid_state("transaction dropped its result"))?
    }

    pub async fn list(&self, store: &str, selector: KeySelector) -> Result<Vec<serde_json::Value>> {
        let store_name = store.to_string();
        let job_store = store_name.clone();
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        self.transaction(
            &[&store_name],
            TxMode::ReadOnly,
            Box::new(move |tx| {
                Box::pin(async move {
                    let outcome = tx.list(&job_store, selector).await;
                    let _ = result_tx.send(outcome);
                    Ok(())
                })
            }),
        )
        .await?;
        result_rx.await.map_err(|_| Error::invalid_state("transaction dropped its result"))?
    }

    pub async fn count(&self, store: &str, range: Option<KeyRange>) -> Result<u64> {
        let store_name = store.to_string();
        let job_store = store_name.clone();
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        self.transaction(
            &[&store_name],
            TxMode::ReadOnly,
            Box::new(move |tx| {
                Box::pin(async move {
                    let outcome = tx.count(&job_store, range).await;
                    let _ = result_tx.send(outcome);
                    Ok(())
                })
            }),
        )
        .await?;
        result_rx.await.map_err(|_| Error::invalid_state("transaction dropped its result"))?
    }

    /// Clears the named stores, or every store in the schema if `stores` is
    /// empty, returning the number of stores affected (spec invariant 2).
    pub async fn clear(&self, stores: &[&str]) -> Result<u64> {
        let targets: Vec<String> = if stores.is_empty() {
            let schema = self.schema.read().await;
            schema.store_names().map(str::to_string).collect()
        } else {
            stores.iter().map(|s| s.to_string()).collect()
        };
        let scope: Vec<&str> = targets.iter().map(String::as_str).collect();
        let count = targets.len() as u64;
        let targets_for_job = targets.clone();
        self.transaction(
            &scope,
            TxMode::ReadWrite,
            Box::new(move |tx| {
                Box::pin(async move {
                    for store in &targets_for_job {
                        tx.clear_store(store).await?;
                    }
                    Ok(())
                })
            }),
        )
        .await?;
        Ok(count)
    }

    pub async fn remove(&self, store: &str, selector: KeySelector) -> Result<u64> {
        let store_name = store.to_string();
        let job_store = store_name.clone();
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        self.transaction(
            &[&store_name],
            TxMode::ReadWrite,
            Box::new(move |tx| {
                Box::pin(async move {
                    let outcome = tx.remove(&job_store, selector).await;
                    let _ = result_tx.send(outcome);
                    Ok(())
                })
            }),
        )
        .await?;
        result_rx.await.map_err(|_| Error::invalid_state("transaction dropped its result"))?
    }

    // ---- Query surface (spec §4.E, layered over §4.C) ----

    /// Parses and runs a query string against the connection's current
    /// schema, dispatching to the native or SQL compiler depending on the
    /// selected backend (spec §4.E).
    pub async fn query(&self, sql: &str) -> Result<serde_json::Value> {
        let ir = parser::parse(sql)?;
        self.run_ir(ir).await
    }

    /// Each backend's `Transaction` impl dispatches to its own compiler
    /// (`run_query`) — no downcasting needed, since inside each impl block
    /// `self` is already the concrete transaction type.
    async fn run_ir(&self, ir: QueryIr) -> Result<serde_json::Value> {
        let schema = self.schema.read().await.clone();
        let store = ir.store_name.clone();
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();

        self.transaction(
            &[&store],
            TxMode::ReadOnly,
            Box::new(move |tx| {
                Box::pin(async move {
                    let outcome = tx.run_query(&ir, &schema).await;
                    let _ = result_tx.send(outcome);
                    Ok(())
                })
            }),
        )
        .await?;
        result_rx.await.map_err(|_| Error::invalid_state("transaction dropped its result"))?
    }

    // ---- Default text store convenience (spec §6) ----

    pub async fn get_item(&self, key: &str) -> Result<Option<String>> {
        let value = self.get(TEXT_STORE, Key::Text(key.to_string())).await?;
        Ok(value.and_then(|v| v.get("value").and_then(|s| s.as_str()).map(str::to_string)))
    }

    pub async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.put(
            TEXT_STORE,
            serde_json::json!({"key": key, "value": value}),
            Some(Key::Text(key.to_string())),
        )
        .await?;
        Ok(())
    }

    pub async fn remove_item(&self, key: &str) -> Result<()> {
        self.remove(TEXT_STORE, KeySelector::Keys(vec![Key::Text(key.to_string())]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyType;

    fn store(name: &str) -> StoreSchema {
        StoreSchema::new(name, Some(KeyPath::Single("id".into())), KeyType::Number)
    }

    #[test]
    fn schema_hash_is_stable_for_structurally_similar_schemas() {
        let a = Schema::fixed(vec![store("st")]);
        let b = Schema::fixed(vec![store("st")]);
        assert_eq!(schema_hash(&a).unwrap(), schema_hash(&b).unwrap());
    }

    #[test]
    fn schema_hash_changes_when_a_store_is_added() {
        let a = Schema::fixed(vec![store("st")]);
        let b = Schema::fixed(vec![store("st"), store("st2")]);
        assert_ne!(schema_hash(&a).unwrap(), schema_hash(&b).unwrap());
    }

    #[tokio::test]
    async fn reconcile_schema_is_a_no_op_against_a_backend_with_no_persisted_schema() {
        let backend = NativeBackend::new();
        let schema = Schema::fixed(vec![store("st")]);
        let (reconciled, drifted) = reconcile_schema(&backend, schema.clone()).await;
        assert!(!drifted);
        assert!(reconciled.similar(&schema));
    }

    #[tokio::test]
    async fn reconcile_schema_merges_a_new_store_into_the_persisted_schema() {
        let backend = NativeBackend::new();
        let original = Schema::fixed(vec![store("st")]);
        backend.connect("t", &original).await.unwrap();

        let requested = Schema::fixed(vec![store("st"), store("st2")]);
        let (reconciled, drifted) = reconcile_schema(&backend, requested).await;

        assert!(drifted);
        assert!(reconciled.get_store("st").is_some());
        assert!(reconciled.get_store("st2").is_some());
    }

    #[tokio::test]
    async fn reconcile_schema_is_a_no_op_when_nothing_changed() {
        let backend = NativeBackend::new();
        let original = Schema::fixed(vec![store("st")]);
        backend.connect("t", &original).await.unwrap();

        let (reconciled, drifted) = reconcile_schema(&backend, original.clone()).await;
        assert!(!drifted);
        assert!(reconciled.similar(&original));
    }

    #[tokio::test]
    async fn auto_version_populates_schema_version_from_the_schema_hash() {
        let schema = Schema::fixed(vec![store("st")]);
        let expected = schema_hash(&schema).unwrap();
        let options = ConnectionOptions {
            mechanisms: vec!["native-memory".to_string()],
            auto_version: true,
            ..ConnectionOptions::default()
        };
        let conn = Connection::open("t", schema, options).await.unwrap();
        assert_eq!(conn.schema_version().await, Some(expected));
    }

    #[tokio::test]
    async fn schema_version_is_none_without_auto_version() {
        let schema = Schema::fixed(vec![store("st")]);
        let options = ConnectionOptions {
            mechanisms: vec!["native-memory".to_string()],
            ..ConnectionOptions::default()
        };
        let conn = Connection::open("t", schema, options).await.unwrap();
        assert_eq!(conn.schema_version().await, None);
    }
}
