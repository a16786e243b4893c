//! Backend driver contract (component 4.C).
//!
//! The concrete backend drivers (a real native indexed-object-store engine
//! backed by OS storage, a real relational SQL engine driver, etc.) are
//! external collaborators per the spec's Out-of-scope list — this module
//! specifies only the contract the rest of the core assumes, mirroring how
//! `storage::StorageManager` in the teacher crate is an `async_trait` with a
//! small set of concrete implementations behind it
//! (`FilesystemStorage`/`S3Storage`). `backend::native` and `backend::sql`
//! are the two exemplar implementations used to exercise and test the
//! contract; real production drivers would slot in beside them.

use std::cmp::Ordering;
use std::fmt::Debug;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value as Record;

use crate::error::Result;
use crate::key::Key;
use crate::keyrange::KeyRange;
use crate::query::QueryIr;
use crate::schema::Schema;

pub(crate) mod layout;
pub mod native;
pub mod sql;

/// Iteration direction. *Unique* variants suppress duplicate effective keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    NextUnique,
    Prev,
    PrevUnique,
}

impl Direction {
    pub fn is_reverse(self) -> bool {
        matches!(self, Direction::Prev | Direction::PrevUnique)
    }

    pub fn is_unique(self) -> bool {
        matches!(self, Direction::NextUnique | Direction::PrevUnique)
    }
}

/// Transaction mode. `VersionChange` is exclusive with every other mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
    VersionChange,
}

/// A key or an explicit list of keys — the `list`/`remove` selector shape
/// from spec §6.
#[derive(Debug, Clone)]
pub enum KeySelector {
    Keys(Vec<Key>),
    Range(KeyRange),
}

/// CRUD surface a running backend transaction exposes to the core. Query
/// execution against an index is layered on top via `open_cursor`
/// (native backend) or the relational cursor state machine (`cursor`
/// module, used by `backend::sql`).
#[async_trait]
pub trait Transaction: Send {
    async fn put(&mut self, store: &str, record: Record, key: Option<Key>) -> Result<Key>;
    async fn add(&mut self, store: &str, record: Record, key: Option<Key>) -> Result<Key>;
    async fn get(&mut self, store: &str, key: &Key) -> Result<Option<Record>>;
    async fn list(&mut self, store: &str, selector: KeySelector) -> Result<Vec<Record>>;
    async fn count(&mut self, store: &str, range: Option<KeyRange>) -> Result<u64>;
    async fn clear_store(&mut self, store: &str) -> Result<()>;
    async fn remove(&mut self, store: &str, selector: KeySelector) -> Result<u64>;

    /// Runs a compiled query against this transaction's store. Each
    /// implementor calls the compiler matching its own concrete type
    /// directly (no downcasting needed — `self` is already the concrete
    /// transaction inside its own `impl Transaction` block).
    async fn run_query(&mut self, ir: &QueryIr, schema: &Schema) -> Result<serde_json::Value>;
}

/// A transaction closure, type-erased. Each call site constructs one of
/// these capturing its own `ResultSource` to resolve; see `connection.rs`.
pub type TransactionJob =
    Box<dyn for<'a> FnOnce(&'a mut dyn Transaction) -> BoxFuture<'a, Result<()>> + Send>;

/// Abstract interface for connect/transaction/cursor-open the rest of the
/// core assumes (spec §4.C). `cmp`/`is_ready`/`close` are synchronous
/// queries against already-established state.
#[async_trait]
pub trait BackendDriver: Debug + Send + Sync {
    /// Stable identifier returned by `Connection::backend_type()`.
    fn backend_id(&self) -> &'static str;

    /// Opens or creates the database, performing a schema upgrade if
    /// needed. On first success the driver transitions to ready.
    async fn connect(&self, name: &str, schema: &Schema) -> Result<()>;

    /// The schema this backend was last `connect`ed with, if any. `None`
    /// before the first successful connect. The connection manager reads
    /// this back on open to decide whether a schema-reconciliation
    /// version-change is needed.
    async fn persisted_schema(&self) -> Option<Schema> {
        None
    }

    /// Runs `job` within a backend transaction scoped to `stores` in the
    /// given mode. A simplification from the spec's three-way
    /// `{complete, error, abort}` completion: this returns `Ok(())` for
    /// `complete` and `Err` for both `error` and `abort`, since the two
    /// failure kinds differ only in whether the backend or the closure
    /// requested the rollback — callers that care can match on the error
    /// kind (`InvalidOperationError` for explicit abort requests raised from
    /// within `job`, anything else for backend-reported errors).
    async fn do_transaction(
        &self,
        stores: &[String],
        mode: TxMode,
        job: TransactionJob,
    ) -> Result<()>;

    /// Key comparison consistent with spec §3.
    fn cmp(&self, a: &Key, b: &Key) -> Ordering {
        Key::cmp(a, b)
    }

    fn is_ready(&self) -> bool;

    async fn close(&self) -> Result<()>;

    /// Subscribes to unsolicited-disconnect notifications.
    fn subscribe_disconnected(&self) -> tokio::sync::broadcast::Receiver<()>;
}
