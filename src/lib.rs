//! A multi-backend storage layer: a schema/key-range model, a pair of
//! exemplar backend drivers (in-memory and relational-SQL), a relational
//! cursor state machine, a small SQL-subset query compiler, a transaction
//! queue, and a connection manager tying it all together.

pub mod backend;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod key;
pub mod keyrange;
pub mod query;
pub mod queue;
pub mod record;
pub mod result;
pub mod schema;

pub use connection::{Connection, ConnectionOptions, TransactionMetrics};
pub use error::{Error, Result};
pub use key::{Key, KeyType};
pub use keyrange::{KeyRange, Where};
pub use schema::{IndexSchema, KeyPath, Schema, StoreSchema};
