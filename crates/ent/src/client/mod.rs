//! Client abstraction over one database node
//!
//! The engine talks to nodes through the [`Client`] trait with structured
//! [`Query`] values it generates itself. Two backends:
//!
//! - [`sql::SqlClient`]: sea-orm connection pool, statements rendered with sea-query
//! - [`memory::MemoryClient`]: in-process tables, for tests and local runs
//!
//! Each `execute` call borrows one connection for one round-trip. The
//! connection is released on every exit path, including cancellation of
//! the calling future.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::id::Id;
use crate::schema::Schema;
use crate::value::Row;

pub mod memory;
pub mod sql;

pub use memory::{MemoryClient, MemoryClientFactory};
pub use sql::{SqlClient, SqlClientFactory};

/// What an insert does when it hits the primary key or a unique key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    Fail,
    DoNothing,
}

/// Statement generated by the engine
#[derive(Debug, Clone)]
pub enum Query {
    /// Rows whose columns equal every value of `filter`
    Select {
        schema: Arc<Schema>,
        filter: Row,
        limit: Option<u64>,
    },
    /// Insert one row; returns the stored row, or nothing on an ignored conflict
    Insert {
        schema: Arc<Schema>,
        row: Row,
        on_conflict: OnConflict,
    },
    /// Update one row by id, applying auto-update expressions; returns updated rows
    Update {
        schema: Arc<Schema>,
        id: Id,
        set: Row,
    },
    /// Delete one row by id; returns deleted rows
    Delete { schema: Arc<Schema>, id: Id },
}

impl Query {
    pub fn schema(&self) -> &Schema {
        match self {
            Query::Select { schema, .. }
            | Query::Insert { schema, .. }
            | Query::Update { schema, .. }
            | Query::Delete { schema, .. } => schema,
        }
    }

    pub fn table(&self) -> &str {
        self.schema().table()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Query::Select { .. } => "select",
            Query::Insert { .. } => "insert",
            Query::Update { .. } => "update",
            Query::Delete { .. } => "delete",
        }
    }
}

/// A pool-like handle to one node
#[async_trait]
pub trait Client: Send + Sync {
    /// Node name, unique within the cluster
    fn name(&self) -> &str;

    /// Run one query.
    ///
    /// Connectivity failures are reported as `EntError::Routing`, query
    /// failures as `EntError::Store`.
    async fn execute(&self, query: &Query) -> Result<Vec<Row>>;

    /// Open the minimum number of connections
    async fn prewarm(&self) -> Result<()>;

    /// Close all connections
    async fn close(&self);
}

/// Builds the client of a node (one per node, created lazily per island)
pub trait ClientFactory: Send + Sync {
    fn create(&self, island: u32, node: &NodeConfig) -> Result<Arc<dyn Client>>;
}
