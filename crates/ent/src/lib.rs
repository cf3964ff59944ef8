//! Entity access-control and shard-routing engine
//!
//! Sits between application code and a partitioned relational store. For
//! every operation it decides which island (shard) holds the row and
//! whether the acting viewer context may read or write it, before any row
//! contents reach the caller or any write is committed.
//!
//! ```text
//! EntRef::load(vc, id)
//!   ├─ island from the id (or the shard affinity columns)
//!   ├─ Cluster::execute ─► node of the island ─► Client
//!   └─ privacy::authorize(vc, load rules, row) ─► Ent { vc, row } | Authorization error
//! ```
//!
//! Setup:
//!
//! 1. [`ClusterConfig`] describes islands and nodes.
//! 2. [`Cluster::open`] with a [`ClientFactory`] (SQL or in-memory) and [`Loggers`].
//! 3. [`Engine::builder`] registers one [`EntConfig`] per entity type.
//! 4. Requests enter as [`Vc::guest`]; application code derives principals
//!    from its session provider.

pub mod affinity;
pub mod client;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod ent;
pub mod error;
pub mod id;
pub mod logging;
pub mod privacy;
pub mod schema;
pub mod value;
pub mod vc;

pub use affinity::{ShardAffinity, ShardKey, GLOBAL_SHARD};
pub use client::{
    Client, ClientFactory, MemoryClient, MemoryClientFactory, OnConflict, Query, SqlClient,
    SqlClientFactory,
};
pub use cluster::{Cluster, Island};
pub use config::{ClusterConfig, IslandConfig, NodeConfig};
pub use engine::{Engine, EngineBuilder, EntRef, Registry};
pub use ent::{Ent, EntConfig, InferPrincipal};
pub use error::{EntError, Result};
pub use id::Id;
pub use logging::{Loggers, QueryEvent, SwallowedErrorEvent};
pub use privacy::{Decision, Operation, Predicate, Rule, Verdict};
pub use schema::{AutoExpr, Column, ColumnType, Schema};
pub use value::{Row, Value};
pub use vc::{Principal, Vc};
