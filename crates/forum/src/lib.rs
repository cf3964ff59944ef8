//! Forum application built on the entity engine
//!
//! Users, topics, comments and organizations, with the session-to-VC
//! resolution every request goes through.

pub mod ents;
pub mod session;

use ent::{
    ClientFactory, Cluster, ClusterConfig, Engine, Loggers, MemoryClientFactory, Result,
    SqlClientFactory,
};
use std::sync::Arc;
use tracing::info;

pub use session::{principal_id, server_vc, Session};

/// Open the cluster and register the forum entity types.
/// `memory` swaps the SQL backend for the in-memory one.
pub fn open_engine(config: ClusterConfig, memory: bool) -> Result<Engine> {
    let factory: Arc<dyn ClientFactory> = if memory {
        Arc::new(MemoryClientFactory::new())
    } else {
        Arc::new(SqlClientFactory)
    };
    info!(
        "Opening cluster with {} island(s) on the {} backend",
        config.islands.len(),
        if memory { "in-memory" } else { "SQL" }
    );
    let cluster = Cluster::open(config, factory, Loggers::new())?;
    ents::register(Engine::builder(Arc::new(cluster)))?.build()
}
