//! Cluster: islands, nodes and shard routing
//!
//! The cluster owns one client per configured node. Islands are materialized
//! lazily on first access and cached. Routing is a pure function of the
//! topology: the global shard is island 0; column affinity either follows a
//! shard-qualified id of a known island (co-location) or hashes the values
//! onto the sorted island numbers.
//!
//! A node that fails a round-trip with a connectivity error is skipped for
//! `node_down_cooldown_ms`. Reads fall back from replicas to the primary;
//! writes only ever go to the primary.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::affinity::{routing_hash, ShardKey};
use crate::client::{Client, ClientFactory, Query};
use crate::config::ClusterConfig;
use crate::error::{EntError, Result};
use crate::logging::{Loggers, QueryEvent, SwallowedErrorEvent};
use crate::value::{Row, Value};

/// One shard: a primary and its replicas
pub struct Island {
    no: u32,
    master: Arc<dyn Client>,
    replicas: Vec<Arc<dyn Client>>,
    next_replica: AtomicUsize,
}

impl Island {
    pub fn no(&self) -> u32 {
        self.no
    }

    pub fn master(&self) -> &Arc<dyn Client> {
        &self.master
    }

    pub fn replicas(&self) -> &[Arc<dyn Client>] {
        &self.replicas
    }

    fn nodes(&self) -> impl Iterator<Item = &Arc<dyn Client>> {
        std::iter::once(&self.master).chain(self.replicas.iter())
    }
}

pub struct Cluster {
    config: ClusterConfig,
    factory: Arc<dyn ClientFactory>,
    loggers: Loggers,
    island_numbers: Vec<u32>,
    islands: RwLock<HashMap<u32, Arc<Island>>>,
    down_until: Mutex<HashMap<String, Instant>>,
}

impl Cluster {
    /// Validate the topology. No connection is opened.
    pub fn open(
        config: ClusterConfig,
        factory: Arc<dyn ClientFactory>,
        loggers: Loggers,
    ) -> Result<Self> {
        config.validate()?;

        let mut island_numbers: Vec<u32> = config.islands.iter().map(|i| i.no).collect();
        island_numbers.sort_unstable();

        info!(
            "Opening cluster with {} island(s): {:?}",
            island_numbers.len(),
            island_numbers
        );
        for island in &config.islands {
            for node in &island.nodes {
                debug!(island = island.no, node = %node.name, url = %node.masked_url(), "Node configured");
            }
        }

        Ok(Self {
            config,
            factory,
            loggers,
            island_numbers,
            islands: RwLock::new(HashMap::new()),
            down_until: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn loggers(&self) -> &Loggers {
        &self.loggers
    }

    /// Configured island numbers, ascending
    pub fn islands(&self) -> &[u32] {
        &self.island_numbers
    }

    pub fn has_island(&self, no: u32) -> bool {
        self.island_numbers.binary_search(&no).is_ok()
    }

    /// Deterministic island for a shard key
    pub fn resolve_island(&self, key: &ShardKey) -> u32 {
        match key {
            ShardKey::Global => 0,
            ShardKey::Values(values) => {
                let colocated = values.iter().find_map(|value| match value {
                    Value::Id(id) => id.island().filter(|no| self.has_island(*no)),
                    _ => None,
                });
                colocated.unwrap_or_else(|| {
                    let index = routing_hash(values) % self.island_numbers.len() as u64;
                    self.island_numbers[index as usize]
                })
            }
        }
    }

    /// The island, creating its node clients on first access
    pub async fn island(&self, no: u32) -> Result<Arc<Island>> {
        if let Some(island) = self.islands.read().await.get(&no) {
            return Ok(island.clone());
        }

        let mut islands = self.islands.write().await;
        if let Some(island) = islands.get(&no) {
            return Ok(island.clone());
        }

        let config = self
            .config
            .islands
            .iter()
            .find(|i| i.no == no)
            .ok_or_else(|| EntError::routing(no, "island is not configured"))?;

        let mut clients = Vec::with_capacity(config.nodes.len());
        for node in &config.nodes {
            clients.push(self.factory.create(no, node)?);
        }
        let mut clients = clients.into_iter();
        let master = clients
            .next()
            .ok_or_else(|| EntError::routing(no, "island has no nodes"))?;

        let island = Arc::new(Island {
            no,
            master,
            replicas: clients.collect(),
            next_replica: AtomicUsize::new(0),
        });
        debug!(
            island = no,
            replicas = island.replicas.len(),
            "Island initialized"
        );
        islands.insert(no, island.clone());
        Ok(island)
    }

    /// A node of the island: the primary for writes, a healthy replica
    /// (round-robin) for reads when enabled, else the primary.
    pub async fn get_node(&self, no: u32, for_write: bool) -> Result<Arc<dyn Client>> {
        let island = self.island(no).await?;

        if !for_write && self.config.read_from_replicas && !island.replicas.is_empty() {
            let count = island.replicas.len();
            let start = island.next_replica.fetch_add(1, Ordering::Relaxed);
            for offset in 0..count {
                let replica = &island.replicas[(start + offset) % count];
                if self.is_up(replica.name()) {
                    return Ok(replica.clone());
                }
            }
        }

        if self.is_up(island.master.name()) {
            return Ok(island.master.clone());
        }
        Err(EntError::routing(
            no,
            format!("no available node ({} is down)", island.master.name()),
        ))
    }

    /// Run one query on the island and report it to the query logger
    pub async fn execute(&self, no: u32, for_write: bool, query: &Query) -> Result<Vec<Row>> {
        let client = self.get_node(no, for_write).await?;

        let started = Instant::now();
        let result = client.execute(query).await;
        self.loggers.client_query(&QueryEvent {
            node: client.name().to_string(),
            island: no,
            table: query.table().to_string(),
            op: query.kind(),
            elapsed: started.elapsed(),
            rows: result.as_ref().map_or(0, Vec::len),
            error: result.as_ref().err().map(ToString::to_string),
        });

        if let Err(EntError::Routing { .. }) = &result {
            self.mark_down(client.name());
        }
        result
    }

    /// Open minimum connections on every node. Failures are logged and the
    /// node is retried lazily on first use. Returns the failed node names.
    pub async fn prewarm(&self) -> Vec<String> {
        let mut nodes = Vec::new();
        let mut failed = Vec::new();
        for &no in &self.island_numbers {
            match self.island(no).await {
                Ok(island) => nodes.extend(island.nodes().cloned()),
                Err(e) => {
                    warn!("Failed to initialize island {}: {}", no, e);
                    failed.push(format!("island{no}"));
                }
            }
        }

        let results = join_all(nodes.iter().map(|node| async move {
            (node.name().to_string(), node.prewarm().await)
        }))
        .await;

        for (name, result) in results {
            if let Err(e) = result {
                self.loggers.swallowed_error(&SwallowedErrorEvent {
                    place: "prewarm".to_string(),
                    entity: name.clone(),
                    error: e.to_string(),
                });
                failed.push(name);
            }
        }

        if failed.is_empty() {
            info!("Prewarmed {} node(s)", nodes.len());
        } else {
            warn!("Prewarm failed for {} node(s): {:?}", failed.len(), failed);
        }
        failed
    }

    /// Close every node client created so far
    pub async fn close(&self) {
        let islands: Vec<Arc<Island>> = self.islands.write().await.drain().map(|(_, i)| i).collect();
        for island in &islands {
            for node in island.nodes() {
                node.close().await;
            }
        }
        info!("Cluster closed ({} island(s))", islands.len());
    }

    fn is_up(&self, node: &str) -> bool {
        let mut down = self.down_until.lock().unwrap_or_else(|p| p.into_inner());
        match down.get(node) {
            Some(until) if Instant::now() < *until => false,
            Some(_) => {
                down.remove(node);
                true
            }
            None => true,
        }
    }

    fn mark_down(&self, node: &str) {
        let cooldown = Duration::from_millis(self.config.node_down_cooldown_ms);
        warn!(
            "Node {} is unreachable, skipping it for {}ms",
            node,
            cooldown.as_millis()
        );
        self.down_until
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(node.to_string(), Instant::now() + cooldown);
    }
}
