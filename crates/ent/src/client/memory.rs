//! In-memory backend
//!
//! Every island has one [`MemoryStore`] shared by its nodes, so replicas see
//! the primary's writes immediately. Constraints match what the SQL schema
//! would enforce: the primary key and declared unique keys (NULLs never
//! collide). Concurrent round-trips per node are bounded by a semaphore
//! sized by `max_connections`; the permit is held for one round-trip only.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tracing::debug;

use super::{Client, ClientFactory, OnConflict, Query};
use crate::config::NodeConfig;
use crate::error::{EntError, Result};
use crate::id::{Id, MAX_SEQUENCE};
use crate::schema::{AutoExpr, Schema, ID_COLUMN};
use crate::value::{Row, Value};

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Row>,
    sequence: u64,
}

/// Tables of one island
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored in `table`
    pub fn row_count(&self, table: &str) -> usize {
        self.lock().get(table).map_or(0, |t| t.rows.len())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Table>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MemoryClient {
    name: String,
    island: u32,
    store: Arc<MemoryStore>,
    permits: Semaphore,
    down: AtomicBool,
}

impl MemoryClient {
    pub fn new(name: impl Into<String>, island: u32, store: Arc<MemoryStore>, max_connections: u32) -> Self {
        Self {
            name: name.into(),
            island,
            store,
            permits: Semaphore::new(max_connections.max(1) as usize),
            down: AtomicBool::new(false),
        }
    }

    /// Simulate the node becoming unreachable (or reachable again)
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    fn check_reachable(&self) -> Result<()> {
        if self.is_down() || self.permits.is_closed() {
            return Err(EntError::routing(
                self.island,
                format!("{}: connection refused", self.name),
            ));
        }
        Ok(())
    }

    fn select(&self, filter: &Row, limit: Option<u64>, table: Option<&Table>) -> Vec<Row> {
        let Some(table) = table else {
            return Vec::new();
        };
        let limit = limit.map_or(usize::MAX, |n| n as usize);
        table
            .rows
            .iter()
            .filter(|row| row.matches(filter))
            .take(limit)
            .cloned()
            .collect()
    }

    fn insert(&self, schema: &Schema, table: &mut Table, row: &Row, on_conflict: OnConflict) -> Result<Vec<Row>> {
        let mut stored = row.clone();
        for column in schema.columns() {
            if stored.contains(&column.name) {
                continue;
            }
            let value = match column.insert_default() {
                Some(AutoExpr::ShardId) => {
                    if table.sequence >= MAX_SEQUENCE {
                        return Err(EntError::store(
                            &self.name,
                            format!("id sequence of {} exhausted", schema.table()),
                        ));
                    }
                    table.sequence += 1;
                    Value::Id(Id::compose(self.island, table.sequence))
                }
                Some(expr) => self.evaluate(expr)?,
                None => Value::Null,
            };
            stored.set(column.name.as_str(), value);
        }

        if let Some(existing) = table.rows.iter().find(|r| conflicts(schema, r, &stored)) {
            return match on_conflict {
                OnConflict::DoNothing => {
                    debug!(
                        node = %self.name,
                        table = schema.table(),
                        existing = ?existing.id(),
                        "Insert skipped on conflict"
                    );
                    Ok(Vec::new())
                }
                OnConflict::Fail => Err(self.unique_violation(schema)),
            };
        }

        table.rows.push(stored.clone());
        Ok(vec![stored])
    }

    fn update(&self, schema: &Schema, table: &mut Table, id: &Id, set: &Row) -> Result<Vec<Row>> {
        let Some(index) = table.rows.iter().position(|r| r.id() == Some(id)) else {
            return Ok(Vec::new());
        };

        let mut updated = table.rows[index].merge(set);
        for column in schema.columns() {
            if let Some(expr) = &column.auto_update {
                if !set.contains(&column.name) {
                    updated.set(column.name.as_str(), self.evaluate(expr)?);
                }
            }
        }

        let collides = table
            .rows
            .iter()
            .enumerate()
            .any(|(i, other)| i != index && conflicts(schema, other, &updated));
        if collides {
            return Err(self.unique_violation(schema));
        }

        table.rows[index] = updated.clone();
        Ok(vec![updated])
    }

    fn evaluate(&self, expr: &AutoExpr) -> Result<Value> {
        match expr {
            AutoExpr::Now => Ok(Value::Timestamp(Utc::now())),
            AutoExpr::ShardId => Err(EntError::store(
                &self.name,
                "shard id can only be generated on insert",
            )),
            AutoExpr::Sql(sql) => Err(EntError::store(
                &self.name,
                format!("raw SQL expression is not supported in memory: {sql}"),
            )),
        }
    }

    fn unique_violation(&self, schema: &Schema) -> EntError {
        EntError::store(
            &self.name,
            format!("duplicate key value violates unique constraint on {}", schema.table()),
        )
    }
}

#[async_trait]
impl Client for MemoryClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, query: &Query) -> Result<Vec<Row>> {
        self.check_reachable()?;
        let _permit = self.permits.acquire().await.map_err(|_| {
            EntError::routing(self.island, format!("{}: client closed", self.name))
        })?;
        self.check_reachable()?;

        let mut tables = self.store.lock();
        match query {
            Query::Select { schema, filter, limit } => {
                Ok(self.select(filter, *limit, tables.get(schema.table())))
            }
            Query::Insert {
                schema,
                row,
                on_conflict,
            } => {
                let table = tables.entry(schema.table().to_string()).or_default();
                self.insert(schema, table, row, *on_conflict)
            }
            Query::Update { schema, id, set } => match tables.get_mut(schema.table()) {
                Some(table) => self.update(schema, table, id, set),
                None => Ok(Vec::new()),
            },
            Query::Delete { schema, id } => {
                let Some(table) = tables.get_mut(schema.table()) else {
                    return Ok(Vec::new());
                };
                let (deleted, kept): (Vec<Row>, Vec<Row>) = std::mem::take(&mut table.rows)
                    .into_iter()
                    .partition(|r| r.id() == Some(id));
                table.rows = kept;
                Ok(deleted)
            }
        }
    }

    async fn prewarm(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn close(&self) {
        self.permits.close();
    }
}

/// Whether `a` and `b` collide on the primary key or a fully non-null unique key
fn conflicts(schema: &Schema, a: &Row, b: &Row) -> bool {
    if a.get(ID_COLUMN).is_some() && a.get(ID_COLUMN) == b.get(ID_COLUMN) {
        return true;
    }
    schema.unique_keys().iter().any(|key| {
        key.iter().all(|column| match (a.get(column), b.get(column)) {
            (Some(x), Some(y)) => !x.is_null() && x == y,
            _ => false,
        })
    })
}

/// Builds [`MemoryClient`]s, one shared store per island
#[derive(Default)]
pub struct MemoryClientFactory {
    stores: Mutex<HashMap<u32, Arc<MemoryStore>>>,
    clients: Mutex<HashMap<String, Arc<MemoryClient>>>,
}

impl MemoryClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client created by this factory, by node name
    pub fn client(&self, name: &str) -> Option<Arc<MemoryClient>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// The store of `island`, created on first use
    pub fn store(&self, island: u32) -> Arc<MemoryStore> {
        self.stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(island)
            .or_default()
            .clone()
    }
}

impl ClientFactory for MemoryClientFactory {
    fn create(&self, island: u32, node: &NodeConfig) -> Result<Arc<dyn Client>> {
        let client = Arc::new(MemoryClient::new(
            node.name.as_str(),
            island,
            self.store(island),
            node.max_connections,
        ));
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(node.name.clone(), client.clone());
        Ok(client)
    }
}
