//! Entity engine: routing, privacy and queries tied together
//!
//! Every operation follows the same order: validate the payload, resolve
//! the island, run the privacy rules, and only then expose row contents or
//! write anything. Each round-trip borrows a connection independently, so a
//! predicate's nested lookups never wait on a connection held by the caller.

use futures::future::try_join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::client::{OnConflict, Query};
use crate::cluster::Cluster;
use crate::ent::{Ent, EntConfig};
use crate::error::{EntError, Result};
use crate::id::Id;
use crate::logging::Loggers;
use crate::privacy::{self, Operation};
use crate::schema::ID_COLUMN;
use crate::value::Row;
use crate::vc::Vc;

/// Registered entity types by name
#[derive(Debug, Default)]
pub struct Registry {
    ents: HashMap<String, Arc<EntConfig>>,
}

impl Registry {
    pub fn get(&self, name: &str) -> Option<&EntConfig> {
        self.ents.get(name).map(Arc::as_ref)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ents.is_empty()
    }
}

struct EngineInner {
    cluster: Arc<Cluster>,
    registry: Registry,
}

/// Shared handle to the cluster and the registered entity types
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(cluster: Arc<Cluster>) -> EngineBuilder {
        EngineBuilder::new(cluster)
    }

    /// Operations on one entity type
    pub fn ent(&self, name: &str) -> Result<EntRef> {
        let config = self
            .inner
            .registry
            .ents
            .get(name)
            .cloned()
            .ok_or_else(|| EntError::config(format!("unknown entity type {name}")))?;
        Ok(EntRef {
            engine: self.clone(),
            config,
        })
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.inner.cluster
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn loggers(&self) -> &Loggers {
        self.inner.cluster.loggers()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.inner.registry.names().collect();
        names.sort_unstable();
        f.debug_struct("Engine")
            .field("islands", &self.inner.cluster.islands())
            .field("ents", &names)
            .finish()
    }
}

pub struct EngineBuilder {
    cluster: Arc<Cluster>,
    configs: Vec<EntConfig>,
}

impl EngineBuilder {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            configs: Vec::new(),
        }
    }

    pub fn register(mut self, config: EntConfig) -> Self {
        self.configs.push(config);
        self
    }

    /// Validate every entity type and the references between them
    pub fn build(self) -> Result<Engine> {
        let mut registry = Registry::default();
        for config in self.configs {
            config.validate()?;
            let name = config.name().to_string();
            if registry.ents.insert(name.clone(), Arc::new(config)).is_some() {
                return Err(EntError::config(format!(
                    "entity type {name} registered twice"
                )));
            }
        }

        for config in registry.ents.values() {
            for rule in config.all_rules() {
                rule.predicate().validate(config, &registry)?;
            }
        }

        info!("Entity engine ready with {} entity type(s)", registry.len());
        Ok(Engine {
            inner: Arc::new(EngineInner {
                cluster: self.cluster,
                registry,
            }),
        })
    }
}

/// Typed operation surface of one entity type
#[derive(Clone)]
pub struct EntRef {
    engine: Engine,
    config: Arc<EntConfig>,
}

impl EntRef {
    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn config(&self) -> &EntConfig {
        &self.config
    }

    /// Load by primary key; `None` if the row does not exist
    pub async fn load_nullable(&self, vc: &Vc, id: &Id) -> Result<Option<Ent>> {
        let Some(island) = self.island_for_id(id) else {
            debug!(entity = self.name(), %id, "Id does not resolve to an island");
            return Ok(None);
        };
        match self.select_by_id(island, id, false).await? {
            Some(row) => self.authorize_load(vc, row).await.map(Some),
            None => Ok(None),
        }
    }

    /// Load by primary key; `NotFound` if the row does not exist
    pub async fn load_x(&self, vc: &Vc, id: &Id) -> Result<Ent> {
        self.load_nullable(vc, id)
            .await?
            .ok_or_else(|| EntError::not_found(self.name(), id))
    }

    /// Same as [`EntRef::load_x`]
    pub async fn load(&self, vc: &Vc, id: &Id) -> Result<Ent> {
        self.load_x(vc, id).await
    }

    /// Load by a unique key. Keys that do not cover the shard affinity
    /// columns are looked up on every island.
    pub async fn load_by_nullable(&self, vc: &Vc, key: Row) -> Result<Option<Ent>> {
        let key = self.config.schema().normalize_key(&key)?;
        if key.len() == 1 {
            if let Some(id) = key.id() {
                return self.load_nullable(vc, id).await;
            }
        }

        let cluster = self.engine.cluster();
        let islands = if self.config.affinity().is_covered_by(&key) {
            vec![self.island_for_row(&key)?]
        } else {
            cluster.islands().to_vec()
        };
        debug!(entity = self.name(), ?islands, "Loading by unique key");

        let query = Query::Select {
            schema: self.config.schema_arc().clone(),
            filter: key,
            limit: Some(1),
        };
        let found = try_join_all(islands.iter().map(|&no| cluster.execute(no, false, &query)))
            .await?
            .into_iter()
            .flatten()
            .next();
        match found {
            Some(row) => self.authorize_load(vc, row).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn load_by_x(&self, vc: &Vc, key: Row) -> Result<Ent> {
        let description = describe_key(&key);
        self.load_by_nullable(vc, key)
            .await?
            .ok_or_else(|| EntError::not_found(self.name(), description))
    }

    /// Same as [`EntRef::load_by_x`]
    pub async fn load_by(&self, vc: &Vc, key: Row) -> Result<Ent> {
        self.load_by_x(vc, key).await
    }

    /// Insert a row and return its generated id
    pub async fn insert(&self, vc: &Vc, fields: Row) -> Result<Id> {
        let row = self.insert_row(vc, fields).await?;
        self.row_id(&row)
    }

    /// Insert a row, then return it as an instance authorized by the load rules
    pub async fn insert_returning(&self, vc: &Vc, fields: Row) -> Result<Ent> {
        let row = self.insert_row(vc, fields).await?;
        self.authorize_load(vc, row).await
    }

    /// Insert unless a row with the same primary or unique key exists.
    /// Returns `None` when the row already existed.
    pub async fn insert_if_not_exists(&self, vc: &Vc, fields: Row) -> Result<Option<Id>> {
        match self.write_insert(vc, fields, OnConflict::DoNothing).await? {
            Some(row) => self.row_id(&row).map(Some),
            None => Ok(None),
        }
    }

    /// Apply `patch` to the row `id`. The update rules must allow both the
    /// current and the resulting row. Returns `false` if the row does not exist.
    pub async fn update(&self, vc: &Vc, id: &Id, patch: Row) -> Result<bool> {
        let schema = self.config.schema();
        let patch = schema.normalize_update(&patch)?;
        if let Some(column) = self
            .config
            .affinity()
            .column_names()
            .iter()
            .find(|c| patch.contains(c))
        {
            return Err(EntError::validation(
                self.name(),
                format!("shard affinity column {column} cannot be updated"),
            ));
        }

        let Some(island) = self.island_for_id(id) else {
            return Ok(false);
        };
        let Some(current) = self.select_by_id(island, id, true).await? else {
            return Ok(false);
        };
        let proposed = current.merge(&patch);
        self.authorize(vc, Operation::Update, &current).await?;
        self.authorize(vc, Operation::Update, &proposed).await?;

        if patch.is_empty() && !schema.has_auto_update() {
            return Ok(true);
        }
        let query = Query::Update {
            schema: self.config.schema_arc().clone(),
            id: id.clone(),
            set: patch,
        };
        let rows = self.engine.cluster().execute(island, true, &query).await?;
        Ok(!rows.is_empty())
    }

    /// Delete the row `id`. Returns `false` if the row does not exist.
    pub async fn delete(&self, vc: &Vc, id: &Id) -> Result<bool> {
        let Some(island) = self.island_for_id(id) else {
            return Ok(false);
        };
        let Some(current) = self.select_by_id(island, id, true).await? else {
            return Ok(false);
        };
        self.authorize(vc, Operation::Delete, &current).await?;

        let query = Query::Delete {
            schema: self.config.schema_arc().clone(),
            id: id.clone(),
        };
        let rows = self.engine.cluster().execute(island, true, &query).await?;
        Ok(!rows.is_empty())
    }

    async fn insert_row(&self, vc: &Vc, fields: Row) -> Result<Row> {
        self.write_insert(vc, fields, OnConflict::Fail)
            .await?
            .ok_or_else(|| {
                EntError::store(self.name(), "insert returned no row")
            })
    }

    /// Validate, authorize and write. `None` when `DoNothing` skipped a conflict.
    async fn write_insert(
        &self,
        vc: &Vc,
        fields: Row,
        on_conflict: OnConflict,
    ) -> Result<Option<Row>> {
        let row = self.config.schema().normalize_insert(&fields)?;
        let key = self.config.affinity().shard_key(self.name(), &row)?;
        self.authorize(vc, Operation::Insert, &row).await?;

        let island = self.engine.cluster().resolve_island(&key);
        debug!(entity = self.name(), island, ?on_conflict, "Inserting");
        let query = Query::Insert {
            schema: self.config.schema_arc().clone(),
            row,
            on_conflict,
        };
        let rows = self.engine.cluster().execute(island, true, &query).await?;
        Ok(rows.into_iter().next())
    }

    async fn authorize(&self, vc: &Vc, operation: Operation, row: &Row) -> Result<()> {
        privacy::authorize(
            &self.engine,
            vc,
            self.name(),
            operation,
            self.config.rules(operation),
            row,
        )
        .await?
        .ensure_allowed(self.name(), operation, vc)
    }

    /// Run the load rules and bind the instance to its (possibly inferred) VC
    async fn authorize_load(&self, vc: &Vc, row: Row) -> Result<Ent> {
        self.authorize(vc, Operation::Load, &row).await?;
        let id = self.row_id(&row)?;
        let vc = match self.config.infer_principal(&row) {
            Some(principal) => vc.derive_with_principal(principal),
            None => vc.clone(),
        };
        Ok(Ent::new(id, vc, row))
    }

    async fn select_by_id(&self, island: u32, id: &Id, for_write: bool) -> Result<Option<Row>> {
        let query = Query::Select {
            schema: self.config.schema_arc().clone(),
            filter: Row::new().with(ID_COLUMN, id),
            limit: Some(1),
        };
        let rows = self.engine.cluster().execute(island, for_write, &query).await?;
        Ok(rows.into_iter().next())
    }

    /// Island holding `id`: island 0 for global entities, else the island
    /// encoded in the id if it is part of the topology
    fn island_for_id(&self, id: &Id) -> Option<u32> {
        if self.config.affinity().is_global() {
            return Some(0);
        }
        id.island().filter(|no| self.engine.cluster().has_island(*no))
    }

    fn island_for_row(&self, row: &Row) -> Result<u32> {
        let key = self.config.affinity().shard_key(self.name(), row)?;
        Ok(self.engine.cluster().resolve_island(&key))
    }

    fn row_id(&self, row: &Row) -> Result<Id> {
        row.id().cloned().ok_or_else(|| {
            EntError::store(self.name(), "stored row has no id")
        })
    }
}

impl fmt::Debug for EntRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntRef").field("name", &self.name()).finish()
    }
}

fn describe_key(key: &Row) -> String {
    key.iter()
        .map(|(column, value)| match value.as_str() {
            Some(s) => format!("{column}={s}"),
            None => format!("{column}=<{}>", value.type_name()),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
