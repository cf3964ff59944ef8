//! Shared fixtures: a three-island in-memory cluster and a small forum schema

#![allow(dead_code)]

use async_trait::async_trait;
use ent::privacy::{Always, CanReadOutgoingEdge, OutgoingEdgePointsToVc};
use ent::{
    AutoExpr, Cluster, ClusterConfig, Column, ColumnType, Engine, EngineBuilder, EntConfig,
    EntError, Id, IslandConfig, Loggers, MemoryClientFactory, NodeConfig, Predicate, Result, Row,
    Rule, Schema, ShardAffinity, SwallowedErrorEvent, Vc, GLOBAL_SHARD,
};
use std::sync::{Arc, Mutex};

pub const ISLANDS: [u32; 3] = [0, 1, 2];

pub struct Fixture {
    pub engine: Engine,
    pub factory: Arc<MemoryClientFactory>,
    pub swallowed: Arc<Mutex<Vec<SwallowedErrorEvent>>>,
}

impl Fixture {
    pub fn swallowed_places(&self) -> Vec<String> {
        self.swallowed
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.place.clone())
            .collect()
    }

    pub fn row_count(&self, island: u32, table: &str) -> usize {
        self.factory.store(island).row_count(table)
    }

    /// Make a node unreachable
    pub fn take_down(&self, node: &str) {
        self.factory.client(node).expect("node created").set_down(true);
    }
}

pub fn cluster_config() -> ClusterConfig {
    ClusterConfig {
        islands: ISLANDS
            .iter()
            .map(|&no| IslandConfig {
                no,
                nodes: vec![NodeConfig::new(format!("island{no}-master"), "memory://")],
            })
            .collect(),
        read_from_replicas: false,
        node_down_cooldown_ms: 60_000,
    }
}

pub fn builder() -> (EngineBuilder, Arc<MemoryClientFactory>, Arc<Mutex<Vec<SwallowedErrorEvent>>>) {
    builder_with(cluster_config())
}

pub fn builder_with(
    config: ClusterConfig,
) -> (EngineBuilder, Arc<MemoryClientFactory>, Arc<Mutex<Vec<SwallowedErrorEvent>>>) {
    let swallowed = Arc::new(Mutex::new(Vec::new()));
    let sink = swallowed.clone();
    let loggers = Loggers::new().with_swallowed_error(move |e| sink.lock().unwrap().push(e.clone()));

    let factory = Arc::new(MemoryClientFactory::new());
    let cluster = Cluster::open(config, factory.clone(), loggers).unwrap();
    (Engine::builder(Arc::new(cluster)), factory, swallowed)
}

pub fn setup(configs: Vec<EntConfig>) -> Fixture {
    setup_with(cluster_config(), configs)
}

pub fn setup_with(config: ClusterConfig, configs: Vec<EntConfig>) -> Fixture {
    let (mut builder, factory, swallowed) = builder_with(config);
    for config in configs {
        builder = builder.register(config);
    }
    Fixture {
        engine: builder.build().unwrap(),
        factory,
        swallowed,
    }
}

/// users, topics, comments and invites with their usual rules
pub fn forum() -> Fixture {
    setup(vec![users(), topics(), comments(), invites()])
}

pub fn vc_of(id: &Id) -> Vc {
    Vc::guest().derive_with_principal(id.clone())
}

pub fn omni() -> Vc {
    Vc::new_omniscient_dangerous()
}

pub fn users_schema() -> Schema {
    Schema::new(
        "users",
        vec![
            Column::primary_id(),
            Column::new("email", ColumnType::String),
            Column::new("is_admin", ColumnType::Boolean).nullable(),
        ],
        &[&["email"]],
    )
    .unwrap()
}

pub fn users() -> EntConfig {
    EntConfig::new(users_schema(), GLOBAL_SHARD)
        .infer_principal_from("id")
        .load_rules(vec![Rule::allow_if(OutgoingEdgePointsToVc::new("id"))])
        .insert_rules(vec![Rule::allow_if(Always(true))])
}

pub fn topics() -> EntConfig {
    let schema = Schema::new(
        "topics",
        vec![
            Column::primary_id(),
            Column::new("created_at", ColumnType::Timestamp).auto_insert(AutoExpr::Now),
            Column::new("updated_at", ColumnType::Timestamp).auto_update(AutoExpr::Now),
            Column::new("slug", ColumnType::String),
            Column::new("creator_id", ColumnType::Id),
            Column::new("subject", ColumnType::String).nullable(),
        ],
        &[&["slug"]],
    )
    .unwrap();
    EntConfig::new(schema, GLOBAL_SHARD)
        .load_rules(vec![Rule::allow_if(OutgoingEdgePointsToVc::new("creator_id"))])
        .insert_rules(vec![Rule::allow_if(OutgoingEdgePointsToVc::new("creator_id"))])
}

pub fn comments() -> EntConfig {
    let schema = Schema::new(
        "comments",
        vec![
            Column::primary_id(),
            Column::new("created_at", ColumnType::Timestamp).auto_insert(AutoExpr::Now),
            Column::new("topic_id", ColumnType::Id),
            Column::new("creator_id", ColumnType::Id),
            Column::new("message", ColumnType::String),
        ],
        &[],
    )
    .unwrap();
    EntConfig::new(schema, ShardAffinity::columns(&["topic_id"]))
        .load_rules(vec![
            Rule::allow_if(CanReadOutgoingEdge::new("topic_id", "topics")),
            Rule::allow_if(OutgoingEdgePointsToVc::new("creator_id")),
        ])
        .insert_rules(vec![
            Rule::require(OutgoingEdgePointsToVc::new("creator_id")),
            Rule::allow_if(CanReadOutgoingEdge::new("topic_id", "topics")),
        ])
}

/// Sharded by a plain string column. `code` is unique within an island only.
pub fn invites() -> EntConfig {
    let schema = Schema::new(
        "invites",
        vec![
            Column::primary_id(),
            Column::new("org", ColumnType::String),
            Column::new("code", ColumnType::String),
        ],
        &[&["code"]],
    )
    .unwrap();
    EntConfig::new(schema, ShardAffinity::columns(&["org"]))
        .load_rules(vec![Rule::allow_if(Always(true))])
        .insert_rules(vec![Rule::allow_if(Always(true))])
}

pub async fn create_user(engine: &Engine, email: &str) -> Id {
    engine
        .ent("users")
        .unwrap()
        .insert(&omni(), Row::new().with("email", email).with("is_admin", false))
        .await
        .unwrap()
}

/// Panics when evaluated
pub struct Unreachable;

#[async_trait]
impl Predicate for Unreachable {
    fn name(&self) -> String {
        "Unreachable".to_string()
    }

    async fn check(&self, _engine: &Engine, _vc: &Vc, _row: &Row) -> Result<bool> {
        panic!("predicate must not be evaluated");
    }
}

/// Fails with the error built by the closure
pub struct Failing(pub fn() -> EntError);

#[async_trait]
impl Predicate for Failing {
    fn name(&self) -> String {
        "Failing".to_string()
    }

    async fn check(&self, _engine: &Engine, _vc: &Vc, _row: &Row) -> Result<bool> {
        Err((self.0)())
    }
}
