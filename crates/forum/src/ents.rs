//! Forum entity types and their privacy rules

use ent::privacy::{
    from_fn, Always, CanReadOutgoingEdge, IncomingEdgeFromVcExists, OutgoingEdgePointsToVc,
};
use ent::{
    AutoExpr, Column, ColumnType, Engine, EngineBuilder, EntConfig, Result, Rule, Schema,
    ShardAffinity, Vc, GLOBAL_SHARD,
};

pub const USERS: &str = "users";
pub const TOPICS: &str = "topics";
pub const COMMENTS: &str = "comments";
pub const ORGANIZATIONS: &str = "organizations";
pub const ORGANIZATION_USERS: &str = "organization_users";

/// Register every forum entity type
pub fn register(builder: EngineBuilder) -> Result<EngineBuilder> {
    Ok(builder
        .register(users()?)
        .register(topics()?)
        .register(comments()?)
        .register(organizations()?)
        .register(organization_users()?))
}

/// Loaded users act as themselves
pub fn users() -> Result<EntConfig> {
    let schema = Schema::new(
        USERS,
        vec![
            Column::primary_id(),
            Column::new("created_at", ColumnType::Timestamp).auto_insert(AutoExpr::Now),
            Column::new("email", ColumnType::String),
            Column::new("is_admin", ColumnType::Boolean),
        ],
        &[&["email"]],
    )?;
    Ok(EntConfig::new(schema, GLOBAL_SHARD)
        .infer_principal_from("id")
        .load_rules(vec![
            Rule::allow_if(OutgoingEdgePointsToVc::new("id")),
            Rule::allow_if(from_fn("VcIsAdmin", |engine, vc, _row| {
                vc_is_admin(engine, vc)
            })),
        ]))
}

pub fn topics() -> Result<EntConfig> {
    let schema = Schema::new(
        TOPICS,
        vec![
            Column::primary_id(),
            Column::new("created_at", ColumnType::Timestamp).auto_insert(AutoExpr::Now),
            Column::new("updated_at", ColumnType::Timestamp).auto_update(AutoExpr::Now),
            Column::new("slug", ColumnType::String),
            Column::new("creator_id", ColumnType::Id),
            Column::new("subject", ColumnType::String).nullable(),
        ],
        &[&["slug"]],
    )?;
    Ok(EntConfig::new(schema, GLOBAL_SHARD)
        .infer_principal_from("creator_id")
        .load_rules(vec![Rule::allow_if(OutgoingEdgePointsToVc::new("creator_id"))])
        .insert_rules(vec![Rule::allow_if(OutgoingEdgePointsToVc::new("creator_id"))]))
}

/// Comments live on the island of their topic
pub fn comments() -> Result<EntConfig> {
    let schema = Schema::new(
        COMMENTS,
        vec![
            Column::primary_id(),
            Column::new("created_at", ColumnType::Timestamp).auto_insert(AutoExpr::Now),
            Column::new("topic_id", ColumnType::Id),
            Column::new("creator_id", ColumnType::Id),
            Column::new("message", ColumnType::String),
        ],
        &[],
    )?;
    Ok(EntConfig::new(schema, ShardAffinity::columns(&["topic_id"]))
        .infer_principal_from("creator_id")
        .load_rules(vec![
            Rule::allow_if(CanReadOutgoingEdge::new("topic_id", TOPICS)),
            Rule::allow_if(OutgoingEdgePointsToVc::new("creator_id")),
        ])
        .insert_rules(vec![
            Rule::require(OutgoingEdgePointsToVc::new("creator_id")),
            Rule::allow_if(Always(true)),
        ]))
}

/// Visible to members only
pub fn organizations() -> Result<EntConfig> {
    let schema = Schema::new(
        ORGANIZATIONS,
        vec![
            Column::primary_id(),
            Column::new("created_at", ColumnType::Timestamp).auto_insert(AutoExpr::Now),
            Column::new("name", ColumnType::String),
        ],
        &[],
    )?;
    Ok(EntConfig::new(schema, GLOBAL_SHARD).load_rules(vec![Rule::allow_if(
        IncomingEdgeFromVcExists::new(ORGANIZATION_USERS, "user_id", "organization_id"),
    )]))
}

pub fn organization_users() -> Result<EntConfig> {
    let schema = Schema::new(
        ORGANIZATION_USERS,
        vec![
            Column::primary_id(),
            Column::new("organization_id", ColumnType::Id),
            Column::new("user_id", ColumnType::Id),
        ],
        &[&["organization_id", "user_id"]],
    )?;
    Ok(EntConfig::new(schema, GLOBAL_SHARD)
        .infer_principal_from("user_id")
        .load_rules(vec![Rule::allow_if(CanReadOutgoingEdge::new("user_id", USERS))]))
}

/// The VC's own user has the admin flag set
async fn vc_is_admin(engine: Engine, vc: Vc) -> Result<bool> {
    let Some(id) = vc.principal().id().cloned() else {
        return Ok(false);
    };
    let user = engine.ent(USERS)?.load_x(&vc, &id).await?;
    Ok(user.row().get_bool("is_admin") == Some(true))
}
