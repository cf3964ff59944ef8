//! SQL backend on a sea-orm connection pool
//!
//! Statements are built with sea-query and rendered for the connection's
//! backend. Ids are stored as `bigint`; shard-qualified ids are generated by
//! the database from a per-table sequence (`<table>_id_seq`), prefixed with
//! the node's island number.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{
    Alias, Asterisk, Expr, OnConflict as SqlOnConflict, Query as SqlQuery, SimpleExpr,
};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, QueryResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{Client, ClientFactory, OnConflict, Query};
use crate::config::NodeConfig;
use crate::error::{EntError, Result};
use crate::id::{Id, MAX_SEQUENCE};
use crate::schema::{AutoExpr, ColumnType, Schema, ID_COLUMN};
use crate::value::{Row, Value};

pub struct SqlClient {
    island: u32,
    node: NodeConfig,
    conn: OnceCell<DatabaseConnection>,
}

impl SqlClient {
    /// Create a client; the pool connects on first use
    pub fn new(island: u32, node: NodeConfig) -> Self {
        Self {
            island,
            node,
            conn: OnceCell::new(),
        }
    }

    async fn connection(&self) -> Result<&DatabaseConnection> {
        self.conn
            .get_or_try_init(|| async {
                info!(
                    "Connecting {} to database: {}",
                    self.node.name,
                    self.node.masked_url()
                );

                let mut opt = ConnectOptions::new(self.node.url.clone());
                opt.max_connections(self.node.max_connections)
                    .min_connections(self.node.min_connections)
                    .connect_timeout(Duration::from_secs(self.node.connect_timeout_secs))
                    .idle_timeout(Duration::from_secs(self.node.idle_timeout_secs))
                    .sqlx_logging(self.node.sql_logging)
                    .sqlx_logging_level(tracing::log::LevelFilter::Debug);

                Database::connect(opt).await.map_err(|e| self.map_err(e))
            })
            .await
    }

    fn map_err(&self, err: DbErr) -> EntError {
        match err {
            DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => {
                EntError::routing(self.island, format!("{}: {err}", self.node.name))
            }
            other => EntError::store(self.node.name.as_str(), other),
        }
    }

    fn auto_expr(&self, table: &str, expr: &AutoExpr) -> SimpleExpr {
        match expr {
            // The error branch must depend on s.n or Postgres folds it at plan time
            AutoExpr::ShardId => Expr::cust(format!(
                "(SELECT CASE WHEN s.n <= {max} THEN {base} + s.n \
                 ELSE ('{table}_id_seq exhausted at ' || s.n)::bigint END \
                 FROM (SELECT nextval('{table}_id_seq') AS n) s)",
                max = MAX_SEQUENCE,
                base = shard_id_base(self.island),
            )),
            AutoExpr::Now => Expr::cust("CURRENT_TIMESTAMP".to_string()),
            AutoExpr::Sql(sql) => Expr::cust(sql.clone()),
        }
    }

    fn column_type(&self, schema: &Schema, name: &str) -> Result<ColumnType> {
        schema.column(name).map(|c| c.ty).ok_or_else(|| {
            EntError::store(
                self.node.name.as_str(),
                format!("unknown column {name} in {}", schema.table()),
            )
        })
    }

    async fn run<S>(&self, schema: &Schema, statement: &S) -> Result<Vec<Row>>
    where
        S: sea_orm::StatementBuilder,
    {
        let conn = self.connection().await?;
        let statement = conn.get_database_backend().build(statement);
        debug!(node = %self.node.name, sql = %statement.sql, "Executing");

        let results = conn.query_all(statement).await.map_err(|e| self.map_err(e))?;
        results
            .iter()
            .map(|result| decode(schema, result).map_err(|e| self.map_err(e)))
            .collect()
    }

    async fn select(&self, schema: &Schema, filter: &Row, limit: Option<u64>) -> Result<Vec<Row>> {
        let mut select = SqlQuery::select();
        select.column(Asterisk).from(Alias::new(schema.table()));
        for (name, value) in filter.iter() {
            let column = Expr::col(Alias::new(name));
            select.and_where(if value.is_null() {
                column.is_null()
            } else {
                column.eq(bind(self.column_type(schema, name)?, value))
            });
        }
        if let Some(limit) = limit {
            select.limit(limit);
        }
        self.run(schema, &select).await
    }

    async fn insert(&self, schema: &Schema, row: &Row, on_conflict: OnConflict) -> Result<Vec<Row>> {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for column in schema.columns() {
            let value = match (row.get(&column.name), column.insert_default()) {
                (Some(value), _) => bind(column.ty, value),
                (None, Some(expr)) => self.auto_expr(schema.table(), expr),
                (None, None) => continue,
            };
            columns.push(Alias::new(column.name.as_str()));
            values.push(value);
        }

        let mut insert = SqlQuery::insert();
        insert
            .into_table(Alias::new(schema.table()))
            .columns(columns)
            .values(values)
            .map_err(|e| EntError::store(self.node.name.as_str(), e))?;
        if on_conflict == OnConflict::DoNothing {
            insert.on_conflict(SqlOnConflict::new().do_nothing().to_owned());
        }
        insert.returning_all();
        self.run(schema, &insert).await
    }

    async fn update(&self, schema: &Schema, id: &Id, set: &Row) -> Result<Vec<Row>> {
        let mut values = Vec::new();
        for (name, value) in set.iter() {
            values.push((Alias::new(name), bind(self.column_type(schema, name)?, value)));
        }
        for column in schema.columns() {
            if let Some(expr) = &column.auto_update {
                if !set.contains(&column.name) {
                    values.push((Alias::new(column.name.as_str()), self.auto_expr(schema.table(), expr)));
                }
            }
        }
        if values.is_empty() {
            return self
                .select(schema, &Row::new().with(ID_COLUMN, id), Some(1))
                .await;
        }

        let mut update = SqlQuery::update();
        update
            .table(Alias::new(schema.table()))
            .values(values)
            .and_where(Expr::col(Alias::new(ID_COLUMN)).eq(bind_id(id)))
            .returning_all();
        self.run(schema, &update).await
    }

    async fn delete(&self, schema: &Schema, id: &Id) -> Result<Vec<Row>> {
        let mut delete = SqlQuery::delete();
        delete
            .from_table(Alias::new(schema.table()))
            .and_where(Expr::col(Alias::new(ID_COLUMN)).eq(bind_id(id)))
            .returning_all();
        self.run(schema, &delete).await
    }
}

#[async_trait]
impl Client for SqlClient {
    fn name(&self) -> &str {
        &self.node.name
    }

    async fn execute(&self, query: &Query) -> Result<Vec<Row>> {
        match query {
            Query::Select { schema, filter, limit } => self.select(schema, filter, *limit).await,
            Query::Insert {
                schema,
                row,
                on_conflict,
            } => self.insert(schema, row, *on_conflict).await,
            Query::Update { schema, id, set } => self.update(schema, id, set).await,
            Query::Delete { schema, id } => self.delete(schema, id).await,
        }
    }

    async fn prewarm(&self) -> Result<()> {
        let started = Instant::now();
        let conn = self.connection().await?;
        conn.ping().await.map_err(|e| self.map_err(e))?;
        info!(
            "Node {} ready in {}ms",
            self.node.name,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn close(&self) {
        if let Some(conn) = self.conn.get() {
            if let Err(e) = conn.clone().close().await {
                warn!("Failed to close {}: {}", self.node.name, e);
            }
        }
    }
}

/// Builds a [`SqlClient`] per node
#[derive(Debug, Clone, Default)]
pub struct SqlClientFactory;

impl ClientFactory for SqlClientFactory {
    fn create(&self, island: u32, node: &NodeConfig) -> Result<Arc<dyn Client>> {
        Ok(Arc::new(SqlClient::new(island, node.clone())))
    }
}

/// Numeric value of `Id::compose(island, 0)`
fn shard_id_base(island: u32) -> i64 {
    (10_000 + i64::from(island)) * (MAX_SEQUENCE as i64 + 1)
}

/// Numeric ids bind as bigint, anything else as text
fn bind_id(id: &Id) -> SimpleExpr {
    match id.as_str().parse::<i64>() {
        Ok(n) => Expr::val(n).into(),
        Err(_) => Expr::val(id.as_str().to_string()).into(),
    }
}

fn bind(ty: ColumnType, value: &Value) -> SimpleExpr {
    match value {
        Value::Null => {
            let null: sea_orm::Value = match ty {
                ColumnType::Id | ColumnType::Integer => Option::<i64>::None.into(),
                ColumnType::String => Option::<String>::None.into(),
                ColumnType::Boolean => Option::<bool>::None.into(),
                ColumnType::Timestamp => Option::<DateTime<Utc>>::None.into(),
                ColumnType::Json => Option::<serde_json::Value>::None.into(),
            };
            Expr::val(null).into()
        }
        Value::Id(id) => bind_id(id),
        Value::String(s) if ty == ColumnType::Id => bind_id(&Id::new(s.as_str())),
        Value::String(s) => Expr::val(s.clone()).into(),
        Value::Bool(b) => Expr::val(*b).into(),
        Value::Int(n) => Expr::val(*n).into(),
        Value::Timestamp(ts) => Expr::val(*ts).into(),
        Value::Json(json) => Expr::val(json.clone()).into(),
    }
}

fn decode(schema: &Schema, result: &QueryResult) -> std::result::Result<Row, DbErr> {
    let mut row = Row::new();
    for column in schema.columns() {
        let name = column.name.as_str();
        let value = match column.ty {
            ColumnType::Id => Value::from(
                result
                    .try_get::<Option<i64>>("", name)?
                    .map(|n| Id::new(n.to_string())),
            ),
            ColumnType::String => Value::from(result.try_get::<Option<String>>("", name)?),
            ColumnType::Boolean => Value::from(result.try_get::<Option<bool>>("", name)?),
            ColumnType::Integer => Value::from(result.try_get::<Option<i64>>("", name)?),
            ColumnType::Timestamp => {
                Value::from(result.try_get::<Option<DateTime<Utc>>>("", name)?)
            }
            ColumnType::Json => {
                Value::from(result.try_get::<Option<serde_json::Value>>("", name)?)
            }
        };
        row.set(name, value);
    }
    Ok(row)
}
