//! Built-in predicates

use async_trait::async_trait;
use std::future::Future;

use super::Predicate;
use crate::engine::{Engine, Registry};
use crate::ent::EntConfig;
use crate::error::{EntError, Result};
use crate::schema::ID_COLUMN;
use crate::value::{Row, Value};
use crate::vc::Vc;

/// `row[field]` equals the VC's principal
#[derive(Debug, Clone)]
pub struct OutgoingEdgePointsToVc {
    field: String,
}

impl OutgoingEdgePointsToVc {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

#[async_trait]
impl Predicate for OutgoingEdgePointsToVc {
    fn name(&self) -> String {
        format!("OutgoingEdgePointsToVc({})", self.field)
    }

    async fn check(&self, _engine: &Engine, vc: &Vc, row: &Row) -> Result<bool> {
        let Some(principal) = vc.principal().id() else {
            return Ok(false);
        };
        Ok(row.get(&self.field).and_then(Value::as_str) == Some(principal.as_str()))
    }

    fn validate(&self, owner: &EntConfig, _registry: &Registry) -> Result<()> {
        require_column(owner, &self.field, &self.name())
    }
}

/// The `target` row referenced by `row[field]` is loadable with the same VC
#[derive(Debug, Clone)]
pub struct CanReadOutgoingEdge {
    field: String,
    target: String,
}

impl CanReadOutgoingEdge {
    pub fn new(field: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            target: target.into(),
        }
    }
}

#[async_trait]
impl Predicate for CanReadOutgoingEdge {
    fn name(&self) -> String {
        format!("CanReadOutgoingEdge({} -> {})", self.field, self.target)
    }

    async fn check(&self, engine: &Engine, vc: &Vc, row: &Row) -> Result<bool> {
        let Some(id) = row.get_id(&self.field) else {
            return Ok(false);
        };
        let target = engine.ent(&self.target)?;
        Ok(target.load_nullable(vc, id).await?.is_some())
    }

    fn validate(&self, owner: &EntConfig, registry: &Registry) -> Result<()> {
        require_column(owner, &self.field, &self.name())?;
        require_entity(registry, &self.target, &self.name()).map(|_| ())
    }
}

/// A `target` row with `vc_field` = principal and `fk_field` = this row's id
/// exists and is readable with the same VC.
///
/// `(vc_field, fk_field)` must be a unique key of `target`, so the lookup is
/// a single-row load.
#[derive(Debug, Clone)]
pub struct IncomingEdgeFromVcExists {
    target: String,
    vc_field: String,
    fk_field: String,
}

impl IncomingEdgeFromVcExists {
    pub fn new(
        target: impl Into<String>,
        vc_field: impl Into<String>,
        fk_field: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            vc_field: vc_field.into(),
            fk_field: fk_field.into(),
        }
    }
}

#[async_trait]
impl Predicate for IncomingEdgeFromVcExists {
    fn name(&self) -> String {
        format!(
            "IncomingEdgeFromVcExists({}.{} = vc, {}.{} = id)",
            self.target, self.vc_field, self.target, self.fk_field
        )
    }

    async fn check(&self, engine: &Engine, vc: &Vc, row: &Row) -> Result<bool> {
        let (Some(principal), Some(id)) = (vc.principal().id(), row.id()) else {
            return Ok(false);
        };
        let key = Row::new()
            .with(self.vc_field.as_str(), principal)
            .with(self.fk_field.as_str(), id);
        let target = engine.ent(&self.target)?;
        Ok(target.load_by_nullable(vc, key).await?.is_some())
    }

    fn validate(&self, _owner: &EntConfig, registry: &Registry) -> Result<()> {
        let target = require_entity(registry, &self.target, &self.name())?;
        if !target
            .schema()
            .is_unique_key(&[self.vc_field.as_str(), self.fk_field.as_str()])
        {
            return Err(EntError::config(format!(
                "{}: ({}, {}) is not a unique key of {}",
                self.name(),
                self.vc_field,
                self.fk_field,
                self.target
            )));
        }
        Ok(())
    }
}

/// The VC has no principal
#[derive(Debug, Clone, Default)]
pub struct VcIsGuest;

#[async_trait]
impl Predicate for VcIsGuest {
    fn name(&self) -> String {
        "VcIsGuest".to_string()
    }

    async fn check(&self, _engine: &Engine, vc: &Vc, _row: &Row) -> Result<bool> {
        Ok(vc.is_guest())
    }
}

/// Constant predicate
#[derive(Debug, Clone)]
pub struct Always(pub bool);

#[async_trait]
impl Predicate for Always {
    fn name(&self) -> String {
        format!("Always({})", self.0)
    }

    async fn check(&self, _engine: &Engine, _vc: &Vc, _row: &Row) -> Result<bool> {
        Ok(self.0)
    }
}

/// Predicate backed by an async closure
pub struct FnPredicate<F> {
    name: String,
    f: F,
}

/// Wrap an async closure `(Engine, Vc, Row) -> Result<bool>` as a predicate
pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> FnPredicate<F>
where
    F: Fn(Engine, Vc, Row) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    FnPredicate {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> Predicate for FnPredicate<F>
where
    F: Fn(Engine, Vc, Row) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn check(&self, engine: &Engine, vc: &Vc, row: &Row) -> Result<bool> {
        (self.f)(engine.clone(), vc.clone(), row.clone()).await
    }
}

fn require_column(owner: &EntConfig, column: &str, predicate: &str) -> Result<()> {
    if column != ID_COLUMN && owner.schema().column(column).is_none() {
        return Err(EntError::config(format!(
            "{}: {predicate} references unknown column {column}",
            owner.name()
        )));
    }
    Ok(())
}

fn require_entity<'a>(registry: &'a Registry, name: &str, predicate: &str) -> Result<&'a EntConfig> {
    registry
        .get(name)
        .ok_or_else(|| EntError::config(format!("{predicate} references unregistered entity {name}")))
}
