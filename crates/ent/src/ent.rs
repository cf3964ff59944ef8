//! Entity type configuration and entity instances

use std::fmt;
use std::sync::Arc;

use crate::affinity::ShardAffinity;
use crate::error::{EntError, Result};
use crate::id::Id;
use crate::privacy::{Operation, Rule};
use crate::schema::{AutoExpr, Schema};
use crate::value::{Row, Value};
use crate::vc::Vc;

/// Computes the principal a loaded row acts as
pub type InferPrincipalFn = Arc<dyn Fn(&Row) -> Option<Id> + Send + Sync>;

/// How the VC of a loaded instance is derived
#[derive(Clone, Default)]
pub enum InferPrincipal {
    /// Keep the VC used for the call
    #[default]
    None,
    /// The principal is the id stored in this column (`id` for users)
    Column(String),
    Custom(InferPrincipalFn),
}

impl fmt::Debug for InferPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Column(column) => write!(f, "Column({column})"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Everything the engine needs to know about one entity type
#[derive(Debug, Clone)]
pub struct EntConfig {
    name: String,
    schema: Arc<Schema>,
    affinity: ShardAffinity,
    infer_principal: InferPrincipal,
    privacy_load: Vec<Rule>,
    privacy_insert: Vec<Rule>,
    privacy_update: Option<Vec<Rule>>,
    privacy_delete: Option<Vec<Rule>>,
}

impl EntConfig {
    /// Entity type named after its table, with no privacy rules yet
    pub fn new(schema: Schema, affinity: ShardAffinity) -> Self {
        Self {
            name: schema.table().to_string(),
            schema: Arc::new(schema),
            affinity,
            infer_principal: InferPrincipal::None,
            privacy_load: Vec::new(),
            privacy_insert: Vec::new(),
            privacy_update: None,
            privacy_delete: None,
        }
    }

    pub fn infer_principal_from(mut self, column: impl Into<String>) -> Self {
        self.infer_principal = InferPrincipal::Column(column.into());
        self
    }

    pub fn infer_principal_with(
        mut self,
        f: impl Fn(&Row) -> Option<Id> + Send + Sync + 'static,
    ) -> Self {
        self.infer_principal = InferPrincipal::Custom(Arc::new(f));
        self
    }

    pub fn load_rules(mut self, rules: Vec<Rule>) -> Self {
        self.privacy_load = rules;
        self
    }

    pub fn insert_rules(mut self, rules: Vec<Rule>) -> Self {
        self.privacy_insert = rules;
        self
    }

    /// Defaults to the insert rules
    pub fn update_rules(mut self, rules: Vec<Rule>) -> Self {
        self.privacy_update = Some(rules);
        self
    }

    /// Defaults to the update rules
    pub fn delete_rules(mut self, rules: Vec<Rule>) -> Self {
        self.privacy_delete = Some(rules);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(crate) fn schema_arc(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn affinity(&self) -> &ShardAffinity {
        &self.affinity
    }

    /// Rules guarding `operation`, with update/delete defaults applied
    pub fn rules(&self, operation: Operation) -> &[Rule] {
        match operation {
            Operation::Load => &self.privacy_load,
            Operation::Insert => &self.privacy_insert,
            Operation::Update => self.privacy_update.as_deref().unwrap_or(self.privacy_insert.as_slice()),
            Operation::Delete => match &self.privacy_delete {
                Some(rules) => rules,
                None => self.rules(Operation::Update),
            },
        }
    }

    pub fn all_rules(&self) -> impl Iterator<Item = &Rule> {
        self.privacy_load
            .iter()
            .chain(self.privacy_insert.iter())
            .chain(self.privacy_update.iter().flatten())
            .chain(self.privacy_delete.iter().flatten())
    }

    /// Principal a loaded row acts as, if the entity declares one
    pub fn infer_principal(&self, row: &Row) -> Option<Id> {
        match &self.infer_principal {
            InferPrincipal::None => None,
            InferPrincipal::Column(column) => row.get(column).and_then(|value| match value {
                Value::Id(id) => Some(id.clone()),
                Value::String(s) => Some(Id::new(s.as_str())),
                _ => None,
            }),
            InferPrincipal::Custom(f) => f(row),
        }
    }

    /// Consistency of schema, affinity and principal inference
    pub(crate) fn validate(&self) -> Result<()> {
        let invalid = |message: String| EntError::config(format!("{}: {message}", self.name));

        for column in self.affinity.column_names() {
            if self.schema.column(column).is_none() {
                return Err(invalid(format!(
                    "shard affinity column {column} is not declared"
                )));
            }
        }
        if !self.affinity.is_global() {
            let shard_id = self
                .schema
                .id_column()
                .and_then(|c| c.auto_insert.as_ref())
                .is_some_and(|expr| *expr == AutoExpr::ShardId);
            if !shard_id {
                return Err(invalid(
                    "sharded entities must generate their id with AutoExpr::ShardId".to_string(),
                ));
            }
        }
        if let InferPrincipal::Column(column) = &self.infer_principal {
            if self.schema.column(column).is_none() {
                return Err(invalid(format!(
                    "principal inference column {column} is not declared"
                )));
            }
        }
        Ok(())
    }
}

/// An authorized, immutable snapshot of one row and the VC it is bound to
#[derive(Debug, Clone, PartialEq)]
pub struct Ent {
    id: Id,
    vc: Vc,
    row: Row,
}

impl Ent {
    pub(crate) fn new(id: Id, vc: Vc, row: Row) -> Self {
        Self { id, vc, row }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    /// The VC the instance is bound to, derived by principal inference when declared
    pub fn vc(&self) -> &Vc {
        &self.vc
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.row.get(column)
    }
}
