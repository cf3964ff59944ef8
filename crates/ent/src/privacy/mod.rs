//! Privacy rule engine
//!
//! Rules are evaluated strictly in declaration order against a VC and a
//! candidate row:
//!
//! - `AllowIf(p)`: `p` true makes the running verdict `allow`; later rules
//!   are still evaluated and may veto.
//! - `Require(p)`: `p` false denies immediately.
//! - `Deny(p)`: `p` true denies immediately.
//!
//! The running verdict starts as `deny`, so an empty rule list never allows.
//! An omniscient VC is allowed without evaluating anything.
//!
//! Predicates may load other entities through the [`Engine`] with the same
//! VC. Logical failures inside a predicate (not found, access denied,
//! invalid key) count as `false` and are reported to the swallowed-error
//! logger; routing, store and configuration errors propagate.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::engine::{Engine, Registry};
use crate::ent::EntConfig;
use crate::error::{EntError, Result};
use crate::logging::SwallowedErrorEvent;
use crate::value::Row;
use crate::vc::Vc;

pub mod predicates;

pub use predicates::{
    from_fn, Always, CanReadOutgoingEdge, FnPredicate, IncomingEdgeFromVcExists,
    OutgoingEdgePointsToVc, VcIsGuest,
};

/// Operation a rule list guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Load,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Load => "load",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A boolean check over a VC and a (possibly partial) row
#[async_trait]
pub trait Predicate: Send + Sync {
    /// Human-readable description, used in denial messages
    fn name(&self) -> String;

    async fn check(&self, engine: &Engine, vc: &Vc, row: &Row) -> Result<bool>;

    /// Build-time check of the entity types and columns the predicate references
    fn validate(&self, _owner: &EntConfig, _registry: &Registry) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub enum Rule {
    AllowIf(Arc<dyn Predicate>),
    Require(Arc<dyn Predicate>),
    Deny(Arc<dyn Predicate>),
}

impl Rule {
    pub fn allow_if(predicate: impl Predicate + 'static) -> Self {
        Self::AllowIf(Arc::new(predicate))
    }

    pub fn require(predicate: impl Predicate + 'static) -> Self {
        Self::Require(Arc::new(predicate))
    }

    pub fn deny(predicate: impl Predicate + 'static) -> Self {
        Self::Deny(Arc::new(predicate))
    }

    pub fn predicate(&self) -> &dyn Predicate {
        match self {
            Self::AllowIf(p) | Self::Require(p) | Self::Deny(p) => p.as_ref(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllowIf(p) => write!(f, "AllowIf({})", p.name()),
            Self::Require(p) => write!(f, "Require({})", p.name()),
            Self::Deny(p) => write!(f, "Deny({})", p.name()),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// Outcome of [`authorize`] with the rule that decided it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: String,
}

impl Decision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Allow,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Deny,
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    /// `Ok(())` when allowed, an authorization error otherwise
    pub fn ensure_allowed(self, entity: &str, operation: Operation, vc: &Vc) -> Result<()> {
        match self.verdict {
            Verdict::Allow => Ok(()),
            Verdict::Deny => Err(EntError::authorization(
                entity,
                operation,
                vc.principal(),
                self.reason,
            )),
        }
    }
}

/// Evaluate `rules` for `vc` against `row`
pub async fn authorize(
    engine: &Engine,
    vc: &Vc,
    entity: &str,
    operation: Operation,
    rules: &[Rule],
    row: &Row,
) -> Result<Decision> {
    if vc.is_omniscient() {
        return Ok(Decision::allow("omniscient vc"));
    }
    if rules.is_empty() {
        return Ok(Decision::deny(format!("no {operation} rules declared")));
    }

    let mut allowed_by: Option<String> = None;
    for rule in rules {
        match rule {
            Rule::AllowIf(predicate) => {
                // A later AllowIf cannot change an allow verdict
                if allowed_by.is_some() {
                    continue;
                }
                if evaluate(engine, vc, entity, operation, predicate.as_ref(), row).await? {
                    allowed_by = Some(rule.to_string());
                }
            }
            Rule::Require(predicate) => {
                if !evaluate(engine, vc, entity, operation, predicate.as_ref(), row).await? {
                    return Ok(Decision::deny(format!("{rule} failed")));
                }
            }
            Rule::Deny(predicate) => {
                if evaluate(engine, vc, entity, operation, predicate.as_ref(), row).await? {
                    return Ok(Decision::deny(format!("{rule} matched")));
                }
            }
        }
    }

    Ok(match allowed_by {
        Some(rule) => Decision::allow(rule),
        None => Decision::deny("no AllowIf rule matched"),
    })
}

async fn evaluate(
    engine: &Engine,
    vc: &Vc,
    entity: &str,
    operation: Operation,
    predicate: &dyn Predicate,
    row: &Row,
) -> Result<bool> {
    match predicate.check(engine, vc, row).await {
        Ok(result) => Ok(result),
        Err(e) if e.is_swallowable_in_predicate() => {
            engine.loggers().swallowed_error(&SwallowedErrorEvent {
                place: format!("privacy:{operation}:{}", predicate.name()),
                entity: entity.to_string(),
                error: e.to_string(),
            });
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
