//! Viewer context (VC): who is acting.
//!
//! A [`Vc`] carries the acting [`Principal`] and the omniscient flag which
//! makes the privacy engine skip rule evaluation entirely.
//!
//! # Immutability
//!
//! VCs are immutable values. [`Vc::derive_with_principal`] and
//! [`Vc::to_omni_dangerous`] return new VCs and never modify the original.
//!
//! # Entry points
//!
//! - [`Vc::guest`] (also [`Default`]): the most restrictive principal. Every
//!   request enters the system with this.
//! - [`Vc::new_omniscient_dangerous`] / [`Vc::to_omni_dangerous`]: bypass
//!   every privacy rule. The awkward names are deliberate so bypasses stand
//!   out in review. Only trusted server-side code may call them, never with
//!   anything taken from a request body or URL.
//!
//! `Vc` deliberately does not implement `Deserialize`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::Id;

/// The identity a VC claims to act as
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    /// No identity
    Guest,
    /// A row id, usually of a user entity
    Id(Id),
}

impl Principal {
    pub fn is_guest(&self) -> bool {
        matches!(self, Principal::Guest)
    }

    pub fn id(&self) -> Option<&Id> {
        match self {
            Principal::Guest => None,
            Principal::Id(id) => Some(id),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Guest => write!(f, "guest"),
            Principal::Id(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vc {
    principal: Principal,
    omniscient: bool,
}

impl Vc {
    /// Guest VC: no identity, no bypass
    pub fn guest() -> Self {
        Self {
            principal: Principal::Guest,
            omniscient: false,
        }
    }

    /// Omniscient guest VC. Privacy rules are not evaluated for it.
    pub fn new_omniscient_dangerous() -> Self {
        Self {
            principal: Principal::Guest,
            omniscient: true,
        }
    }

    /// Omniscient copy of this VC, keeping the principal
    pub fn to_omni_dangerous(&self) -> Self {
        Self {
            principal: self.principal.clone(),
            omniscient: true,
        }
    }

    /// New non-omniscient VC acting as `id`
    pub fn derive_with_principal(&self, id: Id) -> Self {
        Self {
            principal: Principal::Id(id),
            omniscient: false,
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn is_omniscient(&self) -> bool {
        self.omniscient
    }

    pub fn is_guest(&self) -> bool {
        self.principal.is_guest()
    }
}

impl Default for Vc {
    fn default() -> Self {
        Self::guest()
    }
}

impl fmt::Display for Vc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.omniscient {
            write!(f, "vc:{}:omni", self.principal)
        } else {
            write!(f, "vc:{}", self.principal)
        }
    }
}
