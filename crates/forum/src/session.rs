//! Resolve the VC of an incoming request from its session

use ent::{Engine, EntError, Id, Result, Row, Vc};
use tracing::{debug, info};

use crate::ents::USERS;

/// Identity established by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    Anonymous,
    Email(String),
}

impl Session {
    pub fn email(email: impl Into<String>) -> Self {
        Self::Email(email.into())
    }
}

/// VC for a request. Signed-in users that have no row yet are created.
pub async fn server_vc(engine: &Engine, session: &Session) -> Result<Vc> {
    let guest = Vc::guest();
    let Session::Email(email) = session else {
        return Ok(guest);
    };

    let users = engine.ent(USERS)?;
    let omni = guest.to_omni_dangerous();
    let key = Row::new().with("email", email.as_str());

    let id = match users.load_by_nullable(&omni, key.clone()).await? {
        Some(user) => user.id().clone(),
        None => {
            let fields = key.clone().with("is_admin", false);
            match users.insert_if_not_exists(&omni, fields).await? {
                Some(id) => {
                    info!("Created user {} for {}", id, email);
                    id
                }
                // Concurrent request created it first
                None => users.load_by_x(&omni, key).await?.id().clone(),
            }
        }
    };
    debug!(%id, "Resolved session");
    Ok(guest.derive_with_principal(id))
}

/// The principal id of a signed-in VC
pub fn principal_id(vc: &Vc) -> Result<&Id> {
    vc.principal()
        .id()
        .ok_or_else(|| EntError::validation(USERS, "request is not signed in"))
}
