//! Identity resolution
//!
//! Every report is attributed either to the device's anonymous id or to an
//! authenticated rewards member. The anonymous id is minted once per install
//! and persisted; the member comes from a non-expired session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{keys, LocalStore};
use crate::error::Result;
use crate::model::{AnonymousId, Owner, UserId};

/// The actor reports are attributed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous(AnonymousId),
    Member(UserId),
}

impl Identity {
    pub fn owner(&self) -> Owner {
        match self {
            Identity::Anonymous(id) => Owner::Anonymous(id.clone()),
            Identity::Member(id) => Owner::User(id.clone()),
        }
    }

    pub fn is_member(&self) -> bool {
        matches!(self, Identity::Member(_))
    }
}

/// Authenticated session as handed over by the auth provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: UserId,
    pub email: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    store: LocalStore,
    anonymous: Arc<Mutex<Option<AnonymousId>>>,
}

impl IdentityResolver {
    pub fn new(store: LocalStore) -> Self {
        Self {
            store,
            anonymous: Arc::new(Mutex::new(None)),
        }
    }

    /// The device's anonymous id, created on first use.
    ///
    /// A new id is minted only when none is stored (or the stored one is
    /// corrupt). A failed read is an error so a transient database problem
    /// never replaces the persisted id.
    pub async fn anonymous_id(&self) -> Result<AnonymousId> {
        let mut cached = self.anonymous.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let id = match self.store.try_get::<AnonymousId>(keys::ANONYMOUS_ID).await? {
            Some(id) => id,
            None => {
                let id = AnonymousId(Uuid::new_v4().to_string());
                log::info!("Created anonymous device id {}", id);
                self.store.set(keys::ANONYMOUS_ID, &id).await?;
                id
            }
        };
        *cached = Some(id.clone());
        Ok(id)
    }

    /// The stored session if it has not expired
    pub async fn session(&self) -> Result<Option<Session>> {
        Ok(self
            .store
            .try_get::<Session>(keys::SESSION)
            .await?
            .filter(|s| s.is_valid_at(Utc::now())))
    }

    /// Resolve the actor new work is attributed to
    pub async fn current(&self) -> Result<Identity> {
        match self.session().await? {
            Some(session) => Ok(Identity::Member(session.user_id)),
            None => Ok(Identity::Anonymous(self.anonymous_id().await?)),
        }
    }

    pub async fn set_session(&self, session: &Session) -> Result<()> {
        log::info!("Storing session for member {}", session.user_id);
        self.store.set(keys::SESSION, session).await
    }

    pub async fn clear_session(&self) -> Result<()> {
        log::info!("Clearing session");
        self.store.remove(keys::SESSION).await
    }
}
