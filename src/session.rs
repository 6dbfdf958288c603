use std::sync::Mutex;

use thiserror::Error;
use tracing::info;

use crate::alarm::lock_unpoisoned;
use crate::alarm::model::OwnerId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no owner is logged in")]
    NoActiveOwner,
}

/// Answers "on whose behalf is this command?" for callers that carry no
/// identity of their own, like the voice loop.
pub trait OwnerResolver: Send + Sync {
    fn resolve(&self) -> Option<OwnerId>;
}

/// Process-wide "current active owner".
///
/// Login replaces whoever was there; there is exactly zero or one owner at a
/// time.
#[derive(Debug, Default)]
pub struct OwnerSessionTracker {
    current: Mutex<Option<OwnerId>>,
}

impl OwnerSessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `owner_id` current and returns the owner it replaced.
    pub fn login(&self, owner_id: OwnerId) -> Option<OwnerId> {
        let mut current = lock_unpoisoned(&self.current);
        info!(owner_id = %owner_id, "owner logged in");
        current.replace(owner_id)
    }

    pub fn logout(&self) -> Result<OwnerId, SessionError> {
        let owner_id = lock_unpoisoned(&self.current)
            .take()
            .ok_or(SessionError::NoActiveOwner)?;
        info!(owner_id = %owner_id, "owner logged out");
        Ok(owner_id)
    }

    pub fn current(&self) -> Option<OwnerId> {
        lock_unpoisoned(&self.current).clone()
    }
}

impl OwnerResolver for OwnerSessionTracker {
    fn resolve(&self) -> Option<OwnerId> {
        self.current()
    }
}
