//! Group membership -- which group we are in and who may join which.
//!
//! Private groups store the SHA-256 hex of their password. This is a join
//! filter for honest devices, not access control.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lanrelay_crypto::hash_password;
use lanrelay_protocol::{GroupId, PUBLIC_GROUP};
use serde::Serialize;

use crate::RegistryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub group_id: GroupId,
    pub password_hash: Option<String>,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl GroupInfo {
    pub fn is_public(&self) -> bool {
        self.password_hash.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    Created(GroupInfo),
    CurrentGroupChanged(GroupId),
}

pub struct GroupRegistry {
    groups: HashMap<GroupId, GroupInfo>,
    current: GroupId,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupRegistry {
    /// A registry holding only the public default group, which is also current.
    pub fn new() -> Self {
        let public = GroupInfo {
            group_id: PUBLIC_GROUP.to_string(),
            password_hash: None,
            display_name: PUBLIC_GROUP.to_string(),
            created_at: Utc::now(),
        };
        let mut groups = HashMap::new();
        groups.insert(public.group_id.clone(), public);
        Self {
            groups,
            current: PUBLIC_GROUP.to_string(),
        }
    }

    /// Create a group, replacing any existing group with the same id.
    /// `None` makes it public.
    pub fn create_group(
        &mut self,
        group_id: &str,
        password: Option<&str>,
    ) -> Result<(GroupInfo, GroupEvent), RegistryError> {
        if group_id.trim().is_empty() {
            return Err(RegistryError::BlankGroupId);
        }
        if group_id == PUBLIC_GROUP {
            return Err(RegistryError::ReservedGroup(group_id.to_string()));
        }

        let group = GroupInfo {
            group_id: group_id.to_string(),
            password_hash: password.map(hash_password),
            display_name: group_id.to_string(),
            created_at: Utc::now(),
        };
        tracing::info!(group = %group.group_id, public = group.is_public(), "groups: created");
        self.groups.insert(group.group_id.clone(), group.clone());
        Ok((group.clone(), GroupEvent::Created(group)))
    }

    /// Unknown group: false. Public group: true. Private group: the digest of
    /// `password` must equal the stored digest exactly.
    pub fn validate(&self, group_id: &str, password: Option<&str>) -> bool {
        let Some(group) = self.groups.get(group_id) else {
            return false;
        };
        match (&group.password_hash, password) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(stored), Some(password)) => hash_password(password) == *stored,
        }
    }

    /// Switch the current group. Returns the change event only when the
    /// current group actually changed.
    pub fn join(
        &mut self,
        group_id: &str,
        password: Option<&str>,
    ) -> Result<Option<GroupEvent>, RegistryError> {
        if !self.validate(group_id, password) {
            tracing::debug!(group = %group_id, "groups: join rejected");
            return Err(RegistryError::JoinRejected(group_id.to_string()));
        }
        if self.current == group_id {
            return Ok(None);
        }
        self.current = group_id.to_string();
        tracing::info!(group = %group_id, "groups: current group changed");
        Ok(Some(GroupEvent::CurrentGroupChanged(self.current.clone())))
    }

    pub fn current_group(&self) -> &str {
        &self.current
    }

    pub fn get_group(&self, group_id: &str) -> Option<&GroupInfo> {
        self.groups.get(group_id)
    }

    pub fn group_exists(&self, group_id: &str) -> bool {
        self.groups.contains_key(group_id)
    }

    /// Owned copy of all groups, ordered by id.
    pub fn groups(&self) -> Vec<GroupInfo> {
        let mut groups: Vec<GroupInfo> = self.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        groups
    }
}
