//! Boundary to the controller's business state.
//!
//! The link layer never owns instances, users or host records. It reaches
//! them through the traits in this module, every call being a potential
//! suspension point. In-memory implementations back the binary's static
//! configuration and the tests.

use crate::message::PluginVersions;
use crate::utils::current_timestamp_ms;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Permission every control client needs to connect at all.
pub const CONNECT_PERMISSION: &str = "core.control.connect";

/// An authenticated account behind a control link.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: String,
    pub roles: Vec<String>,
    pub permissions: BTreeSet<String>,
    pub is_admin: bool,
    /// Tokens issued before this time (ms since epoch) are rejected
    pub token_valid_after: u64,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: Vec::new(),
            permissions: BTreeSet::new(),
            is_admin: false,
            token_valid_after: 0,
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn as_admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    /// Admins hold every permission.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.is_admin || self.permissions.contains(permission)
    }

    pub fn accepts_token_issued_at(&self, issued_at_ms: u64) -> bool {
        issued_at_ms >= self.token_valid_after
    }
}

/// Details a host announces when it registers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRegistration {
    pub id: u32,
    pub name: String,
    pub version: String,
    pub plugins: PluginVersions,
    pub public_address: Option<String>,
    pub remote: String,
}

#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// Host the instance is currently assigned to, if any.
    async fn resolve_assigned_host(&self, instance_id: u32) -> Option<u32>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn resolve_user(&self, name: &str) -> Option<User>;

    /// Invalidates every token issued to `name` so far. Returns `false` for
    /// unknown users.
    async fn revoke_tokens(&self, name: &str) -> bool;
}

#[async_trait]
pub trait HostDirectory: Send + Sync {
    /// Tokens for `host_id` issued before this time (ms since epoch) are rejected.
    async fn token_valid_after(&self, host_id: u32) -> u64;

    async fn host_connected(&self, registration: HostRegistration);

    async fn host_disconnected(&self, host_id: u32);

    async fn revoke_tokens(&self, host_id: u32);
}

/// Everything the link layer consults outside itself.
#[derive(Clone)]
pub struct Collaborators {
    pub instances: Arc<dyn InstanceDirectory>,
    pub users: Arc<dyn UserStore>,
    pub hosts: Arc<dyn HostDirectory>,
}

impl Collaborators {
    /// Fresh in-memory collaborators.
    pub fn in_memory() -> (Self, MemoryCollaborators) {
        let memory = MemoryCollaborators {
            instances: Arc::new(MemoryInstanceDirectory::new()),
            users: Arc::new(MemoryUserStore::new()),
            hosts: Arc::new(MemoryHostDirectory::new()),
        };
        (memory.as_collaborators(), memory)
    }
}

/// Concrete handles to the in-memory collaborators, for seeding and inspection.
#[derive(Clone)]
pub struct MemoryCollaborators {
    pub instances: Arc<MemoryInstanceDirectory>,
    pub users: Arc<MemoryUserStore>,
    pub hosts: Arc<MemoryHostDirectory>,
}

impl MemoryCollaborators {
    pub fn as_collaborators(&self) -> Collaborators {
        Collaborators {
            instances: self.instances.clone(),
            users: self.users.clone(),
            hosts: self.hosts.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryInstanceDirectory {
    assignments: DashMap<u32, u32>,
}

impl MemoryInstanceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, instance_id: u32, host_id: u32) {
        self.assignments.insert(instance_id, host_id);
    }

    pub fn unassign(&self, instance_id: u32) {
        self.assignments.remove(&instance_id);
    }
}

#[async_trait]
impl InstanceDirectory for MemoryInstanceDirectory {
    async fn resolve_assigned_host(&self, instance_id: u32) -> Option<u32> {
        self.assignments.get(&instance_id).map(|host| *host)
    }
}

#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: DashMap<String, User>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: User) {
        self.users.insert(user.name.clone(), user);
    }

    pub fn get(&self, name: &str) -> Option<User> {
        self.users.get(name).map(|user| user.clone())
    }

    pub fn grant(&self, name: &str, permission: &str) {
        if let Some(mut user) = self.users.get_mut(name) {
            user.permissions.insert(permission.to_string());
        }
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn resolve_user(&self, name: &str) -> Option<User> {
        self.get(name)
    }

    async fn revoke_tokens(&self, name: &str) -> bool {
        match self.users.get_mut(name) {
            Some(mut user) => {
                user.token_valid_after = current_timestamp_ms();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostRecord {
    pub registration: Option<HostRegistration>,
    pub connected: bool,
    pub token_valid_after: u64,
}

#[derive(Debug, Default)]
pub struct MemoryHostDirectory {
    hosts: DashMap<u32, HostRecord>,
}

impl MemoryHostDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, host_id: u32) -> Option<HostRecord> {
        self.hosts.get(&host_id).map(|record| record.clone())
    }

    pub fn is_connected(&self, host_id: u32) -> bool {
        self.hosts
            .get(&host_id)
            .map(|record| record.connected)
            .unwrap_or(false)
    }

    pub fn set_token_valid_after(&self, host_id: u32, timestamp_ms: u64) {
        self.hosts.entry(host_id).or_default().token_valid_after = timestamp_ms;
    }
}

#[async_trait]
impl HostDirectory for MemoryHostDirectory {
    async fn token_valid_after(&self, host_id: u32) -> u64 {
        self.hosts
            .get(&host_id)
            .map(|record| record.token_valid_after)
            .unwrap_or(0)
    }

    async fn host_connected(&self, registration: HostRegistration) {
        let mut record = self.hosts.entry(registration.id).or_default();
        record.connected = true;
        record.registration = Some(registration);
    }

    async fn host_disconnected(&self, host_id: u32) {
        if let Some(mut record) = self.hosts.get_mut(&host_id) {
            record.connected = false;
        }
    }

    async fn revoke_tokens(&self, host_id: u32) {
        self.set_token_valid_after(host_id, current_timestamp_ms());
    }
}
