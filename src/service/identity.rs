//! # Identity Service
//!
//! Narrow interface to the user directory that packet handlers consult for registration,
//! authentication and group membership.
//!
//! Handlers receive the service explicitly (typically an `Arc<dyn IdentityService>` captured
//! by a [`ConnectionFactory`](crate::protocol::ConnectionFactory)); there is no global store.
//! [`MemoryDirectory`] is an in-process implementation with the same bind/unbind lifecycle a
//! networked directory client would have.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};

const ERR_NOT_BOUND: &str = "Directory is not bound";
const ERR_LOCK_POISONED: &str = "Directory lock poisoned";

/// User directory operations consumed by packet handlers
pub trait IdentityService: Send + Sync {
    /// Create `name` with `password`; fails if the name is taken
    fn register(&self, name: &str, password: &str) -> Result<()>;

    /// Whether `password` is correct for `name`
    fn authenticate(&self, name: &str, password: &str) -> bool;

    fn is_registered(&self, name: &str) -> bool;

    /// The subset of `candidates` that list `name` as a member
    fn groups_containing(&self, name: &str, candidates: &[&str]) -> BTreeSet<String>;
}

#[derive(Debug, Default)]
struct DirectoryState {
    bound: bool,
    users: HashMap<String, String>,
    groups: HashMap<String, BTreeSet<String>>,
}

/// In-memory directory
///
/// Starts unbound: every operation fails or answers `false` until [`MemoryDirectory::bind`].
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self) -> Result<()> {
        let mut state = self.write()?;
        state.bound = true;
        info!(users = state.users.len(), "Directory bound");
        Ok(())
    }

    pub fn unbind(&self) -> Result<()> {
        let mut state = self.write()?;
        if state.bound {
            info!("Directory unbound");
        }
        state.bound = false;
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.state.read().map(|state| state.bound).unwrap_or(false)
    }

    /// Add `member` to `group`, creating the group if needed
    pub fn add_to_group(&self, group: &str, member: &str) -> Result<()> {
        let mut state = self.write()?;
        if !state.bound {
            return Err(ProtocolError::Identity(ERR_NOT_BOUND.to_string()));
        }
        state
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(member.to_string());
        debug!(group, member, "Added group member");
        Ok(())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, DirectoryState>> {
        self.state
            .write()
            .map_err(|_| ProtocolError::Identity(ERR_LOCK_POISONED.to_string()))
    }
}

impl IdentityService for MemoryDirectory {
    fn register(&self, name: &str, password: &str) -> Result<()> {
        if name.is_empty() {
            return Err(ProtocolError::Identity("User name cannot be empty".to_string()));
        }
        let mut state = self.write()?;
        if !state.bound {
            return Err(ProtocolError::Identity(ERR_NOT_BOUND.to_string()));
        }
        if state.users.contains_key(name) {
            warn!(name, "Registration refused, name taken");
            return Err(ProtocolError::Identity(format!("User '{name}' already registered")));
        }
        state.users.insert(name.to_string(), password.to_string());
        info!(name, "Registered user");
        Ok(())
    }

    fn authenticate(&self, name: &str, password: &str) -> bool {
        let Ok(state) = self.state.read() else {
            return false;
        };
        let ok = state.bound && state.users.get(name).is_some_and(|stored| stored == password);
        debug!(name, ok, "Authentication attempt");
        ok
    }

    fn is_registered(&self, name: &str) -> bool {
        self.state
            .read()
            .map(|state| state.bound && state.users.contains_key(name))
            .unwrap_or(false)
    }

    fn groups_containing(&self, name: &str, candidates: &[&str]) -> BTreeSet<String> {
        let Ok(state) = self.state.read() else {
            return BTreeSet::new();
        };
        if !state.bound {
            return BTreeSet::new();
        }
        candidates
            .iter()
            .filter(|group| {
                state
                    .groups
                    .get(**group)
                    .is_some_and(|members| members.contains(name))
            })
            .map(|group| group.to_string())
            .collect()
    }
}
