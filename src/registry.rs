// src/registry.rs
//! Allocation registry: the one resource shared across sessions
//!
//! A session registers itself at start and deregisters at stop; the
//! registry enforces the per-(user, realm) allocation quota. Everything
//! else about a session is private to its actor.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::{RelayError, RelayResult};
use crate::session::relay::SessionSender;

/// Registration seam the session calls at start and stop
pub trait AllocationRegistry: Send + Sync {
    /// Register an allocation; `Err` refuses the session (quota)
    fn add(
        &self,
        client_addr: SocketAddr,
        username: &str,
        realm: &str,
        max_allocs: Option<usize>,
        session: SessionSender,
    ) -> RelayResult<()>;

    /// Deregister an allocation
    fn del(&self, client_addr: SocketAddr, username: &str, realm: &str);
}

/// In-memory registry keyed by client address, with per-(user, realm)
/// counting for quota enforcement
#[derive(Default)]
pub struct InMemoryRegistry {
    allocations: DashMap<SocketAddr, (String, String, SessionSender)>,
    user_counts: DashMap<(String, String), usize>,
}

impl InMemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of live allocations for a user in a realm
    pub fn count(&self, username: &str, realm: &str) -> usize {
        self.user_counts
            .get(&(username.to_string(), realm.to_string()))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Look up the session registered for a client address
    pub fn find(&self, client_addr: SocketAddr) -> Option<SessionSender> {
        self.allocations
            .get(&client_addr)
            .map(|entry| entry.2.clone())
    }
}

impl AllocationRegistry for InMemoryRegistry {
    fn add(
        &self,
        client_addr: SocketAddr,
        username: &str,
        realm: &str,
        max_allocs: Option<usize>,
        session: SessionSender,
    ) -> RelayResult<()> {
        let key = (username.to_string(), realm.to_string());
        let mut count = self.user_counts.entry(key).or_insert(0);
        if let Some(max) = max_allocs {
            if *count >= max {
                return Err(RelayError::Registry(format!(
                    "User {} in realm {} reached allocation limit ({})",
                    username, realm, max
                )));
            }
        }
        *count += 1;
        drop(count);

        self.allocations.insert(
            client_addr,
            (username.to_string(), realm.to_string(), session),
        );
        debug!(client = %client_addr, user = username, "Allocation registered");
        Ok(())
    }

    fn del(&self, client_addr: SocketAddr, username: &str, realm: &str) {
        if self.allocations.remove(&client_addr).is_some() {
            let key = (username.to_string(), realm.to_string());
            if let Some(mut count) = self.user_counts.get_mut(&key) {
                *count = count.saturating_sub(1);
            }
            debug!(client = %client_addr, user = username, "Allocation deregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sender() -> SessionSender {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn test_quota_enforced() {
        let registry = InMemoryRegistry::new();
        let a: SocketAddr = "192.0.2.1:1000".parse().unwrap();
        let b: SocketAddr = "192.0.2.1:1001".parse().unwrap();
        let c: SocketAddr = "192.0.2.1:1002".parse().unwrap();

        registry.add(a, "alice", "example.org", Some(2), sender()).unwrap();
        registry.add(b, "alice", "example.org", Some(2), sender()).unwrap();
        assert!(registry.add(c, "alice", "example.org", Some(2), sender()).is_err());
        assert_eq!(registry.count("alice", "example.org"), 2);

        registry.del(a, "alice", "example.org");
        assert_eq!(registry.count("alice", "example.org"), 1);
        registry.add(c, "alice", "example.org", Some(2), sender()).unwrap();
    }

    #[test]
    fn test_del_is_idempotent() {
        let registry = InMemoryRegistry::new();
        let a: SocketAddr = "192.0.2.1:1000".parse().unwrap();
        registry.add(a, "bob", "example.org", None, sender()).unwrap();
        registry.del(a, "bob", "example.org");
        registry.del(a, "bob", "example.org");
        assert_eq!(registry.count("bob", "example.org"), 0);
    }
}
