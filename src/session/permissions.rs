// src/session/permissions.rs
//! Permission table (RFC 5766 Section 9)
//!
//! Permissions authorize peer IP addresses (not ports). Each entry owns a
//! 5-minute refresh timer; expiry removes only the permission, never the
//! channels referencing the same IP (those have their own lifetimes).

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::debug;

use super::timer::{TimerKind, TimerQueue, TimerToken};
use super::PERMISSION_LIFETIME;
use crate::blacklist::Blacklist;

/// Why a CreatePermission was refused, with its STUN error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionError {
    /// No peer addresses supplied
    Empty,
    /// Admitting the supplied addresses would exceed the quota
    Quota,
    /// A supplied address family differs from the relay family
    FamilyMismatch,
    /// A supplied address is blacklisted
    Blacklisted(IpAddr),
}

impl PermissionError {
    pub fn code(&self) -> u16 {
        match self {
            Self::Empty => 400,
            Self::Quota => 508,
            Self::FamilyMismatch => 443,
            Self::Blacklisted(_) => 403,
        }
    }
}

/// Live permissions keyed by peer IP
#[derive(Debug)]
pub struct PermissionTable {
    entries: HashMap<IpAddr, TimerToken>,
    max_permissions: usize,
}

impl PermissionTable {
    pub fn new(max_permissions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_permissions,
        }
    }

    /// Install or refresh permissions for the supplied peer IPs.
    ///
    /// Checks run in order: empty input, quota (each supplied address
    /// counts as a new slot, before dedup), family, blacklist. On success
    /// every address gets a fresh 5-minute timer, replacing any existing
    /// one.
    pub fn update(
        &mut self,
        addrs: &[IpAddr],
        relay_ip: IpAddr,
        blacklist: &Blacklist,
        timers: &mut TimerQueue,
    ) -> Result<(), PermissionError> {
        if addrs.is_empty() {
            return Err(PermissionError::Empty);
        }
        if self.entries.len() + addrs.len() > self.max_permissions {
            return Err(PermissionError::Quota);
        }
        if addrs.iter().any(|a| a.is_ipv4() != relay_ip.is_ipv4()) {
            return Err(PermissionError::FamilyMismatch);
        }
        if let Some(bad) = addrs.iter().find(|a| blacklist.matches(**a)) {
            return Err(PermissionError::Blacklisted(*bad));
        }

        for addr in addrs {
            if let Some(old) = self.entries.remove(addr) {
                timers.cancel(old);
            }
            let token = timers.arm(PERMISSION_LIFETIME, TimerKind::Permission(*addr));
            self.entries.insert(*addr, token);
            debug!(peer = %addr, "Permission installed");
        }
        Ok(())
    }

    /// Handle a permission timer expiry; the timer itself is already gone
    pub fn expire(&mut self, addr: IpAddr) {
        if self.entries.remove(&addr).is_some() {
            debug!(peer = %addr, "Permission expired");
        }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.entries.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cancel every permission timer, for session teardown
    pub fn clear(&mut self, timers: &mut TimerQueue) {
        for (_, token) in self.entries.drain() {
            timers.cancel(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELAY_V4: &str = "127.0.0.1";

    fn relay() -> IpAddr {
        RELAY_V4.parse().unwrap()
    }

    fn ips(addrs: &[&str]) -> Vec<IpAddr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn test_empty_is_rejected() {
        let mut table = PermissionTable::new(4);
        let mut timers = TimerQueue::new();
        let err = table
            .update(&[], relay(), &Blacklist::default(), &mut timers)
            .unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_quota_counts_before_dedup() {
        let mut table = PermissionTable::new(2);
        let mut timers = TimerQueue::new();
        let bl = Blacklist::default();

        table
            .update(&ips(&["10.0.0.1", "10.0.0.2"]), relay(), &bl, &mut timers)
            .unwrap();

        // Refreshing an existing IP still counts as a new slot for admission
        let err = table
            .update(&ips(&["10.0.0.1"]), relay(), &bl, &mut timers)
            .unwrap_err();
        assert_eq!(err, PermissionError::Quota);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_family_mismatch() {
        let mut table = PermissionTable::new(4);
        let mut timers = TimerQueue::new();
        let err = table
            .update(&ips(&["::1"]), relay(), &Blacklist::default(), &mut timers)
            .unwrap_err();
        assert_eq!(err.code(), 443);
        assert!(table.is_empty());
    }

    #[test]
    fn test_blacklisted_peer() {
        let mut table = PermissionTable::new(4);
        let mut timers = TimerQueue::new();
        let err = table
            .update(
                &ips(&["10.0.0.1", "0.0.0.7"]),
                relay(),
                &Blacklist::default(),
                &mut timers,
            )
            .unwrap_err();
        assert_eq!(err.code(), 403);
        // First failure wins; nothing was installed
        assert!(table.is_empty());
    }

    #[test]
    fn test_refresh_replaces_timer() {
        let mut table = PermissionTable::new(4);
        let mut timers = TimerQueue::new();
        let bl = Blacklist::default();

        table
            .update(&ips(&["10.0.0.1"]), relay(), &bl, &mut timers)
            .unwrap();
        assert_eq!(timers.len(), 1);

        table
            .update(&ips(&["10.0.0.1"]), relay(), &bl, &mut timers)
            .unwrap();
        // Old timer cancelled and replaced, still exactly one live timer
        assert_eq!(table.len(), 1);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_expire_removes_entry() {
        let mut table = PermissionTable::new(4);
        let mut timers = TimerQueue::new();
        table
            .update(
                &ips(&["10.0.0.1"]),
                relay(),
                &Blacklist::default(),
                &mut timers,
            )
            .unwrap();

        table.expire("10.0.0.1".parse().unwrap());
        assert!(!table.contains("10.0.0.1".parse().unwrap()));
    }
}
