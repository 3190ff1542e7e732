// src/session/channels.rs
//! Channel table (RFC 5766 Section 11)
//!
//! Bidirectional mapping between 16-bit channel numbers and peer
//! endpoints. The forward map (`channels`) and reverse map (`peers`) are
//! mutated together; a peer binds to at most one channel and a channel to
//! at most one peer. Each binding owns a 10-minute refresh timer.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::debug;

use super::timer::{TimerKind, TimerQueue, TimerToken};
use super::CHANNEL_LIFETIME;

/// Why a ChannelBind was refused (all map to STUN error 400)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelBindError {
    /// The peer endpoint is already bound to a different channel
    PeerBound(u16),
    /// The channel number is already bound to a different peer
    ChannelBound(SocketAddr),
}

/// Channel number ↔ peer endpoint bindings
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: HashMap<u16, (SocketAddr, TimerToken)>,
    peers: HashMap<SocketAddr, u16>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that `(channel, peer)` does not conflict with an existing
    /// binding. A repeat bind of the same pair is allowed (it refreshes).
    pub fn check_bind(&self, channel: u16, peer: SocketAddr) -> Result<(), ChannelBindError> {
        if let Some(&bound) = self.peers.get(&peer) {
            if bound != channel {
                return Err(ChannelBindError::PeerBound(bound));
            }
        }
        if let Some(&(bound_peer, _)) = self.channels.get(&channel) {
            if bound_peer != peer {
                return Err(ChannelBindError::ChannelBound(bound_peer));
            }
        }
        Ok(())
    }

    /// Install or refresh the binding, replacing any existing timer.
    /// Callers must have passed [`check_bind`] first.
    pub fn bind(&mut self, channel: u16, peer: SocketAddr, timers: &mut TimerQueue) {
        if let Some((_, old)) = self.channels.remove(&channel) {
            timers.cancel(old);
        }
        let token = timers.arm(CHANNEL_LIFETIME, TimerKind::Channel(channel));
        self.channels.insert(channel, (peer, token));
        self.peers.insert(peer, channel);
        debug!(channel, peer = %peer, "Channel bound");
    }

    /// Handle a channel timer expiry: drop both directions of the mapping
    pub fn expire(&mut self, channel: u16) {
        if let Some((peer, _)) = self.channels.remove(&channel) {
            self.peers.remove(&peer);
            debug!(channel, peer = %peer, "Channel expired");
        }
    }

    /// Peer endpoint bound to a channel number
    pub fn peer_of(&self, channel: u16) -> Option<SocketAddr> {
        self.channels.get(&channel).map(|(peer, _)| *peer)
    }

    /// Channel number bound to a peer endpoint
    pub fn channel_of(&self, peer: SocketAddr) -> Option<u16> {
        self.peers.get(&peer).copied()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Cancel every channel timer, for session teardown
    pub fn clear(&mut self, timers: &mut TimerQueue) {
        for (_, (_, token)) in self.channels.drain() {
            timers.cancel(token);
        }
        self.peers.clear();
    }

    /// Forward/reverse map consistency, checked by tests
    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        self.channels.len() == self.peers.len()
            && self
                .channels
                .iter()
                .all(|(c, (p, _))| self.peers.get(p) == Some(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_bind_and_lookup() {
        let mut table = ChannelTable::new();
        let mut timers = TimerQueue::new();

        table.check_bind(0x4000, peer("10.0.0.1:5000")).unwrap();
        table.bind(0x4000, peer("10.0.0.1:5000"), &mut timers);

        assert_eq!(table.peer_of(0x4000), Some(peer("10.0.0.1:5000")));
        assert_eq!(table.channel_of(peer("10.0.0.1:5000")), Some(0x4000));
        assert!(table.is_consistent());
    }

    #[test]
    fn test_rebind_same_pair_refreshes() {
        let mut table = ChannelTable::new();
        let mut timers = TimerQueue::new();
        let p = peer("10.0.0.1:5000");

        table.check_bind(0x4000, p).unwrap();
        table.bind(0x4000, p, &mut timers);
        table.check_bind(0x4000, p).unwrap();
        table.bind(0x4000, p, &mut timers);

        assert_eq!(table.len(), 1);
        assert_eq!(timers.len(), 1);
        assert!(table.is_consistent());
    }

    #[test]
    fn test_peer_bound_to_other_channel() {
        let mut table = ChannelTable::new();
        let mut timers = TimerQueue::new();
        let p = peer("10.0.0.1:5000");

        table.bind(0x4000, p, &mut timers);
        assert_eq!(
            table.check_bind(0x4001, p),
            Err(ChannelBindError::PeerBound(0x4000))
        );
        assert!(table.is_consistent());
    }

    #[test]
    fn test_channel_bound_to_other_peer() {
        let mut table = ChannelTable::new();
        let mut timers = TimerQueue::new();

        table.bind(0x4000, peer("10.0.0.1:5000"), &mut timers);
        assert_eq!(
            table.check_bind(0x4000, peer("10.0.0.2:5000")),
            Err(ChannelBindError::ChannelBound(peer("10.0.0.1:5000")))
        );
        assert!(table.is_consistent());
    }

    #[test]
    fn test_expire_removes_both_directions() {
        let mut table = ChannelTable::new();
        let mut timers = TimerQueue::new();
        let p = peer("10.0.0.1:5000");

        table.bind(0x4000, p, &mut timers);
        table.expire(0x4000);

        assert_eq!(table.peer_of(0x4000), None);
        assert_eq!(table.channel_of(p), None);
        assert!(table.is_empty());
        assert!(table.is_consistent());
    }
}
