// src/session/timer.rs
//! Deadline queue for the session's subordinate lifetimes
//!
//! One monotonic priority queue serves the allocation life timer and every
//! permission/channel refresh timer. Each armed timer gets an opaque
//! [`TimerToken`]; cancelling removes the live entry, so a deadline that
//! already sits in the heap is discarded on pop instead of being delivered.
//! After `cancel(token)` returns, no expiry tagged with that token is ever
//! observed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;

/// Opaque cancellation token for an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// What an expiry means to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Allocation lifetime; expiry terminates the session
    Life,
    /// Permission refresh timer, tagged with the peer IP
    Permission(IpAddr),
    /// Channel refresh timer, tagged with the channel number
    Channel(u16),
}

/// Monotonic deadline heap with drain-on-cancel semantics
#[derive(Debug)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    live: HashMap<u64, (Instant, TimerKind)>,
    next_token: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_token: 0,
        }
    }

    /// Arm a timer; the returned token cancels it
    pub fn arm(&mut self, after: Duration, kind: TimerKind) -> TimerToken {
        let deadline = Instant::now() + after;
        let token = self.next_token;
        self.next_token += 1;
        self.live.insert(token, (deadline, kind));
        self.heap.push(Reverse((deadline, token)));
        TimerToken(token)
    }

    /// Cancel a timer. Any expiry already enqueued for it is drained: the
    /// stale heap entry is skipped when popped.
    pub fn cancel(&mut self, token: TimerToken) {
        self.live.remove(&token.0);
    }

    /// Time left until the timer fires, if it is still armed
    pub fn remaining(&self, token: TimerToken) -> Option<Duration> {
        self.live
            .get(&token.0)
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()))
    }

    /// The earliest live deadline, for the event loop's sleep
    pub fn next_deadline(&mut self) -> Option<Instant> {
        // Drop cancelled heads so the loop never sleeps on a dead deadline
        while let Some(Reverse((_, token))) = self.heap.peek() {
            if self.live.contains_key(token) {
                return self.heap.peek().map(|Reverse((deadline, _))| *deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop the next expiry due at or before `now`, skipping cancelled
    /// entries
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerToken, TimerKind)> {
        while let Some(Reverse((deadline, token))) = self.heap.peek().copied() {
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if let Some((_, kind)) = self.live.remove(&token) {
                return Some((TimerToken(token), kind));
            }
        }
        None
    }

    /// Number of live timers
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expiry_order() {
        let mut timers = TimerQueue::new();
        let _late = timers.arm(Duration::from_secs(10), TimerKind::Life);
        let early = timers.arm(
            Duration::from_secs(1),
            TimerKind::Permission("10.0.0.1".parse().unwrap()),
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        let (token, kind) = timers.pop_due(Instant::now()).unwrap();
        assert_eq!(token, early);
        assert_eq!(kind, TimerKind::Permission("10.0.0.1".parse().unwrap()));
        assert!(timers.pop_due(Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drains_due_expiry() {
        let mut timers = TimerQueue::new();
        let token = timers.arm(Duration::from_secs(1), TimerKind::Channel(0x4000));

        // Deadline passes before the session observes it, then the timer is
        // cancelled: the expiry must never surface.
        tokio::time::advance(Duration::from_secs(2)).await;
        timers.cancel(token);
        assert!(timers.pop_due(Instant::now()).is_none());
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_deadline() {
        let mut timers = TimerQueue::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        let first = timers.arm(Duration::from_secs(1), TimerKind::Permission(ip));
        timers.cancel(first);
        let second = timers.arm(Duration::from_secs(5), TimerKind::Permission(ip));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(timers.pop_due(Instant::now()).is_none());

        tokio::time::advance(Duration::from_secs(4)).await;
        let (token, _) = timers.pop_due(Instant::now()).unwrap();
        assert_eq!(token, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_deadline_skips_cancelled() {
        let mut timers = TimerQueue::new();
        let soon = timers.arm(Duration::from_secs(1), TimerKind::Life);
        let later = timers.arm(Duration::from_secs(10), TimerKind::Channel(0x4001));
        timers.cancel(soon);

        let deadline = timers.next_deadline().unwrap();
        assert_eq!(Some(deadline), timers.live.get(&later.0).map(|(d, _)| *d));
    }

    #[test]
    fn test_remaining() {
        let mut timers = TimerQueue::new();
        let token = timers.arm(Duration::from_secs(600), TimerKind::Life);
        let left = timers.remaining(token).unwrap();
        assert!(left <= Duration::from_secs(600));
        assert!(left > Duration::from_secs(599));

        timers.cancel(token);
        assert!(timers.remaining(token).is_none());
    }
}
