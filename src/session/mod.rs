// src/session/mod.rs
//! Per-allocation TURN session actor (RFC 5766 server side)
//!
//! One session instance manages exactly one allocation: a two-state
//! machine (`WaitForAllocate` → `Active`) fed by a single event channel
//! that merges decoded client messages, ChannelData frames, parent
//! injections, and a stop signal. Timer expiries come from the session's
//! own deadline queue. Events are processed one at a time; all state is
//! task-local and lock-free.

pub mod channels;
pub mod config;
pub mod permissions;
pub mod relay;
pub mod timer;

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::RelayResult;
use crate::hooks::HookEvent;
use crate::stun::protocol::{
    error_reason, looks_like_stun, Attribute, AttributeType, AttributeValue, ChannelData, Message,
    MessageType, TransactionId, CHANNEL_MAX, CHANNEL_MIN, FAMILY_IPV6, TRANSPORT_UDP,
};

use channels::ChannelTable;
pub use config::{AuthKey, SessionConfig, Transport};
use permissions::PermissionTable;
use relay::{decode_check, encode_check, ParentMessage, PeerMessage, SessionSender};
use timer::{TimerKind, TimerQueue, TimerToken};

/// Default allocation lifetime (RFC 5766 Section 2.2)
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);

/// Maximum allocation lifetime granted on Allocate or Refresh
pub const MAX_LIFETIME: Duration = Duration::from_secs(3600);

/// Permission lifetime (RFC 5766 Section 8)
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);

/// Channel binding lifetime (RFC 5766 Section 11)
pub const CHANNEL_LIFETIME: Duration = Duration::from_secs(600);

/// Events fed into the session actor
#[derive(Debug)]
pub enum SessionEvent {
    /// A decoded STUN/TURN message from the client socket
    Stun(Message),
    /// A ChannelData frame from the client socket
    ChannelData { channel: u16, payload: Bytes },
    /// Peer traffic injected by the parent
    Peer(PeerMessage),
    /// External stop signal
    Stop,
}

/// Signal sent to the owner on normal termination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerSignal {
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitForAllocate,
    Active,
}

/// Why the session terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    /// Allocation lifetime expired
    Expired,
    /// Client refreshed with LIFETIME=0
    RefreshedZero,
    /// Stop event received
    Stopped,
    /// Owner process died
    OwnerDown,
    /// Every event sender dropped
    ClientGone,
    /// Write failure on a reliable client transport
    TransportFailed,
    /// Protocol-fatal error at allocation time
    Protocol(u16),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expired => write!(f, "allocation lifetime expired"),
            Self::RefreshedZero => write!(f, "client released the allocation"),
            Self::Stopped => write!(f, "stop signal"),
            Self::OwnerDown => write!(f, "owner died"),
            Self::ClientGone => write!(f, "client transport closed"),
            Self::TransportFailed => write!(f, "client write failed"),
            Self::Protocol(code) => write!(f, "protocol error {}", code),
        }
    }
}

/// Byte/packet counters for the stop hook
#[derive(Debug, Default)]
struct TrafficCounters {
    rcvd_bytes: u64,
    rcvd_pkts: u64,
    sent_bytes: u64,
    sent_pkts: u64,
}

/// The per-allocation session actor
pub struct Session {
    state: State,
    config: SessionConfig,
    tx: SessionSender,

    relay_addr: Option<SocketAddr>,
    blacklist: crate::blacklist::Blacklist,
    permissions: PermissionTable,
    channels: ChannelTable,
    timers: TimerQueue,
    life_timer: TimerToken,

    last_trid: Option<TransactionId>,
    last_pkt: Option<Bytes>,
    seq: u64,
    candidate_addr: Option<SocketAddr>,
    parent: Option<relay::ParentHandle>,
    unknown_ports: HashSet<u16>,

    counters: TrafficCounters,
    started_at: Instant,
}

impl Session {
    /// Validate the config, register with the allocation registry, and
    /// spawn the session task. The returned sender feeds events to the
    /// actor; dropping every clone of it terminates the session.
    pub fn spawn(config: SessionConfig) -> RelayResult<SessionSender> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        config.registry.add(
            config.client_addr,
            &config.auth.username,
            &config.auth.realm,
            config.max_allocs,
            tx.clone(),
        )?;

        let mut timers = TimerQueue::new();
        let lifetime = config
            .lifetime
            .unwrap_or(DEFAULT_LIFETIME)
            .clamp(DEFAULT_LIFETIME, MAX_LIFETIME);
        let life_timer = timers.arm(lifetime, TimerKind::Life);

        let blacklist = crate::blacklist::Blacklist::new(config.blacklist.clone());
        let max_permissions = config.max_permissions;
        let parent = config.parent.clone();

        let session = Session {
            state: State::WaitForAllocate,
            config,
            tx: tx.clone(),
            relay_addr: None,
            blacklist,
            permissions: PermissionTable::new(max_permissions),
            channels: ChannelTable::new(),
            timers,
            life_timer,
            last_trid: None,
            last_pkt: None,
            seq: 0,
            candidate_addr: None,
            parent,
            unknown_ports: HashSet::new(),
            counters: TrafficCounters::default(),
            started_at: Instant::now(),
        };

        tokio::spawn(session.run(rx));
        Ok(tx)
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        info!(
            id = self.config.session_id,
            client = %self.config.client_addr,
            transport = ?self.config.transport,
            "Session started"
        );
        self.fire_hook(HookEvent::SessionStart {
            id: self.config.session_id,
            user: self.config.auth.username.clone(),
            realm: self.config.auth.realm.clone(),
            client: self.config.client_addr,
            transport: self.config.transport,
        });

        let owner = self.config.owner.clone();
        let reason = loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(reason) = self.handle_event(event) {
                            break reason;
                        }
                    }
                    None => break StopReason::ClientGone,
                },
                _ = sleep_or_never(deadline) => {
                    let now = Instant::now();
                    let mut stop = None;
                    while let Some((token, kind)) = self.timers.pop_due(now) {
                        if let Some(reason) = self.handle_timeout(token, kind) {
                            stop = Some(reason);
                            break;
                        }
                    }
                    if let Some(reason) = stop {
                        break reason;
                    }
                }
                _ = owner_closed(owner.as_ref()) => break StopReason::OwnerDown,
            }
        };

        self.terminate(reason);
    }

    fn handle_event(&mut self, event: SessionEvent) -> Option<StopReason> {
        match event {
            SessionEvent::Stop => Some(StopReason::Stopped),
            SessionEvent::Stun(msg) => match self.state {
                State::WaitForAllocate => {
                    if msg.message_type == MessageType::AllocateRequest {
                        self.handle_allocate(msg)
                    } else {
                        debug!(kind = %msg.message_type, "Ignoring event before allocation");
                        None
                    }
                }
                State::Active => self.handle_active_stun(msg),
            },
            SessionEvent::ChannelData { channel, payload } => match self.state {
                State::Active => self.handle_channel_data(channel, payload),
                State::WaitForAllocate => {
                    debug!("Ignoring ChannelData before allocation");
                    None
                }
            },
            SessionEvent::Peer(peer) => match self.state {
                State::Active => self.handle_peer(peer),
                State::WaitForAllocate => {
                    debug!("Ignoring peer traffic before allocation");
                    None
                }
            },
        }
    }

    fn handle_timeout(&mut self, _token: TimerToken, kind: TimerKind) -> Option<StopReason> {
        match kind {
            TimerKind::Life => Some(StopReason::Expired),
            TimerKind::Permission(ip) => {
                self.permissions.expire(ip);
                None
            }
            TimerKind::Channel(channel) => {
                self.channels.expire(channel);
                None
            }
        }
    }

    /// Allocate in `WaitForAllocate`: ordered checks, first failure wins
    /// and is fatal for the session.
    fn handle_allocate(&mut self, msg: Message) -> Option<StopReason> {
        let requested_transport = match msg
            .get_attribute(AttributeType::RequestedTransport)
            .map(|a| &a.value)
        {
            Some(AttributeValue::RequestedTransport(proto)) => *proto,
            _ => return self.fatal_error(&msg, 400),
        };
        if requested_transport != TRANSPORT_UDP {
            return self.fatal_error(&msg, 442);
        }
        if msg.has_attribute(AttributeType::DontFragment) {
            let mut resp = Message::error_response(&msg, 420);
            resp.add_attribute(Attribute::new(
                AttributeType::UnknownAttributes,
                AttributeValue::UnknownAttributes(vec![AttributeType::DontFragment.value()]),
            ));
            self.send_response(resp);
            return Some(StopReason::Protocol(420));
        }
        if let Some(AttributeValue::RequestedAddressFamily(family)) = msg
            .get_attribute(AttributeType::RequestedAddressFamily)
            .map(|a| &a.value)
        {
            if *family == FAMILY_IPV6 && self.config.relay_ipv6.is_none() {
                return self.fatal_error(&msg, 440);
            }
        }
        if self.blacklist.matches(self.config.client_addr.ip()) {
            return self.fatal_error(&msg, 403);
        }

        let port = rand::thread_rng().gen_range(self.config.min_port..=self.config.max_port);
        let relay_addr = SocketAddr::new(self.config.mock_relay_ip, port);
        self.relay_addr = Some(relay_addr);
        self.state = State::Active;

        let remaining = self
            .timers
            .remaining(self.life_timer)
            .unwrap_or(DEFAULT_LIFETIME);

        info!(
            id = self.config.session_id,
            relay = %relay_addr,
            lifetime_s = remaining.as_secs(),
            "Allocation created"
        );

        let mut resp = Message::new(MessageType::AllocateResponse, msg.transaction_id);
        resp.add_attribute(Attribute::new(
            AttributeType::XorRelayedAddress,
            AttributeValue::XorRelayedAddress(relay_addr),
        ));
        resp.add_attribute(Attribute::new(
            AttributeType::Lifetime,
            AttributeValue::Lifetime(remaining.as_secs() as u32),
        ));
        resp.add_attribute(Attribute::new(
            AttributeType::XorMappedAddress,
            AttributeValue::XorMappedAddress(unmap(self.config.client_addr)),
        ));
        self.send_response(resp)
    }

    fn handle_active_stun(&mut self, msg: Message) -> Option<StopReason> {
        // Retransmission shortcut: replay the cached response, no state
        // change.
        if msg.message_type.is_request() && self.last_trid == Some(msg.transaction_id) {
            if let Some(pkt) = self.last_pkt.clone() {
                debug!(trid = %msg.transaction_id, "Replaying response for retransmitted request");
                return self.send_raw(pkt);
            }
        }

        match msg.message_type {
            MessageType::AllocateRequest => self.protocol_error(&msg, 437),
            MessageType::RefreshRequest => self.handle_refresh(msg),
            MessageType::CreatePermissionRequest => self.handle_create_permission(msg),
            MessageType::ChannelBindRequest => self.handle_channel_bind(msg),
            MessageType::SendIndication => self.handle_send_indication(msg),
            other => {
                debug!(kind = %other, "Ignoring unexpected message");
                None
            }
        }
    }

    fn handle_refresh(&mut self, msg: Message) -> Option<StopReason> {
        if let Some(AttributeValue::RequestedAddressFamily(family)) = msg
            .get_attribute(AttributeType::RequestedAddressFamily)
            .map(|a| &a.value)
        {
            let relay_is_v4 = self.config.mock_relay_ip.is_ipv4();
            let asked_v6 = *family == FAMILY_IPV6;
            if relay_is_v4 == asked_v6 {
                return self.protocol_error(&msg, 443);
            }
        }

        match msg.lifetime() {
            Some(0) => {
                let mut resp = Message::new(MessageType::RefreshResponse, msg.transaction_id);
                resp.add_attribute(Attribute::new(
                    AttributeType::Lifetime,
                    AttributeValue::Lifetime(0),
                ));
                self.send_response(resp);
                Some(StopReason::RefreshedZero)
            }
            requested => {
                let granted = match requested {
                    None => DEFAULT_LIFETIME,
                    Some(secs) => Duration::from_secs(u64::from(secs)).min(MAX_LIFETIME),
                };
                self.timers.cancel(self.life_timer);
                self.life_timer = self.timers.arm(granted, TimerKind::Life);
                debug!(
                    id = self.config.session_id,
                    lifetime_s = granted.as_secs(),
                    "Allocation refreshed"
                );

                let mut resp = Message::new(MessageType::RefreshResponse, msg.transaction_id);
                resp.add_attribute(Attribute::new(
                    AttributeType::Lifetime,
                    AttributeValue::Lifetime(granted.as_secs() as u32),
                ));
                self.send_response(resp)
            }
        }
    }

    fn handle_create_permission(&mut self, msg: Message) -> Option<StopReason> {
        let peer_ips: Vec<IpAddr> = msg.peer_addresses().iter().map(|a| a.ip()).collect();
        match self.permissions.update(
            &peer_ips,
            self.config.mock_relay_ip,
            &self.blacklist,
            &mut self.timers,
        ) {
            Ok(()) => {
                let resp = Message::new(MessageType::CreatePermissionResponse, msg.transaction_id);
                self.send_response(resp)
            }
            Err(err) => self.protocol_error(&msg, err.code()),
        }
    }

    fn handle_channel_bind(&mut self, msg: Message) -> Option<StopReason> {
        let channel = match msg
            .get_attribute(AttributeType::ChannelNumber)
            .map(|a| &a.value)
        {
            Some(AttributeValue::ChannelNumber(c)) => *c,
            _ => return self.protocol_error(&msg, 400),
        };
        let peers = msg.peer_addresses();
        if !(CHANNEL_MIN..=CHANNEL_MAX).contains(&channel) || peers.len() != 1 {
            return self.protocol_error(&msg, 400);
        }
        let peer = peers[0];

        if let Err(err) = self.channels.check_bind(channel, peer) {
            debug!(channel, peer = %peer, ?err, "ChannelBind conflict");
            return self.protocol_error(&msg, 400);
        }
        if let Err(err) = self.permissions.update(
            &[peer.ip()],
            self.config.mock_relay_ip,
            &self.blacklist,
            &mut self.timers,
        ) {
            return self.protocol_error(&msg, err.code());
        }
        if self.candidate_addr.is_none() {
            self.candidate_addr = Some(peer);
        }
        self.channels.bind(channel, peer, &mut self.timers);

        let resp = Message::new(MessageType::ChannelBindResponse, msg.transaction_id);
        self.send_response(resp)
    }

    fn handle_send_indication(&mut self, msg: Message) -> Option<StopReason> {
        let peer = match msg.peer_addresses().first() {
            Some(peer) => *peer,
            None => {
                debug!("Send indication without XOR-PEER-ADDRESS, dropping");
                return None;
            }
        };
        let data = match msg.get_attribute(AttributeType::Data).map(|a| &a.value) {
            Some(AttributeValue::Data(data)) => Bytes::copy_from_slice(data),
            _ => {
                debug!("Send indication without DATA, dropping");
                return None;
            }
        };

        if self.candidate_addr.is_none() {
            self.candidate_addr = Some(peer);
        }
        if self.permissions.contains(peer.ip()) {
            self.forward_to_parent(data);
        } else {
            debug!(peer = %peer, "Send indication for peer without permission, dropping");
        }
        None
    }

    fn handle_channel_data(&mut self, channel: u16, payload: Bytes) -> Option<StopReason> {
        if self.channels.peer_of(channel).is_some() {
            self.forward_to_parent(payload);
        } else {
            debug!(
                channel,
                "ChannelData for unbound channel, dropping"
            );
        }
        None
    }

    /// Client→peer: hand the payload to the parent, resolving it lazily
    /// from the candidate port on first use. STUN-shaped payloads are
    /// decoded into structured connectivity checks.
    fn forward_to_parent(&mut self, payload: Bytes) {
        let port = match self.candidate_addr {
            Some(addr) => addr.port(),
            None => return,
        };
        if self.unknown_ports.contains(&port) {
            return;
        }
        if self.parent.is_none() {
            match self.config.parent_resolver.resolve(port) {
                Ok(handle) => self.parent = Some(handle),
                Err(err) => {
                    warn!(port, %err, "No parent owner for relay port");
                    self.unknown_ports.insert(port);
                    return;
                }
            }
        }
        let parent = match self.parent.as_ref() {
            Some(parent) => parent,
            None => return,
        };

        let size = payload.len() as u64;
        let message = if looks_like_stun(&payload) {
            match decode_check(&payload) {
                Ok(params) => ParentMessage::ConnectivityCheck {
                    params,
                    sender: self.tx.clone(),
                },
                Err(err) => {
                    debug!(%err, "Undecodable STUN payload on relay path, dropping");
                    return;
                }
            }
        } else {
            ParentMessage::IcePayload(payload)
        };

        let _ = parent.send(message);
        self.counters.sent_pkts += 1;
        self.counters.sent_bytes += size;
    }

    /// Peer→client traffic injected by the parent
    fn handle_peer(&mut self, peer: PeerMessage) -> Option<StopReason> {
        match peer {
            PeerMessage::ConnectivityCheck { params, password } => {
                let relay_port = match self.relay_addr {
                    Some(addr) => addr.port(),
                    None => return None,
                };
                let mapped = SocketAddr::new(self.config.mock_relay_ip, relay_port);
                match encode_check(&params, &password, mapped) {
                    Ok(bytes) => self.deliver_to_client(bytes),
                    Err(err) => {
                        warn!(%err, "Failed to encode connectivity check");
                        None
                    }
                }
            }
            PeerMessage::IcePayload(bytes) => self.deliver_to_client(bytes),
        }
    }

    /// Deliver a peer payload to the client. The return path is scoped to
    /// `candidate_addr`: the session tunnels traffic for one ICE peer,
    /// even though several peers may hold permissions.
    fn deliver_to_client(&mut self, payload: Bytes) -> Option<StopReason> {
        let candidate = match self.candidate_addr {
            Some(addr) => addr,
            None => {
                debug!("Peer payload before any candidate peer, dropping");
                return None;
            }
        };
        if !self.permissions.contains(candidate.ip()) {
            debug!(peer = %candidate, "Peer payload without permission, dropping");
            return None;
        }

        let size = payload.len() as u64;
        let frame = if let Some(channel) = self.channels.channel_of(candidate) {
            ChannelData::new(channel, payload).encode()
        } else {
            let mut msg = Message::new(MessageType::DataIndication, TransactionId::from_seq(self.seq));
            self.seq += 1;
            msg.add_attribute(Attribute::new(
                AttributeType::XorPeerAddress,
                AttributeValue::XorPeerAddress(candidate),
            ));
            msg.add_attribute(Attribute::new(
                AttributeType::Data,
                AttributeValue::Data(payload.to_vec()),
            ));
            match msg.encode(None, false) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(%err, "Failed to encode Data indication");
                    return None;
                }
            }
        };

        self.counters.rcvd_pkts += 1;
        self.counters.rcvd_bytes += size;
        self.send_raw(frame)
    }

    /// Send an error response and remain in the current state
    fn protocol_error(&mut self, request: &Message, code: u16) -> Option<StopReason> {
        debug!(
            kind = %request.message_type,
            code,
            reason = error_reason(code),
            "Rejecting request"
        );
        self.send_response(Message::error_response(request, code))
    }

    /// Send an error response and terminate (Allocate-time fatals)
    fn fatal_error(&mut self, request: &Message, code: u16) -> Option<StopReason> {
        self.send_response(Message::error_response(request, code));
        Some(StopReason::Protocol(code))
    }

    /// Encode, sign, and send a response, caching it for retransmission
    /// suppression. Indications never pass through here.
    fn send_response(&mut self, mut msg: Message) -> Option<StopReason> {
        msg.add_attribute(Attribute::new(
            AttributeType::Software,
            AttributeValue::Software(self.config.server_name.clone()),
        ));
        let bytes = match msg.encode(Some(&self.config.auth.key), true) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "Failed to encode response");
                return None;
            }
        };
        self.last_trid = Some(msg.transaction_id);
        self.last_pkt = Some(bytes.clone());
        self.send_raw(bytes)
    }

    /// Write to the client transport. Failures are fatal on reliable
    /// transports and dropped on datagram transports.
    fn send_raw(&mut self, bytes: Bytes) -> Option<StopReason> {
        let result = match self.config.transport {
            Transport::Udp => self
                .config
                .socket
                .send_to(self.config.client_addr, bytes),
            Transport::Tcp | Transport::Tls => self.config.socket.send(bytes),
        };
        match result {
            Ok(()) => None,
            Err(err) if !self.config.transport.is_reliable() => {
                debug!(%err, "Datagram write failed, dropping");
                None
            }
            Err(err) => {
                warn!(%err, "Client write failed");
                Some(StopReason::TransportFailed)
            }
        }
    }

    fn terminate(&mut self, reason: StopReason) {
        info!(
            id = self.config.session_id,
            client = %self.config.client_addr,
            %reason,
            sent_pkts = self.counters.sent_pkts,
            rcvd_pkts = self.counters.rcvd_pkts,
            "Session terminating"
        );

        self.permissions.clear(&mut self.timers);
        self.channels.clear(&mut self.timers);
        self.timers.cancel(self.life_timer);

        self.config.registry.del(
            self.config.client_addr,
            &self.config.auth.username,
            &self.config.auth.realm,
        );

        self.fire_hook(HookEvent::SessionStop {
            id: self.config.session_id,
            user: self.config.auth.username.clone(),
            realm: self.config.auth.realm.clone(),
            client: self.config.client_addr,
            transport: self.config.transport,
            sent_bytes: self.counters.sent_bytes,
            sent_pkts: self.counters.sent_pkts,
            rcvd_bytes: self.counters.rcvd_bytes,
            rcvd_pkts: self.counters.rcvd_pkts,
            duration: self.started_at.elapsed(),
        });

        if let Some(owner) = &self.config.owner {
            let _ = owner.send(OwnerSignal::Stopped);
        }
    }

    /// Invoke the hook; hook errors are logged, never propagated
    fn fire_hook(&self, event: HookEvent) {
        if let Some(hook) = &self.config.hook {
            let name = event.name();
            if let Err(err) = hook(event) {
                warn!(hook = name, %err, "Session hook failed");
            }
        }
    }
}

/// Collapse an IPv4-mapped IPv6 address to plain IPv4
fn unmap(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

async fn sleep_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn owner_closed(owner: Option<&mpsc::UnboundedSender<OwnerSignal>>) {
    match owner {
        Some(tx) => tx.closed().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmap_collapses_mapped_addresses() {
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:4000".parse().unwrap();
        assert_eq!(unmap(mapped), "192.0.2.1:4000".parse::<SocketAddr>().unwrap());

        let plain_v6: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        assert_eq!(unmap(plain_v6), plain_v6);

        let v4: SocketAddr = "10.0.0.1:80".parse().unwrap();
        assert_eq!(unmap(v4), v4);
    }
}
