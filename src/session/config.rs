// src/session/config.rs
//! Session configuration consumed at init

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::relay::{ClientSocket, ParentHandle, ParentResolver};
use super::{OwnerSignal, DEFAULT_LIFETIME};
use crate::blacklist::Subnet;
use crate::error::{RelayError, RelayResult};
use crate::hooks::SessionHook;
use crate::registry::AllocationRegistry;

/// Client-facing transport kind. Determines the response path (datagram
/// destination vs accepted stream) and whether write failures are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

impl Transport {
    /// Reliable transports treat client write failures as fatal
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Transport::Udp)
    }
}

/// Long-term credential material used to sign responses. The key is
/// pre-derived (MD5 of `username:realm:password`); verification of inbound
/// requests happens in the codec before events reach the session.
#[derive(Debug, Clone)]
pub struct AuthKey {
    pub username: String,
    pub realm: String,
    pub key: [u8; 16],
}

/// Everything a session needs at init
pub struct SessionConfig {
    /// Stable opaque identifier for the session's life
    pub session_id: u64,
    /// Optional owner link; the session stops when the owner dies and
    /// signals the owner on normal termination
    pub owner: Option<mpsc::UnboundedSender<OwnerSignal>>,
    pub auth: AuthKey,
    /// Client `(ip, port)`, the response destination for datagram
    /// transports
    pub client_addr: SocketAddr,
    pub transport: Transport,
    /// Client-facing transport handle
    pub socket: Box<dyn ClientSocket>,
    /// Configured blacklist entries, merged with the fixed initial list
    pub blacklist: Vec<Subnet>,
    pub relay_ipv4: Ipv4Addr,
    pub relay_ipv6: Option<Ipv6Addr>,
    /// The IP advertised in XOR-RELAYED-ADDRESS; the parent owns the real
    /// relay socket
    pub mock_relay_ip: IpAddr,
    /// Inclusive port range the advertised relay port is drawn from
    pub min_port: u16,
    pub max_port: u16,
    pub max_permissions: usize,
    /// Per-(user, realm) allocation quota passed to the registry
    pub max_allocs: Option<usize>,
    /// Placed in the SOFTWARE attribute of every response
    pub server_name: String,
    pub parent: Option<ParentHandle>,
    pub parent_resolver: Box<dyn ParentResolver>,
    pub registry: Arc<dyn AllocationRegistry>,
    pub hook: Option<SessionHook>,
    /// Requested allocation lifetime; `None` means the 600 s default.
    /// Values below 600 s are rejected by [`validate`](Self::validate).
    pub lifetime: Option<Duration>,
}

impl SessionConfig {
    /// Reject non-sensible option combinations before the session starts
    pub fn validate(&self) -> RelayResult<()> {
        if self.min_port > self.max_port {
            return Err(RelayError::Configuration(format!(
                "Empty relay port range [{}, {}]",
                self.min_port, self.max_port
            )));
        }
        if self.max_permissions == 0 {
            return Err(RelayError::Configuration(
                "max_permissions must be at least 1".into(),
            ));
        }
        if let Some(lifetime) = self.lifetime {
            if lifetime < DEFAULT_LIFETIME {
                return Err(RelayError::Configuration(format!(
                    "Allocation lifetime {:?} below the 600 s minimum",
                    lifetime
                )));
            }
        }
        Ok(())
    }
}
