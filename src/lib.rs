// src/lib.rs
//! turngate — per-allocation TURN session engine (RFC 5766)
//!
//! Each [`Session`] is a single-threaded actor managing one allocation:
//! the relayed-address lifetime, the permission and channel tables, data
//! relay between the client and the parent owner of the peer-facing
//! socket, and tunneling of ICE connectivity checks (RFC 8445) in both
//! directions.
//!
//! The transport layer decodes client traffic with [`stun`] and feeds
//! [`SessionEvent`]s to the actor; the parent injects peer traffic through
//! the same channel. See `DESIGN.md` for the seam layout.

pub mod blacklist;
pub mod error;
pub mod hooks;
pub mod registry;
pub mod session;
pub mod stun;

pub use blacklist::{Blacklist, Subnet};
pub use error::{RelayError, RelayResult, StunError, TurnError};
pub use hooks::{HookEvent, SessionHook};
pub use registry::{AllocationRegistry, InMemoryRegistry};
pub use session::relay::{
    ClientSocket, ParentHandle, ParentMessage, ParentResolver, PeerMessage, SessionSender,
};
pub use session::{
    AuthKey, OwnerSignal, Session, SessionConfig, SessionEvent, Transport, CHANNEL_LIFETIME,
    DEFAULT_LIFETIME, MAX_LIFETIME, PERMISSION_LIFETIME,
};

/// Initialize logging for binaries and examples
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level))
        .add_directive("tokio=warn".parse().unwrap())
        .add_directive("runtime=warn".parse().unwrap());

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}
