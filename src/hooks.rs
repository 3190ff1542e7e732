// src/hooks.rs
//! Session lifecycle hooks
//!
//! An optional callback invoked when a session starts and stops. Hook
//! errors are caught and logged by the session; they never affect the
//! session itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::session::Transport;

/// Hook callback type. Errors are logged at `warn` and swallowed.
pub type SessionHook = Arc<dyn Fn(HookEvent) -> anyhow::Result<()> + Send + Sync>;

/// Payload passed to the hook
#[derive(Debug, Clone)]
pub enum HookEvent {
    SessionStart {
        id: u64,
        user: String,
        realm: String,
        client: SocketAddr,
        transport: Transport,
    },
    SessionStop {
        id: u64,
        user: String,
        realm: String,
        client: SocketAddr,
        transport: Transport,
        sent_bytes: u64,
        sent_pkts: u64,
        rcvd_bytes: u64,
        rcvd_pkts: u64,
        duration: Duration,
    },
}

impl HookEvent {
    /// Hook name, as reported to the callback consumer
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "turn_session_start",
            Self::SessionStop { .. } => "turn_session_stop",
        }
    }
}
