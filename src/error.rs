// src/error.rs
//! Error types for the relay session engine

use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Main error type
#[derive(Error, Debug)]
pub enum RelayError {
    /// STUN codec errors
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// TURN session errors
    #[error("TURN error: {0}")]
    Turn(#[from] TurnError),

    /// Client transport I/O errors
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// Configuration errors, detected at session init
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Allocation registry refused the session
    #[error("Registry error: {0}")]
    Registry(String),
}

/// STUN codec error types
#[derive(Error, Debug)]
pub enum StunError {
    /// Invalid magic cookie in STUN message
    #[error("Invalid magic cookie: 0x{0:08X}")]
    InvalidMagicCookie(u32),

    /// Message or attribute failed to parse
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Missing required attribute
    #[error("Missing required attribute: {0}")]
    MissingAttribute(&'static str),

    /// Invalid address family octet
    #[error("Invalid address family: {0}")]
    InvalidAddressFamily(u8),

    /// MESSAGE-INTEGRITY verification failed
    #[error("MESSAGE-INTEGRITY verification failed")]
    IntegrityCheckFailed,

    /// FINGERPRINT verification failed
    #[error("FINGERPRINT verification failed")]
    FingerprintCheckFailed,

    /// Invalid message type
    #[error("Invalid message type: 0x{0:04X}")]
    InvalidMessageType(u16),
}

/// TURN session error types
#[derive(Error, Debug)]
pub enum TurnError {
    /// Peer IP is covered by the address blacklist
    #[error("Peer {0} is blacklisted")]
    Blacklisted(IpAddr),

    /// Permission quota exceeded
    #[error("Permission quota exceeded ({0} max)")]
    PermissionQuota(usize),

    /// Channel number outside [0x4000, 0x7FFE] or conflicting binding
    #[error("Invalid channel binding: {0}")]
    ChannelBind(String),

    /// Peer address family does not match the relay family
    #[error("Peer address family mismatch")]
    FamilyMismatch,

    /// Parent owner for a relay port could not be resolved
    #[error("No parent owner for port {0}")]
    UnknownPort(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let stun_err = StunError::InvalidMagicCookie(0x12345678);
        let err: RelayError = stun_err.into();

        match err {
            RelayError::Stun(StunError::InvalidMagicCookie(cookie)) => {
                assert_eq!(cookie, 0x12345678);
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = TurnError::PermissionQuota(10);
        assert_eq!(err.to_string(), "Permission quota exceeded (10 max)");
    }
}
