// src/stun/mod.rs
//! STUN/TURN wire codec (RFC 5389, RFC 5766, RFC 8445 Binding)
//!
//! The session core consumes already-decoded [`Message`] values and encodes
//! its responses through this module. Scope is the message types and
//! attributes the allocation session actually exchanges.

pub mod auth;
pub mod protocol;

pub use auth::{long_term_key, message_integrity, verify_integrity};
pub use protocol::{
    add_fingerprint, error_reason, looks_like_stun, Attribute, AttributeType, AttributeValue,
    ChannelData, Message, MessageClass, MessageType, TransactionId, CHANNEL_MAX, CHANNEL_MIN,
    FAMILY_IPV4, FAMILY_IPV6, MAGIC_COOKIE, TRANSPORT_UDP,
};
