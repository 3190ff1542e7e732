// src/session/relay.rs
//! Data-relay seams: the parent link, connectivity-check tunneling, and
//! the client-facing transport
//!
//! The session does not own the peer-facing socket; a parent process does.
//! Client→peer payloads are forwarded to the parent as [`ParentMessage`]s,
//! and the parent injects peer→client traffic back through the session's
//! event channel. STUN Binding traffic on that path is decoded into
//! structured [`CheckParams`] instead of being relayed opaquely, so the
//! parent can run ICE connectivity checks without a codec of its own.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use super::SessionEvent;
use crate::error::{RelayResult, StunError, TurnError};
use crate::stun::auth::append_integrity;
use crate::stun::protocol::{
    add_fingerprint, Attribute, AttributeType, AttributeValue, Message, MessageClass, MessageType,
    TransactionId, HEADER_SIZE,
};

/// Handle for forwarding payloads to the parent owner of the relay socket
pub type ParentHandle = mpsc::UnboundedSender<ParentMessage>;

/// Handle for injecting events into a session
pub type SessionSender = mpsc::UnboundedSender<SessionEvent>;

/// Resolves the parent owner for a relay port, used to lazily bind the
/// parent the first time a peer payload arrives
pub trait ParentResolver: Send {
    fn resolve(&self, port: u16) -> RelayResult<ParentHandle>;
}

/// Resolver over a fixed handle, for setups where the parent is known at
/// session init
pub struct FixedResolver(pub ParentHandle);

impl ParentResolver for FixedResolver {
    fn resolve(&self, _port: u16) -> RelayResult<ParentHandle> {
        Ok(self.0.clone())
    }
}

/// Resolver that never finds a parent
pub struct NoResolver;

impl ParentResolver for NoResolver {
    fn resolve(&self, port: u16) -> RelayResult<ParentHandle> {
        Err(TurnError::UnknownPort(port).into())
    }
}

/// What the session forwards to the parent (client→peer direction)
#[derive(Debug, Clone)]
pub enum ParentMessage {
    /// A decoded ICE connectivity check from the client, with a handle the
    /// parent uses to answer
    ConnectivityCheck {
        params: CheckParams,
        sender: SessionSender,
    },
    /// Opaque non-STUN payload
    IcePayload(Bytes),
}

/// What the parent injects back (peer→client direction)
#[derive(Debug, Clone)]
pub enum PeerMessage {
    /// Construct, sign with the ICE password, and deliver a Binding message
    ConnectivityCheck {
        params: CheckParams,
        password: String,
    },
    /// Deliver an already-encoded STUN packet
    IcePayload(Bytes),
}

/// The attribute set of a tunneled ICE Binding message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckParams {
    pub class: MessageClass,
    pub magic: u32,
    pub trid: TransactionId,
    pub username: Option<String>,
    pub priority: Option<u32>,
    pub use_candidate: bool,
    pub ice_controlled: Option<u64>,
    pub ice_controlling: Option<u64>,
    pub error_code: Option<u16>,
}

/// Decode an inbound Binding message into check params
pub fn decode_check(payload: &[u8]) -> RelayResult<CheckParams> {
    let msg = Message::decode(payload)?;
    if msg.message_type.method() != MessageType::BindingRequest.method() {
        return Err(StunError::InvalidMessage(format!(
            "Expected Binding on relay path, got {}",
            msg.message_type
        ))
        .into());
    }

    let magic = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);

    let mut params = CheckParams {
        class: msg.message_type.class(),
        magic,
        trid: msg.transaction_id,
        username: None,
        priority: None,
        use_candidate: false,
        ice_controlled: None,
        ice_controlling: None,
        error_code: None,
    };

    for attr in &msg.attributes {
        match &attr.value {
            AttributeValue::Username(u) => params.username = Some(u.clone()),
            AttributeValue::Priority(p) => params.priority = Some(*p),
            AttributeValue::UseCandidate => params.use_candidate = true,
            AttributeValue::IceControlled(v) => params.ice_controlled = Some(*v),
            AttributeValue::IceControlling(v) => params.ice_controlling = Some(*v),
            AttributeValue::ErrorCode { code, .. } => params.error_code = Some(*code),
            _ => {}
        }
    }

    Ok(params)
}

/// Build the Binding message for a parent-injected connectivity check:
/// attributes from `params`, XOR-MAPPED-ADDRESS iff the class is a
/// response, MESSAGE-INTEGRITY keyed by the ICE password, FINGERPRINT
/// appended last.
pub fn encode_check(
    params: &CheckParams,
    password: &str,
    mapped: SocketAddr,
) -> RelayResult<Bytes> {
    let message_type = MessageType::from_method_class(
        MessageType::BindingRequest.method(),
        params.class,
    )
    .ok_or_else(|| StunError::InvalidMessage("Invalid Binding class".into()))?;

    let mut msg = Message::new(message_type, params.trid);
    if let Some(username) = &params.username {
        msg.add_attribute(Attribute::new(
            AttributeType::Username,
            AttributeValue::Username(username.clone()),
        ));
    }
    if let Some(priority) = params.priority {
        msg.add_attribute(Attribute::new(
            AttributeType::Priority,
            AttributeValue::Priority(priority),
        ));
    }
    if params.use_candidate {
        msg.add_attribute(Attribute::new(
            AttributeType::UseCandidate,
            AttributeValue::UseCandidate,
        ));
    }
    if let Some(v) = params.ice_controlled {
        msg.add_attribute(Attribute::new(
            AttributeType::IceControlled,
            AttributeValue::IceControlled(v),
        ));
    }
    if let Some(v) = params.ice_controlling {
        msg.add_attribute(Attribute::new(
            AttributeType::IceControlling,
            AttributeValue::IceControlling(v),
        ));
    }
    if let Some(code) = params.error_code {
        msg.add_attribute(Attribute::new(
            AttributeType::ErrorCode,
            AttributeValue::ErrorCode {
                code,
                reason: crate::stun::protocol::error_reason(code).to_string(),
            },
        ));
    }
    if matches!(
        params.class,
        MessageClass::SuccessResponse | MessageClass::ErrorResponse
    ) {
        msg.add_attribute(Attribute::new(
            AttributeType::XorMappedAddress,
            AttributeValue::XorMappedAddress(mapped),
        ));
    }

    let unsigned = msg.encode(None, false)?;
    let mut buf = BytesMut::from(&unsigned[..]);
    if buf.len() >= HEADER_SIZE {
        buf[4..8].copy_from_slice(&params.magic.to_be_bytes());
    }
    let signed = append_integrity(&buf, password.as_bytes())?;
    add_fingerprint(&signed)
}

/// Non-blocking client-facing transport.
///
/// `send` targets the accepted stream (TCP/TLS); `send_to` the datagram
/// client address. The session treats `send` failures as fatal and
/// `send_to` failures as droppable, per the transport reliability model.
pub trait ClientSocket: Send {
    fn send(&mut self, data: Bytes) -> io::Result<()>;
    fn send_to(&mut self, addr: SocketAddr, data: Bytes) -> io::Result<()>;
}

/// Datagram client socket over a bound UDP socket
pub struct UdpClientSocket {
    socket: Arc<tokio::net::UdpSocket>,
}

impl UdpClientSocket {
    pub fn new(socket: Arc<tokio::net::UdpSocket>) -> Self {
        Self { socket }
    }
}

impl ClientSocket for UdpClientSocket {
    fn send(&mut self, _data: Bytes) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Datagram socket has no connected stream",
        ))
    }

    fn send_to(&mut self, addr: SocketAddr, data: Bytes) -> io::Result<()> {
        self.socket.try_send_to(&data, addr).map(|_| ())
    }
}

/// Stream client socket handing frames to a writer task owned by the
/// transport layer
pub struct StreamClientSocket {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl StreamClientSocket {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }
}

impl ClientSocket for StreamClientSocket {
    fn send(&mut self, data: Bytes) -> io::Result<()> {
        self.tx
            .send(data)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "Client writer gone"))
    }

    fn send_to(&mut self, _addr: SocketAddr, data: Bytes) -> io::Result<()> {
        self.send(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::auth::verify_integrity;

    #[test]
    fn test_decode_check_extracts_attributes() {
        let trid = TransactionId::random();
        let mut msg = Message::new(MessageType::BindingRequest, trid);
        msg.add_attribute(Attribute::new(
            AttributeType::Username,
            AttributeValue::Username("rfrag:lfrag".into()),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::Priority,
            AttributeValue::Priority(1234),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::UseCandidate,
            AttributeValue::UseCandidate,
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::IceControlling,
            AttributeValue::IceControlling(99),
        ));
        let raw = msg.encode(None, false).unwrap();

        let params = decode_check(&raw).unwrap();
        assert_eq!(params.class, MessageClass::Request);
        assert_eq!(params.magic, crate::stun::protocol::MAGIC_COOKIE);
        assert_eq!(params.trid, trid);
        assert_eq!(params.username.as_deref(), Some("rfrag:lfrag"));
        assert_eq!(params.priority, Some(1234));
        assert!(params.use_candidate);
        assert_eq!(params.ice_controlling, Some(99));
        assert_eq!(params.ice_controlled, None);
    }

    #[test]
    fn test_decode_check_rejects_non_binding() {
        let msg = Message::new(MessageType::AllocateRequest, TransactionId::random());
        let raw = msg.encode(None, false).unwrap();
        assert!(decode_check(&raw).is_err());
    }

    #[test]
    fn test_encode_check_response_has_mapped_address() {
        let params = CheckParams {
            class: MessageClass::SuccessResponse,
            magic: crate::stun::protocol::MAGIC_COOKIE,
            trid: TransactionId::random(),
            username: None,
            priority: None,
            use_candidate: false,
            ice_controlled: None,
            ice_controlling: None,
            error_code: None,
        };
        let mapped: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let encoded = encode_check(&params, "ice-pass", mapped).unwrap();

        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded.message_type, MessageType::BindingResponse);
        assert_eq!(
            decoded
                .get_attribute(AttributeType::XorMappedAddress)
                .map(|a| &a.value),
            Some(&AttributeValue::XorMappedAddress(mapped))
        );
        assert!(decoded.has_attribute(AttributeType::Fingerprint));
        assert!(verify_integrity(&encoded, b"ice-pass").unwrap());
    }

    #[test]
    fn test_encode_check_request_has_no_mapped_address() {
        let params = CheckParams {
            class: MessageClass::Request,
            magic: crate::stun::protocol::MAGIC_COOKIE,
            trid: TransactionId::random(),
            username: Some("a:b".into()),
            priority: Some(7),
            use_candidate: true,
            ice_controlled: None,
            ice_controlling: Some(1),
            error_code: None,
        };
        let encoded =
            encode_check(&params, "pw", "127.0.0.1:50000".parse().unwrap()).unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded.message_type, MessageType::BindingRequest);
        assert!(!decoded.has_attribute(AttributeType::XorMappedAddress));
        assert!(decoded.has_attribute(AttributeType::UseCandidate));
    }
}
