// src/stun/protocol.rs
//! STUN message encoding/decoding
//!
//! Covers the wire surface the allocation session needs:
//! - Binding (ICE connectivity checks), Allocate, Refresh, Send/Data
//!   indications, CreatePermission, ChannelBind
//! - XOR-coded addresses, MESSAGE-INTEGRITY (HMAC-SHA1), FINGERPRINT
//! - TURN ChannelData framing

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

use super::auth::{fingerprint_value, message_integrity};
use crate::error::{RelayResult, StunError};

/// STUN magic cookie (RFC 5389)
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN message header size
pub const HEADER_SIZE: usize = 20;

/// Maximum STUN message size accepted by the decoder
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// REQUESTED-TRANSPORT protocol number for UDP
pub const TRANSPORT_UDP: u8 = 17;

/// REQUESTED-ADDRESS-FAMILY value for IPv4
pub const FAMILY_IPV4: u8 = 0x01;

/// REQUESTED-ADDRESS-FAMILY value for IPv6
pub const FAMILY_IPV6: u8 = 0x02;

/// Lowest valid channel number (RFC 5766 Section 11)
pub const CHANNEL_MIN: u16 = 0x4000;

/// Highest valid channel number
pub const CHANNEL_MAX: u16 = 0x7FFE;

/// STUN message types used by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    // STUN / ICE Binding (RFC 5389, RFC 8445)
    BindingRequest = 0x0001,
    BindingIndication = 0x0011,
    BindingResponse = 0x0101,
    BindingError = 0x0111,

    // TURN (RFC 5766)
    AllocateRequest = 0x0003,
    AllocateResponse = 0x0103,
    AllocateError = 0x0113,
    RefreshRequest = 0x0004,
    RefreshResponse = 0x0104,
    RefreshError = 0x0114,
    SendIndication = 0x0016,
    DataIndication = 0x0017,
    CreatePermissionRequest = 0x0008,
    CreatePermissionResponse = 0x0108,
    CreatePermissionError = 0x0118,
    ChannelBindRequest = 0x0009,
    ChannelBindResponse = 0x0109,
    ChannelBindError = 0x0119,
}

impl MessageType {
    /// Get message class from the two class bits
    pub fn class(&self) -> MessageClass {
        match (*self as u16) & 0x0110 {
            0x0000 => MessageClass::Request,
            0x0010 => MessageClass::Indication,
            0x0100 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }

    /// Get the 12-bit method
    pub fn method(&self) -> u16 {
        let value = *self as u16;
        (value & 0x000F) | ((value & 0x00E0) >> 1) | ((value & 0x3E00) >> 2)
    }

    /// Rebuild a message type from method and class bits
    pub fn from_method_class(method: u16, class: MessageClass) -> Option<Self> {
        if method > 0x0FFF {
            return None;
        }

        let m0 = method & 0x000F;
        let m1 = (method & 0x0070) << 1;
        let m2 = (method & 0x0F80) << 2;

        let class_bits = match class {
            MessageClass::Request => 0x0000,
            MessageClass::Indication => 0x0010,
            MessageClass::SuccessResponse => 0x0100,
            MessageClass::ErrorResponse => 0x0110,
        };

        Self::from_value(m0 | m1 | m2 | class_bits)
    }

    /// Map a raw type field to a known message type
    pub fn from_value(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::BindingRequest),
            0x0011 => Some(Self::BindingIndication),
            0x0101 => Some(Self::BindingResponse),
            0x0111 => Some(Self::BindingError),
            0x0003 => Some(Self::AllocateRequest),
            0x0103 => Some(Self::AllocateResponse),
            0x0113 => Some(Self::AllocateError),
            0x0004 => Some(Self::RefreshRequest),
            0x0104 => Some(Self::RefreshResponse),
            0x0114 => Some(Self::RefreshError),
            0x0016 => Some(Self::SendIndication),
            0x0017 => Some(Self::DataIndication),
            0x0008 => Some(Self::CreatePermissionRequest),
            0x0108 => Some(Self::CreatePermissionResponse),
            0x0118 => Some(Self::CreatePermissionError),
            0x0009 => Some(Self::ChannelBindRequest),
            0x0109 => Some(Self::ChannelBindResponse),
            0x0119 => Some(Self::ChannelBindError),
            _ => None,
        }
    }

    /// The error-response counterpart of this type's method
    pub fn error_counterpart(&self) -> Self {
        Self::from_method_class(self.method(), MessageClass::ErrorResponse)
            .unwrap_or(Self::BindingError)
    }

    /// The success-response counterpart of this type's method
    pub fn success_counterpart(&self) -> Self {
        Self::from_method_class(self.method(), MessageClass::SuccessResponse)
            .unwrap_or(Self::BindingResponse)
    }

    pub fn is_request(&self) -> bool {
        matches!(self.class(), MessageClass::Request)
    }

    pub fn is_indication(&self) -> bool {
        matches!(self.class(), MessageClass::Indication)
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self.class(),
            MessageClass::SuccessResponse | MessageClass::ErrorResponse
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BindingRequest => "Binding Request",
            Self::BindingIndication => "Binding Indication",
            Self::BindingResponse => "Binding Response",
            Self::BindingError => "Binding Error",
            Self::AllocateRequest => "Allocate Request",
            Self::AllocateResponse => "Allocate Response",
            Self::AllocateError => "Allocate Error",
            Self::RefreshRequest => "Refresh Request",
            Self::RefreshResponse => "Refresh Response",
            Self::RefreshError => "Refresh Error",
            Self::SendIndication => "Send Indication",
            Self::DataIndication => "Data Indication",
            Self::CreatePermissionRequest => "CreatePermission Request",
            Self::CreatePermissionResponse => "CreatePermission Response",
            Self::CreatePermissionError => "CreatePermission Error",
            Self::ChannelBindRequest => "ChannelBind Request",
            Self::ChannelBindResponse => "ChannelBind Response",
            Self::ChannelBindError => "ChannelBind Error",
        };
        write!(f, "{}", name)
    }
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

/// STUN attribute types used by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Username,
    MessageIntegrity,
    ErrorCode,
    UnknownAttributes,
    ChannelNumber,
    Lifetime,
    XorPeerAddress,
    Data,
    Realm,
    Nonce,
    XorRelayedAddress,
    RequestedAddressFamily,
    RequestedTransport,
    DontFragment,
    XorMappedAddress,
    Priority,
    UseCandidate,
    Software,
    Fingerprint,
    IceControlled,
    IceControlling,
    Raw(u16),
}

impl AttributeType {
    /// Numeric wire value
    pub fn value(&self) -> u16 {
        match self {
            Self::Username => 0x0006,
            Self::MessageIntegrity => 0x0008,
            Self::ErrorCode => 0x0009,
            Self::UnknownAttributes => 0x000A,
            Self::ChannelNumber => 0x000C,
            Self::Lifetime => 0x000D,
            Self::XorPeerAddress => 0x0012,
            Self::Data => 0x0013,
            Self::Realm => 0x0014,
            Self::Nonce => 0x0015,
            Self::XorRelayedAddress => 0x0016,
            Self::RequestedAddressFamily => 0x0017,
            Self::RequestedTransport => 0x0019,
            Self::DontFragment => 0x001A,
            Self::XorMappedAddress => 0x0020,
            Self::Priority => 0x0024,
            Self::UseCandidate => 0x0025,
            Self::Software => 0x8022,
            Self::Fingerprint => 0x8028,
            Self::IceControlled => 0x8029,
            Self::IceControlling => 0x802A,
            Self::Raw(value) => *value,
        }
    }

    /// Map a wire value back to a known attribute type
    pub fn from_value(value: u16) -> Self {
        match value {
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000A => Self::UnknownAttributes,
            0x000C => Self::ChannelNumber,
            0x000D => Self::Lifetime,
            0x0012 => Self::XorPeerAddress,
            0x0013 => Self::Data,
            0x0014 => Self::Realm,
            0x0015 => Self::Nonce,
            0x0016 => Self::XorRelayedAddress,
            0x0017 => Self::RequestedAddressFamily,
            0x0019 => Self::RequestedTransport,
            0x001A => Self::DontFragment,
            0x0020 => Self::XorMappedAddress,
            0x0024 => Self::Priority,
            0x0025 => Self::UseCandidate,
            0x8022 => Self::Software,
            0x8028 => Self::Fingerprint,
            0x8029 => Self::IceControlled,
            0x802A => Self::IceControlling,
            other => Self::Raw(other),
        }
    }

    /// Comprehension-required attributes live below 0x8000
    pub fn is_comprehension_required(&self) -> bool {
        self.value() < 0x8000
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Username => "USERNAME",
            Self::MessageIntegrity => "MESSAGE-INTEGRITY",
            Self::ErrorCode => "ERROR-CODE",
            Self::UnknownAttributes => "UNKNOWN-ATTRIBUTES",
            Self::ChannelNumber => "CHANNEL-NUMBER",
            Self::Lifetime => "LIFETIME",
            Self::XorPeerAddress => "XOR-PEER-ADDRESS",
            Self::Data => "DATA",
            Self::Realm => "REALM",
            Self::Nonce => "NONCE",
            Self::XorRelayedAddress => "XOR-RELAYED-ADDRESS",
            Self::RequestedAddressFamily => "REQUESTED-ADDRESS-FAMILY",
            Self::RequestedTransport => "REQUESTED-TRANSPORT",
            Self::DontFragment => "DONT-FRAGMENT",
            Self::XorMappedAddress => "XOR-MAPPED-ADDRESS",
            Self::Priority => "PRIORITY",
            Self::UseCandidate => "USE-CANDIDATE",
            Self::Software => "SOFTWARE",
            Self::Fingerprint => "FINGERPRINT",
            Self::IceControlled => "ICE-CONTROLLED",
            Self::IceControlling => "ICE-CONTROLLING",
            Self::Raw(value) => return write!(f, "UNKNOWN-{:04X}", value),
        };
        write!(f, "{}", name)
    }
}

/// STUN transaction ID (96 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate a random transaction ID
    pub fn random() -> Self {
        let mut id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// Derive a transaction ID from a sequence counter, for
    /// server-originated Data indications
    pub fn from_seq(seq: u64) -> Self {
        let mut id = [0u8; 12];
        id[4..].copy_from_slice(&seq.to_be_bytes());
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> RelayResult<Self> {
        if slice.len() != 12 {
            return Err(StunError::InvalidMessage(format!(
                "Transaction ID must be 12 bytes, got {}",
                slice.len()
            ))
            .into());
        }
        let mut id = [0u8; 12];
        id.copy_from_slice(slice);
        Ok(Self(id))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: AttributeType,
    pub value: AttributeValue,
}

/// Decoded STUN attribute values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    // Address attributes (XOR coded on the wire)
    XorMappedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),

    // String attributes
    Username(String),
    Realm(String),
    Software(String),

    // Binary attributes
    Nonce(Vec<u8>),
    MessageIntegrity(Vec<u8>),
    Data(Vec<u8>),

    ErrorCode { code: u16, reason: String },

    // Numeric attributes
    ChannelNumber(u16),
    Lifetime(u32),
    Priority(u32),
    Fingerprint(u32),
    IceControlled(u64),
    IceControlling(u64),

    // Flag attributes (presence indicates true)
    UseCandidate,
    DontFragment,

    RequestedTransport(u8),
    RequestedAddressFamily(u8),
    UnknownAttributes(Vec<u16>),

    Raw(Vec<u8>),
}

impl Attribute {
    pub fn new(attr_type: AttributeType, value: AttributeValue) -> Self {
        Self { attr_type, value }
    }

    /// Encode attribute into the buffer, header + value + padding
    fn encode(&self, buf: &mut BytesMut, tid: &TransactionId) {
        buf.put_u16(self.attr_type.value());
        let len_pos = buf.len();
        buf.put_u16(0);

        let value_start = buf.len();
        match &self.value {
            AttributeValue::XorMappedAddress(addr)
            | AttributeValue::XorPeerAddress(addr)
            | AttributeValue::XorRelayedAddress(addr) => {
                encode_xor_address(buf, addr, tid);
            }
            AttributeValue::Username(s)
            | AttributeValue::Realm(s)
            | AttributeValue::Software(s) => {
                buf.put_slice(s.as_bytes());
            }
            AttributeValue::Nonce(v)
            | AttributeValue::MessageIntegrity(v)
            | AttributeValue::Data(v)
            | AttributeValue::Raw(v) => {
                buf.put_slice(v);
            }
            AttributeValue::ErrorCode { code, reason } => {
                buf.put_u16(0);
                buf.put_u8((code / 100) as u8);
                buf.put_u8((code % 100) as u8);
                buf.put_slice(reason.as_bytes());
            }
            AttributeValue::ChannelNumber(num) => {
                buf.put_u16(*num);
                buf.put_u16(0);
            }
            AttributeValue::Lifetime(v) | AttributeValue::Priority(v) => {
                buf.put_u32(*v);
            }
            AttributeValue::Fingerprint(v) => {
                buf.put_u32(*v);
            }
            AttributeValue::IceControlled(v) | AttributeValue::IceControlling(v) => {
                buf.put_u64(*v);
            }
            AttributeValue::UseCandidate | AttributeValue::DontFragment => {}
            AttributeValue::RequestedTransport(proto) => {
                buf.put_u8(*proto);
                buf.put_u8(0);
                buf.put_u16(0);
            }
            AttributeValue::RequestedAddressFamily(family) => {
                buf.put_u8(*family);
                buf.put_u8(0);
                buf.put_u16(0);
            }
            AttributeValue::UnknownAttributes(attrs) => {
                for attr in attrs {
                    buf.put_u16(*attr);
                }
            }
        }

        let value_len = buf.len() - value_start;
        buf[len_pos..len_pos + 2].copy_from_slice(&(value_len as u16).to_be_bytes());

        let padding = (4 - (value_len % 4)) % 4;
        for _ in 0..padding {
            buf.put_u8(0);
        }
    }

    /// Decode one attribute from the buffer
    fn decode(buf: &mut BytesMut, tid: &TransactionId) -> RelayResult<Self> {
        if buf.remaining() < 4 {
            return Err(StunError::InvalidMessage("Attribute header too short".into()).into());
        }

        let attr_type = AttributeType::from_value(buf.get_u16());
        let attr_length = buf.get_u16() as usize;

        if buf.remaining() < attr_length {
            return Err(StunError::InvalidMessage(format!(
                "Attribute {} truncated: expected {} bytes, got {}",
                attr_type,
                attr_length,
                buf.remaining()
            ))
            .into());
        }

        let mut value_buf = buf.split_to(attr_length);
        let padding = (4 - (attr_length % 4)) % 4;
        if buf.remaining() >= padding {
            buf.advance(padding);
        }

        let value = match attr_type {
            AttributeType::XorMappedAddress => {
                AttributeValue::XorMappedAddress(decode_xor_address(&mut value_buf, tid)?)
            }
            AttributeType::XorPeerAddress => {
                AttributeValue::XorPeerAddress(decode_xor_address(&mut value_buf, tid)?)
            }
            AttributeType::XorRelayedAddress => {
                AttributeValue::XorRelayedAddress(decode_xor_address(&mut value_buf, tid)?)
            }
            AttributeType::Username => AttributeValue::Username(decode_string(&value_buf)?),
            AttributeType::Realm => AttributeValue::Realm(decode_string(&value_buf)?),
            AttributeType::Software => AttributeValue::Software(decode_string(&value_buf)?),
            AttributeType::Nonce => AttributeValue::Nonce(value_buf.to_vec()),
            AttributeType::MessageIntegrity => {
                if value_buf.len() != 20 {
                    return Err(
                        StunError::InvalidMessage("MESSAGE-INTEGRITY must be 20 bytes".into())
                            .into(),
                    );
                }
                AttributeValue::MessageIntegrity(value_buf.to_vec())
            }
            AttributeType::Data => AttributeValue::Data(value_buf.to_vec()),
            AttributeType::ErrorCode => {
                if value_buf.len() < 4 {
                    return Err(StunError::InvalidMessage("ERROR-CODE too short".into()).into());
                }
                value_buf.advance(2);
                let class = value_buf.get_u8() as u16;
                let number = value_buf.get_u8() as u16;
                let reason = decode_string(&value_buf)?;
                AttributeValue::ErrorCode {
                    code: class * 100 + number,
                    reason,
                }
            }
            AttributeType::ChannelNumber => {
                if value_buf.len() != 4 {
                    return Err(
                        StunError::InvalidMessage("CHANNEL-NUMBER must be 4 bytes".into()).into()
                    );
                }
                AttributeValue::ChannelNumber(value_buf.get_u16())
            }
            AttributeType::Lifetime => {
                if value_buf.len() != 4 {
                    return Err(StunError::InvalidMessage("LIFETIME must be 4 bytes".into()).into());
                }
                AttributeValue::Lifetime(value_buf.get_u32())
            }
            AttributeType::Priority => {
                if value_buf.len() != 4 {
                    return Err(StunError::InvalidMessage("PRIORITY must be 4 bytes".into()).into());
                }
                AttributeValue::Priority(value_buf.get_u32())
            }
            AttributeType::Fingerprint => {
                if value_buf.len() != 4 {
                    return Err(
                        StunError::InvalidMessage("FINGERPRINT must be 4 bytes".into()).into()
                    );
                }
                AttributeValue::Fingerprint(value_buf.get_u32())
            }
            AttributeType::IceControlled => {
                if value_buf.len() != 8 {
                    return Err(
                        StunError::InvalidMessage("ICE-CONTROLLED must be 8 bytes".into()).into(),
                    );
                }
                AttributeValue::IceControlled(value_buf.get_u64())
            }
            AttributeType::IceControlling => {
                if value_buf.len() != 8 {
                    return Err(
                        StunError::InvalidMessage("ICE-CONTROLLING must be 8 bytes".into()).into(),
                    );
                }
                AttributeValue::IceControlling(value_buf.get_u64())
            }
            AttributeType::UseCandidate => AttributeValue::UseCandidate,
            AttributeType::DontFragment => AttributeValue::DontFragment,
            AttributeType::RequestedTransport => {
                if value_buf.len() != 4 {
                    return Err(StunError::InvalidMessage(
                        "REQUESTED-TRANSPORT must be 4 bytes".into(),
                    )
                    .into());
                }
                AttributeValue::RequestedTransport(value_buf.get_u8())
            }
            AttributeType::RequestedAddressFamily => {
                if value_buf.len() != 4 {
                    return Err(StunError::InvalidMessage(
                        "REQUESTED-ADDRESS-FAMILY must be 4 bytes".into(),
                    )
                    .into());
                }
                AttributeValue::RequestedAddressFamily(value_buf.get_u8())
            }
            AttributeType::UnknownAttributes => {
                let mut attrs = Vec::new();
                while value_buf.remaining() >= 2 {
                    attrs.push(value_buf.get_u16());
                }
                AttributeValue::UnknownAttributes(attrs)
            }
            AttributeType::Raw(_) => AttributeValue::Raw(value_buf.to_vec()),
        };

        Ok(Attribute::new(attr_type, value))
    }
}

/// Complete STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl Message {
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Build an error response for a request, with ERROR-CODE filled from
    /// the standard reason table
    pub fn error_response(request: &Message, code: u16) -> Self {
        let mut resp = Self::new(
            request.message_type.error_counterpart(),
            request.transaction_id,
        );
        resp.add_attribute(Attribute::new(
            AttributeType::ErrorCode,
            AttributeValue::ErrorCode {
                code,
                reason: error_reason(code).to_string(),
            },
        ));
        resp
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn get_attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    pub fn get_attributes(&self, attr_type: AttributeType) -> Vec<&Attribute> {
        self.attributes
            .iter()
            .filter(|a| a.attr_type == attr_type)
            .collect()
    }

    pub fn has_attribute(&self, attr_type: AttributeType) -> bool {
        self.attributes.iter().any(|a| a.attr_type == attr_type)
    }

    /// All XOR-PEER-ADDRESS values, in attribute order
    pub fn peer_addresses(&self) -> Vec<SocketAddr> {
        self.get_attributes(AttributeType::XorPeerAddress)
            .into_iter()
            .filter_map(|a| match a.value {
                AttributeValue::XorPeerAddress(addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    /// LIFETIME attribute value in seconds, if present
    pub fn lifetime(&self) -> Option<u32> {
        match self.get_attribute(AttributeType::Lifetime).map(|a| &a.value) {
            Some(AttributeValue::Lifetime(secs)) => Some(*secs),
            _ => None,
        }
    }

    /// Encode to bytes. `key` signs the message with MESSAGE-INTEGRITY,
    /// `with_fingerprint` appends a FINGERPRINT attribute.
    pub fn encode(&self, key: Option<&[u8]>, with_fingerprint: bool) -> RelayResult<Bytes> {
        let mut buf = BytesMut::with_capacity(128);

        buf.put_u16(self.message_type as u16);
        buf.put_u16(0); // length, patched below
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            match attr.attr_type {
                // Always computed fresh at the end of encoding
                AttributeType::MessageIntegrity | AttributeType::Fingerprint => continue,
                _ => attr.encode(&mut buf, &self.transaction_id),
            }
        }

        if let Some(key) = key {
            // Length must cover the integrity attribute itself (RFC 5389 15.4)
            let length = buf.len() - HEADER_SIZE + 24;
            buf[2..4].copy_from_slice(&(length as u16).to_be_bytes());

            let hmac = message_integrity(&buf, key);
            Attribute::new(
                AttributeType::MessageIntegrity,
                AttributeValue::MessageIntegrity(hmac.to_vec()),
            )
            .encode(&mut buf, &self.transaction_id);
        }

        if with_fingerprint {
            let length = buf.len() - HEADER_SIZE + 8;
            buf[2..4].copy_from_slice(&(length as u16).to_be_bytes());

            let crc = fingerprint_value(&buf);
            Attribute::new(
                AttributeType::Fingerprint,
                AttributeValue::Fingerprint(crc),
            )
            .encode(&mut buf, &self.transaction_id);
        }

        let final_length = buf.len() - HEADER_SIZE;
        buf[2..4].copy_from_slice(&(final_length as u16).to_be_bytes());

        Ok(buf.freeze())
    }

    /// Decode from bytes
    pub fn decode(data: &[u8]) -> RelayResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(StunError::InvalidMessage("Message too short".into()).into());
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(StunError::InvalidMessage("Message too long".into()).into());
        }

        let mut buf = BytesMut::from(data);

        let type_value = buf.get_u16();
        let message_length = buf.get_u16() as usize;
        let magic = buf.get_u32();
        if magic != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie(magic).into());
        }

        let transaction_id = TransactionId::from_slice(&buf.split_to(12))?;

        if buf.len() < message_length {
            return Err(StunError::InvalidMessage(format!(
                "Message length mismatch: header says {}, got {}",
                message_length,
                buf.len()
            ))
            .into());
        }
        buf.truncate(message_length);

        let message_type =
            MessageType::from_value(type_value).ok_or(StunError::InvalidMessageType(type_value))?;

        let mut message = Message::new(message_type, transaction_id);
        while buf.has_remaining() {
            message.add_attribute(Attribute::decode(&mut buf, &transaction_id)?);
        }

        Ok(message)
    }
}

/// TURN ChannelData frame: `(channel, length, data)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub channel: u16,
    pub data: Bytes,
}

impl ChannelData {
    pub fn new(channel: u16, data: Bytes) -> Self {
        Self { channel, data }
    }

    /// Encode into the 4-byte-header framing
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.data.len());
        buf.put_u16(self.channel);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decode a ChannelData frame
    pub fn decode(data: &[u8]) -> RelayResult<Self> {
        if data.len() < 4 {
            return Err(StunError::InvalidMessage("ChannelData too short".into()).into());
        }
        let channel = u16::from_be_bytes([data[0], data[1]]);
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if !(CHANNEL_MIN..=CHANNEL_MAX).contains(&channel) {
            return Err(
                StunError::InvalidMessage(format!("Invalid channel number {:#06x}", channel))
                    .into(),
            );
        }
        if data.len() < 4 + length {
            return Err(StunError::InvalidMessage("ChannelData truncated".into()).into());
        }
        Ok(Self {
            channel,
            data: Bytes::copy_from_slice(&data[4..4 + length]),
        })
    }
}

/// Whether a relay payload is a STUN message rather than raw media.
/// STUN message types have the two top bits clear, so the first byte of
/// any STUN packet is below 2; ChannelData frames start at 0x40.
pub fn looks_like_stun(payload: &[u8]) -> bool {
    matches!(payload.first(), Some(b) if *b < 2)
}

/// Standard reason phrase for the error codes the session emits
pub fn error_reason(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        403 => "Forbidden",
        420 => "Unknown Attribute",
        437 => "Allocation Mismatch",
        440 => "Address Family not Supported",
        442 => "Unsupported Transport Protocol",
        443 => "Peer Address Family Mismatch",
        486 => "Allocation Quota Reached",
        508 => "Insufficient Capacity",
        _ => "Error",
    }
}

/// Append a FINGERPRINT attribute to an already-encoded STUN packet
pub fn add_fingerprint(packet: &[u8]) -> RelayResult<Bytes> {
    if packet.len() < HEADER_SIZE {
        return Err(StunError::InvalidMessage("Packet too short for fingerprint".into()).into());
    }
    let mut buf = BytesMut::from(packet);
    let length = buf.len() - HEADER_SIZE + 8;
    buf[2..4].copy_from_slice(&(length as u16).to_be_bytes());

    let crc = fingerprint_value(&buf);
    buf.put_u16(AttributeType::Fingerprint.value());
    buf.put_u16(4);
    buf.put_u32(crc);
    Ok(buf.freeze())
}

fn encode_xor_address(buf: &mut BytesMut, addr: &SocketAddr, tid: &TransactionId) {
    let xor_port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(0);
            buf.put_u8(FAMILY_IPV4);
            buf.put_u16(xor_port);
            buf.put_u32(u32::from(v4) ^ MAGIC_COOKIE);
        }
        IpAddr::V6(v6) => {
            buf.put_u8(0);
            buf.put_u8(FAMILY_IPV6);
            buf.put_u16(xor_port);
            let mut xor_mask = [0u8; 16];
            xor_mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_mask[4..].copy_from_slice(tid.as_bytes());
            let octets = v6.octets();
            for i in 0..16 {
                buf.put_u8(octets[i] ^ xor_mask[i]);
            }
        }
    }
}

fn decode_xor_address(buf: &mut BytesMut, tid: &TransactionId) -> RelayResult<SocketAddr> {
    if buf.remaining() < 4 {
        return Err(StunError::InvalidMessage("Address attribute too short".into()).into());
    }
    buf.advance(1); // reserved
    let family = buf.get_u8();
    let port = buf.get_u16() ^ (MAGIC_COOKIE >> 16) as u16;

    let ip = match family {
        FAMILY_IPV4 => {
            if buf.remaining() < 4 {
                return Err(StunError::InvalidMessage("IPv4 address truncated".into()).into());
            }
            IpAddr::from((buf.get_u32() ^ MAGIC_COOKIE).to_be_bytes())
        }
        FAMILY_IPV6 => {
            if buf.remaining() < 16 {
                return Err(StunError::InvalidMessage("IPv6 address truncated".into()).into());
            }
            let mut xor_mask = [0u8; 16];
            xor_mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_mask[4..].copy_from_slice(tid.as_bytes());
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = buf.get_u8() ^ xor_mask[i];
            }
            IpAddr::from(octets)
        }
        other => return Err(StunError::InvalidAddressFamily(other).into()),
    };

    Ok(SocketAddr::new(ip, port))
}

fn decode_string(buf: &[u8]) -> RelayResult<String> {
    String::from_utf8(buf.to_vec())
        .map_err(|_| StunError::InvalidMessage("Invalid UTF-8 in string attribute".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_class_roundtrip() {
        let types = [
            MessageType::BindingRequest,
            MessageType::BindingResponse,
            MessageType::AllocateRequest,
            MessageType::AllocateError,
            MessageType::RefreshResponse,
            MessageType::SendIndication,
            MessageType::DataIndication,
            MessageType::CreatePermissionRequest,
            MessageType::ChannelBindResponse,
        ];
        for t in types {
            let rebuilt = MessageType::from_method_class(t.method(), t.class()).unwrap();
            assert_eq!(rebuilt, t);
        }
    }

    #[test]
    fn test_error_counterpart() {
        assert_eq!(
            MessageType::AllocateRequest.error_counterpart(),
            MessageType::AllocateError
        );
        assert_eq!(
            MessageType::RefreshRequest.success_counterpart(),
            MessageType::RefreshResponse
        );
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let tid = TransactionId::random();
        let mut msg = Message::new(MessageType::AllocateResponse, tid);
        msg.add_attribute(Attribute::new(
            AttributeType::XorRelayedAddress,
            AttributeValue::XorRelayedAddress("127.0.0.1:50000".parse().unwrap()),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::Lifetime,
            AttributeValue::Lifetime(700),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::XorMappedAddress,
            AttributeValue::XorMappedAddress("192.168.1.7:41000".parse().unwrap()),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::Software,
            AttributeValue::Software("turngate".into()),
        ));

        let encoded = msg.encode(None, false).unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_encode_decode_ipv6_xor_address() {
        let tid = TransactionId::random();
        let mut msg = Message::new(MessageType::SendIndication, tid);
        msg.add_attribute(Attribute::new(
            AttributeType::XorPeerAddress,
            AttributeValue::XorPeerAddress("[2001:db8::5]:6000".parse().unwrap()),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::Data,
            AttributeValue::Data(b"payload".to_vec()),
        ));

        let encoded = msg.encode(None, false).unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_binding_request_roundtrip() {
        let tid = TransactionId::random();
        let mut msg = Message::new(MessageType::BindingRequest, tid);
        msg.add_attribute(Attribute::new(
            AttributeType::Username,
            AttributeValue::Username("remote:local".into()),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::Priority,
            AttributeValue::Priority(0x6e_7f_1e_ff),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::UseCandidate,
            AttributeValue::UseCandidate,
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::IceControlling,
            AttributeValue::IceControlling(0x1234_5678_9abc_def0),
        ));

        let encoded = msg.encode(None, false).unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_error_code_roundtrip() {
        let req = Message::new(MessageType::AllocateRequest, TransactionId::random());
        let resp = Message::error_response(&req, 442);
        let encoded = resp.encode(None, false).unwrap();
        let decoded = Message::decode(&encoded).unwrap();

        match &decoded.get_attribute(AttributeType::ErrorCode).unwrap().value {
            AttributeValue::ErrorCode { code, reason } => {
                assert_eq!(*code, 442);
                assert_eq!(reason, "Unsupported Transport Protocol");
            }
            _ => panic!("Missing ERROR-CODE"),
        }
        assert_eq!(decoded.message_type, MessageType::AllocateError);
    }

    #[test]
    fn test_integrity_signed_message_verifies() {
        let key = b"0123456789abcdef";
        let mut msg = Message::new(MessageType::RefreshResponse, TransactionId::random());
        msg.add_attribute(Attribute::new(
            AttributeType::Lifetime,
            AttributeValue::Lifetime(600),
        ));

        let encoded = msg.encode(Some(key), false).unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert!(decoded.has_attribute(AttributeType::MessageIntegrity));
        assert!(super::super::auth::verify_integrity(&encoded, key).unwrap());
    }

    #[test]
    fn test_fingerprint_appended() {
        let msg = Message::new(MessageType::BindingResponse, TransactionId::random());
        let plain = msg.encode(None, false).unwrap();
        let with_fp = add_fingerprint(&plain).unwrap();
        assert_eq!(with_fp.len(), plain.len() + 8);

        let decoded = Message::decode(&with_fp).unwrap();
        assert!(decoded.has_attribute(AttributeType::Fingerprint));
    }

    #[test]
    fn test_channel_data_roundtrip() {
        let frame = ChannelData::new(0x4000, Bytes::from_static(b"hi"));
        let encoded = frame.encode();
        assert_eq!(&encoded[..], &[0x40, 0x00, 0x00, 0x02, b'h', b'i']);
        let decoded = ChannelData::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_channel_data_rejects_bad_channel() {
        assert!(ChannelData::decode(&[0x00, 0x01, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_looks_like_stun() {
        assert!(looks_like_stun(&[0x00, 0x01]));
        assert!(looks_like_stun(&[0x01, 0x13]));
        assert!(!looks_like_stun(&[0x40, 0x00]));
        assert!(!looks_like_stun(b"media"));
        assert!(!looks_like_stun(&[]));
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut raw = Message::new(MessageType::BindingRequest, TransactionId::random())
            .encode(None, false)
            .unwrap()
            .to_vec();
        raw[4] = 0xFF;
        assert!(Message::decode(&raw).is_err());
    }
}
