//! Strand wire format: every frame that crosses a link.
//!
//! Byte 0 of every frame is the message type. Data frames carry a fixed
//! 34-byte binary header (hashed node names, padded service names and the
//! hop budget) followed by the payload; the header is a zerocopy struct, so
//! parsing it never allocates. Control frames (routing updates, service
//! advertisements, rejects) are the type byte followed by a JSON body.
//!
//! Changing the header layout or the JSON field names is a breaking change
//! for every node in a mesh.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::addr::{name_hash, NodeHash, MAX_SERVICE_LEN};

// ── Message Type ──────────────────────────────────────────────────────────────

/// Leading byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Data = 0,
    Route = 1,
    ServiceAdvertisement = 2,
    Reject = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Data),
            1 => Ok(MessageType::Route),
            2 => Ok(MessageType::ServiceAdvertisement),
            3 => Ok(MessageType::Reject),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

// ── Data Header ───────────────────────────────────────────────────────────────

/// Fixed header of a data frame.
///
/// Wire size: 34 bytes. The payload follows immediately.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct DataHeader {
    /// Always `MessageType::Data`.
    pub msg_type: u8,
    /// `name_hash` of the originating node.
    pub from_node: U64<BigEndian>,
    /// `name_hash` of the destination node.
    pub to_node: U64<BigEndian>,
    /// Originating service, null-padded.
    pub from_service: [u8; MAX_SERVICE_LEN],
    /// Destination service, null-padded.
    pub to_service: [u8; MAX_SERVICE_LEN],
    /// Remaining forwarding budget. Checked and decremented at every forward.
    pub hops_to_live: u8,
}

assert_eq_size!(DataHeader, [u8; 34]);

pub const DATA_HEADER_LEN: usize = std::mem::size_of::<DataHeader>();

/// Pad a service name to its fixed wire width.
pub fn pad_service(name: &str) -> Result<[u8; MAX_SERVICE_LEN], WireError> {
    let raw = name.as_bytes();
    if raw.len() > MAX_SERVICE_LEN {
        return Err(WireError::ServiceNameTooLong(name.to_string()));
    }
    let mut out = [0u8; MAX_SERVICE_LEN];
    out[..raw.len()].copy_from_slice(raw);
    Ok(out)
}

/// Inverse of `pad_service`: strip trailing nulls.
pub fn unpad_service(raw: &[u8; MAX_SERVICE_LEN]) -> Result<String, WireError> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(MAX_SERVICE_LEN);
    std::str::from_utf8(&raw[..end])
        .map(str::to_string)
        .map_err(|_| WireError::InvalidServiceName)
}

// ── Message Data ──────────────────────────────────────────────────────────────

/// A routed data message with names resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageData {
    pub from_node: String,
    pub from_service: String,
    pub to_node: String,
    pub to_service: String,
    pub hops_to_live: u8,
    pub data: Bytes,
}

impl MessageData {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let header = DataHeader {
            msg_type: MessageType::Data.into(),
            from_node: U64::new(name_hash(&self.from_node)),
            to_node: U64::new(name_hash(&self.to_node)),
            from_service: pad_service(&self.from_service)?,
            to_service: pad_service(&self.to_service)?,
            hops_to_live: self.hops_to_live,
        };
        let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + self.data.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    /// Decode a data frame. Node hashes are turned back into names through
    /// `resolve`; a hash nobody has registered is an error.
    pub fn decode(
        frame: &Bytes,
        resolve: impl Fn(NodeHash) -> Option<String>,
    ) -> Result<Self, WireError> {
        let header = DataHeader::read_from_prefix(frame.as_ref())
            .ok_or(WireError::Truncated(frame.len()))?;
        if header.msg_type != u8::from(MessageType::Data) {
            return Err(WireError::UnexpectedType(header.msg_type));
        }
        let from_hash = header.from_node.get();
        let to_hash = header.to_node.get();
        Ok(Self {
            from_node: resolve(from_hash).ok_or(WireError::UnknownNode(from_hash))?,
            to_node: resolve(to_hash).ok_or(WireError::UnknownNode(to_hash))?,
            from_service: unpad_service(&header.from_service)?,
            to_service: unpad_service(&header.to_service)?,
            hops_to_live: header.hops_to_live,
            data: frame.slice(DATA_HEADER_LEN..),
        })
    }
}

// ── Control Bodies ────────────────────────────────────────────────────────────

/// Link-state announcement. Flooded through the mesh; `forwarding_node`
/// is rewritten at every hop, everything else is set by the originator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingUpdate {
    pub node_id: String,
    /// Random identifier used for duplicate suppression.
    pub update_id: String,
    /// Originator's process start time, unix nanos.
    pub update_epoch: u64,
    pub update_sequence: u64,
    /// Neighbor name → link cost, as seen by the originator.
    pub connections: BTreeMap<String, f64>,
    pub forwarding_node: String,
}

/// How a client should connect to an advertised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnType {
    Datagram,
    #[default]
    Stream,
    StreamTls,
}

/// Metadata about a service bound on some node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAdvertisement {
    pub node_id: String,
    pub service: String,
    /// Unix millis at which the originator produced this advertisement.
    pub time: u64,
    pub conn_type: ConnType,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Envelope for a flooded advertisement. `cancel` withdraws it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementFrame {
    #[serde(flatten)]
    pub ad: ServiceAdvertisement,
    #[serde(default)]
    pub cancel: bool,
}

/// Sent when a node refuses a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RejectFrame {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub reason: String,
}

// ── Unreachable ───────────────────────────────────────────────────────────────

/// Why a message could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Problem {
    #[serde(rename = "service unknown")]
    ServiceUnknown,
    #[serde(rename = "message expired")]
    ExpiredInTransit,
    #[serde(rename = "blocked by firewall")]
    Rejected,
    #[serde(rename = "no route to node")]
    NoRoute,
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Problem::ServiceUnknown => "service unknown",
            Problem::ExpiredInTransit => "message expired",
            Problem::Rejected => "blocked by firewall",
            Problem::NoRoute => "no route to node",
        })
    }
}

/// Payload of a data message sent to the reserved `unreach` service.
/// The address fields describe the message that failed, not this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreachableMessage {
    pub from_node: String,
    pub to_node: String,
    pub from_service: String,
    pub to_service: String,
    pub problem: Problem,
}

impl UnreachableMessage {
    pub fn about(msg: &MessageData, problem: Problem) -> Self {
        Self {
            from_node: msg.from_node.clone(),
            to_node: msg.to_node.clone(),
            from_service: msg.from_service.clone(),
            to_service: msg.to_service.clone(),
            problem,
        }
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// A classified frame. Data frames stay raw until the engine resolves
/// their node hashes.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(Bytes),
    Route(RoutingUpdate),
    ServiceAdvertisement(AdvertisementFrame),
    Reject(RejectFrame),
}

impl Frame {
    pub fn decode(buf: Bytes) -> Result<Self, WireError> {
        let first = *buf.first().ok_or(WireError::Empty)?;
        let body = &buf[1..];
        match MessageType::try_from(first)? {
            MessageType::Data => Ok(Frame::Data(buf)),
            MessageType::Route => Ok(Frame::Route(json_body("route", body)?)),
            MessageType::ServiceAdvertisement => Ok(Frame::ServiceAdvertisement(json_body(
                "service advertisement",
                body,
            )?)),
            MessageType::Reject if body.is_empty() => Ok(Frame::Reject(RejectFrame::default())),
            MessageType::Reject => Ok(Frame::Reject(json_body("reject", body)?)),
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        match self {
            Frame::Data(raw) => Ok(raw.clone()),
            Frame::Route(update) => json_frame(MessageType::Route, update),
            Frame::ServiceAdvertisement(ad) => json_frame(MessageType::ServiceAdvertisement, ad),
            Frame::Reject(reject) => json_frame(MessageType::Reject, reject),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Data(_) => MessageType::Data,
            Frame::Route(_) => MessageType::Route,
            Frame::ServiceAdvertisement(_) => MessageType::ServiceAdvertisement,
            Frame::Reject(_) => MessageType::Reject,
        }
    }
}

fn json_body<T>(kind: &'static str, body: &[u8]) -> Result<T, WireError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_slice(body).map_err(|e| WireError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

fn json_frame<T: Serialize>(msg_type: MessageType, body: &T) -> Result<Bytes, WireError> {
    let json = serde_json::to_vec(body).map_err(|e| WireError::Malformed {
        kind: "outgoing",
        reason: e.to_string(),
    })?;
    let mut buf = BytesMut::with_capacity(1 + json.len());
    buf.put_u8(msg_type.into());
    buf.put_slice(&json);
    Ok(buf.freeze())
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Reserved service answering every datagram with an empty reply.
pub const PING_SERVICE: &str = "ping";

/// Reserved service receiving `UnreachableMessage` notifications.
pub const UNREACH_SERVICE: &str = "unreach";

pub const RESERVED_SERVICES: [&str; 2] = [PING_SERVICE, UNREACH_SERVICE];

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,

    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("expected a data frame, got type 0x{0:02x}")]
    UnexpectedType(u8),

    #[error("data frame truncated: {0} bytes is shorter than the header")]
    Truncated(usize),

    #[error("service name {0:?} is longer than {} bytes", MAX_SERVICE_LEN)]
    ServiceNameTooLong(String),

    #[error("service name is not valid UTF-8")]
    InvalidServiceName,

    #[error("unknown node hash {0:016x}")]
    UnknownNode(NodeHash),

    #[error("malformed {kind} frame: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
