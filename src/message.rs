use crate::utils::NodeId;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::BitOr;

pub const EXT_HEADER_LEN: usize = 6;
pub const INTL_MSG_LEN: usize = 9; // flags, ipv4, port, id
pub const INTERNAL_FLAG: u8 = 0x80;

/// Fixed-width, big-endian options so the header structs below are the wire layout.
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Datagram too short: {0} bytes")]
    TooShort(usize),
    #[error("Truncated body: header describes {expected} bytes, datagram has {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("Internal message carries no action bit")]
    NoInternalAction,
    #[error("Field of {0} bytes does not fit a 16-bit length")]
    FieldTooLong(usize),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Action bitmask of an external message.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Actions(pub u8);

impl Actions {
    pub const NONE: Actions = Actions(0);
    pub const DELETE: Actions = Actions(1);
    pub const SET: Actions = Actions(1 << 1);
    pub const GET: Actions = Actions(1 << 2);
    pub const ACK: Actions = Actions(1 << 3);
    pub const RESERVED_MASK: u8 = 0xF0;

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Actions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Actions) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Actions) {
        self.0 &= !other.0;
    }

    /// Drops the reserved high bits.
    pub fn known(self) -> Actions {
        Actions(self.0 & !Self::RESERVED_MASK)
    }
}

impl BitOr for Actions {
    type Output = Actions;

    fn bitor(self, rhs: Actions) -> Actions {
        Actions(self.0 | rhs.0)
    }
}

impl fmt::Debug for Actions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Actions::ACK, "ACK"),
            (Actions::DELETE, "DELETE"),
            (Actions::SET, "SET"),
            (Actions::GET, "GET"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ExternalHeader {
    action: u8,
    transaction: u8,
    key_len: u16,
    value_len: u16,
}

#[derive(Serialize, Deserialize)]
struct InternalFrame {
    flags: u8,
    ip: [u8; 4],
    port: u16,
    id: u16,
}

/// Identity of a ring member: identifier plus the address it listens on.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        NodeInfo { id, addr }
    }
}

impl fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id={} addr={}", self.id, self.addr)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InternalKind {
    Join,
    Notify,
    Stabilize,
}

impl InternalKind {
    pub fn mask(self) -> u8 {
        match self {
            InternalKind::Join => 1,
            InternalKind::Notify => 1 << 1,
            InternalKind::Stabilize => 1 << 2,
        }
    }

    /// JOIN wins over NOTIFY, which wins over STABILIZE.
    pub fn from_flags(flags: u8) -> Option<Self> {
        [
            InternalKind::Join,
            InternalKind::Notify,
            InternalKind::Stabilize,
        ]
        .into_iter()
        .find(|kind| flags & kind.mask() != 0)
    }
}

/// Ring-maintenance message: a JOIN, NOTIFY or STABILIZE carrying one node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InternalMessage {
    pub kind: InternalKind,
    pub node: NodeInfo,
}

impl InternalMessage {
    pub fn new(kind: InternalKind, node: NodeInfo) -> Self {
        InternalMessage { kind, node }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let frame = InternalFrame {
            flags: INTERNAL_FLAG | self.kind.mask(),
            ip: self.node.addr.ip().octets(),
            port: self.node.addr.port(),
            id: self.node.id.0,
        };
        Ok(wire_options().serialize(&frame)?)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, CodecError> {
        if datagram.len() < INTL_MSG_LEN {
            return Err(CodecError::TooShort(datagram.len()));
        }
        if datagram.len() != INTL_MSG_LEN {
            return Err(CodecError::LengthMismatch {
                expected: INTL_MSG_LEN,
                actual: datagram.len(),
            });
        }
        let frame: InternalFrame = wire_options().deserialize(datagram)?;
        let kind = InternalKind::from_flags(frame.flags).ok_or(CodecError::NoInternalAction)?;
        let addr = SocketAddrV4::new(Ipv4Addr::from(frame.ip), frame.port);
        Ok(InternalMessage::new(kind, NodeInfo::new(NodeId(frame.id), addr)))
    }
}

/// Client request or response.
#[derive(Clone, PartialEq, Eq)]
pub struct ExternalMessage {
    pub actions: Actions,
    pub transaction: u8,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl fmt::Debug for ExternalMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalMessage")
            .field("actions", &self.actions)
            .field("transaction", &self.transaction)
            .field("key", &hex::encode(&self.key))
            .field("value_len", &self.value.len())
            .finish()
    }
}

impl ExternalMessage {
    pub fn new(actions: Actions, transaction: u8, key: &[u8], value: &[u8]) -> Self {
        ExternalMessage {
            actions,
            transaction,
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    pub fn is_response(&self) -> bool {
        self.actions.contains(Actions::ACK)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let key_len = u16::try_from(self.key.len())
            .map_err(|_| CodecError::FieldTooLong(self.key.len()))?;
        let value_len = u16::try_from(self.value.len())
            .map_err(|_| CodecError::FieldTooLong(self.value.len()))?;
        let header = ExternalHeader {
            action: self.actions.bits(),
            transaction: self.transaction,
            key_len,
            value_len,
        };

        let mut out = wire_options().serialize(&header)?;
        out.reserve(self.key.len() + self.value.len());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
        Ok(out)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, CodecError> {
        if datagram.len() < EXT_HEADER_LEN {
            return Err(CodecError::TooShort(datagram.len()));
        }
        let header: ExternalHeader = wire_options().deserialize(&datagram[..EXT_HEADER_LEN])?;
        let key_end = EXT_HEADER_LEN + header.key_len as usize;
        let expected = key_end + header.value_len as usize;
        // bytes past the announced body are ignored
        if datagram.len() < expected {
            return Err(CodecError::LengthMismatch {
                expected,
                actual: datagram.len(),
            });
        }

        Ok(ExternalMessage {
            actions: Actions(header.action),
            transaction: header.transaction,
            key: datagram[EXT_HEADER_LEN..key_end].to_vec(),
            value: datagram[key_end..expected].to_vec(),
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Message {
    Internal(InternalMessage),
    External(ExternalMessage),
}

impl Message {
    /// Classifies by the high bit of the first byte.
    pub fn is_internal(datagram: &[u8]) -> bool {
        datagram.first().map_or(false, |b| b & INTERNAL_FLAG != 0)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, CodecError> {
        if datagram.is_empty() {
            return Err(CodecError::TooShort(0));
        }
        if Self::is_internal(datagram) {
            InternalMessage::decode(datagram).map(Message::Internal)
        } else {
            ExternalMessage::decode(datagram).map(Message::External)
        }
    }
}
