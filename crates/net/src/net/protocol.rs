use std::fmt;
use std::time::Duration;

use super::codec::ByteCodec;
use super::message::MessageOptions;

pub const ETHERNET_MTU: usize = 1500;
pub const IP_HEADER_SIZE: usize = 40;
pub const UDP_HEADER_SIZE: usize = 8;
pub const PACKET_MTU: usize = ETHERNET_MTU - IP_HEADER_SIZE - UDP_HEADER_SIZE;

pub const PACKET_HEADER_SIZE: usize = 8;
pub const MESSAGE_LENGTH_SIZE: usize = 2;
pub const UNRELIABLE_MESSAGE_HEADER_SIZE: usize = 1;
pub const RELIABLE_MESSAGE_HEADER_SIZE: usize = 3;
pub const MAX_MESSAGE_PAYLOAD: usize =
    PACKET_MTU - PACKET_HEADER_SIZE - MESSAGE_LENGTH_SIZE - RELIABLE_MESSAGE_HEADER_SIZE;

pub const INVALID_ACK: u16 = 0xFFFF;
pub const INVALID_RELIABLE_ID: u16 = 0xFFFF;
pub const INVALID_MESSAGE_INDEX: u8 = 0xFF;
pub const INVALID_CONNECTION_INDEX: u8 = 0xFF;
pub const HOST_CONNECTION_INDEX: u8 = 0;

pub const ACK_HISTORY_BITS: u16 = 16;
pub const RELIABLE_RESEND_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_PORT: u16 = 10084;

/// Advances a 16-bit sequence, skipping the `0xFFFF` sentinel.
pub fn next_sequence(value: u16) -> u16 {
    let next = value.wrapping_add(1);
    if next == INVALID_ACK {
        next.wrapping_add(1)
    } else {
        next
    }
}

pub fn sequence_distance(newer: u16, older: u16) -> i16 {
    newer.wrapping_sub(older) as i16
}

pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    sequence_distance(s1, s2) > 0
}

/// Built-in message definitions. Their indices are fixed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoreMessage {
    Ping = 0,
    Pong = 1,
    Heartbeat = 2,
    JoinRequest = 3,
    JoinDeny = 4,
    JoinAccept = 5,
    NewConnection = 6,
    JoinFinished = 7,
    UpdateConnState = 8,
    Hangup = 9,
    SyncTime = 10,
    ObjectCreate = 11,
    ObjectDestroy = 12,
    ObjectUpdate = 13,
}

impl CoreMessage {
    pub const ALL: [CoreMessage; 14] = [
        CoreMessage::Ping,
        CoreMessage::Pong,
        CoreMessage::Heartbeat,
        CoreMessage::JoinRequest,
        CoreMessage::JoinDeny,
        CoreMessage::JoinAccept,
        CoreMessage::NewConnection,
        CoreMessage::JoinFinished,
        CoreMessage::UpdateConnState,
        CoreMessage::Hangup,
        CoreMessage::SyncTime,
        CoreMessage::ObjectCreate,
        CoreMessage::ObjectDestroy,
        CoreMessage::ObjectUpdate,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            CoreMessage::Ping => "net.ping",
            CoreMessage::Pong => "net.pong",
            CoreMessage::Heartbeat => "net.heartbeat",
            CoreMessage::JoinRequest => "net.join_request",
            CoreMessage::JoinDeny => "net.join_deny",
            CoreMessage::JoinAccept => "net.join_accept",
            CoreMessage::NewConnection => "net.new_connection",
            CoreMessage::JoinFinished => "net.join_finished",
            CoreMessage::UpdateConnState => "net.update_conn_state",
            CoreMessage::Hangup => "net.hangup",
            CoreMessage::SyncTime => "net.sync_time",
            CoreMessage::ObjectCreate => "net.object_create",
            CoreMessage::ObjectDestroy => "net.object_destroy",
            CoreMessage::ObjectUpdate => "net.object_update",
        }
    }

    pub fn options(self) -> MessageOptions {
        match self {
            CoreMessage::Ping
            | CoreMessage::Pong
            | CoreMessage::JoinRequest
            | CoreMessage::JoinDeny => MessageOptions::CONNECTIONLESS,
            CoreMessage::Heartbeat => MessageOptions::HEARTBEAT,
            CoreMessage::JoinAccept
            | CoreMessage::JoinFinished
            | CoreMessage::NewConnection
            | CoreMessage::UpdateConnState
            | CoreMessage::ObjectCreate
            | CoreMessage::ObjectDestroy => MessageOptions::RELIABLE_IN_ORDER,
            CoreMessage::Hangup | CoreMessage::SyncTime | CoreMessage::ObjectUpdate => {
                MessageOptions::empty()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JoinDenyReason {
    NotHost = 0,
    TableFull = 1,
    AllocationFailed = 2,
}

impl JoinDenyReason {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(JoinDenyReason::NotHost),
            1 => Some(JoinDenyReason::TableFull),
            2 => Some(JoinDenyReason::AllocationFailed),
            _ => None,
        }
    }
}

impl fmt::Display for JoinDenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinDenyReason::NotHost => write!(f, "peer is not hosting"),
            JoinDenyReason::TableFull => write!(f, "connection table is full"),
            JoinDenyReason::AllocationFailed => write!(f, "connection slot allocation failed"),
        }
    }
}

/// Fixed 8-byte packet header.
///
/// `previous_received_ack_bitfield` bit `i` set means ack
/// `last_received_ack - i - 1` was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sender_index: u8,
    pub ack: u16,
    pub last_received_ack: u16,
    pub previous_received_ack_bitfield: u16,
    pub message_count: u8,
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self {
            sender_index: INVALID_CONNECTION_INDEX,
            ack: INVALID_ACK,
            last_received_ack: INVALID_ACK,
            previous_received_ack_bitfield: 0,
            message_count: 0,
        }
    }
}

impl PacketHeader {
    pub fn write(&self, codec: &mut ByteCodec) -> bool {
        codec.write_u8(self.sender_index)
            && codec.write_u16(self.ack)
            && codec.write_u16(self.last_received_ack)
            && codec.write_u16(self.previous_received_ack_bitfield)
            && codec.write_u8(self.message_count)
    }

    /// Rewrites the header over bytes already reserved at `offset`.
    pub fn write_at(&self, codec: &mut ByteCodec, offset: usize) -> bool {
        let mut scratch = ByteCodec::fixed(PACKET_HEADER_SIZE).with_endianness(codec.endianness());
        self.write(&mut scratch) && codec.write_bytes_at(offset, scratch.as_slice())
    }

    pub fn read(codec: &mut ByteCodec) -> Option<Self> {
        Some(Self {
            sender_index: codec.read_u8()?,
            ack: codec.read_u16()?,
            last_received_ack: codec.read_u16()?,
            previous_received_ack_bitfield: codec.read_u16()?,
            message_count: codec.read_u8()?,
        })
    }
}
