use std::net::SocketAddr;

use super::codec::ByteCodec;
use super::error::PacketError;
use super::message::{MessageRegistry, WireMessage};
use super::protocol::{
    INVALID_ACK, INVALID_RELIABLE_ID, PACKET_HEADER_SIZE, PACKET_MTU, PacketHeader,
    UNRELIABLE_MESSAGE_HEADER_SIZE,
};

/// Outgoing datagram under construction.
///
/// The header is reserved up front and rewritten by `finalize` once the
/// ack fields and message count are known.
#[derive(Debug, Clone)]
pub struct WirePacket {
    codec: ByteCodec,
    header: PacketHeader,
}

impl WirePacket {
    pub fn new(sender_index: u8) -> Self {
        let mut codec = ByteCodec::fixed(PACKET_MTU);
        let header = PacketHeader {
            sender_index,
            ..PacketHeader::default()
        };
        header.write(&mut codec);
        Self { codec, header }
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn message_count(&self) -> u8 {
        self.header.message_count
    }

    pub fn is_empty(&self) -> bool {
        self.header.message_count == 0
    }

    pub fn remaining_space(&self) -> usize {
        self.codec.remaining_capacity()
    }

    pub fn can_fit(&self, message: &WireMessage) -> bool {
        self.header.message_count < u8::MAX && message.wire_size() <= self.remaining_space()
    }

    pub fn write_message(&mut self, message: &WireMessage) -> bool {
        if !self.can_fit(message) {
            return false;
        }
        let Ok(length) = u16::try_from(message.header_size() + message.payload().len()) else {
            return false;
        };

        let written = self.codec.write_u16(length)
            && self.codec.write_u8(message.index())
            && (!message.is_reliable() || self.codec.write_u16(message.reliable_id()))
            && self.codec.write_bytes(message.payload().as_slice());
        if written {
            self.header.message_count += 1;
        }
        written
    }

    pub fn finalize(&mut self, ack: u16, last_received_ack: u16, history: u16) -> bool {
        self.header.ack = ack;
        self.header.last_received_ack = last_received_ack;
        self.header.previous_received_ack_bitfield = history;
        self.header.write_at(&mut self.codec, 0)
    }

    /// Marks the packet as connectionless: no ack and nothing acknowledged.
    pub fn finalize_connectionless(&mut self) -> bool {
        self.finalize(INVALID_ACK, INVALID_ACK, 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.codec.as_slice()
    }

    pub fn len(&self) -> usize {
        self.codec.len()
    }

    /// Parses a datagram. Messages are read until the first malformed or
    /// unknown one; the rest of the packet is discarded but earlier messages
    /// are kept.
    pub fn parse(
        datagram: &[u8],
        sender: SocketAddr,
        registry: &MessageRegistry,
    ) -> Result<ReceivedPacket, PacketError> {
        if datagram.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::TruncatedHeader(datagram.len()));
        }
        if datagram.len() > PACKET_MTU {
            return Err(PacketError::Oversized(datagram.len()));
        }

        let mut codec = ByteCodec::from_bytes(datagram);
        let header =
            PacketHeader::read(&mut codec).ok_or(PacketError::TruncatedHeader(datagram.len()))?;

        let mut messages = Vec::with_capacity(header.message_count as usize);
        for position in 0..header.message_count {
            match read_message(&mut codec, registry) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    log::warn!(
                        "Discarding {} message(s) from {}: {}",
                        header.message_count - position,
                        sender,
                        e
                    );
                    break;
                }
            }
        }

        Ok(ReceivedPacket {
            header,
            sender,
            size: datagram.len(),
            messages,
        })
    }
}

fn read_message(
    codec: &mut ByteCodec,
    registry: &MessageRegistry,
) -> Result<WireMessage, PacketError> {
    let length = codec.read_u16().ok_or(PacketError::TruncatedMessage)? as usize;
    if length < UNRELIABLE_MESSAGE_HEADER_SIZE || length > codec.remaining_readable() {
        return Err(PacketError::TruncatedMessage);
    }

    let index = codec.read_u8().ok_or(PacketError::TruncatedMessage)?;
    let definition = registry
        .by_index(index)
        .ok_or(PacketError::UnknownMessage(index))?;
    let options = definition.options();
    if length < options.header_size() {
        return Err(PacketError::TruncatedMessage);
    }

    let reliable_id = if options.is_reliable() {
        codec.read_u16().ok_or(PacketError::TruncatedMessage)?
    } else {
        INVALID_RELIABLE_ID
    };

    let mut payload = vec![0u8; length - options.header_size()];
    codec.read_bytes(&mut payload);

    Ok(WireMessage::from_parts(
        index,
        options,
        reliable_id,
        ByteCodec::from_bytes(&payload),
    ))
}

#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub header: PacketHeader,
    pub sender: SocketAddr,
    pub size: usize,
    pub messages: Vec<WireMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::MessageOptions;
    use crate::net::protocol::MAX_MESSAGE_PAYLOAD;

    fn registry() -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry.register("state", MessageOptions::empty(), None, Some(0)).unwrap();
        registry.register("event", MessageOptions::RELIABLE, None, Some(1)).unwrap();
        registry
    }

    fn sender() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn test_packet_round_trip() {
        let registry = registry();
        let mut state = WireMessage::new(registry.by_name("state").unwrap());
        state.payload_mut().write_f32(1.5);
        let mut event = WireMessage::new(registry.by_name("event").unwrap());
        event.set_reliable_id(42);
        event.payload_mut().write_string("door opened");

        let mut packet = WirePacket::new(2);
        assert!(packet.write_message(&event));
        assert!(packet.write_message(&state));
        assert!(packet.finalize(10, 9, 0b1));

        let received = WirePacket::parse(packet.as_bytes(), sender(), &registry).unwrap();
        assert_eq!(received.header.sender_index, 2);
        assert_eq!(received.header.ack, 10);
        assert_eq!(received.header.last_received_ack, 9);
        assert_eq!(received.header.previous_received_ack_bitfield, 1);
        assert_eq!(received.messages.len(), 2);

        let mut first = received.messages[0].clone();
        assert_eq!(first.reliable_id(), 42);
        assert_eq!(first.payload_mut().read_string().as_deref(), Some("door opened"));

        let mut second = received.messages[1].clone();
        assert_eq!(second.reliable_id(), INVALID_RELIABLE_ID);
        assert_eq!(second.payload_mut().read_f32(), Some(1.5));
    }

    #[test]
    fn test_largest_payload_fits_exactly() {
        let registry = registry();
        let mut event = WireMessage::new(registry.by_name("event").unwrap());
        event.set_reliable_id(0);
        event.payload_mut().write_bytes(&vec![7u8; MAX_MESSAGE_PAYLOAD]);

        let mut packet = WirePacket::new(0);
        assert!(packet.write_message(&event));
        assert_eq!(packet.len(), PACKET_MTU);
        assert_eq!(packet.remaining_space(), 0);

        let state = WireMessage::new(registry.by_name("state").unwrap());
        assert!(!packet.write_message(&state));
        assert_eq!(packet.message_count(), 1);
    }

    #[test]
    fn test_unknown_index_discards_rest() {
        let registry = registry();
        let state = WireMessage::new(registry.by_name("state").unwrap());
        let unknown = WireMessage::with_index(9, MessageOptions::empty());

        let mut packet = WirePacket::new(0);
        packet.write_message(&state);
        packet.write_message(&unknown);
        packet.write_message(&state);
        packet.finalize_connectionless();

        let received = WirePacket::parse(packet.as_bytes(), sender(), &registry).unwrap();
        assert_eq!(received.header.message_count, 3);
        assert_eq!(received.messages.len(), 1);
    }

    #[test]
    fn test_truncated_datagrams() {
        let registry = registry();
        assert_eq!(
            WirePacket::parse(&[0u8; 4], sender(), &registry).unwrap_err(),
            PacketError::TruncatedHeader(4)
        );
        assert_eq!(
            WirePacket::parse(&vec![0u8; PACKET_MTU + 1], sender(), &registry).unwrap_err(),
            PacketError::Oversized(PACKET_MTU + 1)
        );

        let mut state = WireMessage::new(registry.by_name("state").unwrap());
        state.payload_mut().write_u64(99);
        let mut packet = WirePacket::new(0);
        packet.write_message(&state);
        packet.finalize_connectionless();

        let bytes = &packet.as_bytes()[..packet.len() - 3];
        let received = WirePacket::parse(bytes, sender(), &registry).unwrap();
        assert!(received.messages.is_empty());
    }
}
