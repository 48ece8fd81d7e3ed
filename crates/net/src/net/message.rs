use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use super::codec::ByteCodec;
use super::error::RegistryError;
use super::protocol::{
    INVALID_MESSAGE_INDEX, INVALID_RELIABLE_ID, MESSAGE_LENGTH_SIZE, RELIABLE_MESSAGE_HEADER_SIZE,
    UNRELIABLE_MESSAGE_HEADER_SIZE,
};
use super::session::Session;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageOptions: u8 {
        /// May be dispatched from an address with no connection.
        const CONNECTIONLESS = 1 << 0;
        const RELIABLE = 1 << 1;
        const IN_ORDER = 1 << 2;
        const HEARTBEAT = 1 << 3;
        const RELIABLE_IN_ORDER = Self::RELIABLE.bits() | Self::IN_ORDER.bits();
    }
}

impl MessageOptions {
    /// In-order delivery implies reliability.
    pub fn is_reliable(self) -> bool {
        self.intersects(MessageOptions::RELIABLE | MessageOptions::IN_ORDER)
    }

    pub fn is_in_order(self) -> bool {
        self.contains(MessageOptions::IN_ORDER)
    }

    pub fn header_size(self) -> usize {
        if self.is_reliable() {
            RELIABLE_MESSAGE_HEADER_SIZE
        } else {
            UNRELIABLE_MESSAGE_HEADER_SIZE
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    pub sender: SocketAddr,
    pub connection: Option<u8>,
}

pub type MessageHandler = Rc<dyn Fn(&mut Session, &MessageContext, &mut WireMessage)>;

pub struct MessageDefinition {
    name: String,
    index: u8,
    options: MessageOptions,
    fixed: bool,
    handler: Option<MessageHandler>,
}

impl fmt::Debug for MessageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDefinition")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("options", &self.options)
            .field("fixed", &self.fixed)
            .finish_non_exhaustive()
    }
}

impl MessageDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn options(&self) -> MessageOptions {
        self.options
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn handler(&self) -> Option<&MessageHandler> {
        self.handler.as_ref()
    }
}

/// Assigns wire indices to message definitions.
///
/// Fixed definitions keep their index. Dynamic definitions are reassigned
/// in name order to the lowest unused indices after every registration, so
/// two peers registering the same set agree on indices regardless of order.
#[derive(Debug, Default)]
pub struct MessageRegistry {
    definitions: Vec<MessageDefinition>,
    by_index: HashMap<u8, usize>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index assigned right now. A dynamic definition's index
    /// can move on any later registration; look it up by name afterwards.
    pub fn register(
        &mut self,
        name: &str,
        options: MessageOptions,
        handler: Option<MessageHandler>,
        fixed_index: Option<u8>,
    ) -> Result<u8, RegistryError> {
        if self.definitions.iter().any(|d| d.name == name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        if let Some(index) = fixed_index {
            if index == INVALID_MESSAGE_INDEX {
                return Err(RegistryError::ReservedIndex(index));
            }
            if self.definitions.iter().any(|d| d.fixed && d.index == index) {
                return Err(RegistryError::IndexInUse(index));
            }
        }
        if self.definitions.len() >= INVALID_MESSAGE_INDEX as usize {
            return Err(RegistryError::Full);
        }

        self.definitions.push(MessageDefinition {
            name: name.to_string(),
            index: fixed_index.unwrap_or(INVALID_MESSAGE_INDEX),
            options,
            fixed: fixed_index.is_some(),
            handler,
        });
        self.assign_dynamic_indices();

        let position = self.definitions.len() - 1;
        Ok(self.definitions[position].index)
    }

    fn assign_dynamic_indices(&mut self) {
        let reserved: HashSet<u8> = self
            .definitions
            .iter()
            .filter(|d| d.fixed)
            .map(|d| d.index)
            .collect();

        let mut dynamic: Vec<usize> = (0..self.definitions.len())
            .filter(|&i| !self.definitions[i].fixed)
            .collect();
        dynamic.sort_by(|&a, &b| self.definitions[a].name.cmp(&self.definitions[b].name));

        let mut candidate: u8 = 0;
        for position in dynamic {
            while reserved.contains(&candidate) {
                candidate += 1;
            }
            self.definitions[position].index = candidate;
            candidate = candidate.saturating_add(1);
        }

        self.by_index = self
            .definitions
            .iter()
            .enumerate()
            .map(|(position, d)| (d.index, position))
            .collect();
    }

    pub fn by_index(&self, index: u8) -> Option<&MessageDefinition> {
        self.by_index.get(&index).map(|&i| &self.definitions[i])
    }

    pub fn by_name(&self, name: &str) -> Option<&MessageDefinition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// One message instance: a definition index, options and payload, plus the
/// reliable id and last send time once the connection has taken ownership.
#[derive(Debug, Clone)]
pub struct WireMessage {
    index: u8,
    options: MessageOptions,
    reliable_id: u16,
    payload: ByteCodec,
    last_sent: Option<Instant>,
}

impl WireMessage {
    pub fn new(definition: &MessageDefinition) -> Self {
        Self::with_index(definition.index, definition.options)
    }

    pub fn with_index(index: u8, options: MessageOptions) -> Self {
        Self::from_parts(index, options, INVALID_RELIABLE_ID, ByteCodec::growable())
    }

    pub(crate) fn from_parts(
        index: u8,
        options: MessageOptions,
        reliable_id: u16,
        payload: ByteCodec,
    ) -> Self {
        Self {
            index,
            options,
            reliable_id,
            payload,
            last_sent: None,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn options(&self) -> MessageOptions {
        self.options
    }

    pub fn is_reliable(&self) -> bool {
        self.options.is_reliable()
    }

    pub fn reliable_id(&self) -> u16 {
        self.reliable_id
    }

    pub(crate) fn set_reliable_id(&mut self, reliable_id: u16) {
        self.reliable_id = reliable_id;
    }

    pub fn payload(&self) -> &ByteCodec {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut ByteCodec {
        &mut self.payload
    }

    pub fn header_size(&self) -> usize {
        self.options.header_size()
    }

    /// Bytes this message occupies inside a packet, length prefix included.
    pub fn wire_size(&self) -> usize {
        MESSAGE_LENGTH_SIZE + self.header_size() + self.payload.len()
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    pub(crate) fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    pub(crate) fn needs_resend(&self, now: Instant, interval: Duration) -> bool {
        self.last_sent
            .is_some_and(|sent| now.saturating_duration_since(sent) > interval)
    }
}
