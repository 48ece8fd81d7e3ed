use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use super::object::{NetObject, NetObjectId, NetObjectView, ObjectFactory, ObjectHandle};
use crate::net::{ByteCodec, CoreMessage, MESSAGE_LENGTH_SIZE, WireMessage, WirePacket};

/// Type id plus network id ahead of every object payload.
pub const OBJECT_PREFIX_SIZE: usize = 3;

/// Maps application objects to network ids and fills spare packet space
/// with their snapshots, stalest first.
#[derive(Default)]
pub struct ReplicationSystem {
    factories: HashMap<u8, ObjectFactory>,
    objects: BTreeMap<NetObjectId, NetObject>,
    views: HashMap<u8, Vec<NetObjectView>>,
}

impl ReplicationSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the client-side factory for `type_id`, replacing any previous one.
    pub fn register_definition(&mut self, type_id: u8, factory: ObjectFactory) -> bool {
        self.factories.insert(type_id, factory).is_none()
    }

    pub fn is_registered(&self, type_id: u8) -> bool {
        self.factories.contains_key(&type_id)
    }

    pub fn object(&self, id: NetObjectId) -> Option<&NetObject> {
        self.objects.get(&id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &NetObject> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn views(&self, connection: u8) -> &[NetObjectView] {
        self.views.get(&connection).map(Vec::as_slice).unwrap_or(&[])
    }

    fn allocate_id(&self) -> Option<NetObjectId> {
        (0..=NetObjectId::MAX).find(|id| !self.objects.contains_key(id))
    }

    /// Registers a host-side object and gives each listed connection a view of it.
    pub fn register_object(
        &mut self,
        type_id: u8,
        handle: ObjectHandle,
        connections: impl IntoIterator<Item = u8>,
        now: Instant,
    ) -> Option<NetObjectId> {
        let id = self.allocate_id()?;
        self.objects.insert(
            id,
            NetObject {
                id,
                type_id,
                handle,
            },
        );
        for connection in connections {
            self.views
                .entry(connection)
                .or_default()
                .push(NetObjectView { id, last_sent: now });
        }
        Some(id)
    }

    pub fn remove_object(&mut self, id: NetObjectId) -> Option<NetObject> {
        let object = self.objects.remove(&id)?;
        for views in self.views.values_mut() {
            views.retain(|view| view.id != id);
        }
        Some(object)
    }

    /// Resets a connection's views to cover every registered object.
    pub fn add_connection(&mut self, connection: u8, now: Instant) {
        let views = self
            .objects
            .keys()
            .map(|&id| NetObjectView { id, last_sent: now })
            .collect();
        self.views.insert(connection, views);
    }

    pub fn remove_connection(&mut self, connection: u8) {
        self.views.remove(&connection);
    }

    /// Drops every object and view, keeping registered factories.
    pub fn clear(&mut self) {
        self.objects.clear();
        self.views.clear();
    }

    pub fn create_message(&self, id: NetObjectId) -> Option<WireMessage> {
        let object = self.objects.get(&id)?;
        let mut message = object_message(CoreMessage::ObjectCreate, object);
        object.handle.borrow().write_create(message.payload_mut());
        Some(message)
    }

    pub fn destroy_message(&self, id: NetObjectId) -> Option<WireMessage> {
        let object = self.objects.get(&id)?;
        let mut message = object_message(CoreMessage::ObjectDestroy, object);
        object.handle.borrow().write_destroy(message.payload_mut());
        Some(message)
    }

    /// Appends snapshot updates for `connection`, stalest view first, until
    /// the next one would not fit. Returns how many were written.
    pub fn fill_packet(&mut self, connection: u8, packet: &mut WirePacket, now: Instant) -> usize {
        let Some(views) = self.views.get_mut(&connection) else {
            return 0;
        };
        views.sort_by_key(|view| view.last_sent);

        let options = CoreMessage::ObjectUpdate.options();
        let mut written = 0;
        for view in views.iter_mut() {
            let Some(object) = self.objects.get(&view.id) else {
                continue;
            };
            let snapshot_size = object.handle.borrow().snapshot_size();
            let required =
                MESSAGE_LENGTH_SIZE + options.header_size() + OBJECT_PREFIX_SIZE + snapshot_size;
            if required > packet.remaining_space() {
                break;
            }

            let mut message = object_message(CoreMessage::ObjectUpdate, object);
            object.handle.borrow().write_snapshot(message.payload_mut());
            if !packet.write_message(&message) {
                break;
            }
            view.last_sent = now;
            written += 1;
        }
        written
    }

    /// Client side of OBJECT_CREATE. An existing object with the same id is replaced.
    pub fn apply_create(&mut self, payload: &mut ByteCodec) -> Option<NetObjectId> {
        let (type_id, id) = read_prefix(payload)?;
        let Some(factory) = self.factories.get(&type_id).cloned() else {
            log::warn!("No object definition for type {} (object {})", type_id, id);
            return None;
        };
        let handle = factory(payload)?;
        self.objects.insert(
            id,
            NetObject {
                id,
                type_id,
                handle,
            },
        );
        Some(id)
    }

    pub fn apply_update(&mut self, payload: &mut ByteCodec) -> bool {
        let Some((_, id)) = read_prefix(payload) else {
            return false;
        };
        match self.objects.get(&id) {
            Some(object) => {
                object.handle.borrow_mut().apply_snapshot(payload);
                true
            }
            None => {
                log::trace!("Snapshot for unknown object {}", id);
                false
            }
        }
    }

    pub fn apply_destroy(&mut self, payload: &mut ByteCodec) -> Option<NetObjectId> {
        let (_, id) = read_prefix(payload)?;
        let object = self.remove_object(id)?;
        object.handle.borrow_mut().read_destroy(payload);
        Some(id)
    }
}

fn object_message(kind: CoreMessage, object: &NetObject) -> WireMessage {
    let mut message = WireMessage::with_index(kind.index(), kind.options());
    let payload = message.payload_mut();
    payload.write_u8(object.type_id);
    payload.write_u16(object.id);
    message
}

fn read_prefix(payload: &mut ByteCodec) -> Option<(u8, NetObjectId)> {
    Some((payload.read_u8()?, payload.read_u16()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use crate::net::{MessageOptions, PACKET_MTU};
    use crate::replication::Replicated;

    struct Counter {
        value: u32,
        destroyed: bool,
    }

    impl Replicated for Counter {
        fn write_create(&self, payload: &mut ByteCodec) {
            payload.write_u32(self.value);
        }

        fn read_destroy(&mut self, _payload: &mut ByteCodec) {
            self.destroyed = true;
        }

        fn snapshot_size(&self) -> usize {
            4
        }

        fn write_snapshot(&self, snapshot: &mut ByteCodec) {
            snapshot.write_u32(self.value);
        }

        fn apply_snapshot(&mut self, snapshot: &mut ByteCodec) {
            if let Some(value) = snapshot.read_u32() {
                self.value = value;
            }
        }
    }

    fn counter(value: u32) -> Rc<RefCell<Counter>> {
        Rc::new(RefCell::new(Counter {
            value,
            destroyed: false,
        }))
    }

    fn counter_factory() -> ObjectFactory {
        Rc::new(|payload: &mut ByteCodec| {
            let value = payload.read_u32()?;
            let handle: ObjectHandle = counter(value);
            Some(handle)
        })
    }

    #[test]
    fn test_lowest_unused_id() {
        let now = Instant::now();
        let mut system = ReplicationSystem::new();
        let a = system.register_object(1, counter(0), [], now).unwrap();
        let b = system.register_object(1, counter(0), [], now).unwrap();
        let c = system.register_object(1, counter(0), [], now).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        system.remove_object(1);
        assert_eq!(system.register_object(1, counter(0), [], now), Some(1));
    }

    #[test]
    fn test_fill_packet_sends_stalest_first() {
        let t0 = Instant::now();
        let mut system = ReplicationSystem::new();
        for value in 0..3 {
            system.register_object(1, counter(value), [4], t0);
        }

        let mut packet = WirePacket::new(0);
        let filler_size = PACKET_MTU - 8 - 3 - 2 * 10;
        let mut filler = WireMessage::with_index(20, MessageOptions::empty());
        filler.payload_mut().write_bytes(&vec![0u8; filler_size]);
        assert!(packet.write_message(&filler));

        let t1 = t0 + Duration::from_millis(10);
        assert_eq!(system.fill_packet(4, &mut packet, t1), 2);
        assert_eq!(packet.message_count(), 3);

        let sent: Vec<_> = system.views(4).iter().map(|v| (v.id, v.last_sent)).collect();
        assert_eq!(sent, vec![(0, t1), (1, t1), (2, t0)]);

        let mut next = WirePacket::new(0);
        let t2 = t1 + Duration::from_millis(10);
        assert_eq!(system.fill_packet(4, &mut next, t2), 3);
        assert_eq!(system.views(4)[0].id, 2);
    }

    #[test]
    fn test_fill_packet_without_views() {
        let now = Instant::now();
        let mut system = ReplicationSystem::new();
        system.register_object(1, counter(1), [], now);
        let mut packet = WirePacket::new(0);
        assert_eq!(system.fill_packet(2, &mut packet, now), 0);
        assert!(packet.is_empty());
    }

    #[test]
    fn test_client_lifecycle() {
        let now = Instant::now();
        let mut host = ReplicationSystem::new();
        let source = counter(41);
        let id = host.register_object(3, source.clone(), [1], now).unwrap();

        let mut client = ReplicationSystem::new();
        client.register_definition(3, counter_factory());

        let mut create = host.create_message(id).unwrap();
        assert_eq!(client.apply_create(create.payload_mut()), Some(id));

        source.borrow_mut().value = 42;
        let mut packet = WirePacket::new(0);
        host.fill_packet(1, &mut packet, now);

        let mut update = object_message(CoreMessage::ObjectUpdate, host.object(id).unwrap());
        source.borrow().write_snapshot(update.payload_mut());
        assert!(client.apply_update(update.payload_mut()));

        let mut snapshot = ByteCodec::growable();
        client.object(id).unwrap().handle.borrow().write_snapshot(&mut snapshot);
        assert_eq!(snapshot.read_u32(), Some(42));

        let mut destroy = host.destroy_message(id).unwrap();
        host.remove_object(id);
        assert_eq!(client.apply_destroy(destroy.payload_mut()), Some(id));
        assert!(client.is_empty());
        assert!(host.views(1).is_empty());
    }

    #[test]
    fn test_create_for_unknown_type_ignored() {
        let now = Instant::now();
        let mut host = ReplicationSystem::new();
        let id = host.register_object(9, counter(0), [], now).unwrap();

        let mut client = ReplicationSystem::new();
        let mut create = host.create_message(id).unwrap();
        assert_eq!(client.apply_create(create.payload_mut()), None);
    }

    #[test]
    fn test_destroy_runs_destroy_hook() {
        let now = Instant::now();
        let mut system = ReplicationSystem::new();
        let probe = counter(0);
        let mut codec = ByteCodec::growable();
        codec.write_u8(1);
        codec.write_u16(0);
        system.objects.insert(
            0,
            NetObject {
                id: 0,
                type_id: 1,
                handle: probe.clone(),
            },
        );
        system.add_connection(2, now);
        assert_eq!(system.views(2).len(), 1);

        assert_eq!(system.apply_destroy(&mut codec), Some(0));
        assert!(probe.borrow().destroyed);
        assert!(system.views(2).is_empty());
    }
}
