use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use crate::net::ByteCodec;

pub type NetObjectId = u16;

/// State an object exposes to the replication system.
///
/// The host writes snapshots; clients apply them. Create and destroy
/// payloads ride on the reliable create and destroy messages.
pub trait Replicated {
    fn write_create(&self, _payload: &mut ByteCodec) {}

    fn write_destroy(&self, _payload: &mut ByteCodec) {}

    fn read_destroy(&mut self, _payload: &mut ByteCodec) {}

    /// Exact number of bytes `write_snapshot` produces.
    fn snapshot_size(&self) -> usize;

    fn write_snapshot(&self, snapshot: &mut ByteCodec);

    fn apply_snapshot(&mut self, snapshot: &mut ByteCodec);
}

pub type ObjectHandle = Rc<RefCell<dyn Replicated>>;

/// Builds a client-side object from an object-create payload.
pub type ObjectFactory = Rc<dyn Fn(&mut ByteCodec) -> Option<ObjectHandle>>;

pub struct NetObject {
    pub id: NetObjectId,
    pub type_id: u8,
    pub handle: ObjectHandle,
}

/// Per-connection record of when an object was last replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetObjectView {
    pub id: NetObjectId,
    pub last_sent: Instant,
}
