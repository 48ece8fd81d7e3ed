mod object;
mod system;

pub use object::{NetObject, NetObjectId, NetObjectView, ObjectFactory, ObjectHandle, Replicated};
pub use system::{OBJECT_PREFIX_SIZE, ReplicationSystem};
