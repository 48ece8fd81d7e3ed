pub mod net;
pub mod replication;

pub use net::{
    ByteCodec, Connection, ConnectionState, CoreMessage, DEFAULT_PORT, JoinDenyReason,
    MessageContext, MessageOptions, NetConfig, NetworkSimulation, NetworkStats, PacketError,
    RegistryError, Session, SessionError, SessionState, TcpChannel, TcpEndpoint, UdpEndpoint,
    WireMessage, WirePacket,
};
pub use replication::{NetObjectId, ObjectHandle, Replicated, ReplicationSystem};
