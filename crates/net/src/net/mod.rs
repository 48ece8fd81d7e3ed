mod clock;
mod codec;
mod config;
mod connection;
mod endpoint;
mod error;
mod message;
mod packet;
mod protocol;
mod session;
mod simulator;
mod stats;
mod tracking;

pub use clock::NetClock;
pub use codec::{ByteCodec, Endianness, var_size_len};
pub use config::NetConfig;
pub use connection::{Connection, ConnectionState};
pub use endpoint::{TcpChannel, TcpEndpoint, UdpEndpoint};
pub use error::{PacketError, RegistryError, SessionError};
pub use message::{
    MessageContext, MessageDefinition, MessageHandler, MessageOptions, MessageRegistry,
    WireMessage,
};
pub use packet::{ReceivedPacket, WirePacket};
pub use protocol::{
    CoreMessage, DEFAULT_PORT, HOST_CONNECTION_INDEX, INVALID_ACK, INVALID_CONNECTION_INDEX,
    INVALID_MESSAGE_INDEX, INVALID_RELIABLE_ID, JoinDenyReason, MAX_MESSAGE_PAYLOAD,
    MESSAGE_LENGTH_SIZE, PACKET_HEADER_SIZE, PACKET_MTU, PacketHeader, RELIABLE_RESEND_INTERVAL,
    next_sequence, sequence_greater_than,
};
pub use session::{JoinCallback, LeaveCallback, Session, SessionState};
pub use simulator::{LatencyQueue, NetworkSimulation};
pub use stats::NetworkStats;
pub use tracking::{AckTracker, PacketTracker, ReceiveTracker, is_ack_confirmed};
