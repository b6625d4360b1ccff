//! Wire-level plumbing for host/client simulation sync: message framing and
//! payload encoding, compression, the pluggable transport interface, session
//! context, and heartbeat-based liveness detection.

pub mod compression;
pub mod heartbeat;
pub mod loopback;
pub mod message;
pub mod session;
pub mod stale;
pub mod transport;

pub use compression::{MAX_DECOMPRESSED_LEN, compress, decompress};
pub use heartbeat::{
    ClientHeartbeat, HeartbeatAck, HeartbeatError, HeartbeatPayload, HostHeartbeat,
};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use message::{
    DecodeError, EncodeError, HEADER_LEN, MAX_PAYLOAD_LEN, Message, MessageKind, base64_bytes,
    deserialize_payload, serialize_payload,
};
pub use session::{Role, SessionContext};
pub use stale::LatestWins;
pub use transport::{
    Destination, Outbox, Outgoing, PeerId, Reliability, Transport, TransportError, TransportEvent,
};
