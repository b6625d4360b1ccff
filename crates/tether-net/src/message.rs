//! Message framing and payload encoding.
//!
//! Every message on the wire is a fixed 21-byte header followed by the payload:
//!
//! ```text
//! +--------+---------------+-------------+----------------+-----------------+
//! | kind   | sender id     | tick        | payload length | payload         |
//! | 1 byte | u64 LE        | i64 LE      | u32 LE         | (length bytes)  |
//! +--------+---------------+-------------+----------------+-----------------+
//! ```
//!
//! Payloads are self-describing JSON (see [`serialize_payload`]) so captured
//! traffic can be inspected without the original type definitions. Binary
//! fields inside payloads are carried as base64 strings via [`base64_bytes`].

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 21;

/// Largest payload a frame may declare (50 MiB).
pub const MAX_PAYLOAD_LEN: usize = 50 * 1024 * 1024;

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// Stable wire tag identifying how a message payload is decoded.
///
/// Discriminants are part of the wire format and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageKind {
    /// Lobby roster/settings update.
    LobbyUpdate = 0,
    /// Host announces that the game is about to start.
    GameStarting = 1,
    /// Metadata announcing an initial world transfer.
    WorldData = 2,
    /// One chunk of a world transfer (initial load or hard sync).
    WorldDataChunk = 3,
    /// Client reports it has loaded the world and is ready.
    PlayerReady = 4,
    /// Host starts the shared clock.
    GameStart = 5,
    /// Host broadcasts its category checksums.
    SyncCheck = 6,
    /// Client reports which categories disagreed.
    SyncResponse = 7,
    /// Category resync data in a single message.
    SyncCategoryData = 8,
    /// One chunk of a category resync transfer.
    SyncCategoryChunk = 9,
    /// Command submitted to the host.
    Command = 10,
    /// Host-authorized command applied by every peer.
    CommandBroadcast = 11,
    /// Pause the simulation.
    Pause = 12,
    /// Resume the simulation.
    Unpause = 13,
    /// Change simulation speed.
    SpeedChange = 14,
    /// Chat line.
    Chat = 15,
    /// High-frequency cursor position (unreliable channel).
    CursorUpdate = 16,
    /// Round-trip probe.
    Ping = 17,
    /// Answer to [`MessageKind::Ping`].
    Pong = 18,
    /// Peer-reported error.
    Error = 19,
    /// Peer is leaving.
    Disconnect = 20,
    /// Host liveness signal.
    Heartbeat = 21,
    /// Client answer to a heartbeat.
    HeartbeatAck = 22,
    /// A player joined the session.
    PlayerJoined = 23,
    /// A player left the session.
    PlayerLeft = 24,
    /// Client asks the host to pause while it resyncs.
    SyncPauseRequest = 25,
    /// Client asks the host to resume after resyncing.
    SyncResumeRequest = 26,
    /// Metadata announcing a live hard-sync transfer.
    ResyncWorldData = 27,
    /// Informational system line.
    SystemMessage = 28,
}

impl MessageKind {
    /// Every kind, in wire-tag order.
    pub const ALL: [MessageKind; 29] = [
        Self::LobbyUpdate,
        Self::GameStarting,
        Self::WorldData,
        Self::WorldDataChunk,
        Self::PlayerReady,
        Self::GameStart,
        Self::SyncCheck,
        Self::SyncResponse,
        Self::SyncCategoryData,
        Self::SyncCategoryChunk,
        Self::Command,
        Self::CommandBroadcast,
        Self::Pause,
        Self::Unpause,
        Self::SpeedChange,
        Self::Chat,
        Self::CursorUpdate,
        Self::Ping,
        Self::Pong,
        Self::Error,
        Self::Disconnect,
        Self::Heartbeat,
        Self::HeartbeatAck,
        Self::PlayerJoined,
        Self::PlayerLeft,
        Self::SyncPauseRequest,
        Self::SyncResumeRequest,
        Self::ResyncWorldData,
        Self::SystemMessage,
    ];

    /// Map a wire tag back to its kind.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// The wire tag of this kind.
    pub fn tag(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// The unit of wire transmission. Created per send, discarded after dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Determines how `payload` is decoded.
    pub kind: MessageKind,
    /// Peer that produced the message.
    pub sender_id: u64,
    /// Sender's simulation tick at send time.
    pub tick: i64,
    /// Empty, or a self-describing structured encoding.
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message with an already-encoded payload.
    pub fn new(kind: MessageKind, sender_id: u64, tick: i64, payload: Vec<u8>) -> Self {
        Self {
            kind,
            sender_id,
            tick,
            payload,
        }
    }

    /// Build a message with no payload.
    pub fn empty(kind: MessageKind, sender_id: u64, tick: i64) -> Self {
        Self::new(kind, sender_id, tick, Vec::new())
    }

    /// Build a message whose payload is `value` serialized with [`serialize_payload`].
    pub fn with_payload<T: Serialize>(
        kind: MessageKind,
        sender_id: u64,
        tick: i64,
        value: &T,
    ) -> Result<Self, EncodeError> {
        Ok(Self::new(kind, sender_id, tick, serialize_payload(value)?))
    }

    /// Decode this message's payload as `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        deserialize_payload(&self.payload)
    }

    /// Encode into a wire frame.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(EncodeError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.kind.tag());
        out.extend_from_slice(&self.sender_id.to_le_bytes());
        out.extend_from_slice(&self.tick.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode a wire frame.
    ///
    /// Returns `Ok(None)` for input shorter than [`HEADER_LEN`]: the channel
    /// may carry handshake bytes from other protocols, which are not errors.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, DecodeError> {
        if data.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = MessageKind::from_tag(data[0]).ok_or(DecodeError::UnknownKind(data[0]))?;
        let sender_id = u64::from_le_bytes(read_array(&data[1..9]));
        let tick = i64::from_le_bytes(read_array(&data[9..17]));
        let declared = u32::from_le_bytes(read_array(&data[17..21])) as usize;

        let available = data.len() - HEADER_LEN;
        if declared > MAX_PAYLOAD_LEN || declared > available {
            return Err(DecodeError::Truncated {
                declared,
                available,
            });
        }

        Ok(Some(Self {
            kind,
            sender_id,
            tick,
            payload: data[HEADER_LEN..HEADER_LEN + declared].to_vec(),
        }))
    }
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(slice);
    buf
}

// ---------------------------------------------------------------------------
// Payload encoding
// ---------------------------------------------------------------------------

/// Serialize a payload value as self-describing JSON.
pub fn serialize_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(value)?)
}

/// Deserialize a JSON payload.
pub fn deserialize_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(bytes).map_err(DecodeError::Payload)
}

/// Serde adapter carrying `Vec<u8>` fields as base64 strings inside JSON payloads.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as a base64 string.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserialize bytes from a base64 string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while encoding a message.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The payload exceeds [`MAX_PAYLOAD_LEN`].
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Actual payload size.
        size: usize,
        /// Maximum allowed.
        max: usize,
    },
    /// Payload serialization failed.
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors produced while decoding a frame, payload, or compressed stream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The kind tag is not a recognized [`MessageKind`].
    #[error("unknown message kind tag {0}")]
    UnknownKind(u8),
    /// The declared payload length is out of range or exceeds the buffer.
    #[error("truncated frame: declared {declared} payload bytes, {available} available")]
    Truncated {
        /// Payload length written in the header.
        declared: usize,
        /// Bytes actually present after the header.
        available: usize,
    },
    /// A compressed stream was malformed.
    #[error("corrupt compressed stream: {0}")]
    CorruptStream(String),
    /// The payload was not valid for the expected type.
    #[error("malformed payload: {0}")]
    Payload(#[source] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
