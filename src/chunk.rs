use std::fmt;

use bincode::config::Config;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use uuid::Uuid;

use crate::link::MAX_FRAME_LEN;

/// Identity of a source socket, stable for the lifetime of the socket.
///
/// The identity is an opaque string. Freshly accepted sockets get a random
/// UUID so that two concurrently open sockets never share an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct SocketId(String);

impl SocketId {
    /// Generates a new random (v4 UUID) socket identity.
    pub fn generate() -> SocketId {
        SocketId(Uuid::new_v4().to_string())
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SocketId {
    fn from(id: &str) -> Self {
        SocketId(id.to_owned())
    }
}

impl From<String> for SocketId {
    fn from(id: String) -> Self {
        SocketId(id)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The atomic unit of transfer: a slice of one socket's byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Chunk {
    /// The socket this payload was read from.
    pub socket_id: SocketId,
    /// Position of this chunk in the socket's stream, starting at 0.
    pub sequence_id: u64,
    /// At most `chunk_size` bytes of payload.
    pub data: Vec<u8>,
}

/// Everything that travels over a link.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Message {
    /// A slice of payload.
    Chunk(Chunk),
    /// End of stream. `sequence_id` is the slot right after the last chunk,
    /// so the marker is ordered like data on the receiving side.
    Close {
        /// The socket that reached end of stream.
        socket_id: SocketId,
        /// Number of chunks sent before the socket closed.
        sequence_id: u64,
    },
}

impl Message {
    /// The socket this message belongs to.
    pub fn socket_id(&self) -> &SocketId {
        match self {
            Message::Chunk(chunk) => &chunk.socket_id,
            Message::Close { socket_id, .. } => socket_id,
        }
    }

    /// The sequence slot this message occupies.
    pub fn sequence_id(&self) -> u64 {
        match self {
            Message::Chunk(chunk) => chunk.sequence_id,
            Message::Close { sequence_id, .. } => *sequence_id,
        }
    }
}

impl From<Chunk> for Message {
    fn from(chunk: Chunk) -> Self {
        Message::Chunk(chunk)
    }
}

// Declared lengths are checked against the frame limit before anything is
// allocated.
fn wire_config() -> impl Config {
    bincode::config::standard().with_limit::<{ MAX_FRAME_LEN }>()
}

/// Serializes a message into its wire record.
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    bincode::encode_to_vec(message, wire_config())
}

/// Decodes a wire record. Trailing bytes make the record malformed.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let (message, read) = bincode::decode_from_slice(bytes, wire_config())?;
    if read != bytes.len() {
        return Err(DecodeError::OtherString(format!(
            "{} trailing bytes after message",
            bytes.len() - read
        )));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_are_distinct() {
        let ids: HashSet<SocketId> = (0..1000).map(|_| SocketId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn chunk_survives_the_wire() {
        let chunk = Chunk {
            socket_id: SocketId::from("a5a7"),
            sequence_id: 41,
            data: vec![0, 1, 2, 255],
        };
        let bytes = encode(&Message::Chunk(chunk.clone())).unwrap();
        assert_eq!(decode(&bytes).unwrap(), Message::Chunk(chunk));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(decode(&[0xff, 0xff, 0xff]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn oversized_length_is_rejected_without_allocating() {
        let mut bytes = vec![0, 1, b'a', 0, 0xfd];
        bytes.extend_from_slice(&(u64::MAX / 2).to_le_bytes());
        assert!(matches!(decode(&bytes), Err(DecodeError::LimitExceeded)));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let close = Message::Close {
            socket_id: SocketId::from("x"),
            sequence_id: 3,
        };
        let mut bytes = encode(&close).unwrap();
        bytes.push(0);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn accessors_cover_both_variants() {
        let close = Message::Close {
            socket_id: SocketId::from("x"),
            sequence_id: 7,
        };
        assert_eq!(close.socket_id().as_str(), "x");
        assert_eq!(close.sequence_id(), 7);
    }
}
