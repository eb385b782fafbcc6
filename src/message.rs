//! # Peer Wire Messages
//!
//! Everything after the handshake is length-prefixed frames:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32), total length of ID + payload
//! - **Message ID**: 1 byte
//! - **Payload**: variable, `length - 1` bytes
//!
//! A length of zero is a keep-alive with neither ID nor payload.
//!
//! ## Message types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | availability bits, MSB-first within each byte |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block bytes |
//! | 8 | CANCEL | index, begin, length |
//! | 20 | EXTENDED | extension message id, then extension payload |

use byteorder::{BigEndian, WriteBytesExt};

use crate::error::{Error, Result};

type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
#[allow(dead_code)]
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;
pub const MESSAGE_EXTENDED: MessageId = 20;
pub const MESSAGE_KEEPALIVE: MessageId = 255; // Special value for keep-alive (length 0)

/// Upper bound on a single frame. A piece message carries at most one 16 KiB
/// block plus headers, and extension messages stay under a metadata piece;
/// anything bigger means a corrupt or hostile stream.
pub const MESSAGE_LEN_MAX: usize = 1 << 17;

#[derive(Default, Debug)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a new message without payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Serialize with the 4-byte big-endian length prefix.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let message_len = 1 + self.payload.len();

        let mut serialized: Vec<u8> = Vec::with_capacity(4 + message_len);
        serialized.write_u32::<BigEndian>(message_len as u32)?;
        serialized.push(self.id);
        serialized.extend_from_slice(&self.payload);

        Ok(serialized)
    }
}

/// Deserialize a frame body (everything after the length prefix).
pub fn deserialize_message(message_buf: &[u8]) -> Result<Message> {
    let Some((&id, payload)) = message_buf.split_first() else {
        return Err(Error::PeerProtocol("empty message frame".into()));
    };

    Ok(Message::new_with_payload(id, payload.to_vec()))
}
