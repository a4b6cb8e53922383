//! Replication wire messages.
//!
//! Each message is bincode, prefixed by its length as a little endian
//! `u32`.

use serde::{Deserialize, Serialize};

use crate::prelude::*;

pub type PeerId = u64;

/// Largest message a peer may send.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// The first message on a channel, naming the core being replicated.
    Handshake { key: Hash },
    /// Extensions the sender understands.
    Options { extensions: Vec<String> },
    Info { length: u64, fork: u64 },
    /// The sender holds blocks `start..start + length`, or the set bits of
    /// `bitfield` (MSB first) when given.
    Have {
        start: u64,
        length: u64,
        bitfield: Option<Vec<u8>>,
    },
    Unhave { start: u64, length: u64 },
    Want { start: u64, length: u64 },
    Unwant { start: u64, length: u64 },
    Request { id: u64, request: Request },
    Data { id: u64, proof: Proof },
    /// The request could not be served.
    NoData { id: u64 },
    Cancel { id: u64 },
    Extension { name: String, data: Vec<u8> },
    Close,
}

impl Message {
    /// The framed form, ready for the channel.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidOperation(format!(
                "message of {} bytes is too large",
                body.len()
            )));
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
        frame.extend_from_slice(&u32::try_from(body.len())?.to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

/// Reassembles messages from a stream that may split or merge frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// The next complete message, if one has fully arrived.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let Some(prefix) = self.buffer.get(..LENGTH_PREFIX) else {
            return Ok(None);
        };
        let length = u32::from_le_bytes(prefix.try_into()?) as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidRequest(format!(
                "peer announced a message of {} bytes",
                length
            )));
        }

        let Some(body) = self.buffer.get(LENGTH_PREFIX..LENGTH_PREFIX + length) else {
            return Ok(None);
        };
        let message = bincode::deserialize(body)?;
        self.buffer.drain(..LENGTH_PREFIX + length);
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::RequestBlock;
    use proptest::prelude::*;
    use test_strategy::proptest;

    fn request() -> Message {
        Message::Request {
            id: 7,
            request: Request {
                block: Some(RequestBlock { index: 3, nodes: 2 }),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_split_frames_are_reassembled() {
        let mut bytes = request().encode().unwrap();
        bytes.extend(Message::Info { length: 5, fork: 0 }.encode().unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes[..3]);
        assert_eq!(decoder.next_message().unwrap(), None);

        decoder.push(&bytes[3..]);
        assert_eq!(decoder.next_message().unwrap(), Some(request()));
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::Info { length: 5, fork: 0 })
        );
        assert_eq!(decoder.next_message().unwrap(), None);
    }

    #[test]
    fn test_oversized_prefix_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&u32::MAX.to_le_bytes());

        assert!(matches!(
            decoder.next_message(),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[proptest(fork = false)]
    fn test_any_chunking(#[strategy(1usize..16)] chunk: usize, start: u64, length: u64) {
        let message = Message::Unhave { start, length };
        let bytes = message.encode()?;

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for piece in bytes.chunks(chunk) {
            decoder.push(piece);
            while let Some(message) = decoder.next_message()? {
                decoded.push(message);
            }
        }
        prop_assert_eq!(decoded, vec![message]);
    }
}
