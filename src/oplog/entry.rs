//! What the oplog stores, and how each record is framed on disk.
//!
//! Every record is `crc32 ‖ word ‖ payload`, where `word` is a little
//! endian `u32` holding `payload length << 2 | parity << 1 | partial`. The
//! checksum covers the word and the payload, so a torn write of either is
//! detected.

use serde::{Deserialize, Serialize};

use crate::{
    prelude::*,
    tree::{TreeHead, TreeUpgrade},
    verifier::{KeyPair, Manifest},
};

pub(crate) const FRAME_HEADER: usize = 8;

/// Largest payload a frame can describe.
pub(crate) const MAX_PAYLOAD: usize = (u32::MAX >> 2) as usize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgHint {
    pub from: u64,
    pub to: u64,
    pub ancestors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hints {
    /// Blocks `0..contiguous_length` are all present.
    pub contiguous_length: u64,
    /// Recent fork transitions, oldest first.
    pub reorgs: Vec<ReorgHint>,
}

/// Everything a core needs to reopen without replaying entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogHeader {
    pub tree: TreeHead,
    pub key: Hash,
    pub manifest: Option<Manifest>,
    pub key_pair: Option<KeyPair>,
    pub user_data: Vec<UserData>,
    pub hints: Hints,
}

impl OplogHeader {
    pub fn user_data(&self, key: &str) -> Option<&[u8]> {
        self.user_data
            .iter()
            .find(|d| d.key == key)
            .map(|d| d.value.as_slice())
    }

    /// Sets or, with `None`, removes a user data key.
    pub fn set_user_data(&mut self, key: &str, value: Option<&[u8]>) {
        let existing = self.user_data.iter().position(|d| d.key == key);

        match (existing, value) {
            (Some(i), Some(value)) => self.user_data[i].value = value.to_vec(),
            (Some(i), None) => {
                self.user_data.remove(i);
            }
            (None, Some(value)) => self.user_data.push(UserData {
                key: key.to_string(),
                value: value.to_vec(),
            }),
            (None, None) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDataEntry {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitfieldEntry {
    pub start: u64,
    pub length: u64,
    pub drop: bool,
}

/// One mutation. All present parts are applied together on replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub user_data: Option<UserDataEntry>,
    pub tree_nodes: Vec<Node>,
    pub tree_upgrade: Option<TreeUpgrade>,
    pub bitfield: Option<BitfieldEntry>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Frame<'a> {
    pub payload: &'a [u8],
    pub parity: bool,
    pub partial: bool,
}

impl Frame<'_> {
    /// Bytes the frame occupies on disk.
    pub fn size(&self) -> usize {
        FRAME_HEADER + self.payload.len()
    }
}

pub(crate) fn encode_frame(payload: &[u8], parity: bool, partial: bool) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::InvalidOperation(format!(
            "oplog record of {} bytes is too large",
            payload.len()
        )));
    }

    let word = (payload.len() as u32) << 2 | u32::from(parity) << 1 | u32::from(partial);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&word.to_le_bytes());
    hasher.update(payload);

    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&hasher.finalize().to_le_bytes());
    frame.extend_from_slice(&word.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decodes the frame at the start of `buffer`. `None` if it is cut short or
/// fails its checksum.
pub(crate) fn decode_frame(buffer: &[u8]) -> Option<Frame<'_>> {
    if buffer.len() < FRAME_HEADER {
        return None;
    }

    let checksum = u32::from_le_bytes(buffer[0..4].try_into().ok()?);
    let word = u32::from_le_bytes(buffer[4..8].try_into().ok()?);
    let length = (word >> 2) as usize;

    let payload = buffer.get(FRAME_HEADER..FRAME_HEADER + length)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buffer[4..8]);
    hasher.update(payload);
    if hasher.finalize() != checksum {
        return None;
    }

    Some(Frame {
        payload,
        parity: word & 0b10 != 0,
        partial: word & 0b01 != 0,
    })
}
