//! Crash-safe journal of core mutations.
//!
//! The file starts with two fixed header slots, followed by the entry
//! region. Entries are only meaningful until the next header flush, which
//! folds their effect into the header and truncates the region.
//!
//! The current header is the one in slot 0 when both slots carry the same
//! parity bit, and slot 1 otherwise. A flush always rewrites the other slot,
//! so a torn header write leaves the previous header intact. Entries carry
//! the index of the header slot they were written under, which lets a
//! reopen skip entries that a completed flush already covered.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{prelude::*, storage::Storage};

mod entry;

use entry::{decode_frame, encode_frame, FRAME_HEADER};
pub use entry::{BitfieldEntry, Hints, OplogEntry, OplogHeader, ReorgHint, UserData, UserDataEntry};

pub const HEADER_SLOT_SIZE: u64 = 4096;
pub const ENTRIES_OFFSET: u64 = 2 * HEADER_SLOT_SIZE;

/// What a header slot holds: the encoded header, or where to find it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Slot {
    Inline(Vec<u8>),
    External { start: u64, length: u64, checksum: u32 },
}

/// A valid header slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotState {
    bit: bool,
    external: Option<(u64, u64)>,
}

#[derive(Debug)]
pub struct Oplog {
    storage: Arc<dyn Storage>,
    /// Holds headers too large for a slot.
    big_header: Arc<dyn Storage>,
    slots: [Option<SlotState>; 2],
    /// End of the entry region.
    length: u64,
    entries: u64,
    /// Entries superseded by a flush may still sit past `length`.
    stale: bool,
}

/// The state found on open.
#[derive(Debug)]
pub struct OplogOpen {
    pub oplog: Oplog,
    pub header: Option<OplogHeader>,
    pub entries: Vec<OplogEntry>,
}

impl Oplog {
    pub async fn open(storage: Arc<dyn Storage>, big_header: Arc<dyn Storage>) -> Result<OplogOpen> {
        let data = storage.read_all().await?;

        let mut oplog = Self {
            storage,
            big_header,
            slots: [None, None],
            length: ENTRIES_OFFSET,
            entries: 0,
            stale: false,
        };

        let mut headers = [None, None];
        for (i, header) in headers.iter_mut().enumerate() {
            if let Some((state, decoded)) = oplog.read_slot(&data, i).await {
                oplog.slots[i] = Some(state);
                *header = Some(decoded);
            }
        }

        let Some(current) = oplog.current() else {
            if data.len() as u64 > ENTRIES_OFFSET {
                return Err(Error::CorruptOplog(
                    "no valid header but the entry region is not empty".into(),
                ));
            }
            return Ok(OplogOpen {
                oplog,
                header: None,
                entries: Vec::new(),
            });
        };
        let header = headers[current].take();

        let region = data.get(ENTRIES_OFFSET as usize..).unwrap_or_default();
        let (entries, used) = read_entries(region, current == 1)?;

        oplog.length = ENTRIES_OFFSET + used as u64;
        oplog.entries = entries.len() as u64;

        if region.len() > used {
            warn!(
                target: "mulog::oplog",
                dropped = region.len() - used,
                "dropping incomplete oplog entries"
            );
            oplog.storage.truncate(oplog.length).await?;
        }

        debug!(target: "mulog::oplog", slot = current, entries = oplog.entries, "opened oplog");
        Ok(OplogOpen {
            oplog,
            header,
            entries,
        })
    }

    async fn read_slot(&self, data: &[u8], i: usize) -> Option<(SlotState, OplogHeader)> {
        let start = i * HEADER_SLOT_SIZE as usize;
        let slot = data.get(start..(start + HEADER_SLOT_SIZE as usize).min(data.len()))?;
        let frame = decode_frame(slot)?;

        let (encoded, external) = match bincode::deserialize::<Slot>(frame.payload).ok()? {
            Slot::Inline(encoded) => (encoded, None),
            Slot::External {
                start,
                length,
                checksum,
            } => {
                let encoded = self.big_header.read(start, length).await.ok()??;
                if crc32fast::hash(&encoded) != checksum {
                    return None;
                }
                (encoded, Some((start, length)))
            }
        };

        let header = bincode::deserialize(&encoded).ok()?;
        Some((
            SlotState {
                bit: frame.parity,
                external,
            },
            header,
        ))
    }

    /// Index of the slot holding the current header.
    fn current(&self) -> Option<usize> {
        match self.slots {
            [Some(a), Some(b)] => Some(usize::from(a.bit != b.bit)),
            [Some(_), None] => Some(0),
            [None, Some(_)] => Some(1),
            [None, None] => None,
        }
    }

    fn parity(&self) -> bool {
        self.current() == Some(1)
    }

    /// Bytes held by the entry region.
    pub fn byte_length(&self) -> u64 {
        self.length - ENTRIES_OFFSET
    }

    /// Entries appended since the last flush.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Appends entries in one write. With `atomic`, all entries but the
    /// last are marked partial so a torn batch is dropped as a whole.
    pub async fn append(&mut self, entries: &[OplogEntry], atomic: bool) -> Result<()> {
        if self.current().is_none() {
            return Err(Error::InvalidOperation(
                "oplog has no header to append under".into(),
            ));
        }

        if self.stale {
            self.storage.truncate(ENTRIES_OFFSET).await?;
            self.stale = false;
        }

        let parity = self.parity();
        let mut buffer = Vec::new();

        for (i, entry) in entries.iter().enumerate() {
            let partial = atomic && i + 1 < entries.len();
            buffer.extend(encode_frame(&bincode::serialize(entry)?, parity, partial)?);
        }

        self.storage.write(self.length, &buffer).await?;
        self.length += buffer.len() as u64;
        self.entries += entries.len() as u64;
        Ok(())
    }

    /// Writes `header` to the non-current slot, then clears the entries it
    /// supersedes.
    pub async fn flush(&mut self, header: &OplogHeader) -> Result<()> {
        let target = self.current().map_or(0, |c| 1 - c);
        let bit = match target {
            0 => self.slots[1].map_or(false, |s| s.bit),
            _ => !self.slots[0].map_or(false, |s| s.bit),
        };

        let encoded = bincode::serialize(header)?;
        let inline = bincode::serialize(&Slot::Inline(encoded.clone()))?;

        let (payload, external) = if inline.len() + FRAME_HEADER <= HEADER_SLOT_SIZE as usize {
            (inline, None)
        } else {
            let start = self.external_offset(encoded.len() as u64);
            self.big_header.write(start, &encoded).await?;

            let slot = Slot::External {
                start,
                length: encoded.len() as u64,
                checksum: crc32fast::hash(&encoded),
            };
            (bincode::serialize(&slot)?, Some((start, encoded.len() as u64)))
        };

        let frame = encode_frame(&payload, bit, false)?;
        self.storage
            .write(target as u64 * HEADER_SLOT_SIZE, &frame)
            .await?;
        self.slots[target] = Some(SlotState { bit, external });
        self.length = ENTRIES_OFFSET;
        self.entries = 0;

        self.stale = true;
        self.storage.truncate(ENTRIES_OFFSET).await?;
        self.stale = false;

        debug!(
            target: "mulog::oplog",
            slot = target,
            external = external.is_some(),
            length = header.tree.length,
            "flushed oplog header"
        );
        Ok(())
    }

    /// Where to put an external header of `length` bytes without touching
    /// the one the current slot points at.
    fn external_offset(&self, length: u64) -> u64 {
        let current = self
            .current()
            .and_then(|c| self.slots[c])
            .and_then(|s| s.external);

        match current {
            Some((start, size)) if start < length => start + size,
            _ => 0,
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.storage.close().await?;
        self.big_header.close().await
    }
}

/// Decodes complete batches from the entry region, stopping at the first
/// torn, corrupt or stale frame. Returns the entries and the bytes they
/// span.
fn read_entries(region: &[u8], parity: bool) -> Result<(Vec<OplogEntry>, usize)> {
    let mut entries = Vec::new();
    let mut batch = Vec::new();
    let mut offset = 0;
    let mut committed = 0;

    while let Some(frame) = decode_frame(&region[offset..]) {
        if frame.parity != parity {
            break;
        }

        let entry = bincode::deserialize(frame.payload).map_err(|e| {
            Error::CorruptOplog(format!("entry at {} does not decode: {}", offset, e))
        })?;
        batch.push(entry);
        offset += frame.size();

        if !frame.partial {
            entries.append(&mut batch);
            committed = offset;
        }
    }

    Ok((entries, committed))
}
