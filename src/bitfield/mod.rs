//! Which blocks are present locally.
//!
//! Bits live in fixed pages (see [`page`]) kept in an ordered map that only
//! holds pages with at least one set bit. Runs of completely full pages are
//! tracked separately as intervals, so both "next set" and "next unset"
//! searches can skip uniform stretches in `O(log pages)`.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::{prelude::*, storage::Storage};

mod interlude;
mod page;

pub use interlude::BitInterlude;
pub use page::{Page, BITS_PER_PAGE, BYTES_PER_PAGE};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    pages: BTreeMap<u64, Page>,
    /// Disjoint, non-adjacent runs of full pages, `start -> end` exclusive.
    full: BTreeMap<u64, u64>,
}

impl Bitfield {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every page stored in `storage`.
    pub async fn open(storage: &dyn Storage) -> Result<Self> {
        let bytes = storage.read_all().await?;
        let mut bitfield = Self::new();

        for (i, chunk) in bytes.chunks(BYTES_PER_PAGE).enumerate() {
            let page = Page::from_bytes(chunk);
            if !page.is_empty() {
                bitfield.put_page(i as u64, page);
            }
        }

        trace!(target: "mulog::bitfield", pages = bitfield.pages.len(), "opened bitfield");
        Ok(bitfield)
    }

    /// Builds a bitfield from a packed big-endian bit buffer whose first bit
    /// is block `start`.
    pub fn from_buffer(start: u64, buffer: &[u8]) -> Self {
        let mut bitfield = Self::new();
        bitfield.insert_buffer(start, buffer);
        bitfield
    }

    pub fn insert_buffer(&mut self, start: u64, buffer: &[u8]) {
        for (i, byte) in buffer.iter().enumerate() {
            if *byte == 0 {
                continue;
            }
            for bit in 0..8 {
                if byte & (0x80 >> bit) != 0 {
                    self.set(start + i as u64 * 8 + bit, true);
                }
            }
        }
    }

    pub fn get(&self, index: u64) -> bool {
        self.pages
            .get(&(index / BITS_PER_PAGE))
            .is_some_and(|page| page.get(index % BITS_PER_PAGE))
    }

    /// Returns whether the bit changed.
    pub fn set(&mut self, index: u64, value: bool) -> bool {
        let p = index / BITS_PER_PAGE;
        let bit = index % BITS_PER_PAGE;

        let changed = match self.pages.get_mut(&p) {
            Some(page) => page.set(bit, value),
            None if value => {
                let mut page = Page::new();
                page.set(bit, true);
                self.pages.insert(p, page);
                true
            }
            None => false,
        };

        if changed {
            self.settle(p);
        }
        changed
    }

    pub fn set_range(&mut self, start: u64, length: u64, value: bool) {
        if length == 0 {
            return;
        }
        let end = start.saturating_add(length);
        let first = start / BITS_PER_PAGE;
        let last = (end - 1) / BITS_PER_PAGE;

        let pages: Vec<u64> = if value {
            (first..=last).collect()
        } else {
            self.pages.range(first..=last).map(|(p, _)| *p).collect()
        };

        for p in pages {
            let from = start.max(p * BITS_PER_PAGE) - p * BITS_PER_PAGE;
            let to = end.min((p + 1) * BITS_PER_PAGE) - p * BITS_PER_PAGE;

            if from == 0 && to == BITS_PER_PAGE {
                if value {
                    self.pages.insert(p, Page::full());
                } else {
                    self.pages.remove(&p);
                }
            } else {
                self.pages
                    .entry(p)
                    .or_default()
                    .set_range(from, to, value);
            }
            self.settle(p);
        }
    }

    /// First index at or after `from` holding `value`.
    pub fn find_first(&self, value: bool, from: u64) -> Option<u64> {
        let p = from / BITS_PER_PAGE;
        let offset = from % BITS_PER_PAGE;

        if value {
            if let Some(bit) = self.pages.get(&p).and_then(|pg| pg.find_first(true, offset)) {
                return Some(p * BITS_PER_PAGE + bit);
            }
            let (next, page) = self.pages.range(p + 1..).next()?;
            return Some(next * BITS_PER_PAGE + page.find_first(true, 0)?);
        }

        let Some(page) = self.pages.get(&p) else {
            return Some(from);
        };
        if let Some(bit) = page.find_first(false, offset) {
            return Some(p * BITS_PER_PAGE + bit);
        }

        let next = self.first_not_full(p + 1);
        match self.pages.get(&next) {
            None => Some(next * BITS_PER_PAGE),
            Some(page) => Some(next * BITS_PER_PAGE + page.find_first(false, 0)?),
        }
    }

    /// Last index strictly before `before` holding `value`.
    pub fn find_last(&self, value: bool, before: u64) -> Option<u64> {
        let at = before.checked_sub(1)?;
        let p = at / BITS_PER_PAGE;
        let offset = at % BITS_PER_PAGE;

        if value {
            if let Some(bit) = self.pages.get(&p).and_then(|pg| pg.find_last(true, offset)) {
                return Some(p * BITS_PER_PAGE + bit);
            }
            let (prev, page) = self.pages.range(..p).next_back()?;
            return Some(prev * BITS_PER_PAGE + page.find_last(true, BITS_PER_PAGE - 1)?);
        }

        let Some(page) = self.pages.get(&p) else {
            return Some(at);
        };
        if let Some(bit) = page.find_last(false, offset) {
            return Some(p * BITS_PER_PAGE + bit);
        }

        let prev = self.last_not_full(p.checked_sub(1)?)?;
        match self.pages.get(&prev) {
            None => Some(prev * BITS_PER_PAGE + BITS_PER_PAGE - 1),
            Some(page) => Some(prev * BITS_PER_PAGE + page.find_last(false, BITS_PER_PAGE - 1)?),
        }
    }

    /// Length of the fully present prefix.
    pub fn contiguous_length(&self) -> u64 {
        self.find_first(false, 0).unwrap_or(0)
    }

    /// Number of set bits in `start..start + length`.
    pub fn count(&self, start: u64, length: u64) -> u64 {
        let end = start + length;
        let mut count = 0;
        let mut i = start;

        while let Some(first) = self.find_first(true, i).filter(|f| *f < end) {
            let stop = self.find_first(false, first).unwrap_or(end).min(end);
            count += stop - first;
            i = stop;
        }
        count
    }

    /// Packs `[0, length)` MSB-first, one bit per block.
    pub fn to_buffer(&self, length: u64) -> Vec<u8> {
        let mut buffer = vec![0u8; length.div_ceil(8) as usize];
        let mut i = 0;

        while let Some(first) = self.find_first(true, i).filter(|f| *f < length) {
            let stop = self.find_first(false, first).unwrap_or(length).min(length);
            for index in first..stop {
                buffer[(index / 8) as usize] |= 0x80 >> (index % 8);
            }
            i = stop;
        }
        buffer
    }

    /// The on-disk form of page `p`; absent pages are zeros.
    pub fn page_bytes(&self, p: u64) -> Vec<u8> {
        match self.pages.get(&p) {
            Some(page) => page.to_bytes(),
            None => vec![0; BYTES_PER_PAGE],
        }
    }

    pub async fn write_pages(&self, storage: &dyn Storage, pages: &BTreeSet<u64>) -> Result<()> {
        for p in pages {
            storage
                .write(p * BYTES_PER_PAGE as u64, &self.page_bytes(*p))
                .await?;
        }
        trace!(target: "mulog::bitfield", pages = pages.len(), "flushed pages");
        Ok(())
    }

    fn put_page(&mut self, p: u64, page: Page) {
        self.pages.insert(p, page);
        self.settle(p);
    }

    /// Brings the page-level index in line with page `p`.
    fn settle(&mut self, p: u64) {
        let (empty, full) = match self.pages.get(&p) {
            Some(page) => (page.is_empty(), page.is_full()),
            None => (true, false),
        };

        if empty {
            self.pages.remove(&p);
        }
        if full {
            self.insert_full(p);
        } else {
            self.remove_full(p);
        }
    }

    fn full_run(&self, p: u64) -> Option<(u64, u64)> {
        self.full
            .range(..=p)
            .next_back()
            .filter(|(_, end)| **end > p)
            .map(|(start, end)| (*start, *end))
    }

    fn insert_full(&mut self, p: u64) {
        if self.full_run(p).is_some() {
            return;
        }

        let mut start = p;
        let mut end = p + 1;

        if let Some((s, _)) = self.full.range(..p).next_back().filter(|(_, e)| **e == p) {
            start = *s;
        }
        if let Some(e) = self.full.remove(&(p + 1)) {
            end = e;
        }
        self.full.insert(start, end);
    }

    fn remove_full(&mut self, p: u64) {
        let Some((start, end)) = self.full_run(p) else {
            return;
        };

        self.full.remove(&start);
        if start < p {
            self.full.insert(start, p);
        }
        if p + 1 < end {
            self.full.insert(p + 1, end);
        }
    }

    fn first_not_full(&self, p: u64) -> u64 {
        self.full_run(p).map_or(p, |(_, end)| end)
    }

    fn last_not_full(&self, p: u64) -> Option<u64> {
        match self.full_run(p) {
            Some((start, _)) => start.checked_sub(1),
            None => Some(p),
        }
    }
}
