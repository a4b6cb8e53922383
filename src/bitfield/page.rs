//! A fixed-size page of bits with a two-level summary.
//!
//! Level one keeps, for every 64-bit word, whether it is all ones (`full`)
//! and whether it is all zeros (`empty`). Level two folds each group of 64
//! words into two bits, so a search touches at most eight summary words
//! before it reaches the word holding the answer.

pub(crate) const WORDS: usize = 512;
const GROUPS: usize = WORDS / 64;

pub const BITS_PER_PAGE: u64 = (WORDS * 64) as u64;
pub const BYTES_PER_PAGE: usize = WORDS * 8;

#[inline]
fn low_mask(bit: u64) -> u64 {
    // Bits 0..=bit.
    if bit >= 63 {
        !0
    } else {
        (1u64 << (bit + 1)) - 1
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    words: Vec<u64>,
    full: [u64; GROUPS],
    empty: [u64; GROUPS],
    top_full: u8,
    top_empty: u8,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("top_full", &format_args!("{:08b}", self.top_full))
            .field("top_empty", &format_args!("{:08b}", self.top_empty))
            .finish()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            words: vec![0; WORDS],
            full: [0; GROUPS],
            empty: [!0; GROUPS],
            top_full: 0,
            top_empty: !0,
        }
    }
}

impl Page {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn full() -> Self {
        Self {
            words: vec![!0; WORDS],
            full: [!0; GROUPS],
            empty: [0; GROUPS],
            top_full: !0,
            top_empty: 0,
        }
    }

    /// Decodes a page from its on-disk form, little-endian words. Short input
    /// is zero-padded.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut page = Self::new();
        for (i, chunk) in bytes.chunks(8).take(WORDS).enumerate() {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            page.words[i] = u64::from_le_bytes(word);
        }
        page.refresh_all();
        page
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.top_empty == !0
    }

    pub fn is_full(&self) -> bool {
        self.top_full == !0
    }

    pub fn get(&self, bit: u64) -> bool {
        self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    /// Returns whether the bit changed.
    pub fn set(&mut self, bit: u64, value: bool) -> bool {
        let w = (bit / 64) as usize;
        let mask = 1u64 << (bit % 64);
        let before = self.words[w];

        if value {
            self.words[w] |= mask;
        } else {
            self.words[w] &= !mask;
        }

        if before == self.words[w] {
            return false;
        }
        self.refresh(w);
        true
    }

    /// Sets bits `start..end` of this page.
    pub fn set_range(&mut self, start: u64, end: u64, value: bool) {
        debug_assert!(end <= BITS_PER_PAGE);
        let mut bit = start;

        while bit < end {
            let w = (bit / 64) as usize;
            let from = bit % 64;
            let to = (end - (w as u64) * 64).min(64);
            let mask = if to - from == 64 {
                !0
            } else {
                ((1u64 << (to - from)) - 1) << from
            };

            if value {
                self.words[w] |= mask;
            } else {
                self.words[w] &= !mask;
            }
            self.refresh(w);
            bit = (w as u64 + 1) * 64;
        }
    }

    pub fn find_first(&self, value: bool, from: u64) -> Option<u64> {
        if from >= BITS_PER_PAGE {
            return None;
        }

        let w = (from / 64) as usize;
        let bits = self.oriented(w, value) & (!0u64 << (from % 64));
        if bits != 0 {
            return Some(w as u64 * 64 + bits.trailing_zeros() as u64);
        }

        let next = self.next_word(w + 1, value)?;
        let bits = self.oriented(next, value);
        Some(next as u64 * 64 + bits.trailing_zeros() as u64)
    }

    /// Last bit at or before `at` holding `value`.
    pub fn find_last(&self, value: bool, at: u64) -> Option<u64> {
        let at = at.min(BITS_PER_PAGE - 1);
        let w = (at / 64) as usize;
        let bits = self.oriented(w, value) & low_mask(at % 64);
        if bits != 0 {
            return Some(w as u64 * 64 + 63 - bits.leading_zeros() as u64);
        }

        let prev = self.prev_word(w.checked_sub(1)?, value)?;
        let bits = self.oriented(prev, value);
        Some(prev as u64 * 64 + 63 - bits.leading_zeros() as u64)
    }

    /// The word with bits flipped so that the searched value reads as one.
    #[inline]
    fn oriented(&self, w: usize, value: bool) -> u64 {
        if value {
            self.words[w]
        } else {
            !self.words[w]
        }
    }

    /// Words that contain at least one bit of `value`, per group.
    #[inline]
    fn candidates(&self, group: usize, value: bool) -> u64 {
        if value {
            !self.empty[group]
        } else {
            !self.full[group]
        }
    }

    #[inline]
    fn group_is_uniform_against(&self, group: usize, value: bool) -> bool {
        let top = if value { self.top_empty } else { self.top_full };
        top & (1 << group) != 0
    }

    fn next_word(&self, from: usize, value: bool) -> Option<usize> {
        if from >= WORDS {
            return None;
        }

        for group in from / 64..GROUPS {
            if self.group_is_uniform_against(group, value) {
                continue;
            }
            let mut mask = self.candidates(group, value);
            if group == from / 64 {
                mask &= !0u64 << (from % 64);
            }
            if mask != 0 {
                return Some(group * 64 + mask.trailing_zeros() as usize);
            }
        }
        None
    }

    fn prev_word(&self, at: usize, value: bool) -> Option<usize> {
        for group in (0..=at / 64).rev() {
            if self.group_is_uniform_against(group, value) {
                continue;
            }
            let mut mask = self.candidates(group, value);
            if group == at / 64 {
                mask &= low_mask((at % 64) as u64);
            }
            if mask != 0 {
                return Some(group * 64 + 63 - mask.leading_zeros() as usize);
            }
        }
        None
    }

    fn refresh(&mut self, w: usize) {
        let group = w / 64;
        let bit = 1u64 << (w % 64);
        let word = self.words[w];

        if word == !0 {
            self.full[group] |= bit;
        } else {
            self.full[group] &= !bit;
        }
        if word == 0 {
            self.empty[group] |= bit;
        } else {
            self.empty[group] &= !bit;
        }

        let top = 1u8 << group;
        if self.full[group] == !0 {
            self.top_full |= top;
        } else {
            self.top_full &= !top;
        }
        if self.empty[group] == !0 {
            self.top_empty |= top;
        } else {
            self.top_empty &= !top;
        }
    }

    fn refresh_all(&mut self) {
        for w in 0..WORDS {
            self.refresh(w);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    #[test]
    fn test_new_page_is_empty() {
        let page = Page::new();
        assert!(page.is_empty());
        assert!(!page.is_full());
        assert_eq!(page.find_first(true, 0), None);
        assert_eq!(page.find_first(false, 100), Some(100));
        assert_eq!(page.find_last(false, BITS_PER_PAGE), Some(BITS_PER_PAGE - 1));
    }

    #[test]
    fn test_full_page() {
        let mut page = Page::full();
        assert!(page.is_full());
        assert_eq!(page.find_first(false, 0), None);

        page.set(20_000, false);
        assert!(!page.is_full());
        assert_eq!(page.find_first(false, 0), Some(20_000));
        assert_eq!(page.find_last(false, BITS_PER_PAGE - 1), Some(20_000));
    }

    #[test]
    fn test_set_range_spans_words() {
        let mut page = Page::new();
        page.set_range(60, 200, true);

        assert!(!page.get(59));
        assert!(page.get(60));
        assert!(page.get(199));
        assert!(!page.get(200));
        assert_eq!(page.find_first(true, 0), Some(60));
        assert_eq!(page.find_first(false, 60), Some(200));
        assert_eq!(page.find_last(true, 10_000), Some(199));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut page = Page::new();
        page.set(0, true);
        page.set(32_767, true);

        let decoded = Page::from_bytes(&page.to_bytes());
        assert_eq!(decoded, page);
        assert_eq!(page.to_bytes().len(), BYTES_PER_PAGE);
    }

    #[proptest(fork = false)]
    fn test_search_matches_scan(
        #[strategy(proptest::collection::vec((0u64..BITS_PER_PAGE, 1u64..3000, any::<bool>()), 0..12))]
        ops: Vec<(u64, u64, bool)>,
        #[strategy(0u64..BITS_PER_PAGE)] at: u64,
        value: bool,
    ) {
        let mut page = Page::new();
        let mut model = vec![false; BITS_PER_PAGE as usize];

        for (start, len, v) in ops {
            let end = (start + len).min(BITS_PER_PAGE);
            page.set_range(start, end, v);
            model[start as usize..end as usize].fill(v);
        }

        let first = (at..BITS_PER_PAGE).find(|i| model[*i as usize] == value);
        let last = (0..=at).rev().find(|i| model[*i as usize] == value);

        prop_assert_eq!(page.find_first(value, at), first);
        prop_assert_eq!(page.find_last(value, at), last);
        prop_assert_eq!(page.is_empty(), model.iter().all(|b| !b));
    }
}
