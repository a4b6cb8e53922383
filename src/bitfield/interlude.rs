use std::collections::BTreeSet;

use super::{Bitfield, BITS_PER_PAGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range {
    start: u64,
    end: u64,
    value: bool,
}

/// Pending bitfield edits, kept as sorted, disjoint ranges where touching
/// ranges of the same value are always merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitInterlude {
    ranges: Vec<Range>,
}

impl BitInterlude {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The pending value of `index`, falling back to `bitfield`.
    pub fn get(&self, bitfield: &Bitfield, index: u64) -> bool {
        let i = self.ranges.partition_point(|r| r.end <= index);
        match self.ranges.get(i) {
            Some(r) if r.start <= index => r.value,
            _ => bitfield.get(index),
        }
    }

    pub fn set(&mut self, index: u64, value: bool) {
        self.set_range(index, index + 1, value);
    }

    /// Records `start..end` as `value`, splitting ranges of the opposite value
    /// and absorbing neighbours of the same one.
    pub fn set_range(&mut self, start: u64, end: u64, value: bool) {
        if start >= end {
            return;
        }

        let mut next = Range { start, end, value };
        let mut ranges = Vec::with_capacity(self.ranges.len() + 2);
        let mut placed = false;

        for r in self.ranges.drain(..) {
            let before = r.end < next.start || (r.end == next.start && r.value != value);
            let after = r.start > next.end || (r.start == next.end && r.value != value);

            if before {
                ranges.push(r);
            } else if after {
                if !placed {
                    ranges.push(next);
                    placed = true;
                }
                ranges.push(r);
            } else if r.value == value {
                next.start = next.start.min(r.start);
                next.end = next.end.max(r.end);
            } else {
                if r.start < next.start {
                    ranges.push(Range {
                        end: next.start,
                        ..r
                    });
                }
                if r.end > next.end {
                    ranges.push(next);
                    placed = true;
                    ranges.push(Range {
                        start: next.end,
                        ..r
                    });
                }
            }
        }

        if !placed {
            ranges.push(next);
        }
        self.ranges = ranges;
    }

    /// `(start, length, value)` for every pending range, in order.
    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64, bool)> + '_ {
        self.ranges.iter().map(|r| (r.start, r.end - r.start, r.value))
    }

    /// Applies every range to `bitfield` and returns the pages that must be
    /// written back, each exactly once.
    pub fn flush(&self, bitfield: &mut Bitfield) -> BTreeSet<u64> {
        let mut pages = BTreeSet::new();

        for r in &self.ranges {
            bitfield.set_range(r.start, r.end - r.start, r.value);
            pages.extend(r.start / BITS_PER_PAGE..=(r.end - 1) / BITS_PER_PAGE);
        }
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    fn collect(interlude: &BitInterlude) -> Vec<(u64, u64, bool)> {
        interlude.ranges().collect()
    }

    #[test]
    fn test_same_value_ranges_coalesce() {
        let mut interlude = BitInterlude::new();
        interlude.set_range(0, 5, true);
        interlude.set_range(10, 15, true);
        interlude.set_range(5, 10, true);

        assert_eq!(collect(&interlude), vec![(0, 15, true)]);
    }

    #[test]
    fn test_opposite_value_splits() {
        let mut interlude = BitInterlude::new();
        interlude.set_range(0, 10, true);
        interlude.set_range(3, 6, false);

        assert_eq!(
            collect(&interlude),
            vec![(0, 3, true), (3, 3, false), (6, 4, true)]
        );
    }

    #[test]
    fn test_get_falls_back_to_bitfield() {
        let mut bitfield = Bitfield::new();
        bitfield.set(20, true);

        let mut interlude = BitInterlude::new();
        interlude.set_range(0, 4, true);
        interlude.set(2, false);

        assert!(interlude.get(&bitfield, 1));
        assert!(!interlude.get(&bitfield, 2));
        assert!(interlude.get(&bitfield, 20));
        assert!(!interlude.get(&bitfield, 21));
    }

    #[test]
    fn test_flush_writes_each_page_once() {
        let mut bitfield = Bitfield::new();
        let mut interlude = BitInterlude::new();

        interlude.set_range(BITS_PER_PAGE - 2, BITS_PER_PAGE + 2, true);
        interlude.set_range(BITS_PER_PAGE + 10, BITS_PER_PAGE + 20, true);
        interlude.set(3 * BITS_PER_PAGE, false);

        let pages = interlude.flush(&mut bitfield);
        assert_eq!(pages.into_iter().collect::<Vec<_>>(), vec![0, 1, 3]);
        assert!(bitfield.get(BITS_PER_PAGE - 1));
        assert!(bitfield.get(BITS_PER_PAGE + 15));
    }

    #[proptest(fork = false)]
    fn test_matches_direct_application(
        #[strategy(proptest::collection::vec((0u64..200, 0u64..50, any::<bool>()), 0..16))]
        ops: Vec<(u64, u64, bool)>,
    ) {
        let mut direct = Bitfield::new();
        let mut staged = Bitfield::new();
        let mut interlude = BitInterlude::new();

        for (start, length, value) in &ops {
            direct.set_range(*start, *length, *value);
            interlude.set_range(*start, start + length, *value);
        }

        for i in 0..260 {
            prop_assert_eq!(interlude.get(&staged, i), direct.get(i));
        }

        let ranges = collect(&interlude);
        for pair in ranges.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            prop_assert!(a.0 + a.1 <= b.0);
            prop_assert!(a.0 + a.1 < b.0 || a.2 != b.2);
        }

        interlude.flush(&mut staged);
        prop_assert_eq!(staged, direct);
    }
}
