//! Flat-tree index arithmetic.
//!
//! A binary tree is laid out in-order over the integers: even indices are
//! leaves (`2 * block`), odd indices are parents. The number of trailing one
//! bits of an index is its depth, so an index encodes both its position and
//! the size of the subtree below it.
//!
//! ```text
//!        3
//!    1       5
//!  0   2   4   6
//! ```

/// Depth of the node, i.e. the number of trailing one bits.
#[inline]
pub fn depth(index: u64) -> u64 {
    (!index).trailing_zeros() as u64
}

/// Position of the node within its depth, counting from the left.
#[inline]
pub fn offset(index: u64) -> u64 {
    if index & 1 == 0 {
        return index / 2;
    }
    (((index + 1) >> depth(index)) - 1) / 2
}

/// Index of the node at `depth` and `offset`.
#[inline]
pub fn index(depth: u64, offset: u64) -> u64 {
    ((1 + 2 * offset) << depth) - 1
}

#[inline]
pub fn parent(index: u64) -> u64 {
    let depth = depth(index);
    self::index(depth + 1, offset(index) >> 1)
}

#[inline]
pub fn sibling(index: u64) -> u64 {
    let depth = depth(index);
    self::index(depth, offset(index) ^ 1)
}

/// Left and right children, `None` for leaves.
#[inline]
pub fn children(index: u64) -> Option<(u64, u64)> {
    if index & 1 == 0 {
        return None;
    }
    let depth = depth(index);
    let offset = offset(index) * 2;
    Some((
        self::index(depth - 1, offset),
        self::index(depth - 1, offset + 1),
    ))
}

/// Leftmost leaf covered by the subtree rooted at `index`.
#[inline]
pub fn left_span(index: u64) -> u64 {
    if index & 1 == 0 {
        return index;
    }
    offset(index) * (2 << depth(index))
}

/// Rightmost leaf covered by the subtree rooted at `index`.
#[inline]
pub fn right_span(index: u64) -> u64 {
    if index & 1 == 0 {
        return index;
    }
    (offset(index) + 1) * (2 << depth(index)) - 2
}

#[inline]
pub fn spans(index: u64) -> (u64, u64) {
    (left_span(index), right_span(index))
}

/// Number of leaves (blocks) below `index`.
#[inline]
pub fn count_leaves(index: u64) -> u64 {
    1 << depth(index)
}

/// The minimal set of complete subtrees covering every leaf below `index`,
/// which must be even. For `index = 2 * length` this is the root set of a
/// log of `length` blocks, ordered by ascending index.
pub fn full_roots(index: u64) -> Vec<u64> {
    debug_assert!(index & 1 == 0, "full roots are only defined for even indices");

    let mut result = Vec::new();
    let mut remaining = index / 2;
    let mut offset = 0;

    while remaining > 0 {
        let mut factor = 1;
        while factor * 2 <= remaining {
            factor *= 2;
        }
        result.push(offset + factor - 1);
        offset += 2 * factor;
        remaining -= factor;
    }

    result
}

/// A cursor over the flat tree. Stepping to a parent, child or sibling is
/// O(1) since the depth-dependent factor is carried along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iterator {
    pub index: u64,
    pub offset: u64,
    /// Twice the number of leaves below `index`.
    pub factor: u64,
}

impl Iterator {
    pub fn new(index: u64) -> Self {
        let mut ite = Self {
            index: 0,
            offset: 0,
            factor: 0,
        };
        ite.seek(index);
        ite
    }

    pub fn seek(&mut self, index: u64) {
        self.index = index;
        if index & 1 == 1 {
            self.offset = offset(index);
            self.factor = 2 << depth(index);
        } else {
            self.offset = index / 2;
            self.factor = 2;
        }
    }

    pub fn is_left(&self) -> bool {
        self.offset & 1 == 0
    }

    pub fn is_right(&self) -> bool {
        !self.is_left()
    }

    pub fn is_leaf(&self) -> bool {
        self.factor == 2
    }

    /// Whether `index` lies within the subtree rooted at the cursor.
    pub fn contains(&self, index: u64) -> bool {
        if index > self.index {
            index < self.index + self.factor / 2
        } else if index < self.index {
            index + self.factor / 2 > self.index
        } else {
            true
        }
    }

    pub fn prev(&mut self) -> u64 {
        if self.offset == 0 {
            return self.index;
        }
        self.offset -= 1;
        self.index -= self.factor;
        self.index
    }

    pub fn next(&mut self) -> u64 {
        self.offset += 1;
        self.index += self.factor;
        self.index
    }

    pub fn sibling(&mut self) -> u64 {
        if self.is_left() {
            self.next()
        } else {
            self.prev()
        }
    }

    pub fn parent(&mut self) -> u64 {
        if self.offset & 1 == 1 {
            self.index -= self.factor / 2;
            self.offset = (self.offset - 1) / 2;
        } else {
            self.index += self.factor / 2;
            self.offset /= 2;
        }
        self.factor *= 2;
        self.index
    }

    pub fn left_span(&self) -> u64 {
        self.index + 1 - self.factor / 2
    }

    pub fn right_span(&self) -> u64 {
        self.index + self.factor / 2 - 1
    }

    pub fn count_leaves(&self) -> u64 {
        self.factor / 2
    }

    pub fn left_child(&mut self) -> u64 {
        if self.factor == 2 {
            return self.index;
        }
        self.factor /= 2;
        self.index -= self.factor / 2;
        self.offset *= 2;
        self.index
    }

    pub fn right_child(&mut self) -> u64 {
        if self.factor == 2 {
            return self.index;
        }
        self.factor /= 2;
        self.index += self.factor / 2;
        self.offset = 2 * self.offset + 1;
        self.index
    }

    /// Jump to the first leaf after the current subtree.
    pub fn next_tree(&mut self) -> u64 {
        self.index = self.index + self.factor / 2 + 1;
        self.offset = self.index / 2;
        self.factor = 2;
        self.index
    }

    /// Grow the cursor, which must sit on a leaf, to the largest complete
    /// subtree that fits below `head`. Returns false once the leaf itself is
    /// past `head`, which ends a root walk:
    ///
    /// ```
    /// use mulog::flat_tree::Iterator;
    ///
    /// let mut roots = vec![];
    /// let mut ite = Iterator::new(0);
    /// while ite.full_root(10) {
    ///     roots.push(ite.index);
    ///     ite.next_tree();
    /// }
    /// assert_eq!(roots, vec![3, 8]);
    /// ```
    pub fn full_root(&mut self, head: u64) -> bool {
        if head <= self.index || self.index & 1 == 1 {
            return false;
        }
        while head > self.index + self.factor + self.factor / 2 {
            self.index += self.factor / 2;
            self.factor *= 2;
            self.offset /= 2;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    #[test]
    fn test_small_tree() {
        assert_eq!(parent(0), 1);
        assert_eq!(parent(2), 1);
        assert_eq!(parent(1), 3);
        assert_eq!(parent(5), 3);
        assert_eq!(sibling(0), 2);
        assert_eq!(sibling(1), 5);
        assert_eq!(children(3), Some((1, 5)));
        assert_eq!(children(4), None);
        assert_eq!(spans(3), (0, 6));
        assert_eq!(spans(9), (8, 10));
        assert_eq!(depth(7), 3);
        assert_eq!(offset(11), 1);
        assert_eq!(offset(5), 1);
        assert_eq!(index(1, 2), 9);
    }

    #[test]
    fn test_full_roots() {
        assert_eq!(full_roots(0), Vec::<u64>::new());
        assert_eq!(full_roots(2), vec![0]);
        assert_eq!(full_roots(8), vec![3]);
        assert_eq!(full_roots(10), vec![3, 8]);
        assert_eq!(full_roots(14), vec![3, 9, 12]);
        assert_eq!(full_roots(16), vec![7]);
    }

    #[proptest(fork = false)]
    fn test_roots_partition_the_length(#[strategy(0u64..100_000)] length: u64) {
        let mut next = 0;
        let mut leaves = 0;

        for root in full_roots(2 * length) {
            let (left, right) = spans(root);
            prop_assert_eq!(left, next);
            next = right + 2;
            leaves += count_leaves(root);
        }

        prop_assert_eq!(leaves, length);
        prop_assert_eq!(next, 2 * length);
    }

    #[proptest(fork = false)]
    fn test_parent_and_children_agree(#[strategy(0u64..1 << 40)] index: u64) {
        let p = parent(index);
        let (left, right) = children(p).unwrap();

        prop_assert!(left == index || right == index);
        prop_assert_eq!(sibling(left), right);
        prop_assert_eq!(sibling(right), left);
    }

    #[proptest(fork = false)]
    fn test_iterator_matches_functions(#[strategy(0u64..1 << 40)] index: u64) {
        let mut ite = Iterator::new(index);
        prop_assert_eq!(ite.left_span(), left_span(index));
        prop_assert_eq!(ite.right_span(), right_span(index));
        prop_assert_eq!(ite.count_leaves(), count_leaves(index));

        prop_assert_eq!(ite.sibling(), sibling(index));
        ite.seek(index);
        prop_assert_eq!(ite.parent(), parent(index));

        if let Some((left, right)) = children(index) {
            ite.seek(index);
            prop_assert_eq!(ite.left_child(), left);
            prop_assert_eq!(ite.sibling(), right);
            ite.seek(index);
            prop_assert_eq!(ite.right_child(), right);
        }
    }

    #[proptest(fork = false)]
    fn test_contains_matches_spans(
        #[strategy(0u64..1 << 20)] root: u64,
        #[strategy(0u64..1 << 21)] other: u64,
    ) {
        let (left, right) = spans(root);
        prop_assert_eq!(Iterator::new(root).contains(other), other >= left && other <= right);
    }

    #[proptest(fork = false)]
    fn test_full_root_walk_matches_full_roots(#[strategy(0u64..100_000)] length: u64) {
        let mut roots = vec![];
        let mut ite = Iterator::new(0);

        while ite.full_root(2 * length) {
            roots.push(ite.index);
            ite.next_tree();
        }

        prop_assert_eq!(roots, full_roots(2 * length));
    }
}
