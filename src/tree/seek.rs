use crate::prelude::*;

/// Where a byte offset lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteSeek {
    /// Inside block `index`, `offset` bytes in.
    Found { index: u64, offset: u64 },
    /// Somewhere in blocks `start..end`, which are not known locally.
    Narrowed { start: u64, end: u64 },
}

impl MerkleTree {
    /// Maps a byte offset to a block. `None` if the offset is past the end of
    /// the log.
    pub async fn seek(&self, bytes: u64) -> Result<Option<ByteSeek>> {
        if bytes > self.byte_length {
            return Ok(None);
        }
        if bytes == 0 {
            return Ok(Some(ByteSeek::Found {
                index: 0,
                offset: 0,
            }));
        }

        let mut bytes = bytes;
        for root in &self.roots {
            if bytes == root.size {
                return Ok(Some(boundary(root.index)));
            }
            if bytes > root.size {
                bytes -= root.size;
                continue;
            }

            let mut ite = flat_tree::Iterator::new(root.index);
            while ite.index & 1 == 1 {
                match self.get_optional(ite.left_child()).await? {
                    Some(left) if left.size == bytes => return Ok(Some(boundary(left.index))),
                    Some(left) if left.size > bytes => continue,
                    Some(left) => {
                        bytes -= left.size;
                        ite.sibling();
                    }
                    None => {
                        ite.parent();
                        let (start, end) = flat_tree::spans(ite.index);
                        return Ok(Some(ByteSeek::Narrowed {
                            start: start / 2,
                            end: end / 2 + 1,
                        }));
                    }
                }
            }

            return Ok(Some(ByteSeek::Found {
                index: ite.index / 2,
                offset: bytes,
            }));
        }

        Ok(None)
    }

    /// The node holding `bytes`, searching the roots of a tree of `head / 2`
    /// blocks.
    pub(crate) async fn seek_from_head(&self, head: u64, bytes: u64) -> Result<u64> {
        let mut bytes = bytes;

        for root in flat_tree::full_roots(head) {
            let node = self.get(root).await?;
            if bytes == node.size {
                return Ok(root);
            }
            if bytes > node.size {
                bytes -= node.size;
                continue;
            }
            return self.seek_trusted_tree(root, bytes).await;
        }

        Ok(head)
    }

    /// Descends from `root` towards the node holding `bytes`, which is an
    /// offset relative to the start of `root`. Stops at the deepest node
    /// whose children are not stored.
    pub(crate) async fn seek_trusted_tree(&self, root: u64, bytes: u64) -> Result<u64> {
        if bytes == 0 {
            return Ok(root);
        }

        let mut bytes = bytes;
        let mut ite = flat_tree::Iterator::new(root);

        while ite.index & 1 == 1 {
            match self.get_optional(ite.left_child()).await? {
                Some(left) if left.size == bytes => return Ok(ite.index),
                Some(left) if left.size > bytes => continue,
                Some(left) => {
                    bytes -= left.size;
                    ite.sibling();
                }
                None => {
                    ite.parent();
                    return Ok(ite.index);
                }
            }
        }

        Ok(ite.index)
    }

    /// Like [`Self::seek_trusted_tree`] but with an absolute offset, which must
    /// fall inside `root`.
    pub(crate) async fn seek_untrusted_tree(&self, root: u64, bytes: u64) -> Result<u64> {
        let offset = self.byte_offset(root).await?;

        if offset > bytes {
            return Err(Error::InvalidRequest("seek is before the requested node".into()));
        }
        if offset == bytes {
            return Ok(root);
        }

        let bytes = bytes - offset;
        if self.get(root).await?.size <= bytes {
            return Err(Error::InvalidRequest("seek is past the requested node".into()));
        }

        self.seek_trusted_tree(root, bytes).await
    }
}

/// The position right after the subtree at `index`.
fn boundary(index: u64) -> ByteSeek {
    ByteSeek::Found {
        index: flat_tree::right_span(index) / 2 + 1,
        offset: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::testing::*;

    #[tokio::test]
    async fn test_seek_in_complete_tree() {
        let tree = tree_with(5).await;
        let size = block(0).len() as u64;

        assert_eq!(
            tree.seek(0).await.unwrap(),
            Some(ByteSeek::Found { index: 0, offset: 0 })
        );
        assert_eq!(
            tree.seek(size + 3).await.unwrap(),
            Some(ByteSeek::Found { index: 1, offset: 3 })
        );
        assert_eq!(
            tree.seek(2 * size).await.unwrap(),
            Some(ByteSeek::Found { index: 2, offset: 0 })
        );
        assert_eq!(
            tree.seek(tree.byte_length).await.unwrap(),
            Some(ByteSeek::Found { index: 5, offset: 0 })
        );
        assert_eq!(tree.seek(tree.byte_length + 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_seek_narrows_on_missing_nodes() {
        let mut tree = tree_with(8).await;
        tree.blank_node(1);
        tree.blank_node(5);

        assert_eq!(
            tree.seek(1).await.unwrap(),
            Some(ByteSeek::Narrowed { start: 0, end: 4 })
        );
    }

    #[tokio::test]
    async fn test_untrusted_seek_must_fall_inside_root() {
        let tree = tree_with(4).await;
        let size = block(0).len() as u64;

        assert_eq!(tree.seek_untrusted_tree(5, 2 * size + 1).await.unwrap(), 4);
        assert!(tree.seek_untrusted_tree(5, 1).await.is_err());
        assert!(tree.seek_untrusted_tree(5, 4 * size).await.is_err());
    }
}
