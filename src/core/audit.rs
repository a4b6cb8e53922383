use tracing::{info, instrument};

use super::{Core, CoreEvent};
use crate::{
    oplog::{BitfieldEntry, OplogEntry},
    prelude::*,
};

/// What an audit had to throw away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Nodes that did not hash to their parent.
    pub tree_nodes: u64,
    /// Blocks that did not hash to their leaf.
    pub blocks: u64,
}

impl Core {
    /// Rehashes the stored tree and blocks, forgetting whatever does not
    /// check out so it can be fetched again.
    #[instrument(skip(self))]
    pub async fn audit(&self) -> Result<AuditReport> {
        let _guard = self.inner.mutex.lock().await?;
        let mut oplog = self.inner.oplog.lock().await;
        let mut state = self.inner.state.write().await;
        let mut report = AuditReport::default();

        let mut stack = state.tree.roots.clone();
        while let Some(node) = stack.pop() {
            let Some((left, right)) = flat_tree::children(node.index) else {
                continue;
            };
            let left = state.tree.get_optional(left).await?;
            let right = state.tree.get_optional(right).await?;
            let (Some(left), Some(right)) = (left, right) else {
                continue;
            };

            if Node::parent(node.index, &left, &right).hash == node.hash {
                stack.push(left);
                stack.push(right);
            } else {
                state.tree.blank_node(left.index);
                state.tree.blank_node(right.index);
                report.tree_nodes += 2;
            }
        }

        let mut dropped = BitInterlude::new();
        let length = state.tree.length;
        let mut i = 0;
        while let Some(index) = state.bitfield.find_first(true, i).filter(|i| *i < length) {
            i = index + 1;

            let leaf = state.tree.get_optional(2 * index).await?;
            let value = self.read_block(&state, index).await;
            let valid = match (leaf, value) {
                (Some(leaf), Ok(Some(value))) => Node::leaf(2 * index, &value).hash == leaf.hash,
                _ => false,
            };
            if !valid {
                dropped.set(index, false);
                report.blocks += 1;
            }
        }

        if report == AuditReport::default() {
            return Ok(report);
        }

        let entries: Vec<_> = dropped
            .ranges()
            .map(|(start, length, _)| OplogEntry {
                bitfield: Some(BitfieldEntry {
                    start,
                    length,
                    drop: true,
                }),
                ..Default::default()
            })
            .collect();
        if !entries.is_empty() {
            oplog.append(&entries, true).await?;
        }

        let status = state.apply_bits(&dropped);
        state.force_flush = true;

        info!(
            target: "mulog::core",
            tree_nodes = report.tree_nodes,
            blocks = report.blocks,
            "audit repaired core"
        );
        self.emit(CoreEvent::Update {
            status,
            bitfield: None,
            value: None,
            from: None,
        });
        self.settle(&mut state, &mut oplog).await?;
        Ok(report)
    }
}
