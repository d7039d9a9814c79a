/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::constants::META_ALIGNED_BYTES;

type NodeId = u32;

struct Node {
    size: usize,
    /// All free blocks of `size`; the last one is handed out first.
    blocks: Vec<usize>,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
}

/// Unbalanced binary search tree of free blocks keyed by size.
///
/// Blocks of equal size share one node. Nodes live in a flat vector and are
/// recycled through `free_nodes`.
pub(crate) struct BlockTree {
    nodes: Vec<Node>,
    free_nodes: Vec<NodeId>,
    root: Option<NodeId>,
    count: usize,
    total_bytes: usize,
}

impl BlockTree {
    /// Smallest block kept in the tree; smaller blocks go to the block array.
    pub(crate) const MIN_BYTES: usize = 32 * META_ALIGNED_BYTES;

    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            root: None,
            count: 0,
            total_bytes: 0,
        }
    }

    #[inline]
    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id as usize]
    }

    fn new_node(&mut self, size: usize, addr: usize, parent: Option<NodeId>) -> NodeId {
        let node = Node {
            size,
            blocks: vec![addr],
            parent,
            left: None,
            right: None,
        };
        match self.free_nodes.pop() {
            Some(id) => {
                *self.node_mut(id) = node;
                id
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as NodeId
            }
        }
    }

    pub(crate) fn add(&mut self, addr: usize, bytes: usize) {
        debug_assert!(bytes >= Self::MIN_BYTES);
        self.count += 1;
        self.total_bytes += bytes;

        let Some(mut curr) = self.root else {
            self.root = Some(self.new_node(bytes, addr, None));
            return;
        };
        loop {
            let node = self.node(curr);
            if bytes == node.size {
                self.node_mut(curr).blocks.push(addr);
                return;
            }
            let child = if bytes < node.size { node.left } else { node.right };
            match child {
                Some(c) => curr = c,
                None => {
                    let id = self.new_node(bytes, addr, Some(curr));
                    let parent = self.node_mut(curr);
                    if bytes < parent.size {
                        parent.left = Some(id);
                    } else {
                        parent.right = Some(id);
                    }
                    return;
                }
            }
        }
    }

    /// Node with the smallest size `>= bytes`.
    fn find_closest_fit(&self, bytes: usize) -> Option<NodeId> {
        let mut best = None;
        let mut curr = self.root;
        while let Some(c) = curr {
            let node = self.node(c);
            if node.size == bytes {
                return Some(c);
            }
            if node.size > bytes {
                best = Some(c);
                curr = node.left;
            } else {
                curr = node.right;
            }
        }
        best
    }

    /// Takes a block of at least `bytes`, returning its address and real size.
    pub(crate) fn remove(&mut self, bytes: usize) -> Option<(usize, usize)> {
        let id = self.find_closest_fit(bytes)?;
        let size = self.node(id).size;
        let addr = if self.node(id).blocks.len() > 1 {
            self.node_mut(id).blocks.pop()?
        } else {
            let addr = self.node(id).blocks[0];
            self.remove_node(id);
            addr
        };
        self.count -= 1;
        self.total_bytes -= size;
        Some((addr, size))
    }

    fn remove_node(&mut self, id: NodeId) {
        let (left, right) = (self.node(id).left, self.node(id).right);
        match (left, right) {
            (Some(_), Some(r)) => {
                // move the in-order successor's payload here and drop the successor instead
                let mut succ = r;
                while let Some(l) = self.node(succ).left {
                    succ = l;
                }
                let size = self.node(succ).size;
                let blocks = core::mem::take(&mut self.node_mut(succ).blocks);
                let node = self.node_mut(id);
                node.size = size;
                node.blocks = blocks;
                let succ_right = self.node(succ).right;
                self.replace_in_parent(succ, succ_right);
                self.free_nodes.push(succ);
            }
            (child, None) | (None, child) => {
                self.replace_in_parent(id, child);
                self.node_mut(id).blocks.clear();
                self.free_nodes.push(id);
            }
        }
    }

    fn replace_in_parent(&mut self, id: NodeId, child: Option<NodeId>) {
        let parent = self.node(id).parent;
        if let Some(c) = child {
            self.node_mut(c).parent = parent;
        }
        match parent {
            None => self.root = child,
            Some(p) => {
                let parent = self.node_mut(p);
                if parent.left == Some(id) {
                    parent.left = child;
                } else {
                    parent.right = child;
                }
            }
        }
        let node = self.node_mut(id);
        node.parent = None;
        node.left = None;
        node.right = None;
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    /// In-order list of `(size, address)` for every block.
    pub(crate) fn blocks(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(self.count);
        let mut stack = Vec::new();
        let mut curr = self.root;
        while curr.is_some() || !stack.is_empty() {
            while let Some(c) = curr {
                stack.push(c);
                curr = self.node(c).left;
            }
            let Some(c) = stack.pop() else {
                break;
            };
            let node = self.node(c);
            out.extend(node.blocks.iter().map(|a| (node.size, *a)));
            curr = node.right;
        }
        out
    }

    /// Panics if ordering, parent links or totals are broken.
    pub(crate) fn verify(&self) {
        let mut count = 0;
        let mut total = 0;
        let mut stack: Vec<(NodeId, usize, usize)> = Vec::new();
        if let Some(root) = self.root {
            assert_eq!(self.node(root).parent, None);
            stack.push((root, 0, usize::MAX));
        }
        while let Some((id, low, high)) = stack.pop() {
            let node = self.node(id);
            assert!(node.size >= low && node.size < high, "tree order broken at size {}", node.size);
            assert!(!node.blocks.is_empty(), "empty tree node");
            count += node.blocks.len();
            total += node.size * node.blocks.len();
            if let Some(l) = node.left {
                assert_eq!(self.node(l).parent, Some(id));
                stack.push((l, low, node.size));
            }
            if let Some(r) = node.right {
                assert_eq!(self.node(r).parent, Some(id));
                stack.push((r, node.size + 1, high));
            }
        }
        assert_eq!(count, self.count, "tree block count out of sync");
        assert_eq!(total, self.total_bytes, "tree total out of sync");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};

    const MIN: usize = BlockTree::MIN_BYTES;

    #[test]
    fn test_closest_fit() {
        let mut tree = BlockTree::new();
        for (i, size) in [MIN * 4, MIN * 2, MIN * 6, MIN, MIN * 3, MIN * 5].iter().enumerate() {
            tree.add(i * 0x10000, *size);
        }
        tree.verify();

        assert_eq!(tree.remove(MIN * 3 - 8), Some((4 * 0x10000, MIN * 3)));
        assert_eq!(tree.remove(MIN * 4), Some((0, MIN * 4)));
        assert_eq!(tree.remove(MIN * 7), None);
        tree.verify();
        assert_eq!(tree.count(), 4);
    }

    #[test]
    fn test_duplicates_share_node() {
        let mut tree = BlockTree::new();
        tree.add(0x1000, MIN);
        tree.add(0x2000, MIN);
        tree.add(0x3000, MIN * 2);
        tree.verify();
        assert_eq!(tree.remove(MIN), Some((0x2000, MIN)));
        assert_eq!(tree.remove(MIN), Some((0x1000, MIN)));
        assert_eq!(tree.remove(MIN), Some((0x3000, MIN * 2)));
        assert_eq!(tree.count(), 0);
        assert_eq!(tree.total_bytes(), 0);
        tree.verify();
    }

    #[test]
    fn test_remove_node_with_two_children() {
        let mut tree = BlockTree::new();
        for size in [50, 30, 70, 60, 80, 65] {
            tree.add(size * 0x100, size * 64);
        }
        assert_eq!(tree.remove(50 * 64), Some((50 * 0x100, 50 * 64)));
        tree.verify();
        let sizes: Vec<_> = tree.blocks().iter().map(|(s, _)| *s / 64).collect();
        assert_eq!(sizes, vec![30, 60, 65, 70, 80]);
    }

    #[test]
    fn test_random_round_trip() {
        let mut rng = SmallRng::seed_from_u64(17);
        let mut sizes: Vec<usize> = (0..300).map(|i| MIN + (i % 37) * 8).collect();
        sizes.shuffle(&mut rng);

        let mut tree = BlockTree::new();
        for (i, size) in sizes.iter().enumerate() {
            tree.add(i * 0x1000, *size);
        }
        tree.verify();

        sizes.shuffle(&mut rng);
        for size in &sizes {
            let (_, real) = tree.remove(*size).unwrap();
            assert!(real >= *size);
        }
        assert_eq!(tree.count(), 0);
        tree.verify();
    }
}
