//! Tag trees (component M, §4.M): the quad-tree structure used to code
//! per-precinct inclusion and zero-bit-plane information compactly in
//! packet headers.
//!
//! A tag tree over an `w x h` grid of leaves is a pyramid of nodes, each
//! level roughly a quarter the size of the one below, down to a single
//! root. Each node carries a monotonically non-increasing `value` (the
//! smallest threshold at which that node, or any of its descendants, is
//! known to be "reached"), plus `low`/`known` bookkeeping used by the
//! progressive encode/decode below. Nodes are stored in one flat `Vec`
//! with index-based parent links rather than the pointer tree the
//! teacher project builds by hand.

#[derive(Debug, Clone, Copy)]
struct TgtNode {
    parent: Option<usize>,
    value: i32,
    low: i32,
    known: bool,
}

impl Default for TgtNode {
    fn default() -> Self {
        TgtNode {
            parent: None,
            value: i32::MAX,
            low: 0,
            known: false,
        }
    }
}

/// A tag tree over a `numleafsh x numleafsv` array of leaves.
pub struct TagTree {
    numleafsh: u32,
    numleafsv: u32,
    nodes: Vec<TgtNode>,
}

impl TagTree {
    pub fn new(numleafsh: u32, numleafsv: u32) -> Self {
        let mut tree = TagTree {
            numleafsh,
            numleafsv,
            nodes: Vec::new(),
        };
        tree.build();
        tree
    }

    /// Rebuilds the node pyramid for (possibly changed) leaf dimensions,
    /// reusing the allocation when the new tree is no larger (mirrors
    /// `opj_tgt_init`'s reinit-in-place behaviour).
    pub fn reinit(&mut self, numleafsh: u32, numleafsv: u32) {
        if self.numleafsh == numleafsh && self.numleafsv == numleafsv {
            self.reset();
            return;
        }
        self.numleafsh = numleafsh;
        self.numleafsv = numleafsv;
        self.build();
    }

    fn build(&mut self) {
        let mut nplh = vec![self.numleafsh as i64];
        let mut nplv = vec![self.numleafsv as i64];
        let mut numnodes: u32 = 0;
        loop {
            let h = *nplh.last().unwrap();
            let v = *nplv.last().unwrap();
            let n = (h * v) as u32;
            numnodes += n;
            nplh.push((h + 1) / 2);
            nplv.push((v + 1) / 2);
            if n <= 1 {
                break;
            }
        }
        let numlvls = nplh.len() - 1;
        self.nodes = vec![TgtNode::default(); numnodes.max(1) as usize];
        if numnodes == 0 {
            return;
        }

        let mut node_idx: usize = 0;
        let leaf_count = (self.numleafsh * self.numleafsv) as usize;
        let mut parent_idx = leaf_count;
        let mut parent_idx0 = leaf_count;

        for i in 0..numlvls.saturating_sub(1) {
            for j in 0..nplv[i] {
                let mut k = nplh[i];
                while k > 0 {
                    k -= 1;
                    self.nodes[node_idx].parent = Some(parent_idx);
                    node_idx += 1;
                    if k > 0 {
                        k -= 1;
                        self.nodes[node_idx].parent = Some(parent_idx);
                        node_idx += 1;
                    }
                    parent_idx += 1;
                }
                if j & 1 != 0 || j == nplv[i] - 1 {
                    parent_idx0 = parent_idx;
                } else {
                    parent_idx = parent_idx0;
                    parent_idx0 += nplh[i] as usize;
                }
            }
        }
        // `node_idx` now sits at the root, whose `parent` stays `None`.
        self.reset();
    }

    pub fn reset(&mut self) {
        for node in self.nodes.iter_mut() {
            node.value = i32::MAX;
            node.low = 0;
            node.known = false;
        }
    }

    /// Sets a leaf's value, propagating the minimum up to every ancestor
    /// (used while building a packet's inclusion/zero-bit-plane data
    /// before encoding it).
    pub fn set_value(&mut self, leafno: u32, value: i32) {
        let mut idx = Some(leafno as usize);
        while let Some(i) = idx {
            if self.nodes[i].value <= value {
                break;
            }
            self.nodes[i].value = value;
            idx = self.nodes[i].parent;
        }
    }

    fn ancestor_chain(&self, leafno: u32) -> Vec<usize> {
        let mut chain = vec![leafno as usize];
        let mut idx = self.nodes[leafno as usize].parent;
        while let Some(i) = idx {
            chain.push(i);
            idx = self.nodes[i].parent;
        }
        chain
    }

    /// Encodes, via `emit_bit`, whether `leafno`'s value is known to be
    /// `< threshold` yet, walking from the root down to the leaf.
    pub fn encode(&mut self, leafno: u32, threshold: i32, mut emit_bit: impl FnMut(u8)) {
        let chain = self.ancestor_chain(leafno);
        for &idx in chain.iter().rev() {
            let mut low = self.nodes[idx].low;
            while low < threshold {
                if low >= self.nodes[idx].value {
                    if !self.nodes[idx].known {
                        emit_bit(1);
                        self.nodes[idx].known = true;
                    }
                    break;
                } else {
                    emit_bit(0);
                    low += 1;
                }
            }
            self.nodes[idx].low = low;
        }
    }

    /// Decodes, via `next_bit`, whether `leafno`'s value is `< threshold`.
    /// Returns `true` once the leaf's value has been established to be
    /// strictly below `threshold`.
    pub fn decode(&mut self, leafno: u32, threshold: i32, mut next_bit: impl FnMut() -> u8) -> bool {
        let chain = self.ancestor_chain(leafno);
        let mut leaf_value = self.nodes[leafno as usize].value;
        for &idx in chain.iter().rev() {
            let mut low = self.nodes[idx].low;
            while low < threshold && low < self.nodes[idx].value {
                if next_bit() != 0 {
                    self.nodes[idx].value = low;
                } else {
                    low += 1;
                }
            }
            self.nodes[idx].low = low;
            leaf_value = self.nodes[idx].value;
        }
        leaf_value < threshold
    }

    pub fn numleafsh(&self) -> u32 {
        self.numleafsh
    }

    pub fn numleafsv(&self) -> u32 {
        self.numleafsv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_leaf_tree_has_one_node() {
        let tree = TagTree::new(1, 1);
        assert_eq!(tree.nodes.len(), 1);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let w = 5u32;
        let h = 3u32;
        let mut enc_tree = TagTree::new(w, h);
        // Leaf (2,1) becomes included at threshold 3, everything else
        // later (threshold 7), matching a plausible packet-inclusion map.
        let target_leaf = 1 * w + 2;
        for leaf in 0..(w * h) {
            let v = if leaf == target_leaf { 3 } else { 7 };
            enc_tree.set_value(leaf, v);
        }

        let mut bits = Vec::new();
        enc_tree.encode(target_leaf, 10, |b| bits.push(b));

        let mut dec_tree = TagTree::new(w, h);
        let mut it = bits.into_iter();
        let included = dec_tree.decode(target_leaf, 10, || it.next().unwrap_or(0));
        assert!(included);
    }

    #[test]
    fn reinit_same_dims_resets_values() {
        let mut tree = TagTree::new(4, 4);
        tree.set_value(0, 2);
        tree.reinit(4, 4);
        assert_eq!(tree.nodes[0].value, i32::MAX);
    }
}
