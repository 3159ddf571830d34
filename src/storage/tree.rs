//! Profile trees
//!
//! A profile is a sparse trie of stack frames. Every node carries a "self"
//! sample count: the number of samples whose stack ended exactly there.
//! Children are kept in a `BTreeMap`, so sibling order is always the sort
//! order of the frame label and never depends on insertion order. That is
//! what makes the collapsed text form canonical:
//!
//! ```text
//! a;b 1
//! a;c 2
//! ```
//!
//! The tree is generic over the frame label. Ingested and rendered trees
//! use `String` labels ([`Tree`]); stored chunks use dictionary ids
//! ([`ChunkTree`]), see [`StackTree::relabel`].

use crate::storage::cache::Persist;
use crate::storage::codec::Kind;
use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Deepest stack a tree accepts
///
/// Tree walks recurse once per frame, so this bounds their stack use.
pub const MAX_STACK_DEPTH: usize = 256;

/// A tree keyed by frame names
pub type Tree = StackTree<String>;

/// A tree keyed by dictionary ids, as stored in chunks
pub type ChunkTree = StackTree<u32>;

/// A single frame in a stack tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node<K: Ord> {
    self_count: u64,
    children: BTreeMap<K, Node<K>>,
}

impl<K: Ord> Default for Node<K> {
    fn default() -> Self {
        Self {
            self_count: 0,
            children: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> Node<K> {
    /// Samples ending at this frame
    pub fn self_count(&self) -> u64 {
        self.self_count
    }

    /// Samples passing through this frame
    pub fn total(&self) -> u64 {
        self.self_count + self.children.values().map(Node::total).sum::<u64>()
    }

    /// Child frames in label order
    pub fn children(&self) -> impl Iterator<Item = (&K, &Node<K>)> {
        self.children.iter()
    }

    fn node_count(&self) -> usize {
        1 + self.children.values().map(Node::node_count).sum::<usize>()
    }

    fn merge(&mut self, other: &Node<K>) {
        self.self_count += other.self_count;
        for (label, theirs) in &other.children {
            match self.children.get_mut(label) {
                Some(ours) => ours.merge(theirs),
                None => {
                    self.children.insert(label.clone(), theirs.clone());
                }
            }
        }
    }

    /// Drop subtrees without any samples
    fn prune(&mut self) {
        self.children.retain(|_, child| {
            child.prune();
            child.self_count > 0 || !child.children.is_empty()
        });
    }

    fn split_into(&self, weights: &[u64], total_weight: u64, parts: &mut [&mut Node<K>]) {
        let shares = apportion(self.self_count, weights, total_weight);
        for (part, share) in parts.iter_mut().zip(shares) {
            part.self_count += share;
        }

        for (label, child) in &self.children {
            let mut next: Vec<&mut Node<K>> = parts
                .iter_mut()
                .map(|part| part.children.entry(label.clone()).or_default())
                .collect();
            child.split_into(weights, total_weight, &mut next);
        }
    }

    fn relabel_into<K2, E, F>(&self, target: &mut Node<K2>, f: &mut F) -> Result<(), E>
    where
        K2: Ord + Clone,
        F: FnMut(&K) -> Result<K2, E>,
    {
        target.self_count += self.self_count;
        for (label, child) in &self.children {
            let mapped = f(label)?;
            let slot = target.children.entry(mapped).or_default();
            child.relabel_into(slot, f)?;
        }
        Ok(())
    }

    fn walk<'a, F>(&'a self, path: &mut Vec<&'a K>, visit: &mut F)
    where
        F: FnMut(&[&'a K], u64),
    {
        if self.self_count > 0 && !path.is_empty() {
            visit(path.as_slice(), self.self_count);
        }
        for (label, child) in &self.children {
            path.push(label);
            child.walk(path, visit);
            path.pop();
        }
    }
}

/// A sampled call-stack tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTree<K: Ord> {
    root: Node<K>,
}

impl<K: Ord> Default for StackTree<K> {
    fn default() -> Self {
        Self {
            root: Node::default(),
        }
    }
}

impl<K: Ord + Clone> StackTree<K> {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Root node (holds no frame of its own)
    pub fn root(&self) -> &Node<K> {
        &self.root
    }

    /// Add `count` samples for a stack, root frame first
    ///
    /// An empty path is ignored: samples always end at some frame. Stacks
    /// deeper than [`MAX_STACK_DEPTH`] are rejected and leave the tree
    /// unchanged.
    pub fn insert<I>(&mut self, path: I, count: u64) -> StorageResult<()>
    where
        I: IntoIterator<Item = K>,
    {
        let path: Vec<K> = path.into_iter().take(MAX_STACK_DEPTH + 1).collect();
        if path.len() > MAX_STACK_DEPTH {
            return Err(StorageError::Serialization(format!(
                "stack deeper than {} frames",
                MAX_STACK_DEPTH
            )));
        }
        if path.is_empty() {
            return Ok(());
        }

        let mut node = &mut self.root;
        for frame in path {
            node = node.children.entry(frame).or_default();
        }
        node.self_count += count;
        Ok(())
    }

    /// Merge another tree into this one, summing counts of matching frames
    pub fn merge(&mut self, other: &StackTree<K>) {
        self.root.merge(&other.root);
    }

    /// Total number of samples
    pub fn total(&self) -> u64 {
        self.root.total()
    }

    /// True when the tree holds no samples
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Number of frames (root excluded)
    pub fn node_count(&self) -> usize {
        self.root.node_count() - 1
    }

    /// Split the samples of this tree over weighted parts
    ///
    /// Every node's count is apportioned proportionally to `weights`; the
    /// rounding remainder goes to the parts with the largest fractional
    /// share (earlier parts win ties). Merging all parts yields exactly
    /// the original tree.
    pub fn split(&self, weights: &[u64]) -> Vec<StackTree<K>> {
        if weights.is_empty() {
            return Vec::new();
        }

        let total_weight: u64 = weights.iter().sum();
        let mut parts: Vec<StackTree<K>> = (0..weights.len()).map(|_| StackTree::new()).collect();
        {
            let mut roots: Vec<&mut Node<K>> = parts.iter_mut().map(|p| &mut p.root).collect();
            self.root.split_into(weights, total_weight, &mut roots);
        }
        for part in &mut parts {
            part.root.prune();
        }
        parts
    }

    /// Map every frame label through `f`
    ///
    /// Frames that map to the same label are merged.
    pub fn relabel<K2, E, F>(&self, mut f: F) -> Result<StackTree<K2>, E>
    where
        K2: Ord + Clone,
        F: FnMut(&K) -> Result<K2, E>,
    {
        let mut out = StackTree::new();
        self.root.relabel_into(&mut out.root, &mut f)?;
        Ok(out)
    }

    /// Visit every stack with a non-zero self count, depth-first in label order
    pub fn for_each_stack<'a, F>(&'a self, mut visit: F)
    where
        F: FnMut(&[&'a K], u64),
    {
        let mut path = Vec::new();
        self.root.walk(&mut path, &mut visit);
    }
}

impl Tree {
    /// Add samples for a `;`-separated stack such as `main;run;work`
    pub fn insert_stack(&mut self, stack: &str, count: u64) -> StorageResult<()> {
        self.insert(
            stack
                .split(';')
                .filter(|frame| !frame.is_empty())
                .map(str::to_string),
            count,
        )
    }

    /// Parse collapsed ("folded") stacks, one `stack count` per line
    pub fn from_collapsed(text: &str) -> StorageResult<Self> {
        let mut tree = Tree::new();

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (stack, count) = line.rsplit_once(char::is_whitespace).ok_or_else(|| {
                StorageError::Serialization(format!(
                    "line {}: expected '<stack> <count>'",
                    line_no + 1
                ))
            })?;

            let count: u64 = count.parse().map_err(|_| {
                StorageError::Serialization(format!(
                    "line {}: invalid sample count '{}'",
                    line_no + 1,
                    count
                ))
            })?;

            tree.insert_stack(stack.trim_end(), count)
                .map_err(|e| match e {
                    StorageError::Serialization(msg) => {
                        StorageError::Serialization(format!("line {}: {}", line_no + 1, msg))
                    }
                    other => other,
                })?;
        }

        Ok(tree)
    }
}

impl<K: Ord + Clone + fmt::Display> fmt::Display for StackTree<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut result = Ok(());
        self.for_each_stack(|path, count| {
            if result.is_err() {
                return;
            }
            result = (|| {
                for (i, frame) in path.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    write!(f, "{}", frame)?;
                }
                writeln!(f, " {}", count)
            })();
        });
        result
    }
}

impl Persist for ChunkTree {
    const KIND: Kind = Kind::Tree;

    fn size_hint(&self) -> usize {
        // BTreeMap slot + node header per frame
        (self.node_count() + 1) * 64
    }
}

/// Divide `count` proportionally to `weights`, summing exactly to `count`
fn apportion(count: u64, weights: &[u64], total_weight: u64) -> Vec<u64> {
    if count == 0 {
        return vec![0; weights.len()];
    }
    if total_weight == 0 {
        // Degenerate weights: spread evenly
        return apportion(count, &vec![1; weights.len()], weights.len() as u64);
    }

    let mut shares = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    for (i, &w) in weights.iter().enumerate() {
        let scaled = count as u128 * w as u128;
        shares.push((scaled / total_weight as u128) as u64);
        remainders.push((scaled % total_weight as u128, i));
    }

    let assigned: u64 = shares.iter().sum();
    let leftover = (count - assigned) as usize;
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for &(_, i) in remainders.iter().take(leftover) {
        shares[i] += 1;
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(stacks: &[(&str, u64)]) -> Tree {
        let mut t = Tree::new();
        for (stack, count) in stacks {
            t.insert_stack(stack, *count).unwrap();
        }
        t
    }

    #[test]
    fn test_canonical_string() {
        let t = tree(&[("a;c", 2), ("a;b", 1)]);
        assert_eq!(t.to_string(), "a;b 1\na;c 2\n");
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let a = tree(&[("x;y", 1), ("a;b", 2), ("a", 3)]);
        let b = tree(&[("a", 3), ("a;b", 2), ("x;y", 1)]);
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a, b);
    }

    #[test]
    fn test_self_and_total_counts() {
        let t = tree(&[("a", 3), ("a;b", 2), ("a;b;c", 1)]);
        assert_eq!(t.total(), 6);
        let (_, a) = t.root().children().next().unwrap();
        assert_eq!(a.self_count(), 3);
        assert_eq!(a.total(), 6);
        assert_eq!(t.node_count(), 3);
    }

    #[test]
    fn test_merge_sums_counts() {
        let mut a = tree(&[("a;b", 1), ("a;c", 2)]);
        let b = tree(&[("a;b", 4), ("d", 1)]);
        a.merge(&b);
        assert_eq!(a.to_string(), "a;b 5\na;c 2\nd 1\n");
    }

    #[test]
    fn test_merge_commutative_and_associative() {
        let a = tree(&[("a;b", 1), ("a;c", 2)]);
        let b = tree(&[("a;b", 4), ("d;e;f", 1)]);
        let c = tree(&[("d", 7), ("a", 1)]);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab.to_string(), ba.to_string());

        let mut ab_c = ab.clone();
        ab_c.merge(&c);
        let mut bc = b.clone();
        bc.merge(&c);
        let mut a_bc = a.clone();
        a_bc.merge(&bc);
        assert_eq!(ab_c.to_string(), a_bc.to_string());
    }

    #[test]
    fn test_merge_never_decreases() {
        let mut a = tree(&[("a;b", 3)]);
        a.merge(&Tree::new());
        assert_eq!(a.to_string(), "a;b 3\n");
    }

    #[test]
    fn test_empty_path_is_ignored() {
        let mut t = Tree::new();
        t.insert_stack("", 5).unwrap();
        assert!(t.is_empty());
        assert_eq!(t.to_string(), "");
    }

    #[test]
    fn test_from_collapsed() {
        let t = Tree::from_collapsed("a;b 1\n\n  a;c 2\nfoo bar;baz 4\n").unwrap();
        assert_eq!(t.to_string(), "a;b 1\na;c 2\nfoo bar;baz 4\n");
    }

    #[test]
    fn test_from_collapsed_rejects_bad_count() {
        let err = Tree::from_collapsed("a;b x\n").unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));

        let err = Tree::from_collapsed("lonely\n").unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }

    #[test]
    fn test_stack_depth_limit() {
        let deepest = vec!["f"; MAX_STACK_DEPTH].join(";");
        let mut t = Tree::new();
        t.insert_stack(&deepest, 1).unwrap();
        assert_eq!(t.node_count(), MAX_STACK_DEPTH);

        let too_deep = format!("{};g", deepest);
        let err = t.insert_stack(&too_deep, 1).unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
        assert_eq!(t.total(), 1);
        assert_eq!(t.node_count(), MAX_STACK_DEPTH);

        let err = Tree::from_collapsed(&format!("a 1\n{} 2\n", too_deep)).unwrap_err();
        match err {
            StorageError::Serialization(msg) => assert!(msg.starts_with("line 2:"), "{}", msg),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_split_preserves_totals() {
        let t = tree(&[("a;b", 7), ("a;c", 3), ("d", 1)]);
        let parts = t.split(&[5, 3, 2]);
        assert_eq!(parts.len(), 3);

        let mut merged = Tree::new();
        for part in &parts {
            merged.merge(part);
        }
        assert_eq!(merged.to_string(), t.to_string());
    }

    #[test]
    fn test_split_single_part_is_identity() {
        let t = tree(&[("a;b", 2), ("a;c", 4)]);
        let parts = t.split(&[9]);
        assert_eq!(parts, vec![t]);
    }

    #[test]
    fn test_split_prunes_empty_subtrees() {
        let t = tree(&[("a;b", 1)]);
        let parts = t.split(&[1, 1]);
        assert_eq!(parts[0].to_string(), "a;b 1\n");
        assert!(parts[1].is_empty());
        assert_eq!(parts[1].node_count(), 0);
    }

    #[test]
    fn test_apportion() {
        assert_eq!(apportion(10, &[1, 1], 2), vec![5, 5]);
        assert_eq!(apportion(1, &[1, 1], 2), vec![1, 0]);
        assert_eq!(apportion(2, &[10, 9], 19), vec![1, 1]);
        assert_eq!(apportion(7, &[1, 2, 4], 7), vec![1, 2, 4]);
        assert_eq!(apportion(3, &[0, 0], 0), vec![2, 1]);
    }

    #[test]
    fn test_relabel_roundtrip() {
        let t = tree(&[("a;b", 1), ("a;c", 2)]);
        let ids: ChunkTree = t
            .relabel(|s| Ok::<_, ()>(s.as_bytes()[0] as u32))
            .unwrap();
        assert_eq!(ids.total(), 3);
        let back: Tree = ids
            .relabel(|id| Ok::<_, ()>(char::from(*id as u8).to_string()))
            .unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_relabel_merges_collisions() {
        let t = tree(&[("a", 1), ("b", 2)]);
        let merged: ChunkTree = t.relabel(|_| Ok::<_, ()>(0)).unwrap();
        assert_eq!(merged.to_string(), "0 3\n");
    }
}
