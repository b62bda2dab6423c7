//! Red-black tree stored in an arena.
//!
//! Nodes live in a `Vec` and refer to each other by index, so parent back-links do not need
//! shared ownership. Removing a node swaps the last arena slot into the hole and re-points
//! its neighbours, keeping the arena dense.
//!
//! Callers only see keys and values; node indices never leave this module.

pub mod codec;

use std::{cmp::Ordering, mem};

pub(crate) type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Black,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone)]
struct Node<K, V> {
    key: K,
    value: V,
    color: Color,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
}

/// Ordered map balanced with red-black rules.
#[derive(Debug, Clone)]
pub struct RedBlackTree<K, V> {
    nodes: Vec<Node<K, V>>,
    root: Option<NodeId>,
}

/// One node as seen from a pre-order walk.
#[derive(Debug, PartialEq)]
pub struct NodeView<'a, K, V> {
    pub key: &'a K,
    pub value: &'a V,
    pub color: Color,
    pub has_left: bool,
    pub has_right: bool,
}

impl<K, V> Default for RedBlackTree<K, V> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
        }
    }
}

impl<K, V> RedBlackTree<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Entries from smallest to largest key.
    pub fn in_order_ascending(&self) -> Vec<(&K, &V)> {
        self.in_order_ids()
            .into_iter()
            .map(|id| (&self.nodes[id].key, &self.nodes[id].value))
            .collect()
    }

    /// Entries from largest to smallest key.
    pub fn in_order_descending(&self) -> Vec<(&K, &V)> {
        let mut entries = self.in_order_ascending();
        entries.reverse();
        entries
    }

    /// Node, left subtree, right subtree: the order the wire codec writes.
    pub fn pre_order(&self) -> Vec<NodeView<'_, K, V>> {
        let mut views = Vec::with_capacity(self.len());
        let mut stack: Vec<NodeId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            views.push(NodeView {
                key: &node.key,
                value: &node.value,
                color: node.color,
                has_left: node.left.is_some(),
                has_right: node.right.is_some(),
            });
            stack.extend(node.right);
            stack.extend(node.left);
        }
        views
    }

    /// Links a node under `parent` exactly as given, without comparing or rebalancing.
    /// Used when rebuilding a tree whose shape and colors were persisted.
    pub(crate) fn attach(
        &mut self,
        parent: Option<(NodeId, Side)>,
        key: K,
        value: V,
        color: Color,
    ) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            key,
            value,
            color,
            parent: parent.map(|(p, _)| p),
            left: None,
            right: None,
        });
        match parent {
            None => self.root = Some(id),
            Some((p, Side::Left)) => self.nodes[p].left = Some(id),
            Some((p, Side::Right)) => self.nodes[p].right = Some(id),
        }
        id
    }

    fn in_order_ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::with_capacity(self.len());
        let mut stack = Vec::new();
        let mut current = self.root;
        while current.is_some() || !stack.is_empty() {
            while let Some(id) = current {
                stack.push(id);
                current = self.nodes[id].left;
            }
            if let Some(id) = stack.pop() {
                ids.push(id);
                current = self.nodes[id].right;
            }
        }
        ids
    }

    fn is_red(&self, id: Option<NodeId>) -> bool {
        id.is_some_and(|id| self.nodes[id].color == Color::Red)
    }

    fn rightmost(&self, mut id: NodeId) -> NodeId {
        while let Some(right) = self.nodes[id].right {
            id = right;
        }
        id
    }

    fn sibling(&self, parent: NodeId, of_left: bool) -> NodeId {
        let sibling = if of_left {
            self.nodes[parent].right
        } else {
            self.nodes[parent].left
        };
        sibling.expect("red-black invariant violated: double-black node has no sibling")
    }

    /// Points `parent`'s link to `old` at `new` instead (or the root when `parent` is `None`).
    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: Option<NodeId>) {
        match parent {
            None => self.root = new,
            Some(p) if self.nodes[p].left == Some(old) => self.nodes[p].left = new,
            Some(p) if self.nodes[p].right == Some(old) => self.nodes[p].right = new,
            Some(p) => panic!("red-black tree corrupted: node {old} is not a child of {p}"),
        }
    }

    fn rotate_left(&mut self, x: NodeId) {
        let y = self.nodes[x]
            .right
            .expect("rotate_left requires a right child");
        let y_left = self.nodes[y].left;

        self.nodes[x].right = y_left;
        if let Some(b) = y_left {
            self.nodes[b].parent = Some(x);
        }

        let parent = self.nodes[x].parent;
        self.nodes[y].parent = parent;
        self.replace_child(parent, x, Some(y));

        self.nodes[y].left = Some(x);
        self.nodes[x].parent = Some(y);
    }

    fn rotate_right(&mut self, x: NodeId) {
        let y = self.nodes[x]
            .left
            .expect("rotate_right requires a left child");
        let y_right = self.nodes[y].right;

        self.nodes[x].left = y_right;
        if let Some(b) = y_right {
            self.nodes[b].parent = Some(x);
        }

        let parent = self.nodes[x].parent;
        self.nodes[y].parent = parent;
        self.replace_child(parent, x, Some(y));

        self.nodes[y].right = Some(x);
        self.nodes[x].parent = Some(y);
    }

    fn swap_entries(&mut self, a: NodeId, b: NodeId) {
        if a == b {
            return;
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let (head, tail) = self.nodes.split_at_mut(high);
        let (x, y) = (&mut head[low], &mut tail[0]);
        mem::swap(&mut x.key, &mut y.key);
        mem::swap(&mut x.value, &mut y.value);
    }

    /// Removes a node that nothing links to any more from the arena.
    fn release(&mut self, id: NodeId) -> Node<K, V> {
        let last = self.nodes.len() - 1;
        if id != last {
            let moved = &self.nodes[last];
            let (parent, left, right) = (moved.parent, moved.left, moved.right);
            match parent {
                None => self.root = Some(id),
                Some(p) if self.nodes[p].left == Some(last) => self.nodes[p].left = Some(id),
                Some(p) => self.nodes[p].right = Some(id),
            }
            for child in [left, right].into_iter().flatten() {
                self.nodes[child].parent = Some(id);
            }
        }
        self.nodes.swap_remove(id)
    }

    fn fix_after_insert(&mut self, mut z: NodeId) {
        while let Some(p) = self.nodes[z].parent {
            if self.nodes[p].color == Color::Black {
                break;
            }
            let g = self.nodes[p]
                .parent
                .expect("red-black invariant violated: red node is the root");

            if self.nodes[g].left == Some(p) {
                let uncle = self.nodes[g].right;
                if self.is_red(uncle) {
                    // Red uncle: push blackness down from the grandparent.
                    self.nodes[p].color = Color::Black;
                    self.nodes[uncle.expect("red uncle exists")].color = Color::Black;
                    self.nodes[g].color = Color::Red;
                    z = g;
                } else {
                    if self.nodes[p].right == Some(z) {
                        // Triangle: straighten into a line first.
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.nodes[z].parent.expect("rotated node has a parent");
                    self.nodes[p].color = Color::Black;
                    self.nodes[g].color = Color::Red;
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.nodes[g].left;
                if self.is_red(uncle) {
                    self.nodes[p].color = Color::Black;
                    self.nodes[uncle.expect("red uncle exists")].color = Color::Black;
                    self.nodes[g].color = Color::Red;
                    z = g;
                } else {
                    if self.nodes[p].left == Some(z) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.nodes[z].parent.expect("rotated node has a parent");
                    self.nodes[p].color = Color::Black;
                    self.nodes[g].color = Color::Red;
                    self.rotate_left(g);
                }
            }
        }
        if let Some(root) = self.root {
            self.nodes[root].color = Color::Black;
        }
    }

    /// Restores black heights before the black leaf `x` is unlinked. `x` stays in place
    /// during the fix and stands in for the missing subtree.
    fn fix_double_black(&mut self, mut x: NodeId) {
        while Some(x) != self.root && self.nodes[x].color == Color::Black {
            let parent = self.nodes[x]
                .parent
                .expect("red-black invariant violated: non-root node without parent");
            let x_is_left = self.nodes[parent].left == Some(x);
            let mut sibling = self.sibling(parent, x_is_left);

            if self.nodes[sibling].color == Color::Red {
                self.nodes[sibling].color = Color::Black;
                self.nodes[parent].color = Color::Red;
                if x_is_left {
                    self.rotate_left(parent);
                } else {
                    self.rotate_right(parent);
                }
                sibling = self.sibling(parent, x_is_left);
            }

            let (near, far) = if x_is_left {
                (self.nodes[sibling].left, self.nodes[sibling].right)
            } else {
                (self.nodes[sibling].right, self.nodes[sibling].left)
            };

            if !self.is_red(near) && !self.is_red(far) {
                self.nodes[sibling].color = Color::Red;
                x = parent;
                continue;
            }

            if !self.is_red(far) {
                let near = near.expect("red near nephew exists");
                self.nodes[near].color = Color::Black;
                self.nodes[sibling].color = Color::Red;
                if x_is_left {
                    self.rotate_right(sibling);
                } else {
                    self.rotate_left(sibling);
                }
                sibling = self.sibling(parent, x_is_left);
            }

            let far = if x_is_left {
                self.nodes[sibling].right
            } else {
                self.nodes[sibling].left
            }
            .expect("red far nephew exists");
            self.nodes[sibling].color = self.nodes[parent].color;
            self.nodes[parent].color = Color::Black;
            self.nodes[far].color = Color::Black;
            if x_is_left {
                self.rotate_left(parent);
            } else {
                self.rotate_right(parent);
            }
            break;
        }
        self.nodes[x].color = Color::Black;
    }
}

impl<K: Ord, V> RedBlackTree<K, V> {
    pub fn get(&self, key: &K) -> Option<&V> {
        self.find(key).map(|id| &self.nodes[id].value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.find(key).map(|id| &mut self.nodes[id].value)
    }

    /// The stored key and value equal to `key`.
    pub fn get_key_value(&self, key: &K) -> Option<(&K, &V)> {
        self.find(key).map(|id| (&self.nodes[id].key, &self.nodes[id].value))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Inserts `key` with `value` unless the key is present. Either way the stored value is
    /// returned so the caller can mutate it; on a hit `value` is dropped and the tree
    /// shape does not change.
    pub fn insert_or_get_existing(&mut self, key: K, value: V) -> &mut V {
        let mut parent = None;
        let mut current = self.root;
        while let Some(id) = current {
            let side = match key.cmp(&self.nodes[id].key) {
                Ordering::Less => Side::Left,
                Ordering::Greater => Side::Right,
                Ordering::Equal => break,
            };
            parent = Some((id, side));
            current = match side {
                Side::Left => self.nodes[id].left,
                Side::Right => self.nodes[id].right,
            };
        }
        if let Some(existing) = current {
            return &mut self.nodes[existing].value;
        }

        let id = self.attach(parent, key, value, Color::Red);
        self.fix_after_insert(id);
        &mut self.nodes[id].value
    }

    /// Removes `key` and hands back its entry.
    pub fn remove(&mut self, key: &K) -> Option<(K, V)> {
        let mut target = self.find(key)?;

        // Two children: trade places with the in-order predecessor, which has at most one.
        if let (Some(left), Some(_)) = (self.nodes[target].left, self.nodes[target].right) {
            let predecessor = self.rightmost(left);
            self.swap_entries(target, predecessor);
            target = predecessor;
        }

        let child = self.nodes[target].left.or(self.nodes[target].right);
        match child {
            Some(child) => {
                // A node with a single child is black and the child red.
                let parent = self.nodes[target].parent;
                self.replace_child(parent, target, Some(child));
                self.nodes[child].parent = parent;
                self.nodes[child].color = Color::Black;
            }
            None => {
                if self.nodes[target].color == Color::Black {
                    self.fix_double_black(target);
                }
                let parent = self.nodes[target].parent;
                self.replace_child(parent, target, None);
            }
        }

        let node = self.release(target);
        Some((node.key, node.value))
    }

    fn find(&self, key: &K) -> Option<NodeId> {
        let mut current = self.root;
        while let Some(id) = current {
            current = match key.cmp(&self.nodes[id].key) {
                Ordering::Less => self.nodes[id].left,
                Ordering::Greater => self.nodes[id].right,
                Ordering::Equal => return Some(id),
            };
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::BTreeMap;

    /// Panics unless every red-black and link invariant holds.
    pub(crate) fn assert_invariants<K: Ord + std::fmt::Debug, V>(tree: &RedBlackTree<K, V>) {
        let Some(root) = tree.root else {
            assert!(tree.nodes.is_empty());
            return;
        };
        assert_eq!(tree.nodes[root].color, Color::Black, "root must be black");
        assert_eq!(tree.nodes[root].parent, None);

        fn black_height<K: Ord + std::fmt::Debug, V>(
            tree: &RedBlackTree<K, V>,
            id: Option<NodeId>,
            seen: &mut usize,
        ) -> usize {
            let Some(id) = id else { return 1 };
            *seen += 1;
            let node = &tree.nodes[id];
            for child in [node.left, node.right].into_iter().flatten() {
                assert_eq!(tree.nodes[child].parent, Some(id), "broken parent link");
                if node.color == Color::Red {
                    assert_eq!(tree.nodes[child].color, Color::Black, "red node with red child");
                }
            }
            if let Some(left) = node.left {
                assert!(tree.nodes[left].key < node.key);
            }
            if let Some(right) = node.right {
                assert!(tree.nodes[right].key > node.key);
            }
            let left = black_height(tree, node.left, seen);
            let right = black_height(tree, node.right, seen);
            assert_eq!(left, right, "unequal black height under {:?}", node.key);
            left + usize::from(node.color == Color::Black)
        }

        let mut seen = 0;
        black_height(tree, Some(root), &mut seen);
        assert_eq!(seen, tree.len(), "unreachable nodes in arena");

        let keys: Vec<_> = tree.in_order_ascending().into_iter().map(|(k, _)| k).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn empty_tree() {
        let mut tree: RedBlackTree<i32, &str> = RedBlackTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.get(&1), None);
        assert_eq!(tree.remove(&1), None);
        assert!(tree.in_order_ascending().is_empty());
        assert_invariants(&tree);
    }

    #[test]
    fn sequential_inserts_stay_balanced() {
        let mut tree = RedBlackTree::new();
        for i in 0..1024 {
            tree.insert_or_get_existing(i, i * 10);
            assert_invariants(&tree);
        }
        assert_eq!(tree.len(), 1024);
        assert_eq!(tree.get(&512), Some(&5120));

        fn height<K, V>(tree: &RedBlackTree<K, V>, id: Option<NodeId>) -> usize {
            id.map_or(0, |id| {
                1 + height(tree, tree.nodes[id].left).max(height(tree, tree.nodes[id].right))
            })
        }
        // 2 * log2(n + 1)
        assert!(height(&tree, tree.root) <= 20);
    }

    #[test]
    fn insert_existing_returns_stored_value() {
        let mut tree = RedBlackTree::new();
        tree.insert_or_get_existing("Lime", vec![1]);
        let shape_before: Vec<_> = tree.pre_order().iter().map(|v| (*v.key, v.color)).collect();

        let existing = tree.insert_or_get_existing("Lime", vec![99]);
        existing.push(2);

        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(&"Lime"), Some(&vec![1, 2]));
        let shape_after: Vec<_> = tree.pre_order().iter().map(|v| (*v.key, v.color)).collect();
        assert_eq!(shape_before, shape_after);
    }

    #[test]
    fn remove_keeps_invariants() {
        let mut tree = RedBlackTree::new();
        for key in [50, 30, 70, 20, 40, 60, 80, 10, 45, 65] {
            tree.insert_or_get_existing(key, key.to_string());
        }
        assert_invariants(&tree);

        assert_eq!(tree.remove(&10), Some((10, "10".to_string())));
        assert_invariants(&tree);
        assert_eq!(tree.remove(&30), Some((30, "30".to_string())));
        assert_invariants(&tree);
        assert_eq!(tree.remove(&50), Some((50, "50".to_string())));
        assert_invariants(&tree);
        assert_eq!(tree.remove(&50), None);

        let keys: Vec<_> = tree.in_order_ascending().into_iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![20, 40, 45, 60, 65, 70, 80]);

        for key in keys {
            assert!(tree.remove(&key).is_some());
            assert_invariants(&tree);
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn descending_is_reverse_of_ascending() {
        let mut tree = RedBlackTree::new();
        for key in ["Orange", "Apple", "Lime", "Strawberry"] {
            tree.insert_or_get_existing(key, ());
        }
        let descending: Vec<_> = tree.in_order_descending().into_iter().map(|(k, _)| *k).collect();
        assert_eq!(descending, vec!["Strawberry", "Orange", "Lime", "Apple"]);
    }

    #[test]
    fn get_mut_updates_in_place() {
        let mut tree = RedBlackTree::new();
        tree.insert_or_get_existing(1, 1);
        *tree.get_mut(&1).unwrap() += 41;
        assert_eq!(tree.get(&1), Some(&42));
        assert!(tree.get_mut(&2).is_none());
    }

    #[test]
    fn random_operations_match_btree_map() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut tree = RedBlackTree::new();
        let mut model = BTreeMap::new();

        for step in 0..4000 {
            let key: u16 = rng.gen_range(0..300);
            if rng.gen_bool(0.55) {
                tree.insert_or_get_existing(key, step);
                model.entry(key).or_insert(step);
            } else {
                assert_eq!(tree.remove(&key), model.remove(&key).map(|v| (key, v)));
            }
            if step % 16 == 0 {
                assert_invariants(&tree);
            }
        }

        assert_invariants(&tree);
        let entries: Vec<_> = tree
            .in_order_ascending()
            .into_iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        let expected: Vec<_> = model.into_iter().collect();
        assert_eq!(entries, expected);
    }
}
