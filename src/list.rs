//! Arena-backed doubly linked lists
//!
//! [`IndexList`] stores the nodes of any number of lists in one [`Slab`];
//! each list is a small [`ListHead`] owned by the caller (a wheel slot, for
//! instance). Links are slab indices instead of pointers, so a node can be
//! unlinked in O(1) from its key alone and no `unsafe` is involved.
//!
//! Every insertion stamps the node with a fresh generation. A [`NodeKey`]
//! therefore names one particular insertion: once the node is unlinked and its
//! slab slot reused, the old key no longer matches and every operation on it
//! reports the node as gone. The timing wheel relies on this to drop fires that
//! race with a cancel.
//!
//! A node must always be unlinked through the head of the list it was pushed
//! onto; callers record which head that is.

use slab::Slab;

/// Identity of one inserted node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeKey {
    index: usize,
    generation: u64,
}

/// Head of one list living in an [`IndexList`] arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListHead {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl ListHead {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
    generation: u64,
}

/// Node arena shared by many lists.
#[derive(Debug)]
pub struct IndexList<T> {
    nodes: Slab<Node<T>>,
    next_generation: u64,
}

impl<T> Default for IndexList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IndexList<T> {
    pub fn new() -> Self {
        Self {
            nodes: Slab::new(),
            next_generation: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Slab::with_capacity(capacity),
            next_generation: 0,
        }
    }

    /// Nodes alive across all lists.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `key` still names a linked node.
    pub fn contains(&self, key: NodeKey) -> bool {
        self.nodes
            .get(key.index)
            .is_some_and(|n| n.generation == key.generation)
    }

    pub fn get(&self, key: NodeKey) -> Option<&T> {
        self.nodes
            .get(key.index)
            .filter(|n| n.generation == key.generation)
            .map(|n| &n.value)
    }

    pub fn get_mut(&mut self, key: NodeKey) -> Option<&mut T> {
        self.nodes
            .get_mut(key.index)
            .filter(|n| n.generation == key.generation)
            .map(|n| &mut n.value)
    }

    /// Appends `value` to the list behind `head`.
    pub fn push_back(&mut self, head: &mut ListHead, value: T) -> NodeKey {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let index = self.nodes.insert(Node {
            value,
            prev: head.tail,
            next: None,
            generation,
        });
        match head.tail {
            Some(tail) => self.nodes[tail].next = Some(index),
            None => head.head = Some(index),
        }
        head.tail = Some(index);
        head.len += 1;

        NodeKey { index, generation }
    }

    /// Unlinks the node named by `key` from `head`'s list.
    ///
    /// Returns `None` when the key is stale (already unlinked).
    pub fn unlink(&mut self, head: &mut ListHead, key: NodeKey) -> Option<T> {
        if !self.contains(key) {
            return None;
        }
        let node = self.nodes.remove(key.index);
        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => head.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => head.tail = node.prev,
        }
        head.len -= 1;
        Some(node.value)
    }

    /// Removes and returns the first node of `head`'s list.
    pub fn pop_front(&mut self, head: &mut ListHead) -> Option<(NodeKey, T)> {
        let index = head.head?;
        let key = NodeKey {
            index,
            generation: self.nodes[index].generation,
        };
        self.unlink(head, key).map(|value| (key, value))
    }

    /// Keys of `head`'s list, front to back.
    pub fn keys(&self, head: &ListHead) -> Vec<NodeKey> {
        let mut keys = Vec::with_capacity(head.len);
        let mut cursor = head.head;
        while let Some(index) = cursor {
            let node = &self.nodes[index];
            keys.push(NodeKey {
                index,
                generation: node.generation,
            });
            cursor = node.next;
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(list: &IndexList<u32>, head: &ListHead) -> Vec<u32> {
        list.keys(head)
            .into_iter()
            .filter_map(|k| list.get(k).copied())
            .collect()
    }

    #[test]
    fn test_push_and_pop_in_order() {
        let mut list = IndexList::new();
        let mut head = ListHead::new();
        for v in 1..=3 {
            list.push_back(&mut head, v);
        }
        assert_eq!(head.len(), 3);
        assert_eq!(list.pop_front(&mut head).map(|(_, v)| v), Some(1));
        assert_eq!(values(&list, &head), vec![2, 3]);
    }

    #[test]
    fn test_unlink_middle_head_and_tail() {
        let mut list = IndexList::new();
        let mut head = ListHead::new();
        let keys: Vec<_> = (0..5).map(|v| list.push_back(&mut head, v)).collect();

        assert_eq!(list.unlink(&mut head, keys[2]), Some(2));
        assert_eq!(list.unlink(&mut head, keys[0]), Some(0));
        assert_eq!(list.unlink(&mut head, keys[4]), Some(4));
        assert_eq!(values(&list, &head), vec![1, 3]);

        list.push_back(&mut head, 9);
        assert_eq!(values(&list, &head), vec![1, 3, 9]);
    }

    #[test]
    fn test_stale_key_is_rejected_after_slot_reuse() {
        let mut list = IndexList::new();
        let mut head = ListHead::new();
        let old = list.push_back(&mut head, 1);
        list.unlink(&mut head, old);

        // Same slab slot, new generation
        let new = list.push_back(&mut head, 2);
        assert!(!list.contains(old));
        assert_eq!(list.unlink(&mut head, old), None);
        assert_eq!(list.get(new), Some(&2));
        assert_eq!(head.len(), 1);
    }

    #[test]
    fn test_many_lists_share_one_arena() {
        let mut list = IndexList::with_capacity(8);
        let mut a = ListHead::new();
        let mut b = ListHead::new();
        list.push_back(&mut a, 1);
        let kb = list.push_back(&mut b, 10);
        list.push_back(&mut a, 2);
        list.push_back(&mut b, 20);

        assert_eq!(list.len(), 4);
        assert_eq!(list.unlink(&mut b, kb), Some(10));
        assert_eq!(values(&list, &a), vec![1, 2]);
        assert_eq!(values(&list, &b), vec![20]);
        let first = list.keys(&a)[0];
        if let Some(v) = list.get_mut(first) {
            *v = 7;
        }
        assert_eq!(values(&list, &a), vec![7, 2]);
    }
}
