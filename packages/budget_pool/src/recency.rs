use std::iter;

/// Identifies an entry in a [`RecencyList`].
///
/// Tokens stay valid while their entry is in the list, no matter how the entry moves. Once the
/// entry is removed, the token becomes stale: the slot it pointed to may be reused, but the
/// generation will no longer match.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PositionToken {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Node<V> {
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,

    // `None` for vacant nodes, which are chained through `next` into the free list.
    value: Option<V>,
}

/// Arena-backed doubly linked list ordered from most recently used (front) to least recently
/// used (back).
///
/// All positional operations are O(1). Vacant nodes are recycled through an intrusive free list.
#[derive(Debug)]
pub(crate) struct RecencyList<V> {
    nodes: Vec<Node<V>>,
    head: Option<usize>,
    tail: Option<usize>,
    free_head: Option<usize>,
    len: usize,
}

impl<V> RecencyList<V> {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            head: None,
            tail: None,
            free_head: None,
            len: 0,
        }
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a value as the most recently used entry.
    pub(crate) fn push_front(&mut self, value: V) -> PositionToken {
        let index = if let Some(index) = self.free_head {
            let node = self.node_mut(index);
            let next_free = node.next;
            node.value = Some(value);
            self.free_head = next_free;
            index
        } else {
            self.nodes.push(Node {
                generation: 0,
                prev: None,
                next: None,
                value: Some(value),
            });

            // Cannot wrap, we just pushed a node.
            self.nodes.len().wrapping_sub(1)
        };

        self.link_front(index);

        // A list longer than virtual memory is impossible.
        self.len = self.len.wrapping_add(1);

        PositionToken {
            index,
            generation: self.node(index).generation,
        }
    }

    /// Whether the token refers to an entry currently in the list.
    #[must_use]
    pub(crate) fn contains(&self, token: PositionToken) -> bool {
        self.nodes
            .get(token.index)
            .is_some_and(|node| node.generation == token.generation && node.value.is_some())
    }

    #[must_use]
    pub(crate) fn get(&self, token: PositionToken) -> Option<&V> {
        if !self.contains(token) {
            return None;
        }

        self.node(token.index).value.as_ref()
    }

    #[must_use]
    pub(crate) fn get_mut(&mut self, token: PositionToken) -> Option<&mut V> {
        if !self.contains(token) {
            return None;
        }

        self.node_mut(token.index).value.as_mut()
    }

    /// Makes the entry the most recently used one. Returns `false` for a stale token.
    pub(crate) fn move_to_front(&mut self, token: PositionToken) -> bool {
        if !self.contains(token) {
            return false;
        }

        if self.head == Some(token.index) {
            return true;
        }

        self.unlink(token.index);
        self.link_front(token.index);
        true
    }

    /// Removes the entry, returning its value. Returns `None` for a stale token.
    pub(crate) fn remove(&mut self, token: PositionToken) -> Option<V> {
        if !self.contains(token) {
            return None;
        }

        self.unlink(token.index);

        let free_head = self.free_head;
        let node = self.node_mut(token.index);
        let value = node.value.take();
        node.generation = node.generation.wrapping_add(1);
        node.next = free_head;
        self.free_head = Some(token.index);

        // Cannot wrap, the entry was in the list.
        self.len = self.len.wrapping_sub(1);

        value
    }

    /// The least recently used entry.
    #[must_use]
    pub(crate) fn back(&self) -> Option<(PositionToken, &V)> {
        let index = self.tail?;
        let node = self.node(index);

        node.value.as_ref().map(|value| {
            (
                PositionToken {
                    index,
                    generation: node.generation,
                },
                value,
            )
        })
    }

    /// The most recently used entry.
    #[must_use]
    pub(crate) fn front(&self) -> Option<(PositionToken, &V)> {
        let index = self.head?;
        let node = self.node(index);

        node.value.as_ref().map(|value| {
            (
                PositionToken {
                    index,
                    generation: node.generation,
                },
                value,
            )
        })
    }

    /// Iterates from most recently used to least recently used.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (PositionToken, &V)> {
        let mut cursor = self.head;

        iter::from_fn(move || {
            let index = cursor?;
            let node = self.node(index);
            cursor = node.next;

            node.value.as_ref().map(|value| {
                (
                    PositionToken {
                        index,
                        generation: node.generation,
                    },
                    value,
                )
            })
        })
    }

    fn link_front(&mut self, index: usize) {
        let old_head = self.head;

        {
            let node = self.node_mut(index);
            node.prev = None;
            node.next = old_head;
        }

        match old_head {
            Some(old) => self.node_mut(old).prev = Some(index),
            None => self.tail = Some(index),
        }

        self.head = Some(index);
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };

        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }

        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }

        let node = self.node_mut(index);
        node.prev = None;
        node.next = None;
    }

    fn node(&self, index: usize) -> &Node<V> {
        self.nodes
            .get(index)
            .expect("recency list links only ever point at existing nodes")
    }

    fn node_mut(&mut self, index: usize) -> &mut Node<V> {
        self.nodes
            .get_mut(index)
            .expect("recency list links only ever point at existing nodes")
    }

    #[cfg(test)]
    pub(crate) fn integrity_check(&self) {
        let forward = self.iter().count();
        assert_eq!(forward, self.len, "forward walk disagrees with tracked length");

        let mut backward = 0_usize;
        let mut cursor = self.tail;
        while let Some(index) = cursor {
            backward = backward.wrapping_add(1);
            cursor = self.node(index).prev;
        }
        assert_eq!(backward, self.len, "backward walk disagrees with tracked length");
    }
}
