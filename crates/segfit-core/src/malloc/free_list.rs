//! Segregated free lists.
//!
//! Each class is a circular doubly linked list headed by a sentinel. Links are
//! kept in a side table keyed by block offset instead of inside the free
//! block's payload bytes, so the arena itself only ever holds boundary tags
//! and caller data.
//!
//! The wilderness class holds at most one block: inserting into it replaces
//! whatever was there.

use std::collections::HashMap;

use super::layout::{NUM_FREE_LISTS, WILDERNESS_CLASS};

/// A position in a list: the sentinel or a member block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Sentinel,
    Block(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Links {
    next: Node,
    prev: Node,
}

impl Links {
    const EMPTY: Self = Self {
        next: Node::Sentinel,
        prev: Node::Sentinel,
    };
}

/// All free lists of one heap.
#[derive(Debug, Clone)]
pub struct FreeLists {
    sentinels: [Links; NUM_FREE_LISTS],
    links: HashMap<usize, Links>,
}

impl Default for FreeLists {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeLists {
    /// Creates empty lists.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sentinels: [Links::EMPTY; NUM_FREE_LISTS],
            links: HashMap::new(),
        }
    }

    /// Points every sentinel back at itself and forgets all members.
    pub fn reset(&mut self) {
        self.sentinels = [Links::EMPTY; NUM_FREE_LISTS];
        self.links.clear();
    }

    fn get(&self, class: usize, node: Node) -> Links {
        match node {
            Node::Sentinel => self.sentinels[class],
            Node::Block(block) => self.links.get(&block).copied().unwrap_or(Links::EMPTY),
        }
    }

    fn set_next(&mut self, class: usize, node: Node, next: Node) {
        match node {
            Node::Sentinel => self.sentinels[class].next = next,
            Node::Block(block) => self.links.entry(block).or_insert(Links::EMPTY).next = next,
        }
    }

    fn set_prev(&mut self, class: usize, node: Node, prev: Node) {
        match node {
            Node::Sentinel => self.sentinels[class].prev = prev,
            Node::Block(block) => self.links.entry(block).or_insert(Links::EMPTY).prev = prev,
        }
    }

    /// Whether `class` has no members.
    #[must_use]
    pub fn is_empty(&self, class: usize) -> bool {
        let sentinel = self.sentinels[class];
        sentinel.next == Node::Sentinel && sentinel.prev == Node::Sentinel
    }

    /// Pushes `block` as the new head of `class`.
    pub fn insert_front(&mut self, block: usize, class: usize) {
        if class == WILDERNESS_CLASS {
            if let Some(previous) = self.wilderness() {
                self.links.remove(&previous);
            }
            self.sentinels[class] = Links {
                next: Node::Block(block),
                prev: Node::Block(block),
            };
            self.links.insert(block, Links::EMPTY);
            return;
        }

        let old_head = self.sentinels[class].next;
        self.links.insert(
            block,
            Links {
                next: old_head,
                prev: Node::Sentinel,
            },
        );
        self.set_prev(class, old_head, Node::Block(block));
        self.sentinels[class].next = Node::Block(block);
    }

    /// Unlinks `block` from `class`, returning whether it was a member.
    pub fn remove(&mut self, block: usize, class: usize) -> bool {
        if class == WILDERNESS_CLASS {
            if self.wilderness() != Some(block) {
                return false;
            }
            self.sentinels[class] = Links::EMPTY;
            self.links.remove(&block);
            return true;
        }

        let mut cursor = self.sentinels[class].next;
        while let Node::Block(current) = cursor {
            let links = self.get(class, cursor);
            if current == block {
                self.set_next(class, links.prev, links.next);
                self.set_prev(class, links.next, links.prev);
                self.links.remove(&block);
                return true;
            }
            cursor = links.next;
        }
        false
    }

    /// First member of `class`, in list order, whose size is at least `min_size`.
    pub fn first_fit(
        &self,
        class: usize,
        min_size: usize,
        size_of: impl Fn(usize) -> usize,
    ) -> Option<usize> {
        self.iter(class).find(|&block| size_of(block) >= min_size)
    }

    /// Members of `class` from head to tail.
    pub fn iter(&self, class: usize) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = self.sentinels[class].next;
        std::iter::from_fn(move || match cursor {
            Node::Sentinel => None,
            Node::Block(block) => {
                cursor = self.get(class, cursor).next;
                Some(block)
            }
        })
    }

    /// Number of members in `class`.
    #[must_use]
    pub fn len(&self, class: usize) -> usize {
        self.iter(class).count()
    }

    /// Members across every class.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.links.len()
    }

    /// The current wilderness block, if any.
    #[must_use]
    pub fn wilderness(&self) -> Option<usize> {
        match self.sentinels[WILDERNESS_CLASS].next {
            Node::Block(block) => Some(block),
            Node::Sentinel => None,
        }
    }

    /// Whether every `next` hop of `class` is mirrored by a `prev` hop.
    #[must_use]
    pub fn is_well_linked(&self, class: usize) -> bool {
        let mut previous = Node::Sentinel;
        let mut cursor = self.sentinels[class].next;
        let mut steps = 0;
        loop {
            if self.get(class, cursor).prev != previous {
                return false;
            }
            if cursor == Node::Sentinel {
                return true;
            }
            steps += 1;
            if steps > self.links.len() {
                return false;
            }
            previous = cursor;
            cursor = self.get(class, cursor).next;
        }
    }
}
