//! # Index Trees
//!
//! Per-partition search trees over record digests. Nodes are arena
//! elements and link to each other by handle, so a tree left in persistent
//! memory is walkable again after a restart once its arena is resumed.
//!
//! The root handle lives in a [`TreeRoot`] cell of the namespace region.
//! The element count does not: it is rebuilt by whoever walks the tree at
//! startup.

use std::cmp::Ordering;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use kvindex_core::{Arena, ElementHandle, RegionCell};

use crate::error::{TreeError, TreeResult};
use crate::index::{Digest, IndexEntry, IndexRecord};

/// Persisted root of one tree.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct TreeRoot {
    /// Root node handle, packed (0 = empty tree).
    pub root: u64,
}

impl TreeRoot {
    /// Bytes per root.
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Verdict of a reduce callback on one entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visit {
    /// Leave the entry in the tree.
    Keep,
    /// Remove the entry once the walk has passed it.
    Delete,
}

/// What the startup reducer needs from an index tree.
pub trait IndexTree {
    /// Visits every entry once, synchronously, in digest order.
    ///
    /// Entries the callback marks [`Visit::Delete`] are removed without
    /// disturbing the rest of the walk.
    ///
    /// # Errors
    ///
    /// Fails if a node cannot be resolved or the tree is corrupt.
    fn reduce_sync(&mut self, visit: &mut dyn FnMut(&IndexEntry) -> Visit) -> TreeResult<()>;

    /// Removes the entry keyed `digest`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Fails if a node cannot be resolved.
    fn delete(&mut self, digest: &Digest) -> TreeResult<bool>;

    /// Entries accounted to this tree.
    fn element_count(&self) -> u64;

    /// Adds `n` to the accounted entries.
    fn add_elements(&mut self, n: u64);
}

/// Where a node hangs from.
#[derive(Clone, Copy, Debug)]
enum Link {
    Root,
    Left(ElementHandle),
    Right(ElementHandle),
}

/// Unbalanced binary search tree stored in an arena.
#[derive(Debug)]
pub struct ArenaTree {
    arena: Arc<Arena>,
    root: RegionCell<TreeRoot>,
    elements: u64,
}

impl ArenaTree {
    /// Opens the tree rooted at `root`. The element count starts at zero.
    #[must_use]
    pub fn new(arena: Arc<Arena>, root: RegionCell<TreeRoot>) -> Self {
        Self {
            arena,
            root,
            elements: 0,
        }
    }

    fn root_handle(&self) -> ElementHandle {
        ElementHandle::from_raw(self.root.load().root)
    }

    /// Whether the tree has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root_handle().is_null()
    }

    fn node(&self, handle: ElementHandle) -> TreeResult<IndexRecord> {
        Ok(self.arena.read::<IndexRecord>(handle)?)
    }

    fn set_link(&self, link: Link, child: ElementHandle) -> TreeResult<()> {
        match link {
            Link::Root => self.root.update(|r| r.root = child.to_raw()),
            Link::Left(parent) => {
                let mut node = self.node(parent)?;
                node.left = child.to_raw();
                self.arena.write(parent, &node)?;
            }
            Link::Right(parent) => {
                let mut node = self.node(parent)?;
                node.right = child.to_raw();
                self.arena.write(parent, &node)?;
            }
        }
        Ok(())
    }

    /// Finds the node keyed `digest` and the link it hangs from. When the
    /// digest is absent, returns the null handle and the link a new node
    /// would take.
    fn search(&self, digest: &Digest) -> TreeResult<(ElementHandle, Link)> {
        let mut link = Link::Root;
        let mut current = self.root_handle();

        while !current.is_null() {
            let node = self.node(current)?;
            match digest.cmp(&node.digest) {
                Ordering::Equal => return Ok((current, link)),
                Ordering::Less => {
                    link = Link::Left(current);
                    current = node.left();
                }
                Ordering::Greater => {
                    link = Link::Right(current);
                    current = node.right();
                }
            }
        }

        Ok((ElementHandle::NULL, link))
    }

    /// Inserts `entry`, or replaces the payload of the entry with the same
    /// digest. Returns whether a node was added.
    ///
    /// # Errors
    ///
    /// Fails if the arena is exhausted or a node cannot be resolved.
    pub fn insert(&mut self, entry: &IndexEntry) -> TreeResult<bool> {
        let (found, link) = self.search(&entry.digest)?;

        if !found.is_null() {
            let mut node = self.node(found)?;
            node.set_entry(entry);
            self.arena.write(found, &node)?;
            return Ok(false);
        }

        let handle = self.arena.alloc()?;
        let mut node = IndexRecord::default();
        node.set_entry(entry);
        self.arena.write(handle, &node)?;
        self.set_link(link, handle)?;
        self.elements += 1;

        Ok(true)
    }

    /// Looks up the entry keyed `digest`.
    ///
    /// # Errors
    ///
    /// Fails if a node cannot be resolved.
    pub fn get(&self, digest: &Digest) -> TreeResult<Option<IndexEntry>> {
        let (found, _) = self.search(digest)?;
        if found.is_null() {
            return Ok(None);
        }
        Ok(Some(IndexEntry::from(&self.node(found)?)))
    }

    /// Entries in digest order.
    ///
    /// # Errors
    ///
    /// Fails if a node cannot be resolved or the tree is corrupt.
    pub fn entries(&self) -> TreeResult<Vec<IndexEntry>> {
        let limit = self.node_limit();
        let mut loaded = 0u64;
        let mut out = Vec::new();
        let mut stack = Vec::new();
        let mut current = self.root_handle();

        while !current.is_null() || !stack.is_empty() {
            while !current.is_null() {
                loaded += 1;
                if loaded > limit {
                    return Err(TreeError::Corrupt { limit });
                }
                let node = self.node(current)?;
                stack.push(node);
                current = node.left();
            }
            if let Some(node) = stack.pop() {
                out.push(IndexEntry::from(&node));
                current = node.right();
            }
        }

        Ok(out)
    }

    /// Most nodes the arena can hold; a longer walk means a cycle.
    fn node_limit(&self) -> u64 {
        u64::from(self.arena.stage_count()) * u64::from(self.arena.geometry().stage_capacity)
    }
}

impl IndexTree for ArenaTree {
    fn reduce_sync(&mut self, visit: &mut dyn FnMut(&IndexEntry) -> Visit) -> TreeResult<()> {
        let mut doomed = Vec::new();
        for entry in self.entries()? {
            if visit(&entry) == Visit::Delete {
                doomed.push(entry.digest);
            }
        }

        for digest in &doomed {
            self.delete(digest)?;
        }
        Ok(())
    }

    fn delete(&mut self, digest: &Digest) -> TreeResult<bool> {
        let (found, link) = self.search(digest)?;
        if found.is_null() {
            return Ok(false);
        }

        let node = self.node(found)?;
        let replacement = if node.left().is_null() {
            node.right()
        } else if node.right().is_null() {
            node.left()
        } else {
            // Two children: lift the in-order successor into place.
            let mut successor_parent = found;
            let mut successor = node.right();
            let mut succ = self.node(successor)?;
            while !succ.left().is_null() {
                successor_parent = successor;
                successor = succ.left();
                succ = self.node(successor)?;
            }

            if successor_parent != found {
                self.set_link(Link::Left(successor_parent), succ.right())?;
                succ.right = node.right;
            }
            succ.left = node.left;
            self.arena.write(successor, &succ)?;
            successor
        };

        self.set_link(link, replacement)?;
        self.elements = self.elements.saturating_sub(1);
        Ok(true)
    }

    fn element_count(&self) -> u64 {
        self.elements
    }

    fn add_elements(&mut self, n: u64) {
        self.elements += n;
    }
}
