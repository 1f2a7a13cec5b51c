//! Paged B+tree mapping 16-byte keys to a flag byte.
//!
//! Page 0 holds the tree header: `magic [4] | version u32 | tag [4] |
//! root u32 | len u64`. Leaves hold `count u16 | next u32 | (key [16],
//! value u8)*` sorted by key and are chained left to right; internal pages
//! hold `count u16 | children u32 * (count + 1) | keys [16] * count`, where
//! `keys[i]` is the smallest key below `children[i + 1]`. Keys are stored
//! big-endian, so leaf bytes are in key order.
//!
//! Removal never merges pages. Trees that became sparse are rebuilt with
//! [`BTree::build`].

use crate::error::{Result, StoreError};
use crate::options::SyncMode;
use crate::page::{Page, PageFile, PageId, PageKind, PAGE_PAYLOAD};
use log::debug;
use std::ops::RangeInclusive;
use std::path::Path;

const VERSION: u32 = 1;
const ENTRY_LEN: usize = 17;
const LEAF_HEADER_LEN: usize = 6;
pub const LEAF_CAPACITY: usize = (PAGE_PAYLOAD - LEAF_HEADER_LEN) / ENTRY_LEN;
pub const INTERNAL_CAPACITY: usize = (PAGE_PAYLOAD - 2 - 4) / 20;
/// Deeper than any tree of `u32` pages can grow.
const MAX_DEPTH: usize = 32;
/// Dirty pages written out per step while building a tree.
const BUILD_FLUSH_PAGES: usize = 256;

/// Sentinel for "no next leaf"; page 0 is always the header.
const NO_PAGE: PageId = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
struct LeafNode {
    entries: Vec<(u128, u8)>,
    next: PageId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InternalNode {
    keys: Vec<u128>,
    children: Vec<PageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

fn read_u16(buf: &[u8], off: usize) -> usize {
    u16::from_be_bytes([buf[off], buf[off + 1]]) as usize
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_key(buf: &[u8], off: usize) -> u128 {
    let mut k = [0u8; 16];
    k.copy_from_slice(&buf[off..off + 16]);
    u128::from_be_bytes(k)
}

impl LeafNode {
    fn lower_bound(&self, key: u128) -> usize {
        self.entries.partition_point(|(k, _)| *k < key)
    }

    fn search(&self, key: u128) -> Option<u8> {
        self.entries
            .binary_search_by(|(k, _)| k.cmp(&key))
            .ok()
            .map(|i| self.entries[i].1)
    }

    fn insert(&mut self, key: u128, value: u8) -> Option<u8> {
        match self.entries.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            Err(i) => {
                self.entries.insert(i, (key, value));
                None
            }
        }
    }

    fn remove(&mut self, key: u128) -> Option<u8> {
        match self.entries.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(i) => Some(self.entries.remove(i).1),
            Err(_) => None,
        }
    }

    /// Move the upper half into a new right sibling; returns its first key.
    fn split(&mut self) -> (u128, LeafNode) {
        let mid = self.entries.len() / 2;
        let right = LeafNode {
            entries: self.entries.split_off(mid),
            next: self.next,
        };
        (right.entries[0].0, right)
    }
}

impl InternalNode {
    fn find_child(&self, key: u128) -> usize {
        match self.keys.binary_search(&key) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Split around the middle key, which moves up to the parent.
    fn split(&mut self) -> (u128, InternalNode) {
        let mid = self.keys.len() / 2;
        let up = self.keys[mid];
        let right = InternalNode {
            keys: self.keys.split_off(mid + 1),
            children: self.children.split_off(mid + 1),
        };
        self.keys.pop();
        (up, right)
    }
}

impl Node {
    fn kind(&self) -> PageKind {
        match self {
            Node::Leaf(_) => PageKind::Leaf,
            Node::Internal(_) => PageKind::Internal,
        }
    }

    fn decode(page: &Page) -> Result<Self> {
        let buf = page.payload();
        let count = read_u16(buf, 0);
        match page.kind() {
            PageKind::Leaf => {
                if count > LEAF_CAPACITY {
                    return Err(StoreError::corrupt(format!(
                        "leaf page {} claims {count} entries",
                        page.id()
                    )));
                }
                let next = read_u32(buf, 2);
                let entries = (0..count)
                    .map(|i| {
                        let off = LEAF_HEADER_LEN + i * ENTRY_LEN;
                        (read_key(buf, off), buf[off + 16])
                    })
                    .collect();
                Ok(Node::Leaf(LeafNode { entries, next }))
            }
            PageKind::Internal => {
                if count > INTERNAL_CAPACITY {
                    return Err(StoreError::corrupt(format!(
                        "internal page {} claims {count} keys",
                        page.id()
                    )));
                }
                let children = (0..=count).map(|i| read_u32(buf, 2 + i * 4)).collect();
                let keys_at = 2 + (count + 1) * 4;
                let keys = (0..count)
                    .map(|i| read_key(buf, keys_at + i * 16))
                    .collect();
                Ok(Node::Internal(InternalNode { keys, children }))
            }
            PageKind::Meta => Err(StoreError::corrupt(format!(
                "page {} is a header page inside the tree",
                page.id()
            ))),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        match self {
            Node::Leaf(leaf) => {
                buf[0..2].copy_from_slice(&(leaf.entries.len() as u16).to_be_bytes());
                buf[2..6].copy_from_slice(&leaf.next.to_be_bytes());
                for (i, (key, value)) in leaf.entries.iter().enumerate() {
                    let off = LEAF_HEADER_LEN + i * ENTRY_LEN;
                    buf[off..off + 16].copy_from_slice(&key.to_be_bytes());
                    buf[off + 16] = *value;
                }
            }
            Node::Internal(node) => {
                buf[0..2].copy_from_slice(&(node.keys.len() as u16).to_be_bytes());
                for (i, child) in node.children.iter().enumerate() {
                    buf[2 + i * 4..6 + i * 4].copy_from_slice(&child.to_be_bytes());
                }
                let keys_at = 2 + node.children.len() * 4;
                for (i, key) in node.keys.iter().enumerate() {
                    let off = keys_at + i * 16;
                    buf[off..off + 16].copy_from_slice(&key.to_be_bytes());
                }
            }
        }
    }
}

/// A B+tree stored in one [`PageFile`]. Reads take `&self` and go through
/// the page cache; changes become durable on [`BTree::commit`].
pub struct BTree {
    file: PageFile,
    magic: [u8; 4],
    tag: [u8; 4],
    root: PageId,
    len: u64,
    meta_dirty: bool,
}

impl BTree {
    /// Open the tree at `path`, creating an empty one if the file is new.
    /// `magic` identifies the file type and `tag` the tree's role in it.
    pub fn open(
        path: &Path,
        magic: [u8; 4],
        tag: [u8; 4],
        sync: SyncMode,
        cache_pages: usize,
    ) -> Result<Self> {
        let file = PageFile::open(path, sync, cache_pages)?;
        if file.is_empty() {
            let mut tree = Self::empty(file, magic, tag)?;
            tree.commit()?;
            return Ok(tree);
        }
        let meta = file.read(0)?;
        let buf = meta.payload();
        if meta.kind() != PageKind::Meta || buf[0..4] != magic {
            return Err(StoreError::corrupt(format!(
                "{} does not start with a {} header",
                path.display(),
                String::from_utf8_lossy(&magic)
            )));
        }
        let version = read_u32(buf, 4);
        if version != VERSION {
            return Err(StoreError::corrupt(format!(
                "{} has unsupported version {version}",
                path.display()
            )));
        }
        if buf[8..12] != tag {
            return Err(StoreError::corrupt(format!(
                "{} holds '{}' instead of '{}'",
                path.display(),
                String::from_utf8_lossy(&buf[8..12]),
                String::from_utf8_lossy(&tag)
            )));
        }
        let root = read_u32(buf, 12);
        let mut len = [0u8; 8];
        len.copy_from_slice(&buf[16..24]);
        let len = u64::from_be_bytes(len);
        if root == NO_PAGE || root >= file.page_count() {
            return Err(StoreError::corrupt(format!(
                "{} names root page {root} of {}",
                path.display(),
                file.page_count()
            )));
        }
        drop(meta);
        Ok(Self {
            file,
            magic,
            tag,
            root,
            len,
            meta_dirty: false,
        })
    }

    fn empty(mut file: PageFile, magic: [u8; 4], tag: [u8; 4]) -> Result<Self> {
        file.allocate(PageKind::Meta)?;
        let root = file.allocate(PageKind::Leaf)?.id();
        let mut tree = Self {
            file,
            magic,
            tag,
            root,
            len: 0,
            meta_dirty: true,
        };
        tree.store(
            root,
            &Node::Leaf(LeafNode {
                entries: Vec::new(),
                next: NO_PAGE,
            }),
        );
        Ok(tree)
    }

    /// Write a new tree at `path` holding `entries`, which must come in
    /// strictly ascending key order. Leaves are packed full. Any file at
    /// `path` is replaced.
    pub fn build<I>(
        path: &Path,
        magic: [u8; 4],
        tag: [u8; 4],
        sync: SyncMode,
        cache_pages: usize,
        entries: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = Result<(u128, u8)>>,
    {
        PageFile::remove(path)?;
        let mut file = PageFile::open(path, sync, cache_pages)?;
        file.allocate(PageKind::Meta)?;
        let mut tree = Self {
            file,
            magic,
            tag,
            root: NO_PAGE,
            len: 0,
            meta_dirty: true,
        };

        // (first key, page) of every node on the level being built
        let mut level: Vec<(u128, PageId)> = Vec::new();
        let mut leaf: Option<(PageId, LeafNode)> = None;
        let mut last: Option<u128> = None;
        for entry in entries {
            let (key, value) = entry?;
            if last.map_or(false, |l| key <= l) {
                return Err(StoreError::IllegalState(format!(
                    "keys out of order while building {}",
                    path.display()
                )));
            }
            last = Some(key);
            let full = leaf
                .as_ref()
                .map_or(true, |(_, l)| l.entries.len() >= LEAF_CAPACITY);
            if full {
                let id = tree.file.allocate(PageKind::Leaf)?.id();
                if let Some((prev_id, mut prev)) = leaf.take() {
                    prev.next = id;
                    tree.store(prev_id, &Node::Leaf(prev));
                }
                level.push((key, id));
                leaf = Some((
                    id,
                    LeafNode {
                        entries: Vec::with_capacity(LEAF_CAPACITY),
                        next: NO_PAGE,
                    },
                ));
                if level.len() % BUILD_FLUSH_PAGES == 0 {
                    tree.file.write_unlogged()?;
                }
            }
            if let Some((_, l)) = leaf.as_mut() {
                l.entries.push((key, value));
            }
            tree.len += 1;
        }
        match leaf {
            Some((id, l)) => tree.store(id, &Node::Leaf(l)),
            None => {
                let id = tree.file.allocate(PageKind::Leaf)?.id();
                tree.store(
                    id,
                    &Node::Leaf(LeafNode {
                        entries: Vec::new(),
                        next: NO_PAGE,
                    }),
                );
                level.push((0, id));
            }
        }

        while level.len() > 1 {
            let mut parents = Vec::with_capacity(level.len() / INTERNAL_CAPACITY + 1);
            for group in level.chunks(INTERNAL_CAPACITY + 1) {
                let id = tree.file.allocate(PageKind::Internal)?.id();
                let node = InternalNode {
                    keys: group[1..].iter().map(|(k, _)| *k).collect(),
                    children: group.iter().map(|(_, c)| *c).collect(),
                };
                tree.store(id, &Node::Internal(node));
                parents.push((group[0].0, id));
            }
            tree.file.write_unlogged()?;
            level = parents;
        }
        tree.root = level[0].1;
        tree.write_meta();
        tree.file.write_unlogged()?;
        tree.file.close()?;
        tree.meta_dirty = false;
        debug!(
            "Built {} with {} entries in {} pages",
            path.display(),
            tree.len,
            tree.file.page_count()
        );
        Ok(tree)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_count(&self) -> PageId {
        self.file.page_count()
    }

    /// Pages read from disk so far.
    pub fn disk_reads(&self) -> u64 {
        self.file.disk_reads()
    }

    fn load(&self, id: PageId) -> Result<Node> {
        Node::decode(&*self.file.read(id)?)
    }

    fn store(&mut self, id: PageId, node: &Node) {
        let mut page = Page::new(id, node.kind());
        node.encode(page.payload_mut());
        self.file.write(page);
    }

    fn write_meta(&mut self) {
        let mut page = Page::new(0, PageKind::Meta);
        let buf = page.payload_mut();
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.tag);
        buf[12..16].copy_from_slice(&self.root.to_be_bytes());
        buf[16..24].copy_from_slice(&self.len.to_be_bytes());
        self.file.write(page);
    }

    fn child_of(&self, node: &InternalNode, key: u128, at: PageId) -> Result<PageId> {
        node.children
            .get(node.find_child(key))
            .copied()
            .filter(|c| *c != NO_PAGE && *c < self.file.page_count())
            .ok_or_else(|| StoreError::corrupt(format!("internal page {at} has a bad child")))
    }

    /// Leaf that would hold `key`, with its page id.
    fn find_leaf(&self, key: u128) -> Result<(PageId, LeafNode)> {
        let mut id = self.root;
        for _ in 0..MAX_DEPTH {
            match self.load(id)? {
                Node::Internal(node) => id = self.child_of(&node, key, id)?,
                Node::Leaf(leaf) => return Ok((id, leaf)),
            }
        }
        Err(StoreError::corrupt(format!(
            "{} is deeper than {MAX_DEPTH} levels",
            self.path().display()
        )))
    }

    pub fn get(&self, key: u128) -> Result<Option<u8>> {
        Ok(self.find_leaf(key)?.1.search(key))
    }

    /// Insert or overwrite; returns the previous value.
    pub fn insert(&mut self, key: u128, value: u8) -> Result<Option<u8>> {
        let (prev, split) = self.insert_into(self.root, key, value, 0)?;
        if let Some((sep, right)) = split {
            let root = self.file.allocate(PageKind::Internal)?.id();
            let node = InternalNode {
                keys: vec![sep],
                children: vec![self.root, right],
            };
            self.store(root, &Node::Internal(node));
            self.root = root;
        }
        if prev.is_none() {
            self.len += 1;
        }
        self.meta_dirty = true;
        Ok(prev)
    }

    #[allow(clippy::type_complexity)]
    fn insert_into(
        &mut self,
        id: PageId,
        key: u128,
        value: u8,
        depth: usize,
    ) -> Result<(Option<u8>, Option<(u128, PageId)>)> {
        if depth >= MAX_DEPTH {
            return Err(StoreError::corrupt(format!(
                "{} is deeper than {MAX_DEPTH} levels",
                self.path().display()
            )));
        }
        match self.load(id)? {
            Node::Leaf(mut leaf) => {
                let prev = leaf.insert(key, value);
                if leaf.entries.len() <= LEAF_CAPACITY {
                    self.store(id, &Node::Leaf(leaf));
                    return Ok((prev, None));
                }
                let right_id = self.file.allocate(PageKind::Leaf)?.id();
                let (sep, right) = leaf.split();
                leaf.next = right_id;
                self.store(id, &Node::Leaf(leaf));
                self.store(right_id, &Node::Leaf(right));
                Ok((prev, Some((sep, right_id))))
            }
            Node::Internal(mut node) => {
                let child = self.child_of(&node, key, id)?;
                let (prev, split) = self.insert_into(child, key, value, depth + 1)?;
                let Some((sep, right)) = split else {
                    return Ok((prev, None));
                };
                let at = node.find_child(key);
                node.keys.insert(at, sep);
                node.children.insert(at + 1, right);
                if node.keys.len() <= INTERNAL_CAPACITY {
                    self.store(id, &Node::Internal(node));
                    return Ok((prev, None));
                }
                let right_id = self.file.allocate(PageKind::Internal)?.id();
                let (up, right_node) = node.split();
                self.store(id, &Node::Internal(node));
                self.store(right_id, &Node::Internal(right_node));
                Ok((prev, Some((up, right_id))))
            }
        }
    }

    /// Remove `key`; returns its value if it was present.
    pub fn remove(&mut self, key: u128) -> Result<Option<u8>> {
        let (id, mut leaf) = self.find_leaf(key)?;
        let prev = leaf.remove(key);
        if prev.is_some() {
            self.store(id, &Node::Leaf(leaf));
            self.len = self.len.saturating_sub(1);
            self.meta_dirty = true;
        }
        Ok(prev)
    }

    /// Entries with keys in `range`, ascending. Leaves are read one at a
    /// time as the iterator advances.
    pub fn range(&self, range: RangeInclusive<u128>) -> Range<'_> {
        let (start, end) = range.into_inner();
        Range {
            tree: self,
            start: Some(start),
            end,
            entries: Vec::new(),
            pos: 0,
            next: NO_PAGE,
            visited: 0,
            done: start > end,
        }
    }

    /// Make all changes durable as one atomic step.
    pub fn commit(&mut self) -> Result<()> {
        if self.meta_dirty {
            self.write_meta();
            self.meta_dirty = false;
        }
        self.file.commit()
    }

    pub fn close(&mut self) -> Result<()> {
        self.commit()?;
        self.file.close()
    }
}

/// Lazy ascending scan over a key range of a [`BTree`].
pub struct Range<'a> {
    tree: &'a BTree,
    start: Option<u128>,
    end: u128,
    entries: Vec<(u128, u8)>,
    pos: usize,
    next: PageId,
    visited: u32,
    done: bool,
}

impl Range<'_> {
    fn fail(&mut self, e: StoreError) -> Option<Result<(u128, u8)>> {
        self.done = true;
        Some(Err(e))
    }
}

impl Iterator for Range<'_> {
    type Item = Result<(u128, u8)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(start) = self.start.take() {
            match self.tree.find_leaf(start) {
                Ok((_, leaf)) => {
                    self.pos = leaf.lower_bound(start);
                    self.next = leaf.next;
                    self.entries = leaf.entries;
                }
                Err(e) => return self.fail(e),
            }
        }
        loop {
            if let Some((key, value)) = self.entries.get(self.pos).copied() {
                self.pos += 1;
                if key > self.end {
                    self.done = true;
                    return None;
                }
                return Some(Ok((key, value)));
            }
            if self.next == NO_PAGE {
                self.done = true;
                return None;
            }
            self.visited += 1;
            if self.visited > self.tree.page_count() {
                let e = StoreError::corrupt(format!(
                    "leaf chain of {} loops",
                    self.tree.path().display()
                ));
                return self.fail(e);
            }
            match self.tree.load(self.next) {
                Ok(Node::Leaf(leaf)) => {
                    self.entries = leaf.entries;
                    self.pos = 0;
                    self.next = leaf.next;
                }
                Ok(Node::Internal(_)) => {
                    let e = StoreError::corrupt(format!(
                        "leaf chain of {} reaches internal page {}",
                        self.tree.path().display(),
                        self.next
                    ));
                    return self.fail(e);
                }
                Err(e) => return self.fail(e),
            }
        }
    }
}
