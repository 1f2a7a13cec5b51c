//! One ordered index over a permutation of (subject, predicate, object,
//! context), stored in its own B+tree file.
//!
//! A record's key is its ids in index order, big-endian, so the byte order
//! of the keys in a leaf equals the index's sort order. The value byte
//! holds the record's flags.

use crate::btree::{self, BTree, LEAF_CAPACITY};
use crate::error::{Result, StoreError};
use crate::options::SyncMode;
use crate::page::PageFile;
use crate::term::ValueId;
use log::{debug, info};
use std::fmt;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

const MAGIC: [u8; 4] = *b"NSIX";
/// Pages each index keeps in its page cache.
const CACHE_PAGES: usize = 256;

/// Flag bit marking a record as explicitly asserted (as opposed to inferred).
pub const FLAG_EXPLICIT: u8 = 0x01;

/// Index files smaller than this are never compacted.
const COMPACT_MIN_PAGES: u64 = 64;
/// Compact once the file has this many times the pages its records need.
const COMPACT_FACTOR: u64 = 4;

/// Ids of a statement in canonical (s, p, o, c) order; context `0` is the
/// default graph.
pub type Quad = [ValueId; 4];

/// Per-component constraint in canonical order; `None` is unbound.
pub type IdPattern = [Option<ValueId>; 4];

/// A stored statement: its ids plus the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Record {
    pub quad: Quad,
    pub flags: u8,
}

impl Record {
    pub fn new(quad: Quad, explicit: bool) -> Self {
        Self {
            quad,
            flags: if explicit { FLAG_EXPLICIT } else { 0 },
        }
    }

    pub fn is_explicit(&self) -> bool {
        self.flags & FLAG_EXPLICIT != 0
    }

    pub fn subject(&self) -> ValueId {
        self.quad[0]
    }

    pub fn predicate(&self) -> ValueId {
        self.quad[1]
    }

    pub fn object(&self) -> ValueId {
        self.quad[2]
    }

    pub fn context(&self) -> ValueId {
        self.quad[3]
    }
}

/// True if every bound component of `pattern` equals the record's.
pub fn matches(pattern: &IdPattern, quad: &Quad) -> bool {
    pattern
        .iter()
        .zip(quad.iter())
        .all(|(p, v)| p.map_or(true, |p| p == *v))
}

/// A permutation of the four statement components, e.g. `spoc` or `posc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexSpec {
    /// Canonical component position (0=s, 1=p, 2=o, 3=c) for each key field.
    order: [usize; 4],
}

impl IndexSpec {
    pub const LETTERS: [char; 4] = ['s', 'p', 'o', 'c'];

    pub fn parse(spec: &str) -> Result<Self> {
        let lower = spec.trim().to_ascii_lowercase();
        let chars: Vec<char> = lower.chars().collect();
        if chars.len() != 4 {
            return Err(StoreError::Configuration(format!(
                "invalid index spec '{spec}': expected 4 letters from s, p, o, c"
            )));
        }
        let mut order = [0usize; 4];
        let mut seen = [false; 4];
        for (i, c) in chars.iter().enumerate() {
            let pos = Self::LETTERS.iter().position(|l| l == c).ok_or_else(|| {
                StoreError::Configuration(format!(
                    "invalid index spec '{spec}': unknown field '{c}'"
                ))
            })?;
            if seen[pos] {
                return Err(StoreError::Configuration(format!(
                    "invalid index spec '{spec}': field '{c}' repeated"
                )));
            }
            seen[pos] = true;
            order[i] = pos;
        }
        Ok(Self { order })
    }

    /// Parse a comma and/or whitespace separated list, dropping duplicates.
    pub fn parse_list(specs: &str) -> Result<Vec<Self>> {
        let mut out: Vec<Self> = Vec::new();
        for part in specs
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
        {
            let spec = Self::parse(part)?;
            if !out.contains(&spec) {
                out.push(spec);
            }
        }
        if out.is_empty() {
            return Err(StoreError::Configuration(
                "at least one triple index must be configured".into(),
            ));
        }
        Ok(out)
    }

    /// Render a list the way it is stored in the metadata file.
    pub fn join(specs: &[Self]) -> String {
        specs
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn leads_with_context(&self) -> bool {
        self.order[0] == 3
    }

    /// Number of leading key fields bound by `pattern`.
    pub fn prefix_len(&self, pattern: &IdPattern) -> usize {
        self.order
            .iter()
            .take_while(|pos| pattern[**pos].is_some())
            .count()
    }

    pub fn key(&self, quad: &Quad) -> u128 {
        self.order
            .iter()
            .fold(0u128, |acc, pos| (acc << 32) | quad[*pos] as u128)
    }

    pub fn quad(&self, key: u128) -> Quad {
        let mut quad = [0; 4];
        for (i, pos) in self.order.iter().enumerate() {
            quad[*pos] = (key >> (32 * (3 - i))) as u32;
        }
        quad
    }

    /// Key range covering every record that agrees with the bound prefix of
    /// `pattern`.
    pub fn range(&self, pattern: &IdPattern) -> RangeInclusive<u128> {
        let prefix = self.prefix_len(pattern);
        let mut lo = 0u128;
        let mut hi = 0u128;
        for (i, pos) in self.order.iter().enumerate() {
            let (l, h) = if i < prefix {
                let v = pattern[*pos].unwrap_or(0);
                (v, v)
            } else {
                (0, u32::MAX)
            };
            lo = (lo << 32) | l as u128;
            hi = (hi << 32) | h as u128;
        }
        lo..=hi
    }

    /// The four spec letters, as stored in the index file header.
    pub fn tag(&self) -> [u8; 4] {
        self.order.map(|pos| Self::LETTERS[pos] as u8)
    }

    pub fn file_name(&self) -> String {
        format!("triples-{self}.dat")
    }

    /// Recognize `triples-<spec>.dat`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let spec = name.strip_prefix("triples-")?.strip_suffix(".dat")?;
        if spec.len() != 4 {
            return None;
        }
        Self::parse(spec).ok()
    }
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pos in self.order {
            write!(f, "{}", Self::LETTERS[pos])?;
        }
        Ok(())
    }
}

/// An ordered index stored as a paged B+tree in `triples-<spec>.dat`.
pub struct TripleIndex {
    spec: IndexSpec,
    path: PathBuf,
    tree: BTree,
    sync: SyncMode,
}

impl TripleIndex {
    /// Open (or create empty) the index file for `spec` in `dir`.
    pub fn open(dir: &Path, spec: IndexSpec, sync: SyncMode) -> Result<Self> {
        let path = dir.join(spec.file_name());
        let tree = BTree::open(&path, MAGIC, spec.tag(), sync, CACHE_PAGES)?;
        debug!("Opened index {spec} with {} records", tree.len());
        Ok(Self {
            spec,
            path,
            tree,
            sync,
        })
    }

    /// Write a fresh index for `spec` holding `records`, replacing any file
    /// already present.
    pub fn create_from<I>(dir: &Path, spec: IndexSpec, records: I, sync: SyncMode) -> Result<Self>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut entries: Vec<(u128, u8)> = records
            .into_iter()
            .map(|r| (spec.key(&r.quad), r.flags))
            .collect();
        entries.sort_unstable_by_key(|(k, _)| *k);
        entries.dedup_by_key(|(k, _)| *k);
        let path = dir.join(spec.file_name());
        let tree = rebuild(&path, spec, sync, entries.into_iter().map(Ok))?;
        info!("Built index {spec} with {} records", tree.len());
        Ok(Self {
            spec,
            path,
            tree,
            sync,
        })
    }

    pub fn spec(&self) -> IndexSpec {
        self.spec
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.tree.len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn page_count(&self) -> u32 {
        self.tree.page_count()
    }

    /// Pages of this index read from disk so far.
    pub fn disk_reads(&self) -> u64 {
        self.tree.disk_reads()
    }

    /// Flags of the record for `quad`, if stored.
    pub fn get(&self, quad: &Quad) -> Result<Option<u8>> {
        self.tree.get(self.spec.key(quad))
    }

    /// Store `flags` for `quad`; returns the previous flags.
    pub fn put(&mut self, quad: &Quad, flags: u8) -> Result<Option<u8>> {
        let key = self.spec.key(quad);
        let prev = self.tree.get(key)?;
        if prev == Some(flags) {
            return Ok(prev);
        }
        self.tree.insert(key, flags)
    }

    /// Remove the record for `quad`; returns its flags if it was stored.
    pub fn remove(&mut self, quad: &Quad) -> Result<Option<u8>> {
        self.tree.remove(self.spec.key(quad))
    }

    /// Raw ordered entries in the key range, read page by page.
    pub fn range(&self, range: RangeInclusive<u128>) -> btree::Range<'_> {
        self.tree.range(range)
    }

    /// Every record in this index's order.
    pub fn records(&self) -> impl Iterator<Item = Result<Record>> + '_ {
        let spec = self.spec;
        self.tree.range(0..=u128::MAX).map(move |e| {
            e.map(|(k, flags)| Record {
                quad: spec.quad(k),
                flags,
            })
        })
    }

    /// Make the changes since the last flush durable as one step.
    pub fn flush(&mut self) -> Result<()> {
        self.tree.commit()
    }

    /// True once most pages hold no records, after many removals.
    pub fn needs_compaction(&self) -> bool {
        let pages = u64::from(self.tree.page_count());
        let needed = self.tree.len() / LEAF_CAPACITY as u64 + 1;
        pages >= COMPACT_MIN_PAGES && pages > needed * COMPACT_FACTOR
    }

    /// Rewrite the index as a packed tree.
    pub fn compact(&mut self) -> Result<()> {
        self.tree.commit()?;
        let before = self.tree.page_count();
        let tmp = tmp_path(&self.path);
        let mut built = BTree::build(
            &tmp,
            MAGIC,
            self.spec.tag(),
            self.sync,
            0,
            self.tree.range(0..=u128::MAX),
        )?;
        built.close()?;
        drop(built);
        PageFile::remove(&self.path)?;
        fs::rename(&tmp, &self.path)?;
        self.tree = BTree::open(&self.path, MAGIC, self.spec.tag(), self.sync, CACHE_PAGES)?;
        info!(
            "Compacted index {} from {before} to {} pages",
            self.spec,
            self.tree.page_count()
        );
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.tree.close()
    }

    /// Close and delete the index file.
    pub fn delete(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        PageFile::remove(&path)?;
        info!("Deleted index file {}", path.display());
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("dat.tmp")
}

/// Build the tree for `spec` under a temporary name and move it to `path`.
fn rebuild<I>(path: &Path, spec: IndexSpec, sync: SyncMode, entries: I) -> Result<BTree>
where
    I: IntoIterator<Item = Result<(u128, u8)>>,
{
    let tmp = tmp_path(path);
    let mut built = BTree::build(&tmp, MAGIC, spec.tag(), sync, 0, entries)?;
    built.close()?;
    drop(built);
    PageFile::remove(path)?;
    fs::rename(&tmp, path)?;
    BTree::open(path, MAGIC, spec.tag(), sync, CACHE_PAGES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_list_is_case_insensitive_and_deduplicates() {
        let specs = IndexSpec::parse_list("SPOC, posc  spoc").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(IndexSpec::join(&specs), "spoc,posc");
        assert!(IndexSpec::parse_list("spo").is_err());
        assert!(IndexSpec::parse_list("spox").is_err());
        assert!(IndexSpec::parse_list("sspo").is_err());
        assert!(IndexSpec::parse_list(" , ").is_err());
    }

    #[test]
    fn key_order_follows_spec() {
        let posc = IndexSpec::parse("posc").unwrap();
        let quad = [1, 2, 3, 4];
        let key = posc.key(&quad);
        assert_eq!(posc.quad(key), quad);
        assert_eq!((key >> 96) as u32, 2);
        assert_eq!(key as u32, 4);
    }

    #[test]
    fn prefix_and_range_cover_bound_fields() {
        let spoc = IndexSpec::parse("spoc").unwrap();
        let pattern = [Some(7), None, Some(9), None];
        assert_eq!(spoc.prefix_len(&pattern), 1);
        let r = spoc.range(&pattern);
        assert_eq!(spoc.quad(*r.start()), [7, 0, 0, 0]);
        assert_eq!(spoc.quad(*r.end()), [7, u32::MAX, u32::MAX, u32::MAX]);
        let ospc = IndexSpec::parse("ospc").unwrap();
        assert_eq!(ospc.prefix_len(&pattern), 2);
    }

    #[test]
    fn file_names_round_trip() {
        let spec = IndexSpec::parse("cspo").unwrap();
        assert_eq!(spec.file_name(), "triples-cspo.dat");
        assert_eq!(IndexSpec::from_file_name("triples-cspo.dat"), Some(spec));
        assert_eq!(IndexSpec::from_file_name("triples-cspo.dat.tmp"), None);
        assert_eq!(IndexSpec::from_file_name("values.dat"), None);
    }

    #[test]
    fn records_persist_in_key_order() {
        let dir = tempdir().unwrap();
        let spec = IndexSpec::parse("spoc").unwrap();
        {
            let mut idx = TripleIndex::open(dir.path(), spec, SyncMode::Flush).unwrap();
            idx.put(&[26, 1, 1, 0], FLAG_EXPLICIT).unwrap();
            idx.put(&[1, 2, 3, 0], FLAG_EXPLICIT).unwrap();
            idx.put(&[1, 2, 4, 0], 0).unwrap();
            idx.put(&[1, 2, 4, 0], FLAG_EXPLICIT).unwrap();
            idx.remove(&[26, 1, 1, 0]).unwrap();
            idx.put(&[26, 1, 1, 0], FLAG_EXPLICIT).unwrap();
            idx.remove(&[1, 2, 3, 0]).unwrap();
            idx.close().unwrap();
        }
        let idx = TripleIndex::open(dir.path(), spec, SyncMode::Flush).unwrap();
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.get(&[1, 2, 4, 0]).unwrap(), Some(FLAG_EXPLICIT));
        assert_eq!(idx.get(&[1, 2, 3, 0]).unwrap(), None);
        let subjects: Vec<u32> = idx.records().map(|r| r.unwrap().subject()).collect();
        assert_eq!(subjects, vec![1, 26]);

        // the leaf on disk lists its keys in spoc order
        let data = fs::read(dir.path().join(spec.file_name())).unwrap();
        let leaf = &data[4096..];
        let first = &leaf[8 + 6..8 + 6 + 16];
        let second = &leaf[8 + 6 + 17..8 + 6 + 17 + 16];
        assert_eq!(u128::from_be_bytes(first.try_into().unwrap()), spec.key(&[1, 2, 4, 0]));
        assert_eq!(u128::from_be_bytes(second.try_into().unwrap()), spec.key(&[26, 1, 1, 0]));
    }

    #[test]
    fn header_names_the_index() {
        let dir = tempdir().unwrap();
        let spoc = IndexSpec::parse("spoc").unwrap();
        assert_eq!(&spoc.tag(), b"spoc");
        TripleIndex::open(dir.path(), spoc, SyncMode::Flush)
            .unwrap()
            .close()
            .unwrap();
        // a file renamed to another index is not accepted as that index
        fs::rename(
            dir.path().join("triples-spoc.dat"),
            dir.path().join("triples-posc.dat"),
        )
        .unwrap();
        let posc = IndexSpec::parse("posc").unwrap();
        assert!(matches!(
            TripleIndex::open(dir.path(), posc, SyncMode::Flush),
            Err(StoreError::Corruption(_))
        ));
    }

    #[test]
    fn compaction_shrinks_a_sparse_index() {
        let dir = tempdir().unwrap();
        let spec = IndexSpec::parse("posc").unwrap();
        let mut idx = TripleIndex::open(dir.path(), spec, SyncMode::Flush).unwrap();
        for i in 1..=20_000 {
            idx.put(&[i, 1, 1, 0], FLAG_EXPLICIT).unwrap();
        }
        idx.flush().unwrap();
        for i in 11..=20_000 {
            idx.remove(&[i, 1, 1, 0]).unwrap();
        }
        idx.flush().unwrap();
        assert!(idx.needs_compaction());
        idx.compact().unwrap();
        assert!(!idx.needs_compaction());
        // header, one leaf
        assert_eq!(idx.page_count(), 2);
        idx.close().unwrap();

        let idx = TripleIndex::open(dir.path(), spec, SyncMode::Flush).unwrap();
        let subjects: Vec<u32> = idx.records().map(|r| r.unwrap().subject()).collect();
        assert_eq!(subjects, (1..=10).collect::<Vec<_>>());
        assert!(!dir.path().join("triples-posc.dat.tmp").exists());
    }
}
