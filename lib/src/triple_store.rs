//! The set of configured indexes, kept identical to each other, plus their
//! metadata file and the recovery performed when they are opened.

use crate::error::{Result, StoreError};
use crate::index::{matches, IdPattern, IndexSpec, Quad, Record, TripleIndex, FLAG_EXPLICIT};
use crate::journal;
use crate::options::SyncMode;
use crate::term::ValueId;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const META_FILE: &str = "triples.json";
const META_VERSION: u32 = 1;

/// Matching records buffered per cursor refill.
const CURSOR_BATCH: usize = 256;
/// Entries examined per refill before the index lock is given back.
const CURSOR_SCAN_LIMIT: usize = 4096;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct TripleMeta {
    version: u32,
    triple_indexes: String,
}

/// One batch of index changes: removals are applied before insertions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Mutations {
    pub removes: Vec<Quad>,
    pub inserts: Vec<Record>,
}

impl Mutations {
    pub fn is_empty(&self) -> bool {
        self.removes.is_empty() && self.inserts.is_empty()
    }
}

/// Records that a batch actually added or removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub added: Vec<Record>,
    pub removed: Vec<Record>,
}

fn read_meta(dir: &Path) -> Option<TripleMeta> {
    let path = dir.join(META_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(_) => return None,
    };
    match serde_json::from_str::<TripleMeta>(&text) {
        Ok(meta) if meta.version == META_VERSION => Some(meta),
        Ok(meta) => {
            warn!("Ignoring triple metadata with version {}", meta.version);
            None
        }
        Err(e) => {
            warn!("Ignoring unreadable {}: {e}", path.display());
            None
        }
    }
}

/// Index list recorded by the last open of the store in `dir`, if readable.
pub fn stored_indexes(dir: &Path) -> Option<String> {
    read_meta(dir).map(|m| m.triple_indexes)
}

fn write_meta(dir: &Path, meta: &TripleMeta) -> Result<()> {
    let path = dir.join(META_FILE);
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(meta)?)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Open every `triples-????.dat` file in `dir`.
fn discover(dir: &Path, sync: SyncMode) -> Result<Vec<TripleIndex>> {
    let mut specs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(spec) = IndexSpec::from_file_name(name) {
            specs.push(spec);
        } else if name.starts_with("triples-") && name.ends_with(".tmp") {
            debug!("Removing leftover {name}");
            fs::remove_file(entry.path())?;
        }
    }
    specs.sort_by_key(|s| s.to_string());
    specs
        .into_iter()
        .map(|spec| TripleIndex::open(dir, spec, sync))
        .collect()
}

/// Index whose key order covers the longest bound prefix; ties go to the
/// first configured.
fn best_index(indexes: &[TripleIndex], pattern: &IdPattern) -> usize {
    let mut best = 0;
    let mut best_len = 0;
    for (i, idx) in indexes.iter().enumerate() {
        let len = idx.spec().prefix_len(pattern);
        if len > best_len {
            best = i;
            best_len = len;
        }
    }
    best
}

fn count_matching(idx: &TripleIndex, pattern: &IdPattern, explicit_only: bool) -> Result<usize> {
    let spec = idx.spec();
    let mut n = 0;
    for entry in idx.range(spec.range(pattern)) {
        let (key, flags) = entry?;
        if (!explicit_only || flags & FLAG_EXPLICIT != 0) && matches(pattern, &spec.quad(key)) {
            n += 1;
        }
    }
    Ok(n)
}

fn apply_batch(indexes: &mut [TripleIndex], m: &Mutations) -> Result<ApplyOutcome> {
    let mut outcome = ApplyOutcome::default();
    for quad in &m.removes {
        let mut prev = None;
        for (i, idx) in indexes.iter_mut().enumerate() {
            let p = idx.remove(quad)?;
            if i == 0 {
                prev = p;
            }
        }
        if let Some(flags) = prev {
            outcome.removed.push(Record { quad: *quad, flags });
        }
    }
    for rec in &m.inserts {
        let prev = match indexes.first() {
            Some(idx) => idx.get(&rec.quad)?,
            None => None,
        };
        // explicit wins over inferred
        let flags = prev.unwrap_or(0) | rec.flags;
        for idx in indexes.iter_mut() {
            idx.put(&rec.quad, flags)?;
        }
        if prev.is_none() {
            outcome.added.push(Record {
                quad: rec.quad,
                flags,
            });
        }
    }
    Ok(outcome)
}

/// All configured indexes over the same record set.
pub struct TripleStore {
    dir: PathBuf,
    indexes: RwLock<Vec<TripleIndex>>,
    failed: AtomicBool,
}

impl TripleStore {
    /// Open the indexes named by `specs`, building, dropping or repairing
    /// index files as needed, and replay an interrupted batch.
    pub fn open(dir: &Path, specs: &[IndexSpec], sync: SyncMode) -> Result<Self> {
        if specs.is_empty() {
            return Err(StoreError::Configuration(
                "at least one triple index must be configured".into(),
            ));
        }
        let meta = read_meta(dir);
        let mut found: Vec<Option<TripleIndex>> =
            discover(dir, sync)?.into_iter().map(Some).collect();
        let found_specs: Vec<IndexSpec> = found.iter().flatten().map(|i| i.spec()).collect();

        let previous = meta
            .as_ref()
            .and_then(|m| IndexSpec::parse_list(&m.triple_indexes).ok())
            .unwrap_or_default();
        let trusted: Vec<IndexSpec> = found_specs
            .iter()
            .copied()
            .filter(|s| previous.contains(s))
            .collect();
        let candidates = if trusted.is_empty() {
            if !found_specs.is_empty() {
                warn!(
                    "Triple metadata missing or stale in {}; re-deriving indexes from surviving files",
                    dir.display()
                );
            }
            found_specs.clone()
        } else {
            trusted.clone()
        };
        let source = found
            .iter()
            .flatten()
            .filter(|i| candidates.contains(&i.spec()))
            .fold(None::<&TripleIndex>, |best, i| match best {
                Some(b) if b.len() >= i.len() => Some(b),
                _ => Some(i),
            })
            .map(|i| i.spec());
        let keep = |spec: &IndexSpec| {
            found_specs.contains(spec)
                && if trusted.is_empty() {
                    source == Some(*spec)
                } else {
                    trusted.contains(spec)
                }
        };

        let seed: Vec<Record> = if specs.iter().all(|s| keep(s)) {
            Vec::new()
        } else {
            found
                .iter()
                .flatten()
                .find(|i| Some(i.spec()) == source)
                .map(|i| i.records().collect::<Result<Vec<_>>>())
                .transpose()?
                .unwrap_or_default()
        };

        let mut indexes = Vec::with_capacity(specs.len());
        for spec in specs {
            let pos = found_specs.iter().position(|s| s == spec);
            let old = pos.and_then(|p| found[p].take());
            match old {
                Some(idx) if keep(spec) => indexes.push(idx),
                old => {
                    drop(old);
                    indexes.push(TripleIndex::create_from(dir, *spec, seed.iter().copied(), sync)?);
                }
            }
        }
        for stale in found.into_iter().flatten() {
            info!("Dropping index {} that is no longer configured", stale.spec());
            stale.delete()?;
        }

        let new_meta = TripleMeta {
            version: META_VERSION,
            triple_indexes: IndexSpec::join(specs),
        };
        if meta.as_ref() != Some(&new_meta) {
            write_meta(dir, &new_meta)?;
        }

        if let Some(batch) = journal::read(dir)? {
            info!(
                "Replaying interrupted transaction ({} removals, {} insertions)",
                batch.removes.len(),
                batch.inserts.len()
            );
            apply_batch(&mut indexes, &batch)?;
            for idx in indexes.iter_mut() {
                idx.flush()?;
            }
            journal::clear(dir)?;
        }

        let primary_len = indexes[0].len();
        for i in 1..indexes.len() {
            if indexes[i].len() != primary_len {
                warn!(
                    "Index {} holds {} records but {} holds {}; rebuilding it",
                    indexes[i].spec(),
                    indexes[i].len(),
                    indexes[0].spec(),
                    primary_len
                );
                let records = indexes[0].records().collect::<Result<Vec<Record>>>()?;
                let spec = indexes[i].spec();
                indexes[i] = TripleIndex::create_from(dir, spec, records, sync)?;
            }
        }
        for idx in indexes.iter_mut() {
            if idx.needs_compaction() {
                idx.compact()?;
            }
        }
        info!(
            "Opened triple store with indexes {} ({} records)",
            IndexSpec::join(specs),
            primary_len
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            indexes: RwLock::new(indexes),
            failed: AtomicBool::new(false),
        })
    }

    fn ensure_ok(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(StoreError::corrupt(
                "triple store failed during a previous update; reopen the store to recover",
            ));
        }
        Ok(())
    }

    fn read_indexes(&self) -> Result<RwLockReadGuard<'_, Vec<TripleIndex>>> {
        self.ensure_ok()?;
        let guard = self
            .indexes
            .read()
            .map_err(|_| StoreError::IllegalState("triple index lock poisoned".into()))?;
        if guard.is_empty() {
            return Err(StoreError::IllegalState("triple store is closed".into()));
        }
        Ok(guard)
    }

    fn write_indexes(&self) -> Result<RwLockWriteGuard<'_, Vec<TripleIndex>>> {
        self.ensure_ok()?;
        let guard = self
            .indexes
            .write()
            .map_err(|_| StoreError::IllegalState("triple index lock poisoned".into()))?;
        if guard.is_empty() {
            return Err(StoreError::IllegalState("triple store is closed".into()));
        }
        Ok(guard)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn specs(&self) -> Result<Vec<IndexSpec>> {
        Ok(self.read_indexes()?.iter().map(|i| i.spec()).collect())
    }

    /// Record count per index, in configuration order.
    pub fn index_stats(&self) -> Result<Vec<(IndexSpec, usize)>> {
        Ok(self
            .read_indexes()?
            .iter()
            .map(|i| (i.spec(), i.len()))
            .collect())
    }

    /// Index pages read from disk so far, summed over all indexes.
    pub fn disk_reads(&self) -> Result<u64> {
        Ok(self.read_indexes()?.iter().map(|i| i.disk_reads()).sum())
    }

    /// Flags of the stored record for `quad`.
    pub fn get(&self, quad: &Quad) -> Result<Option<u8>> {
        self.read_indexes()?[0].get(quad)
    }

    /// Lazy scan of the records matching `pattern`, in the chosen index's
    /// order.
    pub fn scan(self: &Arc<Self>, pattern: IdPattern, explicit_only: bool) -> Result<RecordCursor> {
        let indexes = self.read_indexes()?;
        let index = best_index(&indexes, &pattern);
        let spec = indexes[index].spec();
        let range = spec.range(&pattern);
        debug!(
            "Scanning index {spec} with {} bound prefix fields",
            spec.prefix_len(&pattern)
        );
        Ok(RecordCursor {
            store: Arc::clone(self),
            index,
            spec,
            next: Some(*range.start()),
            end: *range.end(),
            pattern,
            explicit_only,
            buf: VecDeque::new(),
        })
    }

    /// Apply a batch to every index. The batch is journaled first; if
    /// applying it fails the store refuses further work until reopened.
    pub fn apply(&self, m: &Mutations) -> Result<ApplyOutcome> {
        if m.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        let mut indexes = self.write_indexes()?;
        let result = self.apply_locked(&mut indexes, m);
        if let Err(e) = &result {
            self.failed.store(true, Ordering::Release);
            error!("Failed to apply transaction to the triple indexes: {e}");
        }
        result
    }

    fn apply_locked(&self, indexes: &mut [TripleIndex], m: &Mutations) -> Result<ApplyOutcome> {
        journal::write(&self.dir, m)?;
        let outcome = apply_batch(indexes, m)?;
        for idx in indexes.iter_mut() {
            idx.flush()?;
        }
        journal::clear(&self.dir)?;
        for idx in indexes.iter_mut() {
            if idx.needs_compaction() {
                idx.compact()?;
            }
        }
        debug!(
            "Applied batch: {} added, {} removed",
            outcome.added.len(),
            outcome.removed.len()
        );
        Ok(outcome)
    }

    /// Distinct non-default contexts, ascending by id.
    pub fn context_ids(&self) -> Result<Vec<ValueId>> {
        let indexes = self.read_indexes()?;
        if let Some(idx) = indexes.iter().find(|i| i.spec().leads_with_context()) {
            let mut out = Vec::new();
            let mut lo = 1u128 << 96;
            while let Some((key, _)) = idx.range(lo..=u128::MAX).next().transpose()? {
                let ctx = (key >> 96) as ValueId;
                out.push(ctx);
                if ctx == ValueId::MAX {
                    break;
                }
                lo = (ctx as u128 + 1) << 96;
            }
            return Ok(out);
        }
        let mut set = BTreeSet::new();
        for record in indexes[0].records() {
            let ctx = record?.context();
            if ctx != 0 {
                set.insert(ctx);
            }
        }
        Ok(set.into_iter().collect())
    }

    /// Number of records, optionally restricted to the given contexts.
    pub fn size(&self, contexts: Option<&[ValueId]>, explicit_only: bool) -> Result<usize> {
        let indexes = self.read_indexes()?;
        match contexts {
            None if !explicit_only => Ok(indexes[0].len()),
            None => count_matching(&indexes[0], &[None; 4], true),
            Some(ctxs) => {
                let unique: BTreeSet<ValueId> = ctxs.iter().copied().collect();
                let mut total = 0;
                for c in unique {
                    let pattern = [None, None, None, Some(c)];
                    total += count_matching(
                        &indexes[best_index(&indexes, &pattern)],
                        &pattern,
                        explicit_only,
                    )?;
                }
                Ok(total)
            }
        }
    }

    /// Records in the key range the chosen index would scan for `pattern`.
    /// Exact when the bound components form a prefix of that index.
    pub fn cardinality(&self, pattern: &IdPattern) -> Result<usize> {
        let indexes = self.read_indexes()?;
        let idx = &indexes[best_index(&indexes, pattern)];
        let mut n = 0;
        for entry in idx.range(idx.spec().range(pattern)) {
            entry?;
            n += 1;
        }
        Ok(n)
    }

    /// Compare every index against the first one.
    pub fn verify(&self) -> Result<usize> {
        let indexes = self.read_indexes()?;
        let primary = &indexes[0];
        for idx in &indexes[1..] {
            if idx.len() != primary.len() {
                return Err(StoreError::corrupt(format!(
                    "index {} holds {} records but {} holds {}",
                    idx.spec(),
                    idx.len(),
                    primary.spec(),
                    primary.len()
                )));
            }
            for r in primary.records() {
                let r = r?;
                if idx.get(&r.quad)? != Some(r.flags) {
                    return Err(StoreError::corrupt(format!(
                        "index {} diverges from {} at record {:?}",
                        idx.spec(),
                        primary.spec(),
                        r.quad
                    )));
                }
            }
        }
        Ok(primary.len())
    }

    /// Flush and sync every index file.
    pub fn close(&self) -> Result<()> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| StoreError::IllegalState("triple index lock poisoned".into()))?;
        for idx in indexes.iter_mut() {
            idx.flush()?;
        }
        for idx in indexes.drain(..) {
            idx.close()?;
        }
        debug!("Closed triple store {}", self.dir.display());
        Ok(())
    }
}

/// Forward-only cursor over raw records of one index. Records are read in
/// batches; each refill resumes after the last key examined.
pub struct RecordCursor {
    store: Arc<TripleStore>,
    index: usize,
    spec: IndexSpec,
    next: Option<u128>,
    end: u128,
    pattern: IdPattern,
    explicit_only: bool,
    buf: VecDeque<Record>,
}

impl RecordCursor {
    pub fn spec(&self) -> IndexSpec {
        self.spec
    }

    fn refill(&mut self) -> Result<()> {
        let Some(start) = self.next.take() else {
            return Ok(());
        };
        let indexes = self.store.read_indexes()?;
        let idx = indexes
            .get(self.index)
            .ok_or_else(|| StoreError::IllegalState("triple store was closed".into()))?;
        let mut scanned = 0;
        let mut stopped_at = None;
        for entry in idx.range(start..=self.end) {
            let (key, flags) = entry?;
            scanned += 1;
            if !self.explicit_only || flags & FLAG_EXPLICIT != 0 {
                let quad = self.spec.quad(key);
                if matches(&self.pattern, &quad) {
                    self.buf.push_back(Record { quad, flags });
                }
            }
            if self.buf.len() >= CURSOR_BATCH || scanned >= CURSOR_SCAN_LIMIT {
                stopped_at = Some(key);
                break;
            }
        }
        self.next = stopped_at.filter(|k| *k < self.end).map(|k| k + 1);
        Ok(())
    }

    /// Next matching record, or `None` once the range is exhausted.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        while self.buf.is_empty() && self.next.is_some() {
            self.refill()?;
        }
        Ok(self.buf.pop_front())
    }

    pub fn close(&mut self) {
        self.next = None;
        self.buf.clear();
    }
}

impl Iterator for RecordCursor {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(r)) => Some(Ok(r)),
            Ok(None) => None,
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn specs(s: &str) -> Vec<IndexSpec> {
        IndexSpec::parse_list(s).unwrap()
    }

    fn insert(quads: &[Quad]) -> Mutations {
        Mutations {
            removes: vec![],
            inserts: quads.iter().map(|q| Record::new(*q, true)).collect(),
        }
    }

    #[test]
    fn scan_picks_longest_prefix_and_filters_the_rest() {
        let dir = tempdir().unwrap();
        let store =
            Arc::new(TripleStore::open(dir.path(), &specs("spoc,posc"), SyncMode::Flush).unwrap());
        store
            .apply(&insert(&[[1, 10, 100, 0], [2, 10, 101, 0], [2, 11, 100, 5]]))
            .unwrap();

        let cursor = store.scan([None, Some(10), None, None], false).unwrap();
        assert_eq!(cursor.spec().to_string(), "posc");
        let got: Vec<Quad> = cursor.map(|r| r.unwrap().quad).collect();
        assert_eq!(got, vec![[1, 10, 100, 0], [2, 10, 101, 0]]);

        let cursor = store.scan([Some(2), None, Some(100), None], false).unwrap();
        assert_eq!(cursor.spec().to_string(), "spoc");
        let got: Vec<Quad> = cursor.map(|r| r.unwrap().quad).collect();
        assert_eq!(got, vec![[2, 11, 100, 5]]);

        // no bound prefix anywhere: first configured index
        let cursor = store.scan([None, None, None, Some(5)], false).unwrap();
        assert_eq!(cursor.spec().to_string(), "spoc");
    }

    #[test]
    fn cursor_resumes_across_batches() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TripleStore::open(dir.path(), &specs("spoc"), SyncMode::Flush).unwrap());
        let quads: Vec<Quad> = (1..=1000).map(|i| [7, 1, i, 0]).collect();
        store.apply(&insert(&quads)).unwrap();
        let got: Vec<Quad> = store
            .scan([Some(7), None, None, None], false)
            .unwrap()
            .map(|r| r.unwrap().quad)
            .collect();
        assert_eq!(got, quads);
    }

    #[test]
    fn cursor_reads_index_pages_on_demand() {
        let dir = tempdir().unwrap();
        let quads: Vec<Quad> = (1..=20_000).map(|i| [7, 1, i, 0]).collect();
        {
            let store = TripleStore::open(dir.path(), &specs("spoc"), SyncMode::Flush).unwrap();
            store.apply(&insert(&quads)).unwrap();
            store.close().unwrap();
        }
        let store = Arc::new(TripleStore::open(dir.path(), &specs("spoc"), SyncMode::Flush).unwrap());
        let before = store.disk_reads().unwrap();
        let mut cursor = store.scan([Some(7), None, None, None], false).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().quad, [7, 1, 1, 0]);
        let first_batch = store.disk_reads().unwrap() - before;
        assert!(first_batch < 8, "first batch read {first_batch} pages");

        assert_eq!(cursor.count(), 19_999);
        assert!(store.disk_reads().unwrap() - before > 50);
    }

    #[test]
    fn inferred_flags_merge_and_filter() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TripleStore::open(dir.path(), &specs("spoc"), SyncMode::Flush).unwrap());
        let out = store
            .apply(&Mutations {
                removes: vec![],
                inserts: vec![Record::new([1, 1, 1, 0], false), Record::new([1, 1, 2, 0], false)],
            })
            .unwrap();
        assert_eq!(out.added.len(), 2);
        // explicit over inferred upgrades without a new addition
        let out = store.apply(&insert(&[[1, 1, 1, 0]])).unwrap();
        assert!(out.added.is_empty());
        assert_eq!(store.size(None, true).unwrap(), 1);
        assert_eq!(store.size(None, false).unwrap(), 2);
        let explicit: Vec<Quad> = store
            .scan([None; 4], true)
            .unwrap()
            .map(|r| r.unwrap().quad)
            .collect();
        assert_eq!(explicit, vec![[1, 1, 1, 0]]);
    }

    #[test]
    fn context_ids_skip_scan_matches_full_scan() {
        let dir = tempdir().unwrap();
        let quads = [[1, 1, 1, 0], [1, 1, 1, 3], [2, 1, 1, 3], [1, 2, 1, 9]];
        let a = tempdir().unwrap();
        let with_c = TripleStore::open(a.path(), &specs("spoc,cspo"), SyncMode::Flush).unwrap();
        with_c.apply(&insert(&quads)).unwrap();
        let without_c = TripleStore::open(dir.path(), &specs("spoc"), SyncMode::Flush).unwrap();
        without_c.apply(&insert(&quads)).unwrap();
        assert_eq!(with_c.context_ids().unwrap(), vec![3, 9]);
        assert_eq!(without_c.context_ids().unwrap(), vec![3, 9]);
        assert_eq!(with_c.size(Some(&[3, 3, 0]), false).unwrap(), 3);
        assert_eq!(with_c.cardinality(&[None, None, None, Some(3)]).unwrap(), 2);
    }

    #[test]
    fn interrupted_batch_is_replayed_on_open() {
        let dir = tempdir().unwrap();
        {
            let store = TripleStore::open(dir.path(), &specs("spoc,posc"), SyncMode::Flush).unwrap();
            store.apply(&insert(&[[1, 1, 1, 0]])).unwrap();
            store.close().unwrap();
        }
        // a journal that was written but never applied
        let pending = Mutations {
            removes: vec![[1, 1, 1, 0]],
            inserts: vec![Record::new([2, 2, 2, 0], true)],
        };
        journal::write(dir.path(), &pending).unwrap();

        let store = TripleStore::open(dir.path(), &specs("spoc,posc"), SyncMode::Flush).unwrap();
        assert_eq!(store.verify().unwrap(), 1);
        assert_eq!(store.cardinality(&[Some(2), None, None, None]).unwrap(), 1);
        assert!(!journal::journal_path(dir.path()).exists());
    }

    #[test]
    fn missing_metadata_rederives_from_largest_index() {
        let dir = tempdir().unwrap();
        {
            let store = TripleStore::open(dir.path(), &specs("spoc,posc"), SyncMode::Flush).unwrap();
            store.apply(&insert(&[[1, 1, 1, 0], [2, 2, 2, 0]])).unwrap();
            store.close().unwrap();
        }
        assert_eq!(stored_indexes(dir.path()).as_deref(), Some("spoc,posc"));
        fs::remove_file(dir.path().join(META_FILE)).unwrap();
        assert_eq!(stored_indexes(dir.path()), None);
        // damage one index so the other is the larger survivor
        fs::remove_file(dir.path().join("triples-posc.dat")).unwrap();
        let store = TripleStore::open(dir.path(), &specs("spoc,posc"), SyncMode::Flush).unwrap();
        assert_eq!(store.verify().unwrap(), 2);
        assert!(dir.path().join(META_FILE).exists());
    }

    #[test]
    fn reconfiguration_builds_new_and_drops_old_indexes() {
        let dir = tempdir().unwrap();
        {
            let store = TripleStore::open(dir.path(), &specs("spoc"), SyncMode::Flush).unwrap();
            store.apply(&insert(&[[1, 2, 3, 4], [5, 6, 7, 0]])).unwrap();
            store.close().unwrap();
        }
        let store = TripleStore::open(dir.path(), &specs("posc,cspo"), SyncMode::Flush).unwrap();
        assert_eq!(store.verify().unwrap(), 2);
        assert!(!dir.path().join("triples-spoc.dat").exists());
        assert!(dir.path().join("triples-cspo.dat").exists());
        let meta = fs::read_to_string(dir.path().join(META_FILE)).unwrap();
        assert!(meta.contains("posc,cspo"));
    }

    #[test]
    fn divergent_secondary_is_rebuilt_from_primary() {
        let dir = tempdir().unwrap();
        {
            let store = TripleStore::open(dir.path(), &specs("spoc,posc"), SyncMode::Flush).unwrap();
            store.apply(&insert(&[[1, 1, 1, 0], [2, 2, 2, 0]])).unwrap();
            store.close().unwrap();
        }
        // simulate a secondary that missed the last batch
        {
            let mut posc =
                TripleIndex::open(dir.path(), IndexSpec::parse("posc").unwrap(), SyncMode::Flush)
                    .unwrap();
            posc.remove(&[2, 2, 2, 0]).unwrap();
            posc.close().unwrap();
        }
        let store = TripleStore::open(dir.path(), &specs("spoc,posc"), SyncMode::Flush).unwrap();
        assert_eq!(store.verify().unwrap(), 2);
    }
}
