//! Persistent bijection between RDF terms and numeric ids.
//!
//! The dictionary lives in three files:
//!
//! * `values.dat`: an 8-byte header (`NSVD` + version), then records
//!   `id u32 | len u32 | bytes | crc32 u32` appended in id order.
//! * `values.id`: an `NSVI` header, then the `u64` offset of each id's record.
//! * `values.hash`: a B+tree keyed by the first 96 bits of the blake3 digest
//!   of a value's bytes with its id in the low 32 bits. Every candidate found
//!   there is checked against the stored bytes.
//!
//! Values registered since the last sync stay in memory. A sync writes
//! `values.dat` first, then `values.id`, then commits the hash tree, so on
//! open the two derived files can always be brought up to date from the data.

use crate::btree::BTree;
use crate::cache::BoundedCache;
use crate::codec::{crc32_ieee, get_u32, put_str, put_u32, ByteReader};
use crate::error::{Result, StoreError};
use crate::options::SyncMode;
use crate::page::PageFile;
use crate::term::{LiteralKind, Term, ValueId, NULL_ID};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const VALUES_FILE: &str = "values.dat";
pub const IDS_FILE: &str = "values.id";
pub const HASH_FILE: &str = "values.hash";

const DATA_MAGIC: &[u8; 4] = b"NSVD";
const IDS_MAGIC: &[u8; 4] = b"NSVI";
const HASH_MAGIC: [u8; 4] = *b"NSVH";
const HASH_TAG: [u8; 4] = *b"hash";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;
const RECORD_OVERHEAD: u64 = 12;
const OFFSET_LEN: u64 = 8;
const HASH_CACHE_PAGES: usize = 128;
/// Unwritten record bytes that make a registration write them out early.
const WRITE_THRESHOLD: usize = 1 << 20;
/// Hash entries added between commits while catching up on open.
const REINDEX_BATCH: ValueId = 10_000;

const TAG_IRI: u8 = 0x01;
const TAG_BNODE: u8 = 0x02;
const TAG_PLAIN: u8 = 0x03;
const TAG_LANG: u8 = 0x04;
const TAG_TYPED: u8 = 0x05;

fn hash_key(bytes: &[u8], id: ValueId) -> u128 {
    let digest = blake3::hash(bytes);
    let mut key = [0u8; 16];
    key[..12].copy_from_slice(&digest.as_bytes()[..12]);
    u128::from_be_bytes(key) | u128::from(id)
}

/// Every hash key that `bytes` can have, whatever its id.
fn hash_range(bytes: &[u8]) -> RangeInclusive<u128> {
    let lo = hash_key(bytes, NULL_ID);
    lo..=lo | u128::from(ValueId::MAX)
}

fn encode_record(id: ValueId, bytes: &[u8]) -> Vec<u8> {
    let mut rec = Vec::with_capacity(bytes.len() + RECORD_OVERHEAD as usize);
    put_u32(&mut rec, id);
    put_u32(&mut rec, bytes.len() as u32);
    rec.extend_from_slice(bytes);
    let crc = crc32_ieee(&rec);
    put_u32(&mut rec, crc);
    rec
}

/// Read and check the record at `off`. `end` bounds the valid data.
fn read_record_at(file: &mut File, off: u64, end: u64) -> Result<(ValueId, Vec<u8>)> {
    if off < HEADER_LEN || off.saturating_add(8) > end {
        return Err(StoreError::corrupt(format!(
            "value record offset {off} lies outside the value file"
        )));
    }
    file.seek(SeekFrom::Start(off))?;
    let mut body = vec![0u8; 8];
    file.read_exact(&mut body)?;
    let id = get_u32(&body, 0).unwrap_or(NULL_ID);
    let len = u64::from(get_u32(&body, 4).unwrap_or(0));
    if off + 8 + len + 4 > end {
        return Err(StoreError::corrupt(format!(
            "value record {id} at offset {off} runs past the end of the value file"
        )));
    }
    body.resize(8 + len as usize + 4, 0);
    file.read_exact(&mut body[8..])?;
    let split = body.len() - 4;
    let stored = get_u32(&body, split).unwrap_or(0);
    if crc32_ieee(&body[..split]) != stored {
        return Err(StoreError::corrupt(format!(
            "checksum mismatch for value {id} at offset {off}"
        )));
    }
    body.truncate(split);
    body.drain(..8);
    Ok((id, body))
}

/// Open `path`, writing the `magic` header when the file is new. An existing
/// file must already carry it.
fn open_with_header(path: &Path, magic: &[u8; 4]) -> Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(magic);
        put_u32(&mut header, VERSION);
        file.write_all(&header)?;
        file.sync_all()?;
        return Ok(file);
    }
    let mut header = [0u8; HEADER_LEN as usize];
    if len < HEADER_LEN || file.read_exact(&mut header).is_err() || &header[..4] != magic {
        return Err(StoreError::corrupt(format!(
            "{} is not a value dictionary file",
            path.display()
        )));
    }
    let version = get_u32(&header, 4).unwrap_or(0);
    if version != VERSION {
        return Err(StoreError::corrupt(format!(
            "unsupported value dictionary version {version} in {}",
            path.display()
        )));
    }
    Ok(file)
}

struct Tables {
    data: File,
    ids: File,
    hash: BTree,
    /// Highest registered id.
    count: ValueId,
    /// Ids up to this one are in `values.dat` and `values.id`.
    written: ValueId,
    /// End of the written part of `values.dat`.
    data_end: u64,
    pending_data: Vec<u8>,
    pending_ids: Vec<u8>,
    unwritten: HashMap<ValueId, Box<[u8]>>,
}

impl Tables {
    fn offset_of(&mut self, id: ValueId) -> Result<u64> {
        self.ids
            .seek(SeekFrom::Start(HEADER_LEN + u64::from(id - 1) * OFFSET_LEN))?;
        let mut buf = [0u8; OFFSET_LEN as usize];
        self.ids.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn bytes_of(&mut self, id: ValueId) -> Result<Vec<u8>> {
        if id == NULL_ID || id > self.count {
            return Err(StoreError::corrupt(format!("unknown value id {id}")));
        }
        if id > self.written {
            return self.unwritten.get(&id).map(|b| b.to_vec()).ok_or_else(|| {
                StoreError::corrupt(format!("value {id} was lost before it was written"))
            });
        }
        let off = self.offset_of(id)?;
        let (found, bytes) = read_record_at(&mut self.data, off, self.data_end)?;
        if found != id {
            return Err(StoreError::corrupt(format!(
                "offset of value {id} points at value record {found}"
            )));
        }
        Ok(bytes)
    }

    fn find(&mut self, bytes: &[u8]) -> Result<Option<ValueId>> {
        let candidates = self
            .hash
            .range(hash_range(bytes))
            .map(|e| e.map(|(key, _)| key as ValueId))
            .collect::<Result<Vec<_>>>()?;
        for id in candidates {
            // entries past the last id belong to values lost before a crash
            if id == NULL_ID || id > self.count {
                continue;
            }
            if self.bytes_of(id)? == bytes {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    fn append(&mut self, bytes: Vec<u8>) -> Result<ValueId> {
        let id = self
            .count
            .checked_add(1)
            .ok_or_else(|| StoreError::IllegalState("value id space exhausted".into()))?;
        let off = self.data_end + self.pending_data.len() as u64;
        self.pending_data.extend_from_slice(&encode_record(id, &bytes));
        self.pending_ids.extend_from_slice(&off.to_be_bytes());
        self.hash.insert(hash_key(&bytes, id), 0)?;
        self.unwritten.insert(id, bytes.into_boxed_slice());
        self.count = id;
        if self.pending_data.len() >= WRITE_THRESHOLD {
            self.write_pending(false)?;
        }
        Ok(id)
    }

    /// Write unwritten records and their offsets, data first.
    fn write_pending(&mut self, force: bool) -> Result<()> {
        if self.pending_data.is_empty() {
            return Ok(());
        }
        self.data.seek(SeekFrom::Start(self.data_end))?;
        self.data.write_all(&self.pending_data)?;
        if force {
            self.data.sync_data()?;
        }
        self.ids.seek(SeekFrom::Start(
            HEADER_LEN + u64::from(self.written) * OFFSET_LEN,
        ))?;
        self.ids.write_all(&self.pending_ids)?;
        if force {
            self.ids.sync_data()?;
        }
        debug!("Wrote {} values", self.count - self.written);
        self.data_end += self.pending_data.len() as u64;
        self.written = self.count;
        self.pending_data.clear();
        self.pending_ids.clear();
        self.unwritten.clear();
        Ok(())
    }

    fn flush(&mut self, force: bool) -> Result<()> {
        self.write_pending(force)?;
        self.hash.commit()
    }

    /// Add hash entries for the ids the hash tree has not seen yet.
    fn index_missing_hashes(&mut self) -> Result<()> {
        let from = self.hash.len() as ValueId + 1;
        if from > self.count {
            return Ok(());
        }
        info!("Indexing {} values missing from the hash index", self.count - from + 1);
        for id in from..=self.count {
            let bytes = self.bytes_of(id)?;
            self.hash.insert(hash_key(&bytes, id), 0)?;
            if id % REINDEX_BATCH == 0 {
                self.hash.commit()?;
            }
        }
        self.hash.commit()
    }

    fn register(&mut self, term: &Term) -> Result<ValueId> {
        let datatype = match term {
            Term::Literal {
                kind: LiteralKind::Typed(dt),
                ..
            } => Some(self.register(&Term::Iri(dt.clone()))?),
            _ => None,
        };
        let bytes = encode(term, datatype);
        match self.find(&bytes)? {
            Some(id) => Ok(id),
            None => self.append(bytes),
        }
    }

    fn lookup(&mut self, term: &Term) -> Result<Option<ValueId>> {
        let datatype = match term {
            Term::Literal {
                kind: LiteralKind::Typed(dt),
                ..
            } => match self.lookup(&Term::Iri(dt.clone()))? {
                Some(id) => Some(id),
                None => return Ok(None),
            },
            _ => None,
        };
        self.find(&encode(term, datatype))
    }

    fn decode(&mut self, id: ValueId) -> Result<Term> {
        let bytes = self.bytes_of(id)?;
        self.decode_bytes(id, &bytes)
    }

    fn decode_bytes(&mut self, id: ValueId, bytes: &[u8]) -> Result<Term> {
        let mut r = ByteReader::new(bytes);
        let term = match r.u8()? {
            TAG_IRI => Term::Iri(r.rest_str()?.to_string()),
            TAG_BNODE => Term::BNode(r.rest_str()?.to_string()),
            TAG_PLAIN => Term::literal(r.rest_str()?),
            TAG_LANG => {
                let lang = r.str()?.to_string();
                Term::lang_literal(r.rest_str()?, lang)
            }
            TAG_TYPED => {
                let dt_id = r.u32()?;
                if dt_id == NULL_ID || dt_id >= id {
                    return Err(StoreError::corrupt(format!(
                        "value {id} references datatype {dt_id} registered after it"
                    )));
                }
                let datatype = match self.decode(dt_id)? {
                    Term::Iri(iri) => iri,
                    other => {
                        return Err(StoreError::corrupt(format!(
                            "datatype of value {id} is not an IRI: {other}"
                        )))
                    }
                };
                Term::typed_literal(r.rest_str()?, datatype)
            }
            tag => {
                return Err(StoreError::corrupt(format!(
                    "value {id} has unknown type tag {tag:#04x}"
                )))
            }
        };
        Ok(term)
    }
}

/// Encode a term; `datatype` is the id of a typed literal's datatype IRI.
fn encode(term: &Term, datatype: Option<ValueId>) -> Vec<u8> {
    let mut buf = Vec::new();
    match term {
        Term::Iri(iri) => {
            buf.push(TAG_IRI);
            buf.extend_from_slice(iri.as_bytes());
        }
        Term::BNode(id) => {
            buf.push(TAG_BNODE);
            buf.extend_from_slice(id.as_bytes());
        }
        Term::Literal { label, kind } => {
            match kind {
                LiteralKind::Plain => buf.push(TAG_PLAIN),
                LiteralKind::Lang(lang) => {
                    buf.push(TAG_LANG);
                    put_str(&mut buf, lang);
                }
                LiteralKind::Typed(_) => {
                    buf.push(TAG_TYPED);
                    put_u32(&mut buf, datatype.unwrap_or(NULL_ID));
                }
            }
            buf.extend_from_slice(label.as_bytes());
        }
    }
    buf
}

/// Bring `values.id` in line with `values.dat`: drop offsets whose records
/// never reached the data file, then index records written past the last
/// offset. A torn record at the end of the data file is cut off. Returns the
/// id count and the end of the valid data.
fn recover(data: &mut File, ids: &mut File, data_path: &Path) -> Result<(ValueId, u64)> {
    let data_len = data.metadata()?.len();
    let ids_len = ids.metadata()?.len();
    let mut count = ValueId::try_from((ids_len - HEADER_LEN) / OFFSET_LEN)
        .map_err(|_| StoreError::corrupt("value offset table is larger than the id space"))?;
    let mut data_end = HEADER_LEN;
    let mut ids_changed = HEADER_LEN + u64::from(count) * OFFSET_LEN != ids_len;
    while count > 0 {
        ids.seek(SeekFrom::Start(HEADER_LEN + u64::from(count - 1) * OFFSET_LEN))?;
        let mut buf = [0u8; OFFSET_LEN as usize];
        ids.read_exact(&mut buf)?;
        let off = u64::from_be_bytes(buf);
        match read_record_at(data, off, data_len) {
            Ok((id, bytes)) if id == count => {
                data_end = off + bytes.len() as u64 + RECORD_OVERHEAD;
                break;
            }
            Ok(_) | Err(StoreError::Corruption(_)) => {
                warn!("Dropping offset of value {count}, whose record is missing or damaged");
                count -= 1;
                ids_changed = true;
            }
            Err(e) => return Err(e),
        }
    }
    if ids_changed {
        ids.set_len(HEADER_LEN + u64::from(count) * OFFSET_LEN)?;
    }

    let mut found = Vec::new();
    while data_end < data_len {
        match read_record_at(data, data_end, data_len) {
            Ok((id, bytes)) if id == count + 1 => {
                found.extend_from_slice(&data_end.to_be_bytes());
                count = id;
                data_end += bytes.len() as u64 + RECORD_OVERHEAD;
            }
            Ok(_) | Err(StoreError::Corruption(_)) => break,
            Err(e) => return Err(e),
        }
    }
    if !found.is_empty() {
        info!(
            "Recovered {} value offsets from {}",
            found.len() as u64 / OFFSET_LEN,
            data_path.display()
        );
        ids.seek(SeekFrom::End(0))?;
        ids.write_all(&found)?;
        ids_changed = true;
    }
    if data_end < data_len {
        warn!(
            "Truncating {} torn bytes at the end of {}",
            data_len - data_end,
            data_path.display()
        );
        data.set_len(data_end)?;
        data.sync_all()?;
    }
    if ids_changed {
        ids.sync_all()?;
    }
    Ok((count, data_end))
}

/// Term dictionary backed by `values.dat`, `values.id` and `values.hash`.
pub struct ValueDictionary {
    path: PathBuf,
    sync: SyncMode,
    tables: Mutex<Tables>,
    term_cache: Mutex<BoundedCache<ValueId, Term>>,
    id_cache: Mutex<BoundedCache<Term, ValueId>>,
}

impl ValueDictionary {
    /// Open or create the dictionary files inside `dir`.
    pub fn open(
        dir: &Path,
        sync: SyncMode,
        value_cache_size: usize,
        value_id_cache_size: usize,
    ) -> Result<Self> {
        let path = dir.join(VALUES_FILE);
        // the data file is checked before any other file is created
        let mut data = open_with_header(&path, DATA_MAGIC)?;
        let mut ids = open_with_header(&dir.join(IDS_FILE), IDS_MAGIC)?;
        let (count, data_end) = recover(&mut data, &mut ids, &path)?;

        let hash_path = dir.join(HASH_FILE);
        let hash = match BTree::open(&hash_path, HASH_MAGIC, HASH_TAG, sync, HASH_CACHE_PAGES) {
            Ok(h) if h.len() <= u64::from(count) => h,
            Ok(h) => {
                warn!(
                    "Hash index holds {} values but the dictionary only {count}; rebuilding it",
                    h.len()
                );
                drop(h);
                PageFile::remove(&hash_path)?;
                BTree::open(&hash_path, HASH_MAGIC, HASH_TAG, sync, HASH_CACHE_PAGES)?
            }
            Err(StoreError::Corruption(msg)) => {
                warn!("Rebuilding damaged hash index {}: {msg}", hash_path.display());
                PageFile::remove(&hash_path)?;
                BTree::open(&hash_path, HASH_MAGIC, HASH_TAG, sync, HASH_CACHE_PAGES)?
            }
            Err(e) => return Err(e),
        };

        let mut tables = Tables {
            data,
            ids,
            hash,
            count,
            written: count,
            data_end,
            pending_data: Vec::new(),
            pending_ids: Vec::new(),
            unwritten: HashMap::new(),
        };
        tables.index_missing_hashes()?;
        info!("Opened value dictionary with {count} values");
        Ok(Self {
            path,
            sync,
            tables: Mutex::new(tables),
            term_cache: Mutex::new(BoundedCache::new(value_cache_size)),
            id_cache: Mutex::new(BoundedCache::new(value_id_cache_size)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::IllegalState("value dictionary lock poisoned".into()))
    }

    fn cached_id(&self, term: &Term) -> Option<ValueId> {
        self.id_cache.lock().ok().and_then(|mut c| c.get(term))
    }

    fn cache_id(&self, term: &Term, id: ValueId) {
        if let Ok(mut c) = self.id_cache.lock() {
            c.put(term.clone(), id);
        }
    }

    /// Id for `term`, allocating a new one if unknown. New values become
    /// durable on the next [`ValueDictionary::sync`].
    pub fn register(&self, term: &Term) -> Result<ValueId> {
        if let Some(id) = self.cached_id(term) {
            return Ok(id);
        }
        let id = self.tables()?.register(term)?;
        self.cache_id(term, id);
        Ok(id)
    }

    /// Register a batch of terms under a single acquisition of the table lock.
    pub fn register_many(&self, terms: &[Term]) -> Result<Vec<ValueId>> {
        let mut tables = self.tables()?;
        let before = tables.count;
        let ids = terms
            .iter()
            .map(|t| tables.register(t))
            .collect::<Result<Vec<_>>>()?;
        drop(tables);
        let added = ids.iter().filter(|id| **id > before).count();
        if added > 0 {
            debug!("Registered {added} new values");
        }
        Ok(ids)
    }

    /// Id for `term` if it has been registered.
    pub fn lookup(&self, term: &Term) -> Result<Option<ValueId>> {
        if let Some(id) = self.cached_id(term) {
            return Ok(Some(id));
        }
        let found = self.tables()?.lookup(term)?;
        if let Some(id) = found {
            self.cache_id(term, id);
        }
        Ok(found)
    }

    /// Term registered under `id`; unknown ids are corruption.
    pub fn resolve(&self, id: ValueId) -> Result<Term> {
        if let Some(t) = self.term_cache.lock().ok().and_then(|mut c| c.get(&id)) {
            return Ok(t);
        }
        let term = self.tables()?.decode(id)?;
        if let Ok(mut c) = self.term_cache.lock() {
            c.put(id, term.clone());
        }
        Ok(term)
    }

    /// Resolutions answered by the term cache and resolutions that were not.
    pub fn term_cache_hits(&self) -> (u64, u64) {
        self.term_cache
            .lock()
            .map(|c| c.hit_counts())
            .unwrap_or((0, 0))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.tables()?.count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Write new values and commit the hash index; fsync the value files as
    /// well under [`SyncMode::Force`].
    pub fn sync(&self) -> Result<()> {
        self.tables()?.flush(self.sync.is_force())
    }

    /// Check that every stored value decodes and can be found by its bytes.
    pub fn verify(&self) -> Result<usize> {
        let mut tables = self.tables()?;
        for id in 1..=tables.count {
            let bytes = tables.bytes_of(id)?;
            tables.decode_bytes(id, &bytes)?;
            if tables.hash.get(hash_key(&bytes, id))?.is_none() {
                return Err(StoreError::corrupt(format!(
                    "value {id} is missing from the hash index"
                )));
            }
        }
        Ok(tables.count as usize)
    }

    pub fn close(&self) -> Result<()> {
        let mut tables = self.tables()?;
        tables.flush(true)?;
        tables.data.sync_all()?;
        tables.ids.sync_all()?;
        tables.hash.close()?;
        debug!("Closed value dictionary {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const XSD_INT: &str = "http://www.w3.org/2001/XMLSchema#int";

    fn open(dir: &Path) -> ValueDictionary {
        ValueDictionary::open(dir, SyncMode::Flush, 16, 16).unwrap()
    }

    #[test]
    fn every_term_kind_round_trips_across_reopen() {
        let dir = tempdir().unwrap();
        let terms = vec![
            Term::iri("http://ex/a"),
            Term::bnode("b1"),
            Term::literal("plain"),
            Term::lang_literal("chat", "fr"),
            Term::typed_literal("42", XSD_INT),
            Term::literal(""),
        ];
        let ids = {
            let dict = open(dir.path());
            let ids = dict.register_many(&terms).unwrap();
            dict.close().unwrap();
            ids
        };
        let dict = open(dir.path());
        for (term, id) in terms.iter().zip(&ids) {
            assert_eq!(&dict.resolve(*id).unwrap(), term);
            assert_eq!(dict.lookup(term).unwrap(), Some(*id));
        }
        // six terms plus the datatype IRI
        assert_eq!(dict.len().unwrap(), 7);
    }

    #[test]
    fn literals_with_the_same_label_keep_their_kind() {
        let dir = tempdir().unwrap();
        let dict = open(dir.path());
        let terms = [
            Term::literal("chat"),
            Term::lang_literal("chat", "fr"),
            Term::lang_literal("chat", "en"),
            Term::typed_literal("chat", "http://ex/dt"),
            Term::typed_literal("chat", "http://ex/other"),
        ];
        let ids = dict.register_many(&terms).unwrap();
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), terms.len());
        dict.close().unwrap();

        let dict = ValueDictionary::open(dir.path(), SyncMode::Flush, 0, 0).unwrap();
        for (term, id) in terms.iter().zip(&ids) {
            let back = dict.resolve(*id).unwrap();
            assert_eq!(&back, term);
            assert_eq!(back.datatype(), term.datatype());
            assert_eq!(dict.lookup(term).unwrap(), Some(*id));
        }
    }

    #[test]
    fn registration_is_idempotent_and_distinguishes_kinds() {
        let dir = tempdir().unwrap();
        let dict = open(dir.path());
        let a = dict.register(&Term::iri("x")).unwrap();
        assert_eq!(dict.register(&Term::iri("x")).unwrap(), a);
        let b = dict.register(&Term::bnode("x")).unwrap();
        let c = dict.register(&Term::literal("x")).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a, 1);
    }

    #[test]
    fn unknown_values_lookup_none_and_resolve_corrupt() {
        let dir = tempdir().unwrap();
        let dict = open(dir.path());
        assert_eq!(dict.lookup(&Term::iri("nope")).unwrap(), None);
        // unregistered datatype means the literal is unknown
        assert_eq!(
            dict.lookup(&Term::typed_literal("1", "http://ex/dt")).unwrap(),
            None
        );
        assert!(matches!(dict.resolve(99), Err(StoreError::Corruption(_))));
        assert!(matches!(dict.resolve(NULL_ID), Err(StoreError::Corruption(_))));
    }

    #[test]
    fn values_are_read_back_from_disk() {
        let dir = tempdir().unwrap();
        let terms: Vec<Term> = (0..500).map(|i| Term::iri(format!("http://ex/{i}"))).collect();
        {
            let dict = open(dir.path());
            dict.register_many(&terms).unwrap();
            dict.sync().unwrap();
            dict.close().unwrap();
        }
        let ids_len = std::fs::metadata(dir.path().join(IDS_FILE)).unwrap().len();
        assert_eq!(ids_len, HEADER_LEN + 500 * OFFSET_LEN);

        let dict = ValueDictionary::open(dir.path(), SyncMode::Flush, 0, 0).unwrap();
        for (i, term) in terms.iter().enumerate().rev() {
            let id = i as ValueId + 1;
            assert_eq!(dict.lookup(term).unwrap(), Some(id));
            assert_eq!(&dict.resolve(id).unwrap(), term);
        }
        assert_eq!(dict.verify().unwrap(), 500);
    }

    #[test]
    fn repeated_resolution_hits_the_term_cache() {
        let dir = tempdir().unwrap();
        let dict = open(dir.path());
        let id = dict.register(&Term::iri("http://ex/a")).unwrap();
        dict.sync().unwrap();
        dict.resolve(id).unwrap();
        dict.resolve(id).unwrap();
        assert_eq!(dict.term_cache_hits(), (1, 1));
    }

    #[test]
    fn unsynced_values_are_visible_before_sync() {
        let dir = tempdir().unwrap();
        let dict = open(dir.path());
        let id = dict.register(&Term::literal("fresh")).unwrap();
        assert_eq!(
            std::fs::metadata(dir.path().join(VALUES_FILE)).unwrap().len(),
            HEADER_LEN
        );
        assert_eq!(dict.resolve(id).unwrap(), Term::literal("fresh"));
        assert_eq!(dict.verify().unwrap(), 1);
    }

    #[test]
    fn torn_final_record_is_truncated() {
        let dir = tempdir().unwrap();
        {
            let dict = open(dir.path());
            dict.register(&Term::iri("http://ex/a")).unwrap();
            dict.register(&Term::iri("http://ex/b")).unwrap();
            dict.close().unwrap();
        }
        let path = dir.path().join(VALUES_FILE);
        let len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 3).unwrap();
        drop(f);

        let dict = open(dir.path());
        assert_eq!(dict.len().unwrap(), 1);
        assert_eq!(dict.resolve(1).unwrap(), Term::iri("http://ex/a"));
        assert_eq!(dict.lookup(&Term::iri("http://ex/b")).unwrap(), None);
        // the next id reuses the slot of the torn record
        assert_eq!(dict.register(&Term::iri("http://ex/c")).unwrap(), 2);
        assert_eq!(dict.verify().unwrap(), 2);
    }

    #[test]
    fn lost_offsets_and_hash_index_are_rebuilt_from_the_data() {
        let dir = tempdir().unwrap();
        {
            let dict = open(dir.path());
            dict.register(&Term::iri("http://ex/a")).unwrap();
            dict.register(&Term::lang_literal("b", "en")).unwrap();
            dict.close().unwrap();
        }
        let ids = dir.path().join(IDS_FILE);
        let f = OpenOptions::new().write(true).open(&ids).unwrap();
        f.set_len(HEADER_LEN + 3).unwrap();
        drop(f);
        std::fs::remove_file(dir.path().join(HASH_FILE)).unwrap();

        let dict = open(dir.path());
        assert_eq!(dict.len().unwrap(), 2);
        assert_eq!(dict.lookup(&Term::lang_literal("b", "en")).unwrap(), Some(2));
        assert_eq!(dict.verify().unwrap(), 2);
        assert_eq!(
            std::fs::metadata(&ids).unwrap().len(),
            HEADER_LEN + 2 * OFFSET_LEN
        );
    }

    #[test]
    fn damage_before_the_tail_is_corruption() {
        let dir = tempdir().unwrap();
        {
            let dict = open(dir.path());
            dict.register(&Term::iri("http://ex/a")).unwrap();
            dict.register(&Term::iri("http://ex/b")).unwrap();
            dict.close().unwrap();
        }
        let path = dir.path().join(VALUES_FILE);
        let mut data = std::fs::read(&path).unwrap();
        // flip a byte inside the first record's payload
        data[HEADER_LEN as usize + 9] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        let dict = ValueDictionary::open(dir.path(), SyncMode::Flush, 0, 0).unwrap();
        assert_eq!(dict.resolve(2).unwrap(), Term::iri("http://ex/b"));
        assert!(matches!(dict.resolve(1), Err(StoreError::Corruption(_))));
        assert!(matches!(dict.verify(), Err(StoreError::Corruption(_))));
    }

    #[test]
    fn foreign_data_file_is_rejected_before_other_files_exist() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(VALUES_FILE), b"GARBAGE!garbage").unwrap();
        assert!(matches!(
            ValueDictionary::open(dir.path(), SyncMode::Flush, 0, 0),
            Err(StoreError::Corruption(_))
        ));
        assert!(!dir.path().join(IDS_FILE).exists());
        assert!(!dir.path().join(HASH_FILE).exists());
    }
}
