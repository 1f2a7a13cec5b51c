//! Fixed-size page files with a bounded page cache.
//!
//! A page is `PAGE_SIZE` bytes: `crc32 u32 | kind u8 | 3 reserved bytes`
//! followed by the payload. The checksum covers everything after itself.
//! Page 0 is the header page of whatever structure owns the file.
//!
//! Modified pages stay in memory until [`PageFile::commit`], which writes
//! the image of every dirty page to `<file>.redo`, then writes them in
//! place and removes the redo file. A crash therefore leaves every page in
//! its old or its new version: on open a complete redo file is replayed and
//! a torn one discarded.

use crate::cache::BoundedCache;
use crate::codec::{crc32_ieee, get_u32, put_u32};
use crate::error::{Result, StoreError};
use crate::options::SyncMode;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub const PAGE_SIZE: usize = 4096;
const PAGE_HEADER_LEN: usize = 8;
/// Bytes available to the owner of a page.
pub const PAGE_PAYLOAD: usize = PAGE_SIZE - PAGE_HEADER_LEN;

const REDO_MAGIC: &[u8; 4] = b"NSRD";

pub type PageId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    Meta = 1,
    Internal = 2,
    Leaf = 3,
}

impl PageKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(PageKind::Meta),
            2 => Some(PageKind::Internal),
            3 => Some(PageKind::Leaf),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    id: PageId,
    kind: PageKind,
    payload: Box<[u8]>,
}

impl Page {
    pub fn new(id: PageId, kind: PageKind) -> Self {
        Self {
            id,
            kind,
            payload: vec![0u8; PAGE_PAYLOAD].into_boxed_slice(),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[4] = self.kind as u8;
        buf[PAGE_HEADER_LEN..].copy_from_slice(&self.payload);
        let crc = crc32_ieee(&buf[4..]);
        buf[..4].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn from_bytes(id: PageId, bytes: &[u8]) -> Result<Self> {
        let stored = get_u32(bytes, 0)
            .ok_or_else(|| StoreError::corrupt(format!("page {id} is truncated")))?;
        if bytes.len() != PAGE_SIZE || crc32_ieee(&bytes[4..]) != stored {
            return Err(StoreError::corrupt(format!("checksum mismatch on page {id}")));
        }
        let kind = PageKind::from_byte(bytes[4]).ok_or_else(|| {
            StoreError::corrupt(format!("page {id} has unknown kind {}", bytes[4]))
        })?;
        Ok(Self {
            id,
            kind,
            payload: bytes[PAGE_HEADER_LEN..].to_vec().into_boxed_slice(),
        })
    }
}

fn page_offset(id: PageId) -> u64 {
    u64::from(id) * PAGE_SIZE as u64
}

fn redo_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".redo");
    PathBuf::from(name)
}

fn write_pages(file: &mut File, images: &[(PageId, Vec<u8>)]) -> Result<()> {
    for (id, bytes) in images {
        file.seek(SeekFrom::Start(page_offset(*id)))?;
        file.write_all(bytes)?;
    }
    file.flush()?;
    Ok(())
}

fn write_redo(path: &Path, images: &[(PageId, Vec<u8>)], sync: SyncMode) -> Result<()> {
    let mut buf = Vec::with_capacity(12 + images.len() * (PAGE_SIZE + 4));
    buf.extend_from_slice(REDO_MAGIC);
    put_u32(&mut buf, images.len() as u32);
    for (id, bytes) in images {
        put_u32(&mut buf, *id);
        buf.extend_from_slice(bytes);
    }
    let crc = crc32_ieee(&buf);
    put_u32(&mut buf, crc);
    let mut f = File::create(path)?;
    f.write_all(&buf)?;
    if sync.is_force() {
        f.sync_all()?;
    }
    Ok(())
}

/// Page images of a complete redo file; `None` if it is torn.
fn parse_redo(data: &[u8]) -> Option<Vec<(PageId, Vec<u8>)>> {
    if data.len() < 12 || &data[..4] != REDO_MAGIC {
        return None;
    }
    let (body, tail) = data.split_at(data.len() - 4);
    if crc32_ieee(body) != get_u32(tail, 0)? {
        return None;
    }
    let count = get_u32(body, 4)? as usize;
    let mut off = 8;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let id = get_u32(body, off)?;
        let bytes = body.get(off + 4..off + 4 + PAGE_SIZE)?;
        out.push((id, bytes.to_vec()));
        off += 4 + PAGE_SIZE;
    }
    (off == body.len()).then_some(out)
}

fn replay_redo(path: &Path, file: &mut File) -> Result<()> {
    let redo = redo_path(path);
    if !redo.exists() {
        return Ok(());
    }
    let data = fs::read(&redo)?;
    match parse_redo(&data) {
        Some(images) => {
            info!(
                "Replaying {} page images into {}",
                images.len(),
                path.display()
            );
            write_pages(file, &images)?;
            file.sync_all()?;
        }
        None => warn!("Discarding incomplete redo file {}", redo.display()),
    }
    fs::remove_file(&redo)?;
    Ok(())
}

struct Reader {
    file: File,
    cache: BoundedCache<PageId, Arc<Page>>,
    disk_reads: u64,
}

/// A file of pages. Reads go through the page cache; writes are buffered as
/// dirty pages until [`PageFile::commit`].
pub struct PageFile {
    path: PathBuf,
    sync: SyncMode,
    reader: Mutex<Reader>,
    dirty: BTreeMap<PageId, Arc<Page>>,
    page_count: PageId,
}

impl PageFile {
    /// Open or create the file at `path`, replaying a leftover redo file.
    pub fn open(path: &Path, sync: SyncMode, cache_pages: usize) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        replay_redo(path, &mut file)?;
        let len = file.metadata()?.len();
        let whole = len / PAGE_SIZE as u64;
        if len % PAGE_SIZE as u64 != 0 {
            warn!("Truncating partial page at the end of {}", path.display());
            file.set_len(whole * PAGE_SIZE as u64)?;
            file.sync_all()?;
        }
        let page_count = PageId::try_from(whole).map_err(|_| {
            StoreError::corrupt(format!("{} has too many pages", path.display()))
        })?;
        debug!("Opened {} with {page_count} pages", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            sync,
            reader: Mutex::new(Reader {
                file,
                cache: BoundedCache::new(cache_pages),
                disk_reads: 0,
            }),
            dirty: BTreeMap::new(),
            page_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pages in the file, counting allocated pages not yet committed.
    pub fn page_count(&self) -> PageId {
        self.page_count
    }

    pub fn is_empty(&self) -> bool {
        self.page_count == 0
    }

    fn lock_reader(&self) -> Result<MutexGuard<'_, Reader>> {
        self.reader
            .lock()
            .map_err(|_| StoreError::IllegalState("page cache lock poisoned".into()))
    }

    pub fn read(&self, id: PageId) -> Result<Arc<Page>> {
        if let Some(page) = self.dirty.get(&id) {
            return Ok(Arc::clone(page));
        }
        if id >= self.page_count {
            return Err(StoreError::corrupt(format!(
                "page {id} is beyond the end of {}",
                self.path.display()
            )));
        }
        let mut reader = self.lock_reader()?;
        if let Some(page) = reader.cache.get(&id) {
            return Ok(page);
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        reader.file.seek(SeekFrom::Start(page_offset(id)))?;
        reader.file.read_exact(&mut buf)?;
        reader.disk_reads += 1;
        let page = Arc::new(Page::from_bytes(id, &buf)?);
        reader.cache.put(id, Arc::clone(&page));
        Ok(page)
    }

    /// Replace a page; it stays dirty until the next commit.
    pub fn write(&mut self, page: Page) {
        self.dirty.insert(page.id, Arc::new(page));
    }

    /// Append a blank page of `kind`.
    pub fn allocate(&mut self, kind: PageKind) -> Result<Page> {
        let id = self.page_count;
        self.page_count = id.checked_add(1).ok_or_else(|| {
            StoreError::IllegalState(format!("{} is full", self.path.display()))
        })?;
        let page = Page::new(id, kind);
        self.dirty.insert(id, Arc::new(page.clone()));
        Ok(page)
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Make every dirty page durable as one atomic step.
    pub fn commit(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let images: Vec<(PageId, Vec<u8>)> = self
            .dirty
            .iter()
            .map(|(id, page)| (*id, page.to_bytes()))
            .collect();
        let redo = redo_path(&self.path);
        write_redo(&redo, &images, self.sync)?;
        let reader = self
            .reader
            .get_mut()
            .map_err(|_| StoreError::IllegalState("page cache lock poisoned".into()))?;
        write_pages(&mut reader.file, &images)?;
        if self.sync.is_force() {
            reader.file.sync_data()?;
        }
        for (id, page) in std::mem::take(&mut self.dirty) {
            reader.cache.put(id, page);
        }
        fs::remove_file(&redo)?;
        debug!("Committed {} pages to {}", images.len(), self.path.display());
        Ok(())
    }

    /// Write dirty pages in place without a redo file. Only for files that
    /// are still being built under a temporary name.
    pub fn write_unlogged(&mut self) -> Result<()> {
        let reader = self
            .reader
            .get_mut()
            .map_err(|_| StoreError::IllegalState("page cache lock poisoned".into()))?;
        let images: Vec<(PageId, Vec<u8>)> = std::mem::take(&mut self.dirty)
            .into_values()
            .map(|page| (page.id, page.to_bytes()))
            .collect();
        write_pages(&mut reader.file, &images)
    }

    /// Commit and fsync.
    pub fn close(&mut self) -> Result<()> {
        self.commit()?;
        let reader = self
            .reader
            .get_mut()
            .map_err(|_| StoreError::IllegalState("page cache lock poisoned".into()))?;
        reader.file.sync_all()?;
        Ok(())
    }

    /// Pages read from disk so far (cache misses).
    pub fn disk_reads(&self) -> u64 {
        self.lock_reader().map(|r| r.disk_reads).unwrap_or(0)
    }

    /// Remove `path` and any redo file left next to it.
    pub fn remove(path: &Path) -> Result<()> {
        let redo = redo_path(path);
        if redo.exists() {
            fs::remove_file(&redo)?;
        }
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
