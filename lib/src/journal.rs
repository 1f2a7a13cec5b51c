//! Write-ahead journal for the batch currently being applied to the indexes.
//!
//! `txn.journal`: `NSTJ` | version u32 | removes u32 | 16-byte quads |
//! inserts u32 | 17-byte records | crc32 of everything before it.
//! The file is written to a temporary name, synced and renamed into place,
//! so a journal that exists is always complete.

use crate::codec::{crc32_ieee, put_u32, ByteReader};
use crate::error::{Result, StoreError};
use crate::index::{Quad, Record};
use crate::triple_store::Mutations;
use log::{debug, warn};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const JOURNAL_FILE: &str = "txn.journal";
const TMP_FILE: &str = "txn.journal.tmp";
const MAGIC: &[u8; 4] = b"NSTJ";
const VERSION: u32 = 1;

pub fn journal_path(dir: &Path) -> PathBuf {
    dir.join(JOURNAL_FILE)
}

fn put_quad(buf: &mut Vec<u8>, quad: &Quad) {
    for id in quad {
        put_u32(buf, *id);
    }
}

fn read_quad(r: &mut ByteReader<'_>) -> Result<Quad> {
    Ok([r.u32()?, r.u32()?, r.u32()?, r.u32()?])
}

fn encode(m: &Mutations) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + m.removes.len() * 16 + m.inserts.len() * 17);
    buf.extend_from_slice(MAGIC);
    put_u32(&mut buf, VERSION);
    put_u32(&mut buf, m.removes.len() as u32);
    for q in &m.removes {
        put_quad(&mut buf, q);
    }
    put_u32(&mut buf, m.inserts.len() as u32);
    for r in &m.inserts {
        put_quad(&mut buf, &r.quad);
        buf.push(r.flags);
    }
    let crc = crc32_ieee(&buf);
    put_u32(&mut buf, crc);
    buf
}

fn decode(data: &[u8]) -> Result<Mutations> {
    if data.len() < 16 || &data[..4] != MAGIC {
        return Err(StoreError::corrupt("transaction journal has no valid header"));
    }
    let (body, tail) = data.split_at(data.len() - 4);
    let stored = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
    if crc32_ieee(body) != stored {
        return Err(StoreError::corrupt("transaction journal checksum mismatch"));
    }
    let mut r = ByteReader::new(&body[4..]);
    let version = r.u32()?;
    if version != VERSION {
        return Err(StoreError::corrupt(format!(
            "unsupported journal version {version}"
        )));
    }
    let n = r.u32()? as usize;
    let removes = (0..n).map(|_| read_quad(&mut r)).collect::<Result<Vec<_>>>()?;
    let n = r.u32()? as usize;
    let inserts = (0..n)
        .map(|_| {
            let quad = read_quad(&mut r)?;
            Ok(Record {
                quad,
                flags: r.u8()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if !r.is_empty() {
        return Err(StoreError::corrupt("trailing bytes in transaction journal"));
    }
    Ok(Mutations { removes, inserts })
}

/// Durably record `m` before it is applied.
pub fn write(dir: &Path, m: &Mutations) -> Result<()> {
    let tmp = dir.join(TMP_FILE);
    {
        let mut f = File::create(&tmp)?;
        f.write_all(&encode(m))?;
        f.sync_all()?;
    }
    fs::rename(&tmp, journal_path(dir))?;
    sync_dir(dir);
    debug!(
        "Journaled {} removals and {} insertions",
        m.removes.len(),
        m.inserts.len()
    );
    Ok(())
}

/// The batch left behind by an interrupted apply, if any.
pub fn read(dir: &Path) -> Result<Option<Mutations>> {
    let tmp = dir.join(TMP_FILE);
    if tmp.exists() {
        // never renamed into place, so the batch was never applied
        warn!("Discarding incomplete journal {}", tmp.display());
        fs::remove_file(&tmp)?;
    }
    let path = journal_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(&path)?;
    decode(&data).map(Some)
}

/// Remove the journal once its batch is applied.
pub fn clear(dir: &Path) -> Result<()> {
    let path = journal_path(dir);
    if path.exists() {
        fs::remove_file(&path)?;
    }
    Ok(())
}

fn sync_dir(dir: &Path) {
    // not supported on every platform
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}
