//! Fixed-width binary helpers shared by the value dictionary, the index files
//! and the transaction journal.
//!
//! Integers are written big-endian so that the byte order of an encoded key
//! equals the numeric order of its components; index records can then be
//! compared as plain byte strings.

use crate::error::{Result, StoreError};

/// Append `v` as 4 big-endian bytes.
#[inline]
pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Read 4 big-endian bytes at `off`, if in bounds.
#[inline]
pub fn get_u32(buf: &[u8], off: usize) -> Option<u32> {
    let end = off.checked_add(4)?;
    let bytes = buf.get(off..end)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Append a length-prefixed UTF-8 string (`u32` length, then bytes).
pub fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

/// Bounds-checked cursor over an encoded byte slice. Every read that runs off
/// the end reports corruption instead of panicking.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.off
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn u8(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.off)
            .ok_or_else(|| StoreError::corrupt("unexpected end of record"))?;
        self.off += 1;
        Ok(b)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let v = get_u32(self.buf, self.off)
            .ok_or_else(|| StoreError::corrupt("truncated integer field"))?;
        self.off += 4;
        Ok(v)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .off
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| StoreError::corrupt("field length exceeds record"))?;
        let out = &self.buf[self.off..end];
        self.off = end;
        Ok(out)
    }

    pub fn str(&mut self) -> Result<&'a str> {
        let len = self.u32()? as usize;
        self.utf8(len)
    }

    /// Consume the rest of the buffer as UTF-8.
    pub fn rest_str(&mut self) -> Result<&'a str> {
        let n = self.remaining();
        self.utf8(n)
    }

    fn utf8(&mut self, n: usize) -> Result<&'a str> {
        let raw = self.bytes(n)?;
        std::str::from_utf8(raw).map_err(|_| StoreError::corrupt("invalid UTF-8 in string field"))
    }
}

const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut x = i as u32;
        let mut k = 0;
        while k < 8 {
            x = if x & 1 != 0 { (x >> 1) ^ 0xEDB8_8320 } else { x >> 1 };
            k += 1;
        }
        table[i] = x;
        i += 1;
    }
    table
}

/// Compute IEEE CRC-32.
pub fn crc32_ieee(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &b in data {
        crc = (crc >> 8) ^ CRC_TABLE[((crc ^ b as u32) & 0xFF) as usize];
    }
    crc ^ 0xFFFF_FFFF
}
