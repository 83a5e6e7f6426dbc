//! Big-endian binary primitives shared by every plan encoding.
//!
//! Writes go into a growable [`BytesMut`]; reads are bounds-checked and
//! return an error on truncated input instead of panicking.

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};

/// Length marker written in place of an absent string.
const ABSENT_LEN: i32 = -1;

/// Append-only encoder for plan payloads.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, value: &str) {
        self.buf.put_i32(value.len() as i32);
        self.buf.put_slice(value.as_bytes());
    }

    /// Write an optional string; `None` is encoded as length `-1`.
    pub fn put_opt_str(&mut self, value: Option<&str>) {
        match value {
            Some(value) => self.put_str(value),
            None => self.buf.put_i32(ABSENT_LEN),
        }
    }

    pub fn put_slice(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over an encoded plan payload.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> anyhow::Result<&'a [u8]> {
        anyhow::ensure!(
            self.offset + len <= self.data.len(),
            "plan payload truncated at offset {} (need {} bytes, have {})",
            self.offset,
            len,
            self.remaining()
        );
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> anyhow::Result<i8> {
        Ok(i8::from_be_bytes(self.take_array()?))
    }

    pub fn read_bool(&mut self) -> anyhow::Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => anyhow::bail!("invalid boolean byte {other}"),
        }
    }

    pub fn read_i16(&mut self) -> anyhow::Result<i16> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> anyhow::Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> anyhow::Result<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> anyhow::Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    /// Read a non-negative `i32` element count and convert it to `usize`.
    ///
    /// Every encoded element takes at least one byte, so a count larger than
    /// the unread payload is rejected before anyone allocates for it.
    pub fn read_len(&mut self) -> anyhow::Result<usize> {
        let len = self.read_i32()?;
        anyhow::ensure!(len >= 0, "negative length {len} at offset {}", self.offset);
        let len = len as usize;
        anyhow::ensure!(
            len <= self.remaining(),
            "length {len} exceeds the {} bytes left at offset {}",
            self.remaining(),
            self.offset
        );
        Ok(len)
    }

    pub fn read_string(&mut self) -> anyhow::Result<String> {
        self.read_opt_string()?
            .context("expected string, found absent marker")
    }

    pub fn read_opt_string(&mut self) -> anyhow::Result<Option<String>> {
        let len = self.read_i32()?;
        if len == ABSENT_LEN {
            return Ok(None);
        }
        anyhow::ensure!(len >= 0, "invalid string length {len}");
        let raw = self.take(len as usize)?;
        let value = std::str::from_utf8(raw).context("string is not valid utf-8")?;
        Ok(Some(value.to_string()))
    }
}
