//! Growable byte buffer with independent read and write cursors.
//!
//! [`Buf`] is the workhorse behind every payload encode and decode.  All
//! scalars are little-endian — the format never negotiates byte order.
//! Strings are written as UTF-8 followed by a NUL terminator and read back
//! as borrows into the buffer.
//!
//! Read operations fail with [`Error::Empty`] when fewer bytes remain than
//! required; decoders use that as their loop terminator when walking a
//! payload of back-to-back records.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

#[derive(Debug, Default, Clone)]
pub struct Buf {
    data: Vec<u8>,
    /// Read cursor; independent of the write cursor (`data.len()`).
    rd: usize,
}

impl Buf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { data: Vec::with_capacity(cap), rd: 0 }
    }

    /// Wrap existing bytes for decoding; the read cursor starts at 0.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { data: bytes, rd: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Bytes remaining ahead of the read cursor.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.rd
    }

    /// Reset both cursors; capacity is retained.
    pub fn clear(&mut self) {
        self.data.clear();
        self.rd = 0;
    }

    /// Rewind only the read cursor.
    #[inline]
    pub fn rewind(&mut self) {
        self.rd = 0;
    }

    /// Grow backing storage to at least `new_len` bytes, at least doubling
    /// the current capacity so repeated appends stay amortized O(1).
    /// Content is preserved.  Every write operation routes its growth
    /// through here.
    pub fn reserve_total(&mut self, new_len: usize) {
        if new_len > self.data.capacity() {
            let want = new_len.max(self.data.capacity() * 2);
            self.data.reserve_exact(want - self.data.len());
        }
    }

    // ── Write cursor ─────────────────────────────────────────────────────

    pub fn wr_zero(&mut self, n: usize) {
        self.reserve_total(self.data.len() + n);
        self.data.resize(self.data.len() + n, 0);
    }

    pub fn wr_bytes(&mut self, bytes: &[u8]) {
        self.reserve_total(self.data.len() + bytes.len());
        self.data.extend_from_slice(bytes);
    }

    /// UTF-8 bytes followed by a NUL terminator.
    pub fn wr_str(&mut self, s: &str) {
        self.reserve_total(self.data.len() + s.len() + 1);
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
    }

    pub fn wr_u8(&mut self, v: u8) {
        self.wr_bytes(&[v]);
    }

    pub fn wr_u16(&mut self, v: u16) {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, v);
        self.wr_bytes(&b);
    }

    pub fn wr_u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.wr_bytes(&b);
    }

    pub fn wr_u64(&mut self, v: u64) {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, v);
        self.wr_bytes(&b);
    }

    pub fn wr_i64(&mut self, v: i64) {
        self.wr_u64(v as u64);
    }

    pub fn wr_f32(&mut self, v: f32) {
        self.wr_u32(v.to_bits());
    }

    pub fn wr_f64(&mut self, v: f64) {
        self.wr_u64(v.to_bits());
    }

    // ── Read cursor ──────────────────────────────────────────────────────

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(Error::Empty);
        }
        let s = &self.data[self.rd..self.rd + n];
        self.rd += n;
        Ok(s)
    }

    pub fn rd_bytes(&mut self, n: usize) -> Result<&[u8]> {
        self.take(n)
    }

    /// Skip `n` bytes (reserved fields).
    pub fn rd_skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// Borrow the next NUL-terminated UTF-8 string (terminator consumed,
    /// not included in the borrow).
    pub fn rd_str(&mut self) -> Result<&str> {
        let rest = &self.data[self.rd..];
        let nul = rest.iter().position(|&b| b == 0).ok_or(Error::Empty)?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| Error::ParameterInvalid(format!("invalid UTF-8 string: {e}")))?;
        self.rd += nul + 1;
        Ok(s)
    }

    pub fn rd_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn rd_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn rd_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn rd_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn rd_i64(&mut self) -> Result<i64> {
        Ok(self.rd_u64()? as i64)
    }

    pub fn rd_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.rd_u32()?))
    }

    pub fn rd_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.rd_u64()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_roundtrip_little_endian() {
        let mut b = Buf::new();
        b.wr_u8(0xAB);
        b.wr_u16(0x1234);
        b.wr_u32(0xDEAD_BEEF);
        b.wr_i64(-42);
        b.wr_f32(1.5);
        b.wr_f64(-2.25);

        // Spot-check wire bytes for the u16: LE.
        assert_eq!(&b.as_slice()[1..3], &[0x34, 0x12]);

        assert_eq!(b.rd_u8().unwrap(), 0xAB);
        assert_eq!(b.rd_u16().unwrap(), 0x1234);
        assert_eq!(b.rd_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(b.rd_i64().unwrap(), -42);
        assert_eq!(b.rd_f32().unwrap(), 1.5);
        assert_eq!(b.rd_f64().unwrap(), -2.25);
        assert!(matches!(b.rd_u8(), Err(Error::Empty)));
    }

    #[test]
    fn strings_are_nul_terminated() {
        let mut b = Buf::new();
        b.wr_str("volts");
        b.wr_str("");
        b.wr_u8(7);
        assert_eq!(b.rd_str().unwrap(), "volts");
        assert_eq!(b.rd_str().unwrap(), "");
        assert_eq!(b.rd_u8().unwrap(), 7);
    }

    #[test]
    fn missing_terminator_is_empty() {
        let mut b = Buf::from_bytes(b"abc".to_vec());
        assert!(matches!(b.rd_str(), Err(Error::Empty)));
    }

    #[test]
    fn wr_zero_and_skip() {
        let mut b = Buf::new();
        b.wr_zero(64);
        b.wr_u16(9);
        b.rd_skip(64).unwrap();
        assert_eq!(b.rd_u16().unwrap(), 9);
    }

    #[test]
    fn growth_at_least_doubles() {
        let mut b = Buf::with_capacity(8);
        let cap = b.data.capacity();
        b.wr_bytes(&vec![1u8; cap]);
        // One byte past capacity must double, not grow by one.
        b.wr_u8(2);
        assert!(b.data.capacity() >= cap * 2);
        let content = b.as_slice().to_vec();
        b.wr_zero(100);
        assert_eq!(&b.as_slice()[..content.len()], content.as_slice());
    }
}
