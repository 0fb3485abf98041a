//! Chunk-level framing over [`Backend`] — the lowest layer that understands
//! the file as a sequence of chunks.
//!
//! [`RawFile`] keeps a *chunk cursor*: the header of the most recently read
//! chunk and its absolute offset.  Navigation moves the cursor:
//!
//! - [`RawFile::chunk_next`] / [`RawFile::chunk_prev`] walk physically
//!   adjacent chunks (reverse traversal uses `payload_prev_length`);
//! - [`RawFile::item_next`] / [`RawFile::item_prev`] hop the per-item
//!   doubly-linked list in O(1);
//! - [`RawFile::chunk_seek`] jumps to an absolute offset.
//!
//! All navigation returns [`Error::Empty`] at the ends — callers use it as
//! their loop terminator.
//!
//! Writes are append-only: [`RawFile::wr`] always lands at the known end
//! of file and fills in `payload_prev_length` from the previously written
//! chunk.  The only in-place mutation the format permits is rewriting an
//! existing chunk *header* (list-pointer maintenance and HEAD offset
//! updates), via [`RawFile::wr_header_at`].
//!
//! On graceful close the file header is rewritten with the final file
//! length; a zero length on open is tolerated and flags the file for
//! repair.

use log::warn;

use crate::backend::{Backend, Mode};
use crate::buf::Buf;
use crate::crc::crc32c;
use crate::error::{Error, Result};
use crate::format::{
    chunk_size_on_disk, payload_pad, ChunkHeader, FileHeader, CHUNK_HEADER_SIZE, FILE_HEADER_SIZE,
};

pub struct RawFile {
    backend: Backend,
    /// Decoded file header; `header.length == 0` means unclean close.
    pub header: FileHeader,

    /// Chunk cursor: most recently read header and its offset.
    hdr:        ChunkHeader,
    hdr_offset: u64,

    /// `payload_length` of the last chunk written, for the next header's
    /// `payload_prev_length`.
    prev_payload_length: u32,
}

impl RawFile {
    /// Open the file and position the cursor just after the file header.
    ///
    /// Mode `w` writes a fresh header with `length = 0`; read modes
    /// validate identification, CRC, and major version.
    pub fn open<P: AsRef<std::path::Path>>(path: P, mode: Mode) -> Result<Self> {
        let mut backend = Backend::open(path, mode)?;
        let header = match mode {
            Mode::Write => {
                let header = FileHeader::new();
                backend.write(&header.encode())?;
                header
            }
            Mode::Read | Mode::Append => {
                let mut buf = [0u8; FILE_HEADER_SIZE];
                backend.read(&mut buf)?;
                let header = FileHeader::decode(&buf)?;
                if header.length == 0 {
                    warn!("file was not closed cleanly (header length is 0)");
                }
                header
            }
        };
        Ok(Self {
            backend,
            header,
            hdr: ChunkHeader::default(),
            hdr_offset: 0,
            prev_payload_length: 0,
        })
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.backend.mode()
    }

    /// Known end-of-file offset.
    #[inline]
    pub fn end(&self) -> u64 {
        self.backend.end()
    }

    /// Offset of the chunk under the cursor.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.hdr_offset
    }

    /// Header of the chunk under the cursor.
    #[inline]
    pub fn hdr(&self) -> &ChunkHeader {
        &self.hdr
    }

    /// True if the file header recorded a graceful close.
    #[inline]
    pub fn closed_cleanly(&self) -> bool {
        self.header.length != 0
    }

    // ── Write path ───────────────────────────────────────────────────────

    /// Append one chunk.  `hdr.payload_length` and
    /// `hdr.payload_prev_length` are filled in here; the header CRC is
    /// computed on encode.  Returns the chunk's absolute offset.
    pub fn wr(&mut self, hdr: &mut ChunkHeader, payload: &[u8]) -> Result<u64> {
        debug_assert!(payload.len() <= u32::MAX as usize);
        hdr.payload_length = payload.len() as u32;
        hdr.payload_prev_length = self.prev_payload_length;

        self.backend.seek_end()?;
        let offset = self.backend.tell();
        self.backend.write(&hdr.encode())?;
        self.backend.write(payload)?;
        let pad = payload_pad(hdr.payload_length) as usize;
        if pad > 0 {
            self.backend.write(&[0u8; 7][..pad])?;
        }
        self.backend.write(&crc32c(payload).to_le_bytes())?;

        self.prev_payload_length = hdr.payload_length;
        Ok(offset)
    }

    /// Rewrite an existing chunk header in place (list-pointer and HEAD
    /// maintenance).  The cursor and append position are unaffected.
    pub fn wr_header_at(&mut self, offset: u64, hdr: &ChunkHeader) -> Result<()> {
        self.backend.seek(offset)?;
        self.backend.write(&hdr.encode())?;
        Ok(())
    }

    /// Rewrite a whole chunk in place.  The payload length must equal the
    /// original — the format never moves chunks, it only patches them.
    pub fn wr_in_place(&mut self, offset: u64, hdr: &ChunkHeader, payload: &[u8]) -> Result<()> {
        debug_assert_eq!(hdr.payload_length as usize, payload.len());
        self.backend.seek(offset)?;
        self.backend.write(&hdr.encode())?;
        self.backend.write(payload)?;
        let pad = payload_pad(hdr.payload_length) as usize;
        if pad > 0 {
            self.backend.write(&[0u8; 7][..pad])?;
        }
        self.backend.write(&crc32c(payload).to_le_bytes())?;
        Ok(())
    }

    /// Seed `payload_prev_length` when appending to an existing file
    /// (repair path).
    pub(crate) fn set_prev_payload_length(&mut self, len: u32) {
        self.prev_payload_length = len;
    }

    pub fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }

    /// Discard everything after the chunk under the cursor (repair path).
    pub fn truncate_after_current(&mut self) -> Result<()> {
        let end = self.hdr_offset + chunk_size_on_disk(self.hdr.payload_length);
        self.backend.seek(end)?;
        self.backend.truncate_to_current_position()
    }

    /// Rewrite the file header with the final length and flush.  Called on
    /// graceful close, after the END chunk is on disk.
    pub fn close(&mut self) -> Result<()> {
        if self.backend.mode() != Mode::Read {
            self.header.length = self.backend.end();
            self.backend.seek(0)?;
            let enc = self.header.encode();
            self.backend.write(&enc)?;
            self.backend.flush()?;
        }
        Ok(())
    }

    // ── Read path ────────────────────────────────────────────────────────

    /// Read and validate the chunk header at the current file position,
    /// making it the cursor.
    pub fn rd_header(&mut self) -> Result<&ChunkHeader> {
        let offset = self.backend.tell();
        if offset + CHUNK_HEADER_SIZE as u64 > self.backend.end() {
            return Err(Error::Empty);
        }
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        self.backend.read(&mut buf)?;
        self.hdr = ChunkHeader::decode(&buf)?;
        self.hdr_offset = offset;
        Ok(&self.hdr)
    }

    /// Read the payload of the chunk under the cursor and validate its
    /// CRC.  The returned [`Buf`]'s read cursor is at the payload start;
    /// padding and the CRC footer are stripped.
    pub fn rd_payload(&mut self) -> Result<Buf> {
        let len = self.hdr.payload_length as usize;
        let pad = payload_pad(self.hdr.payload_length) as usize;
        self.backend.seek(self.hdr_offset + CHUNK_HEADER_SIZE as u64)?;
        let mut raw = vec![0u8; len + pad + 4];
        self.backend.read(&mut raw)?;

        let stored = u32::from_le_bytes(raw[len + pad..].try_into().unwrap());
        let actual = crc32c(&raw[..len]);
        if stored != actual {
            return Err(Error::MessageIntegrity(format!(
                "payload CRC32C mismatch at offset {}: stored {stored:#010x}, actual {actual:#010x}",
                self.hdr_offset
            )));
        }
        raw.truncate(len);
        Ok(Buf::from_bytes(raw))
    }

    /// Read header and payload at an absolute offset.
    pub fn rd(&mut self, offset: u64) -> Result<(ChunkHeader, Buf)> {
        self.chunk_seek(offset)?;
        let hdr = self.hdr;
        let payload = self.rd_payload()?;
        Ok((hdr, payload))
    }

    /// Advance the cursor to the physically next chunk.
    pub fn chunk_next(&mut self) -> Result<&ChunkHeader> {
        let next = self.hdr_offset + chunk_size_on_disk(self.hdr.payload_length);
        if next >= self.backend.end() {
            return Err(Error::Empty);
        }
        self.backend.seek(next)?;
        self.rd_header()
    }

    /// Step the cursor to the physically previous chunk, using the current
    /// header's `payload_prev_length`.
    pub fn chunk_prev(&mut self) -> Result<&ChunkHeader> {
        if self.hdr_offset <= FILE_HEADER_SIZE as u64 {
            return Err(Error::Empty);
        }
        let prev = self.hdr_offset - chunk_size_on_disk(self.hdr.payload_prev_length);
        self.backend.seek(prev)?;
        self.rd_header()
    }

    /// Jump the cursor to an absolute chunk offset.
    pub fn chunk_seek(&mut self, offset: u64) -> Result<&ChunkHeader> {
        self.backend.seek(offset)?;
        self.rd_header()
    }

    /// Position the cursor on the first chunk after the file header.
    pub fn chunk_first(&mut self) -> Result<&ChunkHeader> {
        self.chunk_seek(FILE_HEADER_SIZE as u64)
    }

    /// Follow the current chunk's `item_next` pointer.
    pub fn item_next(&mut self) -> Result<&ChunkHeader> {
        match self.hdr.item_next {
            0 => Err(Error::Empty),
            offset => self.chunk_seek(offset),
        }
    }

    /// Follow the current chunk's `item_prev` pointer.
    pub fn item_prev(&mut self) -> Result<&ChunkHeader> {
        match self.hdr.item_prev {
            0 => Err(Error::Empty),
            offset => self.chunk_seek(offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{TAG_SOURCE_DEF, TAG_USER_DATA};
    use tempfile::NamedTempFile;

    fn write_chunks(raw: &mut RawFile, payloads: &[&[u8]]) -> Vec<u64> {
        payloads
            .iter()
            .map(|p| {
                let mut hdr = ChunkHeader { tag: TAG_USER_DATA, ..Default::default() };
                raw.wr(&mut hdr, p).unwrap()
            })
            .collect()
    }

    #[test]
    fn forward_and_reverse_traversal_agree() {
        let tmp = NamedTempFile::new().unwrap();
        let payloads: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 3 + i as usize * 7]).collect();
        {
            let mut raw = RawFile::open(tmp.path(), Mode::Write).unwrap();
            let refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
            write_chunks(&mut raw, &refs);
            raw.close().unwrap();
        }

        let mut raw = RawFile::open(tmp.path(), Mode::Read).unwrap();
        assert!(raw.closed_cleanly());

        let mut offsets = Vec::new();
        raw.chunk_first().unwrap();
        loop {
            offsets.push(raw.offset());
            let payload = raw.rd_payload().unwrap();
            assert_eq!(payload.as_slice(), payloads[offsets.len() - 1]);
            match raw.chunk_next() {
                Ok(_) => {}
                Err(Error::Empty) => break,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(offsets.len(), 5);

        // Walk back with chunk_prev; offsets must mirror.
        for expect in offsets.iter().rev().skip(1) {
            raw.chunk_prev().unwrap();
            assert_eq!(raw.offset(), *expect);
        }
        assert!(matches!(raw.chunk_prev(), Err(Error::Empty)));
    }

    #[test]
    fn item_list_navigation() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let mut raw = RawFile::open(tmp.path(), Mode::Write).unwrap();
            // Chunk 0 and 2 share an item list; chunk 1 is unrelated.
            let mut h0 = ChunkHeader { tag: TAG_SOURCE_DEF, ..Default::default() };
            let o0 = raw.wr(&mut h0, b"first").unwrap();
            let mut h1 = ChunkHeader { tag: TAG_USER_DATA, ..Default::default() };
            raw.wr(&mut h1, b"noise").unwrap();
            let mut h2 = ChunkHeader { tag: TAG_SOURCE_DEF, item_prev: o0, ..Default::default() };
            let o2 = raw.wr(&mut h2, b"second").unwrap();
            h0.item_next = o2;
            raw.wr_header_at(o0, &h0).unwrap();
            raw.close().unwrap();
        }

        let mut raw = RawFile::open(tmp.path(), Mode::Read).unwrap();
        raw.chunk_first().unwrap();
        raw.item_next().unwrap();
        assert_eq!(raw.rd_payload().unwrap().as_slice(), b"second");
        raw.item_prev().unwrap();
        assert_eq!(raw.rd_payload().unwrap().as_slice(), b"first");
        assert!(matches!(raw.item_prev(), Err(Error::Empty)));
    }

    #[test]
    fn corrupt_payload_crc_is_detected() {
        let tmp = NamedTempFile::new().unwrap();
        let offset;
        {
            let mut raw = RawFile::open(tmp.path(), Mode::Write).unwrap();
            let mut hdr = ChunkHeader { tag: TAG_USER_DATA, ..Default::default() };
            offset = raw.wr(&mut hdr, b"precious bytes").unwrap();
            raw.close().unwrap();
        }
        // Flip one payload byte behind the engine's back.
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = std::fs::OpenOptions::new().write(true).open(tmp.path()).unwrap();
            f.seek(SeekFrom::Start(offset + CHUNK_HEADER_SIZE as u64)).unwrap();
            f.write_all(b"P").unwrap();
        }
        let mut raw = RawFile::open(tmp.path(), Mode::Read).unwrap();
        raw.chunk_seek(offset).unwrap();
        assert!(matches!(raw.rd_payload(), Err(Error::MessageIntegrity(_))));
    }

    #[test]
    fn payload_prev_length_matches_physical_predecessor() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let mut raw = RawFile::open(tmp.path(), Mode::Write).unwrap();
            write_chunks(&mut raw, &[b"abc", b"defghij", b"k"]);
            raw.close().unwrap();
        }
        let mut raw = RawFile::open(tmp.path(), Mode::Read).unwrap();
        raw.chunk_first().unwrap();
        assert_eq!(raw.hdr().payload_prev_length, 0);
        raw.chunk_next().unwrap();
        assert_eq!(raw.hdr().payload_prev_length, 3);
        raw.chunk_next().unwrap();
        assert_eq!(raw.hdr().payload_prev_length, 7);
    }
}
