//! On-disk format v1 — fully self-describing, mandatory checksums.
//!
//! # File header (32 bytes, offset 0)
//!
//! ```text
//! Offset  Size  Field
//!    0     16   identification  frozen magic (see FILE_IDENTIFICATION)
//!   16      8   length          total file bytes, written on close (LE u64)
//!   24      4   version         major<<24 | minor<<16 | patch (LE u32)
//!   28      4   crc32           CRC32C of bytes [0..28)        (LE u32)
//! ```
//!
//! `length == 0` means the writer never closed the file; readers tolerate
//! it (the data up to the last valid chunk is intact) and repair rebuilds
//! the tail.
//!
//! # Chunk header (32 bytes, 8-byte aligned)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   item_next        absolute offset of next chunk in this
//!                                item list; 0 = none          (LE u64)
//!    8      8   item_prev        absolute offset of previous  (LE u64)
//!   16      1   tag              chunk family + role
//!   17      1   reserved         = 0
//!   18      2   chunk_meta       per-family metadata          (LE u16)
//!   20      4   payload_length   payload bytes, pre-padding   (LE u32)
//!   24      4   payload_prev_length  of the physically previous chunk
//!   28      4   crc32            CRC32C of bytes [0..28)      (LE u32)
//! ```
//!
//! The payload follows the header, then 0–7 zero pad bytes so that payload
//! plus padding ends 4 bytes short of an 8-byte boundary, then a 4-byte
//! CRC32C of the *unpadded* payload.  Total chunk size is always a
//! multiple of 8.
//!
//! `item_next`/`item_prev` thread doubly-linked lists per item kind (one
//! list per definition family, one per track data/index/summary level) —
//! not across all chunks.  `payload_prev_length` enables reverse physical
//! traversal without an index.
//!
//! # Tags
//!
//! ```text
//! 0x00            END         file sentinel, empty payload
//! 0x01            SOURCE_DEF  chunk_meta = source_id
//! 0x02            SIGNAL_DEF  chunk_meta = signal_id
//! 0x20 | t<<3 | r track chunk t = track type, r = chunk role
//! 0x40            USER_DATA   chunk_meta bits 15:12 = storage type
//! ```
//!
//! Track chunk_meta packs `signal_id` in bits 11:0 and the summary level
//! in bits 15:12.
//!
//! # Endianness
//! Every numeric field is little-endian.  This is frozen for version 1 and
//! never negotiated.

use byteorder::{ByteOrder, LittleEndian};

use crate::crc::{crc32c, crc32c_header};
use crate::error::{Error, Result};

// ── File header ──────────────────────────────────────────────────────────────

/// 16-byte file identification: "jlsfmt", CR/LF and SUB tripwires against
/// text-mode corruption, and a trailing random tail.
pub const FILE_IDENTIFICATION: [u8; 16] = [
    0x6A, 0x6C, 0x73, 0x66, 0x6D, 0x74, 0x0D, 0x0A,
    0x20, 0x0A, 0x20, 0x1A, 0x20, 0x20, 0xB2, 0x1C,
];

pub const FILE_HEADER_SIZE: usize = 32;

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 0;
pub const VERSION_PATCH: u32 = 0;

/// Packed version written to the file header.
pub const VERSION: u32 = (VERSION_MAJOR << 24) | (VERSION_MINOR << 16) | VERSION_PATCH;

/// File header fields.  `length` is 0 until a graceful close.
#[derive(Debug, Clone, Copy)]
pub struct FileHeader {
    pub length:  u64,
    pub version: u32,
}

impl FileHeader {
    pub fn new() -> Self {
        Self { length: 0, version: VERSION }
    }

    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf[0..16].copy_from_slice(&FILE_IDENTIFICATION);
        LittleEndian::write_u64(&mut buf[16..24], self.length);
        LittleEndian::write_u32(&mut buf[24..28], self.version);
        let crc = crc32c(&buf[..28]);
        LittleEndian::write_u32(&mut buf[28..32], crc);
        buf
    }

    /// Validate identification, CRC, and major version.
    pub fn decode(buf: &[u8; FILE_HEADER_SIZE]) -> Result<Self> {
        if buf[0..16] != FILE_IDENTIFICATION {
            return Err(Error::UnsupportedFile("bad file identification".into()));
        }
        let stored = LittleEndian::read_u32(&buf[28..32]);
        let actual = crc32c(&buf[..28]);
        if stored != actual {
            return Err(Error::MessageIntegrity(format!(
                "file header CRC32C mismatch: stored {stored:#010x}, actual {actual:#010x}"
            )));
        }
        let version = LittleEndian::read_u32(&buf[24..28]);
        if version >> 24 != VERSION_MAJOR {
            return Err(Error::UnsupportedFile(format!(
                "file version {}.{}.{} (this build reads major {})",
                version >> 24,
                (version >> 16) & 0xFF,
                version & 0xFFFF,
                VERSION_MAJOR
            )));
        }
        let length = LittleEndian::read_u64(&buf[16..24]);
        Ok(Self { length, version })
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tags ─────────────────────────────────────────────────────────────────────

pub const TAG_END:        u8 = 0x00;
pub const TAG_SOURCE_DEF: u8 = 0x01;
pub const TAG_SIGNAL_DEF: u8 = 0x02;
pub const TAG_USER_DATA:  u8 = 0x40;

const TAG_TRACK_BASE: u8 = 0x20;

/// Per-signal sub-stream kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackType {
    Fsr        = 0,
    Vsr        = 1,
    Annotation = 2,
    Utc        = 3,
}

impl TrackType {
    pub const ALL: [TrackType; 4] =
        [TrackType::Fsr, TrackType::Vsr, TrackType::Annotation, TrackType::Utc];

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TrackType::Fsr),
            1 => Some(TrackType::Vsr),
            2 => Some(TrackType::Annotation),
            3 => Some(TrackType::Utc),
            _ => None,
        }
    }
}

/// Role of a chunk within its track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkRole {
    Def     = 0,
    Head    = 1,
    Index   = 2,
    Data    = 3,
    Summary = 4,
}

impl ChunkRole {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ChunkRole::Def),
            1 => Some(ChunkRole::Head),
            2 => Some(ChunkRole::Index),
            3 => Some(ChunkRole::Data),
            4 => Some(ChunkRole::Summary),
            _ => None,
        }
    }
}

/// Compose a track chunk tag.
#[inline]
pub fn track_tag(track: TrackType, role: ChunkRole) -> u8 {
    TAG_TRACK_BASE | ((track as u8) << 3) | (role as u8)
}

/// Decompose a tag into track type and role; `None` for non-track tags.
pub fn track_tag_parts(tag: u8) -> Option<(TrackType, ChunkRole)> {
    if tag & 0xE0 != TAG_TRACK_BASE {
        return None;
    }
    let track = TrackType::from_u8((tag >> 3) & 0x03)?;
    let role  = ChunkRole::from_u8(tag & 0x07)?;
    Some((track, role))
}

// ── chunk_meta packing ───────────────────────────────────────────────────────

/// Track chunk_meta: signal_id in bits 11:0, summary level in bits 15:12.
#[inline]
pub fn track_meta(signal_id: u16, level: u8) -> u16 {
    (signal_id & 0x0FFF) | ((level as u16 & 0x0F) << 12)
}

#[inline]
pub fn meta_signal_id(chunk_meta: u16) -> u16 {
    chunk_meta & 0x0FFF
}

#[inline]
pub fn meta_level(chunk_meta: u16) -> u8 {
    (chunk_meta >> 12) as u8
}

/// User-data chunk_meta: caller meta in bits 11:0, storage type in 15:12.
#[inline]
pub fn user_data_meta(meta: u16, storage: StorageType) -> u16 {
    (meta & 0x0FFF) | ((storage as u16) << 12)
}

#[inline]
pub fn meta_storage_type(chunk_meta: u16) -> Option<StorageType> {
    StorageType::from_u8((chunk_meta >> 12) as u8)
}

/// Storage encoding of a user-data or annotation payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageType {
    Binary = 0,
    /// NUL-terminated UTF-8.
    String = 1,
    /// NUL-terminated UTF-8 JSON document.
    Json   = 2,
}

impl StorageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(StorageType::Binary),
            1 => Some(StorageType::String),
            2 => Some(StorageType::Json),
            _ => None,
        }
    }
}

// ── Chunk header ─────────────────────────────────────────────────────────────

pub const CHUNK_HEADER_SIZE: usize = 32;

/// Decoded chunk header.  The CRC field is computed on encode and verified
/// on decode; it is not stored here, so callers cannot set it wrong.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkHeader {
    pub item_next:           u64,
    pub item_prev:           u64,
    pub tag:                 u8,
    pub chunk_meta:          u16,
    pub payload_length:      u32,
    pub payload_prev_length: u32,
}

impl ChunkHeader {
    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.item_next);
        LittleEndian::write_u64(&mut buf[8..16], self.item_prev);
        buf[16] = self.tag;
        buf[17] = 0;
        LittleEndian::write_u16(&mut buf[18..20], self.chunk_meta);
        LittleEndian::write_u32(&mut buf[20..24], self.payload_length);
        LittleEndian::write_u32(&mut buf[24..28], self.payload_prev_length);
        let crc = crc32c_header(&buf);
        LittleEndian::write_u32(&mut buf[28..32], crc);
        buf
    }

    /// Decode and verify the header CRC — the cheapest possible check, done
    /// before any field is trusted.
    pub fn decode(buf: &[u8; CHUNK_HEADER_SIZE]) -> Result<Self> {
        let stored = LittleEndian::read_u32(&buf[28..32]);
        let actual = crc32c_header(buf);
        if stored != actual {
            return Err(Error::MessageIntegrity(format!(
                "chunk header CRC32C mismatch: stored {stored:#010x}, actual {actual:#010x}"
            )));
        }
        Ok(Self {
            item_next:           LittleEndian::read_u64(&buf[0..8]),
            item_prev:           LittleEndian::read_u64(&buf[8..16]),
            tag:                 buf[16],
            chunk_meta:          LittleEndian::read_u16(&buf[18..20]),
            payload_length:      LittleEndian::read_u32(&buf[20..24]),
            payload_prev_length: LittleEndian::read_u32(&buf[24..28]),
        })
    }
}

/// Pad bytes after a payload of `len` bytes: payload + pad ends 4 bytes
/// short of an 8-byte boundary, so the trailing CRC completes the chunk to
/// a multiple of 8.
#[inline]
pub fn payload_pad(len: u32) -> u32 {
    (8 - ((len + 4) & 7)) & 7
}

/// Bytes the payload region occupies on disk: payload + pad + 4-byte CRC.
#[inline]
pub fn payload_size_on_disk(len: u32) -> u64 {
    len as u64 + payload_pad(len) as u64 + 4
}

/// Total on-disk bytes of a chunk with the given payload length.
#[inline]
pub fn chunk_size_on_disk(payload_length: u32) -> u64 {
    CHUNK_HEADER_SIZE as u64 + payload_size_on_disk(payload_length)
}

// ── Payload header ───────────────────────────────────────────────────────────

/// Common 16-byte prefix of DATA, INDEX, and SUMMARY payloads.
///
/// `timestamp` is a sample id (FSR, UTC) or UTC time (annotation);
/// `entry_count` counts entries, not bytes; `entry_size_bits` is the packed
/// size of one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadHeader {
    pub timestamp:       i64,
    pub entry_count:     u32,
    pub entry_size_bits: u16,
}

pub const PAYLOAD_HEADER_SIZE: usize = 16;

impl PayloadHeader {
    pub fn encode_into(&self, buf: &mut crate::buf::Buf) {
        buf.wr_i64(self.timestamp);
        buf.wr_u32(self.entry_count);
        buf.wr_u16(self.entry_size_bits);
        buf.wr_u16(0);
    }

    pub fn decode_from(buf: &mut crate::buf::Buf) -> Result<Self> {
        let timestamp = buf.rd_i64()?;
        let entry_count = buf.rd_u32()?;
        let entry_size_bits = buf.rd_u16()?;
        buf.rd_skip(2)?;
        Ok(Self { timestamp, entry_count, entry_size_bits })
    }
}

// ── Data type encoding ───────────────────────────────────────────────────────

/// Numeric class of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BaseType {
    Int   = 0,
    Uint  = 1,
    Float = 2,
}

impl BaseType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(BaseType::Int),
            1 => Some(BaseType::Uint),
            2 => Some(BaseType::Float),
            _ => None,
        }
    }
}

/// Packed sample data type: `basetype | size_bits << 8 | q << 16`.
///
/// `size_bits ∈ {1, 4, 8, 16, 24, 32, 64}`, with 1 valid only for UINT
/// (boolean).  `q` is an optional fixed-point fractional bit count and is
/// only meaningful for INT/UINT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataType(u32);

impl DataType {
    pub const U1:  DataType = DataType(BaseType::Uint as u32 | 1 << 8);
    pub const U4:  DataType = DataType(BaseType::Uint as u32 | 4 << 8);
    pub const U8:  DataType = DataType(BaseType::Uint as u32 | 8 << 8);
    pub const U16: DataType = DataType(BaseType::Uint as u32 | 16 << 8);
    pub const U32: DataType = DataType(BaseType::Uint as u32 | 32 << 8);
    pub const U64: DataType = DataType(BaseType::Uint as u32 | 64 << 8);
    pub const I8:  DataType = DataType(BaseType::Int as u32 | 8 << 8);
    pub const I16: DataType = DataType(BaseType::Int as u32 | 16 << 8);
    pub const I32: DataType = DataType(BaseType::Int as u32 | 32 << 8);
    pub const I64: DataType = DataType(BaseType::Int as u32 | 64 << 8);
    pub const F32: DataType = DataType(BaseType::Float as u32 | 32 << 8);
    pub const F64: DataType = DataType(BaseType::Float as u32 | 64 << 8);

    pub fn new(base: BaseType, size_bits: u32, q: u32) -> Result<Self> {
        let dt = DataType(base as u32 | (size_bits & 0xFF) << 8 | (q & 0xFF) << 16);
        dt.validate()?;
        Ok(dt)
    }

    pub fn from_raw(raw: u32) -> Result<Self> {
        let dt = DataType(raw);
        dt.validate()?;
        Ok(dt)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn base(self) -> BaseType {
        // validate() guarantees the low byte is a known BaseType.
        BaseType::from_u8((self.0 & 0xFF) as u8).unwrap_or(BaseType::Uint)
    }

    /// Packed bits per sample.
    #[inline]
    pub fn size_bits(self) -> u32 {
        (self.0 >> 8) & 0xFF
    }

    /// Fixed-point fractional bit count (INT/UINT only).
    #[inline]
    pub fn q(self) -> u32 {
        (self.0 >> 16) & 0xFF
    }

    #[inline]
    pub fn is_float(self) -> bool {
        self.base() == BaseType::Float
    }

    pub fn validate(self) -> Result<()> {
        let base = BaseType::from_u8((self.0 & 0xFF) as u8)
            .ok_or_else(|| Error::ParameterInvalid(format!("unknown base type {:#x}", self.0)))?;
        let bits = self.size_bits();
        match bits {
            1 => {
                if base != BaseType::Uint {
                    return Err(Error::ParameterInvalid(
                        "1-bit samples must be UINT (boolean)".into(),
                    ));
                }
            }
            4 | 8 | 16 | 24 | 32 | 64 => {}
            _ => {
                return Err(Error::ParameterInvalid(format!(
                    "unsupported sample size {bits} bits"
                )));
            }
        }
        if base == BaseType::Float {
            if !matches!(bits, 32 | 64) {
                return Err(Error::ParameterInvalid(format!(
                    "FLOAT samples must be 32 or 64 bits, not {bits}"
                )));
            }
            if self.q() != 0 {
                return Err(Error::ParameterInvalid(
                    "fixed-point q is only valid for INT/UINT".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_header_roundtrips_and_crc_guards() {
        let hdr = ChunkHeader {
            item_next: 0x1000,
            item_prev: 0x200,
            tag: track_tag(TrackType::Fsr, ChunkRole::Data),
            chunk_meta: track_meta(5, 0),
            payload_length: 100,
            payload_prev_length: 48,
        };
        let mut enc = hdr.encode();
        assert_eq!(ChunkHeader::decode(&enc).unwrap(), hdr);

        enc[3] ^= 0x01;
        assert!(matches!(
            ChunkHeader::decode(&enc),
            Err(Error::MessageIntegrity(_))
        ));
    }

    #[test]
    fn padding_keeps_chunks_8_aligned() {
        for len in 0u32..64 {
            let total = chunk_size_on_disk(len);
            assert_eq!(total % 8, 0, "payload_length {len}");
            assert!(payload_pad(len) < 8);
        }
        assert_eq!(chunk_size_on_disk(0), 40);
    }

    #[test]
    fn track_tags_compose_and_decompose() {
        for tt in TrackType::ALL {
            for role in [
                ChunkRole::Def,
                ChunkRole::Head,
                ChunkRole::Index,
                ChunkRole::Data,
                ChunkRole::Summary,
            ] {
                let tag = track_tag(tt, role);
                assert_eq!(track_tag_parts(tag), Some((tt, role)));
            }
        }
        assert_eq!(track_tag_parts(TAG_SOURCE_DEF), None);
        assert_eq!(track_tag_parts(TAG_USER_DATA), None);
    }

    #[test]
    fn meta_packing() {
        let m = track_meta(0x123, 5);
        assert_eq!(meta_signal_id(m), 0x123);
        assert_eq!(meta_level(m), 5);

        let u = user_data_meta(0x042, StorageType::Json);
        assert_eq!(meta_storage_type(u), Some(StorageType::Json));
        assert_eq!(u & 0x0FFF, 0x042);
    }

    #[test]
    fn file_header_rejects_wrong_magic_and_major() {
        let fh = FileHeader { length: 128, version: VERSION };
        let enc = fh.encode();
        let dec = FileHeader::decode(&enc).unwrap();
        assert_eq!(dec.length, 128);

        let mut bad = enc;
        bad[0] = b'x';
        // Magic check fires before the CRC check.
        assert!(matches!(
            FileHeader::decode(&bad),
            Err(Error::UnsupportedFile(_))
        ));

        let fh2 = FileHeader { length: 0, version: 2 << 24 };
        let enc2 = fh2.encode();
        assert!(matches!(
            FileHeader::decode(&enc2),
            Err(Error::UnsupportedFile(_))
        ));
    }

    proptest::proptest! {
        #[test]
        fn any_header_roundtrips(
            item_next in proptest::prelude::any::<u64>(),
            item_prev in proptest::prelude::any::<u64>(),
            tag in proptest::prelude::any::<u8>(),
            chunk_meta in proptest::prelude::any::<u16>(),
            payload_length in proptest::prelude::any::<u32>(),
            payload_prev_length in proptest::prelude::any::<u32>(),
        ) {
            let hdr = ChunkHeader {
                item_next,
                item_prev,
                tag,
                chunk_meta,
                payload_length,
                payload_prev_length,
            };
            proptest::prop_assert_eq!(ChunkHeader::decode(&hdr.encode()).unwrap(), hdr);
            // Framing math stays 8-aligned for every payload length.
            proptest::prop_assert_eq!(chunk_size_on_disk(payload_length) % 8, 0);
        }
    }

    #[test]
    fn data_type_encoding() {
        assert_eq!(DataType::F32.size_bits(), 32);
        assert_eq!(DataType::F32.base(), BaseType::Float);
        assert!(DataType::F32.is_float());
        assert_eq!(DataType::U1.size_bits(), 1);
        assert!(DataType::new(BaseType::Int, 1, 0).is_err());
        assert!(DataType::new(BaseType::Float, 16, 0).is_err());
        assert!(DataType::new(BaseType::Float, 32, 4).is_err());
        let fixed = DataType::new(BaseType::Int, 16, 12).unwrap();
        assert_eq!(fixed.q(), 12);
        assert_eq!(DataType::from_raw(fixed.raw()).unwrap(), fixed);
    }
}
