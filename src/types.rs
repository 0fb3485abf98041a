//! Source and signal descriptors — the records behind SOURCE_DEF and
//! SIGNAL_DEF chunks.
//!
//! # Source descriptor payload
//!
//! ```text
//! Offset  Size  Field
//!    0      2   source_id                    (LE u16)
//!    2     64   reserved, zero
//!   66      …   name, vendor, model, version, serial_number
//!               (NUL-terminated UTF-8, in that order)
//! ```
//!
//! # Signal descriptor payload
//!
//! ```text
//! Offset  Size  Field
//!    0      2   signal_id                    (LE u16)
//!    2      2   source_id                    (LE u16)
//!    4      1   signal_type  0=FSR 1=VSR
//!    5      1   reserved, zero
//!    6      4   data_type                    (LE u32, see format::DataType)
//!   10      4   sample_rate                  (LE u32, Hz; FSR only)
//!   14      4   samples_per_data             (LE u32)
//!   18      4   sample_decimate_factor       (LE u32)
//!   22      4   entries_per_summary          (LE u32)
//!   26      4   summary_decimate_factor      (LE u32)
//!   30      4   annotation_decimate_factor   (LE u32)
//!   34      4   utc_decimate_factor          (LE u32)
//!   38     92   reserved, zero
//!  130      …   name, units  (NUL-terminated UTF-8)
//! ```
//!
//! Source 0 and signal 0 are reserved for global annotations and are
//! written automatically on every file open.
//!
//! Descriptors own their strings, so definitions remain valid for the
//! writer's whole lifetime without holding caller memory.

use crate::buf::Buf;
use crate::error::{Error, Result};
use crate::format::DataType;

/// Ids live in [0, 256); the track chunk_meta reserves 12 bits but the
/// registry is bounded well below that.
pub const ID_LIMIT: u16 = 256;

// ── Source ───────────────────────────────────────────────────────────────────

const SOURCE_RESERVED: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDef {
    pub source_id:     u16,
    pub name:          String,
    pub vendor:        String,
    pub model:         String,
    pub version:       String,
    pub serial_number: String,
}

impl SourceDef {
    pub fn new(source_id: u16, name: &str) -> Self {
        Self { source_id, name: name.to_owned(), ..Default::default() }
    }

    /// The always-present source 0 for global annotations.
    pub fn global() -> Self {
        Self::new(0, "global_annotation_source")
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_id >= ID_LIMIT {
            return Err(Error::ParameterInvalid(format!(
                "source_id {} out of range [0, {ID_LIMIT})",
                self.source_id
            )));
        }
        Ok(())
    }

    pub fn encode_into(&self, buf: &mut Buf) {
        buf.wr_u16(self.source_id);
        buf.wr_zero(SOURCE_RESERVED);
        buf.wr_str(&self.name);
        buf.wr_str(&self.vendor);
        buf.wr_str(&self.model);
        buf.wr_str(&self.version);
        buf.wr_str(&self.serial_number);
    }

    pub fn decode_from(buf: &mut Buf) -> Result<Self> {
        let source_id = buf.rd_u16()?;
        buf.rd_skip(SOURCE_RESERVED)?;
        Ok(Self {
            source_id,
            name:          buf.rd_str()?.to_owned(),
            vendor:        buf.rd_str()?.to_owned(),
            model:         buf.rd_str()?.to_owned(),
            version:       buf.rd_str()?.to_owned(),
            serial_number: buf.rd_str()?.to_owned(),
        })
    }
}

// ── Signal ───────────────────────────────────────────────────────────────────

/// Sampling model of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalType {
    /// Fixed sample rate; samples are addressed by sample id.
    Fsr = 0,
    /// Variable sample rate; entries are addressed by UTC timestamp.
    Vsr = 1,
}

impl SignalType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(SignalType::Fsr),
            1 => Some(SignalType::Vsr),
            _ => None,
        }
    }
}

const SIGNAL_RESERVED: usize = 92;

/// Minimum value any decimation factor is clamped up to.
pub const DECIMATE_MIN: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct SignalDef {
    pub signal_id:                  u16,
    pub source_id:                  u16,
    pub signal_type:                SignalType,
    pub data_type:                  DataType,
    pub sample_rate:                u32,
    pub samples_per_data:           u32,
    pub sample_decimate_factor:     u32,
    pub entries_per_summary:        u32,
    pub summary_decimate_factor:    u32,
    pub annotation_decimate_factor: u32,
    pub utc_decimate_factor:        u32,
    pub name:                       String,
    pub units:                      String,
}

impl SignalDef {
    /// A descriptor with all engine parameters zero; [`SignalDef::align`]
    /// fills width-tuned defaults.
    pub fn new(signal_id: u16, source_id: u16, data_type: DataType, sample_rate: u32) -> Self {
        Self {
            signal_id,
            source_id,
            signal_type: SignalType::Fsr,
            data_type,
            sample_rate,
            samples_per_data: 0,
            sample_decimate_factor: 0,
            entries_per_summary: 0,
            summary_decimate_factor: 0,
            annotation_decimate_factor: 0,
            utc_decimate_factor: 0,
            name: String::new(),
            units: String::new(),
        }
    }

    /// The always-present signal 0 for global (VSR) annotations.
    pub fn global() -> Self {
        let mut s = Self::new(0, 0, DataType::F32, 0);
        s.signal_type = SignalType::Vsr;
        s.name = "global_annotation_signal".to_owned();
        s.align();
        s
    }

    pub fn validate(&self) -> Result<()> {
        if self.signal_id >= ID_LIMIT {
            return Err(Error::ParameterInvalid(format!(
                "signal_id {} out of range [0, {ID_LIMIT})",
                self.signal_id
            )));
        }
        if self.source_id >= ID_LIMIT {
            return Err(Error::ParameterInvalid(format!(
                "source_id {} out of range [0, {ID_LIMIT})",
                self.source_id
            )));
        }
        self.data_type.validate()?;
        if self.signal_type == SignalType::Fsr && self.sample_rate == 0 {
            return Err(Error::ParameterInvalid(
                "FSR signals require a non-zero sample_rate".into(),
            ));
        }
        Ok(())
    }

    /// Apply defaults to zero-valued engine parameters, then quantize so the
    /// summary pyramid decimates evenly:
    ///
    /// - every decimate factor is at least [`DECIMATE_MIN`];
    /// - `samples_per_data` is a multiple of `sample_decimate_factor` and
    ///   the packed DATA payload body ends on a 32-byte boundary;
    /// - `entries_per_summary` is a multiple of `summary_decimate_factor`,
    ///   and a level-1 SUMMARY covers a whole number of DATA chunks.
    pub fn align(&mut self) {
        if self.sample_decimate_factor == 0 {
            self.sample_decimate_factor = 100;
        }
        if self.summary_decimate_factor == 0 {
            self.summary_decimate_factor = 100;
        }
        if self.annotation_decimate_factor == 0 {
            self.annotation_decimate_factor = 100;
        }
        if self.utc_decimate_factor == 0 {
            self.utc_decimate_factor = 100;
        }
        self.sample_decimate_factor = self.sample_decimate_factor.max(DECIMATE_MIN);
        self.summary_decimate_factor = self.summary_decimate_factor.max(DECIMATE_MIN);
        self.annotation_decimate_factor = self.annotation_decimate_factor.max(DECIMATE_MIN);
        self.utc_decimate_factor = self.utc_decimate_factor.max(DECIMATE_MIN);

        let size_bits = self.data_type.size_bits().max(1);
        if self.samples_per_data == 0 {
            // Target a ~64 KiB packed payload.
            self.samples_per_data = ((64 * 1024 * 8) / size_bits).max(1);
        }
        // One DATA payload body must end on a 32-byte (256-bit) boundary,
        // and hold a whole number of level-1 summary spans.
        let bit_step = 256 / gcd(size_bits as u64, 256) as u32;
        let step = lcm(self.sample_decimate_factor as u64, bit_step as u64) as u32;
        self.samples_per_data = round_up_multiple(self.samples_per_data.max(1), step);

        if self.entries_per_summary == 0 {
            self.entries_per_summary = 20_000;
        }
        // A level-1 SUMMARY covers entries_per_summary * sample_decimate_factor
        // samples; that span must be a whole number of DATA chunks.
        let chunk_step =
            self.samples_per_data / gcd(self.sample_decimate_factor as u64, self.samples_per_data as u64) as u32;
        let step = lcm(self.summary_decimate_factor as u64, chunk_step as u64) as u32;
        self.entries_per_summary = round_up_multiple(self.entries_per_summary.max(1), step);
    }

    pub fn encode_into(&self, buf: &mut Buf) {
        buf.wr_u16(self.signal_id);
        buf.wr_u16(self.source_id);
        buf.wr_u8(self.signal_type as u8);
        buf.wr_u8(0);
        buf.wr_u32(self.data_type.raw());
        buf.wr_u32(self.sample_rate);
        buf.wr_u32(self.samples_per_data);
        buf.wr_u32(self.sample_decimate_factor);
        buf.wr_u32(self.entries_per_summary);
        buf.wr_u32(self.summary_decimate_factor);
        buf.wr_u32(self.annotation_decimate_factor);
        buf.wr_u32(self.utc_decimate_factor);
        buf.wr_zero(SIGNAL_RESERVED);
        buf.wr_str(&self.name);
        buf.wr_str(&self.units);
    }

    pub fn decode_from(buf: &mut Buf) -> Result<Self> {
        let signal_id = buf.rd_u16()?;
        let source_id = buf.rd_u16()?;
        let signal_type = SignalType::from_u8(buf.rd_u8()?)
            .ok_or_else(|| Error::UnsupportedFile("unknown signal type".into()))?;
        buf.rd_skip(1)?;
        let data_type = DataType::from_raw(buf.rd_u32()?)?;
        let sample_rate = buf.rd_u32()?;
        let samples_per_data = buf.rd_u32()?;
        let sample_decimate_factor = buf.rd_u32()?;
        let entries_per_summary = buf.rd_u32()?;
        let summary_decimate_factor = buf.rd_u32()?;
        let annotation_decimate_factor = buf.rd_u32()?;
        let utc_decimate_factor = buf.rd_u32()?;
        buf.rd_skip(SIGNAL_RESERVED)?;
        Ok(Self {
            signal_id,
            source_id,
            signal_type,
            data_type,
            sample_rate,
            samples_per_data,
            sample_decimate_factor,
            entries_per_summary,
            summary_decimate_factor,
            annotation_decimate_factor,
            utc_decimate_factor,
            name:  buf.rd_str()?.to_owned(),
            units: buf.rd_str()?.to_owned(),
        })
    }

    /// Samples covered by one SUMMARY entry at `level` ≥ 1.
    pub fn summary_entry_span(&self, level: u8) -> i64 {
        let mut span = self.sample_decimate_factor as i64;
        for _ in 1..level {
            span = span.saturating_mul(self.summary_decimate_factor as i64);
        }
        span
    }

    /// Samples covered by one INDEX offset entry at `level` ≥ 1: a DATA
    /// chunk for level 1, a whole level-(L-1) INDEX chunk above that.
    pub fn index_entry_span(&self, level: u8) -> i64 {
        if level <= 1 {
            self.samples_per_data as i64
        } else {
            (self.entries_per_summary as i64).saturating_mul(self.summary_entry_span(level - 1))
        }
    }
}

// ── Annotations ──────────────────────────────────────────────────────────────

/// Semantic class of an annotation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AnnotationType {
    User             = 0,
    Text             = 1,
    VerticalMarker   = 2,
    HorizontalMarker = 3,
}

impl AnnotationType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AnnotationType::User),
            1 => Some(AnnotationType::Text),
            2 => Some(AnnotationType::VerticalMarker),
            3 => Some(AnnotationType::HorizontalMarker),
            _ => None,
        }
    }
}

// ── Integer helpers ──────────────────────────────────────────────────────────

pub(crate) fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

pub(crate) fn lcm(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

pub(crate) fn round_up_multiple(v: u32, m: u32) -> u32 {
    if m == 0 {
        return v;
    }
    v.div_ceil(m) * m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_roundtrip() {
        let mut src = SourceDef::new(3, "oscilloscope");
        src.vendor = "acme".into();
        src.serial_number = "SN-001".into();
        let mut buf = Buf::new();
        src.encode_into(&mut buf);
        assert_eq!(SourceDef::decode_from(&mut buf).unwrap(), src);
    }

    #[test]
    fn signal_roundtrip_after_align() {
        let mut sig = SignalDef::new(1, 1, DataType::F32, 1_000_000);
        sig.name = "current".into();
        sig.units = "A".into();
        sig.align();
        let mut buf = Buf::new();
        sig.encode_into(&mut buf);
        assert_eq!(SignalDef::decode_from(&mut buf).unwrap(), sig);
    }

    #[test]
    fn align_produces_even_pyramid() {
        for dt in [DataType::U1, DataType::U4, DataType::U8, DataType::I16, DataType::F32, DataType::F64] {
            let mut sig = SignalDef::new(1, 1, dt, 1000);
            sig.align();
            let spd = sig.samples_per_data as u64;
            let sdf = sig.sample_decimate_factor as u64;
            let eps = sig.entries_per_summary as u64;
            assert_eq!(spd % sdf, 0, "{dt:?}: samples_per_data % sample_decimate");
            assert_eq!(
                spd * dt.size_bits() as u64 % 256,
                0,
                "{dt:?}: DATA payload 32-byte boundary"
            );
            assert_eq!(
                eps * sdf % spd,
                0,
                "{dt:?}: level-1 summary covers whole DATA chunks"
            );
            assert_eq!(eps % sig.summary_decimate_factor as u64, 0);
        }
    }

    #[test]
    fn align_respects_caller_values() {
        let mut sig = SignalDef::new(1, 1, DataType::U8, 1000);
        sig.sample_decimate_factor = 3; // below minimum, clamped to 10
        sig.samples_per_data = 1000;
        sig.align();
        assert_eq!(sig.sample_decimate_factor, 10);
        assert!(sig.samples_per_data >= 1000);
    }

    #[test]
    fn validate_rejects_bad_ids() {
        let sig = SignalDef::new(300, 1, DataType::F32, 1000);
        assert!(sig.validate().is_err());
        let mut sig = SignalDef::new(1, 1, DataType::F32, 0);
        assert!(sig.validate().is_err());
        sig.signal_type = SignalType::Vsr;
        assert!(sig.validate().is_ok());
    }

    #[test]
    fn spans_scale_by_level() {
        let mut sig = SignalDef::new(1, 1, DataType::F32, 1000);
        sig.align();
        let sdf = sig.sample_decimate_factor as i64;
        let sum = sig.summary_decimate_factor as i64;
        assert_eq!(sig.summary_entry_span(1), sdf);
        assert_eq!(sig.summary_entry_span(2), sdf * sum);
        assert_eq!(sig.index_entry_span(1), sig.samples_per_data as i64);
        assert_eq!(
            sig.index_entry_span(2),
            sig.entries_per_summary as i64 * sdf
        );
    }
}
