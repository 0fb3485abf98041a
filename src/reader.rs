//! Reader facade — random access, statistics, and callback iteration.
//!
//! ```no_run
//! use jls::Reader;
//!
//! let mut r = Reader::open("capture.jls")?;
//! for sig in r.signals() {
//!     let n = r.fsr_length(sig.signal_id)?;
//!     println!("{}: {} samples", sig.name, n);
//! }
//! # Ok::<(), jls::Error>(())
//! ```
//!
//! The reader is single-threaded and holds no locks; callers wanting
//! parallel reads open additional instances.
//!
//! # Seek paths
//!
//! FSR reads descend the INDEX pyramid: at level L the entry index is
//! `(sample_id − chunk.timestamp) / span(L)`, where `span` follows from
//! the signal's decimation parameters.  Timeseries tracks (annotations,
//! UTC) descend by comparing per-entry timestamps instead.  Public sample
//! ids are zero-based; the signal's `sample_id_offset` converts to file
//! coordinates.
//!
//! # Omitted chunks
//!
//! A level-1 INDEX entry of 0 marks a DATA chunk that was never written
//! because its content was constant.  The reader regenerates it
//! deterministically from the covering SUMMARY entry: float signals get
//! Box–Muller noise seeded per sample id (so repeated reads and zoomed
//! views agree), narrow integer signals get the rounded mean.
//!
//! # Unclean files
//!
//! A file with a zero header length opens read-only with a warning; the
//! scans stop at the first invalid chunk, and FSR access degrades to
//! walking the DATA chunk list directly when no INDEX level was flushed.
//! Run [`crate::repair::repair`] to rebuild the pyramid in place.

use crate::backend::Mode;
use crate::core::{Core, MAX_LEVELS};
use crate::error::{Error, Result};
use crate::format::{
    meta_storage_type, BaseType, DataType, PayloadHeader, StorageType, TrackType,
};
use crate::fsr::{combine_stats, copy_bits, decode_samples, stats_from_samples};
use crate::raw::RawFile;
use crate::types::{AnnotationType, SignalDef, SourceDef};

// ── Decoded records ──────────────────────────────────────────────────────────

/// One decoded annotation.
#[derive(Debug, Clone)]
pub struct AnnotationRecord {
    pub timestamp:       i64,
    pub y:               f32,
    pub annotation_type: AnnotationType,
    pub group_id:        u8,
    pub storage:         StorageType,
    pub data:            Vec<u8>,
}

/// One sample-id ↔ UTC correspondence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcEntry {
    pub sample_id: i64,
    pub utc:       i64,
}

/// One user-data chunk.
#[derive(Debug, Clone)]
pub struct UserDataRecord {
    pub meta:    u16,
    pub storage: StorageType,
    pub data:    Vec<u8>,
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct Reader {
    core: Core,
}

impl Reader {
    /// Open for reading and materialize the registry.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let raw = RawFile::open(path, Mode::Read)?;
        let mut core = Core::new(raw);
        core.scan_initial()?;
        core.scan_sources()?;
        core.scan_signals()?;
        core.scan_fsr_sample_id()?;
        Ok(Self { core })
    }

    pub fn sources(&self) -> Vec<SourceDef> {
        self.core.source_list()
    }

    pub fn signals(&self) -> Vec<SignalDef> {
        self.core.signal_list()
    }

    pub fn source(&self, source_id: u16) -> Result<SourceDef> {
        self.core
            .source(source_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("source {source_id}")))
    }

    pub fn signal(&self, signal_id: u16) -> Result<SignalDef> {
        Ok(self.core.signal_required(signal_id)?.def.clone())
    }

    // ── FSR length ───────────────────────────────────────────────────────

    /// Total samples stored for an FSR signal (gap fillers included).
    pub fn fsr_length(&mut self, signal_id: u16) -> Result<i64> {
        let def = self.core.signal_required(signal_id)?.def.clone();
        let sid_off = self.core.signal_required(signal_id)?.sample_id_offset;
        let track = self.core.track(signal_id, TrackType::Fsr)?;
        if track.head[0] == 0 {
            return Ok(0);
        }
        let top = (1..MAX_LEVELS).rev().find(|&l| track.head[l] != 0);

        let Some(top) = top else {
            // No INDEX flushed (unclean file): walk the DATA list.
            let mut offset = track.head[0];
            loop {
                self.core.raw.chunk_seek(offset)?;
                match self.core.raw.hdr().item_next {
                    0 => break,
                    next => offset = next,
                }
            }
            let (_, mut payload) = self.core.raw.rd(offset)?;
            let ph = PayloadHeader::decode_from(&mut payload)?;
            return Ok(ph.timestamp + ph.entry_count as i64 - sid_off);
        };

        // Descend the pyramid along the last entry of the last chunk of
        // each level.
        let mut offset = self.last_in_list(self.core.track(signal_id, TrackType::Fsr)?.head[top])?;
        for level in (1..=top).rev() {
            offset = self.last_in_list(offset)?;
            let (ph, offsets) = self.read_fsr_index(offset)?;
            if level > 1 {
                offset = *offsets.last().ok_or_else(|| index_corrupt(offset))? as u64;
                continue;
            }
            // Level 1: the tail may be omitted chunks (offset 0), each a
            // full samples_per_data span.
            let last = *offsets.last().ok_or_else(|| index_corrupt(offset))?;
            let mut end = if last != 0 {
                let (_, mut payload) = self.core.raw.rd(last as u64)?;
                let dph = PayloadHeader::decode_from(&mut payload)?;
                dph.timestamp + dph.entry_count as i64
            } else {
                ph.timestamp + offsets.len() as i64 * def.samples_per_data as i64
            };
            // DATA chunks written after the last flushed INDEX (a flushed
            // but not yet closed file) are only reachable on the item
            // list; walk it from the last physical chunk.
            if let Some(&phys) = offsets.iter().rev().find(|&&o| o != 0) {
                let tail = self.last_in_list(phys as u64)?;
                let (_, mut payload) = self.core.raw.rd(tail)?;
                let dph = PayloadHeader::decode_from(&mut payload)?;
                end = end.max(dph.timestamp + dph.entry_count as i64);
            }
            return Ok(end - sid_off);
        }
        unreachable!("level loop always returns at level 1");
    }

    // ── FSR sample reads ─────────────────────────────────────────────────

    /// Read `sample_count` raw packed samples starting at the zero-based
    /// `start_sample_id`.
    pub fn fsr(
        &mut self,
        signal_id: u16,
        start_sample_id: i64,
        sample_count: usize,
    ) -> Result<Vec<u8>> {
        let def = self.core.signal_required(signal_id)?.def.clone();
        let sid_off = self.core.signal_required(signal_id)?.sample_id_offset;
        let total = self.fsr_length(signal_id)?;
        if start_sample_id < 0 || start_sample_id + sample_count as i64 > total {
            return Err(Error::ParameterInvalid(format!(
                "range [{start_sample_id}, {}) outside signal length {total}",
                start_sample_id + sample_count as i64
            )));
        }
        let bits = def.data_type.size_bits() as usize;
        let mut out = vec![0u8; (sample_count * bits).div_ceil(8)];
        if sample_count == 0 {
            return Ok(out);
        }

        let mut sid = start_sample_id + sid_off;
        let mut out_bit = 0usize;
        let mut remaining = sample_count;

        let track = self.core.track(signal_id, TrackType::Fsr)?;
        let has_index = (1..MAX_LEVELS).any(|l| track.head[l] != 0);
        if !has_index {
            let head = track.head[0];
            self.fsr_walk(&def, head, sid, &mut out, 0, sample_count)?;
            return Ok(out);
        }

        let mut index_offset = self.fsr_seek(signal_id, &def, 1, sid)?;
        let mut last_physical = 0u64;
        'outer: loop {
            let (iph, offsets) = self.read_fsr_index(index_offset)?;
            let spd = def.samples_per_data as i64;
            // Covering SUMMARY stats, loaded on the first omitted entry.
            let mut summary: Option<Vec<[f64; 4]>> = None;
            loop {
                let idx = (sid - iph.timestamp) / spd;
                if idx < 0 {
                    return Err(index_corrupt(index_offset));
                }
                if idx as usize >= offsets.len() {
                    self.core.raw.chunk_seek(index_offset)?;
                    match self.core.raw.hdr().item_next {
                        0 => {
                            // Flushed but unindexed tail: finish on the
                            // DATA item list.
                            let start = if last_physical != 0 {
                                last_physical
                            } else {
                                self.core.track(signal_id, TrackType::Fsr)?.head[0]
                            };
                            self.fsr_walk(&def, start, sid, &mut out, out_bit, remaining)?;
                            break 'outer;
                        }
                        next => index_offset = next,
                    }
                    continue 'outer;
                }
                let chunk_ts = iph.timestamp + idx * spd;
                let within = (sid - chunk_ts) as usize;
                let (packed, avail) = if offsets[idx as usize] != 0 {
                    last_physical = offsets[idx as usize] as u64;
                    let (_, mut payload) = self.core.raw.rd(offsets[idx as usize] as u64)?;
                    let dph = PayloadHeader::decode_from(&mut payload)?;
                    let nbytes = (dph.entry_count as usize * bits).div_ceil(8);
                    (payload.rd_bytes(nbytes)?.to_vec(), dph.entry_count as usize)
                } else {
                    if summary.is_none() {
                        summary = Some(self.read_following_summary(index_offset)?);
                    }
                    let stats = summary.as_ref().unwrap();
                    (
                        synthesize_chunk(&def, iph.timestamp, chunk_ts, stats),
                        def.samples_per_data as usize,
                    )
                };
                if within >= avail {
                    return Err(Error::Truncated("DATA chunk shorter than expected".into()));
                }
                let n = remaining.min(avail - within);
                copy_bits(&mut out, out_bit, &packed, within * bits, n * bits);
                out_bit += n * bits;
                sid += n as i64;
                remaining -= n;
                if remaining == 0 {
                    break 'outer;
                }
            }
        }
        Ok(out)
    }

    /// Typed convenience for F32 signals.
    pub fn fsr_f32(
        &mut self,
        signal_id: u16,
        start_sample_id: i64,
        sample_count: usize,
    ) -> Result<Vec<f32>> {
        if self.core.signal_required(signal_id)?.def.data_type != DataType::F32 {
            return Err(Error::ParameterInvalid(format!(
                "signal {signal_id} is not F32"
            )));
        }
        let packed = self.fsr(signal_id, start_sample_id, sample_count)?;
        Ok(packed
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
            .collect())
    }

    /// Read by walking the DATA item list from `offset` — the path for
    /// files without a flushed INDEX level, and for the unindexed tail of
    /// a flushed-but-unclosed file.
    fn fsr_walk(
        &mut self,
        def: &SignalDef,
        mut offset: u64,
        start_sid: i64,
        out: &mut [u8],
        mut out_bit: usize,
        mut remaining: usize,
    ) -> Result<()> {
        let bits = def.data_type.size_bits() as usize;
        let mut sid = start_sid;
        while remaining > 0 && offset != 0 {
            let (hdr, mut payload) = self.core.raw.rd(offset)?;
            let ph = PayloadHeader::decode_from(&mut payload)?;
            let end = ph.timestamp + ph.entry_count as i64;
            if sid < end {
                if sid < ph.timestamp {
                    // Hole (crash lost an omitted chunk's index); leave
                    // zero filler until the next physical chunk.
                    let n = (remaining as i64).min(ph.timestamp - sid) as usize;
                    out_bit += n * bits;
                    sid += n as i64;
                    remaining -= n;
                    continue;
                }
                let within = (sid - ph.timestamp) as usize;
                let nbytes = (ph.entry_count as usize * bits).div_ceil(8);
                let packed = payload.rd_bytes(nbytes)?;
                let n = remaining.min(ph.entry_count as usize - within);
                copy_bits(out, out_bit, packed, within * bits, n * bits);
                out_bit += n * bits;
                sid += n as i64;
                remaining -= n;
            }
            offset = hdr.item_next;
        }
        Ok(())
    }

    // ── FSR statistics ───────────────────────────────────────────────────

    /// `length` rows of `{mean, min, max, std}` over consecutive windows
    /// of `increment` samples starting at `start_sample_id`.
    ///
    /// Large increments aggregate SUMMARY entries of the deepest level
    /// whose span fits; small increments compute from raw samples.  A row
    /// whose window captures no entry reports NaN.
    pub fn fsr_statistics(
        &mut self,
        signal_id: u16,
        start_sample_id: i64,
        increment: i64,
        length: usize,
    ) -> Result<Vec<[f64; 4]>> {
        if increment < 1 || length == 0 {
            return Err(Error::ParameterInvalid(
                "increment must be ≥ 1 and length ≥ 1".into(),
            ));
        }
        let def = self.core.signal_required(signal_id)?.def.clone();
        let sid_off = self.core.signal_required(signal_id)?.sample_id_offset;
        let total = self.fsr_length(signal_id)?;
        if start_sample_id < 0 || start_sample_id + increment * length as i64 > total {
            return Err(Error::ParameterInvalid(format!(
                "statistics range outside signal length {total}"
            )));
        }

        let sdf = def.sample_decimate_factor as i64;
        let track = self.core.track(signal_id, TrackType::Fsr)?;
        let has_index = (1..MAX_LEVELS).any(|l| track.head[l] != 0);

        if increment < sdf || !has_index {
            return self.statistics_from_samples(signal_id, &def, start_sample_id, increment, length);
        }

        // Deepest level whose per-entry span fits inside one window.
        let mut level = 1u8;
        for l in 2..MAX_LEVELS as u8 {
            let track = self.core.track(signal_id, TrackType::Fsr)?;
            if track.head[l as usize] == 0 || def.summary_entry_span(l) > increment {
                break;
            }
            level = l;
        }
        let span = def.summary_entry_span(level);

        let start_file = start_sample_id + sid_off;
        let index_offset = self.fsr_seek(signal_id, &def, level, start_file)?;
        self.core.raw.chunk_seek(index_offset)?;
        self.core.raw.chunk_next()?;
        let mut summary_offset = self.core.raw.offset();

        let mut rows: Vec<[f64; 4]> = Vec::with_capacity(length);
        let mut group: Vec<[f64; 4]> = Vec::new();
        let mut row_end = start_file + increment;

        'chunks: loop {
            let (sph, stats) = self.read_fsr_summary(summary_offset)?;
            for (j, &entry) in stats.iter().enumerate() {
                // A row aggregates the entries whose span START falls in
                // its window; straddlers belong to the previous window.
                let pos = sph.timestamp + j as i64 * span;
                if pos < start_file {
                    continue;
                }
                while pos >= row_end {
                    rows.push(combine_stats(&group));
                    group.clear();
                    row_end += increment;
                    if rows.len() == length {
                        break 'chunks;
                    }
                }
                group.push(entry);
            }
            self.core.raw.chunk_seek(summary_offset)?;
            match self.core.raw.hdr().item_next {
                0 => break,
                next => summary_offset = next,
            }
        }
        while rows.len() < length {
            rows.push(combine_stats(&group));
            group.clear();
        }
        Ok(rows)
    }

    fn statistics_from_samples(
        &mut self,
        signal_id: u16,
        def: &SignalDef,
        start: i64,
        increment: i64,
        length: usize,
    ) -> Result<Vec<[f64; 4]>> {
        let count = (increment * length as i64) as usize;
        let packed = self.fsr(signal_id, start, count)?;
        let samples = decode_samples(&packed, count, def.data_type);
        Ok(samples
            .chunks(increment as usize)
            .take(length)
            .map(stats_from_samples)
            .collect())
    }

    // ── Annotations ──────────────────────────────────────────────────────

    /// Iterate annotations with `timestamp ≥ timestamp_from`, in order.
    /// The callback returns `true` to continue, `false` to stop.
    pub fn annotations<F>(
        &mut self,
        signal_id: u16,
        timestamp_from: i64,
        mut callback: F,
    ) -> Result<()>
    where
        F: FnMut(&AnnotationRecord) -> bool,
    {
        let mut offset = match self.ts_seek(signal_id, TrackType::Annotation, 0, timestamp_from)? {
            Some(offset) => offset,
            None => return Ok(()),
        };
        loop {
            let (hdr, mut payload) = self.core.raw.rd(offset)?;
            let ph = PayloadHeader::decode_from(&mut payload)?;
            if ph.timestamp >= timestamp_from {
                let y = payload.rd_f32()?;
                let annotation_type = AnnotationType::from_u8(payload.rd_u8()?)
                    .ok_or_else(|| Error::UnsupportedFile("unknown annotation type".into()))?;
                let storage = StorageType::from_u8(payload.rd_u8()?)
                    .ok_or_else(|| Error::UnsupportedFile("unknown storage type".into()))?;
                let group_id = payload.rd_u8()?;
                payload.rd_skip(1)?;
                let size = payload.rd_u32()? as usize;
                let data = payload.rd_bytes(size)?.to_vec();
                let record = AnnotationRecord {
                    timestamp: ph.timestamp,
                    y,
                    annotation_type,
                    group_id,
                    storage,
                    data,
                };
                if !callback(&record) {
                    return Ok(());
                }
            }
            match hdr.item_next {
                0 => return Ok(()),
                next => offset = next,
            }
        }
    }

    // ── UTC ──────────────────────────────────────────────────────────────

    /// Iterate sample-id↔UTC batches (level-1 SUMMARY chunks, up to
    /// `utc_decimate_factor` pairs each) starting at or before
    /// `sample_id_from`.
    pub fn utc<F>(&mut self, signal_id: u16, sample_id_from: i64, mut callback: F) -> Result<()>
    where
        F: FnMut(&[UtcEntry]) -> bool,
    {
        let Some(index_offset) = self.ts_seek(signal_id, TrackType::Utc, 1, sample_id_from)?
        else {
            // No level-1 SUMMARY flushed (unclean file): batch the raw
            // DATA chunks instead.
            let def = self.core.signal_required(signal_id)?.def.clone();
            let mut offset = self.core.track(signal_id, TrackType::Utc)?.head[0];
            let mut batch = Vec::new();
            while offset != 0 {
                let (hdr, mut payload) = self.core.raw.rd(offset)?;
                let ph = PayloadHeader::decode_from(&mut payload)?;
                batch.push(UtcEntry { sample_id: ph.timestamp, utc: payload.rd_i64()? });
                if batch.len() >= def.utc_decimate_factor as usize {
                    if !callback(&batch) {
                        return Ok(());
                    }
                    batch.clear();
                }
                offset = hdr.item_next;
            }
            if !batch.is_empty() {
                callback(&batch);
            }
            return Ok(());
        };
        // The SUMMARY chunk physically follows its INDEX chunk.
        self.core.raw.chunk_seek(index_offset)?;
        self.core.raw.chunk_next()?;
        let mut offset = self.core.raw.offset();
        loop {
            let (hdr, mut payload) = self.core.raw.rd(offset)?;
            let ph = PayloadHeader::decode_from(&mut payload)?;
            let mut entries = Vec::with_capacity(ph.entry_count as usize);
            for _ in 0..ph.entry_count {
                let sample_id = payload.rd_i64()?;
                let utc = payload.rd_i64()?;
                entries.push(UtcEntry { sample_id, utc });
            }
            if !callback(&entries) {
                return Ok(());
            }
            match hdr.item_next {
                0 => return Ok(()),
                next => offset = next,
            }
        }
    }

    // ── User data ────────────────────────────────────────────────────────

    /// Iterate USER_DATA records in file order (the open-time sentinel is
    /// skipped).
    pub fn user_data<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&UserDataRecord) -> bool,
    {
        let mut offset = self.core.user_anchor;
        let mut first = true;
        while offset != 0 {
            let (hdr, mut payload) = self.core.raw.rd(offset)?;
            let skip_sentinel = first && hdr.payload_length == 0;
            first = false;
            if !skip_sentinel {
                let storage = meta_storage_type(hdr.chunk_meta)
                    .ok_or_else(|| Error::UnsupportedFile("unknown user-data storage".into()))?;
                let record = UserDataRecord {
                    meta:    hdr.chunk_meta & 0x0FFF,
                    storage,
                    data:    payload.rd_bytes(hdr.payload_length as usize)?.to_vec(),
                };
                if !callback(&record) {
                    return Ok(());
                }
            }
            offset = hdr.item_next;
        }
        Ok(())
    }

    // ── Seek helpers ─────────────────────────────────────────────────────

    /// Follow `item_next` to the last chunk of a list.
    fn last_in_list(&mut self, mut offset: u64) -> Result<u64> {
        loop {
            self.core.raw.chunk_seek(offset)?;
            match self.core.raw.hdr().item_next {
                0 => return Ok(offset),
                next => offset = next,
            }
        }
    }

    /// Descend the FSR pyramid to the level-`target_level` INDEX chunk
    /// containing `sample_id` (file coordinates).
    fn fsr_seek(
        &mut self,
        signal_id: u16,
        def: &SignalDef,
        target_level: u8,
        sample_id: i64,
    ) -> Result<u64> {
        let track = self.core.track(signal_id, TrackType::Fsr)?;
        let top = (target_level as usize..MAX_LEVELS)
            .rev()
            .find(|&l| track.head[l] != 0)
            .ok_or_else(|| Error::NotFound(format!("signal {signal_id} has no summary level")))?;

        let mut offset = self.core.track(signal_id, TrackType::Fsr)?.head[top];
        for level in (target_level..=top as u8).rev() {
            // Walk sibling INDEX chunks while the target lies beyond this
            // chunk's coverage.
            let span = def.index_entry_span(level);
            loop {
                let (ph, offsets) = self.read_fsr_index(offset)?;
                let idx = (sample_id - ph.timestamp) / span;
                if idx < 0 {
                    return Err(index_corrupt(offset));
                }
                if (idx as usize) < offsets.len() {
                    if level == target_level {
                        return Ok(offset);
                    }
                    let child = offsets[idx as usize];
                    if child == 0 {
                        return Err(index_corrupt(offset));
                    }
                    offset = child as u64;
                    break;
                }
                self.core.raw.chunk_seek(offset)?;
                match self.core.raw.hdr().item_next {
                    0 if level == target_level => return Ok(offset),
                    0 => return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("sample {sample_id} beyond level-{level} index"),
                    ))),
                    next => offset = next,
                }
            }
        }
        Ok(offset)
    }

    /// Descend a timeseries track to the level-`target_level` chunk whose
    /// first entry is at or before `timestamp` (DATA chunk for level 0,
    /// INDEX chunk for level ≥ 1).  `None` when the track is empty.
    fn ts_seek(
        &mut self,
        signal_id: u16,
        track_type: TrackType,
        target_level: u8,
        timestamp: i64,
    ) -> Result<Option<u64>> {
        let track = self.core.track(signal_id, track_type)?;
        let top = (target_level.max(1) as usize..MAX_LEVELS)
            .rev()
            .find(|&l| track.head[l] != 0);

        let Some(top) = top else {
            return Ok(match target_level {
                0 => {
                    let head = track.head[0];
                    (head != 0).then_some(head)
                }
                _ => None,
            });
        };

        let mut offset = self.core.track(signal_id, track_type)?.head[top];
        for level in (target_level.max(1)..=top as u8).rev() {
            // Advance among siblings while a later chunk still starts at
            // or before the target.
            loop {
                self.core.raw.chunk_seek(offset)?;
                let next = self.core.raw.hdr().item_next;
                if next == 0 {
                    break;
                }
                let (_, mut payload) = self.core.raw.rd(next)?;
                let ph = PayloadHeader::decode_from(&mut payload)?;
                if ph.timestamp <= timestamp {
                    offset = next;
                } else {
                    break;
                }
            }
            if level == target_level {
                return Ok(Some(offset));
            }
            let entries = self.read_ts_index(offset)?;
            if entries.is_empty() {
                return Err(index_corrupt(offset));
            }
            let idx = entries
                .iter()
                .rposition(|&(ts, _)| ts <= timestamp)
                .unwrap_or(0);
            let child = entries[idx].1;
            if child == 0 {
                return Err(index_corrupt(offset));
            }
            offset = child as u64;
            if level - 1 == target_level {
                return Ok(Some(offset));
            }
        }
        Ok(Some(offset))
    }

    // ── Payload readers ──────────────────────────────────────────────────

    fn read_fsr_index(&mut self, offset: u64) -> Result<(PayloadHeader, Vec<i64>)> {
        let (_, mut payload) = self.core.raw.rd(offset)?;
        let ph = PayloadHeader::decode_from(&mut payload)?;
        let mut offsets = Vec::with_capacity(ph.entry_count as usize);
        for _ in 0..ph.entry_count {
            offsets.push(payload.rd_i64()?);
        }
        Ok((ph, offsets))
    }

    fn read_fsr_summary(&mut self, offset: u64) -> Result<(PayloadHeader, Vec<[f64; 4]>)> {
        let (_, mut payload) = self.core.raw.rd(offset)?;
        let ph = PayloadHeader::decode_from(&mut payload)?;
        let wide = ph.entry_size_bits == 256;
        let mut stats = Vec::with_capacity(ph.entry_count as usize);
        for _ in 0..ph.entry_count {
            let mut quad = [0f64; 4];
            for v in quad.iter_mut() {
                *v = if wide { payload.rd_f64()? } else { payload.rd_f32()? as f64 };
            }
            stats.push(quad);
        }
        Ok((ph, stats))
    }

    fn read_ts_index(&mut self, offset: u64) -> Result<Vec<(i64, i64)>> {
        let (_, mut payload) = self.core.raw.rd(offset)?;
        let ph = PayloadHeader::decode_from(&mut payload)?;
        let mut entries = Vec::with_capacity(ph.entry_count as usize);
        for _ in 0..ph.entry_count {
            let ts = payload.rd_i64()?;
            let offset = payload.rd_i64()?;
            entries.push((ts, offset));
        }
        Ok(entries)
    }

    /// Stats of the SUMMARY chunk physically following an INDEX chunk.
    fn read_following_summary(&mut self, index_offset: u64) -> Result<Vec<[f64; 4]>> {
        self.core.raw.chunk_seek(index_offset)?;
        self.core.raw.chunk_next()?;
        let offset = self.core.raw.offset();
        let (_, stats) = self.read_fsr_summary(offset)?;
        Ok(stats)
    }
}

fn index_corrupt(offset: u64) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("index entry out of range in chunk at offset {offset}"),
    ))
}

// ── Omitted-chunk synthesis ──────────────────────────────────────────────────

/// Regenerate an omitted DATA chunk from its covering SUMMARY entries.
///
/// Float signals get Box–Muller noise with per-sample-id seeding so the
/// empirical mean/std track the stored stats and every read produces the
/// same bytes.  Integer signals ≤ 8 bits get the rounded mean.
fn synthesize_chunk(
    def: &SignalDef,
    summary_ts: i64,
    chunk_ts: i64,
    stats: &[[f64; 4]],
) -> Vec<u8> {
    let bits = def.data_type.size_bits() as usize;
    let spd = def.samples_per_data as usize;
    let sdf = def.sample_decimate_factor as i64;
    let mut out = vec![0u8; (spd * bits).div_ceil(8)];

    let entry_for = |sid: i64| -> [f64; 4] {
        let idx = ((sid - summary_ts) / sdf).clamp(0, stats.len() as i64 - 1) as usize;
        stats[idx]
    };

    match def.data_type.base() {
        BaseType::Float => {
            for k in 0..spd {
                let sid = chunk_ts + k as i64;
                let [mean, _, _, std] = entry_for(sid);
                let v = mean + std * gauss(sid as u64);
                if bits == 32 {
                    out[k * 4..k * 4 + 4].copy_from_slice(&(v as f32).to_le_bytes());
                } else {
                    out[k * 8..k * 8 + 8].copy_from_slice(&v.to_le_bytes());
                }
            }
        }
        _ => {
            // The chunk was constant; rebuild the constant from the first
            // covering entry's mean (undoing fixed-point scaling).
            let [mean, _, _, _] = entry_for(chunk_ts);
            let scale = if def.data_type.q() > 0 {
                (1u64 << def.data_type.q()) as f64
            } else {
                1.0
            };
            let max = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
            let raw = (mean * scale).round().clamp(0.0, max as f64) as u64;
            let src = raw.to_le_bytes();
            for k in 0..spd {
                copy_bits(&mut out, k * bits, &src, 0, bits);
            }
        }
    }
    out
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Deterministic standard normal from a sample-id seed (Box–Muller).
fn gauss(seed: u64) -> f64 {
    let a = splitmix64(seed);
    let b = splitmix64(a);
    let u1 = ((a >> 11) as f64 + 1.0) / (1u64 << 53) as f64;
    let u2 = (b >> 11) as f64 / (1u64 << 53) as f64;
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauss_is_deterministic_and_plausible() {
        assert_eq!(gauss(42), gauss(42));
        assert_ne!(gauss(42), gauss(43));
        let n = 100_000;
        let (mut sum, mut sq) = (0.0f64, 0.0f64);
        for i in 0..n {
            let v = gauss(i);
            sum += v;
            sq += v * v;
        }
        let mean = sum / n as f64;
        let std = (sq / n as f64 - mean * mean).sqrt();
        assert!(mean.abs() < 0.02, "mean {mean}");
        assert!((std - 1.0).abs() < 0.02, "std {std}");
    }

    #[test]
    fn synthesized_constant_chunk_matches_mean() {
        let mut def = SignalDef::new(1, 1, DataType::U8, 1000);
        def.align();
        let stats = vec![[7.0, 7.0, 7.0, 0.0]];
        let out = synthesize_chunk(&def, 0, 0, &stats);
        assert!(out.iter().all(|&b| b == 7));
    }
}
