//! Timeseries track writer — annotations and sample↔UTC mappings.
//!
//! Unlike the FSR pyramid, timeseries tracks index *individual* DATA
//! chunks: every annotation (or UTC pair) is its own DATA chunk, written
//! by the facade, and registered here.  Each level L ≥ 1 buffers
//!
//! - an INDEX entry `{timestamp, offset}` per lower item, and
//! - a 16-byte SUMMARY record carrying the compact per-item data
//!   (annotation: type/storage/group/y; UTC: sample_id/utc).
//!
//! When a level holds `decimate_factor` entries it commits: INDEX chunk,
//! then SUMMARY chunk, then one entry propagated upward (the INDEX
//! chunk's offset plus the first record as representative).  On close all
//! non-empty levels commit without upward propagation.

use crate::buf::Buf;
use crate::core::{Core, TrackList, MAX_LEVELS};
use crate::error::Result;
use crate::format::{PayloadHeader, TrackType};

/// 16-byte compact record stored in timeseries SUMMARY chunks.
pub(crate) type TsRecord = [u8; 16];

const TS_ENTRY_BITS: u16 = 128;

#[derive(Debug, Default)]
struct TsLevel {
    /// `{timestamp, offset}` per lower item.
    index:   Vec<(i64, i64)>,
    summary: Vec<TsRecord>,
}

pub(crate) struct TsWriter {
    signal_id: u16,
    track:     TrackType,
    decimate:  u32,
    levels:    Vec<Option<TsLevel>>,
}

impl TsWriter {
    pub fn new(signal_id: u16, track: TrackType, decimate: u32) -> Self {
        let mut levels = Vec::new();
        levels.resize_with(MAX_LEVELS, || None);
        Self { signal_id, track, decimate: decimate.max(1), levels }
    }

    /// Register a caller-written DATA chunk at `offset`.
    pub fn add_entry(
        &mut self,
        core: &mut Core,
        timestamp: i64,
        offset: u64,
        record: TsRecord,
    ) -> Result<()> {
        self.push(core, 1, timestamp, offset as i64, record)
    }

    /// Buffer one entry at `level`; also the repair replay entry point.
    pub(crate) fn push(
        &mut self,
        core: &mut Core,
        level: usize,
        timestamp: i64,
        offset: i64,
        record: TsRecord,
    ) -> Result<()> {
        let lvl = self.levels[level].get_or_insert_with(TsLevel::default);
        lvl.index.push((timestamp, offset));
        lvl.summary.push(record);
        if lvl.index.len() >= self.decimate as usize {
            self.commit(core, level, false)?;
        }
        Ok(())
    }

    /// Write this level's INDEX and SUMMARY chunks and, unless closing,
    /// propagate one representative entry upward.
    fn commit(&mut self, core: &mut Core, level: usize, on_close: bool) -> Result<()> {
        let Some(mut lvl) = self.levels[level].take() else {
            return Ok(());
        };
        if lvl.index.is_empty() {
            self.levels[level] = Some(lvl);
            return Ok(());
        }

        let timestamp = lvl.index[0].0;
        let n = lvl.index.len() as u32;

        let mut index = Buf::with_capacity(16 + lvl.index.len() * 16);
        PayloadHeader { timestamp, entry_count: n, entry_size_bits: TS_ENTRY_BITS }
            .encode_into(&mut index);
        for &(ts, offset) in &lvl.index {
            index.wr_i64(ts);
            index.wr_i64(offset);
        }
        let index_offset = core.wr_track_chunk(
            self.signal_id,
            self.track,
            TrackList::Index(level as u8),
            index.as_slice(),
        )?;

        let mut summary = Buf::with_capacity(16 + lvl.summary.len() * 16);
        PayloadHeader { timestamp, entry_count: n, entry_size_bits: TS_ENTRY_BITS }
            .encode_into(&mut summary);
        for rec in &lvl.summary {
            summary.wr_bytes(rec);
        }
        core.wr_track_chunk(
            self.signal_id,
            self.track,
            TrackList::Summary(level as u8),
            summary.as_slice(),
        )?;

        let representative = lvl.summary[0];
        lvl.index.clear();
        lvl.summary.clear();
        self.levels[level] = Some(lvl);

        if !on_close && level + 1 < MAX_LEVELS {
            self.push(core, level + 1, timestamp, index_offset as i64, representative)?;
        }
        Ok(())
    }

    /// Commit every non-empty level; upward propagation is suppressed so
    /// the cascade terminates at the existing depth.
    pub fn close(&mut self, core: &mut Core) -> Result<()> {
        for level in 1..MAX_LEVELS {
            if self.levels[level].as_ref().is_some_and(|l| !l.index.is_empty()) {
                self.commit(core, level, true)?;
            }
        }
        Ok(())
    }
}

// ── Record encoding ──────────────────────────────────────────────────────────

/// Annotation SUMMARY record:
/// `{timestamp:i64, annotation_type:u8, storage_type:u8, group_id:u8,
///   reserved:u8, y:f32}`.
pub(crate) fn annotation_record(
    timestamp: i64,
    annotation_type: u8,
    storage_type: u8,
    group_id: u8,
    y: f32,
) -> TsRecord {
    let mut rec = [0u8; 16];
    rec[0..8].copy_from_slice(&timestamp.to_le_bytes());
    rec[8] = annotation_type;
    rec[9] = storage_type;
    rec[10] = group_id;
    rec[12..16].copy_from_slice(&y.to_le_bytes());
    rec
}

/// UTC SUMMARY record: `{sample_id:i64, timestamp:i64}`.
pub(crate) fn utc_record(sample_id: i64, utc: i64) -> TsRecord {
    let mut rec = [0u8; 16];
    rec[0..8].copy_from_slice(&sample_id.to_le_bytes());
    rec[8..16].copy_from_slice(&utc.to_le_bytes());
    rec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layouts() {
        let rec = annotation_record(0x1122_3344, 1, 2, 3, 1.0);
        assert_eq!(&rec[0..8], &0x1122_3344i64.to_le_bytes());
        assert_eq!(rec[8], 1);
        assert_eq!(rec[9], 2);
        assert_eq!(rec[10], 3);
        assert_eq!(rec[11], 0);
        assert_eq!(&rec[12..16], &1.0f32.to_le_bytes());

        let rec = utc_record(7, -9);
        assert_eq!(&rec[0..8], &7i64.to_le_bytes());
        assert_eq!(&rec[8..16], &(-9i64).to_le_bytes());
    }
}
