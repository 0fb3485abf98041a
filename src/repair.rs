//! Post-crash repair — reclaim a file whose writer never closed.
//!
//! A crashed writer leaves three kinds of damage:
//!
//! 1. a garbage tail (a chunk header or payload written partially);
//! 2. dangling `item_next` pointers into that tail, and HEAD offsets for
//!    levels whose first chunk never made it to disk;
//! 3. lost in-memory summary buffers — DATA chunks exist whose level-1
//!    entries were never written, and lower-level INDEX chunks exist that
//!    no upper level references.
//!
//! [`repair`] fixes all three in place: it scans the file tail for the
//! last fully CRC-valid chunk and truncates after it, rebuilds every item
//! list tail and HEAD array by walking the surviving chunks, replays
//! unreferenced INDEX/SUMMARY chunks and uncovered DATA chunks through
//! the normal writer machinery to regenerate the missing summary levels,
//! and finally closes the file the ordinary way (END chunk + header
//! length).  A repaired file is indistinguishable from one that closed
//! gracefully, minus any samples that never reached the disk.

use std::collections::HashMap;

use log::{debug, warn};

use crate::backend::Mode;
use crate::buf::Buf;
use crate::core::{Core, ItemTail, MAX_LEVELS};
use crate::error::{Error, Result};
use crate::format::{
    chunk_size_on_disk, track_tag_parts, ChunkHeader, ChunkRole, PayloadHeader, TrackType,
    FILE_HEADER_SIZE, TAG_END, TAG_SIGNAL_DEF, TAG_SOURCE_DEF, TAG_USER_DATA,
};
use crate::fsr::{decode_samples, FsrWriter};
use crate::raw::RawFile;
use crate::ts::{annotation_record, utc_record, TsRecord, TsWriter};
use crate::types::{SignalDef, SignalType};
use crate::writer::Writer;

/// Tail-scan window size.
const SCAN_WINDOW: u64 = 1024;

/// Per-track chunk offsets collected by the physical walk, in file order.
#[derive(Debug, Default)]
struct Replay {
    data:  Vec<u64>,
    index: [Vec<u64>; MAX_LEVELS],
}

/// Repair `path` in place.  A no-op on files that are already clean.
pub fn repair<P: AsRef<std::path::Path>>(path: P) -> Result<()> {
    let raw = RawFile::open(path, Mode::Append)?;
    let mut core = Core::new(raw);

    // 1. Locate the last fully valid chunk and drop everything after it.
    let Some((last_offset, last_hdr)) = find_chunk_end(&mut core.raw)? else {
        return Err(Error::Truncated("no valid chunk survives".into()));
    };
    if core.raw.closed_cleanly() && last_hdr.tag == TAG_END {
        debug!("file is already clean, nothing to repair");
        return Ok(());
    }
    core.raw.chunk_seek(last_offset)?;
    core.raw.truncate_after_current()?;
    core.raw.set_prev_payload_length(last_hdr.payload_length);
    if last_hdr.tag == TAG_END {
        // Everything was drained; only the header length is stale.
        return core.raw.close();
    }
    warn!(
        "repairing: last valid chunk at offset {last_offset}, file truncated to {}",
        core.raw.end()
    );

    // 2. Registry scans, as on a normal read open.
    core.scan_initial()?;
    core.scan_sources()?;
    core.scan_signals()?;
    core.scan_fsr_sample_id()?;

    // 3. Physical walk: rebuild list tails and HEAD arrays, clear dangling
    //    pointers, and collect the per-track chunk lists for replay.
    let replay = rebuild_pointers(&mut core)?;

    // 4. Replay the pyramid bottom-up to restore the lost writer state.
    for signal_id in core.signal_ids() {
        let def = core.signal_required(signal_id)?.def.clone();
        let tracks = replay.get(&signal_id);
        let take = |track: TrackType| -> Replay {
            tracks
                .and_then(|t| t.get(track as usize))
                .map(|r| Replay { data: r.data.clone(), index: r.index.clone() })
                .unwrap_or_default()
        };
        match def.signal_type {
            SignalType::Fsr => {
                let fsr = rebuild_fsr(&mut core, &def, &take(TrackType::Fsr))?;
                let anno = rebuild_ts(
                    &mut core,
                    TrackType::Annotation,
                    def.annotation_decimate_factor,
                    &def,
                    &take(TrackType::Annotation),
                )?;
                let utc = rebuild_ts(
                    &mut core,
                    TrackType::Utc,
                    def.utc_decimate_factor,
                    &def,
                    &take(TrackType::Utc),
                )?;
                let state = core.signal_mut(signal_id)?;
                state.fsr = Some(fsr);
                state.anno = Some(anno);
                state.utc = Some(utc);
            }
            SignalType::Vsr => {
                let anno = rebuild_ts(
                    &mut core,
                    TrackType::Annotation,
                    def.annotation_decimate_factor,
                    &def,
                    &take(TrackType::Annotation),
                )?;
                core.signal_mut(signal_id)?.anno = Some(anno);
            }
        }
    }

    // 5. Close normally: drains the replayed buffers, writes END, fixes
    //    the header length.
    Writer::from_core(core).close()
}

// ── Tail scan ────────────────────────────────────────────────────────────────

/// Scan backwards in [`SCAN_WINDOW`] windows for the last 8-byte-aligned
/// offset holding a chunk whose header CRC validates, whose payload fits
/// the file, and whose payload CRC validates.
fn find_chunk_end(raw: &mut RawFile) -> Result<Option<(u64, ChunkHeader)>> {
    let file_end = raw.end();
    let mut window_end = file_end;
    while window_end > FILE_HEADER_SIZE as u64 {
        let window_start = window_end
            .saturating_sub(SCAN_WINDOW)
            .max(FILE_HEADER_SIZE as u64);
        let mut best: Option<(u64, ChunkHeader)> = None;
        let mut offset = window_start.next_multiple_of(8);
        while offset < window_end {
            if let Ok(hdr) = raw.chunk_seek(offset) {
                let hdr = *hdr;
                if offset + chunk_size_on_disk(hdr.payload_length) <= file_end
                    && raw.rd_payload().is_ok()
                {
                    best = Some((offset, hdr));
                }
            }
            offset += 8;
        }
        if best.is_some() {
            return Ok(best);
        }
        window_end = window_start;
    }
    Ok(None)
}

// ── Pointer rebuild ──────────────────────────────────────────────────────────

fn rebuild_pointers(core: &mut Core) -> Result<HashMap<u16, [Replay; 4]>> {
    let end = core.raw.end();
    let mut replay: HashMap<u16, [Replay; 4]> = HashMap::new();
    let mut heads: HashMap<(u16, u8), [u64; MAX_LEVELS]> = HashMap::new();

    let mut step = core.raw.chunk_first().map(|h| *h);
    loop {
        let mut hdr = match step {
            Ok(hdr) => hdr,
            Err(Error::Empty) => break,
            Err(Error::MessageIntegrity(msg)) => {
                // Cannot happen after truncation to a valid chunk, but a
                // torn middle chunk must not abort the whole repair.
                warn!("pointer walk stopped at corrupt chunk: {msg}");
                break;
            }
            Err(e) => return Err(e),
        };
        let offset = core.raw.offset();

        if hdr.item_next != 0 && hdr.item_next >= end {
            hdr.item_next = 0;
            core.raw.wr_header_at(offset, &hdr)?;
        }

        let tail = ItemTail { offset, hdr };
        match hdr.tag {
            TAG_SOURCE_DEF => core.source_tail = tail,
            TAG_SIGNAL_DEF => core.signal_tail = tail,
            TAG_USER_DATA => core.user_tail = tail,
            TAG_END => {}
            tag => {
                if let Some((track, role)) = track_tag_parts(tag) {
                    let signal_id = crate::format::meta_signal_id(hdr.chunk_meta);
                    let level = crate::format::meta_level(hdr.chunk_meta) as usize;
                    match role {
                        ChunkRole::Def | ChunkRole::Head => core.signal_tail = tail,
                        ChunkRole::Data | ChunkRole::Index | ChunkRole::Summary => {
                            let state = core
                                .signal_mut(signal_id)?
                                .tracks[track as usize]
                                .as_mut()
                                .ok_or_else(|| {
                                    Error::UnsupportedFile(format!(
                                        "track chunk for undefined signal {signal_id}"
                                    ))
                                })?;
                            let head =
                                heads.entry((signal_id, track as u8)).or_insert([0; MAX_LEVELS]);
                            match role {
                                ChunkRole::Data => {
                                    state.data_tail = tail;
                                    if head[0] == 0 {
                                        head[0] = offset;
                                    }
                                    replay.entry(signal_id).or_default()[track as usize]
                                        .data
                                        .push(offset);
                                }
                                ChunkRole::Index => {
                                    state.index_tail[level] = tail;
                                    if head[level] == 0 {
                                        head[level] = offset;
                                    }
                                    replay.entry(signal_id).or_default()[track as usize].index
                                        [level]
                                        .push(offset);
                                }
                                ChunkRole::Summary => state.summary_tail[level] = tail,
                                _ => unreachable!(),
                            }
                        }
                    }
                } else {
                    warn!("unknown tag {tag:#04x} at offset {offset}, skipping");
                }
            }
        }
        step = core.raw.chunk_next().map(|h| *h);
    }

    // Rewrite every HEAD with the offsets actually observed; levels whose
    // chunks were lost go back to zero.
    for signal_id in core.signal_ids() {
        for track in TrackType::ALL {
            let Ok(state) = core.track(signal_id, track) else {
                continue;
            };
            let head_offset = state.head_offset;
            let rebuilt = heads
                .get(&(signal_id, track as u8))
                .copied()
                .unwrap_or([0; MAX_LEVELS]);
            if let Some(state) = core.signal_mut(signal_id)?.tracks[track as usize].as_mut() {
                state.head = rebuilt;
            }
            core.rewrite_head(head_offset, &rebuilt)?;
        }
    }
    Ok(replay)
}

// ── FSR replay ───────────────────────────────────────────────────────────────

fn rebuild_fsr(core: &mut Core, def: &SignalDef, replay: &Replay) -> Result<FsrWriter> {
    let mut w = FsrWriter::new(def);
    if replay.data.is_empty() && replay.index[1].is_empty() {
        return Ok(w);
    }

    // First sample id ever written, from the oldest surviving chunk.
    let first_ts = if let Some(&first) = replay.index[1].first() {
        payload_header(core, first)?.timestamp
    } else {
        payload_header(core, replay.data[0])?.timestamp
    };

    // covered[L]: first sample id NOT covered by the written level-L
    // INDEX chain.
    let mut covered = [0i64; MAX_LEVELS];
    for level in 1..MAX_LEVELS {
        if let Some(&last) = replay.index[level].last() {
            let ph = payload_header(core, last)?;
            covered[level] =
                ph.timestamp + ph.entry_count as i64 * def.index_entry_span(level as u8);
        }
    }

    // Upper levels first: feed each INDEX chunk no higher level references
    // into the level above, oldest first, so buffer order stays
    // chronological when the level-0 replay later commits into it.
    for level in 1..MAX_LEVELS - 1 {
        if replay.index[level].is_empty() {
            continue;
        }
        for &offset in &replay.index[level] {
            let ph = payload_header(core, offset)?;
            if ph.timestamp < covered[level + 1] {
                continue;
            }
            let stats = following_summary_stats(core, offset)?;
            w.summarize_next(core, level + 1, offset as i64, ph.timestamp, &stats, false)?;
        }
    }

    // Level 0: re-summarize DATA chunks past the level-1 coverage.  Gaps
    // between surviving chunks were omitted constants whose summaries are
    // lost; refill them as unknown (zero / NaN) spans.
    let spd = def.samples_per_data as i64;
    let mut cursor = covered[1].max(first_ts);
    let mut last_end = covered[1];
    for &offset in &replay.data {
        let (_, mut payload) = core.raw.rd(offset)?;
        let ph = PayloadHeader::decode_from(&mut payload)?;
        last_end = last_end.max(ph.timestamp + ph.entry_count as i64);
        if ph.timestamp < covered[1] {
            continue;
        }
        while cursor < ph.timestamp {
            let filler = vec![gap_fill_value(def); spd as usize];
            w.summarize1_samples(core, 0, cursor, &filler)?;
            cursor += spd;
        }
        let bits = def.data_type.size_bits() as usize;
        let nbytes = (ph.entry_count as usize * bits).div_ceil(8);
        let samples =
            decode_samples(payload.rd_bytes(nbytes)?, ph.entry_count as usize, def.data_type);
        w.summarize1_samples(core, offset as i64, ph.timestamp, &samples)?;
        cursor = ph.timestamp + spd;
    }

    w.resume_at(first_ts, last_end);
    Ok(w)
}

fn gap_fill_value(def: &SignalDef) -> f64 {
    if def.data_type.is_float() {
        f64::NAN
    } else {
        0.0
    }
}

// ── Timeseries replay ────────────────────────────────────────────────────────

fn rebuild_ts(
    core: &mut Core,
    track: TrackType,
    decimate: u32,
    def: &SignalDef,
    replay: &Replay,
) -> Result<TsWriter> {
    let mut w = TsWriter::new(def.signal_id, track, decimate);

    // ref_limit[L]: highest level-L chunk offset referenced from level
    // L + 1 (offsets grow monotonically, so one bound suffices).
    let mut ref_limit = [0u64; MAX_LEVELS];
    for level in 2..MAX_LEVELS {
        for &offset in &replay.index[level] {
            let (_, mut payload) = core.raw.rd(offset)?;
            let ph = PayloadHeader::decode_from(&mut payload)?;
            for _ in 0..ph.entry_count {
                let _ts = payload.rd_i64()?;
                let child = payload.rd_i64()? as u64;
                ref_limit[level - 1] = ref_limit[level - 1].max(child);
            }
        }
    }
    for &offset in &replay.index[1] {
        let (_, mut payload) = core.raw.rd(offset)?;
        let ph = PayloadHeader::decode_from(&mut payload)?;
        for _ in 0..ph.entry_count {
            let _ts = payload.rd_i64()?;
            let child = payload.rd_i64()? as u64;
            ref_limit[0] = ref_limit[0].max(child);
        }
    }

    // Unreferenced INDEX chunks re-enter the level above, oldest first.
    for level in 1..MAX_LEVELS - 1 {
        for &offset in &replay.index[level] {
            if offset <= ref_limit[level] {
                continue;
            }
            let ph = payload_header(core, offset)?;
            let rec = following_summary_first_record(core, offset)?;
            w.push(core, level + 1, ph.timestamp, offset as i64, rec)?;
        }
    }

    // Unindexed DATA chunks re-enter level 1.
    for &offset in &replay.data {
        if offset <= ref_limit[0] {
            continue;
        }
        let (_, mut payload) = core.raw.rd(offset)?;
        let ph = PayloadHeader::decode_from(&mut payload)?;
        let rec = match track {
            TrackType::Utc => utc_record(ph.timestamp, payload.rd_i64()?),
            _ => {
                let y = payload.rd_f32()?;
                let annotation_type = payload.rd_u8()?;
                let storage = payload.rd_u8()?;
                let group_id = payload.rd_u8()?;
                annotation_record(ph.timestamp, annotation_type, storage, group_id, y)
            }
        };
        w.push(core, 1, ph.timestamp, offset as i64, rec)?;
    }
    Ok(w)
}

// ── Chunk readers ────────────────────────────────────────────────────────────

fn payload_header(core: &mut Core, offset: u64) -> Result<PayloadHeader> {
    let (_, mut payload) = core.raw.rd(offset)?;
    PayloadHeader::decode_from(&mut payload)
}

/// Decoded stats of the SUMMARY chunk physically following an INDEX chunk.
fn following_summary_stats(core: &mut Core, index_offset: u64) -> Result<Vec<[f64; 4]>> {
    let mut payload = summary_payload(core, index_offset)?;
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
    Ok(stats)
}

/// First 16-byte record of the SUMMARY chunk following a timeseries INDEX
/// chunk.
fn following_summary_first_record(core: &mut Core, index_offset: u64) -> Result<TsRecord> {
    let mut payload = summary_payload(core, index_offset)?;
    PayloadHeader::decode_from(&mut payload)?;
    let bytes = payload.rd_bytes(16)?;
    Ok(bytes.try_into().expect("rd_bytes(16) returns 16 bytes"))
}

fn summary_payload(core: &mut Core, index_offset: u64) -> Result<Buf> {
    core.raw.chunk_seek(index_offset)?;
    core.raw.chunk_next()?;
    core.raw.rd_payload()
}
