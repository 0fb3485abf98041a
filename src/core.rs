//! Core registry — sources, signals, and per-track bookkeeping.
//!
//! [`Core`] owns the open [`RawFile`] plus two flat, id-indexed arrays of
//! source and signal state.  All internal references are `u16` ids; there
//! are no pointer graphs to keep consistent (the on-disk linked lists are
//! the only graph, and they are maintained through one primitive).
//!
//! # Item-list maintenance
//!
//! Every listed chunk is appended through [`Core::wr_listed`]: the new
//! chunk's `item_prev` points at the current list tail, the tail's header
//! is rewritten in place with `item_next` set, and the new chunk becomes
//! the tail.  Three lists exist at file scope (SOURCE_DEF, SIGNAL_DEF,
//! USER_DATA — track DEF/HEAD chunks ride the SIGNAL_DEF list so the
//! signal scan discovers them), plus one list per track data stream and
//! per index/summary level.
//!
//! # Track heads
//!
//! Each track's HEAD chunk stores 16 absolute offsets, one per summary
//! level: level 0 points at the first DATA chunk, level L ≥ 1 at the first
//! INDEX chunk of that level.  The HEAD payload is rewritten in place the
//! first time each level produces a chunk.
//!
//! # Open-time scans
//!
//! Readers populate the registry with [`Core::scan_initial`] (locate the
//! three list anchors), [`Core::scan_sources`] / [`Core::scan_signals`]
//! (follow each chain and materialize descriptors, associating track
//! DEF/HEAD chunks with their signals), and [`Core::scan_fsr_sample_id`]
//! (read each FSR track's first DATA chunk so external sample ids can be
//! zero-based).  Scans stop at the first unreadable chunk, which makes an
//! unclean file readable up to its last valid tail.

use log::warn;

use crate::buf::Buf;
use crate::error::{Error, Result};
use crate::format::{
    track_meta, track_tag, ChunkHeader, ChunkRole, TrackType, TAG_END, TAG_SIGNAL_DEF,
    TAG_SOURCE_DEF, TAG_USER_DATA,
};
use crate::fsr::FsrWriter;
use crate::raw::RawFile;
use crate::ts::TsWriter;
use crate::types::{SignalDef, SourceDef, ID_LIMIT};

/// Summary levels per track — the HEAD chunk's offset-array size.
pub const MAX_LEVELS: usize = 16;

const HEAD_PAYLOAD_SIZE: usize = MAX_LEVELS * 8;

// ── Per-track bookkeeping ────────────────────────────────────────────────────

/// Tail of one item list: the chunk whose `item_next` is rewritten when
/// the list grows.  `offset == 0` means the list is empty.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ItemTail {
    pub offset: u64,
    pub hdr:    ChunkHeader,
}

#[derive(Debug)]
pub(crate) struct TrackState {
    /// Offset of this track's HEAD chunk.
    pub head_offset:  u64,
    /// First-chunk offset per summary level (the HEAD payload).
    pub head:         [u64; MAX_LEVELS],
    pub data_tail:    ItemTail,
    pub index_tail:   [ItemTail; MAX_LEVELS],
    pub summary_tail: [ItemTail; MAX_LEVELS],
}

impl TrackState {
    fn new(head_offset: u64) -> Self {
        Self {
            head_offset,
            head:         [0; MAX_LEVELS],
            data_tail:    ItemTail::default(),
            index_tail:   [ItemTail::default(); MAX_LEVELS],
            summary_tail: [ItemTail::default(); MAX_LEVELS],
        }
    }
}

/// Which item list of a track a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackList {
    Data,
    Index(u8),
    Summary(u8),
}

pub(crate) struct SignalState {
    pub def:    SignalDef,
    /// Indexed by `TrackType as usize`.
    pub tracks: [Option<TrackState>; 4],
    /// Timestamp of the first DATA chunk (reader side).
    pub sample_id_offset: i64,
    pub fsr:  Option<FsrWriter>,
    pub anno: Option<TsWriter>,
    pub utc:  Option<TsWriter>,
}

impl SignalState {
    pub(crate) fn new(def: SignalDef) -> Self {
        Self {
            def,
            tracks: [None, None, None, None],
            sample_id_offset: 0,
            fsr: None,
            anno: None,
            utc: None,
        }
    }
}

// ── Core ─────────────────────────────────────────────────────────────────────

pub struct Core {
    pub(crate) raw: RawFile,

    pub(crate) sources: Vec<Option<SourceDef>>,
    pub(crate) signals: Vec<Option<SignalState>>,

    pub(crate) source_tail: ItemTail,
    pub(crate) signal_tail: ItemTail,
    pub(crate) user_tail:   ItemTail,

    /// First-chunk offsets of the three file-scope lists (reader side).
    pub(crate) source_anchor: u64,
    pub(crate) signal_anchor: u64,
    pub(crate) user_anchor:   u64,
}

impl Core {
    pub(crate) fn new(raw: RawFile) -> Self {
        let mut sources = Vec::new();
        let mut signals = Vec::new();
        sources.resize_with(ID_LIMIT as usize, || None);
        signals.resize_with(ID_LIMIT as usize, || None);
        Self {
            raw,
            sources,
            signals,
            source_tail: ItemTail::default(),
            signal_tail: ItemTail::default(),
            user_tail:   ItemTail::default(),
            source_anchor: 0,
            signal_anchor: 0,
            user_anchor:   0,
        }
    }

    // ── Registry access ──────────────────────────────────────────────────

    pub(crate) fn source(&self, source_id: u16) -> Option<&SourceDef> {
        self.sources.get(source_id as usize)?.as_ref()
    }

    pub(crate) fn signal(&self, signal_id: u16) -> Option<&SignalState> {
        self.signals.get(signal_id as usize)?.as_ref()
    }

    pub(crate) fn signal_required(&self, signal_id: u16) -> Result<&SignalState> {
        self.signal(signal_id)
            .ok_or_else(|| Error::NotFound(format!("signal {signal_id}")))
    }

    pub(crate) fn signal_mut(&mut self, signal_id: u16) -> Result<&mut SignalState> {
        self.signals
            .get_mut(signal_id as usize)
            .and_then(|s| s.as_mut())
            .ok_or_else(|| Error::NotFound(format!("signal {signal_id}")))
    }

    pub(crate) fn track(&self, signal_id: u16, track: TrackType) -> Result<&TrackState> {
        self.signal_required(signal_id)?.tracks[track as usize]
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("signal {signal_id} has no {track:?} track")))
    }

    /// All defined source descriptors, id-ordered.
    pub fn source_list(&self) -> Vec<SourceDef> {
        self.sources.iter().flatten().cloned().collect()
    }

    /// All defined signal descriptors, id-ordered.
    pub fn signal_list(&self) -> Vec<SignalDef> {
        self.signals
            .iter()
            .flatten()
            .map(|s| s.def.clone())
            .collect()
    }

    pub(crate) fn signal_ids(&self) -> Vec<u16> {
        self.signals
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as u16)
            .collect()
    }

    // ── Item-list writes ─────────────────────────────────────────────────

    /// Append a chunk to an item list: link it behind the current tail,
    /// patch the tail's `item_next` in place, and make it the new tail.
    fn wr_listed(
        raw: &mut RawFile,
        tag: u8,
        chunk_meta: u16,
        payload: &[u8],
        tail: &mut ItemTail,
    ) -> Result<u64> {
        let mut hdr = ChunkHeader {
            tag,
            chunk_meta,
            item_prev: tail.offset,
            ..Default::default()
        };
        let offset = raw.wr(&mut hdr, payload)?;
        if tail.offset != 0 {
            let mut prev = tail.hdr;
            prev.item_next = offset;
            raw.wr_header_at(tail.offset, &prev)?;
        }
        *tail = ItemTail { offset, hdr };
        Ok(offset)
    }

    /// Write a SOURCE_DEF chunk and register the descriptor.
    pub(crate) fn wr_source_def(&mut self, def: &SourceDef) -> Result<()> {
        let mut payload = Buf::new();
        def.encode_into(&mut payload);
        let offset = Self::wr_listed(
            &mut self.raw,
            TAG_SOURCE_DEF,
            def.source_id,
            payload.as_slice(),
            &mut self.source_tail,
        )?;
        if self.source_anchor == 0 {
            self.source_anchor = offset;
        }
        self.sources[def.source_id as usize] = Some(def.clone());
        Ok(())
    }

    /// Write a SIGNAL_DEF chunk and register fresh signal state.  Tracks
    /// are created separately with [`Core::create_track`].
    pub(crate) fn wr_signal_def(&mut self, def: &SignalDef) -> Result<()> {
        let mut payload = Buf::new();
        def.encode_into(&mut payload);
        let offset = Self::wr_listed(
            &mut self.raw,
            TAG_SIGNAL_DEF,
            def.signal_id,
            payload.as_slice(),
            &mut self.signal_tail,
        )?;
        if self.signal_anchor == 0 {
            self.signal_anchor = offset;
        }
        self.signals[def.signal_id as usize] = Some(SignalState::new(def.clone()));
        Ok(())
    }

    /// Write a track's DEF and HEAD chunks (both ride the SIGNAL_DEF list)
    /// and install its bookkeeping.
    pub(crate) fn create_track(&mut self, signal_id: u16, track: TrackType) -> Result<()> {
        let meta = track_meta(signal_id, 0);
        Self::wr_listed(
            &mut self.raw,
            track_tag(track, ChunkRole::Def),
            meta,
            &[],
            &mut self.signal_tail,
        )?;
        let mut head = Buf::with_capacity(HEAD_PAYLOAD_SIZE);
        head.wr_zero(HEAD_PAYLOAD_SIZE);
        let head_offset = Self::wr_listed(
            &mut self.raw,
            track_tag(track, ChunkRole::Head),
            meta,
            head.as_slice(),
            &mut self.signal_tail,
        )?;
        self.signal_mut(signal_id)?.tracks[track as usize] = Some(TrackState::new(head_offset));
        Ok(())
    }

    /// Write a USER_DATA chunk (meta already packed with its storage type).
    pub(crate) fn wr_user_data(&mut self, chunk_meta: u16, payload: &[u8]) -> Result<u64> {
        let offset = Self::wr_listed(
            &mut self.raw,
            TAG_USER_DATA,
            chunk_meta,
            payload,
            &mut self.user_tail,
        )?;
        if self.user_anchor == 0 {
            self.user_anchor = offset;
        }
        Ok(offset)
    }

    /// Append a DATA / INDEX / SUMMARY chunk to a track, maintaining the
    /// per-level item list and the HEAD offset array.
    pub(crate) fn wr_track_chunk(
        &mut self,
        signal_id: u16,
        track: TrackType,
        list: TrackList,
        payload: &[u8],
    ) -> Result<u64> {
        let (role, level) = match list {
            TrackList::Data       => (ChunkRole::Data, 0u8),
            TrackList::Index(l)   => (ChunkRole::Index, l),
            TrackList::Summary(l) => (ChunkRole::Summary, l),
        };
        let tag = track_tag(track, role);
        let meta = track_meta(signal_id, level);

        let state = self.signals[signal_id as usize]
            .as_mut()
            .ok_or_else(|| Error::NotFound(format!("signal {signal_id}")))?;
        let ts = state.tracks[track as usize]
            .as_mut()
            .ok_or_else(|| Error::NotFound(format!("signal {signal_id} has no {track:?} track")))?;
        let tail = match list {
            TrackList::Data       => &mut ts.data_tail,
            TrackList::Index(l)   => &mut ts.index_tail[l as usize],
            TrackList::Summary(l) => &mut ts.summary_tail[l as usize],
        };
        let offset = Self::wr_listed(&mut self.raw, tag, meta, payload, tail)?;

        // DATA anchors level 0, the level's INDEX anchors levels ≥ 1; the
        // SUMMARY chunk is reached from its INDEX, never from the HEAD.
        let head_level = match list {
            TrackList::Data       => Some(0usize),
            TrackList::Index(l)   => Some(l as usize),
            TrackList::Summary(_) => None,
        };
        if let Some(level) = head_level {
            if ts.head[level] == 0 {
                ts.head[level] = offset;
                let head_offset = ts.head_offset;
                let head = ts.head;
                self.rewrite_head(head_offset, &head)?;
            }
        }
        Ok(offset)
    }

    /// Rewrite a HEAD chunk's offset array in place.  The header is
    /// re-read first so list pointers patched since creation survive.
    pub(crate) fn rewrite_head(&mut self, head_offset: u64, head: &[u64; MAX_LEVELS]) -> Result<()> {
        let hdr = *self.raw.chunk_seek(head_offset)?;
        let mut payload = Buf::with_capacity(HEAD_PAYLOAD_SIZE);
        for offset in head {
            payload.wr_u64(*offset);
        }
        self.raw.wr_in_place(head_offset, &hdr, payload.as_slice())
    }

    /// Append the END sentinel (empty payload, no list membership).
    pub(crate) fn wr_end(&mut self) -> Result<()> {
        let mut hdr = ChunkHeader { tag: TAG_END, ..Default::default() };
        self.raw.wr(&mut hdr, &[])?;
        Ok(())
    }

    // ── Open-time scans ──────────────────────────────────────────────────

    /// Locate the first SOURCE_DEF, SIGNAL_DEF, and USER_DATA chunks by
    /// walking forward from the file header.
    pub(crate) fn scan_initial(&mut self) -> Result<()> {
        let mut step = self.raw.chunk_first().map(|h| *h);
        loop {
            let hdr = match step {
                Ok(hdr) => hdr,
                Err(Error::Empty) => break,
                Err(Error::MessageIntegrity(msg)) => {
                    warn!("initial scan stopped at corrupt chunk: {msg}");
                    break;
                }
                Err(e) => return Err(e),
            };
            match hdr.tag {
                TAG_SOURCE_DEF if self.source_anchor == 0 => self.source_anchor = self.raw.offset(),
                TAG_SIGNAL_DEF if self.signal_anchor == 0 => self.signal_anchor = self.raw.offset(),
                TAG_USER_DATA if self.user_anchor == 0 => self.user_anchor = self.raw.offset(),
                TAG_END => break,
                _ => {}
            }
            if self.source_anchor != 0 && self.signal_anchor != 0 && self.user_anchor != 0 {
                break;
            }
            step = self.raw.chunk_next().map(|h| *h);
        }
        Ok(())
    }

    /// Follow the SOURCE_DEF chain and materialize descriptors.
    pub(crate) fn scan_sources(&mut self) -> Result<()> {
        if self.source_anchor == 0 {
            return Ok(());
        }
        let mut step = self.raw.chunk_seek(self.source_anchor).map(|h| *h);
        loop {
            match step {
                Ok(hdr) if hdr.tag == TAG_SOURCE_DEF => {
                    let mut payload = self.raw.rd_payload()?;
                    let def = SourceDef::decode_from(&mut payload)?;
                    def.validate()?;
                    self.source_tail = ItemTail { offset: self.raw.offset(), hdr };
                    let source_id = def.source_id;
                    self.sources[source_id as usize] = Some(def);
                }
                Ok(hdr) => {
                    return Err(Error::UnsupportedFile(format!(
                        "unexpected tag {:#04x} on the source list",
                        hdr.tag
                    )));
                }
                Err(Error::Empty) => break,
                Err(Error::MessageIntegrity(msg)) => {
                    warn!("source scan stopped at corrupt chunk: {msg}");
                    break;
                }
                Err(e) => return Err(e),
            }
            step = self.raw.item_next().map(|h| *h);
        }
        Ok(())
    }

    /// Follow the SIGNAL_DEF chain; SIGNAL_DEF chunks materialize
    /// descriptors, track DEF/HEAD chunks attach to their signals.
    pub(crate) fn scan_signals(&mut self) -> Result<()> {
        if self.signal_anchor == 0 {
            return Ok(());
        }
        let mut step = self.raw.chunk_seek(self.signal_anchor).map(|h| *h);
        loop {
            match step {
                Ok(hdr) if hdr.tag == TAG_SIGNAL_DEF => {
                    let mut payload = self.raw.rd_payload()?;
                    let def = SignalDef::decode_from(&mut payload)?;
                    def.validate()?;
                    self.signal_tail = ItemTail { offset: self.raw.offset(), hdr };
                    let signal_id = def.signal_id;
                    self.signals[signal_id as usize] = Some(SignalState::new(def));
                }
                Ok(hdr) => {
                    let Some((track, role)) = crate::format::track_tag_parts(hdr.tag) else {
                        return Err(Error::UnsupportedFile(format!(
                            "unexpected tag {:#04x} on the signal list",
                            hdr.tag
                        )));
                    };
                    let offset = self.raw.offset();
                    let signal_id = crate::format::meta_signal_id(hdr.chunk_meta);
                    self.signal_tail = ItemTail { offset, hdr };
                    match role {
                        ChunkRole::Def => {
                            // Bookkeeping arrives with the HEAD chunk.
                        }
                        ChunkRole::Head => {
                            let mut payload = self.raw.rd_payload()?;
                            let mut head = [0u64; MAX_LEVELS];
                            for slot in head.iter_mut() {
                                *slot = payload.rd_u64()?;
                            }
                            let mut state = TrackState::new(offset);
                            state.head = head;
                            self.signal_mut(signal_id)?.tracks[track as usize] = Some(state);
                        }
                        _ => {
                            return Err(Error::UnsupportedFile(format!(
                                "track {role:?} chunk on the signal list"
                            )));
                        }
                    }
                }
                Err(Error::Empty) => break,
                Err(Error::MessageIntegrity(msg)) => {
                    warn!("signal scan stopped at corrupt chunk: {msg}");
                    break;
                }
                Err(e) => return Err(e),
            }
            step = self.raw.item_next().map(|h| *h);
        }
        Ok(())
    }

    /// Learn each FSR signal's `sample_id_offset` from its first DATA
    /// chunk, so the public API can expose zero-based sample ids.
    pub(crate) fn scan_fsr_sample_id(&mut self) -> Result<()> {
        for signal_id in self.signal_ids() {
            let state = self.signal_required(signal_id)?;
            let Some(track) = state.tracks[TrackType::Fsr as usize].as_ref() else {
                continue;
            };
            let first_data = track.head[0];
            if first_data == 0 {
                continue;
            }
            let (_, mut payload) = self.raw.rd(first_data)?;
            let ph = crate::format::PayloadHeader::decode_from(&mut payload)?;
            self.signal_mut(signal_id)?.sample_id_offset = ph.timestamp;
        }
        Ok(())
    }
}
