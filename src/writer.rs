//! Single-threaded writer facade — the primary embedding surface for
//! producing a file.
//!
//! ```no_run
//! use jls::{Writer, SourceDef, SignalDef, DataType};
//!
//! let mut w = Writer::open("capture.jls")?;
//! w.source_def(&SourceDef::new(1, "scope"))?;
//! w.signal_def(&SignalDef::new(1, 1, DataType::F32, 1_000_000))?;
//! w.fsr_f32(1, 0, &[0.0, 0.5, 1.0])?;
//! w.close()?;
//! # Ok::<(), jls::Error>(())
//! ```
//!
//! Every call performs synchronous I/O on the caller's thread; see
//! [`crate::threaded::ThreadedWriter`] for the deferred variant.
//!
//! On open the facade writes the three list anchors every file carries:
//! an empty USER_DATA sentinel, SOURCE_DEF 0, and SIGNAL_DEF 0 (the VSR
//! global-annotation signal).  On [`Writer::close`] all per-signal buffers
//! drain, the END chunk is appended, and the file header's length is
//! rewritten — a file missing those was not closed and is subject to
//! repair.  Dropping a `Writer` without calling `close` deliberately
//! leaves the file in that repairable state.

use serde::Serialize;

use crate::backend::Mode;
use crate::buf::Buf;
use crate::core::{Core, TrackList};
use crate::error::{Error, Result};
use crate::format::{user_data_meta, PayloadHeader, StorageType, TrackType};
use crate::fsr::FsrWriter;
use crate::raw::RawFile;
use crate::ts::{annotation_record, utc_record, TsWriter};
use crate::types::{AnnotationType, SignalDef, SignalType, SourceDef};

pub struct Writer {
    core: Core,
}

impl Writer {
    /// Create (or truncate) `path` and write the file header plus the
    /// reserved source/signal 0 definitions.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let raw = RawFile::open(path, Mode::Write)?;
        let mut w = Self { core: Core::new(raw) };
        w.core.wr_user_data(0, &[])?;
        w.core.wr_source_def(&SourceDef::global())?;
        w.install_signal(SignalDef::global())?;
        Ok(w)
    }

    /// Resume writing into an existing core (repair path).
    pub(crate) fn from_core(core: Core) -> Self {
        Self { core }
    }

    // ── Definitions ──────────────────────────────────────────────────────

    /// Define a source.  The descriptor is copied; duplicate ids fail with
    /// [`Error::AlreadyExists`].
    pub fn source_def(&mut self, def: &SourceDef) -> Result<()> {
        def.validate()?;
        if self.core.source(def.source_id).is_some() {
            return Err(Error::AlreadyExists(format!("source {}", def.source_id)));
        }
        self.core.wr_source_def(def)
    }

    /// Define a signal.  Decimation parameters are validated and aligned
    /// (zero fields take width-tuned defaults); the source must already
    /// exist.  FSR signals get FSR + annotation + UTC tracks, VSR signals
    /// get VSR + annotation tracks.
    pub fn signal_def(&mut self, def: &SignalDef) -> Result<()> {
        def.validate()?;
        if self.core.signal(def.signal_id).is_some() {
            return Err(Error::AlreadyExists(format!("signal {}", def.signal_id)));
        }
        if self.core.source(def.source_id).is_none() {
            return Err(Error::NotFound(format!("source {}", def.source_id)));
        }
        let mut def = def.clone();
        def.align();
        self.install_signal(def)
    }

    fn install_signal(&mut self, def: SignalDef) -> Result<()> {
        let signal_id = def.signal_id;
        self.core.wr_signal_def(&def)?;
        match def.signal_type {
            SignalType::Fsr => {
                self.core.create_track(signal_id, TrackType::Fsr)?;
                self.core.create_track(signal_id, TrackType::Annotation)?;
                self.core.create_track(signal_id, TrackType::Utc)?;
                let state = self.core.signal_mut(signal_id)?;
                state.fsr = Some(FsrWriter::new(&def));
                state.anno = Some(TsWriter::new(
                    signal_id,
                    TrackType::Annotation,
                    def.annotation_decimate_factor,
                ));
                state.utc = Some(TsWriter::new(
                    signal_id,
                    TrackType::Utc,
                    def.utc_decimate_factor,
                ));
            }
            SignalType::Vsr => {
                self.core.create_track(signal_id, TrackType::Vsr)?;
                self.core.create_track(signal_id, TrackType::Annotation)?;
                let state = self.core.signal_mut(signal_id)?;
                state.anno = Some(TsWriter::new(
                    signal_id,
                    TrackType::Annotation,
                    def.annotation_decimate_factor,
                ));
            }
        }
        Ok(())
    }

    // ── User data ────────────────────────────────────────────────────────

    /// Write an opaque USER_DATA chunk.  `meta` occupies the low 12 bits
    /// of `chunk_meta`; STRING and JSON storage append a NUL terminator if
    /// the caller did not.
    pub fn user_data(&mut self, meta: u16, storage: StorageType, data: &[u8]) -> Result<()> {
        if meta & 0xF000 != 0 {
            return Err(Error::ParameterInvalid(
                "user_data meta is limited to 12 bits".into(),
            ));
        }
        let chunk_meta = user_data_meta(meta, storage);
        match storage {
            StorageType::Binary => {
                self.core.wr_user_data(chunk_meta, data)?;
            }
            StorageType::String | StorageType::Json => {
                // Length is the string's own: up to and including the NUL.
                let end = data.iter().position(|&b| b == 0).map(|i| i + 1);
                match end {
                    Some(end) => self.core.wr_user_data(chunk_meta, &data[..end])?,
                    None => {
                        let mut owned = Vec::with_capacity(data.len() + 1);
                        owned.extend_from_slice(data);
                        owned.push(0);
                        self.core.wr_user_data(chunk_meta, &owned)?
                    }
                };
            }
        }
        Ok(())
    }

    /// Serialize `value` through serde_json and store it with JSON
    /// storage.
    pub fn user_data_json<T: Serialize>(&mut self, meta: u16, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| Error::ParameterInvalid(format!("JSON serialization failed: {e}")))?;
        self.user_data(meta, StorageType::Json, &bytes)
    }

    // ── Samples ──────────────────────────────────────────────────────────

    /// Append `sample_count` packed samples starting at `sample_id`.
    ///
    /// Sample ids already covered are skipped; a gap inserts NaN fillers
    /// for float types and zeros for integer types (lossy, by contract).
    pub fn fsr(
        &mut self,
        signal_id: u16,
        sample_id: i64,
        data: &[u8],
        sample_count: usize,
    ) -> Result<()> {
        let mut fsr = self
            .core
            .signal_mut(signal_id)?
            .fsr
            .take()
            .ok_or_else(|| Error::ParameterInvalid(format!("signal {signal_id} is not FSR")))?;
        let r = fsr.append(&mut self.core, sample_id, data, sample_count);
        self.core.signal_mut(signal_id)?.fsr = Some(fsr);
        r
    }

    /// Typed convenience for F32 signals.
    pub fn fsr_f32(&mut self, signal_id: u16, sample_id: i64, samples: &[f32]) -> Result<()> {
        if self.core.signal_required(signal_id)?.def.data_type != crate::format::DataType::F32 {
            return Err(Error::ParameterInvalid(format!(
                "signal {signal_id} is not F32"
            )));
        }
        let mut bytes = Vec::with_capacity(samples.len() * 4);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        self.fsr(signal_id, sample_id, &bytes, samples.len())
    }

    /// Enable or disable constant-chunk omission for one signal.
    pub fn fsr_omit_data(&mut self, signal_id: u16, enabled: bool) -> Result<()> {
        self.core
            .signal_mut(signal_id)?
            .fsr
            .as_mut()
            .ok_or_else(|| Error::ParameterInvalid(format!("signal {signal_id} is not FSR")))?
            .set_omit_data(enabled);
        Ok(())
    }

    // ── Annotations and UTC ──────────────────────────────────────────────

    /// Attach an annotation to a signal at `timestamp` (a sample id for
    /// FSR signals, UTC for VSR).  `y` is the vertical position hint (NaN
    /// for "unpositioned").
    #[allow(clippy::too_many_arguments)]
    pub fn annotation(
        &mut self,
        signal_id: u16,
        timestamp: i64,
        y: f32,
        annotation_type: AnnotationType,
        group_id: u8,
        storage: StorageType,
        data: &[u8],
    ) -> Result<()> {
        let state = self.core.signal_required(signal_id)?;
        if state.anno.is_none() {
            return Err(Error::ParameterInvalid(format!(
                "signal {signal_id} has no annotation track"
            )));
        }

        let mut body = data.to_vec();
        if matches!(storage, StorageType::String | StorageType::Json)
            && body.last() != Some(&0)
        {
            body.push(0);
        }

        let mut payload = Buf::with_capacity(16 + 12 + body.len());
        PayloadHeader { timestamp, entry_count: 1, entry_size_bits: 0 }.encode_into(&mut payload);
        payload.wr_f32(y);
        payload.wr_u8(annotation_type as u8);
        payload.wr_u8(storage as u8);
        payload.wr_u8(group_id);
        payload.wr_u8(0);
        payload.wr_u32(body.len() as u32);
        payload.wr_bytes(&body);

        let offset = self.core.wr_track_chunk(
            signal_id,
            TrackType::Annotation,
            TrackList::Data,
            payload.as_slice(),
        )?;

        let rec = annotation_record(timestamp, annotation_type as u8, storage as u8, group_id, y);
        let mut ts = self
            .core
            .signal_mut(signal_id)?
            .anno
            .take()
            .ok_or_else(|| Error::NotFound(format!("signal {signal_id} annotation writer")))?;
        let r = ts.add_entry(&mut self.core, timestamp, offset, rec);
        self.core.signal_mut(signal_id)?.anno = Some(ts);
        r
    }

    /// Record a `sample_id ↔ UTC` correspondence for an FSR signal.
    /// `utc` counts nanoseconds; the engine treats it as opaque i64.
    pub fn utc(&mut self, signal_id: u16, sample_id: i64, utc: i64) -> Result<()> {
        let state = self.core.signal_required(signal_id)?;
        if state.utc.is_none() {
            return Err(Error::ParameterInvalid(format!(
                "signal {signal_id} has no UTC track"
            )));
        }

        let mut payload = Buf::with_capacity(24);
        PayloadHeader { timestamp: sample_id, entry_count: 1, entry_size_bits: 64 }
            .encode_into(&mut payload);
        payload.wr_i64(utc);

        let offset = self.core.wr_track_chunk(
            signal_id,
            TrackType::Utc,
            TrackList::Data,
            payload.as_slice(),
        )?;

        let mut ts = self
            .core
            .signal_mut(signal_id)?
            .utc
            .take()
            .ok_or_else(|| Error::NotFound(format!("signal {signal_id} UTC writer")))?;
        let r = ts.add_entry(&mut self.core, sample_id, offset, utc_record(sample_id, utc));
        self.core.signal_mut(signal_id)?.utc = Some(ts);
        r
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Push all buffered bytes to stable storage.  Per-signal summary
    /// buffers are NOT drained — flush bounds data loss, close completes
    /// the pyramid.
    pub fn flush(&mut self) -> Result<()> {
        self.core.raw.flush()
    }

    /// Drain every per-signal writer, append the END chunk, and rewrite
    /// the file header with the final length.
    pub fn close(mut self) -> Result<()> {
        self.drain_all()?;
        self.core.wr_end()?;
        self.core.raw.close()
    }

    pub(crate) fn drain_all(&mut self) -> Result<()> {
        for signal_id in self.core.signal_ids() {
            if let Some(mut fsr) = self.core.signal_mut(signal_id)?.fsr.take() {
                fsr.close(&mut self.core)?;
                self.core.signal_mut(signal_id)?.fsr = Some(fsr);
            }
            if let Some(mut anno) = self.core.signal_mut(signal_id)?.anno.take() {
                anno.close(&mut self.core)?;
                self.core.signal_mut(signal_id)?.anno = Some(anno);
            }
            if let Some(mut utc) = self.core.signal_mut(signal_id)?.utc.take() {
                utc.close(&mut self.core)?;
                self.core.signal_mut(signal_id)?.utc = Some(utc);
            }
        }
        Ok(())
    }
}
