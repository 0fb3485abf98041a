//! Threaded writer — a [`Writer`] behind a dedicated I/O thread.
//!
//! The producer (caller) deposits variable-length messages into a bounded
//! single-producer/single-consumer ring; the consumer thread drains them
//! in FIFO order and performs all file I/O.  The producer's critical
//! section is proportional to message size, never to I/O latency.
//!
//! Two call classes exist:
//!
//! - **Deferred** (`fsr`, `annotation`, `utc`, `user_data`): copied into
//!   the ring and applied later.  Errors are logged through the `log`
//!   facade and do not surface to the producer.
//! - **Synchronous** (`source_def`, `signal_def`, `flush`, `close`):
//!   definition calls bypass the ring and take the writer mutex directly;
//!   `flush` enqueues a numbered barrier and blocks until the consumer
//!   publishes it; `close` enqueues the stop message, joins the thread,
//!   and finishes the file on the caller's thread.
//!
//! # Overflow policy
//!
//! The ring is bounded in messages and in payload bytes.  By default a
//! full ring blocks the producer (polling every 5 ms up to the configured
//! send timeout).  With [`flags::DROP_ON_OVERFLOW`] set — the right mode
//! for high-rate sample pushes where the producer must never stall — a
//! full ring fails immediately with [`Error::Busy`] and the caller drops
//! or retries.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::warn;

use crate::error::{Error, Result};
use crate::format::StorageType;
use crate::types::{AnnotationType, SignalDef, SourceDef};
use crate::writer::Writer;

/// Writer behavior flags.
pub mod flags {
    /// Fail sends with BUSY instead of blocking when the ring is full.
    pub const DROP_ON_OVERFLOW: u32 = 1 << 0;
}

const RING_MESSAGES:   usize = 4096;
const RING_BYTES:      usize = 16 * 1024 * 1024;
const MSG_OVERHEAD:    usize = 64;
const SEND_POLL:       Duration = Duration::from_millis(5);
const FLUSH_POLL:      Duration = Duration::from_millis(10);
const FLUSH_TIMEOUT:   Duration = Duration::from_secs(30);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

enum Msg {
    Close,
    Flush(u64),
    UserData {
        meta:    u16,
        storage: StorageType,
        data:    Vec<u8>,
    },
    Fsr {
        signal_id:    u16,
        sample_id:    i64,
        data:         Vec<u8>,
        sample_count: usize,
    },
    FsrOmit {
        signal_id: u16,
        enabled:   bool,
    },
    Annotation {
        signal_id:       u16,
        timestamp:       i64,
        y:               f32,
        annotation_type: AnnotationType,
        group_id:        u8,
        storage:         StorageType,
        data:            Vec<u8>,
    },
    Utc {
        signal_id: u16,
        sample_id: i64,
        utc:       i64,
    },
}

impl Msg {
    fn cost(&self) -> usize {
        MSG_OVERHEAD
            + match self {
                Msg::UserData { data, .. } => data.len(),
                Msg::Fsr { data, .. } => data.len(),
                Msg::Annotation { data, .. } => data.len(),
                _ => 0,
            }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ThreadedWriter {
    inner:           Arc<Mutex<Option<Writer>>>,
    tx:              Sender<Msg>,
    handle:          Option<thread::JoinHandle<()>>,
    pending_bytes:   Arc<AtomicUsize>,
    flush_processed: Arc<AtomicU64>,
    flush_send_id:   u64,
    flags:           u32,
    send_timeout:    Duration,
}

impl ThreadedWriter {
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let writer = Writer::open(path)?;
        let inner = Arc::new(Mutex::new(Some(writer)));
        let (tx, rx) = bounded::<Msg>(RING_MESSAGES);
        let pending_bytes = Arc::new(AtomicUsize::new(0));
        let flush_processed = Arc::new(AtomicU64::new(0));

        let consumer_inner = Arc::clone(&inner);
        let consumer_pending = Arc::clone(&pending_bytes);
        let consumer_flush = Arc::clone(&flush_processed);
        let handle = thread::Builder::new()
            .name("jls-writer".into())
            .spawn(move || consumer_loop(rx, consumer_inner, consumer_pending, consumer_flush))
            .map_err(Error::Io)?;

        Ok(Self {
            inner,
            tx,
            handle: Some(handle),
            pending_bytes,
            flush_processed,
            flush_send_id: 0,
            flags: 0,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        })
    }

    pub fn flags_get(&self) -> u32 {
        self.flags
    }

    pub fn flags_set(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }

    // ── Deferred calls ───────────────────────────────────────────────────

    pub fn user_data(&mut self, meta: u16, storage: StorageType, data: &[u8]) -> Result<()> {
        self.msg_send(Msg::UserData { meta, storage, data: data.to_vec() })
    }

    pub fn fsr(
        &mut self,
        signal_id: u16,
        sample_id: i64,
        data: &[u8],
        sample_count: usize,
    ) -> Result<()> {
        self.msg_send(Msg::Fsr {
            signal_id,
            sample_id,
            data: data.to_vec(),
            sample_count,
        })
    }

    pub fn fsr_f32(&mut self, signal_id: u16, sample_id: i64, samples: &[f32]) -> Result<()> {
        let mut bytes = Vec::with_capacity(samples.len() * 4);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        self.msg_send(Msg::Fsr {
            signal_id,
            sample_id,
            data: bytes,
            sample_count: samples.len(),
        })
    }

    pub fn fsr_omit_data(&mut self, signal_id: u16, enabled: bool) -> Result<()> {
        self.msg_send(Msg::FsrOmit { signal_id, enabled })
    }

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
        self.msg_send(Msg::Annotation {
            signal_id,
            timestamp,
            y,
            annotation_type,
            group_id,
            storage,
            data: data.to_vec(),
        })
    }

    pub fn utc(&mut self, signal_id: u16, sample_id: i64, utc: i64) -> Result<()> {
        self.msg_send(Msg::Utc { signal_id, sample_id, utc })
    }

    // ── Synchronous calls ────────────────────────────────────────────────

    /// Definition calls bypass the ring: the producer takes the writer
    /// mutex and the chunk is on disk when this returns.
    pub fn source_def(&mut self, def: &SourceDef) -> Result<()> {
        match lock(&self.inner).as_mut() {
            Some(w) => w.source_def(def),
            None => Err(Error::NotSupported("writer is closed".into())),
        }
    }

    pub fn signal_def(&mut self, def: &SignalDef) -> Result<()> {
        match lock(&self.inner).as_mut() {
            Some(w) => w.signal_def(def),
            None => Err(Error::NotSupported("writer is closed".into())),
        }
    }

    /// Enqueue a flush barrier and wait until the consumer has processed
    /// every message sent before it.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_send_id += 1;
        let id = self.flush_send_id;
        self.msg_send_blocking(Msg::Flush(id))?;
        let deadline = Instant::now() + FLUSH_TIMEOUT;
        while self.flush_processed.load(Ordering::Acquire) < id {
            if Instant::now() >= deadline {
                return Err(Error::TimedOut(format!("flush barrier {id}")));
            }
            thread::sleep(FLUSH_POLL);
        }
        Ok(())
    }

    /// Stop the consumer, join it, and finish the file.
    pub fn close(mut self) -> Result<()> {
        self.msg_send_blocking(Msg::Close)?;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        match lock(&self.inner).take() {
            Some(w) => w.close(),
            None => Ok(()),
        }
    }

    // ── Ring ─────────────────────────────────────────────────────────────

    fn msg_send(&mut self, msg: Msg) -> Result<()> {
        if self.flags & flags::DROP_ON_OVERFLOW != 0 {
            self.msg_try_send(msg)
        } else {
            self.msg_send_blocking(msg)
        }
    }

    fn msg_try_send(&mut self, msg: Msg) -> Result<()> {
        let cost = msg.cost();
        // A message larger than the whole budget is admitted alone rather
        // than rejected forever.
        let pending = self.pending_bytes.load(Ordering::Acquire);
        if pending > 0 && pending + cost > RING_BYTES {
            return Err(Error::Busy);
        }
        self.pending_bytes.fetch_add(cost, Ordering::AcqRel);
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.pending_bytes.fetch_sub(cost, Ordering::AcqRel);
                Err(Error::Busy)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.pending_bytes.fetch_sub(cost, Ordering::AcqRel);
                Err(Error::NotSupported("writer thread has exited".into()))
            }
        }
    }

    fn msg_send_blocking(&mut self, msg: Msg) -> Result<()> {
        let cost = msg.cost();
        let deadline = Instant::now() + self.send_timeout;
        loop {
            let pending = self.pending_bytes.load(Ordering::Acquire);
            if pending == 0 || pending + cost <= RING_BYTES {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::TimedOut("message ring full".into()));
            }
            thread::sleep(SEND_POLL);
        }
        self.pending_bytes.fetch_add(cost, Ordering::AcqRel);
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.tx.send_timeout(msg, remaining).map_err(|e| {
            self.pending_bytes.fetch_sub(cost, Ordering::AcqRel);
            match e {
                crossbeam_channel::SendTimeoutError::Timeout(_) => {
                    Error::TimedOut("message ring full".into())
                }
                crossbeam_channel::SendTimeoutError::Disconnected(_) => {
                    Error::NotSupported("writer thread has exited".into())
                }
            }
        })
    }
}

impl Drop for ThreadedWriter {
    fn drop(&mut self) {
        // Stop the thread; the file itself stays unclosed (repairable),
        // matching a dropped plain Writer.
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(Msg::Close);
            let _ = handle.join();
        }
    }
}

fn consumer_loop(
    rx: Receiver<Msg>,
    inner: Arc<Mutex<Option<Writer>>>,
    pending_bytes: Arc<AtomicUsize>,
    flush_processed: Arc<AtomicU64>,
) {
    while let Ok(msg) = rx.recv() {
        pending_bytes.fetch_sub(msg.cost(), Ordering::AcqRel);
        let mut guard = lock(&inner);
        let Some(writer) = guard.as_mut() else { break };
        let result = match msg {
            Msg::Close => break,
            Msg::Flush(id) => {
                let r = writer.flush();
                flush_processed.fetch_max(id, Ordering::AcqRel);
                r
            }
            Msg::UserData { meta, storage, data } => writer.user_data(meta, storage, &data),
            Msg::Fsr { signal_id, sample_id, data, sample_count } => {
                writer.fsr(signal_id, sample_id, &data, sample_count)
            }
            Msg::FsrOmit { signal_id, enabled } => writer.fsr_omit_data(signal_id, enabled),
            Msg::Annotation {
                signal_id,
                timestamp,
                y,
                annotation_type,
                group_id,
                storage,
                data,
            } => writer.annotation(signal_id, timestamp, y, annotation_type, group_id, storage, &data),
            Msg::Utc { signal_id, sample_id, utc } => writer.utc(signal_id, sample_id, utc),
        };
        if let Err(e) = result {
            warn!("deferred writer call failed: {e}");
        }
    }
    // Remaining messages are discarded with the receiver.
}
