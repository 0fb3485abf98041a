//! File copy — re-serialize one file into a fresh one, skipping damage.
//!
//! The copy reads through the public [`Reader`] and writes through the
//! public [`Writer`], so the destination is always a cleanly closed file
//! with a freshly built summary pyramid — copying a crash-interrupted
//! source yields a healthy destination containing everything readable.
//! Items that fail to decode are skipped, reported through the message
//! callback, and do not abort the copy.
//!
//! `on_progress` receives `(bytes_done, bytes_total)` in payload bytes,
//! after each copied batch.

use crate::error::Result;
use crate::reader::Reader;
use crate::writer::Writer;
use crate::types::SignalType;

/// Samples per copy batch.
const BATCH: usize = 65_536;

pub fn copy<P, Q, M, G>(
    src: P,
    dst: Q,
    mut on_message: M,
    mut on_progress: G,
) -> Result<()>
where
    P: AsRef<std::path::Path>,
    Q: AsRef<std::path::Path>,
    M: FnMut(&str),
    G: FnMut(u64, u64),
{
    let mut reader = Reader::open(src)?;
    let mut writer = Writer::open(dst)?;

    for source in reader.sources() {
        if source.source_id == 0 {
            continue;
        }
        if let Err(e) = writer.source_def(&source) {
            on_message(&format!("skipping source {}: {e}", source.source_id));
        }
    }
    for signal in reader.signals() {
        if signal.signal_id == 0 {
            continue;
        }
        if let Err(e) = writer.signal_def(&signal) {
            on_message(&format!("skipping signal {}: {e}", signal.signal_id));
        }
    }

    {
        let mut first_error: Option<String> = None;
        reader.user_data(|record| {
            if let Err(e) = writer.user_data(record.meta, record.storage, &record.data) {
                first_error.get_or_insert_with(|| e.to_string());
            }
            true
        })?;
        if let Some(e) = first_error {
            on_message(&format!("user data skipped: {e}"));
        }
    }

    // Total payload bytes for progress reporting.
    let mut total = 0u64;
    for signal in reader.signals() {
        if signal.signal_id == 0 || signal.signal_type != SignalType::Fsr {
            continue;
        }
        let n = reader.fsr_length(signal.signal_id)?;
        total += n as u64 * signal.data_type.size_bits() as u64 / 8;
    }
    let mut done = 0u64;
    on_progress(done, total);

    for signal in reader.signals() {
        let signal_id = signal.signal_id;

        if signal_id != 0 && signal.signal_type == SignalType::Fsr {
            let length = reader.fsr_length(signal_id)?;
            let mut pos = 0i64;
            while pos < length {
                let n = BATCH.min((length - pos) as usize);
                match reader.fsr(signal_id, pos, n) {
                    Ok(packed) => {
                        writer.fsr(signal_id, pos, &packed, n)?;
                        done += packed.len() as u64;
                        on_progress(done, total);
                    }
                    Err(e) => {
                        on_message(&format!(
                            "signal {signal_id}: samples [{pos}, {}) unreadable: {e}",
                            pos + n as i64
                        ));
                    }
                }
                pos += n as i64;
            }

            let mut utc_error: Option<String> = None;
            reader.utc(signal_id, 0, |entries| {
                for entry in entries {
                    if let Err(e) = writer.utc(signal_id, entry.sample_id, entry.utc) {
                        utc_error.get_or_insert_with(|| e.to_string());
                    }
                }
                true
            })?;
            if let Some(e) = utc_error {
                on_message(&format!("signal {signal_id}: UTC entries skipped: {e}"));
            }
        }

        let mut anno_error: Option<String> = None;
        reader.annotations(signal_id, i64::MIN, |record| {
            if let Err(e) = writer.annotation(
                signal_id,
                record.timestamp,
                record.y,
                record.annotation_type,
                record.group_id,
                record.storage,
                &record.data,
            ) {
                anno_error.get_or_insert_with(|| e.to_string());
            }
            true
        })?;
        if let Some(e) = anno_error {
            on_message(&format!("signal {signal_id}: annotations skipped: {e}"));
        }
    }

    writer.close()?;
    on_progress(total, total);
    Ok(())
}
