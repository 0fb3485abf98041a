//! End-to-end scenarios: write, close, reopen, verify.

use jls::backend::Mode;
use jls::format::{track_tag_parts, ChunkRole, TrackType, TAG_END};
use jls::raw::RawFile;
use jls::{
    copy, repair, AnnotationType, DataType, Error, Reader, SignalDef, SourceDef, StorageType,
    ThreadedWriter, Writer,
};
use tempfile::tempdir;

// ── Helpers ──────────────────────────────────────────────────────────────────

/// F32 signal with a small, alignment-stable pyramid so tests exercise
/// several summary levels quickly.
fn f32_signal(signal_id: u16, source_id: u16) -> SignalDef {
    let mut def = SignalDef::new(signal_id, source_id, DataType::F32, 1000);
    def.samples_per_data = 200;
    def.sample_decimate_factor = 10;
    def.entries_per_summary = 100;
    def.summary_decimate_factor = 10;
    def.name = "test_signal".into();
    def.units = "V".into();
    def
}

fn sine(n: usize) -> Vec<f32> {
    (0..n)
        .map(|k| (2.0 * std::f32::consts::PI * k as f32 / 100.0).sin())
        .collect()
}

fn assert_close(actual: f64, expected: f64, what: &str) {
    if expected.is_nan() {
        assert!(actual.is_nan(), "{what}: expected NaN, got {actual}");
        return;
    }
    let tol = 1e-6 * expected.abs() + 1e-6;
    assert!(
        (actual - expected).abs() <= tol,
        "{what}: {actual} vs {expected}"
    );
}

/// Mean/min/max/std of an f32 slice, in f64.
fn flat_stats(samples: &[f32]) -> [f64; 4] {
    let finite: Vec<f64> = samples
        .iter()
        .map(|&v| v as f64)
        .filter(|v| !v.is_nan())
        .collect();
    if finite.is_empty() {
        return [f64::NAN; 4];
    }
    let mean = finite.iter().sum::<f64>() / finite.len() as f64;
    let min = finite.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = finite.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let var = finite.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / finite.len() as f64;
    [mean, min, max, var.sqrt()]
}

/// Walk every chunk of a closed file, checking framing invariants, and
/// return the tag sequence.
fn walk_chunks(path: &std::path::Path) -> Vec<u8> {
    let mut raw = RawFile::open(path, Mode::Read).unwrap();
    assert!(raw.closed_cleanly(), "file header length not written");

    let mut tags = Vec::new();
    let mut prev_len = 0u32;
    let mut offsets = Vec::new();
    raw.chunk_first().unwrap();
    loop {
        let hdr = *raw.hdr();
        assert_eq!(
            hdr.payload_prev_length, prev_len,
            "payload_prev_length chain broken at offset {}",
            raw.offset()
        );
        raw.rd_payload().unwrap(); // validates the payload CRC
        tags.push(hdr.tag);
        offsets.push(raw.offset());
        prev_len = hdr.payload_length;
        match raw.chunk_next() {
            Ok(_) => {}
            Err(Error::Empty) => break,
            Err(e) => panic!("walk failed: {e}"),
        }
    }
    assert_eq!(*tags.last().unwrap(), TAG_END, "file must end with END");

    // Reverse traversal must visit the same offsets.
    for expect in offsets.iter().rev().skip(1) {
        raw.chunk_prev().unwrap();
        assert_eq!(raw.offset(), *expect);
    }
    tags
}

fn count_fsr_data_chunks(path: &std::path::Path) -> usize {
    walk_chunks(path)
        .iter()
        .filter(|&&t| track_tag_parts(t) == Some((TrackType::Fsr, ChunkRole::Data)))
        .count()
}

// ── S1: minimal FSR round trip ───────────────────────────────────────────────

#[test]
fn s1_fsr_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s1.jls");
    let input = sine(100);

    let mut w = Writer::open(&path).unwrap();
    w.source_def(&SourceDef::new(1, "scope")).unwrap();
    w.signal_def(&f32_signal(1, 1)).unwrap();
    w.fsr_f32(1, 0, &input).unwrap();
    w.close().unwrap();

    walk_chunks(&path);

    let mut r = Reader::open(&path).unwrap();
    assert_eq!(r.sources().len(), 2); // source 0 + source 1
    assert_eq!(r.signals().len(), 2);
    assert_eq!(r.signal(1).unwrap().name, "test_signal");
    assert_eq!(r.fsr_length(1).unwrap(), 100);

    let back = r.fsr_f32(1, 0, 100).unwrap();
    assert_eq!(back, input);

    let stats = r.fsr_statistics(1, 0, 10, 10).unwrap();
    for (i, row) in stats.iter().enumerate() {
        let expect = flat_stats(&input[i * 10..(i + 1) * 10]);
        assert_close(row[0], expect[0], "mean");
        assert_close(row[1], expect[1], "min");
        assert_close(row[2], expect[2], "max");
        assert_close(row[3], expect[3], "std");
    }
}

// ── Deep pyramid: statistics against raw at several increments ───────────────

#[test]
fn statistics_match_raw_at_every_level() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("levels.jls");
    let input = sine(25_000);

    let mut w = Writer::open(&path).unwrap();
    w.source_def(&SourceDef::new(1, "scope")).unwrap();
    w.signal_def(&f32_signal(1, 1)).unwrap();
    w.fsr_f32(1, 0, &input).unwrap();
    w.close().unwrap();

    let mut r = Reader::open(&path).unwrap();
    assert_eq!(r.fsr_length(1).unwrap(), 25_000);
    assert_eq!(r.fsr_f32(1, 0, 25_000).unwrap(), input);

    // increment = sample_decimate_factor → level 1 entries verbatim.
    let stats = r.fsr_statistics(1, 0, 10, 2500).unwrap();
    for (i, row) in stats.iter().enumerate() {
        let expect = flat_stats(&input[i * 10..(i + 1) * 10]);
        assert_close(row[0], expect[0], "L1 mean");
        assert_eq!(row[1], expect[1], "L1 min is exact");
        assert_eq!(row[2], expect[2], "L1 max is exact");
        assert_close(row[3], expect[3], "L1 std");
    }

    // increment = 100 → level 2 aggregation.
    let stats = r.fsr_statistics(1, 0, 100, 250).unwrap();
    for (i, row) in stats.iter().enumerate() {
        let expect = flat_stats(&input[i * 100..(i + 1) * 100]);
        assert_close(row[0], expect[0], "L2 mean");
        assert_eq!(row[1], expect[1], "L2 min is exact");
        assert_eq!(row[2], expect[2], "L2 max is exact");
        assert_close(row[3], expect[3], "L2 std");
    }

    // Small increment → raw-sample path.
    let stats = r.fsr_statistics(1, 500, 7, 100).unwrap();
    for (i, row) in stats.iter().enumerate() {
        let s = 500 + i as i64 * 7;
        let expect = flat_stats(&input[s as usize..s as usize + 7]);
        assert_close(row[0], expect[0], "raw mean");
        assert_close(row[3], expect[3], "raw std");
    }
}

// ── Invariant: statistics concatenate across splits ──────────────────────────

#[test]
fn statistics_split_concatenation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("split.jls");
    let input = sine(25_000);

    let mut w = Writer::open(&path).unwrap();
    w.source_def(&SourceDef::new(1, "scope")).unwrap();
    w.signal_def(&f32_signal(1, 1)).unwrap();
    w.fsr_f32(1, 0, &input).unwrap();
    w.close().unwrap();

    let mut r = Reader::open(&path).unwrap();
    for (inc, n) in [(37i64, 20usize), (10, 40), (250, 30)] {
        let whole = r.fsr_statistics(1, 100, inc, n).unwrap();
        for k in [1, n / 2, n - 1] {
            let head = r.fsr_statistics(1, 100, inc, k).unwrap();
            let tail = r
                .fsr_statistics(1, 100 + k as i64 * inc, inc, n - k)
                .unwrap();
            let joined: Vec<[f64; 4]> = head.into_iter().chain(tail).collect();
            assert_eq!(whole, joined, "split at {k} with increment {inc}");
        }
    }
}

// ── S2: duplicate skip and gap fill ──────────────────────────────────────────

#[test]
fn s2_gap_fills_nan_and_duplicates_skip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s2.jls");
    let input = sine(100);

    let mut w = Writer::open(&path).unwrap();
    w.source_def(&SourceDef::new(1, "scope")).unwrap();
    w.signal_def(&f32_signal(1, 1)).unwrap();
    // Zero samples is a no-op.
    w.fsr(1, 0, &[], 0).unwrap();
    w.fsr_f32(1, 0, &input[..40]).unwrap();
    // Duplicate prefix: samples [30, 40) are silently skipped.
    w.fsr_f32(1, 30, &input[30..40]).unwrap();
    // Gap: samples [40, 50) were never written.
    w.fsr_f32(1, 50, &input[50..100]).unwrap();
    w.close().unwrap();

    let mut r = Reader::open(&path).unwrap();
    assert_eq!(r.fsr_length(1).unwrap(), 100);

    let head = r.fsr_f32(1, 0, 40).unwrap();
    assert_eq!(head, &input[..40]);

    let hole = r.fsr_f32(1, 40, 10).unwrap();
    assert!(hole.iter().all(|v| v.is_nan()), "gap must read as NaN");

    let tail = r.fsr_f32(1, 50, 50).unwrap();
    assert_eq!(tail, &input[50..100]);

    // Reads past the end are parameter errors.
    assert!(matches!(
        r.fsr(1, 60, 41),
        Err(Error::ParameterInvalid(_))
    ));
    assert!(matches!(
        r.fsr_statistics(1, 0, 10, 11),
        Err(Error::ParameterInvalid(_))
    ));
}

// ── S3: 1-bit signals and the sub-byte shift path ────────────────────────────

#[test]
fn s3_one_bit_square_wave() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s3.jls");

    let mut def = SignalDef::new(1, 1, DataType::U1, 1000);
    def.samples_per_data = 2560;
    def.sample_decimate_factor = 10;
    def.entries_per_summary = 1280;
    def.summary_decimate_factor = 10;

    let mut w = Writer::open(&path).unwrap();
    w.source_def(&SourceDef::new(1, "logic")).unwrap();
    w.signal_def(&def).unwrap();

    // Alternating 0/1 (period-2 square wave): packed bytes are 0xAA.
    let n = 128_000usize;
    let packed = vec![0xAAu8; n / 8];
    w.fsr(1, 0, &packed, n).unwrap();
    w.close().unwrap();

    let mut r = Reader::open(&path).unwrap();
    assert_eq!(r.fsr_length(1).unwrap(), n as i64);

    // Bits [7, 16): 1,0,1,0,1,0,1,0,1 — repacked from bit offset 7.
    let bits = r.fsr(1, 7, 9).unwrap();
    assert_eq!(bits, vec![0x55, 0x01]);

    // Every 10-sample window holds five 0s and five 1s.
    let stats = r.fsr_statistics(1, 0, 10, 1000).unwrap();
    for row in &stats {
        assert_eq!(row[0], 0.5, "mean");
        assert_eq!(row[1], 0.0, "min");
        assert_eq!(row[2], 1.0, "max");
        assert_eq!(row[3], 0.5, "std");
    }
}

// ── Omitted constant chunks ──────────────────────────────────────────────────

#[test]
fn constant_chunks_are_omitted_and_reconstructed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("omit.jls");

    let mut def = SignalDef::new(1, 1, DataType::U8, 1000);
    def.samples_per_data = 160;
    def.sample_decimate_factor = 10;
    def.entries_per_summary = 80;
    def.summary_decimate_factor = 10;

    let mut w = Writer::open(&path).unwrap();
    w.source_def(&SourceDef::new(1, "dc")).unwrap();
    w.signal_def(&def).unwrap();
    w.fsr_omit_data(1, true).unwrap();
    w.fsr(1, 0, &[7u8; 800], 800).unwrap();
    w.close().unwrap();

    // Only the anchor chunk is physical; the other four were omitted.
    assert_eq!(count_fsr_data_chunks(&path), 1);

    let mut r = Reader::open(&path).unwrap();
    assert_eq!(r.fsr_length(1).unwrap(), 800);
    let back = r.fsr(1, 0, 800).unwrap();
    assert!(back.iter().all(|&b| b == 7), "reconstructed constant");
    let stats = r.fsr_statistics(1, 0, 10, 80).unwrap();
    for row in &stats {
        assert_eq!(row[0], 7.0);
        assert_eq!(row[3], 0.0);
    }
}

// ── S4: annotations ──────────────────────────────────────────────────────────

#[test]
fn s4_annotation_seek() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s4.jls");

    let mut w = Writer::open(&path).unwrap();
    w.source_def(&SourceDef::new(1, "scope")).unwrap();
    w.signal_def(&f32_signal(1, 1)).unwrap();
    w.fsr_f32(1, 0, &sine(6000)).unwrap();
    for (ts, text) in [(10i64, "start"), (2000, "mid"), (5000, "end")] {
        w.annotation(
            1,
            ts,
            f32::NAN,
            AnnotationType::Text,
            0,
            StorageType::String,
            text.as_bytes(),
        )
        .unwrap();
    }
    w.close().unwrap();

    let mut r = Reader::open(&path).unwrap();
    let mut seen = Vec::new();
    r.annotations(1, 1500, |record| {
        let text = std::str::from_utf8(&record.data[..record.data.len() - 1]).unwrap();
        seen.push((record.timestamp, text.to_owned()));
        true
    })
    .unwrap();
    assert_eq!(seen, vec![(2000, "mid".into()), (5000, "end".into())]);

    // Early termination after the first hit.
    let mut count = 0;
    r.annotations(1, 0, |_| {
        count += 1;
        false
    })
    .unwrap();
    assert_eq!(count, 1);
}

// ── UTC track ────────────────────────────────────────────────────────────────

#[test]
fn utc_pairs_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("utc.jls");

    let base_utc = 1_700_000_000_000_000_000i64;
    let mut w = Writer::open(&path).unwrap();
    w.source_def(&SourceDef::new(1, "scope")).unwrap();
    w.signal_def(&f32_signal(1, 1)).unwrap();
    w.fsr_f32(1, 0, &sine(3000)).unwrap();
    for k in 0..5i64 {
        w.utc(1, k * 500, base_utc + k * 500_000_000).unwrap();
    }
    w.close().unwrap();

    let mut r = Reader::open(&path).unwrap();
    let mut pairs = Vec::new();
    r.utc(1, 0, |entries| {
        pairs.extend_from_slice(entries);
        true
    })
    .unwrap();
    assert_eq!(pairs.len(), 5);
    for (k, entry) in pairs.iter().enumerate() {
        assert_eq!(entry.sample_id, k as i64 * 500);
        assert_eq!(entry.utc, base_utc + k as i64 * 500_000_000);
    }
}

// ── User data ────────────────────────────────────────────────────────────────

#[test]
fn user_data_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("user.jls");

    let mut w = Writer::open(&path).unwrap();
    w.user_data(1, StorageType::Binary, &[1, 2, 3]).unwrap();
    w.user_data(2, StorageType::String, b"calibration pending")
        .unwrap();
    w.user_data_json(3, &serde_json::json!({"gain": 1.5}))
        .unwrap();
    assert!(matches!(
        w.user_data(0x1000, StorageType::Binary, &[]),
        Err(Error::ParameterInvalid(_))
    ));
    w.close().unwrap();

    let mut r = Reader::open(&path).unwrap();
    let mut records = Vec::new();
    r.user_data(|record| {
        records.push((record.meta, record.storage, record.data.clone()));
        true
    })
    .unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0], (1, StorageType::Binary, vec![1, 2, 3]));
    assert_eq!(records[1].1, StorageType::String);
    assert_eq!(&records[1].2, b"calibration pending\0");
    assert_eq!(records[2].1, StorageType::Json);
    let value: serde_json::Value =
        serde_json::from_slice(&records[2].2[..records[2].2.len() - 1]).unwrap();
    assert_eq!(value["gain"], 1.5);
}

// ── S5: threaded writer flush barrier ────────────────────────────────────────

#[test]
fn s5_threaded_flush_barrier() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s5.jls");

    let mut def = SignalDef::new(1, 1, DataType::F32, 1_000_000);
    def.samples_per_data = 1024;
    def.sample_decimate_factor = 16;
    def.entries_per_summary = 640;
    def.summary_decimate_factor = 16;

    let mut tw = ThreadedWriter::open(&path).unwrap();
    assert_eq!(tw.flags_get(), 0);
    tw.source_def(&SourceDef::new(1, "daq")).unwrap();
    tw.signal_def(&def).unwrap();

    let block: Vec<f32> = (0..1024).map(|k| (k % 97) as f32).collect();
    let messages = 1000usize;
    for i in 0..messages {
        tw.fsr_f32(1, (i * 1024) as i64, &block).unwrap();
    }
    tw.flush().unwrap();

    // Everything enqueued before the barrier is on disk now, even though
    // the file is still open for writing.
    let total = (messages * 1024) as i64;
    let mut r = Reader::open(&path).unwrap();
    assert_eq!(r.fsr_length(1).unwrap(), total);
    drop(r);

    tw.close().unwrap();

    let mut r = Reader::open(&path).unwrap();
    assert_eq!(r.fsr_length(1).unwrap(), total);
    let back = r.fsr_f32(1, 512_000, 1024).unwrap();
    assert_eq!(back, block);
    walk_chunks(&path);
}

// ── S6: crash and repair ─────────────────────────────────────────────────────

#[test]
fn s6_crash_then_repair() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s6.jls");

    let mut def = SignalDef::new(1, 1, DataType::F32, 1000);
    def.samples_per_data = 1000;
    def.sample_decimate_factor = 10;
    def.entries_per_summary = 1000;
    def.summary_decimate_factor = 10;

    let input: Vec<f32> = (0..5000).map(|k| k as f32).collect();
    {
        let mut w = Writer::open(&path).unwrap();
        w.source_def(&SourceDef::new(1, "scope")).unwrap();
        w.signal_def(&def).unwrap();
        w.fsr_f32(1, 0, &input).unwrap();
        w.flush().unwrap();
        // Dropped without close: no END chunk, header length stays 0.
        drop(w);
    }

    // Unclean file: still readable up to the persisted tail.
    {
        let mut r = Reader::open(&path).unwrap();
        assert_eq!(r.fsr_length(1).unwrap(), 5000);
        assert_eq!(r.fsr_f32(1, 0, 5000).unwrap(), input);
    }

    repair(&path).unwrap();
    walk_chunks(&path); // clean header, valid CRCs, END present

    let mut r = Reader::open(&path).unwrap();
    assert_eq!(r.fsr_length(1).unwrap(), 5000);
    assert_eq!(r.fsr_f32(1, 0, 5000).unwrap(), input);

    // The rebuilt pyramid serves statistics.
    let stats = r.fsr_statistics(1, 0, 10, 500).unwrap();
    for (i, row) in stats.iter().enumerate() {
        let expect = flat_stats(&input[i * 10..(i + 1) * 10]);
        assert_close(row[0], expect[0], "repaired mean");
        assert_close(row[3], expect[3], "repaired std");
    }

    // Repairing a clean file is a no-op.
    repair(&path).unwrap();
    walk_chunks(&path);
}

// ── Copy round trip ──────────────────────────────────────────────────────────

#[test]
fn copy_preserves_everything() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.jls");
    let dst = dir.path().join("dst.jls");
    let input = sine(2500);

    let mut w = Writer::open(&src).unwrap();
    let mut source = SourceDef::new(1, "scope");
    source.vendor = "acme".into();
    w.source_def(&source).unwrap();
    w.signal_def(&f32_signal(1, 1)).unwrap();
    w.fsr_f32(1, 0, &input).unwrap();
    w.annotation(
        1,
        100,
        0.5,
        AnnotationType::Text,
        2,
        StorageType::String,
        b"mark",
    )
    .unwrap();
    w.utc(1, 0, 1_700_000_000_000_000_000).unwrap();
    w.user_data(9, StorageType::Binary, &[0xDE, 0xAD]).unwrap();
    w.close().unwrap();

    let mut progress = Vec::new();
    copy(&src, &dst, |msg| panic!("unexpected skip: {msg}"), |done, total| {
        progress.push((done, total));
    })
    .unwrap();
    assert!(progress.last().unwrap().0 == progress.last().unwrap().1);
    walk_chunks(&dst);

    let mut a = Reader::open(&src).unwrap();
    let mut b = Reader::open(&dst).unwrap();
    assert_eq!(a.sources(), b.sources());
    assert_eq!(a.signals(), b.signals());
    assert_eq!(a.fsr_length(1).unwrap(), b.fsr_length(1).unwrap());
    assert_eq!(a.fsr_f32(1, 0, 2500).unwrap(), b.fsr_f32(1, 0, 2500).unwrap());

    let collect_annotations = |r: &mut Reader| {
        let mut v = Vec::new();
        r.annotations(1, 0, |rec| {
            v.push((rec.timestamp, rec.data.clone()));
            true
        })
        .unwrap();
        v
    };
    assert_eq!(collect_annotations(&mut a), collect_annotations(&mut b));

    let collect_utc = |r: &mut Reader| {
        let mut v = Vec::new();
        r.utc(1, 0, |entries| {
            v.extend_from_slice(entries);
            true
        })
        .unwrap();
        v
    };
    assert_eq!(collect_utc(&mut a), collect_utc(&mut b));
}

// ── Definition errors ────────────────────────────────────────────────────────

#[test]
fn definition_errors() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("defs.jls");

    let mut w = Writer::open(&path).unwrap();
    w.source_def(&SourceDef::new(1, "a")).unwrap();
    assert!(matches!(
        w.source_def(&SourceDef::new(1, "again")),
        Err(Error::AlreadyExists(_))
    ));
    assert!(matches!(
        w.signal_def(&f32_signal(1, 9)),
        Err(Error::NotFound(_))
    ));
    w.signal_def(&f32_signal(1, 1)).unwrap();
    assert!(matches!(
        w.signal_def(&f32_signal(1, 1)),
        Err(Error::AlreadyExists(_))
    ));
    // Signal 0 is reserved (VSR) and has no FSR track.
    assert!(w.fsr_f32(0, 0, &[1.0]).is_err());
    w.close().unwrap();
}
