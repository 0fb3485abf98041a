use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use jls::{DataType, Reader, SignalDef, SourceDef, Writer};
use tempfile::tempdir;

const SAMPLES: usize = 1 << 20;

fn signal() -> SignalDef {
    let mut def = SignalDef::new(1, 1, DataType::F32, 1_000_000);
    def.samples_per_data = 16_384;
    def.sample_decimate_factor = 128;
    def.entries_per_summary = 1024;
    def.summary_decimate_factor = 128;
    def
}

fn bench_stream(c: &mut Criterion) {
    let data: Vec<f32> = (0..SAMPLES).map(|k| (k as f32 * 0.001).sin()).collect();

    let mut group = c.benchmark_group("stream");
    group.throughput(Throughput::Bytes((SAMPLES * 4) as u64));

    group.bench_function("write_1m_f32", |b| {
        b.iter(|| {
            let dir = tempdir().unwrap();
            let path = dir.path().join("bench.jls");
            let mut w = Writer::open(&path).unwrap();
            w.source_def(&SourceDef::new(1, "bench")).unwrap();
            w.signal_def(&signal()).unwrap();
            for (i, chunk) in data.chunks(4096).enumerate() {
                w.fsr_f32(1, (i * 4096) as i64, black_box(chunk)).unwrap();
            }
            w.close().unwrap();
        })
    });

    let dir = tempdir().unwrap();
    let path = dir.path().join("read.jls");
    {
        let mut w = Writer::open(&path).unwrap();
        w.source_def(&SourceDef::new(1, "bench")).unwrap();
        w.signal_def(&signal()).unwrap();
        w.fsr_f32(1, 0, &data).unwrap();
        w.close().unwrap();
    }
    group.bench_function("read_1m_f32", |b| {
        b.iter(|| {
            let mut r = Reader::open(&path).unwrap();
            black_box(r.fsr_f32(1, 0, SAMPLES).unwrap());
        })
    });
    group.bench_function("statistics_1m_f32", |b| {
        b.iter(|| {
            let mut r = Reader::open(&path).unwrap();
            black_box(r.fsr_statistics(1, 0, 1024, SAMPLES / 1024).unwrap());
        })
    });
    group.finish();
}

criterion_group!(benches, bench_stream);
criterion_main!(benches);
