//! Criterion benchmarks for the ingest hot path.
//!
//! Serial links deliver frames in arbitrary chunks; these benchmarks measure frame
//! recovery and the full decode/validate/order pass for both framing strategies.
//!
//! Run with: cargo bench --bench frame_decoder

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use telemetry_ingest::framing::{BraceFrameDecoder, DepthAwareFrameDecoder, FrameDecoder, FramingStrategy};
use telemetry_ingest::ingest::{IngestOptions, RecordStream};

fn sample_stream(frames: usize) -> Vec<u8> {
    (0..frames)
        .map(|i| {
            format!(
                r#"{{"timestamp": {}, "rpm": {}, "speed": 72, "coolant_temp": 88.5, "throttle_position": 35, "system_state": "HIGHWAY", "wifi_connected": true, "wifi_rssi": -60}}"#,
                i + 1,
                2000 + (i % 4000)
            )
        })
        .collect::<Vec<_>>()
        .join("\r\n")
        .into_bytes()
}

/// Frame recovery alone, at chunk sizes seen on real links.
fn decoder_chunked_feed(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decoder_feed");
    let data = sample_stream(1000);
    group.throughput(Throughput::Bytes(data.len() as u64));

    for chunk in [20usize, 64, 1024] {
        group.bench_with_input(BenchmarkId::new("brace", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut decoder = BraceFrameDecoder::new();
                let mut frames = 0;
                for piece in data.chunks(chunk) {
                    frames += decoder.feed(black_box(piece)).len();
                }
                frames
            });
        });
        group.bench_with_input(BenchmarkId::new("depth_aware", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut decoder = DepthAwareFrameDecoder::new();
                let mut frames = 0;
                for piece in data.chunks(chunk) {
                    frames += decoder.feed(black_box(piece)).len();
                }
                frames
            });
        });
    }

    group.finish();
}

/// Decode, validation and ordering on top of framing.
fn record_stream_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_stream_push");
    let data = sample_stream(1000);
    group.throughput(Throughput::Elements(1000));

    for strategy in [FramingStrategy::Brace, FramingStrategy::DepthAware] {
        let options = IngestOptions {
            strategy,
            ..IngestOptions::default()
        };
        group.bench_function(format!("{:?}", strategy), |b| {
            b.iter(|| {
                let mut stream = RecordStream::new("bench", options);
                let mut records = 0;
                for piece in data.chunks(1024) {
                    records += stream.push(black_box(piece)).len();
                }
                records
            });
        });
    }

    group.finish();
}

criterion_group!(benches, decoder_chunked_feed, record_stream_push);
criterion_main!(benches);
