//! Frame codec benchmark suite.
//!
//! Benchmarks decoding and encoding of OCPP-J frames at different payload
//! sizes:
//! - Payload sizes: 0, 16, 256 meter values
//!
//! Run with: cargo bench --bench frame_decode
//! Results saved to: target/criterion/

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ocpp_gateway::{Frame, MessageId};
use serde_json::{Value, json};
use std::hint::black_box;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const SAMPLE_COUNTS: &[usize] = &[0, 16, 256];

fn meter_values(samples: usize) -> Value {
    let values: Vec<Value> = (0..samples)
        .map(|i| {
            json!({
                "timestamp": "2024-01-01T00:00:00Z",
                "sampledValue": [{"value": i.to_string(), "measurand": "Energy.Active.Import.Register"}]
            })
        })
        .collect();
    json!({"connectorId": 1, "transactionId": 42, "meterValue": values})
}

// ============================================================================
// Benchmark: Decode
// ============================================================================

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for &samples in SAMPLE_COUNTS {
        let text = Frame::call(MessageId::from("bench"), "MeterValues", meter_values(samples))
            .encode()
            .unwrap();
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::new("call", samples), &text, |b, text| {
            b.iter(|| Frame::decode(black_box(text)).unwrap());
        });
    }

    let result = r#"[3,"bench",{"status":"Accepted","currentTime":"2024-01-01T00:00:00Z"}]"#;
    group.bench_function("call_result", |b| {
        b.iter(|| Frame::decode(black_box(result)).unwrap());
    });

    let error = r#"[4,"bench","NotImplemented","Unknown action",{}]"#;
    group.bench_function("call_error", |b| {
        b.iter(|| Frame::decode(black_box(error)).unwrap());
    });

    group.finish();
}

// ============================================================================
// Benchmark: Encode
// ============================================================================

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for &samples in SAMPLE_COUNTS {
        let frame = Frame::call(MessageId::from("bench"), "MeterValues", meter_values(samples));
        group.bench_with_input(BenchmarkId::new("call", samples), &frame, |b, frame| {
            b.iter(|| black_box(frame).encode().unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode, bench_encode);
criterion_main!(benches);
