use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;

use cluster_actuator::aggregate::merge::merge;
use cluster_actuator::expr::{compile, Direction, Filter, SortOrder};
use cluster_actuator::record::{decode_batch, Record, RecordKind};

const LEVELS: [&str; 4] = ["DEBUG", "INFO", "WARN", "ERROR"];

/// `peers` batches of `per_peer` log records with interleaved timestamps.
fn build_batches(peers: usize, per_peer: usize) -> Vec<Vec<Record>> {
    (0..peers)
        .map(|peer| {
            let body = serde_json::Value::Array(
                (0..per_peer)
                    .map(|i| {
                        let ts = 1_700_000_000_000i64 + (i * peers + peer) as i64;
                        json!({
                            "log": {
                                "ts": ts,
                                "level": LEVELS[i % LEVELS.len()],
                                "logger": "org.example.Service",
                                "thread": format!("worker-{}", i % 8),
                                "message": format!("request {i} handled"),
                                "node": format!("node-{peer}"),
                            }
                        })
                    })
                    .collect(),
            );
            decode_batch(RecordKind::Log, body).expect("valid log batch")
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let batches = build_batches(16, 500);
    let by_ts = SortOrder::new(
        compile("log.ts", RecordKind::Log).expect("declared"),
        Direction::Desc,
    );
    let by_thread = SortOrder::new(
        compile("log.thread", RecordKind::Log).expect("declared"),
        Direction::Asc,
    );

    c.bench_function("merge/16x500_by_ts_limit_100", |b| {
        b.iter_batched(
            || batches.clone(),
            |input| black_box(merge(input, &by_ts, 100).len()),
            BatchSize::LargeInput,
        )
    });

    c.bench_function("merge/16x500_by_thread_unbounded", |b| {
        b.iter_batched(
            || batches.clone(),
            |input| black_box(merge(input, &by_thread, usize::MAX).len()),
            BatchSize::LargeInput,
        )
    });
}

fn bench_filter(c: &mut Criterion) {
    let records: Vec<Record> = build_batches(1, 2_000).into_iter().flatten().collect();
    let filter = Filter::compile("log.level >= WARN", RecordKind::Log).expect("valid filter");

    c.bench_function("filter/level_ge_warn_2000", |b| {
        b.iter(|| {
            black_box(
                records
                    .iter()
                    .filter(|r| filter.matches(black_box(r)))
                    .count(),
            )
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_merge(c);
    bench_filter(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
