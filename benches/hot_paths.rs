use std::sync::Arc;
use std::time::Duration;

use blkwatch::clock::{ManualClock, NanoClock};
use blkwatch::sink::window::{advance, WindowState};
use blkwatch::tracer::channel::{self, Recv};
use blkwatch::tracer::event::{Delivery, RequestId, RequestRecord};
use blkwatch::tracer::parse::parse_record;
use blkwatch::tracer::probe::{BlockRequest, Probe, ProbeConfig, QueueInfo};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn record_payload() -> [u8; 32] {
    RequestRecord {
        id: RequestId(0xffff_8880_1234_5600),
        start_ns: 123_456_789,
        end_ns: 123_491_789,
        payload_bytes: 4096,
    }
    .to_bytes()
}

fn bench_parse_record(c: &mut Criterion) {
    let payload = record_payload();

    c.bench_function("parse_record", |b| {
        b.iter(|| parse_record(black_box(&payload)).expect("parse record"))
    });
}

fn bench_probe_lifecycle(c: &mut Criterion) {
    let (producer, mut consumer) = channel::channel(1024 * 1024);
    let clock = Arc::new(ManualClock::new(0));
    let probe = Probe::new(
        ProbeConfig::default(),
        producer,
        Arc::clone(&clock) as Arc<dyn NanoClock>,
    );
    let mut next_id = 0u64;

    c.bench_function("probe/issue_dispatch_complete_done", |b| {
        b.iter(|| {
            next_id = (next_id + 1) % 512;
            let req = BlockRequest {
                id: RequestId(next_id),
                payload_bytes: 4096,
                queue: Some(QueueInfo { depth: 32 }),
            };

            clock.advance(1_000);
            probe.on_issue_start(&req);
            probe.on_queue_sample(&req);
            clock.advance(35_000);
            probe.on_completion(&req, 0, 4096);
            probe.on_request_done(&req);

            match consumer.try_recv() {
                Recv::Record(rec) => black_box(rec),
                Recv::Empty | Recv::Closed => panic!("record not published"),
            }
        })
    });
}

fn bench_window_fold(c: &mut Criterion) {
    let window = Duration::from_secs(5);
    let deliveries: Vec<Delivery> = (0..4096u64)
        .map(|i| Delivery {
            record: RequestRecord {
                id: RequestId(i),
                start_ns: i * 2_000_000,
                end_ns: i * 2_000_000 + 35_000,
                payload_bytes: 4096,
            },
            arrival_ns: i * 2_000_000 + 40_000,
        })
        .collect();

    c.bench_function("window/fold_4096", |b| {
        b.iter(|| {
            let mut state = WindowState::Uninitialized;
            let mut closed = 0usize;
            for d in &deliveries {
                let (next, report) = advance(state, black_box(d), window);
                state = next;
                closed += usize::from(report.is_some());
            }
            black_box((state, closed))
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_record(c);
    bench_probe_lifecycle(c);
    bench_window_fold(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
