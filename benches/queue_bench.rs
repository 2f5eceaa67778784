use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use netcore::core::packet::{Packet, PacketPriority};
use netcore::protocol::{Request, RequestEvent, RequestPriority, RequestQueue};
use netcore::session::{PacketQueue, QueuePartitionManager, TicketQueue};

#[allow(clippy::unwrap_used)]
fn bench_packet_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_queue");

    group.bench_function("put_take_1000", |b| {
        let queue = PacketQueue::with_default_policy(2000);
        b.iter(|| {
            for _ in 0..1000 {
                queue.put(Packet::new(vec![0u8; 32])).unwrap();
            }
            while queue.take().is_some() {}
        })
    });

    group.bench_function("shedding_under_pressure", |b| {
        b.iter_batched(
            || {
                let queue = PacketQueue::with_default_policy(100);
                for _ in 0..85 {
                    queue
                        .put(Packet::new(vec![0u8]).with_priority(PacketPriority::Guaranteed))
                        .unwrap();
                }
                queue
            },
            |queue| {
                for _ in 0..100 {
                    let _ = queue.put(Packet::new(vec![0u8]).with_priority(PacketPriority::Low));
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_request_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_queue");
    let priorities = [
        RequestPriority::Low,
        RequestPriority::High,
        RequestPriority::Normal,
        RequestPriority::Highest,
    ];

    for ordered in [true, false] {
        group.bench_function(format!("enqueue_drain_500_ordered_{ordered}"), |b| {
            b.iter_batched(
                || RequestQueue::new(500, ordered),
                |queue| {
                    for i in 0..500 {
                        let request = Request::new(RequestEvent::SessionReadMessage)
                            .with_priority(priorities[i % priorities.len()]);
                        queue.enqueue_request(request).unwrap();
                    }
                    while queue.try_take().is_some() {}
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_partition_lookup(c: &mut Criterion) {
    let manager = QueuePartitionManager::new(16, TicketQueue::new).unwrap();
    c.bench_function("partition_lookup_10k", |b| {
        b.iter(|| {
            let mut total = 0usize;
            for id in 0..10_000i64 {
                total += manager.index_of(id);
            }
            total
        })
    });
}

criterion_group!(benches, bench_packet_queue, bench_request_queue, bench_partition_lookup);
criterion_main!(benches);
