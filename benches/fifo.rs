use std::time::{Duration, Instant};

use courier::core::config::WaitStrategy;
use courier::{LocalNode, NodeConfig};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tempfile::tempdir;

const MSG_SIZE: usize = 64;
const BATCH: u64 = 100_000;

fn config() -> NodeConfig {
    NodeConfig {
        segment_size: 16 * 1024 * 1024,
        wait_strategy: WaitStrategy::Hybrid { spin_us: 50 },
        ..NodeConfig::default()
    }
}

fn bench_loopback(c: &mut Criterion) {
    let dir = tempdir().expect("tempdir");
    let mut node = LocalNode::create(dir.path(), 0, config()).expect("node");
    let payload = [0u8; MSG_SIZE];

    let mut group = c.benchmark_group("fifo_loopback");
    group.throughput(Throughput::Elements(1));
    group.bench_function("send_read_release", |b| {
        b.iter(|| {
            node.send(0, black_box(&payload)).expect("send");
            let msg = node.read_own_queue().expect("msg");
            node.release(msg).expect("release");
        })
    });
    group.finish();
}

fn bench_two_nodes(c: &mut Criterion) {
    let mut group = c.benchmark_group("fifo_two_nodes");
    group.measurement_time(Duration::from_secs(20));
    group.throughput(Throughput::Elements(BATCH));

    group.bench_function("1_producer_1_consumer", |b| {
        b.iter_custom(|iters| {
            let dir = tempdir().expect("tempdir");
            let mut consumer = LocalNode::create(dir.path(), 0, config()).expect("consumer");
            let mut producer = LocalNode::create(dir.path(), 1, config()).expect("producer");
            consumer.attach_peer(1).expect("attach");
            producer.attach_peer(0).expect("attach");

            let total = BATCH * iters;
            let payload = [0u8; MSG_SIZE];
            let start = Instant::now();
            let handle = std::thread::spawn(move || {
                let mut received = 0;
                while received < total {
                    match consumer.read_own_queue() {
                        Some(msg) => {
                            consumer.release(msg).expect("release");
                            received += 1;
                        }
                        None => std::hint::spin_loop(),
                    }
                }
                consumer
            });
            for _ in 0..total {
                loop {
                    match producer.send(0, black_box(&payload)) {
                        Ok(()) => break,
                        // Returned fragments are recycled while reading.
                        Err(courier::Error::ResourceExhausted { .. }) => {
                            if let Some(msg) = producer.read_own_queue() {
                                producer.release(msg).expect("release");
                            }
                        }
                        Err(err) => panic!("send failed: {err}"),
                    }
                }
            }
            let consumer = handle.join().expect("consumer");
            let elapsed = start.elapsed();
            drop(consumer);
            elapsed
        })
    });
    group.finish();
}

criterion_group!(benches, bench_loopback, bench_two_nodes);
criterion_main!(benches);
