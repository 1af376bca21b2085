//! Queue throughput benchmarks.
//!
//! A producer thread streams values as fast as it can while the consumer
//! keeps up, across the generic shapes and the specialised intrusive MPSC.

use std::hint::black_box;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use futures::executor::block_on;

use filament::queue::{NonFifoMpscQueue, SpscQueue};
use filament::{Deadline, TaskProcessor, mpsc};

const MESSAGES: u64 = 100_000;
const CAPACITY: usize = 1024;

fn spsc_noblock_throughput(c: &mut Criterion) {
    c.bench_function("spsc_noblock_throughput", |b| {
        b.iter(|| {
            let queue = SpscQueue::<u64>::create(CAPACITY);
            let producer = queue.get_producer();
            let consumer = queue.get_consumer();

            let feeder = std::thread::spawn(move || {
                for i in 0..MESSAGES {
                    while !producer.push_noblock(i) {
                        std::hint::spin_loop();
                    }
                }
            });

            let mut received = 0;
            while received < MESSAGES {
                if let Some(value) = consumer.pop_noblock() {
                    black_box(value);
                    received += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
            feeder.join().unwrap();
        })
    });
}

fn mpsc_fibers_fan_in(c: &mut Criterion) {
    let processor = TaskProcessor::new(num_cpus::get().min(4));

    c.bench_function("mpsc_fibers_fan_in", |b| {
        b.iter(|| {
            let queue = NonFifoMpscQueue::<u64>::create(CAPACITY);
            let producers: Vec<_> = (0..4u64)
                .map(|p| {
                    let producer = queue.get_producer();
                    processor.spawn(async move {
                        for i in 0..(MESSAGES / 40) {
                            assert!(producer.push(p * MESSAGES + i, Deadline::NONE).await);
                        }
                    })
                })
                .collect();

            let consumer = queue.get_consumer();
            let drainer = processor.spawn(async move {
                let mut count = 0u64;
                while let Some(value) = consumer.pop(Deadline::NONE).await {
                    black_box(value);
                    count += 1;
                }
                count
            });

            for producer in producers {
                block_on(producer.join()).unwrap();
            }
            drop(queue);
            assert_eq!(block_on(drainer.join()).unwrap(), 4 * (MESSAGES / 40));
        })
    });

    processor.shutdown();
}

fn intrusive_mpsc_vs_generic(c: &mut Criterion) {
    let mut group = c.benchmark_group("mpsc_variants");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("generic", |b| {
        b.iter(|| {
            let queue = NonFifoMpscQueue::<Box<u64>>::create(CAPACITY);
            let producer = queue.get_producer();
            let consumer = queue.get_consumer();
            for i in 0..10_000u64 {
                assert!(producer.push_noblock(Box::new(i)));
                black_box(consumer.pop_noblock().unwrap());
            }
        })
    });

    group.bench_function("intrusive", |b| {
        b.iter(|| {
            let queue = mpsc::MpscQueue::<Box<u64>>::create(CAPACITY);
            let producer = queue.get_producer();
            let consumer = queue.get_consumer();
            for i in 0..10_000u64 {
                assert!(producer.push_noblock(Box::new(i)));
                black_box(consumer.pop_noblock().unwrap());
            }
        })
    });

    group.finish();
}

fn bounded_backpressure(c: &mut Criterion) {
    let processor = TaskProcessor::new(2);

    c.bench_function("bounded_backpressure_small_queue", |b| {
        b.iter(|| {
            let queue = SpscQueue::<u64>::create(8);
            let producer = queue.get_producer();
            let consumer = queue.get_consumer();

            let feeder = processor.spawn(async move {
                for i in 0..10_000u64 {
                    assert!(producer.push(i, Deadline::NONE).await);
                }
            });
            let drainer = processor.spawn(async move {
                let mut count = 0u64;
                while consumer.pop(Deadline::NONE).await.is_some() {
                    count += 1;
                }
                count
            });

            block_on(feeder.join()).unwrap();
            drop(queue);
            assert_eq!(block_on(drainer.join()).unwrap(), 10_000);
        })
    });

    processor.shutdown();
}

criterion_group!(
    benches,
    spsc_noblock_throughput,
    mpsc_fibers_fan_in,
    intrusive_mpsc_vs_generic,
    bounded_backpressure
);
criterion_main!(benches);
