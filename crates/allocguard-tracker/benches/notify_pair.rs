use std::sync::Arc;

use allocguard_tracker::{
    AllocationTracker, NullSink, TrackedAllocator, TrackerConfig, TrackerMode, ViolationPolicy,
};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

fn benchmark_alloc_free_pairs(c: &mut Criterion) {
    let sizes: [usize; 4] = [16, 64, 256, 4096];
    let mut group = c.benchmark_group("alloc_free_pair");

    let modes = [
        ("untracked", TrackerMode::Off),
        ("tracking", TrackerMode::Tracking),
        ("canaries", TrackerMode::Canaries),
    ];
    for (label, mode) in modes {
        let config = TrackerConfig {
            mode,
            ..TrackerConfig::default()
        };
        let tracker = AllocationTracker::with_config(&config, Arc::new(NullSink));
        let alloc = TrackedAllocator::new(&tracker).on_violation(ViolationPolicy::Report);

        for size in sizes {
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, &size| {
                b.iter(|| {
                    let user = alloc.alloc(black_box(size)).expect("malloc");
                    // SAFETY: user was just allocated and is not used afterwards.
                    unsafe { alloc.free(Some(black_box(user))) }.expect("tracked free");
                });
            });
        }
    }

    group.finish();
}

fn benchmark_leak_check(c: &mut Criterion) {
    let tracker = AllocationTracker::with_sink(Arc::new(NullSink));
    tracker.init(true);
    let alloc = TrackedAllocator::new(&tracker).on_violation(ViolationPolicy::Report);
    let held: Vec<_> = (0..1024)
        .map(|i| alloc.alloc(i % 128 + 1).expect("malloc"))
        .collect();

    c.bench_function("expect_no_allocations/1024_live", |b| {
        b.iter(|| black_box(tracker.expect_no_allocations()));
    });

    for user in held {
        // SAFETY: every held pointer is live.
        unsafe { alloc.free(Some(user)) }.expect("tracked free");
    }
}

criterion_group!(benches, benchmark_alloc_free_pairs, benchmark_leak_check);
criterion_main!(benches);
