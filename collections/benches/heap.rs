use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gridnav_collections::heap::OpenList;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn push_pop(c: &mut Criterion) {
    c.bench_function("heap-push-pop-10k", |b| {
        let mut rng = SmallRng::seed_from_u64(0);
        let prios: Vec<u64> = (0..10_000).map(|_| rng.random_range(0..1_000_000)).collect();
        b.iter(|| {
            let mut h: OpenList<usize, u64> = OpenList::new();
            for (k, &p) in prios.iter().enumerate() {
                h.push(k, p);
            }
            while let Some(kp) = h.pop() {
                black_box(kp);
            }
        })
    });
}

fn adjust_heavy(c: &mut Criterion) {
    c.bench_function("heap-adjust-10k", |b| {
        let mut rng = SmallRng::seed_from_u64(1);
        let prios: Vec<u64> = (0..10_000).map(|_| rng.random_range(0..1_000_000)).collect();
        let updates: Vec<(usize, u64)> = (0..10_000)
            .map(|_| (rng.random_range(0..10_000), rng.random_range(0..1_000_000)))
            .collect();
        b.iter(|| {
            let mut h: OpenList<usize, u64> = OpenList::new();
            for (k, &p) in prios.iter().enumerate() {
                h.push(k, p);
            }
            for &(k, p) in &updates {
                h.adjust(k, p);
            }
            black_box(h.pop())
        })
    });
}

criterion_group!(benches, push_pop, adjust_heavy);
criterion_main!(benches);
