//! Throughput benchmarks for the scheduler's hot path: queue admission,
//! eviction under load, aging sweeps, and priority scoring.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use seraph_core::priority::{BusinessHours, KeywordRules, PriorityCalculator, PriorityWeights};
use seraph_core::scheduler::priority_queue::PriorityQueue;
use seraph_core::types::{Alert, AlertId, AlertMetadata, PriorityClass, ServiceCriticality, ServiceDescriptor};

fn alert(class: PriorityClass, score: f64) -> Alert {
    alert_enqueued_at(class, score, 0)
}

fn alert_enqueued_at(class: PriorityClass, score: f64, enqueued_at_ms: u64) -> Alert {
    Alert {
        id: AlertId::new(),
        log: "disk usage at 92% on checkout-db-3".into(),
        reason: "disk pressure".into(),
        metadata: AlertMetadata::default(),
        priority_class: class,
        priority_score: score,
        enqueued_at_ms,
        estimated_duration_ms: 0,
    }
}

fn filled_queue(n: usize) -> PriorityQueue {
    let mut queue = PriorityQueue::new(None);
    for i in 0..n {
        let class = match i % 4 {
            0 => PriorityClass::Critical,
            1 => PriorityClass::High,
            2 => PriorityClass::Medium,
            _ => PriorityClass::Low,
        };
        queue.push(alert_enqueued_at(class, (i % 100) as f64 / 100.0, i as u64 * 1_000)).ok();
    }
    queue
}

fn calculator() -> PriorityCalculator {
    PriorityCalculator {
        weights: PriorityWeights::default(),
        keywords: KeywordRules::compile(
            &["out of memory".into(), "disk pressure".into()],
            &["connection refused".into()],
            &["deprecated".into()],
        )
        .unwrap(),
        services: vec![ServiceDescriptor {
            name: "checkout".into(),
            criticality: ServiceCriticality::Critical,
            business_impact: 1.0,
            user_count: 200_000,
        }],
        business_hours: BusinessHours::default(),
    }
}

fn bench_push_pop(c: &mut Criterion) {
    c.bench_function("priority_queue_push_1000", |b| {
        b.iter_batched(
            || (PriorityQueue::new(None), (0..1000).map(|i| alert(PriorityClass::Medium, i as f64)).collect::<Vec<_>>()),
            |(mut queue, alerts)| {
                for a in alerts {
                    queue.push(a).ok();
                }
                queue
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("priority_queue_pop_1000", |b| {
        b.iter_batched(
            || filled_queue(1000),
            |mut queue| {
                while queue.pop().is_some() {}
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_bounded_eviction(c: &mut Criterion) {
    c.bench_function("priority_queue_push_at_capacity", |b| {
        b.iter_batched(
            || {
                let mut queue = PriorityQueue::new(Some(500));
                for i in 0..500 {
                    queue.push(alert(PriorityClass::Medium, i as f64)).ok();
                }
                queue
            },
            |mut queue| {
                for i in 0..500 {
                    queue.push(alert(PriorityClass::Critical, i as f64)).ok();
                }
                queue
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_aging_sweep(c: &mut Criterion) {
    c.bench_function("priority_queue_age_1000", |b| {
        b.iter_batched(filled_queue_1000, |mut queue| queue.age(2_000_000), BatchSize::SmallInput)
    });
}

fn filled_queue_1000() -> PriorityQueue {
    filled_queue(1000)
}

fn bench_scoring(c: &mut Criterion) {
    let calc = calculator();
    let now = chrono::Utc::now();
    let a = alert(PriorityClass::Low, 0.0);

    c.bench_function("priority_calculator_score", |b| b.iter(|| calc.score(&a, now, 0.2)));
}

criterion_group!(benches, bench_push_pop, bench_bounded_eviction, bench_aging_sweep, bench_scoring);
criterion_main!(benches);
