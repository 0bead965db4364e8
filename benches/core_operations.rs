use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use memoric::prelude::*;
use memoric::{CausalConfig, EngineConfig, PatternConfig, PipelineConfig};
use serde_json::json;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Benchmark: Engine initialization
fn bench_engine_init(c: &mut Criterion) {
    c.bench_function("engine_init", |b| {
        b.to_async(Runtime::new().unwrap())
            .iter(|| async { black_box(MemoryEngine::start().await.unwrap()) })
    });
}

/// Benchmark: Single append operation
fn bench_append_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = rt.block_on(async { MemoryEngine::start().await.unwrap() });

    c.bench_function("append_single", |b| {
        b.to_async(Runtime::new().unwrap()).iter(|| async {
            black_box(
                engine
                    .append(
                        ExperienceRecord::new(json!({"reading": 20.5}))
                            .with_tags(["sensor"])
                            .with_context("location", json!("hall")),
                    )
                    .await
                    .unwrap(),
            )
        })
    });
}

/// Benchmark: Recall with a warm cache vs varying log sizes
fn bench_recall(c: &mut Criterion) {
    let mut group = c.benchmark_group("recall");

    for log_size in [100, 1000, 10000] {
        let rt = Runtime::new().unwrap();
        let (engine, target) = rt.block_on(async {
            let engine = MemoryEngine::start().await.unwrap();
            let mut target = None;
            for i in 0..log_size {
                let id = engine
                    .append(ExperienceRecord::new(json!({"id": i})))
                    .await
                    .unwrap();
                if i == log_size / 2 {
                    target = Some(id);
                }
            }
            (engine, target.unwrap())
        });

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(log_size), &log_size, |b, _| {
            b.to_async(Runtime::new().unwrap())
                .iter(|| async { black_box(engine.recall(target).await.unwrap()) })
        });
    }
    group.finish();
}

/// Benchmark: Time-range recall with varying window sizes
fn bench_recall_range(c: &mut Criterion) {
    let mut group = c.benchmark_group("recall_range");

    for log_size in [1000, 10000] {
        let rt = Runtime::new().unwrap();
        let base = Utc::now();
        let engine = rt.block_on(async {
            let engine = MemoryEngine::start().await.unwrap();
            for i in 0..log_size {
                engine
                    .append(
                        ExperienceRecord::new(json!({"id": i})).with_timestamp(
                            base + chrono::Duration::milliseconds(i as i64),
                        ),
                    )
                    .await
                    .unwrap();
            }
            engine
        });

        group.throughput(Throughput::Elements((log_size / 10) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(log_size), &log_size, |b, &size| {
            // A window covering a tenth of the log, from the middle
            let start = base + chrono::Duration::milliseconds((size / 2) as i64);
            let end = base + chrono::Duration::milliseconds((size / 2 + size / 10) as i64);
            b.to_async(Runtime::new().unwrap())
                .iter(|| async { black_box(engine.recall_range(start, end).await) })
        });
    }
    group.finish();
}

/// Benchmark: Working memory set under eviction pressure
fn bench_working_set(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = rt.block_on(async { MemoryEngine::start().await.unwrap() });

    c.bench_function("working_set", |b| {
        let mut i = 0u64;
        b.to_async(Runtime::new().unwrap()).iter(|| {
            i += 1;
            let key = format!("item{}", i % 256);
            let engine = &engine;
            async move {
                engine
                    .remember(key, json!(i), (i % 10) as f64 / 10.0, Duration::from_secs(60))
                    .await
            }
        })
    });
}

/// Benchmark: Inference over chains of varying depth
fn bench_infer(c: &mut Criterion) {
    let mut group = c.benchmark_group("infer");

    for chain_length in [10, 100] {
        let rt = Runtime::new().unwrap();
        let (engine, start_label) = rt.block_on(async {
            let engine = MemoryEngine::start().await.unwrap();
            let mut previous = engine
                .learn_concept(Concept::new("node0"))
                .await
                .unwrap();
            for i in 1..chain_length {
                let next = engine
                    .learn_concept(Concept::new(format!("node{}", i)))
                    .await
                    .unwrap();
                engine
                    .learn_relationship(
                        Relationship::new(previous, RelationKind::Causes, next.clone())
                            .with_confidence(0.95),
                    )
                    .await
                    .unwrap();
                previous = next;
            }
            (engine, "node0".to_string())
        });

        group.bench_with_input(
            BenchmarkId::from_parameter(chain_length),
            &chain_length,
            |b, _| {
                b.to_async(Runtime::new().unwrap()).iter(|| async {
                    black_box(
                        engine
                            .infer(&InferenceQuery::from_label(&start_label).with_max_hops(5))
                            .await
                            .unwrap(),
                    )
                })
            },
        );
    }
    group.finish();
}

/// Benchmark: Full pipeline run over varying window sizes
fn bench_pipeline_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_run");
    group.sample_size(20);

    for window_size in [100, 1000] {
        let rt = Runtime::new().unwrap();
        let engine = rt.block_on(async {
            let engine = MemoryEngine::start_with_config(EngineConfig {
                pipeline: PipelineConfig {
                    patterns: PatternConfig {
                        support_threshold: 5,
                    },
                    causal: CausalConfig {
                        min_samples: 5,
                        ..CausalConfig::default()
                    },
                    ..PipelineConfig::default()
                },
                ..EngineConfig::default()
            })
            .await
            .unwrap();
            for i in 0..window_size {
                engine
                    .append(
                        ExperienceRecord::new(json!({"id": i}))
                            .with_context("zone", json!(format!("z{}", i % 4)))
                            .with_context("load", json!((i % 50) as f64))
                            .with_outcome(if i % 3 == 0 { "busy" } else { "idle" }),
                    )
                    .await
                    .unwrap();
            }
            engine
        });

        group.throughput(Throughput::Elements(window_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(window_size),
            &window_size,
            |b, _| {
                b.to_async(Runtime::new().unwrap()).iter(|| async {
                    black_box(engine.run_pipeline(&AnalysisWindow::All).await.unwrap())
                })
            },
        );
    }
    group.finish();
}

// Reduced warm-up and measurement windows; these operations are
// microsecond-scale and stabilize quickly.
fn configure_criterion() -> Criterion {
    Criterion::default()
        .warm_up_time(Duration::from_secs(1))
        .measurement_time(Duration::from_secs(3))
        .sample_size(50)
}

criterion_group! {
    name = benches;
    config = configure_criterion();
    targets = bench_engine_init,
        bench_append_single,
        bench_recall,
        bench_recall_range,
        bench_working_set,
        bench_infer,
        bench_pipeline_run
}

criterion_main!(benches);
