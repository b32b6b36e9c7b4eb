//! Benchmark for the output lottery.
//!
//! Starting a task rolls every execution up front, so the roll is on the
//! request path of `/factory/start`.
//!
//! Run with: cargo bench --package oroboros_factory --bench lottery_benchmark

use chrono::Duration;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use oroboros_economy::ItemVariant;
use oroboros_factory::lottery::resolve_outputs;
use oroboros_factory::recipe::{OutputGroup, OutputRule, RecipeInput, VariantSource};
use oroboros_factory::{Modifiers, Recipe, RecipeEngine, SecureSeed, TaskId};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

fn rule(item: u32, quantity: u64, probability: u32) -> OutputRule {
    OutputRule {
        item,
        min_quantity: quantity,
        max_quantity: quantity,
        probability,
        variant: VariantSource::Inherit(0),
    }
}

fn create_chest() -> Recipe {
    Recipe {
        id: 1,
        code: "resource_chest_s_open".to_string(),
        operation_class: "chest_opening".to_string(),
        duration: Duration::seconds(60),
        active: true,
        inputs: vec![RecipeInput {
            item: 100,
            quantity: 1,
            variant: None,
        }],
        output_groups: vec![OutputGroup {
            rules: vec![
                rule(101, 40, 40),
                rule(102, 40, 40),
                rule(103, 15, 15),
                rule(104, 5, 5),
            ],
        }],
        limits: Vec::new(),
    }
}

fn benchmark_single_roll(c: &mut Criterion) {
    let recipe = create_chest();
    let variants = [ItemVariant::new(1, 1)];
    let mut rng = ChaCha20Rng::seed_from_u64(42);

    c.bench_function("single_execution_roll", |b| {
        b.iter(|| black_box(resolve_outputs(&mut rng, black_box(&recipe), &variants)));
    });
}

fn benchmark_task_rolls(c: &mut Criterion) {
    let recipe = create_chest();
    let variants = [ItemVariant::new(1, 1)];
    let engine = RecipeEngine::new(SecureSeed::test_seed());
    let task = TaskId::new("9f2c4e61a0b7d3c85e1f6a2b4c8d0e17");

    let mut group = c.benchmark_group("task_roll");
    for executions in [1u32, 10, 100] {
        group.throughput(Throughput::Elements(u64::from(executions)));
        group.bench_with_input(
            BenchmarkId::from_parameter(executions),
            &executions,
            |b, &executions| {
                b.iter(|| {
                    black_box(engine.resolve_task(
                        &recipe,
                        &variants,
                        &task,
                        executions,
                        Modifiers::default(),
                    ))
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, benchmark_single_roll, benchmark_task_rolls);
criterion_main!(benches);
