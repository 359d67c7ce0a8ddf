//! Kernel evaluation benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nerd_core::kernel::schema::{ArgType, SchemaSet};
use nerd_core::kernel::types::{Fact, Value};
use nerd_core::kernel::Kernel;

fn chain_kernel(nodes: i64) -> Kernel {
    let mut schema = SchemaSet::new();
    schema
        .declare("edge", vec![ArgType::Int, ArgType::Int])
        .expect("fresh schema");
    let kernel = Kernel::with_schema(schema);
    kernel.set_policy(
        "path(X, Y) :- edge(X, Y).\npath(X, Z) :- path(X, Y), edge(Y, Z).",
    );
    for i in 0..nodes {
        kernel
            .assert_without_eval(Fact::binary("edge", Value::Int(i), Value::Int(i + 1)))
            .expect("declared predicate");
    }
    kernel
}

fn bench_transitive_closure(c: &mut Criterion) {
    let mut group = c.benchmark_group("transitive_closure");
    for nodes in [10i64, 50, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &nodes, |b, &nodes| {
            b.iter_batched(
                || chain_kernel(nodes),
                |kernel| {
                    kernel.evaluate().expect("fixpoint");
                    black_box(kernel.query("path").expect("query").len())
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_query_after_fixpoint(c: &mut Criterion) {
    let kernel = chain_kernel(100);
    kernel.evaluate().expect("fixpoint");

    c.bench_function("pattern_query", |b| {
        b.iter(|| black_box(kernel.query("path(1, Y)").expect("query").len()));
    });
}

fn bench_assert_and_reevaluate(c: &mut Criterion) {
    c.bench_function("assert_with_eval", |b| {
        b.iter_batched(
            || chain_kernel(50),
            |kernel| {
                kernel
                    .assert_fact(Fact::binary("edge", Value::Int(1000), Value::Int(1001)))
                    .expect("declared predicate");
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_transitive_closure,
    bench_query_after_fixpoint,
    bench_assert_and_reevaluate
);
criterion_main!(benches);
