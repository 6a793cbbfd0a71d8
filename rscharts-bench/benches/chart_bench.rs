//! Chart parsing, compilation and expression benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rscharts_model::{ChartDocument, Expr};
use serde_json::json;

fn wide_chart_json(count: usize) -> String {
    let states: Vec<_> = (0..count)
        .map(|i| {
            json!({
                "type": "state",
                "id": format!("s{}", i),
                "transitions": [
                    {"event": [format!("next_{}", i)], "target": [format!("s{}", (i + 1) % count)]}
                ]
            })
        })
        .collect();
    json!({"name": "wide", "states": states}).to_string()
}

fn nested_chart_json(depth: usize) -> String {
    let mut state = json!({"type": "state", "id": format!("d{}", depth)});
    for level in (0..depth).rev() {
        state = json!({
            "type": "state",
            "id": format!("d{}", level),
            "states": [state]
        });
    }
    json!({"name": "nested", "states": [state]}).to_string()
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("chart_parse");

    for size in [10, 50] {
        let source = wide_chart_json(size);
        group.bench_with_input(BenchmarkId::new("wide", size), &source, |b, source| {
            b.iter(|| black_box(ChartDocument::from_json(source).unwrap()));
        });
    }

    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("chart_compile");

    let wide = ChartDocument::from_json(&wide_chart_json(50)).unwrap();
    group.bench_function("wide_50", |b| {
        b.iter(|| black_box(wide.compile().unwrap()));
    });

    let nested = ChartDocument::from_json(&nested_chart_json(10)).unwrap();
    group.bench_function("nested_10", |b| {
        b.iter(|| black_box(nested.compile().unwrap()));
    });

    group.finish();
}

fn bench_expressions(c: &mut Criterion) {
    let mut group = c.benchmark_group("chart_expr");
    group.throughput(Throughput::Elements(1));

    let data = json!({
        "order": {"total": 250, "items": 3},
        "limit": 1000,
        "_event": {"name": "pay", "data": {"amount": 250}}
    });

    let comparison = Expr::parse("ctx.order.total <= ctx.limit").unwrap();
    group.bench_function("comparison", |b| {
        b.iter(|| black_box(comparison.evaluate(&data).unwrap()));
    });

    let arithmetic = Expr::parse("ctx.order.total * ctx.order.items + 10").unwrap();
    group.bench_function("arithmetic", |b| {
        b.iter(|| black_box(arithmetic.evaluate(&data).unwrap()));
    });

    let event_access = Expr::parse("ctx._event.data.amount == ctx.order.total").unwrap();
    group.bench_function("event_access", |b| {
        b.iter(|| black_box(event_access.evaluate(&data).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_compile, bench_expressions);
criterion_main!(benches);
