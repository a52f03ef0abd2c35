use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use stagebound::{Access, Definition, Expr, Pipeline};

// Placement scenarios over the same two-stage pipeline:
// f(x) = x; g(x) = f(x - 1) + f(x + 1); g split by p, f at g.xo.

fn pipeline(bound: Option<Expr>, parallel: bool) -> Pipeline {
    let mut p = Pipeline::new("bench");
    p.define("f", &["x"], Definition::var("x")).unwrap();
    p.define(
        "g",
        &["x"],
        Definition::call("f", [Access::offset("x", -1)])
            + Definition::call("f", [Access::offset("x", 1)]),
    )
    .unwrap();
    let schedule = p.schedule_mut();
    schedule
        .set_split("g", "x", "xo", "xi", Expr::param("p"))
        .set_compute_scope("f", "g", "xo");
    if let Some(extent) = bound {
        schedule.set_explicit_bound_extent("f", "x", extent);
    }
    if parallel {
        schedule.set_parallel("g", "xo");
    }
    p.set_parameter_value("p", 64);
    p.set_parameter_value("e", 66);
    p
}

// Stack vs dynamic placement of the per-tile producer.
fn bench_placement(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute/placement");

    let cases = [
        ("stack", pipeline(Some(Expr::constant(66)), false)),
        ("dynamic", pipeline(Some(Expr::param("e")), false)),
        ("unbounded", pipeline(None, false)),
    ];
    for (name, p) in &cases {
        group.bench_function(*name, |b| {
            b.iter(|| {
                let out = p.execute(black_box(&[4096_i64][..])).unwrap();
                black_box(out.values().len());
            });
        });
    }

    group.finish();
}

// Serial vs parallel outer loop as the output grows.
fn bench_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute/scaling");

    let serial = pipeline(Some(Expr::constant(66)), false);
    let parallel = pipeline(Some(Expr::constant(66)), true);
    for n in [1_024_i64, 16_384, 131_072] {
        group.bench_with_input(BenchmarkId::new("serial", n), &n, |b, &n| {
            b.iter(|| black_box(serial.execute(&[n]).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("parallel", n), &n, |b, &n| {
            b.iter(|| black_box(parallel.execute(&[n]).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_placement, bench_scaling);
criterion_main!(benches);
