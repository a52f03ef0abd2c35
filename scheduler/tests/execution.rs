// Integration tests: end-to-end execution under different schedules.
//
// Covers root stages, multi-dimensional nests, inlined chains, parallel
// loops and schedule validation errors surfaced through `execute`.

use std::sync::{Arc, Mutex};

use stagebound::{
    Access, Definition, Diagnostic, Expr, Pipeline, RuntimeConfig, RuntimeError, UserContext,
};

fn recording_handler(p: &mut Pipeline) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    p.install_error_handler(move |_: &UserContext, diag: &Diagnostic| {
        sink.lock().unwrap().push(diag.message.clone());
    });
    seen
}

/// f(x) = x * x; out(x) = f(x) + f(x + 2)
fn stencil() -> Pipeline {
    let mut p = Pipeline::new("stencil");
    p.define("f", &["x"], Definition::var("x") * Definition::var("x"))
        .unwrap();
    p.define(
        "out",
        &["x"],
        Definition::call("f", [Access::at("x")]) + Definition::call("f", [Access::offset("x", 2)]),
    )
    .unwrap();
    p
}

fn stencil_expected(n: i64) -> Vec<i64> {
    (0..n).map(|x| x * x + (x + 2) * (x + 2)).collect()
}

// ── Root stages ─────────────────────────────────────────────────────────────

#[test]
fn root_stage_is_computed_once_over_its_footprint() {
    let mut p = stencil();
    p.schedule_mut().set_compute_root("f");

    let out = p.execute(&[10]).unwrap();

    assert!(out.is_complete());
    assert_eq!(out.values(), stencil_expected(10).as_slice());
    let stats = p.allocation_stats();
    assert_eq!(stats.dynamic_allocations, 1);
    assert_eq!(stats.dynamic_frees, 1);
    assert_eq!(stats.dynamic_bytes, 12 * 8);
}

#[test]
fn root_stage_is_never_placed_on_stack() {
    let mut p = stencil();
    p.schedule_mut()
        .set_compute_root("f")
        .set_explicit_bound("f", "x", 0, 12);

    assert!(p.execute(&[10]).unwrap().is_complete());
    let stats = p.allocation_stats();
    assert_eq!(stats.stack_allocations, 0);
    assert_eq!(stats.dynamic_allocations, 1);
}

#[test]
fn root_stage_with_short_bound_reports_violation() {
    let mut p = stencil();
    let errors = recording_handler(&mut p);
    p.schedule_mut()
        .set_compute_root("f")
        .set_explicit_bound("f", "x", 0, 10);

    let out = p.execute(&[10]).unwrap();

    assert!(!out.is_complete());
    assert_eq!(
        *errors.lock().unwrap(),
        vec!["Bounds given for f in x (from 0 to 9) do not cover required region (from 0 to 11)"]
    );
    assert_eq!(p.allocation_stats().dynamic_allocations, 0);
}

#[test]
fn root_chain_is_realized_producer_first() {
    let mut p = stencil();
    p.define("h", &["x"], Definition::call("out", [Access::offset("x", 1)]) - 1)
        .unwrap();
    p.schedule_mut().set_compute_root("f").set_compute_root("out");

    let out = p.execute(&[5]).unwrap();

    let expected: Vec<i64> = stencil_expected(6)[1..].iter().map(|v| v - 1).collect();
    assert_eq!(out.values(), expected.as_slice());
    assert_eq!(p.allocation_stats().dynamic_allocations, 2);
}

/// f(x) = x * x at root; g(x) = f(x) + f(x + 1) per tile of
/// h(x) = g(x) + g(x + 1), with g bounded to `extent`.
fn root_under_scope(extent: i64) -> Pipeline {
    let mut p = Pipeline::new("root_under_scope");
    p.define("f", &["x"], Definition::var("x") * Definition::var("x"))
        .unwrap();
    p.define(
        "g",
        &["x"],
        Definition::call("f", [Access::at("x")]) + Definition::call("f", [Access::offset("x", 1)]),
    )
    .unwrap();
    p.define(
        "h",
        &["x"],
        Definition::call("g", [Access::at("x")]) + Definition::call("g", [Access::offset("x", 1)]),
    )
    .unwrap();
    p.schedule_mut()
        .set_compute_root("f")
        .set_split("h", "x", "xo", "xi", 4)
        .set_compute_scope("g", "h", "xo")
        .set_explicit_bound_extent("g", "x", extent);
    p
}

fn root_under_scope_expected(n: i64) -> Vec<i64> {
    let g = |x: i64| x * x + (x + 1) * (x + 1);
    (0..n).map(|x| g(x) + g(x + 1)).collect()
}

#[test]
fn root_read_inside_a_loop_covers_every_tile() {
    let p = root_under_scope(5);

    let out = p.execute(&[10]).unwrap();

    assert!(out.is_complete());
    assert_eq!(out.values(), root_under_scope_expected(10).as_slice());
    let stats = p.allocation_stats();
    assert_eq!(stats.dynamic_allocations, 1);
    // Tiles start at 0, 4 and 6, so g is stored over [0, 11) and f over [0, 12).
    assert_eq!(stats.dynamic_bytes, 12 * 8);
    assert_eq!(stats.stack_allocations, 3);
}

#[test]
fn root_read_inside_a_loop_follows_declared_storage() {
    let p = root_under_scope(6);

    let out = p.execute(&[10]).unwrap();

    // g is computed over its whole declared extent, up to x = 11.
    assert!(out.is_complete());
    assert_eq!(out.values(), root_under_scope_expected(10).as_slice());
    assert_eq!(p.allocation_stats().dynamic_bytes, 13 * 8);
}

#[test]
fn declared_min_shifts_storage() {
    let mut p = stencil();
    let errors = recording_handler(&mut p);
    p.schedule_mut()
        .set_compute_root("f")
        .set_explicit_bound("f", "x", 1, 12);

    let out = p.execute(&[10]).unwrap();

    assert!(!out.is_complete());
    assert_eq!(
        errors.lock().unwrap()[0],
        "Bounds given for f in x (from 1 to 12) do not cover required region (from 0 to 11)"
    );
}

// ── Output bounds ───────────────────────────────────────────────────────────

#[test]
fn output_bound_is_verified_against_requested_region() {
    let mut p = stencil();
    let errors = recording_handler(&mut p);
    p.schedule_mut()
        .set_compute_root("out")
        .set_explicit_bound("out", "x", 0, 8);

    assert!(p.execute(&[8]).unwrap().is_complete());
    assert!(!p.execute(&[9]).unwrap().is_complete());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

// ── Multi-dimensional nests ─────────────────────────────────────────────────

#[test]
fn two_dimensional_tiles_with_per_row_producer() {
    let mut p = Pipeline::new("grid");
    p.define(
        "f",
        &["x", "y"],
        Definition::var("x") + Definition::var("y") * 100,
    )
    .unwrap();
    p.define(
        "g",
        &["x", "y"],
        Definition::call("f", [Access::at("x"), Access::at("y")])
            + Definition::call("f", [Access::offset("x", 1), Access::offset("y", 1)]),
    )
    .unwrap();
    p.schedule_mut()
        .set_split("g", "y", "yo", "yi", 2)
        .set_compute_scope("f", "g", "yo")
        .set_explicit_bound_extent("f", "x", 7)
        .set_explicit_bound_extent("f", "y", 3);

    let out = p.execute(&[6, 4]).unwrap();

    assert!(out.is_complete());
    for y in 0..4 {
        for x in 0..6 {
            let f = |x: i64, y: i64| x + y * 100;
            assert_eq!(out.get(&[x, y]), Some(f(x, y) + f(x + 1, y + 1)));
        }
    }
    let stats = p.allocation_stats();
    assert_eq!(stats.stack_allocations, 2);
    assert_eq!(stats.dynamic_allocations, 0);
}

#[test]
fn producer_per_innermost_iteration() {
    let mut p = stencil();
    p.schedule_mut().set_compute_scope("f", "out", "x");

    let out = p.execute(&[6]).unwrap();

    assert_eq!(out.values(), stencil_expected(6).as_slice());
    assert_eq!(p.allocation_stats().dynamic_allocations, 6);
}

// ── Inlining ────────────────────────────────────────────────────────────────

#[test]
fn inlined_chain_feeds_scoped_producer_footprint() {
    let mut p = stencil();
    p.define("h", &["x"], Definition::call("out", [Access::offset("x", -1)]))
        .unwrap();
    let errors = recording_handler(&mut p);
    p.schedule_mut()
        .set_split("h", "x", "xo", "xi", 4)
        .set_compute_scope("f", "h", "xo")
        .set_explicit_bound_extent("f", "x", 6);

    let out = p.execute(&[8]).unwrap();

    assert!(out.is_complete(), "{:?}", errors.lock().unwrap());
    let expected: Vec<i64> = (0..8)
        .map(|x| (x - 1) * (x - 1) + (x + 1) * (x + 1))
        .collect();
    assert_eq!(out.values(), expected.as_slice());
    assert_eq!(p.allocation_stats().stack_allocations, 2);
}

// ── Parallel loops ──────────────────────────────────────────────────────────

fn parallel_tiles(parallel: bool) -> Pipeline {
    let mut p = stencil();
    p.set_config(RuntimeConfig {
        parallel,
        ..RuntimeConfig::default()
    });
    p.schedule_mut()
        .set_split("out", "x", "xo", "xi", Expr::param("p"))
        .set_parallel("out", "xo")
        .set_compute_scope("f", "out", "xo")
        .set_explicit_bound_extent("f", "x", 10);
    p
}

#[test]
fn parallel_tiles_match_serial_result() {
    for parallel in [false, true] {
        let mut p = parallel_tiles(parallel);
        p.set_parameter_value("p", 8);
        let out = p.execute(&[64]).unwrap();
        assert!(out.is_complete());
        assert_eq!(out.values(), stencil_expected(64).as_slice());
        assert_eq!(p.allocation_stats().stack_allocations, 8);
    }
}

#[test]
fn parallel_violation_is_reported_and_abandons() {
    let mut p = parallel_tiles(true);
    let errors = recording_handler(&mut p);
    p.set_parameter_value("p", 16);

    let out = p.execute(&[64]).unwrap();

    assert!(!out.is_complete());
    let errors = errors.lock().unwrap();
    assert!((1..=4).contains(&errors.len()), "{errors:?}");
    assert!(errors.iter().all(|m| m.starts_with("Bounds given for f in x")));
}

// ── Validation surfaced by execute ──────────────────────────────────────────

#[test]
fn compute_scope_on_missing_loop_is_an_error() {
    let mut p = stencil();
    p.schedule_mut().set_compute_scope("f", "out", "xo");
    let err = p.execute(&[4]).unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownVariable { ref var, .. } if var == "xo"));
}

#[test]
fn non_positive_split_factor_is_an_error() {
    let mut p = stencil();
    p.schedule_mut()
        .set_split("out", "x", "xo", "xi", Expr::param("p"));
    p.set_parameter_value("p", 0);
    let err = p.execute(&[4]).unwrap_err();
    assert!(matches!(err, RuntimeError::NonPositiveSplitFactor { factor: 0, .. }));
}

#[test]
fn negative_bound_extent_is_an_error() {
    let mut p = stencil();
    p.schedule_mut()
        .set_compute_root("f")
        .set_explicit_bound("f", "x", 0, Expr::param("n"));
    p.set_parameter_value("n", -1);
    let err = p.execute(&[4]).unwrap_err();
    assert!(matches!(err, RuntimeError::NegativeExtent { extent: -1, .. }));
}

#[test]
fn parameter_defined_in_stage_is_read_at_execution() {
    let mut p = Pipeline::new("param");
    p.define("f", &["x"], Definition::var("x") + Definition::param("k"))
        .unwrap();
    p.set_parameter_value("k", 100);
    assert_eq!(p.execute(&[3]).unwrap().values(), &[100, 101, 102]);
    p.set_parameter_value("k", -1);
    assert_eq!(p.execute(&[3]).unwrap().values(), &[-1, 0, 1]);
}
