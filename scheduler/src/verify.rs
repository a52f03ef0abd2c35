// verify.rs — Bound verification per compute-scope instance
//
// On entry to every scope instance the verifier derives the region of the
// producer its consumers will read, evaluates the producer's explicit bounds
// under the current parameter values, and checks that each declared interval
// covers the required one. The storage region of the instance is the
// declared interval where a bound exists and the required interval otherwise.
//
// Preconditions: the plan was built from the same stages and descriptor.
// Postconditions: `ScopeCheck::Verified` carries a region containing every
//                 point the consumers read.
// Failure modes: negative declared extents and unbound parameters are
//                returned as errors; insufficient bounds are a `Violated`
//                verdict for the caller to route through the error handler.
// Side effects: none.

use std::fmt;

use tracing::trace;

use crate::error::{Result, RuntimeError};
use crate::expr::{evaluate, ParamBindings};
use crate::id::StageId;
use crate::region::{Interval, Region};
use crate::schedule::{ExplicitBound, ScheduleDescriptor, SchedulePlan, ScopeKind};
use crate::stage::{Stage, Stages};

// ── Violations ──────────────────────────────────────────────────────────────

/// Declared bounds that fail to cover the required region, as inclusive
/// ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundsViolation {
    pub stage: String,
    pub dim: String,
    pub declared_min: i64,
    pub declared_max: i64,
    pub required_min: i64,
    pub required_max: i64,
}

impl BoundsViolation {
    fn new(stage: &str, dim: &str, declared: Interval, required: Interval) -> Self {
        BoundsViolation {
            stage: stage.to_string(),
            dim: dim.to_string(),
            declared_min: declared.min,
            declared_max: declared.max(),
            required_min: required.min,
            required_max: required.max(),
        }
    }
}

impl fmt::Display for BoundsViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bounds given for {} in {} (from {} to {}) do not cover required region (from {} to {})",
            self.stage,
            self.dim,
            self.declared_min,
            self.declared_max,
            self.required_min,
            self.required_max
        )
    }
}

/// `declared` covers `required` iff it starts no later and ends no earlier.
pub fn check_coverage(declared: Interval, required: Interval) -> bool {
    required.min >= declared.min && required.end() <= declared.end()
}

/// Evaluate an explicit bound. A bound without a min follows `required.min`.
pub fn evaluate_bound(
    stage: &Stage,
    bound: &ExplicitBound,
    required: Interval,
    bindings: &ParamBindings,
) -> Result<Interval> {
    let min = match &bound.min {
        Some(min) => evaluate(min, bindings)?,
        None => required.min,
    };
    let extent = evaluate(&bound.extent, bindings)?;
    if extent < 0 {
        return Err(RuntimeError::NegativeExtent {
            stage: stage.name.clone(),
            dim: bound.dim.clone(),
            extent,
        });
    }
    Ok(Interval::new(min, extent))
}

// ── Verdicts ────────────────────────────────────────────────────────────────

/// Outcome of checking one dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Covered { declared: Interval },
    /// No explicit bound; storage follows the required region.
    Undeclared,
    Insufficient(BoundsViolation),
}

/// Outcome of checking a whole scope instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeCheck {
    Verified { storage: Region },
    /// First violating dimension, innermost first.
    Violated(BoundsViolation),
}

/// One entry into a producer's compute scope.
#[derive(Debug, Clone)]
pub struct ScopeInstance {
    pub producer: StageId,
    pub kind: ScopeKind,
    /// Region the consumers read during this instance.
    pub required: Region,
}

// ── Verifier ────────────────────────────────────────────────────────────────

pub struct Verifier<'a> {
    stages: &'a Stages,
    schedule: &'a ScheduleDescriptor,
    plan: &'a SchedulePlan,
    bindings: &'a ParamBindings,
}

impl<'a> Verifier<'a> {
    pub fn new(
        stages: &'a Stages,
        schedule: &'a ScheduleDescriptor,
        plan: &'a SchedulePlan,
        bindings: &'a ParamBindings,
    ) -> Self {
        Verifier {
            stages,
            schedule,
            plan,
            bindings,
        }
    }

    /// Region of `producer` read by `consumers`, each evaluated over the
    /// given region. Calls through inlined stages are followed.
    pub fn required_region(&self, producer: StageId, consumers: &[(StageId, &Region)]) -> Region {
        let mut acc = None;
        for (consumer, region) in consumers {
            self.footprint(self.stages.by_id(*consumer), region, producer, &mut acc);
        }
        acc.unwrap_or_else(|| {
            let rank = self.stages.by_id(producer).dims.len();
            Region::from_extents(&vec![0; rank])
        })
    }

    fn footprint(&self, owner: &Stage, region: &Region, target: StageId, acc: &mut Option<Region>) {
        owner.definition.for_each_call(&mut |callee, args| {
            let Some(callee) = self.stages.get(callee) else {
                return;
            };
            let read = Region::new(
                args.iter()
                    .map(|a| match owner.dim_index(&a.var) {
                        Some(d) => region.dims[d].shift(a.offset),
                        None => Interval::new(0, 0),
                    })
                    .collect(),
            );
            if callee.id == target {
                *acc = Some(match acc.take() {
                    Some(prev) => prev.hull(&read),
                    None => read,
                });
            } else if self.plan.is_inlined(callee.id) {
                self.footprint(callee, &read, target, acc);
            }
        });
    }

    /// Check one dimension of `stage` against the region required of it.
    pub fn verify_dim(&self, stage: &Stage, dim: usize, required: Interval) -> Result<Verdict> {
        let name = &stage.dims[dim];
        let Some(bound) = self.schedule.get(&stage.name).bound_for(name) else {
            return Ok(Verdict::Undeclared);
        };
        let declared = evaluate_bound(stage, bound, required, self.bindings)?;
        if check_coverage(declared, required) {
            Ok(Verdict::Covered { declared })
        } else {
            Ok(Verdict::Insufficient(BoundsViolation::new(
                &stage.name,
                name,
                declared,
                required,
            )))
        }
    }

    /// Verify every dimension of a scope instance and derive its storage.
    pub fn verify(&self, instance: &ScopeInstance) -> Result<ScopeCheck> {
        let stage = self.stages.by_id(instance.producer);
        trace!(
            stage = %stage.name,
            required = %instance.required,
            kind = ?instance.kind,
            "entering scope instance"
        );
        let mut storage = Vec::with_capacity(stage.dims.len());
        for (dim, &required) in instance.required.dims.iter().enumerate() {
            match self.verify_dim(stage, dim, required)? {
                Verdict::Covered { declared } => storage.push(declared),
                Verdict::Undeclared => storage.push(required),
                Verdict::Insufficient(violation) => return Ok(ScopeCheck::Violated(violation)),
            }
        }
        Ok(ScopeCheck::Verified {
            storage: Region::new(storage),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::stage::{Access, Definition};

    fn f_and_g() -> Stages {
        let mut stages = Stages::new();
        stages.define("f", &["x"], Definition::var("x")).unwrap();
        stages
            .define("g", &["x"], Definition::call("f", [Access::at("x")]))
            .unwrap();
        stages
    }

    fn stack_schedule() -> ScheduleDescriptor {
        let mut s = ScheduleDescriptor::new();
        s.set_split("g", "x", "xo", "xi", Expr::param("p"))
            .set_compute_scope("f", "g", "xo")
            .set_explicit_bound_extent("f", "x", 8);
        s
    }

    fn instance(stages: &Stages, required: Interval) -> ScopeInstance {
        ScopeInstance {
            producer: stages.lookup("f").unwrap().id,
            kind: ScopeKind::PerIteration,
            required: Region::new(vec![required]),
        }
    }

    #[test]
    fn coverage_is_inclusive_at_both_ends() {
        let declared = Interval::new(0, 8);
        assert!(check_coverage(declared, Interval::new(0, 8)));
        assert!(check_coverage(declared, Interval::new(3, 5)));
        assert!(!check_coverage(declared, Interval::new(0, 9)));
        assert!(!check_coverage(declared, Interval::new(-1, 2)));
    }

    #[test]
    fn violation_message() {
        let v = BoundsViolation::new("f", "x", Interval::new(0, 8), Interval::new(0, 10));
        assert_eq!(
            v.to_string(),
            "Bounds given for f in x (from 0 to 7) do not cover required region (from 0 to 9)"
        );
    }

    #[test]
    fn missing_min_follows_required_min() {
        let stages = f_and_g();
        let schedule = stack_schedule();
        let g = stages.lookup("g").unwrap().id;
        let plan = schedule.plan(&stages, g).unwrap();
        let bindings: ParamBindings = [("p", 5)].into_iter().collect();
        let verifier = Verifier::new(&stages, &schedule, &plan, &bindings);

        let check = verifier.verify(&instance(&stages, Interval::new(15, 5))).unwrap();
        assert_eq!(
            check,
            ScopeCheck::Verified {
                storage: Region::new(vec![Interval::new(15, 8)])
            }
        );
    }

    #[test]
    fn tile_larger_than_bound_is_violated() {
        let stages = f_and_g();
        let schedule = stack_schedule();
        let g = stages.lookup("g").unwrap().id;
        let plan = schedule.plan(&stages, g).unwrap();
        let bindings: ParamBindings = [("p", 10)].into_iter().collect();
        let verifier = Verifier::new(&stages, &schedule, &plan, &bindings);

        match verifier.verify(&instance(&stages, Interval::new(0, 10))).unwrap() {
            ScopeCheck::Violated(v) => {
                assert_eq!((v.declared_min, v.declared_max), (0, 7));
                assert_eq!((v.required_min, v.required_max), (0, 9));
            }
            other => panic!("expected a violation, got {other:?}"),
        }
    }

    #[test]
    fn undeclared_dimension_uses_required_region() {
        let stages = f_and_g();
        let mut schedule = ScheduleDescriptor::new();
        schedule.set_compute_root("f");
        let g = stages.lookup("g").unwrap().id;
        let plan = schedule.plan(&stages, g).unwrap();
        let bindings = ParamBindings::new();
        let verifier = Verifier::new(&stages, &schedule, &plan, &bindings);

        let f = stages.lookup("f").unwrap();
        assert_eq!(
            verifier.verify_dim(f, 0, Interval::new(0, 20)).unwrap(),
            Verdict::Undeclared
        );
    }

    #[test]
    fn negative_declared_extent_is_an_error() {
        let stages = f_and_g();
        let mut schedule = ScheduleDescriptor::new();
        schedule
            .set_compute_root("f")
            .set_explicit_bound("f", "x", 0, Expr::param("n"));
        let g = stages.lookup("g").unwrap().id;
        let plan = schedule.plan(&stages, g).unwrap();
        let bindings: ParamBindings = [("n", -3)].into_iter().collect();
        let verifier = Verifier::new(&stages, &schedule, &plan, &bindings);

        let err = verifier
            .verify(&instance(&stages, Interval::new(0, 4)))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NegativeExtent { extent: -3, .. }));
    }

    #[test]
    fn required_region_follows_offsets_through_inlined_stages() {
        let mut stages = Stages::new();
        stages.define("f", &["x"], Definition::var("x")).unwrap();
        stages
            .define(
                "blur",
                &["x"],
                Definition::call("f", [Access::offset("x", -1)])
                    + Definition::call("f", [Access::offset("x", 1)]),
            )
            .unwrap();
        stages
            .define("out", &["x"], Definition::call("blur", [Access::offset("x", 2)]))
            .unwrap();
        let mut schedule = ScheduleDescriptor::new();
        schedule.set_compute_root("f");
        let out = stages.lookup("out").unwrap().id;
        let plan = schedule.plan(&stages, out).unwrap();
        let bindings = ParamBindings::new();
        let verifier = Verifier::new(&stages, &schedule, &plan, &bindings);

        let region = Region::from_extents(&[10]);
        let required = verifier.required_region(stages.lookup("f").unwrap().id, &[(out, &region)]);
        // out reads blur over [2, 12); blur reads f over [1, 13).
        assert_eq!(required, Region::new(vec![Interval::new(1, 12)]));
    }
}
