// realize.rs — Execution of a planned pipeline over an output region
//
// Walks the loop nest of the output stage. On entry to every compute scope
// the attached producers are verified, allocated and computed before the
// loops inside the scope run, and released when the scope is left. Root
// stages are verified consumer-first and then computed producer-first ahead
// of the output; a root read from inside a loop is sized from the hull of
// the storage its scoped readers will use. Inlined stages are evaluated at
// every use.
//
// Preconditions: the plan was built from the same stages and descriptor; the
//                output region has non-negative extents and the output's rank.
// Postconditions: on a complete run every output element holds the value of
//                 the output definition at that point.
// Failure modes: handler-routed failures abandon the run (`Halt::Abandoned`);
//                programming errors are returned as `RuntimeError`s.
// Side effects: invokes allocator hooks and the error handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::diag::{codes, Diagnostic};
use crate::error::RuntimeError;
use crate::expr::{EvalError, ParamBindings};
use crate::hooks::{HookRegistry, UserContext};
use crate::id::StageId;
use crate::region::{ConcreteNest, Layout, Region};
use crate::schedule::{ScheduleDescriptor, SchedulePlan, ScopeKind};
use crate::stage::{Definition, Stage, Stages, Value};
use crate::storage::{
    decide, resolve_extents, vector_lanes, AllocationStats, Buffer, ExtentResolution,
    StorageAllocator,
};
use crate::verify::{ScopeCheck, ScopeInstance, Verifier};

// ── Control flow ────────────────────────────────────────────────────────────

/// Why a realization stopped early.
#[derive(Debug)]
pub(crate) enum Halt {
    /// A handler-routed failure was reported and the handler returned.
    Abandoned,
    Fatal(RuntimeError),
}

impl From<RuntimeError> for Halt {
    fn from(err: RuntimeError) -> Self {
        Halt::Fatal(err)
    }
}

impl From<EvalError> for Halt {
    fn from(err: EvalError) -> Self {
        Halt::Fatal(err.into())
    }
}

type Flow<T> = std::result::Result<T, Halt>;

/// Result of one run over the output region.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub values: Vec<Value>,
    pub complete: bool,
    pub warnings: Vec<Diagnostic>,
}

// ── Environment ─────────────────────────────────────────────────────────────

/// Buffers visible at the current point of the walk, innermost first.
struct Env<'e, 'a> {
    id: StageId,
    buffer: &'e Buffer<'a>,
    parent: Option<&'e Env<'e, 'a>>,
}

fn lookup<'e, 'a>(mut env: Option<&'e Env<'e, 'a>>, id: StageId) -> Option<&'e Buffer<'a>> {
    while let Some(node) = env {
        if node.id == id {
            return Some(node.buffer);
        }
        env = node.parent;
    }
    None
}

/// A stage's loop nest bound to the region it is computed over.
struct NestCtx<'s> {
    stage: &'s Stage,
    nest: ConcreteNest,
    layout: Layout,
}

// ── Realizer ────────────────────────────────────────────────────────────────

pub(crate) struct Realizer<'a> {
    stages: &'a Stages,
    plan: &'a SchedulePlan,
    bindings: &'a ParamBindings,
    verifier: Verifier<'a>,
    allocator: StorageAllocator<'a>,
    hooks: &'a HookRegistry,
    ctx: &'a UserContext,
    config: &'a RuntimeConfig,
    resolutions: HashMap<StageId, Vec<ExtentResolution>>,
    abort: AtomicBool,
    warnings: Mutex<Vec<Diagnostic>>,
}

impl<'a> Realizer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stages: &'a Stages,
        schedule: &'a ScheduleDescriptor,
        plan: &'a SchedulePlan,
        bindings: &'a ParamBindings,
        hooks: &'a HookRegistry,
        ctx: &'a UserContext,
        stats: &'a AllocationStats,
        config: &'a RuntimeConfig,
    ) -> Self {
        let mut resolutions = HashMap::new();
        let mut warnings = Vec::new();
        for &id in &plan.realized {
            let stage = stages.by_id(id);
            let sched = schedule.get(&stage.name);
            let resolution = resolve_extents(stage, sched);
            if let Some(nest) = plan.nests.get(&id) {
                for var in &sched.vectorized {
                    match vector_lanes(&resolution, nest, var) {
                        Some(lanes) => debug!(stage = %stage.name, %var, lanes, "vectorized loop"),
                        None => {
                            warn!(stage = %stage.name, %var, "vectorize request not honored");
                            warnings.push(
                                Diagnostic::warning(format!(
                                    "cannot vectorize {}.{}: its extent is not fixed",
                                    stage.name, var
                                ))
                                .with_code(codes::VECTORIZE_NOT_HONORED)
                                .with_stage(stage.name.clone())
                                .with_hint("split the loop by a literal factor or bound it by a literal extent"),
                            );
                        }
                    }
                }
            }
            resolutions.insert(id, resolution);
        }

        Realizer {
            stages,
            plan,
            bindings,
            verifier: Verifier::new(stages, schedule, plan, bindings),
            allocator: StorageAllocator::new(hooks.allocator(), ctx, stats),
            hooks,
            ctx,
            config,
            resolutions,
            abort: AtomicBool::new(false),
            warnings: Mutex::new(warnings),
        }
    }

    /// Realize the output over `region`.
    pub(crate) fn run(self, region: &Region) -> crate::error::Result<Outcome> {
        let mut values = vec![0; region.size()];
        let complete = match self.run_output(region, &mut values) {
            Ok(()) => true,
            Err(Halt::Abandoned) => false,
            Err(Halt::Fatal(err)) => return Err(err),
        };
        let warnings = self
            .warnings
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(Outcome {
            values,
            complete,
            warnings,
        })
    }

    /// Route a handler-routed failure to the error handler.
    fn fail(&self, err: RuntimeError) -> Halt {
        let diag = Diagnostic::from(&err);
        debug!(code = ?diag.code, "{}", diag.message);
        self.abort.store(true, Ordering::SeqCst);
        self.hooks.report(self.ctx, &diag);
        Halt::Abandoned
    }

    fn resolution(&self, id: StageId) -> &[ExtentResolution] {
        self.resolutions.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    // ── Scopes ──────────────────────────────────────────────────────────

    fn run_output(&self, region: &Region, values: &mut [Value]) -> Flow<()> {
        let output = self.plan.output;
        let instance = ScopeInstance {
            producer: output,
            kind: ScopeKind::Output,
            required: region.clone(),
        };
        if let ScopeCheck::Violated(v) = self.verifier.verify(&instance)? {
            return Err(self.fail(RuntimeError::BoundsInsufficient(v)));
        }

        // Consumers come after their producers, so walking roots backwards
        // sees every consumer's region before the producer's.
        let roots: Vec<StageId> = self.plan.roots().collect();
        let read_in_scopes = roots.iter().any(|root| {
            self.plan
                .consumers
                .get(root)
                .into_iter()
                .flatten()
                .any(|c| self.plan.scope_kinds.get(c) == Some(&ScopeKind::PerIteration))
        });
        let mut regions: HashMap<StageId, Region> = HashMap::new();
        if read_in_scopes {
            self.collect_footprints(output, region, &mut regions)?;
        }
        regions.insert(output, region.clone());
        for &root in roots.iter().rev() {
            let consumers: Vec<(StageId, &Region)> = self
                .plan
                .consumers
                .get(&root)
                .into_iter()
                .flatten()
                .filter_map(|c| regions.get(c).map(|r| (*c, r)))
                .collect();
            let required = self.verifier.required_region(root, &consumers);
            let instance = ScopeInstance {
                producer: root,
                kind: ScopeKind::Root,
                required,
            };
            match self.verifier.verify(&instance)? {
                ScopeCheck::Verified { storage } => {
                    if read_in_scopes {
                        self.collect_footprints(root, &storage, &mut regions)?;
                    }
                    regions.insert(root, storage);
                }
                ScopeCheck::Violated(v) => {
                    return Err(self.fail(RuntimeError::BoundsInsufficient(v)));
                }
            }
        }

        let roots: Vec<(StageId, Region)> = roots
            .into_iter()
            .filter_map(|id| regions.remove(&id).map(|r| (id, r)))
            .collect();
        self.enter_roots(&roots, region, None, values)
    }

    fn enter_roots(
        &self,
        roots: &[(StageId, Region)],
        region: &Region,
        env: Option<&Env<'_, 'a>>,
        values: &mut [Value],
    ) -> Flow<()> {
        let Some(((id, storage), rest)) = roots.split_first() else {
            let stage = self.stages.by_id(self.plan.output);
            let nctx = self.nest_ctx(stage, region)?;
            return self.walk(&nctx, 0, &mut Vec::new(), env, &mut |index, value| {
                if let Some(slot) = values.get_mut(index) {
                    *slot = value;
                }
            });
        };

        let mut buffer = self.allocate(*id, ScopeKind::Root, storage.clone())?;
        self.compute_into(*id, &mut buffer, env)?;
        let flow = {
            let node = Env {
                id: *id,
                buffer: &buffer,
                parent: env,
            };
            self.enter_roots(rest, region, Some(&node), values)
        };
        self.allocator.release(buffer);
        flow
    }

    /// Merge into `regions` the storage of every scope instance attached
    /// under `id`'s loops when `id` is computed over `region`.
    ///
    /// Roots read from inside loops are sized from these hulls. Violations
    /// are not reported here; the walk reports them when it reaches them.
    fn collect_footprints(
        &self,
        id: StageId,
        region: &Region,
        regions: &mut HashMap<StageId, Region>,
    ) -> Flow<()> {
        let stage = self.stages.by_id(id);
        let nctx = self.nest_ctx(stage, region)?;
        self.footprint_walk(&nctx, 0, &mut Vec::new(), regions)
    }

    fn footprint_walk(
        &self,
        nctx: &NestCtx<'_>,
        depth: usize,
        fixed: &mut Vec<i64>,
        regions: &mut HashMap<StageId, Region>,
    ) -> Flow<()> {
        let id = nctx.stage.id;
        let attached_below = nctx.nest.loops[depth..]
            .iter()
            .any(|l| !self.plan.producers_at(id, &l.var).is_empty());
        let Some(lp) = nctx.nest.loops.get(depth).filter(|_| attached_below) else {
            return Ok(());
        };
        let producers = self.plan.producers_at(id, &lp.var);

        for value in lp.values() {
            fixed.push(value);
            let consumer_region = nctx.nest.region_at(fixed);
            for &producer in producers {
                let required = self
                    .verifier
                    .required_region(producer, &[(id, &consumer_region)]);
                let instance = ScopeInstance {
                    producer,
                    kind: ScopeKind::PerIteration,
                    required: required.clone(),
                };
                let storage = match self.verifier.verify(&instance)? {
                    ScopeCheck::Verified { storage } => storage,
                    ScopeCheck::Violated(_) => required,
                };
                self.collect_footprints(producer, &storage, regions)?;
                regions
                    .entry(producer)
                    .and_modify(|hull| *hull = hull.hull(&storage))
                    .or_insert(storage);
            }
            let flow = self.footprint_walk(nctx, depth + 1, fixed, regions);
            fixed.pop();
            flow?;
        }
        Ok(())
    }

    fn allocate(&self, id: StageId, kind: ScopeKind, storage: Region) -> Flow<Buffer<'a>> {
        let stage = self.stages.by_id(id);
        let decision = decide(
            self.resolution(id),
            kind,
            storage,
            self.config.effective_stack_limit(),
        );
        self.allocator.allocate(stage, decision).map_err(|err| match err {
            err @ RuntimeError::AllocationFailure { .. } => self.fail(err),
            err => Halt::Fatal(err),
        })
    }

    /// Compute `id` over the whole region of `buffer`.
    fn compute_into(&self, id: StageId, buffer: &mut Buffer<'a>, env: Option<&Env<'_, 'a>>) -> Flow<()> {
        let stage = self.stages.by_id(id);
        let nctx = self.nest_ctx(stage, &buffer.region().clone())?;
        self.walk(&nctx, 0, &mut Vec::new(), env, &mut |index, value| {
            buffer.store_index(index, value);
        })
    }

    fn nest_ctx<'s>(&self, stage: &'s Stage, region: &Region) -> Flow<NestCtx<'s>> {
        let nest = self
            .plan
            .nests
            .get(&stage.id)
            .ok_or_else(|| RuntimeError::UnknownStage(stage.name.clone()))?;
        Ok(NestCtx {
            stage,
            nest: ConcreteNest::new(stage, nest, region, self.bindings)?,
            layout: Layout::dense(region.clone()),
        })
    }

    // ── Loops ───────────────────────────────────────────────────────────

    fn walk(
        &self,
        nctx: &NestCtx<'_>,
        depth: usize,
        fixed: &mut Vec<i64>,
        env: Option<&Env<'_, 'a>>,
        sink: &mut dyn FnMut(usize, Value),
    ) -> Flow<()> {
        let Some(lp) = nctx.nest.loops.get(depth) else {
            let coords = nctx.nest.coords(fixed);
            // Tiles wider than the region reach past its min.
            if !nctx.nest.region.contains(&coords) {
                return Ok(());
            }
            let value = self.eval(nctx.stage, &nctx.stage.definition, &coords, env)?;
            if let Some(index) = nctx.layout.index_of(&coords) {
                sink(index, value);
            }
            return Ok(());
        };
        let producers = self.plan.producers_at(nctx.stage.id, &lp.var);

        if lp.parallel && self.config.parallel && lp.count > 1 {
            let items: Vec<Flow<Vec<(usize, Value)>>> = lp
                .values()
                .into_par_iter()
                .map(|value| {
                    if self.abort.load(Ordering::SeqCst) {
                        return Err(Halt::Abandoned);
                    }
                    let mut fixed = fixed.clone();
                    fixed.push(value);
                    let mut writes = Vec::new();
                    self.enter_scopes(nctx, depth, producers, &mut fixed, env, &mut |i, v| {
                        writes.push((i, v))
                    })?;
                    Ok(writes)
                })
                .collect();

            let mut abandoned = false;
            for item in items {
                match item {
                    Ok(writes) => writes.into_iter().for_each(|(i, v)| sink(i, v)),
                    Err(Halt::Fatal(err)) => return Err(Halt::Fatal(err)),
                    Err(Halt::Abandoned) => abandoned = true,
                }
            }
            return if abandoned { Err(Halt::Abandoned) } else { Ok(()) };
        }

        for value in lp.values() {
            fixed.push(value);
            let flow = self.enter_scopes(nctx, depth, producers, fixed, env, sink);
            fixed.pop();
            flow?;
        }
        Ok(())
    }

    /// Enter the scopes of `producers` for the current iteration of loop
    /// `depth`, then run the loops inside it.
    fn enter_scopes(
        &self,
        nctx: &NestCtx<'_>,
        depth: usize,
        producers: &[StageId],
        fixed: &mut Vec<i64>,
        env: Option<&Env<'_, 'a>>,
        sink: &mut dyn FnMut(usize, Value),
    ) -> Flow<()> {
        let Some((&producer, rest)) = producers.split_first() else {
            return self.walk(nctx, depth + 1, fixed, env, sink);
        };

        let consumer_region = nctx.nest.region_at(fixed);
        let required = self
            .verifier
            .required_region(producer, &[(nctx.stage.id, &consumer_region)]);
        let instance = ScopeInstance {
            producer,
            kind: ScopeKind::PerIteration,
            required,
        };
        let storage = match self.verifier.verify(&instance)? {
            ScopeCheck::Verified { storage } => storage,
            ScopeCheck::Violated(v) => return Err(self.fail(RuntimeError::BoundsInsufficient(v))),
        };

        let mut buffer = self.allocate(producer, ScopeKind::PerIteration, storage)?;
        self.compute_into(producer, &mut buffer, env)?;
        let flow = {
            let node = Env {
                id: producer,
                buffer: &buffer,
                parent: env,
            };
            self.enter_scopes(nctx, depth, rest, fixed, Some(&node), sink)
        };
        self.allocator.release(buffer);
        flow
    }

    // ── Values ──────────────────────────────────────────────────────────

    fn eval(
        &self,
        stage: &Stage,
        def: &Definition,
        coords: &[i64],
        env: Option<&Env<'_, 'a>>,
    ) -> Flow<Value> {
        match def {
            Definition::Const(v) => Ok(*v),
            Definition::Param(name) => self
                .bindings
                .get(name)
                .ok_or_else(|| Halt::from(EvalError::UnboundParameter(name.clone()))),
            Definition::Var(name) => Ok(coords[self.dim_of(stage, name)?]),
            Definition::Binary(op, lhs, rhs) => {
                let lhs = self.eval(stage, lhs, coords, env)?;
                let rhs = self.eval(stage, rhs, coords, env)?;
                Ok(op.apply(lhs, rhs))
            }
            Definition::Call { stage: callee, args } => {
                let callee = self.stages.lookup(callee)?;
                let mut at = Vec::with_capacity(args.len());
                for arg in args {
                    at.push(coords[self.dim_of(stage, &arg.var)?] + arg.offset);
                }
                if self.plan.is_inlined(callee.id) {
                    return self.eval(callee, &callee.definition, &at, env);
                }
                lookup(env, callee.id)
                    .and_then(|buffer| buffer.load(&at))
                    .ok_or_else(|| {
                        Halt::Fatal(RuntimeError::UnrealizedAccess {
                            stage: callee.name.clone(),
                            coords: at,
                        })
                    })
            }
        }
    }

    fn dim_of(&self, stage: &Stage, var: &str) -> Flow<usize> {
        stage.dim_index(var).ok_or_else(|| {
            Halt::Fatal(RuntimeError::UnknownVariable {
                stage: stage.name.clone(),
                var: var.to_string(),
            })
        })
    }
}
