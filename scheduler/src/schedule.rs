// schedule.rs — Schedule descriptor and schedule planning
//
// The descriptor records, per stage, where the stage is computed, which
// explicit bounds it declares, how its loops are split, and which loops are
// vectorized or parallel. Recording never evaluates anything; `plan` checks
// the descriptor against the stage graph and derives the loop nests and
// compute-scope attachments the realizer walks.
//
// Preconditions: stage names refer to stages defined in the pipeline.
// Postconditions: `plan` returns a `SchedulePlan` whose realized stages are
//                 in producer-first order and whose attachments name valid
//                 loop variables of their consumers.
// Failure modes: unknown stages or variables and inconsistent compute scopes
//                produce `RuntimeError`s.
// Side effects: none.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::expr::Expr;
use crate::id::StageId;
use crate::stage::{Stage, Stages};

// ── Descriptor types ────────────────────────────────────────────────────────

/// Where a stage is computed relative to its consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputeLevel {
    /// Evaluated at every use; no storage.
    #[default]
    Inline,
    /// Computed once per execution, outside every loop.
    Root,
    /// Recomputed once per iteration of `consumer`'s loop `var`.
    At { consumer: String, var: String },
}

/// Declared `(min, extent)` for one dimension. A missing `min` constrains
/// only the extent; the declared min then follows the required min.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplicitBound {
    pub dim: String,
    pub min: Option<Expr>,
    pub extent: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub var: String,
    pub outer: String,
    pub inner: String,
    pub factor: Expr,
}

/// Everything the descriptor records for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSchedule {
    pub compute: ComputeLevel,
    pub bounds: Vec<ExplicitBound>,
    pub splits: Vec<Split>,
    pub vectorized: Vec<String>,
    pub parallel: Vec<String>,
}

impl StageSchedule {
    const fn unscheduled() -> Self {
        StageSchedule {
            compute: ComputeLevel::Inline,
            bounds: Vec::new(),
            splits: Vec::new(),
            vectorized: Vec::new(),
            parallel: Vec::new(),
        }
    }

    pub fn bound_for(&self, dim: &str) -> Option<&ExplicitBound> {
        self.bounds.iter().find(|b| b.dim == dim)
    }
}

static UNSCHEDULED: StageSchedule = StageSchedule::unscheduled();

/// Schedule for every stage of a pipeline, keyed by stage name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDescriptor {
    stages: BTreeMap<String, StageSchedule>,
}

impl ScheduleDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, stage: &str) -> &mut StageSchedule {
        self.stages.entry(stage.to_string()).or_default()
    }

    /// Schedule recorded for `stage` (the unscheduled default if none).
    pub fn get(&self, stage: &str) -> &StageSchedule {
        self.stages.get(stage).unwrap_or(&UNSCHEDULED)
    }

    /// Recompute `stage` once per iteration of `consumer`'s loop `var`.
    pub fn set_compute_scope(&mut self, stage: &str, consumer: &str, var: &str) -> &mut Self {
        self.entry(stage).compute = ComputeLevel::At {
            consumer: consumer.to_string(),
            var: var.to_string(),
        };
        self
    }

    pub fn set_compute_root(&mut self, stage: &str) -> &mut Self {
        self.entry(stage).compute = ComputeLevel::Root;
        self
    }

    pub fn set_compute_inline(&mut self, stage: &str) -> &mut Self {
        self.entry(stage).compute = ComputeLevel::Inline;
        self
    }

    /// Declare `[min, min + extent)` for `dim`, replacing any earlier bound.
    pub fn set_explicit_bound(
        &mut self,
        stage: &str,
        dim: &str,
        min: impl Into<Expr>,
        extent: impl Into<Expr>,
    ) -> &mut Self {
        self.put_bound(stage, dim, Some(min.into()), extent.into())
    }

    /// Declare only the extent of `dim`.
    pub fn set_explicit_bound_extent(
        &mut self,
        stage: &str,
        dim: &str,
        extent: impl Into<Expr>,
    ) -> &mut Self {
        self.put_bound(stage, dim, None, extent.into())
    }

    fn put_bound(&mut self, stage: &str, dim: &str, min: Option<Expr>, extent: Expr) -> &mut Self {
        let bounds = &mut self.entry(stage).bounds;
        let bound = ExplicitBound {
            dim: dim.to_string(),
            min,
            extent,
        };
        match bounds.iter_mut().find(|b| b.dim == dim) {
            Some(existing) => *existing = bound,
            None => bounds.push(bound),
        }
        self
    }

    pub fn set_split(
        &mut self,
        stage: &str,
        var: &str,
        outer: &str,
        inner: &str,
        factor: impl Into<Expr>,
    ) -> &mut Self {
        self.entry(stage).splits.push(Split {
            var: var.to_string(),
            outer: outer.to_string(),
            inner: inner.to_string(),
            factor: factor.into(),
        });
        self
    }

    pub fn set_vectorize(&mut self, stage: &str, var: &str) -> &mut Self {
        push_unique(&mut self.entry(stage).vectorized, var);
        self
    }

    pub fn set_parallel(&mut self, stage: &str, var: &str) -> &mut Self {
        push_unique(&mut self.entry(stage).parallel, var);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StageSchedule)> {
        self.stages.iter().map(|(k, v)| (k.as_str(), v))
    }

    // ── Provenance ──────────────────────────────────────────────────────

    /// Compact JSON with stages in name order.
    pub fn canonical_json(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// SHA-256 of `canonical_json()`, usable as a cache key for anything
    /// derived from the schedule.
    pub fn fingerprint(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    }

    /// Hex string of the fingerprint (64 characters).
    pub fn fingerprint_hex(&self) -> String {
        use std::fmt::Write;

        let mut s = String::with_capacity(64);
        for b in self.fingerprint() {
            let _ = write!(s, "{:02x}", b);
        }
        s
    }

    // ── Loop nests ──────────────────────────────────────────────────────

    /// Derive the symbolic loop nest of `stage`, outermost loop first.
    ///
    /// The last dimension is outermost. A split replaces its variable in place
    /// by `[outer, inner]`; each dimension may be split once.
    pub fn loop_nest(&self, stage: &Stage) -> Result<LoopNest> {
        let sched = self.get(&stage.name);
        let mut loops: Vec<Loop> = stage
            .dims
            .iter()
            .enumerate()
            .rev()
            .map(|(dim, var)| Loop {
                var: var.clone(),
                dim,
                role: LoopRole::Whole,
                parallel: false,
                vectorized: false,
            })
            .collect();

        for (i, split) in sched.splits.iter().enumerate() {
            if sched.splits[..i].iter().any(|s| s.var == split.var) {
                return Err(invalid(stage, format!("'{}' is split more than once", split.var)));
            }
            let pos = loops
                .iter()
                .position(|l| l.var == split.var)
                .ok_or_else(|| unknown_var(stage, &split.var))?;
            if !matches!(loops[pos].role, LoopRole::Whole) {
                return Err(invalid(
                    stage,
                    format!("'{}' is already the product of a split", split.var),
                ));
            }
            let taken = |name: &str| {
                loops
                    .iter()
                    .enumerate()
                    .any(|(p, l)| p != pos && l.var == name)
            };
            if split.outer == split.inner || taken(&split.outer) || taken(&split.inner) {
                return Err(invalid(
                    stage,
                    format!(
                        "split of '{}' into '{}' and '{}' reuses a loop variable name",
                        split.var, split.outer, split.inner
                    ),
                ));
            }
            let dim = loops[pos].dim;
            let outer = Loop {
                var: split.outer.clone(),
                dim,
                role: LoopRole::Outer {
                    factor: split.factor.clone(),
                },
                parallel: false,
                vectorized: false,
            };
            let inner = Loop {
                var: split.inner.clone(),
                dim,
                role: LoopRole::Inner {
                    factor: split.factor.clone(),
                },
                parallel: false,
                vectorized: false,
            };
            loops.splice(pos..=pos, [outer, inner]);
        }

        for var in &sched.parallel {
            let lp = loops
                .iter_mut()
                .find(|l| &l.var == var)
                .ok_or_else(|| unknown_var(stage, var))?;
            lp.parallel = true;
        }
        for var in &sched.vectorized {
            let lp = loops
                .iter_mut()
                .find(|l| &l.var == var)
                .ok_or_else(|| unknown_var(stage, var))?;
            lp.vectorized = true;
        }

        Ok(LoopNest { loops })
    }

    // ── Planning ────────────────────────────────────────────────────────

    /// Check the descriptor against `stages` and derive the plan for
    /// realizing `output`.
    pub fn plan(&self, stages: &Stages, output: StageId) -> Result<SchedulePlan> {
        let mut ctx = PlanCtx::new(self, stages, output);
        ctx.check_names()?;
        ctx.collect_reachable();
        ctx.check_levels()?;
        ctx.collect_consumers();
        ctx.attach()?;
        Ok(ctx.build())
    }
}

fn push_unique(list: &mut Vec<String>, var: &str) {
    if !list.iter().any(|v| v == var) {
        list.push(var.to_string());
    }
}

fn invalid(stage: &Stage, reason: String) -> RuntimeError {
    RuntimeError::InvalidSchedule {
        stage: stage.name.clone(),
        reason,
    }
}

fn unknown_var(stage: &Stage, var: &str) -> RuntimeError {
    RuntimeError::UnknownVariable {
        stage: stage.name.clone(),
        var: var.to_string(),
    }
}

// ── Loop nests ──────────────────────────────────────────────────────────────

/// How a loop walks its dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopRole {
    Whole,
    Outer { factor: Expr },
    Inner { factor: Expr },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    pub var: String,
    /// Index into the stage's dimensions.
    pub dim: usize,
    pub role: LoopRole,
    pub parallel: bool,
    pub vectorized: bool,
}

/// Symbolic loop nest of a stage, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopNest {
    pub loops: Vec<Loop>,
}

impl LoopNest {
    pub fn position(&self, var: &str) -> Option<usize> {
        self.loops.iter().position(|l| l.var == var)
    }
}

// ── Plan ────────────────────────────────────────────────────────────────────

/// Placement of a realized stage's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// The requested output; storage is owned by the caller.
    Output,
    /// Computed once per execution.
    Root,
    /// Recomputed per iteration of a consumer loop.
    PerIteration,
}

/// Validated schedule, ready for realization.
#[derive(Debug, Clone)]
pub struct SchedulePlan {
    pub output: StageId,
    /// Stages with storage, producers first.
    pub realized: Vec<StageId>,
    pub scope_kinds: HashMap<StageId, ScopeKind>,
    pub nests: HashMap<StageId, LoopNest>,
    /// Producers entered at each `(consumer, loop variable)`, producers first.
    pub attached: HashMap<(StageId, String), Vec<StageId>>,
    /// Stages with storage that read each realized stage, after inlining.
    pub consumers: HashMap<StageId, Vec<StageId>>,
    pub inlined: HashSet<StageId>,
}

impl SchedulePlan {
    pub fn roots(&self) -> impl Iterator<Item = StageId> + '_ {
        self.realized
            .iter()
            .copied()
            .filter(|id| self.scope_kinds.get(id) == Some(&ScopeKind::Root))
    }

    pub fn producers_at(&self, consumer: StageId, var: &str) -> &[StageId] {
        self.attached
            .get(&(consumer, var.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_inlined(&self, id: StageId) -> bool {
        self.inlined.contains(&id)
    }
}

struct PlanCtx<'a> {
    descriptor: &'a ScheduleDescriptor,
    stages: &'a Stages,
    output: StageId,
    reachable: Vec<StageId>,
    inlined: HashSet<StageId>,
    nests: HashMap<StageId, LoopNest>,
    consumers: HashMap<StageId, Vec<StageId>>,
    scope_kinds: HashMap<StageId, ScopeKind>,
    attached: HashMap<(StageId, String), Vec<StageId>>,
}

impl<'a> PlanCtx<'a> {
    fn new(descriptor: &'a ScheduleDescriptor, stages: &'a Stages, output: StageId) -> Self {
        PlanCtx {
            descriptor,
            stages,
            output,
            reachable: Vec::new(),
            inlined: HashSet::new(),
            nests: HashMap::new(),
            consumers: HashMap::new(),
            scope_kinds: HashMap::new(),
            attached: HashMap::new(),
        }
    }

    fn check_names(&self) -> Result<()> {
        for (name, sched) in self.descriptor.iter() {
            let stage = self.stages.lookup(name)?;
            if let ComputeLevel::At { consumer, .. } = &sched.compute {
                self.stages.lookup(consumer)?;
            }
            for bound in &sched.bounds {
                if stage.dim_index(&bound.dim).is_none() {
                    return Err(unknown_var(stage, &bound.dim));
                }
            }
        }
        Ok(())
    }

    /// Stages the output depends on, in ID (producer-first) order.
    fn collect_reachable(&mut self) {
        let mut seen = HashSet::new();
        let mut stack = vec![self.output];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            self.stages.by_id(id).definition.for_each_call(&mut |callee, _| {
                if let Some(p) = self.stages.get(callee) {
                    stack.push(p.id);
                }
            });
        }
        let mut reachable: Vec<StageId> = seen.into_iter().collect();
        reachable.sort();
        self.reachable = reachable;
    }

    fn check_levels(&mut self) -> Result<()> {
        for &id in &self.reachable {
            let stage = self.stages.by_id(id);
            let sched = self.descriptor.get(&stage.name);
            if id == self.output {
                if matches!(sched.compute, ComputeLevel::At { .. }) {
                    return Err(invalid(
                        stage,
                        "the output stage cannot be computed at another stage".to_string(),
                    ));
                }
                self.scope_kinds.insert(id, ScopeKind::Output);
            } else {
                match sched.compute {
                    ComputeLevel::Inline => {
                        if !sched.bounds.is_empty() {
                            return Err(invalid(
                                stage,
                                "an inlined stage cannot declare explicit bounds".to_string(),
                            ));
                        }
                        if !sched.splits.is_empty()
                            || !sched.vectorized.is_empty()
                            || !sched.parallel.is_empty()
                        {
                            return Err(invalid(
                                stage,
                                "an inlined stage has no loops to split, vectorize or parallelize"
                                    .to_string(),
                            ));
                        }
                        self.inlined.insert(id);
                        continue;
                    }
                    ComputeLevel::Root => {
                        self.scope_kinds.insert(id, ScopeKind::Root);
                    }
                    ComputeLevel::At { .. } => {
                        self.scope_kinds.insert(id, ScopeKind::PerIteration);
                    }
                }
            }
            let nest = self.descriptor.loop_nest(stage)?;
            self.nests.insert(id, nest);
        }
        Ok(())
    }

    /// Record, for every realized stage, which realized stages read it once
    /// inlined stages are expanded into their callers.
    fn collect_consumers(&mut self) {
        for &id in &self.reachable {
            if self.inlined.contains(&id) {
                continue;
            }
            let mut producers = Vec::new();
            self.expand_calls(id, &mut producers);
            for p in producers {
                let list = self.consumers.entry(p).or_default();
                if !list.contains(&id) {
                    list.push(id);
                }
            }
        }
    }

    fn expand_calls(&self, id: StageId, out: &mut Vec<StageId>) {
        let mut callees = Vec::new();
        self.stages.by_id(id).definition.for_each_call(&mut |callee, _| {
            if let Some(p) = self.stages.get(callee) {
                callees.push(p.id);
            }
        });
        for p in callees {
            if self.inlined.contains(&p) {
                self.expand_calls(p, out);
            } else if !out.contains(&p) {
                out.push(p);
            }
        }
    }

    fn attach(&mut self) -> Result<()> {
        for &id in &self.reachable {
            if self.inlined.contains(&id) || id == self.output {
                continue;
            }
            let stage = self.stages.by_id(id);
            let consumers = self.consumers.get(&id).cloned().unwrap_or_default();
            match &self.descriptor.get(&stage.name).compute {
                ComputeLevel::At { consumer, var } => {
                    let target = self.stages.lookup(consumer)?;
                    let Some(nest) = self.nests.get(&target.id) else {
                        return Err(invalid(
                            stage,
                            format!("computed at '{}', which is inlined", target.name),
                        ));
                    };
                    if nest.position(var).is_none() {
                        return Err(unknown_var(target, var));
                    }
                    if !consumers.contains(&target.id) {
                        return Err(invalid(
                            stage,
                            format!("computed at '{}', which does not read it", target.name),
                        ));
                    }
                    if let Some(other) = consumers.iter().find(|&&c| c != target.id) {
                        return Err(invalid(
                            stage,
                            format!(
                                "computed at '{}' but also read by '{}'",
                                target.name,
                                self.stages.by_id(*other).name
                            ),
                        ));
                    }
                    self.attached
                        .entry((target.id, var.clone()))
                        .or_default()
                        .push(id);
                }
                ComputeLevel::Root | ComputeLevel::Inline => {}
            }
        }
        Ok(())
    }

    fn build(self) -> SchedulePlan {
        let realized = self
            .reachable
            .iter()
            .copied()
            .filter(|id| !self.inlined.contains(id))
            .collect();
        SchedulePlan {
            output: self.output,
            realized,
            scope_kinds: self.scope_kinds,
            nests: self.nests,
            attached: self.attached,
            consumers: self.consumers,
            inlined: self.inlined,
        }
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for ComputeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeLevel::Inline => write!(f, "inline"),
            ComputeLevel::Root => write!(f, "root"),
            ComputeLevel::At { consumer, var } => write!(f, "at {consumer}.{var}"),
        }
    }
}

impl fmt::Display for ScheduleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ScheduleDescriptor ({} stages)", self.stages.len())?;
        for (name, sched) in &self.stages {
            writeln!(f, "  stage '{}': compute {}", name, sched.compute)?;
            for split in &sched.splits {
                writeln!(
                    f,
                    "    split {} -> {}, {} by {}",
                    split.var, split.outer, split.inner, split.factor
                )?;
            }
            for bound in &sched.bounds {
                match &bound.min {
                    Some(min) => writeln!(
                        f,
                        "    bound {}: min {}, extent {}",
                        bound.dim, min, bound.extent
                    )?,
                    None => writeln!(f, "    bound {}: extent {}", bound.dim, bound.extent)?,
                }
            }
            for var in &sched.vectorized {
                writeln!(f, "    vectorize {var}")?;
            }
            for var in &sched.parallel {
                writeln!(f, "    parallel {var}")?;
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
