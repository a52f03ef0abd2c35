// pipeline.rs — Pipeline state and execution entry point
//
// A `Pipeline` owns its stage definitions, schedule descriptor, parameter
// values, hook registry, configuration and allocation statistics. Mutation
// (defining, scheduling, binding parameters, installing hooks) takes
// `&mut self`; `execute` takes `&self`, so nothing can change under an
// execution in flight.
//
// Preconditions: the output stage and its producers are defined.
// Postconditions: `execute` returns a complete `Realization`, or an
//                 incomplete one after the error handler returned.
// Failure modes: programming errors are returned as `RuntimeError`s.
// Side effects: invokes installed hooks; updates allocation statistics.

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use crate::config::RuntimeConfig;
use crate::diag::Diagnostic;
use crate::error::{Result, RuntimeError};
use crate::expr::ParamBindings;
use crate::hooks::{AllocatorHooks, ErrorHandler, HookRegistry, UserContext};
use crate::id::StageId;
use crate::realize::Realizer;
use crate::region::{Layout, Region};
use crate::schedule::ScheduleDescriptor;
use crate::stage::{Definition, Stage, Stages, Value};
use crate::storage::{AllocationCounts, AllocationStats};

// ── Realization ─────────────────────────────────────────────────────────────

/// Output of one execution.
#[derive(Debug, Clone)]
pub struct Realization {
    stage: String,
    layout: Layout,
    values: Vec<Value>,
    complete: bool,
    warnings: Vec<Diagnostic>,
}

impl Realization {
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn region(&self) -> &Region {
        &self.layout.region
    }

    /// Value at `coords`. Unspecified after an abandoned execution.
    pub fn get(&self, coords: &[i64]) -> Option<Value> {
        self.layout
            .index_of(coords)
            .and_then(|i| self.values.get(i).copied())
    }

    /// All values in dense order, first dimension fastest.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// False if a handler-routed failure abandoned the execution.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────────

pub struct Pipeline {
    name: String,
    stages: Stages,
    output: Option<StageId>,
    schedule: ScheduleDescriptor,
    params: ParamBindings,
    hooks: HookRegistry,
    config: RuntimeConfig,
    stats: AllocationStats,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Pipeline {
            name: name.into(),
            stages: Stages::new(),
            output: None,
            schedule: ScheduleDescriptor::new(),
            params: ParamBindings::new(),
            hooks: HookRegistry::new(),
            config: RuntimeConfig::default(),
            stats: AllocationStats::default(),
            user_data: None,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RuntimeConfig) {
        self.config = config;
    }

    // ── Stages ──────────────────────────────────────────────────────────

    /// Define a stage over `dims` (innermost first).
    pub fn define(
        &mut self,
        name: impl Into<String>,
        dims: &[&str],
        definition: Definition,
    ) -> Result<StageId> {
        self.stages.define(name, dims, definition)
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.get(name)
    }

    pub fn stages(&self) -> &Stages {
        &self.stages
    }

    /// Choose the stage `execute` realizes. Defaults to the last defined.
    pub fn set_output(&mut self, name: &str) -> Result<()> {
        self.output = Some(self.stages.lookup(name)?.id);
        Ok(())
    }

    pub fn output(&self) -> Option<&Stage> {
        match self.output {
            Some(id) => Some(self.stages.by_id(id)),
            None => self.stages.last(),
        }
    }

    // ── Schedule ────────────────────────────────────────────────────────

    pub fn schedule(&self) -> &ScheduleDescriptor {
        &self.schedule
    }

    pub fn schedule_mut(&mut self) -> &mut ScheduleDescriptor {
        &mut self.schedule
    }

    /// SHA-256 of the schedule's canonical JSON.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.schedule.fingerprint()
    }

    // ── Parameters ──────────────────────────────────────────────────────

    pub fn set_parameter_value(&mut self, name: impl Into<String>, value: i64) {
        self.params.set(name, value);
    }

    pub fn parameters(&self) -> &ParamBindings {
        &self.params
    }

    // ── Hooks ───────────────────────────────────────────────────────────

    pub fn install_allocator<A, F>(&mut self, alloc: A, free: F)
    where
        A: Fn(&UserContext, usize) -> Option<Vec<u8>> + Send + Sync + 'static,
        F: Fn(&UserContext, Vec<u8>) + Send + Sync + 'static,
    {
        self.hooks.install_allocator(alloc, free);
    }

    pub fn install_allocator_hooks(&mut self, hooks: Arc<dyn AllocatorHooks>) {
        self.hooks.install_allocator_hooks(hooks);
    }

    pub fn reset_allocator(&mut self) {
        self.hooks.reset_allocator();
    }

    pub fn install_error_handler(&mut self, handler: impl ErrorHandler + 'static) {
        self.hooks.install_error_handler(handler);
    }

    pub fn reset_error_handler(&mut self) {
        self.hooks.reset_error_handler();
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Opaque data handed to every hook through `UserContext`.
    pub fn set_user_data(&mut self, data: Arc<dyn Any + Send + Sync>) {
        self.user_data = Some(data);
    }

    fn user_context(&self) -> UserContext {
        let ctx = UserContext::new(self.name.clone());
        match &self.user_data {
            Some(data) => ctx.with_user_data(Arc::clone(data)),
            None => ctx,
        }
    }

    // ── Statistics ──────────────────────────────────────────────────────

    pub fn allocation_stats(&self) -> AllocationCounts {
        self.stats.snapshot()
    }

    pub fn reset_allocation_stats(&self) {
        self.stats.reset();
    }

    // ── Execution ───────────────────────────────────────────────────────

    /// Realize the output stage over `[0, extent)` in each dimension.
    ///
    /// Every compute-scope instance is verified, allocated, computed and
    /// released in turn. If the error handler returns from a bounds or
    /// allocation failure the remaining work is abandoned and the returned
    /// realization is marked incomplete.
    pub fn execute(&self, extents: &[i64]) -> Result<Realization> {
        let output = self.output().ok_or(RuntimeError::NoOutput)?;
        if extents.len() != output.dims.len() {
            return Err(RuntimeError::OutputRank {
                stage: output.name.clone(),
                expected: output.dims.len(),
                given: extents.len(),
            });
        }
        if let Some((dim, &extent)) = output.dims.iter().zip(extents).find(|(_, e)| **e < 0) {
            return Err(RuntimeError::NegativeExtent {
                stage: output.name.clone(),
                dim: dim.clone(),
                extent,
            });
        }

        let plan = self.schedule.plan(&self.stages, output.id)?;
        let region = Region::from_extents(extents);
        let ctx = self.user_context();
        debug!(
            pipeline = %self.name,
            output = %output.name,
            %region,
            stages = plan.realized.len(),
            "executing pipeline"
        );

        let outcome = Realizer::new(
            &self.stages,
            &self.schedule,
            &plan,
            &self.params,
            &self.hooks,
            &ctx,
            &self.stats,
            &self.config,
        )
        .run(&region)?;

        Ok(Realization {
            stage: output.name.clone(),
            layout: Layout::dense(region),
            values: outcome.values,
            complete: outcome.complete,
            warnings: outcome.warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Access;

    fn f_and_g() -> Pipeline {
        let mut p = Pipeline::new("test");
        p.define("f", &["x"], Definition::var("x") * 3).unwrap();
        p.define("g", &["x"], Definition::call("f", [Access::at("x")]) + 1)
            .unwrap();
        p
    }

    #[test]
    fn output_defaults_to_last_stage() {
        let p = f_and_g();
        assert_eq!(p.output().map(|s| s.name.as_str()), Some("g"));
    }

    #[test]
    fn inlined_pipeline_computes_values() {
        let p = f_and_g();
        let out = p.execute(&[4]).unwrap();
        assert!(out.is_complete());
        assert_eq!(out.values(), &[1, 4, 7, 10]);
        assert_eq!(out.get(&[3]), Some(10));
        assert_eq!(out.get(&[4]), None);
    }

    #[test]
    fn explicit_output_stage() {
        let mut p = f_and_g();
        p.set_output("f").unwrap();
        assert_eq!(p.execute(&[3]).unwrap().values(), &[0, 3, 6]);
        assert!(p.set_output("nope").is_err());
    }

    #[test]
    fn wrong_output_rank() {
        let p = f_and_g();
        let err = p.execute(&[4, 4]).unwrap_err();
        assert!(matches!(err, RuntimeError::OutputRank { expected: 1, given: 2, .. }));
    }

    #[test]
    fn negative_output_extent() {
        let p = f_and_g();
        let err = p.execute(&[-1]).unwrap_err();
        assert!(matches!(err, RuntimeError::NegativeExtent { extent: -1, .. }));
    }

    #[test]
    fn empty_pipeline_has_no_output() {
        let p = Pipeline::new("empty");
        assert_eq!(p.execute(&[1]).unwrap_err(), RuntimeError::NoOutput);
    }

    #[test]
    fn unbound_parameter_is_returned() {
        let mut p = f_and_g();
        p.schedule_mut()
            .set_split("g", "x", "xo", "xi", crate::expr::Expr::param("p"));
        let err = p.execute(&[4]).unwrap_err();
        assert_eq!(err.to_string(), "parameter 'p' has no assigned value");
    }

    #[test]
    fn user_data_reaches_hooks() {
        let mut p = f_and_g();
        p.set_user_data(Arc::new(String::from("tag")));
        let ctx = p.user_context();
        assert_eq!(ctx.pipeline, "test");
        assert_eq!(ctx.user_data::<String>().map(String::as_str), Some("tag"));
    }
}
