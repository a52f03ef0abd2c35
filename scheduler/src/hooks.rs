// hooks.rs — Replaceable allocation and error-handling hooks
//
// A pipeline owns one `HookRegistry`. Dynamic storage is obtained through the
// registered allocator hooks and handler-routed failures are delivered to the
// registered error handler. Installing or resetting takes `&mut self`, so it
// can never race an execution in flight.
//
// Preconditions: hooks are reentrant; they may run on several workers.
// Postconditions: `reset_*` restores the heap allocator and the terminating
//                 handler.
// Failure modes: the default handler does not return.
// Side effects: the default handler writes to stderr and aborts the process.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tracing::error;

use crate::diag::Diagnostic;

// ── User context ────────────────────────────────────────────────────────────

/// Context passed to every hook invocation.
#[derive(Clone, Default)]
pub struct UserContext {
    /// Name of the pipeline being executed.
    pub pipeline: String,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl UserContext {
    pub fn new(pipeline: impl Into<String>) -> Self {
        UserContext {
            pipeline: pipeline.into(),
            user_data: None,
        }
    }

    pub fn with_user_data(mut self, data: Arc<dyn Any + Send + Sync>) -> Self {
        self.user_data = Some(data);
        self
    }

    /// Opaque caller data, if it was set and has type `T`.
    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_deref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for UserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserContext")
            .field("pipeline", &self.pipeline)
            .field("user_data", &self.user_data.is_some())
            .finish()
    }
}

// ── Hook traits ─────────────────────────────────────────────────────────────

/// Source of dynamic storage.
pub trait AllocatorHooks: Send + Sync {
    /// Return `size` bytes of storage, or `None` on failure.
    fn allocate(&self, ctx: &UserContext, size: usize) -> Option<Vec<u8>>;

    /// Take back storage previously returned by `allocate`.
    fn free(&self, ctx: &UserContext, storage: Vec<u8>);
}

/// Receiver of handler-routed failures. Returning normally marks the failure
/// as non-fatal.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, ctx: &UserContext, diag: &Diagnostic);
}

impl<F> ErrorHandler for F
where
    F: Fn(&UserContext, &Diagnostic) + Send + Sync,
{
    fn handle(&self, ctx: &UserContext, diag: &Diagnostic) {
        self(ctx, diag)
    }
}

/// Allocator hooks built from a pair of closures.
struct FnAllocator<A, F> {
    alloc: A,
    free: F,
}

impl<A, F> AllocatorHooks for FnAllocator<A, F>
where
    A: Fn(&UserContext, usize) -> Option<Vec<u8>> + Send + Sync,
    F: Fn(&UserContext, Vec<u8>) + Send + Sync,
{
    fn allocate(&self, ctx: &UserContext, size: usize) -> Option<Vec<u8>> {
        (self.alloc)(ctx, size)
    }

    fn free(&self, ctx: &UserContext, storage: Vec<u8>) {
        (self.free)(ctx, storage)
    }
}

// ── Defaults ────────────────────────────────────────────────────────────────

/// Default allocator: the global heap. Reports failure instead of aborting.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl AllocatorHooks for HeapAllocator {
    fn allocate(&self, _ctx: &UserContext, size: usize) -> Option<Vec<u8>> {
        let mut storage = Vec::new();
        storage.try_reserve_exact(size).ok()?;
        storage.resize(size, 0);
        Some(storage)
    }

    fn free(&self, _ctx: &UserContext, storage: Vec<u8>) {
        drop(storage);
    }
}

/// Default error handler: print the diagnostic and abort.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortHandler;

impl ErrorHandler for AbortHandler {
    fn handle(&self, ctx: &UserContext, diag: &Diagnostic) {
        error!(pipeline = %ctx.pipeline, code = ?diag.code, "{}", diag.message);
        eprintln!("{diag}");
        std::process::abort();
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Hooks in effect for one pipeline.
#[derive(Clone)]
pub struct HookRegistry {
    allocator: Arc<dyn AllocatorHooks>,
    error_handler: Arc<dyn ErrorHandler>,
    custom_allocator: bool,
    custom_error_handler: bool,
}

impl Default for HookRegistry {
    fn default() -> Self {
        HookRegistry {
            allocator: Arc::new(HeapAllocator),
            error_handler: Arc::new(AbortHandler),
            custom_allocator: false,
            custom_error_handler: false,
        }
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route dynamic allocation through `alloc` and `free`.
    pub fn install_allocator<A, F>(&mut self, alloc: A, free: F)
    where
        A: Fn(&UserContext, usize) -> Option<Vec<u8>> + Send + Sync + 'static,
        F: Fn(&UserContext, Vec<u8>) + Send + Sync + 'static,
    {
        self.install_allocator_hooks(Arc::new(FnAllocator { alloc, free }));
    }

    pub fn install_allocator_hooks(&mut self, hooks: Arc<dyn AllocatorHooks>) {
        self.allocator = hooks;
        self.custom_allocator = true;
    }

    pub fn reset_allocator(&mut self) {
        self.allocator = Arc::new(HeapAllocator);
        self.custom_allocator = false;
    }

    pub fn install_error_handler(&mut self, handler: impl ErrorHandler + 'static) {
        self.error_handler = Arc::new(handler);
        self.custom_error_handler = true;
    }

    pub fn reset_error_handler(&mut self) {
        self.error_handler = Arc::new(AbortHandler);
        self.custom_error_handler = false;
    }

    pub fn allocator(&self) -> &dyn AllocatorHooks {
        self.allocator.as_ref()
    }

    pub fn has_custom_allocator(&self) -> bool {
        self.custom_allocator
    }

    pub fn has_custom_error_handler(&self) -> bool {
        self.custom_error_handler
    }

    /// Deliver `diag` to the installed handler. Returns only if the handler
    /// does.
    pub fn report(&self, ctx: &UserContext, diag: &Diagnostic) {
        self.error_handler.handle(ctx, diag);
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("custom_allocator", &self.custom_allocator)
            .field("custom_error_handler", &self.custom_error_handler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn heap_allocator_returns_requested_size() {
        let storage = HeapAllocator.allocate(&UserContext::default(), 40).unwrap();
        assert_eq!(storage.len(), 40);
        HeapAllocator.free(&UserContext::default(), storage);
    }

    #[test]
    fn installed_allocator_is_used_and_reset_restores_heap() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut hooks = HookRegistry::new();
        hooks.install_allocator(
            move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                None
            },
            |_, _| {},
        );
        assert!(hooks.has_custom_allocator());
        assert!(hooks.allocator().allocate(&UserContext::default(), 8).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        hooks.reset_allocator();
        assert!(!hooks.has_custom_allocator());
        assert_eq!(
            hooks.allocator().allocate(&UserContext::default(), 8).map(|s| s.len()),
            Some(8)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closure_handler_receives_diagnostic_and_context() {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&messages);
        let mut hooks = HookRegistry::new();
        hooks.install_error_handler(move |ctx: &UserContext, diag: &Diagnostic| {
            sink.lock()
                .unwrap()
                .push(format!("{}: {}", ctx.pipeline, diag.message));
        });
        hooks.report(&UserContext::new("demo"), &Diagnostic::error("boom"));
        assert_eq!(*messages.lock().unwrap(), vec!["demo: boom".to_string()]);
    }

    #[test]
    fn user_data_downcasts_to_its_own_type() {
        let ctx = UserContext::new("demo").with_user_data(Arc::new(7u32));
        assert_eq!(ctx.user_data::<u32>(), Some(&7));
        assert_eq!(ctx.user_data::<i64>(), None);
        assert_eq!(UserContext::default().user_data::<u32>(), None);
    }
}
