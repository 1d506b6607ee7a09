//! Fiber execution contexts.

pub use self::control::CONTROL_STATE_CAPACITY;

use {
    self::control::{ControlState, RunFn, fiber_main},
    crate::{
        AllocationError,
        ProtectedStack,
        StackBlock,
        StackProvider,
        StopToken,
        TaskResult,
        TaskReturn,
        switch,
    },
    std::{fmt, mem},
    tracing::{debug, trace},
};

mod control;

/// Where a fiber is in its life cycle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Phase
{
    /// Not entered since construction or since the last clear.
    Unstarted,

    /// Yielded; entering resumes it.
    Suspended,

    /// Executing on its stack.
    Running,

    /// The task function returned normally.
    Completed,

    /// The task function failed.
    Failed,
}

/// Execution context of a single fiber.
///
/// The context owns the stack the fiber runs on, the saved execution state
/// of the fiber while it is suspended, and the task function it runs.
///
/// # Life cycle
///
/// A new context has no stack. [`init`] obtains one from the provider.
/// The first [`enter`] starts the task function on that stack;
/// subsequent calls resume it where it last [yielded].
/// Once the task function returns or fails, the context is terminal
/// until [`clear`], which gives the stack back to the provider.
/// Dropping the context clears it.
///
/// # Misuse
///
/// Calling [`init`] on a context that holds a stack, or calling [`enter`]
/// on a context that was not initialized or is terminal, panics.
/// These are bugs in the scheduler, not conditions to recover from.
///
/// # Thread migration
///
/// A suspended context may be moved to and resumed on another thread.
/// The task then continues on that thread with no indication of the move.
/// Task code must therefore not hold anything thread-bound across a yield:
/// no [`Rc`], no references into thread-local storage,
/// and no [`MutexGuard`] or other guard that must be released
/// by the thread that acquired it.
/// The compiler cannot check this, as the task only has to be [`Send`]
/// when it is handed to [`enter`], not at every yield point.
///
/// [`Rc`]: `std::rc::Rc`
/// [`MutexGuard`]: `std::sync::MutexGuard`
/// [`init`]: `Self::init`
/// [`enter`]: `Self::enter`
/// [`clear`]: `Self::clear`
/// [yielded]: `yield_with`
pub struct FiberCtx<P = ProtectedStack>
    where P: StackProvider
{
    provider: P,
    stack: Option<StackBlock>,
    phase: Phase,
    control: ControlState,
}

// SAFETY: The task function is Send, and so is everything the context owns
// except the saved stack pointers, which point into the fiber's own stack.
// Task code must not keep thread-bound values alive across a yield,
// as the context may be resumed on another thread.
unsafe impl<P> Send for FiberCtx<P>
    where P: StackProvider + Send
{
}

impl FiberCtx
{
    /// Create a context that maps a fresh protected stack for each fiber.
    pub fn new() -> Self
    {
        Self::with_provider(ProtectedStack::default())
    }
}

impl Default for FiberCtx
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl<P> FiberCtx<P>
    where P: StackProvider
{
    /// Create a context that obtains its stack from `provider`.
    pub fn with_provider(provider: P) -> Self
    {
        Self{
            provider,
            stack: None,
            phase: Phase::Unstarted,
            control: ControlState::new(),
        }
    }

    /// Where the fiber is in its life cycle.
    pub fn phase(&self) -> Phase
    {
        self.phase
    }

    /// The stack held by the context, if any.
    pub fn stack(&self) -> Option<StackBlock>
    {
        self.stack
    }

    /// Whether the context holds a stack.
    pub fn has_stack(&self) -> bool
    {
        self.stack.is_some()
    }

    /// The stack provider.
    pub fn provider(&self) -> &P
    {
        &self.provider
    }

    /// Obtain a stack from the provider.
    ///
    /// # Panics
    ///
    /// Panics if the context already holds a stack.
    #[track_caller]
    pub fn init(&mut self) -> Result<(), AllocationError>
    {
        if self.stack.is_some() {
            panic!("Fiber initialized while holding a stack");
        }

        let stack = self.provider.allocate()?;
        debug!(bottom = ?stack.bottom(), len = stack.len(), "Acquired stack");
        self.stack = Some(stack);

        Ok(())
    }

    /// Run the fiber until it yields, returns, or fails.
    ///
    /// On first entry, `run_fn` is called with `token` on the fiber's stack.
    /// On later entries, the fiber resumes where it yielded
    /// and both arguments are dropped unused.
    ///
    /// Returns the result the fiber yielded with, [`TaskResult::Done`]
    /// if the task function returned, or [`TaskResult::Failed`]
    /// if it returned an error or panicked.
    ///
    /// # Panics
    ///
    /// Panics if the context was not initialized,
    /// or if the fiber is running, completed, or failed.
    #[track_caller]
    pub fn enter<F, R>(&mut self, token: StopToken, run_fn: F) -> TaskResult
        where F: FnOnce(StopToken) -> R + Send + 'static,
              R: TaskReturn,
    {
        match self.phase {
            Phase::Unstarted => {
                let Some(stack) = self.stack
                    else { panic!("Fiber entered before init") };

                let run_fn: RunFn =
                    Box::new(move |token| run_fn(token).into_outcome());
                self.control.run_fn = Some(run_fn);
                self.control.token = token;

                // SAFETY: The stack is owned by this context and unused.
                let sp = unsafe { switch::prepare(stack.top(), fiber_main) };
                self.control.fiber_sp = Some(sp);

                trace!(bottom = ?stack.bottom(), "Starting fiber");
            },
            Phase::Suspended =>
                trace!("Resuming fiber"),
            phase =>
                panic!("Fiber entered while {:?}", phase),
        }

        self.phase = Phase::Running;

        // SAFETY: fiber_sp was prepared above or saved by a suspension,
        // and the stack stays live for as long as the context holds it.
        unsafe { control::resume(&mut self.control) };

        let result =
            mem::replace(&mut self.control.result, TaskResult::Waiting);

        self.phase =
            if self.control.fiber_sp.is_some() {
                Phase::Suspended
            } else if result.is_failed() {
                Phase::Failed
            } else {
                Phase::Completed
            };

        debug_assert_eq!(
            self.control.is_live(),
            self.phase == Phase::Suspended,
        );

        trace!(phase = ?self.phase, %result, "Left fiber");

        result
    }

    /// Tear the fiber down and give the stack back to the provider.
    ///
    /// A suspended fiber is abandoned: its stack is released
    /// without running the destructors of values that live on it.
    /// Task code that must release resources on cancellation
    /// has to run to completion before the context is cleared.
    ///
    /// This may be called in any phase; afterwards the context is unstarted
    /// and holds no stack, just like a new context.
    pub fn clear(&mut self)
    {
        if self.phase == Phase::Suspended {
            debug!("Abandoning suspended fiber");
        }

        self.control = ControlState::new();
        self.phase = Phase::Unstarted;

        if let Some(stack) = self.stack.take() {
            self.provider.deallocate(stack);
            debug!(bottom = ?stack.bottom(), "Released stack");
        }
    }
}

impl<P> Drop for FiberCtx<P>
    where P: StackProvider
{
    fn drop(&mut self)
    {
        self.clear();
    }
}

impl<P> fmt::Debug for FiberCtx<P>
    where P: StackProvider
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("FiberCtx")
            .field("phase", &self.phase)
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}

/// Suspend the running fiber with [`TaskResult::Waiting`].
///
/// Equivalent to [`yield_with`]`(TaskResult::Waiting)`.
#[track_caller]
pub fn yield_now()
{
    yield_with(TaskResult::Waiting);
}

/// Suspend the running fiber.
///
/// Control returns to whoever entered the innermost running fiber,
/// whose call to [`FiberCtx::enter`] returns `result`.
/// This function returns the next time the fiber is entered.
///
/// The fiber stays suspended whatever `result` is;
/// yielding [`TaskResult::Done`] does not finish the task.
///
/// # Panics
///
/// Panics if no fiber is running on this thread.
#[track_caller]
pub fn yield_with(result: TaskResult)
{
    control::suspend(result);
}

/// Whether the calling code runs inside a fiber.
pub fn in_fiber() -> bool
{
    !control::current().is_null()
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{MIN_STACK_SIZE, StackPolicy, StackPool, StopSource, TaskError},
        proptest::{collection::vec, prop_oneof, proptest, strategy::Just},
        std::{
            hint::black_box,
            sync::{
                Arc, Mutex,
                atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering::SeqCst},
            },
            thread,
        },
    };

    /// Task function for entries that resume a suspended fiber.
    fn unused(_: StopToken)
    {
        panic!("Task function of a resumed fiber was called");
    }

    fn boom(_: StopToken)
    {
        panic!("boom");
    }

    fn started() -> FiberCtx
    {
        let mut fiber = FiberCtx::new();
        fiber.init().unwrap();
        fiber
    }

    /// Stack provider that counts the stacks it has out.
    #[derive(Default)]
    struct Counting
    {
        inner: ProtectedStack,
        live: Arc<AtomicIsize>,
    }

    // SAFETY: Delegates to ProtectedStack.
    unsafe impl StackProvider for Counting
    {
        fn allocate(&mut self) -> Result<StackBlock, AllocationError>
        {
            let block = self.inner.allocate()?;
            self.live.fetch_add(1, SeqCst);
            Ok(block)
        }

        fn deallocate(&mut self, block: StackBlock)
        {
            self.inner.deallocate(block);
            self.live.fetch_sub(1, SeqCst);
        }
    }

    #[test]
    fn yield_then_return()
    {
        let mut fiber = started();
        assert_eq!(fiber.phase(), Phase::Unstarted);

        let result = fiber.enter(StopToken::never(), |_| yield_now());
        assert!(result.is_waiting());
        assert_eq!(fiber.phase(), Phase::Suspended);

        let result = fiber.enter(StopToken::never(), unused);
        assert!(result.is_done());
        assert_eq!(fiber.phase(), Phase::Completed);
    }

    #[test]
    fn panic_before_yield()
    {
        let mut fiber = started();
        let result = fiber.enter(StopToken::never(), boom);
        let error = result.error().unwrap();
        assert!(error.is_panic());
        assert_eq!(error.to_string(), "Task panicked: boom");
        assert_eq!(fiber.phase(), Phase::Failed);
    }

    #[test]
    fn error_after_yield()
    {
        let mut fiber = started();
        let result = fiber.enter(StopToken::never(), |_| -> anyhow::Result<()> {
            yield_now();
            anyhow::bail!("bad input");
        });
        assert!(result.is_waiting());

        let result = fiber.enter(StopToken::never(), unused);
        let Some(error) = result.error() else { panic!("{}", result) };
        assert!(!error.is_panic());
        assert_eq!(error.to_string(), "bad input");
        assert_eq!(fiber.phase(), Phase::Failed);
    }

    #[test]
    fn panic_on_smallest_stack()
    {
        let mut fiber = FiberCtx::with_provider(ProtectedStack::new(
            StackPolicy{size: MIN_STACK_SIZE, guard_pages: 1},
        ));
        fiber.init().unwrap();
        assert!(fiber.enter(StopToken::never(), boom).is_failed());

        let mut fiber = FiberCtx::with_provider(ProtectedStack::new(
            StackPolicy{size: MIN_STACK_SIZE, guard_pages: 1},
        ));
        fiber.init().unwrap();
        let result = fiber.enter(StopToken::never(), |token| {
            yield_now();
            boom(token);
        });
        assert!(result.is_waiting());
        assert!(fiber.enter(StopToken::never(), unused).is_failed());
        assert_eq!(fiber.phase(), Phase::Failed);
    }

    #[test]
    fn init_failure_leaves_context_unstarted()
    {
        let mut fiber = FiberCtx::with_provider(ProtectedStack::new(
            StackPolicy{size: usize::MAX - 4096, guard_pages: 1},
        ));
        let result = fiber.init();
        assert!(matches!(result, Err(AllocationError::TooLarge(_))));
        assert_eq!(fiber.phase(), Phase::Unstarted);
        assert!(!fiber.has_stack());

        // Failed allocations can be retried.
        assert!(fiber.init().is_err());
        assert!(!fiber.has_stack());
    }

    #[test]
    #[should_panic(expected = "Fiber entered while Failed")]
    fn enter_after_failure()
    {
        let mut fiber = started();
        assert!(fiber.enter(StopToken::never(), boom).is_failed());
        fiber.enter(StopToken::never(), unused);
    }

    #[test]
    #[should_panic(expected = "Fiber entered while Completed")]
    fn enter_after_completion()
    {
        let mut fiber = started();
        assert!(fiber.enter(StopToken::never(), |_| { }).is_done());
        fiber.enter(StopToken::never(), unused);
    }

    #[test]
    #[should_panic(expected = "Fiber entered before init")]
    fn enter_before_init()
    {
        FiberCtx::new().enter(StopToken::never(), unused);
    }

    #[test]
    #[should_panic(expected = "Fiber initialized while holding a stack")]
    fn init_twice()
    {
        let mut fiber = started();
        let _ = fiber.init();
    }

    #[test]
    #[should_panic(expected = "Cannot yield outside of a fiber")]
    fn yield_outside_fiber()
    {
        yield_now();
    }

    #[test]
    fn in_fiber_only_inside()
    {
        assert!(!in_fiber());
        let inside = Arc::new(AtomicBool::new(false));
        let task_inside = inside.clone();
        let mut fiber = started();
        fiber.enter(StopToken::never(), move |_| {
            task_inside.store(in_fiber(), SeqCst);
        });
        assert!(inside.load(SeqCst));
        assert!(!in_fiber());
    }

    #[test]
    fn token_forwarded_on_first_entry_only()
    {
        let source = StopSource::new();
        let polls = Arc::new(AtomicUsize::new(0));
        let task_polls = polls.clone();

        let mut fiber = started();
        let result = fiber.enter(source.token(), move |token| {
            while !token.stop_requested() {
                task_polls.fetch_add(1, SeqCst);
                yield_now();
            }
        });
        assert!(result.is_waiting());
        assert!(fiber.enter(StopToken::never(), unused).is_waiting());

        source.request_stop();
        assert!(fiber.enter(StopToken::never(), unused).is_done());
        assert_eq!(polls.load(SeqCst), 2);
    }

    #[test]
    fn clear_then_init_is_fresh()
    {
        let live = Arc::new(AtomicIsize::new(0));
        let provider = Counting{live: live.clone(), ..Counting::default()};
        let mut fiber = FiberCtx::with_provider(provider);

        for _ in 0 .. 3 {
            fiber.init().unwrap();
            assert_eq!(live.load(SeqCst), 1);
            assert_eq!(fiber.phase(), Phase::Unstarted);

            let result = fiber.enter(StopToken::never(), |_| yield_now());
            assert!(result.is_waiting());

            fiber.clear();
            assert_eq!(fiber.phase(), Phase::Unstarted);
            assert!(!fiber.has_stack());
            assert_eq!(live.load(SeqCst), 0);
        }

        fiber.init().unwrap();
        let result = fiber.enter(StopToken::never(), |_| yield_now());
        assert!(result.is_waiting());
        assert!(fiber.enter(StopToken::never(), unused).is_done());
    }

    #[test]
    fn clear_is_idempotent()
    {
        let mut fiber = FiberCtx::new();
        fiber.clear();
        fiber.clear();
        assert_eq!(fiber.phase(), Phase::Unstarted);

        fiber.init().unwrap();
        fiber.enter(StopToken::never(), boom);
        fiber.clear();
        fiber.clear();
        assert!(!fiber.has_stack());
    }

    #[test]
    fn clear_abandons_suspended_task()
    {
        struct SetOnDrop(Arc<AtomicBool>);

        impl Drop for SetOnDrop
        {
            fn drop(&mut self)
            {
                self.0.store(true, SeqCst);
            }
        }

        let live = Arc::new(AtomicIsize::new(0));
        let provider = Counting{live: live.clone(), ..Counting::default()};
        let mut fiber = FiberCtx::with_provider(provider);
        fiber.init().unwrap();

        let dropped = Arc::new(AtomicBool::new(false));
        let task_dropped = dropped.clone();
        fiber.enter(StopToken::never(), move |_| {
            let _guard = SetOnDrop(task_dropped);
            yield_now();
        });

        drop(fiber);
        assert_eq!(live.load(SeqCst), 0);
        assert!(!dropped.load(SeqCst));
    }

    #[test]
    fn nested_fibers()
    {
        let log = Arc::new(Mutex::new(Vec::new()));
        let outer_log = log.clone();

        let mut outer = started();
        let result = outer.enter(StopToken::never(), move |_| {
            let inner_log = outer_log.clone();
            let mut inner = started();
            let result = inner.enter(StopToken::never(), move |_| {
                inner_log.lock().unwrap().push("inner 1");
                yield_now();
                inner_log.lock().unwrap().push("inner 2");
            });
            assert!(result.is_waiting());

            outer_log.lock().unwrap().push("outer 1");
            yield_now();

            assert!(inner.enter(StopToken::never(), unused).is_done());
            outer_log.lock().unwrap().push("outer 2");
        });

        assert!(result.is_waiting());
        assert_eq!(*log.lock().unwrap(), ["inner 1", "outer 1"]);

        assert!(outer.enter(StopToken::never(), unused).is_done());
        assert_eq!(
            *log.lock().unwrap(),
            ["inner 1", "outer 1", "inner 2", "outer 2"],
        );
    }

    #[test]
    fn independent_fibers_on_threads()
    {
        let handles: Vec<_> = (0 .. 4).map(|_| thread::spawn(|| {
            let log = Arc::new(Mutex::new(Vec::new()));
            let task_log = log.clone();

            let mut fiber = started();
            let mut result = fiber.enter(StopToken::never(), move |_| {
                for i in 0 .. 100 {
                    task_log.lock().unwrap().push(i);
                    yield_now();
                }
            });

            let mut yields = 0;
            while result.is_waiting() {
                yields += 1;
                result = fiber.enter(StopToken::never(), unused);
            }

            assert!(result.is_done());
            assert_eq!(yields, 100);
            assert_eq!(*log.lock().unwrap(), (0 .. 100).collect::<Vec<_>>());
        })).collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn resume_on_another_thread()
    {
        let threads = Arc::new(Mutex::new(Vec::new()));
        let task_threads = threads.clone();

        let mut fiber = started();
        let result = fiber.enter(StopToken::never(), move |_| {
            task_threads.lock().unwrap().push(thread::current().id());
            yield_now();
            task_threads.lock().unwrap().push(thread::current().id());
            assert!(in_fiber());
        });
        assert!(result.is_waiting());

        let (result, other) = thread::spawn(move || {
            let result = fiber.enter(StopToken::never(), unused);
            (result, thread::current().id())
        }).join().unwrap();

        assert!(result.is_done());
        assert_eq!(*threads.lock().unwrap(), [thread::current().id(), other]);
    }

    #[test]
    fn pooled_stack_reused_across_fibers()
    {
        let pool = StackPool::with_capacity(1);
        let mut first = None;

        for _ in 0 .. 3 {
            let mut fiber = FiberCtx::with_provider(pool.acquire().unwrap());
            fiber.init().unwrap();
            let stack = fiber.stack().unwrap();
            assert_eq!(*first.get_or_insert(stack), stack);

            let result = fiber.enter(StopToken::never(), |_| yield_now());
            assert!(result.is_waiting());
            assert!(fiber.enter(StopToken::never(), unused).is_done());
        }

        assert_eq!(pool.allocated_count(), 1);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn uses_its_stack()
    {
        fn recurse(depth: usize) -> usize
        {
            let frame = black_box([1u8; 256]);
            if depth == 0 {
                0
            } else {
                recurse(depth - 1) + frame[255] as usize
            }
        }

        let mut fiber = started();
        let result = fiber.enter(StopToken::never(), |_| {
            assert_eq!(recurse(100), 100);
        });
        assert!(result.is_done());
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Step
    {
        Waiting,
        Done,
        Failed,
    }

    impl Step
    {
        fn of(result: &TaskResult) -> Self
        {
            match result {
                TaskResult::Waiting   => Self::Waiting,
                TaskResult::Done      => Self::Done,
                TaskResult::Failed(_) => Self::Failed,
            }
        }

        fn result(self) -> TaskResult
        {
            match self {
                Self::Waiting => TaskResult::Waiting,
                Self::Done    => TaskResult::Done,
                Self::Failed  =>
                    TaskResult::Failed(TaskError::from(anyhow::anyhow!("step"))),
            }
        }
    }

    proptest!
    {
        #[test]
        fn results_in_yield_order(
            steps in vec(
                prop_oneof![
                    Just(Step::Waiting),
                    Just(Step::Done),
                    Just(Step::Failed),
                ],
                0 .. 16,
            )
        )
        {
            let mut fiber = started();

            let task_steps = steps.clone();
            let mut result = fiber.enter(StopToken::never(), move |_| {
                for step in task_steps {
                    yield_with(step.result());
                }
            });

            for step in steps {
                assert_eq!(Step::of(&result), step);
                assert_eq!(fiber.phase(), Phase::Suspended);
                result = fiber.enter(StopToken::never(), unused);
            }

            assert_eq!(Step::of(&result), Step::Done);
            assert_eq!(fiber.phase(), Phase::Completed);
        }
    }
}
