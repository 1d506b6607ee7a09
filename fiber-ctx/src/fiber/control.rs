//! State that crosses the boundary between a fiber and its caller.
//!
//! The caller reaches the control state through the fiber context it holds.
//! The fiber reaches it through a thread-local pointer that [`resume`] sets
//! for the duration of each entry. The fiber never keeps the pointer across
//! a suspension, because the context may have moved by the time it resumes,
//! and the fiber may even be resumed on a different thread.

use {
    crate::{
        StopToken, TaskError, TaskResult,
        switch::{self, StackPointer},
    },
    std::{
        cell::Cell,
        mem::{self, align_of, size_of},
        panic::{AssertUnwindSafe, catch_unwind},
        process::abort,
        ptr::{addr_of_mut, null_mut},
    },
    tracing::debug,
};

/// Task function, type-erased.
pub type RunFn = Box<dyn FnOnce(StopToken) -> Result<(), TaskError> + Send>;

/// Bytes reserved for the control state inside each fiber context.
///
/// Fiber contexts are created and destroyed at a high rate,
/// so their control state lives inline rather than in its own allocation.
/// Growing the control state beyond this is a compile error.
pub const CONTROL_STATE_CAPACITY: usize = 8 * size_of::<usize>();

const _: () = assert!(size_of::<ControlState>() <= CONTROL_STATE_CAPACITY);
const _: () = assert!(align_of::<ControlState>() <= align_of::<u128>());

pub struct ControlState
{
    /// Where the fiber continues when entered.
    ///
    /// Set while the fiber is suspended, or prepared but not yet entered.
    pub fiber_sp: Option<StackPointer>,

    /// Where the fiber continues its caller when it suspends or finishes.
    ///
    /// Set while the fiber is running.
    pub caller_sp: Option<StackPointer>,

    /// Consumed by the fiber on first entry.
    pub run_fn: Option<RunFn>,
    pub token: StopToken,

    /// Result of the most recent suspension or of completion.
    pub result: TaskResult,
}

thread_local! {
    /// Control state of the innermost fiber running on this thread.
    static CURRENT: Cell<*mut ControlState> = const { Cell::new(null_mut()) };
}

impl ControlState
{
    pub const fn new() -> Self
    {
        Self{
            fiber_sp: None,
            caller_sp: None,
            run_fn: None,
            token: StopToken::never(),
            result: TaskResult::Waiting,
        }
    }

    /// Whether a saved execution is recorded.
    pub fn is_live(&self) -> bool
    {
        self.fiber_sp.is_some() || self.caller_sp.is_some()
    }
}

/// Pointer to the control state of the innermost running fiber.
///
/// Never inlined: the address of a thread-local must be recomputed after
/// every suspension, as the fiber may have moved to another thread.
#[inline(never)]
pub fn current() -> *mut ControlState
{
    CURRENT.with(Cell::get)
}

fn replace_current(control: *mut ControlState) -> *mut ControlState
{
    CURRENT.with(|current| current.replace(control))
}

/// Switch into the fiber and return once it suspends or finishes.
///
/// # Safety
///
/// `control` must be valid for the duration of the call, and its `fiber_sp`
/// must be set, pointing into a live stack.
pub unsafe fn resume(control: *mut ControlState)
{
    let to = (*control).fiber_sp.take()
        .expect("Resumed a fiber that is not suspended");

    // Restore the outer fiber, if any, once this one hands control back.
    let outer = replace_current(control);
    switch::switch(addr_of_mut!((*control).caller_sp), to, control as usize);
    replace_current(outer);
}

/// Hand control back to the caller of the innermost running fiber.
///
/// Returns when the fiber is entered again.
///
/// # Panics
///
/// Panics if no fiber is running on this thread.
#[track_caller]
pub fn suspend(result: TaskResult)
{
    let control = current();
    if control.is_null() {
        panic!("Cannot yield outside of a fiber");
    }

    // SAFETY: The caller is blocked inside resume, so control is valid,
    // and caller_sp was set by the switch in resume.
    unsafe {
        (*control).result = result;
        let Some(to) = (*control).caller_sp.take()
            else { unreachable!("Running fiber without caller") };
        switch::switch(addr_of_mut!((*control).fiber_sp), to, 0);
    }

    // The control state may have moved; it must not be touched anymore.
}

/// Entry function of every fiber.
///
/// Runs the task function, catching any panic, and reports the outcome.
/// Nothing may unwind out of here, and nothing may be left on the stack
/// that needs dropping before the final switch.
pub extern "C" fn fiber_main(arg: usize) -> !
{
    let control = arg as *mut ControlState;

    // SAFETY: The first switch passes the control state as its argument.
    let (run_fn, token) = unsafe {
        ((*control).run_fn.take(), mem::take(&mut (*control).token))
    };

    let outcome = match run_fn {
        Some(run_fn) =>
            catch_unwind(AssertUnwindSafe(|| run_fn(token)))
                .unwrap_or_else(|payload| Err(TaskError::from_panic(payload))),
        None => Ok(()),
    };

    let result = match outcome {
        Ok(()) => TaskResult::Done,
        Err(error) => {
            debug!(%error, "Fiber task failed");
            TaskResult::Failed(error)
        },
    };

    // The task may have suspended, so look the control state up anew.
    let control = current();

    // SAFETY: The caller is blocked inside resume, so control is valid.
    unsafe {
        (*control).result = result;
        let Some(to) = (*control).caller_sp.take()
            else { abort() };
        let mut finished = None;
        switch::switch(&mut finished, to, 0);
    }

    // Nothing ever switches back to a finished fiber.
    abort()
}
