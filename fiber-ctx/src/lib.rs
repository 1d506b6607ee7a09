//! Fiber-based task execution contexts.
//!
//! A fiber is a unit of work with its own call stack.
//! It runs on whichever thread [enters] it, until it [yields] or returns.
//! A yielded fiber occupies no thread; entering it again resumes it
//! right after the yield, on the stack it was running on.
//!
//! This crate provides the fiber execution context, the stacks fibers run on,
//! and the small vocabulary passed across every suspension:
//! a [task result] and a [stop token].
//! Deciding *when* to resume which fiber is left to a scheduler.
//!
//! # Example
//!
//! ```
//! use fiber_ctx::{FiberCtx, StopToken, TaskResult, yield_now};
//!
//! let mut fiber = FiberCtx::new();
//! fiber.init().unwrap();
//!
//! let result = fiber.enter(StopToken::never(), |_| { yield_now(); });
//! assert!(matches!(result, TaskResult::Waiting));
//!
//! let result = fiber.enter(StopToken::never(), |_| { });
//! assert!(matches!(result, TaskResult::Done));
//! ```
//!
//! [enters]: `FiberCtx::enter`
//! [yields]: `yield_now`
//! [task result]: `TaskResult`
//! [stop token]: `StopToken`

#![warn(missing_docs)]

pub use self::{
    cancel::*,
    fiber::*,
    spin::*,
    stack::*,
    task::*,
};

mod cancel;
mod fiber;
mod spin;
mod stack;
mod switch;
mod task;
