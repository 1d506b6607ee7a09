//! Cooperative cancellation.
//!
//! Whoever requests a task keeps a [`StopSource`] and hands out
//! [`StopToken`]s to the task. The task polls its token at points of its own
//! choosing. Nothing is ever interrupted; a stop request is only a flag.

use std::sync::{Arc, atomic::{AtomicBool, Ordering::{AcqRel, Acquire}}};

/// Owner of a stop flag.
///
/// Dropping the source does not request a stop.
/// Tokens handed out earlier keep observing the flag,
/// which then stays in whatever state it was left in.
#[derive(Debug)]
pub struct StopSource
{
    flag: Arc<AtomicBool>,
}

/// Read-only observation handle into a stop flag.
///
/// Tokens are cheap to clone; all clones observe the same flag.
#[derive(Clone, Debug)]
pub struct StopToken
{
    /// [`None`] for tokens that can never be stopped.
    flag: Option<Arc<AtomicBool>>,
}

impl StopSource
{
    /// Create a source whose flag is not set.
    pub fn new() -> Self
    {
        Self{flag: Arc::new(AtomicBool::new(false))}
    }

    /// Create a token that observes this source.
    pub fn token(&self) -> StopToken
    {
        StopToken{flag: Some(self.flag.clone())}
    }

    /// Set the stop flag.
    ///
    /// Returns whether this call set it,
    /// that is, whether no stop was requested before.
    pub fn request_stop(&self) -> bool
    {
        !self.flag.swap(true, AcqRel)
    }

    /// Whether a stop was requested through this source.
    pub fn stop_requested(&self) -> bool
    {
        self.flag.load(Acquire)
    }
}

impl Default for StopSource
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl StopToken
{
    /// Create a token that is never stopped.
    pub const fn never() -> Self
    {
        Self{flag: None}
    }

    /// Whether a stop was requested.
    pub fn stop_requested(&self) -> bool
    {
        self.flag.as_ref().map_or(false, |flag| flag.load(Acquire))
    }

    /// Whether a stop can ever be requested for this token.
    pub fn stop_possible(&self) -> bool
    {
        self.flag.is_some()
    }
}

impl Default for StopToken
{
    fn default() -> Self
    {
        Self::never()
    }
}
