//! Busy-waiting before suspending.

use {crate::{in_fiber, yield_now}, std::{hint, thread}};

/// Tell the processor that the caller is busy-waiting.
///
/// This emits `pause` on x86 and `yield` on ARM, and nothing elsewhere.
#[inline(always)]
pub fn spin_pause()
{
    hint::spin_loop();
}

/// Poll `cond` up to `limit` times, pausing in between.
///
/// Returns whether `cond` became true.
pub fn spin_until<F>(mut cond: F, limit: usize) -> bool
    where F: FnMut() -> bool
{
    for _ in 0 .. limit {
        if cond() {
            return true;
        }
        spin_pause();
    }
    cond()
}

/// Wait until `cond` holds.
///
/// Spins for up to `spin_limit` polls first. After that, each further poll
/// is preceded by a [yield] when running inside a fiber,
/// or by yielding the thread otherwise.
///
/// [yield]: `yield_now`
pub fn wait_until<F>(mut cond: F, spin_limit: usize)
    where F: FnMut() -> bool
{
    if spin_until(&mut cond, spin_limit) {
        return;
    }

    while !cond() {
        if in_fiber() {
            yield_now();
        } else {
            thread::yield_now();
        }
    }
}
