//! Extra items for talking to the operating system.
//!
//! This crate provides a safe, low-level interface to the operating system.
//! The functions in this crate are named after their underlying system calls,
//! and their behavior is identical except for the differences listed below.
//! The exact semantics of each function can be found in their man pages.
//! This is in contrast with the std crate, which gives no such guarantees.
//! This is a trade-off against cross-platform compatibility.
//!
//! # Differences with underlying system calls
//!
//! Errors are reported using [`Result`] rather than
//! through `errno` and an arbitrary return value.
//!
//! Pointers that must not be null are passed as [`NonNull`].
//! A mapping that failed is never returned as `MAP_FAILED`;
//! it is reported as an error instead.
//!
//! Functions that can invalidate memory that is in use are `unsafe`.
//! Functions that cannot are safe, even if the system call is not.
//!
//! [`Result`]: `std::io::Result`
//! [`NonNull`]: `std::ptr::NonNull`

#![warn(missing_docs)]

pub use {
    self::{sys_mman::*, unistd::*},
    libc::{
        MAP_ANONYMOUS, MAP_PRIVATE,
        PROT_NONE, PROT_READ, PROT_WRITE,
        _SC_PAGESIZE,
    },
};

mod sys_mman;
mod unistd;

/// `MAP_STACK`, or zero where the flag does not exist.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub const MAP_STACK: libc::c_int = libc::MAP_STACK;

/// `MAP_STACK`, or zero where the flag does not exist.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub const MAP_STACK: libc::c_int = 0;
