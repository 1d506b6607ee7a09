use std::io;

/// Call sysconf(3) with the given argument.
///
/// If the option is supported but has no limit,
/// sysconf(3) returns -1 without setting `errno`.
/// This wrapper returns [`None`] in that case.
pub fn sysconf(name: libc::c_int) -> io::Result<Option<libc::c_long>>
{
    // sysconf does not reset errno on success.
    errno_clear();

    // SAFETY: This is always safe.
    let result = unsafe { libc::sysconf(name) };

    if result == -1 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(0) | None => Ok(None),
            Some(_)        => Err(err),
        };
    }

    Ok(Some(result))
}

/// Set `errno` to zero.
fn errno_clear()
{
    // SAFETY: errno is thread-local and always valid to write.
    unsafe { *errno_location() = 0; }
}

#[cfg(target_os = "linux")]
unsafe fn errno_location() -> *mut libc::c_int
{
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int
{
    libc::__error()
}

#[cfg(any(target_os = "android", target_os = "openbsd", target_os = "netbsd"))]
unsafe fn errno_location() -> *mut libc::c_int
{
    libc::__errno()
}

#[cfg(any(target_os = "illumos", target_os = "solaris"))]
unsafe fn errno_location() -> *mut libc::c_int
{
    libc::___errno()
}
