use std::{io, ptr::{NonNull, null_mut}};

/// Call mmap(2) to create an anonymous mapping.
///
/// `MAP_ANONYMOUS` is passed implicitly and no file descriptor is used.
/// The kernel chooses the address of the mapping.
/// Because `MAP_FIXED` is rejected with `EINVAL`,
/// the new mapping never replaces an existing one.
pub fn mmap_anonymous(
    length: usize,
    prot:   libc::c_int,
    flags:  libc::c_int,
) -> io::Result<NonNull<u8>>
{
    if flags & libc::MAP_FIXED != 0 {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }

    let flags = flags | libc::MAP_ANONYMOUS;

    // SAFETY: Without MAP_FIXED, no existing memory is affected.
    let ptr = unsafe {
        libc::mmap(
            /* addr   */ null_mut(),
            /* length */ length,
            /* prot   */ prot,
            /* flags  */ flags,
            /* fd     */ -1,
            /* offset */ 0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    // mmap never returns null on success without MAP_FIXED.
    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))
}

/// Call mprotect(2) with the given arguments.
///
/// # Safety
///
/// The range must not contain memory that is in use
/// in a way that the new protection forbids.
pub unsafe fn mprotect(addr: NonNull<u8>, len: usize, prot: libc::c_int)
    -> io::Result<()>
{
    let result = libc::mprotect(addr.as_ptr().cast(), len, prot);

    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Call munmap(2) with the given arguments.
///
/// # Safety
///
/// The range must not contain memory that is still in use.
pub unsafe fn munmap(addr: NonNull<u8>, len: usize) -> io::Result<()>
{
    let result = libc::munmap(addr.as_ptr().cast(), len);

    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
