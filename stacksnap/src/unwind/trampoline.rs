//! Location of the signal-return trampoline
//!
//! A thread interrupted while returning from a signal handler sits in a tiny
//! routine that has no usable unwind metadata. The walker recognises it by
//! address and reports a single frame instead of unwinding garbage.
//!
//! - Linux x86_64 (glibc): the `sa_restorer` glibc installs with every handler
//! - macOS: the bounds of `_sigtramp` in libsystem_platform
//! - elsewhere: unknown

#![allow(unsafe_code)] // sigaction / dladdr queries

use crate::domain::AddressRange;
use std::sync::OnceLock;

/// Address range of the signal trampoline, computed once per process
#[must_use]
pub fn signal_trampoline_range() -> Option<AddressRange> {
    static RANGE: OnceLock<Option<AddressRange>> = OnceLock::new();
    *RANGE.get_or_init(locate)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
fn locate() -> Option<AddressRange> {
    use crate::suspend::linux::{install_park_handler, PARK_SIGNAL};

    // The restorer is only visible once a handler is in place.
    install_park_handler().ok()?;

    // __restore_rt is `mov $15, %rax; syscall` padded to 16 bytes
    const RESTORER_LEN: usize = 16;

    // SAFETY: a null new action only queries the current disposition
    let restorer = unsafe {
        let mut current: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(PARK_SIGNAL, std::ptr::null(), &mut current) != 0 {
            return None;
        }
        current.sa_restorer?
    };
    let start = restorer as usize;
    Some(AddressRange::new(start, start + RESTORER_LEN))
}

#[cfg(target_os = "macos")]
fn locate() -> Option<AddressRange> {
    const SCAN_LIMIT: usize = 4096;

    // SAFETY: dlsym/dladdr only read loader state
    unsafe {
        let start = libc::dlsym(libc::RTLD_DEFAULT, c"_sigtramp".as_ptr()) as usize;
        if start == 0 {
            return None;
        }
        let mut end = start + 1;
        while end < start + SCAN_LIMIT {
            let mut info: libc::Dl_info = std::mem::zeroed();
            if libc::dladdr(end as *const libc::c_void, &mut info) == 0
                || info.dli_saddr as usize != start
            {
                break;
            }
            end += 1;
        }
        Some(AddressRange::new(start, end))
    }
}

#[cfg(not(any(
    all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"),
    target_os = "macos"
)))]
fn locate() -> Option<AddressRange> {
    None
}
