//! # Thread suspension
//!
//! [`ThreadDelegate`] abstracts the per-platform primitives needed to freeze
//! one thread and read its state. [`ScopedSuspendThread`] pairs every
//! successful suspend with exactly one resume, on every exit path.
//!
//! ## Platform variants
//!
//! - **Linux** (`linux`): no in-process suspend primitive exists, so the target
//!   is parked inside a signal handler that spins until released
//! - **macOS** (`macos`): `thread_suspend` / `thread_resume` on the Mach port
//! - **Windows** (`windows`): `SuspendThread` / `ResumeThread` on a thread
//!   handle, with the priority-boost setting restored after resume
//!
//! ## Suspension window rules
//!
//! Between `suspend()` and `resume()` the sampling thread must not allocate,
//! log, or take any lock: the frozen thread may hold the allocator lock or the
//! logger's mutex. Implementations of this trait follow the same rule.

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(all(windows, target_arch = "x86_64"))]
pub mod windows;

use crate::capture::RegisterContext;

#[cfg(target_os = "linux")]
pub use linux::{LinuxThreadDelegate as NativeThreadDelegate, SamplingThreadToken};
#[cfg(target_os = "macos")]
pub use macos::{MacThreadDelegate as NativeThreadDelegate, SamplingThreadToken};
#[cfg(all(windows, target_arch = "x86_64"))]
pub use windows::{SamplingThreadToken, WindowsThreadDelegate as NativeThreadDelegate};

/// Platform operations on the one thread a sampler targets
///
/// All methods except [`stack_base_address`](Self::stack_base_address) are
/// called inside the suspension window and must not allocate, log, or lock.
pub trait ThreadDelegate {
    /// Freeze the target; false if it could not be frozen (e.g. it exited)
    fn suspend(&self) -> bool;

    /// Let the target run again; false means the thread is stuck frozen
    fn resume(&self) -> bool;

    /// Fill `context` with the frozen thread's registers
    fn thread_context(&self, context: &mut RegisterContext) -> bool;

    /// Highest address (exclusive) of the target's stack
    fn stack_base_address(&self) -> usize;
}

/// Suspends a thread for the lifetime of the guard
///
/// Resumes on drop if and only if suspension succeeded. A failed resume
/// aborts the process: continuing would leave the target frozen forever, and
/// there is no safe way to report it from inside the window.
pub struct ScopedSuspendThread<'a, D: ThreadDelegate + ?Sized> {
    delegate: &'a D,
    suspended: bool,
}

impl<'a, D: ThreadDelegate + ?Sized> ScopedSuspendThread<'a, D> {
    pub fn new(delegate: &'a D) -> Self {
        let suspended = delegate.suspend();
        Self { delegate, suspended }
    }

    #[must_use]
    pub fn was_successful(&self) -> bool {
        self.suspended
    }
}

impl<D: ThreadDelegate + ?Sized> Drop for ScopedSuspendThread<'_, D> {
    fn drop(&mut self) {
        if self.suspended && !self.delegate.resume() {
            std::process::abort();
        }
    }
}
