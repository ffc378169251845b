//! # Stack walking over a captured copy
//!
//! The walker never touches the live thread: it reads the relocated
//! [`CapturedStack`] and steps a [`RegisterContext`] from callee to caller
//! with an [`Unwinder`].
//!
//! ## Unwinders
//!
//! | Platform      | Native unwinder          | Metadata                          |
//! |---------------|--------------------------|-----------------------------------|
//! | Linux         | [`DwarfUnwinder`]        | `.eh_frame` CFI, frame pointers   |
//! | macOS         | [`FramePointerUnwinder`] | frame records                     |
//! | Windows x64   | [`Win64Unwinder`]        | `.pdata` / `RtlVirtualUnwind`     |
//!
//! Frame-pointer walking only works for code that keeps its frame records;
//! `cargo xtask test` builds with `-C force-frame-pointers=yes`.

#[cfg(target_os = "linux")]
pub mod dwarf;
pub mod frame_pointer;
pub mod trampoline;
pub mod walker;
#[cfg(all(windows, target_arch = "x86_64"))]
pub mod win64;

use crate::capture::{CapturedStack, RegisterContext};
use stacksnap_common::Module;

#[cfg(target_os = "linux")]
pub use dwarf::DwarfUnwinder;
pub use frame_pointer::FramePointerUnwinder;
pub use walker::{StackWalker, WalkEnd};
#[cfg(all(windows, target_arch = "x86_64"))]
pub use win64::Win64Unwinder;

#[cfg(target_os = "linux")]
pub use dwarf::DwarfUnwinder as NativeUnwinder;
#[cfg(target_os = "macos")]
pub use frame_pointer::FramePointerUnwinder as NativeUnwinder;
#[cfg(all(windows, target_arch = "x86_64"))]
pub use win64::Win64Unwinder as NativeUnwinder;

/// Outcome of one unwind step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindResult {
    /// The current frame is the outermost one
    Completed,
    /// The context now describes the caller
    Unfinished,
    /// The step failed; frames gathered so far stand
    Aborted,
}

/// Steps a register context from a frame to its caller
pub trait Unwinder {
    /// True if `module` carries unwind metadata covering `pc`
    fn has_unwind_info(&mut self, pc: usize, module: &Module) -> bool;

    /// Replace `context` with its caller's state
    ///
    /// `is_first_frame` is true for the sampled (leaf) frame, whose pc is the
    /// interrupted instruction rather than a return address. On anything but
    /// [`UnwindResult::Unfinished`], `context` must be left unchanged.
    fn step(
        &mut self,
        context: &mut RegisterContext,
        stack: &CapturedStack<'_>,
        module: &Module,
        is_first_frame: bool,
    ) -> UnwindResult;

    /// Drop per-session caches
    fn reset(&mut self) {}
}
