//! Frame-by-frame walk of a captured stack
//!
//! Per step: resolve the pc's module, emit the frame, ask the unwinder for
//! the caller, sanity-check the result. The walk ends when the unwinder
//! reports the outermost frame, when a pc has no owning module, when a step
//! fails, or at [`MAX_FRAMES`]. Frames emitted before a failure are kept.

use super::{UnwindResult, Unwinder};
use crate::capture::{CapturedStack, RegisterContext};
use crate::domain::AddressRange;
use crate::modules::{ModuleLoader, ModuleRegistry};
use stacksnap_common::{Frame, ModuleIndex, MAX_FRAMES};

/// Why a walk stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd {
    /// Reached the outermost frame
    Completed,
    /// An unwind step or sanity check failed
    Aborted,
    /// A pc did not belong to any loaded module
    UnknownModule,
    /// Hit [`MAX_FRAMES`]
    Truncated,
    /// The sampled pc was inside the signal trampoline
    Trampoline,
}

pub struct StackWalker {
    trampoline: Option<AddressRange>,
}

impl StackWalker {
    /// `trampoline` is the signal-return routine's range, if known
    #[must_use]
    pub fn new(trampoline: Option<AddressRange>) -> Self {
        Self { trampoline }
    }

    /// Walk from `context` and append frames, leaf first
    ///
    /// If the walk stops after exactly one frame and the leaf's module has
    /// no unwind metadata for the leaf pc (hand-written kernel-transition
    /// stubs are the usual case), the return address is popped by hand with
    /// [`RegisterContext::pop_return_address`] and the walk continues from
    /// the caller.
    pub fn walk<L, U>(
        &self,
        context: &RegisterContext,
        stack: &CapturedStack<'_>,
        registry: &mut ModuleRegistry<L>,
        unwinder: &mut U,
        frames: &mut Vec<Frame>,
    ) -> WalkEnd
    where
        L: ModuleLoader,
        U: Unwinder + ?Sized,
    {
        let pc = context.instruction_pointer();
        if self.trampoline.is_some_and(|range| range.contains(pc)) {
            frames.push(Frame::new(pc, registry.resolve(pc)));
            return WalkEnd::Trampoline;
        }

        let start = frames.len();
        let mut current = context.clone();
        let end = walk_from(&mut current, stack, registry, unwinder, frames, true);
        if frames.len() - start != 1 || end == WalkEnd::Completed {
            return end;
        }

        let Some(leaf_module) = registry.module(frames[start].module_index) else {
            return end;
        };
        if unwinder.has_unwind_info(pc, leaf_module) {
            return end;
        }

        let mut caller = context.clone();
        if !caller.pop_return_address(stack) {
            return end;
        }
        walk_from(&mut caller, stack, registry, unwinder, frames, false)
    }
}

fn walk_from<L, U>(
    context: &mut RegisterContext,
    stack: &CapturedStack<'_>,
    registry: &mut ModuleRegistry<L>,
    unwinder: &mut U,
    frames: &mut Vec<Frame>,
    mut is_first_frame: bool,
) -> WalkEnd
where
    L: ModuleLoader,
    U: Unwinder + ?Sized,
{
    loop {
        if frames.len() >= MAX_FRAMES {
            return WalkEnd::Truncated;
        }

        let pc = context.instruction_pointer();
        let index = registry.resolve(pc);
        frames.push(Frame::new(pc, index));
        if index == ModuleIndex::UNKNOWN {
            return WalkEnd::UnknownModule;
        }
        let Some(module) = registry.module(index) else {
            return WalkEnd::Aborted;
        };

        let previous_sp = context.stack_pointer();
        match unwinder.step(context, stack, module, is_first_frame) {
            UnwindResult::Completed => return WalkEnd::Completed,
            UnwindResult::Aborted => return WalkEnd::Aborted,
            UnwindResult::Unfinished => {}
        }

        let sp = context.stack_pointer();
        let moved_up = sp > previous_sp || (is_first_frame && sp == previous_sp);
        if !moved_up || sp < stack.bottom() || sp > stack.top() {
            return WalkEnd::Aborted;
        }
        if context.instruction_pointer() == 0 {
            return WalkEnd::Completed;
        }
        is_first_frame = false;
    }
}
