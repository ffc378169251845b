//! Frame-record unwinding
//!
//! With frame pointers kept, every frame stores a two-word record at `fp`:
//!
//! ```text
//! fp + W  ─▶ return address into the caller
//! fp      ─▶ caller's fp
//! ```
//!
//! Records must sit inside the copy, above the current stack pointer, word
//! aligned, and each caller record must be strictly above its callee's.

use super::{UnwindResult, Unwinder};
use crate::capture::{CapturedStack, RegisterContext};
use stacksnap_common::Module;

const WORD_SIZE: usize = std::mem::size_of::<usize>();

#[derive(Debug, Default, Clone, Copy)]
pub struct FramePointerUnwinder;

impl FramePointerUnwinder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Follow one frame record; shared with the CFI unwinder's fallback path
    pub fn step_frame(context: &mut RegisterContext, stack: &CapturedStack<'_>) -> UnwindResult {
        let fp = context.frame_pointer();
        if fp == 0 {
            return UnwindResult::Completed;
        }
        if fp % WORD_SIZE != 0 || fp < context.stack_pointer() {
            return UnwindResult::Aborted;
        }

        let (Some(caller_fp), Some(return_address)) =
            (stack.read_word(fp), stack.read_word(fp + WORD_SIZE))
        else {
            return UnwindResult::Aborted;
        };

        if return_address == 0 {
            return UnwindResult::Completed;
        }
        if caller_fp != 0 && caller_fp <= fp {
            return UnwindResult::Aborted;
        }

        context.set_frame_pointer(caller_fp);
        context.set_stack_pointer(fp + 2 * WORD_SIZE);
        context.set_instruction_pointer(return_address);
        UnwindResult::Unfinished
    }
}

impl Unwinder for FramePointerUnwinder {
    fn has_unwind_info(&mut self, _pc: usize, _module: &Module) -> bool {
        true
    }

    fn step(
        &mut self,
        context: &mut RegisterContext,
        stack: &CapturedStack<'_>,
        _module: &Module,
        _is_first_frame: bool,
    ) -> UnwindResult {
        Self::step_frame(context, stack)
    }
}
