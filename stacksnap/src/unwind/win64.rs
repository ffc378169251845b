//! Windows x64 unwinding through the OS unwinder
//!
//! Every non-leaf x64 function has a `RUNTIME_FUNCTION` entry in `.pdata`.
//! `RtlVirtualUnwind` interprets it against the copied stack: the copy is
//! ordinary process memory and the context already points into it. A frame
//! without an entry is a leaf that has not touched `rsp`, so its return
//! address is the word at `[rsp]`.

#![allow(unsafe_code)] // RtlLookupFunctionEntry / RtlVirtualUnwind

use super::{UnwindResult, Unwinder};
use crate::capture::{CapturedStack, RegisterContext};
use crate::suspend::windows::{context_from_registers, registers_from_context};
use stacksnap_common::Module;
use windows_sys::Win32::System::Diagnostics::Debug::{
    RtlLookupFunctionEntry, RtlVirtualUnwind, IMAGE_RUNTIME_FUNCTION_ENTRY,
};

/// `RtlVirtualUnwind` handler type: do not look for exception handlers
const UNW_FLAG_NHANDLER: u32 = 0;

#[derive(Debug, Default)]
pub struct Win64Unwinder;

impl Win64Unwinder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Function table entry covering `pc`, with the image base it is relative to
fn function_entry(pc: usize) -> Option<(*const IMAGE_RUNTIME_FUNCTION_ENTRY, u64)> {
    let mut image_base = 0u64;
    let entry =
        unsafe { RtlLookupFunctionEntry(pc as u64, &mut image_base, std::ptr::null_mut()) };
    (!entry.is_null()).then_some((entry.cast_const(), image_base))
}

impl Unwinder for Win64Unwinder {
    fn has_unwind_info(&mut self, pc: usize, _module: &Module) -> bool {
        function_entry(pc).is_some()
    }

    fn step(
        &mut self,
        context: &mut RegisterContext,
        stack: &CapturedStack<'_>,
        _module: &Module,
        is_first_frame: bool,
    ) -> UnwindResult {
        let pc = context.instruction_pointer();
        if !stack.contains(context.stack_pointer()) {
            return UnwindResult::Aborted;
        }

        let Some((entry, image_base)) = function_entry(pc) else {
            // Only the interrupted frame can be a leaf.
            if is_first_frame && context.pop_return_address(stack) {
                return UnwindResult::Unfinished;
            }
            return UnwindResult::Aborted;
        };

        let mut native = context_from_registers(context);
        let mut handler_data = std::ptr::null_mut();
        let mut establisher_frame = 0u64;
        unsafe {
            RtlVirtualUnwind(
                UNW_FLAG_NHANDLER,
                image_base,
                pc as u64,
                entry,
                &mut native,
                &mut handler_data,
                &mut establisher_frame,
                std::ptr::null_mut(),
            );
        }

        if native.Rip == 0 {
            return UnwindResult::Completed;
        }
        #[allow(clippy::cast_possible_truncation)]
        let new_sp = native.Rsp as usize;
        if new_sp < stack.bottom() || new_sp > stack.top() {
            return UnwindResult::Aborted;
        }

        registers_from_context(&native, context);
        UnwindResult::Unfinished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_module() -> Module {
        Module {
            base_address: 0,
            size: usize::MAX,
            unique_id: String::new(),
            file_path: String::new(),
            load_bias: 0,
        }
    }

    #[test]
    fn test_own_code_has_function_entry() {
        // Calls into ntdll, so it has a prologue and a .pdata entry.
        let pc = function_entry as *const () as usize + 1;
        assert!(Win64Unwinder::new().has_unwind_info(pc, &dummy_module()));
    }

    #[test]
    fn test_unmapped_address_has_no_function_entry() {
        assert!(!Win64Unwinder::new().has_unwind_info(0x10, &dummy_module()));
    }

    #[test]
    fn test_leaf_on_non_first_frame_aborts() {
        use crate::capture::StackBuffer;

        let buffer = StackBuffer::new(256);
        let stack = CapturedStack::new(buffer.words(), buffer.base_address());
        let mut context = RegisterContext::new();
        context.set_instruction_pointer(0x10);
        context.set_stack_pointer(buffer.base_address());
        let before = context.clone();

        let result = Win64Unwinder::new().step(&mut context, &stack, &dummy_module(), false);

        assert_eq!(result, UnwindResult::Aborted);
        assert_eq!(context, before);
    }
}
