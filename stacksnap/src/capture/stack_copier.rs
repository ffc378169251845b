//! Copy a suspended thread's stack and relocate stack-internal pointers
//!
//! Runs inside the suspension window: no allocation, no logging, no locks.
//! Everything it touches was allocated up front (the [`StackBuffer`] and the
//! [`RegisterContext`]), and failures are reported as a `Copy` error value.
//!
//! ## Relocation
//!
//! Any word of the copied region whose value lies in the original
//! `[bottom, stack_base)` is treated as a pointer into the stack and rewritten
//! to `copy_bottom + (value - bottom)`. Return addresses point into code and
//! are never in that range. The stack pointer, frame pointer and callee-saved
//! registers are rewritten the same way, so the copy can be walked after the
//! thread resumes without touching the live stack again.

#![allow(unsafe_code)] // reads another thread's stack memory

use super::captured_stack::CapturedStack;
use super::register_context::RegisterContext;
use super::stack_buffer::StackBuffer;
use crate::domain::{AddressRange, CaptureError};

const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Where a capture landed, detached from the buffer borrow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackExtent {
    /// Copied range of the live stack
    pub original: AddressRange,

    /// Buffer address of the copied `original.start`
    pub copy_bottom: usize,

    /// Number of words copied
    pub word_count: usize,
}

impl StackExtent {
    /// View of the copied words inside `buffer`
    #[must_use]
    pub fn view<'a>(&self, buffer: &'a StackBuffer) -> CapturedStack<'a> {
        let words = &buffer.words()[..self.word_count];
        CapturedStack::new(words, self.copy_bottom)
    }
}

#[derive(Clone, Copy)]
struct Relocation {
    original: AddressRange,
    copy_bottom: usize,
}

impl Relocation {
    #[inline]
    fn apply(self, value: usize) -> usize {
        if self.original.contains(value) {
            self.copy_bottom + (value - self.original.start)
        } else {
            value
        }
    }
}

/// Check that `[align_down(stack_pointer), stack_base)` is sane and fits `capacity` bytes
///
/// # Errors
///
/// Same conditions as [`copy_stack`].
pub fn check_bounds(stack_pointer: usize, stack_base: usize, capacity: usize) -> Result<(), CaptureError> {
    if stack_pointer >= stack_base {
        return Err(CaptureError::CorruptedBounds { stack_pointer, stack_base });
    }
    let needed = stack_base - (stack_pointer & !(WORD_SIZE - 1));
    if needed > capacity {
        return Err(CaptureError::StackTooLarge { needed, capacity });
    }
    Ok(())
}

/// Copy `[sp, stack_base)` into `buffer` and relocate stack pointers
///
/// On success `context` has its stack pointer, frame pointer and
/// callee-saved registers rewritten to buffer addresses.
///
/// # Errors
///
/// - [`CaptureError::CorruptedBounds`] if the stack pointer is not below
///   `stack_base`
/// - [`CaptureError::StackTooLarge`] if the live stack is larger than the buffer
///
/// Nothing is copied and `context` is untouched in either case.
///
/// # Safety
///
/// `[align_down(sp), stack_base)` must be readable memory that does not change
/// for the duration of the call, i.e. the owning thread is suspended (or the
/// memory belongs to the caller).
pub unsafe fn copy_stack(
    context: &mut RegisterContext,
    stack_base: usize,
    buffer: &mut StackBuffer,
) -> Result<StackExtent, CaptureError> {
    let stack_pointer = context.stack_pointer();
    check_bounds(stack_pointer, stack_base, buffer.size())?;

    let bottom = stack_pointer & !(WORD_SIZE - 1);
    let needed = stack_base - bottom;
    let word_count = needed / WORD_SIZE;
    let relocation = Relocation {
        original: AddressRange::new(bottom, stack_base),
        copy_bottom: buffer.base_address(),
    };

    let source = bottom as *const usize;
    for (index, slot) in buffer.words_mut()[..word_count].iter_mut().enumerate() {
        // Volatile: the memory belongs to another thread and must be read as-is.
        let value = unsafe { std::ptr::read_volatile(source.add(index)) };
        *slot = relocation.apply(value);
    }

    context.set_stack_pointer(relocation.apply(stack_pointer));
    for &register in RegisterContext::CALLEE_SAVED {
        if let Some(value) = context.get(register) {
            context.set(register, relocation.apply(value));
        }
    }

    Ok(StackExtent {
        original: relocation.original,
        copy_bottom: relocation.copy_bottom,
        word_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake live stack backed by a Vec so tests can point registers at it
    fn fake_stack(words: usize) -> Vec<usize> {
        vec![0usize; words]
    }

    #[test]
    fn test_relocates_only_stack_pointers() {
        let mut live = fake_stack(16);
        let bottom = live.as_ptr() as usize;
        let top = bottom + live.len() * WORD_SIZE;

        live[0] = bottom + 4 * WORD_SIZE; // saved frame pointer
        live[1] = 0x5555_0000_1234; // return address
        live[2] = top - WORD_SIZE; // highest slot
        live[3] = top; // one past the end, not inside
        live[4] = bottom - WORD_SIZE; // just below, not inside
        live[5] = 42;
        let expected_unchanged: Vec<usize> = live.clone();

        let mut context = RegisterContext::new();
        context.set_stack_pointer(bottom);
        context.set_frame_pointer(bottom + 8 * WORD_SIZE);
        context.set_instruction_pointer(0x5555_0000_0100);

        let mut buffer = StackBuffer::new(1024);
        let extent = unsafe { copy_stack(&mut context, top, &mut buffer) }.unwrap();
        let copy = buffer.base_address();

        assert_eq!(extent.word_count, 16);
        assert_eq!(extent.copy_bottom, copy);

        let words = buffer.words();
        for (index, &original) in expected_unchanged.iter().enumerate() {
            let expected = if original >= bottom && original < top {
                copy + (original - bottom)
            } else {
                original
            };
            assert_eq!(words[index], expected, "word {index}");
        }
        assert_eq!(words[0], copy + 4 * WORD_SIZE);
        assert_eq!(words[1], 0x5555_0000_1234);
        assert_eq!(words[3], top);

        assert_eq!(context.stack_pointer(), copy);
        assert_eq!(context.frame_pointer(), copy + 8 * WORD_SIZE);
        assert_eq!(context.instruction_pointer(), 0x5555_0000_0100);
    }

    #[test]
    fn test_callee_saved_registers_relocated() {
        let live = fake_stack(8);
        let bottom = live.as_ptr() as usize;
        let top = bottom + live.len() * WORD_SIZE;

        let mut context = RegisterContext::new();
        context.set_stack_pointer(bottom);
        let saved = RegisterContext::CALLEE_SAVED[0];
        context.set(saved, bottom + 2 * WORD_SIZE);

        let mut buffer = StackBuffer::new(256);
        unsafe { copy_stack(&mut context, top, &mut buffer) }.unwrap();

        assert_eq!(context.get(saved), Some(buffer.base_address() + 2 * WORD_SIZE));
    }

    #[test]
    fn test_stack_one_byte_too_large_is_rejected() {
        let live = fake_stack(256);
        let bottom = live.as_ptr() as usize;

        let mut context = RegisterContext::new();
        context.set_stack_pointer(bottom);
        let before = context.clone();

        let mut buffer = StackBuffer::new(1024);
        let result = unsafe { copy_stack(&mut context, bottom + 1025, &mut buffer) };

        assert_eq!(result, Err(CaptureError::StackTooLarge { needed: 1025, capacity: 1024 }));
        assert_eq!(context, before);
    }

    #[test]
    fn test_stack_exactly_buffer_sized_fits() {
        let live = fake_stack(1024 / WORD_SIZE);
        let bottom = live.as_ptr() as usize;

        let mut context = RegisterContext::new();
        context.set_stack_pointer(bottom);

        let mut buffer = StackBuffer::new(1024);
        let extent = unsafe { copy_stack(&mut context, bottom + 1024, &mut buffer) }.unwrap();
        assert_eq!(extent.word_count * WORD_SIZE, 1024);
    }

    #[test]
    fn test_corrupted_bounds_rejected() {
        let mut context = RegisterContext::new();
        context.set_stack_pointer(0x9000);

        let mut buffer = StackBuffer::new(1024);
        let result = unsafe { copy_stack(&mut context, 0x8000, &mut buffer) };
        assert_eq!(
            result,
            Err(CaptureError::CorruptedBounds { stack_pointer: 0x9000, stack_base: 0x8000 })
        );

        context.set_stack_pointer(0x8000);
        let result = unsafe { copy_stack(&mut context, 0x8000, &mut buffer) };
        assert!(matches!(result, Err(CaptureError::CorruptedBounds { .. })));
    }

    #[test]
    fn test_extent_view_reads_copy() {
        let mut live = fake_stack(4);
        live[2] = 0xdead;
        let bottom = live.as_ptr() as usize;
        let top = bottom + live.len() * WORD_SIZE;

        let mut context = RegisterContext::new();
        context.set_stack_pointer(bottom);

        let mut buffer = StackBuffer::new(128);
        let extent = unsafe { copy_stack(&mut context, top, &mut buffer) }.unwrap();
        let view = extent.view(&buffer);

        assert_eq!(view.bottom(), context.stack_pointer());
        assert_eq!(view.read_word(view.bottom() + 2 * WORD_SIZE), Some(0xdead));
        assert_eq!(view.top(), buffer.base_address() + 4 * WORD_SIZE);
    }
}
