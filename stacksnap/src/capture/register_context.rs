//! Typed register set of a suspended thread
//!
//! Registers are stored by DWARF register number so the CFI unwinder can
//! address them directly through [`gimli::Register`]. Named accessors cover
//! what the copier, the walker and the frame-pointer unwinder need.

use super::captured_stack::CapturedStack;
use gimli::Register;

#[cfg(target_arch = "x86_64")]
mod arch {
    use gimli::{Register, X86_64};

    /// rax..r15 plus the return-address column (rip)
    pub const REGISTER_COUNT: usize = 17;

    pub const INSTRUCTION_POINTER: Register = X86_64::RA;
    pub const STACK_POINTER: Register = X86_64::RSP;
    pub const FRAME_POINTER: Register = X86_64::RBP;
    pub const RETURN_ADDRESS: Register = X86_64::RA;

    #[cfg(not(windows))]
    pub const CALLEE_SAVED: &[Register] = &[
        X86_64::RBX,
        X86_64::RBP,
        X86_64::R12,
        X86_64::R13,
        X86_64::R14,
        X86_64::R15,
    ];

    #[cfg(windows)]
    pub const CALLEE_SAVED: &[Register] = &[
        X86_64::RBX,
        X86_64::RBP,
        X86_64::RSI,
        X86_64::RDI,
        X86_64::R12,
        X86_64::R13,
        X86_64::R14,
        X86_64::R15,
    ];
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use gimli::{AArch64, Register};

    /// x0..x30, sp, pc
    pub const REGISTER_COUNT: usize = 33;

    pub const INSTRUCTION_POINTER: Register = Register(32);
    pub const STACK_POINTER: Register = AArch64::SP;
    pub const FRAME_POINTER: Register = AArch64::X29;
    pub const RETURN_ADDRESS: Register = AArch64::X30;
    pub const LINK_REGISTER: Register = AArch64::X30;

    pub const CALLEE_SAVED: &[Register] = &[
        AArch64::X19,
        AArch64::X20,
        AArch64::X21,
        AArch64::X22,
        AArch64::X23,
        AArch64::X24,
        AArch64::X25,
        AArch64::X26,
        AArch64::X27,
        AArch64::X28,
        AArch64::X29,
    ];
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("stacksnap supports x86_64 and aarch64 only");

/// Integer register state of one thread
#[derive(Clone, PartialEq, Eq)]
pub struct RegisterContext {
    regs: [usize; arch::REGISTER_COUNT],
}

impl RegisterContext {
    pub const INSTRUCTION_POINTER: Register = arch::INSTRUCTION_POINTER;
    pub const STACK_POINTER: Register = arch::STACK_POINTER;
    pub const FRAME_POINTER: Register = arch::FRAME_POINTER;

    /// Column the CFI tables use for the caller's pc
    pub const RETURN_ADDRESS: Register = arch::RETURN_ADDRESS;

    /// Registers a callee must preserve, frame pointer included
    pub const CALLEE_SAVED: &'static [Register] = arch::CALLEE_SAVED;

    #[must_use]
    pub fn new() -> Self {
        Self { regs: [0; arch::REGISTER_COUNT] }
    }

    /// Read a register by DWARF number, `None` if this context does not track it
    #[must_use]
    pub fn get(&self, register: Register) -> Option<usize> {
        self.regs.get(usize::from(register.0)).copied()
    }

    /// Write a register by DWARF number; returns false for untracked registers
    pub fn set(&mut self, register: Register, value: usize) -> bool {
        match self.regs.get_mut(usize::from(register.0)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn instruction_pointer(&self) -> usize {
        self.reg(Self::INSTRUCTION_POINTER)
    }

    pub fn set_instruction_pointer(&mut self, value: usize) {
        self.set(Self::INSTRUCTION_POINTER, value);
    }

    #[must_use]
    pub fn stack_pointer(&self) -> usize {
        self.reg(Self::STACK_POINTER)
    }

    pub fn set_stack_pointer(&mut self, value: usize) {
        self.set(Self::STACK_POINTER, value);
    }

    #[must_use]
    pub fn frame_pointer(&self) -> usize {
        self.reg(Self::FRAME_POINTER)
    }

    pub fn set_frame_pointer(&mut self, value: usize) {
        self.set(Self::FRAME_POINTER, value);
    }

    #[cfg(target_arch = "aarch64")]
    #[must_use]
    pub fn link_register(&self) -> usize {
        self.reg(arch::LINK_REGISTER)
    }

    #[cfg(target_arch = "aarch64")]
    pub fn set_link_register(&mut self, value: usize) {
        self.set(arch::LINK_REGISTER, value);
    }

    /// Step out of a frame that has not set up any frame of its own
    ///
    /// x86_64: the return address is the word at `sp`; pop it into the
    /// instruction pointer. aarch64: the return address is still in the link
    /// register. Returns false (context untouched) if no plausible return
    /// address is available.
    pub fn pop_return_address(&mut self, stack: &CapturedStack<'_>) -> bool {
        #[cfg(target_arch = "x86_64")]
        {
            let sp = self.stack_pointer();
            let Some(return_address) = stack.read_word(sp) else {
                return false;
            };
            if return_address == 0 {
                return false;
            }
            self.set_instruction_pointer(return_address);
            self.set_stack_pointer(sp + std::mem::size_of::<usize>());
            true
        }

        #[cfg(target_arch = "aarch64")]
        {
            let _ = stack;
            let return_address = self.link_register();
            if return_address == 0 || return_address == self.instruction_pointer() {
                return false;
            }
            self.set_instruction_pointer(return_address);
            true
        }
    }

    fn reg(&self, register: Register) -> usize {
        self.regs[usize::from(register.0)]
    }
}

impl Default for RegisterContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegisterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterContext")
            .field("ip", &format_args!("0x{:x}", self.instruction_pointer()))
            .field("sp", &format_args!("0x{:x}", self.stack_pointer()))
            .field("fp", &format_args!("0x{:x}", self.frame_pointer()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::StackBuffer;

    #[test]
    fn test_named_accessors_alias_dwarf_numbers() {
        let mut context = RegisterContext::new();
        context.set_stack_pointer(0x7000);
        context.set_frame_pointer(0x7010);
        context.set_instruction_pointer(0x40_1000);

        assert_eq!(context.get(RegisterContext::STACK_POINTER), Some(0x7000));
        assert_eq!(context.get(RegisterContext::FRAME_POINTER), Some(0x7010));
        assert_eq!(context.get(RegisterContext::INSTRUCTION_POINTER), Some(0x40_1000));
        assert!(RegisterContext::CALLEE_SAVED.contains(&RegisterContext::FRAME_POINTER));
    }

    #[test]
    fn test_untracked_register() {
        let mut context = RegisterContext::new();
        assert_eq!(context.get(Register(200)), None);
        assert!(!context.set(Register(200), 1));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_pop_return_address_x86_64() {
        let mut buffer = StackBuffer::new(64);
        let base = buffer.base_address();
        buffer.words_mut()[0] = 0x40_2222;
        let stack = CapturedStack::new(buffer.words(), base);

        let mut context = RegisterContext::new();
        context.set_instruction_pointer(0x7fff_0000_1000);
        context.set_stack_pointer(base);

        assert!(context.pop_return_address(&stack));
        assert_eq!(context.instruction_pointer(), 0x40_2222);
        assert_eq!(context.stack_pointer(), base + 8);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_pop_return_address_aarch64() {
        let buffer = StackBuffer::new(64);
        let stack = CapturedStack::new(buffer.words(), buffer.base_address());

        let mut context = RegisterContext::new();
        context.set_instruction_pointer(0x7fff_0000_1000);
        context.set_link_register(0x40_2222);

        assert!(context.pop_return_address(&stack));
        assert_eq!(context.instruction_pointer(), 0x40_2222);
    }

    #[test]
    fn test_pop_return_address_outside_copy_fails() {
        let buffer = StackBuffer::new(64);
        let stack = CapturedStack::new(buffer.words(), buffer.base_address());

        let mut context = RegisterContext::new();
        context.set_instruction_pointer(0x1234);
        context.set_stack_pointer(buffer.base_address() + buffer.size());
        let before = context.clone();

        assert!(!context.pop_return_address(&stack));
        assert_eq!(context, before);
    }
}
