//! macOS thread suspension through the Mach thread port

#![allow(unsafe_code)] // Mach thread APIs

use super::ThreadDelegate;
use crate::capture::RegisterContext;
use crate::domain::{SamplerError, Tid};
use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_types::thread_act_t;

/// Identity of a thread that can be sampled
///
/// Must be created on the thread it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingThreadToken {
    port: thread_act_t,
    tid: Tid,
    stack_base: usize,
}

impl SamplingThreadToken {
    /// Describe the calling thread
    ///
    /// # Errors
    ///
    /// Fails if the stack address of the calling thread is unavailable.
    pub fn current() -> Result<Self, SamplerError> {
        let port = unsafe { mach2::mach_init::mach_thread_self() };
        let tid = Tid(port);
        let stack_base = unsafe { libc::pthread_get_stackaddr_np(libc::pthread_self()) } as usize;
        if stack_base == 0 {
            return Err(SamplerError::StackBoundsUnavailable(tid));
        }
        Ok(Self { port, tid, stack_base })
    }

    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[must_use]
    pub fn stack_base(&self) -> usize {
        self.stack_base
    }
}

#[derive(Debug)]
pub struct MacThreadDelegate {
    token: SamplingThreadToken,
}

impl MacThreadDelegate {
    /// # Errors
    ///
    /// Never fails on macOS; the signature matches the other platforms.
    pub fn new(token: SamplingThreadToken) -> Result<Self, SamplerError> {
        Ok(Self { token })
    }
}

impl ThreadDelegate for MacThreadDelegate {
    fn suspend(&self) -> bool {
        unsafe { mach2::thread_act::thread_suspend(self.token.port) == KERN_SUCCESS }
    }

    fn resume(&self) -> bool {
        unsafe { mach2::thread_act::thread_resume(self.token.port) == KERN_SUCCESS }
    }

    #[cfg(target_arch = "x86_64")]
    #[allow(clippy::cast_possible_truncation)]
    fn thread_context(&self, context: &mut RegisterContext) -> bool {
        use gimli::X86_64;

        let mut state = mach2::structs::x86_thread_state64_t::new();
        let mut count = mach2::structs::x86_thread_state64_t::count();
        let kret = unsafe {
            mach2::thread_act::thread_get_state(
                self.token.port,
                mach2::thread_status::x86_THREAD_STATE64,
                std::ptr::addr_of_mut!(state).cast(),
                &mut count,
            )
        };
        if kret != KERN_SUCCESS {
            return false;
        }

        let registers = [
            (X86_64::RAX, state.__rax),
            (X86_64::RDX, state.__rdx),
            (X86_64::RCX, state.__rcx),
            (X86_64::RBX, state.__rbx),
            (X86_64::RSI, state.__rsi),
            (X86_64::RDI, state.__rdi),
            (X86_64::RBP, state.__rbp),
            (X86_64::RSP, state.__rsp),
            (X86_64::R8, state.__r8),
            (X86_64::R9, state.__r9),
            (X86_64::R10, state.__r10),
            (X86_64::R11, state.__r11),
            (X86_64::R12, state.__r12),
            (X86_64::R13, state.__r13),
            (X86_64::R14, state.__r14),
            (X86_64::R15, state.__r15),
            (X86_64::RA, state.__rip),
        ];
        for (register, value) in registers {
            context.set(register, value as usize);
        }
        true
    }

    #[cfg(target_arch = "aarch64")]
    #[allow(clippy::cast_possible_truncation)]
    fn thread_context(&self, context: &mut RegisterContext) -> bool {
        use gimli::AArch64;

        let mut state = mach2::structs::arm_thread_state64_t::new();
        let mut count = mach2::structs::arm_thread_state64_t::count();
        let kret = unsafe {
            mach2::thread_act::thread_get_state(
                self.token.port,
                mach2::thread_status::ARM_THREAD_STATE64,
                std::ptr::addr_of_mut!(state).cast(),
                &mut count,
            )
        };
        if kret != KERN_SUCCESS {
            return false;
        }

        for (number, &value) in (0u16..).zip(state.__x.iter()) {
            context.set(gimli::Register(number), value as usize);
        }
        context.set(AArch64::X29, state.__fp as usize);
        context.set(AArch64::X30, state.__lr as usize);
        context.set_stack_pointer(state.__sp as usize);
        context.set_instruction_pointer(state.__pc as usize);
        true
    }

    fn stack_base_address(&self) -> usize {
        self.token.stack_base
    }
}
