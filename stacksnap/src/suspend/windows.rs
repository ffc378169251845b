//! Windows thread suspension through a Win32 thread handle
//!
//! Resuming a suspended thread normally grants it a priority boost. The boost
//! is disabled around `ResumeThread` and the thread's previous setting is
//! restored afterwards, so sampling does not change how the target is
//! scheduled.

#![allow(unsafe_code)] // Win32 thread APIs

use super::ThreadDelegate;
use crate::capture::RegisterContext;
use crate::domain::{SamplerError, Tid};
use gimli::X86_64;
use windows_sys::Win32::Foundation::{CloseHandle, BOOL, FALSE, HANDLE, TRUE};
use windows_sys::Win32::System::Diagnostics::Debug::{GetThreadContext, CONTEXT, CONTEXT_FULL_AMD64};
use windows_sys::Win32::System::Threading::{
    GetCurrentThreadId, GetCurrentThreadStackLimits, GetThreadPriorityBoost, OpenThread,
    ResumeThread, SetThreadPriorityBoost, SuspendThread, THREAD_GET_CONTEXT,
    THREAD_QUERY_INFORMATION, THREAD_SET_INFORMATION, THREAD_SUSPEND_RESUME,
};

/// Identity of a thread that can be sampled
///
/// Must be created on the thread it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingThreadToken {
    tid: Tid,
    stack_base: usize,
}

impl SamplingThreadToken {
    /// Describe the calling thread
    ///
    /// # Errors
    ///
    /// Fails if the stack limits of the calling thread are unavailable.
    pub fn current() -> Result<Self, SamplerError> {
        let tid = Tid(unsafe { GetCurrentThreadId() });
        let mut low = 0usize;
        let mut high = 0usize;
        unsafe { GetCurrentThreadStackLimits(&mut low, &mut high) };
        if high == 0 {
            return Err(SamplerError::StackBoundsUnavailable(tid));
        }
        Ok(Self { tid, stack_base: high })
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

/// Owns a thread handle opened with suspend and context access
#[derive(Debug)]
pub struct WindowsThreadDelegate {
    handle: HANDLE,
    stack_base: usize,
}

// The handle is a process-wide kernel object reference.
unsafe impl Send for WindowsThreadDelegate {}

impl WindowsThreadDelegate {
    /// # Errors
    ///
    /// Fails if the thread cannot be opened (it exited, or access is denied).
    pub fn new(token: SamplingThreadToken) -> Result<Self, SamplerError> {
        let access = THREAD_GET_CONTEXT
            | THREAD_SUSPEND_RESUME
            | THREAD_QUERY_INFORMATION
            | THREAD_SET_INFORMATION;
        let handle = unsafe { OpenThread(access, FALSE, token.tid.0) };
        if handle == 0 {
            return Err(SamplerError::ThreadHandleFailed {
                tid: token.tid,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self { handle, stack_base: token.stack_base })
    }
}

impl Drop for WindowsThreadDelegate {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}

impl ThreadDelegate for WindowsThreadDelegate {
    fn suspend(&self) -> bool {
        unsafe { SuspendThread(self.handle) != u32::MAX }
    }

    fn resume(&self) -> bool {
        let mut boost_was_disabled: BOOL = FALSE;
        let got_boost_state =
            unsafe { GetThreadPriorityBoost(self.handle, &mut boost_was_disabled) } != 0;
        if got_boost_state {
            unsafe { SetThreadPriorityBoost(self.handle, TRUE) };
        }

        let resumed = unsafe { ResumeThread(self.handle) } != u32::MAX;

        if got_boost_state {
            unsafe { SetThreadPriorityBoost(self.handle, boost_was_disabled) };
        }
        resumed
    }

    fn thread_context(&self, context: &mut RegisterContext) -> bool {
        let mut native: CONTEXT = unsafe { std::mem::zeroed() };
        native.ContextFlags = CONTEXT_FULL_AMD64;
        if unsafe { GetThreadContext(self.handle, &mut native) } == 0 {
            return false;
        }
        registers_from_context(&native, context);
        true
    }

    fn stack_base_address(&self) -> usize {
        self.stack_base
    }
}

/// Copy the integer registers of a native `CONTEXT`
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn registers_from_context(native: &CONTEXT, context: &mut RegisterContext) {
    let registers = [
        (X86_64::RAX, native.Rax),
        (X86_64::RDX, native.Rdx),
        (X86_64::RCX, native.Rcx),
        (X86_64::RBX, native.Rbx),
        (X86_64::RSI, native.Rsi),
        (X86_64::RDI, native.Rdi),
        (X86_64::RBP, native.Rbp),
        (X86_64::RSP, native.Rsp),
        (X86_64::R8, native.R8),
        (X86_64::R9, native.R9),
        (X86_64::R10, native.R10),
        (X86_64::R11, native.R11),
        (X86_64::R12, native.R12),
        (X86_64::R13, native.R13),
        (X86_64::R14, native.R14),
        (X86_64::R15, native.R15),
        (X86_64::RA, native.Rip),
    ];
    for (register, value) in registers {
        context.set(register, value as usize);
    }
}

/// Build a native `CONTEXT` holding `context`'s integer registers
pub(crate) fn context_from_registers(context: &RegisterContext) -> CONTEXT {
    let mut native: CONTEXT = unsafe { std::mem::zeroed() };
    native.ContextFlags = CONTEXT_FULL_AMD64;
    let reg = |register| context.get(register).unwrap_or(0) as u64;
    native.Rax = reg(X86_64::RAX);
    native.Rdx = reg(X86_64::RDX);
    native.Rcx = reg(X86_64::RCX);
    native.Rbx = reg(X86_64::RBX);
    native.Rsi = reg(X86_64::RSI);
    native.Rdi = reg(X86_64::RDI);
    native.Rbp = reg(X86_64::RBP);
    native.Rsp = reg(X86_64::RSP);
    native.R8 = reg(X86_64::R8);
    native.R9 = reg(X86_64::R9);
    native.R10 = reg(X86_64::R10);
    native.R11 = reg(X86_64::R11);
    native.R12 = reg(X86_64::R12);
    native.R13 = reg(X86_64::R13);
    native.R14 = reg(X86_64::R14);
    native.R15 = reg(X86_64::R15);
    native.Rip = reg(X86_64::RA);
    native
}
