//! Pre-allocated destination for stack copies
//!
//! The buffer is allocated once, before any thread is suspended, and reused
//! for every sample of a session. Storage is a slice of machine words so the
//! copy is always pointer-aligned.

#![allow(unsafe_code)] // getrlimit / GetCurrentThreadStackLimits

use log::debug;

/// Default thread stack reservation on Windows
#[cfg(windows)]
const WINDOWS_DEFAULT_STACK_RESERVE: usize = 1024 * 1024;

/// Word-aligned, fixed-size buffer that receives a copy of a thread's stack
pub struct StackBuffer {
    words: Box<[usize]>,
}

impl StackBuffer {
    /// Size of one stack slot in bytes
    pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

    /// Allocate a buffer of at least `size_bytes` bytes (rounded up to a word)
    #[must_use]
    pub fn new(size_bytes: usize) -> Self {
        let words = size_bytes.div_ceil(Self::WORD_SIZE);
        Self { words: vec![0usize; words].into_boxed_slice() }
    }

    /// Allocate a buffer sized for the largest stack a thread may have
    ///
    /// Returns `None` when the platform reports no finite maximum (e.g. an
    /// unlimited `RLIMIT_STACK`) or sizing is unsupported.
    #[must_use]
    pub fn for_current_platform() -> Option<Self> {
        let size = max_stack_size()?;
        debug!("Allocating {} KB stack buffer", size / 1024);
        Some(Self::new(size))
    }

    /// Capacity in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.words.len() * Self::WORD_SIZE
    }

    /// Address of the first byte of the buffer
    ///
    /// Pointers rewritten during capture are expressed relative to this.
    #[must_use]
    pub fn base_address(&self) -> usize {
        self.words.as_ptr() as usize
    }

    #[must_use]
    pub fn words(&self) -> &[usize] {
        &self.words
    }

    pub fn words_mut(&mut self) -> &mut [usize] {
        &mut self.words
    }
}

impl std::fmt::Debug for StackBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackBuffer")
            .field("base_address", &format_args!("0x{:x}", self.base_address()))
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(unix)]
fn max_stack_size() -> Option<usize> {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    if unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) } != 0 {
        return None;
    }
    if limit.rlim_cur == libc::RLIM_INFINITY {
        return None;
    }
    usize::try_from(limit.rlim_cur).ok().filter(|&size| size > 0)
}

#[cfg(windows)]
fn max_stack_size() -> Option<usize> {
    Some(WINDOWS_DEFAULT_STACK_RESERVE)
}

#[cfg(not(any(unix, windows)))]
fn max_stack_size() -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_rounds_up_to_word() {
        let buffer = StackBuffer::new(StackBuffer::WORD_SIZE * 3 + 1);
        assert_eq!(buffer.size(), StackBuffer::WORD_SIZE * 4);
        assert_eq!(buffer.words().len(), 4);
    }

    #[test]
    fn test_base_address_is_word_aligned() {
        let buffer = StackBuffer::new(1024);
        assert_eq!(buffer.base_address() % StackBuffer::WORD_SIZE, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_platform_buffer_matches_rlimit() {
        let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) }, 0);

        let buffer = StackBuffer::for_current_platform();
        if limit.rlim_cur == libc::RLIM_INFINITY {
            assert!(buffer.is_none());
        } else {
            let buffer = buffer.expect("finite rlimit should size a buffer");
            assert!(buffer.size() as u64 >= limit.rlim_cur as u64);
        }
    }
}
