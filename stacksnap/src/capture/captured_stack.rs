//! Read-only view of a copied stack
//!
//! After capture the rewritten stack lives at the start of the
//! [`StackBuffer`](super::StackBuffer). Registers and saved frame pointers
//! already refer to buffer addresses, so unwinders keep working in plain
//! addresses; every read is translated to a word offset and bounds-checked.

/// Copied stack region `[bottom, top)` in buffer addresses
#[derive(Clone, Copy)]
pub struct CapturedStack<'a> {
    words: &'a [usize],
    bottom: usize,
}

impl<'a> CapturedStack<'a> {
    const WORD_SIZE: usize = std::mem::size_of::<usize>();

    /// View `words`, whose first element lives at address `bottom`
    #[must_use]
    pub fn new(words: &'a [usize], bottom: usize) -> Self {
        Self { words, bottom }
    }

    /// Lowest address of the copy (the captured stack pointer, word aligned)
    #[must_use]
    pub fn bottom(&self) -> usize {
        self.bottom
    }

    /// One past the highest address of the copy (the relocated stack base)
    #[must_use]
    pub fn top(&self) -> usize {
        self.bottom + self.words.len() * Self::WORD_SIZE
    }

    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.bottom && address < self.top()
    }

    /// Read the word at `address`
    ///
    /// Returns `None` for addresses outside the copy or not word aligned.
    #[must_use]
    pub fn read_word(&self, address: usize) -> Option<usize> {
        let offset = address.checked_sub(self.bottom)?;
        if offset % Self::WORD_SIZE != 0 {
            return None;
        }
        self.words.get(offset / Self::WORD_SIZE).copied()
    }
}

impl std::fmt::Debug for CapturedStack<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CapturedStack(0x{:x}-0x{:x})", self.bottom, self.top())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_word_bounds() {
        let words = [10usize, 20, 30];
        let stack = CapturedStack::new(&words, 0x1000);
        let w = std::mem::size_of::<usize>();

        assert_eq!(stack.read_word(0x1000), Some(10));
        assert_eq!(stack.read_word(0x1000 + 2 * w), Some(30));
        assert_eq!(stack.read_word(0x1000 + 3 * w), None);
        assert_eq!(stack.read_word(0x0ff8), None);
        assert_eq!(stack.read_word(0x1001), None);
        assert_eq!(stack.top(), 0x1000 + 3 * w);
    }
}
