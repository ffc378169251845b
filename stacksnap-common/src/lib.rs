//! # Shared Data Structures (Sampler ↔ Profile Consumers)
//!
//! Defines the plain data produced by the `stacksnap` sampler and consumed by
//! whatever assembles or ships profiles. Nothing here touches the OS, so the
//! crate is `no_std` (with `alloc`) and can be shared by tooling that only
//! reads profiles.
//!
//! ## Key Types
//!
//! - [`Frame`] - One unwound frame: instruction pointer + module index
//! - [`ModuleIndex`] - Index into a profile's module list, or the unknown sentinel
//! - [`Module`] - One loaded binary image (address range, build id, path)
//! - [`Sample`] - Frames of one tick plus its [`SampleAnnotation`]
//!
//! ## Ownership
//!
//! A [`Sample`] owns its frames. Frames refer to modules by index only; the
//! module list itself belongs to the profile the sample ends up in, so that
//! modules are deduplicated across all samples of a burst.

#![no_std]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

// ============================================================================
// Limits
// ============================================================================

/// Maximum number of frames a single sample may hold
///
/// Bounds the stack walk so a cyclic or corrupted frame chain cannot spin
/// forever. Real call stacks deeper than this are truncated at the root end.
pub const MAX_FRAMES: usize = 1024;

// ============================================================================
// Module Index
// ============================================================================

/// Index of a [`Module`] in a profile's module list
///
/// **Value**:
/// - `0..N`: Valid index into the module list of the enclosing profile
/// - [`ModuleIndex::UNKNOWN`]: The address did not resolve to any loaded image
///   (JIT code, unmapped memory, a module unloaded before the walk)
///
/// Frames tagged `UNKNOWN` are expected in real profiles and are not a sign of
/// corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModuleIndex(pub usize);

impl ModuleIndex {
    /// Sentinel for "no owning module"
    pub const UNKNOWN: ModuleIndex = ModuleIndex(usize::MAX);

    /// Returns true if this index refers to a module
    #[must_use]
    pub fn is_known(self) -> bool {
        self != Self::UNKNOWN
    }

    /// The index as an `Option`, `None` for the sentinel
    #[must_use]
    pub fn get(self) -> Option<usize> {
        self.is_known().then_some(self.0)
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A single unwound stack frame
///
/// Produced by the stack walker from innermost (leaf) to outermost caller.
/// For every frame except the leaf, `instruction_pointer` is a return
/// address, i.e. it points just past the call instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    /// Instruction pointer (leaf) or return address (callers)
    pub instruction_pointer: usize,

    /// Owning module, or [`ModuleIndex::UNKNOWN`]
    pub module_index: ModuleIndex,
}

impl Frame {
    #[must_use]
    pub fn new(instruction_pointer: usize, module_index: ModuleIndex) -> Self {
        Self { instruction_pointer, module_index }
    }
}

// ============================================================================
// Module
// ============================================================================

/// A loaded binary image
///
/// Identity is the address range `[base_address, base_address + size)`.
/// Created the first time an instruction pointer resolves into it during a
/// session and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Module {
    /// Lowest runtime address of the image mapping
    pub base_address: usize,

    /// Length of the address range owned by this module
    pub size: usize,

    /// Build identifier followed by an age counter, uppercase hex
    ///
    /// **Format** (platform-specific):
    /// - ELF: first 16 bytes of `NT_GNU_BUILD_ID` as a GUID + `0`
    /// - Mach-O: `LC_UUID` + `0`
    /// - PE: CodeView GUID + age
    ///
    /// Empty when the image carries no identifier or its headers are malformed.
    pub unique_id: String,

    /// Path the image was loaded from (may be a pseudo name like `linux-vdso.so.1`)
    pub file_path: String,

    /// `runtime address - link-time address` for this image
    ///
    /// Unwind tables read from the file on disk are expressed in link-time
    /// addresses; subtract this bias from a runtime pc before looking it up.
    pub load_bias: usize,
}

impl Module {
    /// One past the last address owned by this module
    #[must_use]
    pub fn end_address(&self) -> usize {
        self.base_address.saturating_add(self.size)
    }

    /// Check if an address falls within this module
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base_address && address < self.end_address()
    }
}

// ============================================================================
// Sample
// ============================================================================

/// Lightweight per-sample context written while the target thread is suspended
///
/// Only plain integers live here: the annotation callback runs inside the
/// suspension window and must not allocate, so it is handed this struct
/// rather than the whole [`Sample`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SampleAnnotation {
    /// Bitmask of process milestones reached when the sample was taken
    pub process_milestones: u32,
}

impl SampleAnnotation {
    /// Set milestone bit `milestone` (0-31)
    pub fn mark_milestone(&mut self, milestone: u32) {
        debug_assert!(milestone < u32::BITS);
        self.process_milestones |= 1 << milestone;
    }

    #[must_use]
    pub fn has_milestone(&self, milestone: u32) -> bool {
        milestone < u32::BITS && self.process_milestones & (1 << milestone) != 0
    }
}

/// The result of one `record_stack_sample` call
///
/// An empty sample (zero frames) is a legitimate outcome: the thread could not
/// be suspended, its stack did not fit the buffer, or its bounds were corrupt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sample {
    /// Frames, leaf first
    pub frames: Vec<Frame>,

    /// Context stamped onto the sample during suspension
    pub annotation: SampleAnnotation,
}

impl Sample {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to an empty sample, keeping the frame allocation for reuse
    pub fn clear(&mut self) {
        self.frames.clear();
        self.annotation = SampleAnnotation::default();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
