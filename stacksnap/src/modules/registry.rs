//! Session-scoped instruction pointer → module index lookup
//!
//! The registry memoises loader answers as address ranges, keyed by range
//! start in a `BTreeMap`, and appends each newly seen image to the session's
//! module list. Indices handed out are positions in that list, so they stay
//! valid until the next [`reset`](ModuleRegistry::reset).

use super::loader::ModuleLoader;
use crate::domain::AddressRange;
use log::{debug, warn};
use stacksnap_common::{Module, ModuleIndex};
use std::collections::BTreeMap;

pub struct ModuleRegistry<L: ModuleLoader> {
    loader: L,
    /// range start → (range end, index)
    ranges: BTreeMap<usize, (usize, ModuleIndex)>,
    modules: Vec<Module>,
}

impl<L: ModuleLoader> ModuleRegistry<L> {
    pub fn new(loader: L) -> Self {
        Self { loader, ranges: BTreeMap::new(), modules: Vec::new() }
    }

    /// Module index owning `address`, or [`ModuleIndex::UNKNOWN`]
    ///
    /// Cache hits never reach the loader. An image that the loader reports
    /// overlapping an already registered range is rejected: ranges within one
    /// session never overlap.
    pub fn resolve(&mut self, address: usize) -> ModuleIndex {
        if let Some(index) = self.cached(address) {
            return index;
        }

        let Some(module) = self.loader.module_for_address(address) else {
            return ModuleIndex::UNKNOWN;
        };
        let range = AddressRange::new(module.base_address, module.end_address());
        if !range.contains(address) {
            debug!("Loader returned {range} for 0x{address:x}, which it does not contain");
            return ModuleIndex::UNKNOWN;
        }
        if let Some(existing) = self.overlapping(range) {
            warn!(
                "Module {} at {range} overlaps registered range {existing}; ignoring",
                module.file_path
            );
            return ModuleIndex::UNKNOWN;
        }

        let index = ModuleIndex(self.modules.len());
        debug!(
            "Module #{} {} at {range} (id: {})",
            index.0,
            module.file_path,
            if module.unique_id.is_empty() { "<none>" } else { module.unique_id.as_str() }
        );
        self.ranges.insert(range.start, (range.end, index));
        self.modules.push(module);
        index
    }

    /// Module for an index handed out by [`resolve`](Self::resolve)
    #[must_use]
    pub fn module(&self, index: ModuleIndex) -> Option<&Module> {
        self.modules.get(index.get()?)
    }

    /// Modules discovered so far, in discovery order
    #[must_use]
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Forget every cached range and module (start of a new session)
    pub fn reset(&mut self) {
        self.ranges.clear();
        self.modules.clear();
    }

    /// Hand the module list to the caller and forget the cache
    pub fn take_modules(&mut self) -> Vec<Module> {
        self.ranges.clear();
        std::mem::take(&mut self.modules)
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut L {
        &mut self.loader
    }

    fn cached(&self, address: usize) -> Option<ModuleIndex> {
        let (_, &(end, index)) = self.ranges.range(..=address).next_back()?;
        (address < end).then_some(index)
    }

    /// Registered range overlapping `range`, if any
    fn overlapping(&self, range: AddressRange) -> Option<AddressRange> {
        let (&start, &(end, _)) = self.ranges.range(..range.end).next_back()?;
        let existing = AddressRange::new(start, end);
        existing.overlaps(&range).then_some(existing)
    }
}
