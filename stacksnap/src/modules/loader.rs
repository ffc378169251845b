//! Loader queries: which loaded image owns an address
//!
//! Platform loaders are queried only on a registry cache miss, and always
//! after the target thread has resumed, so they may allocate and take the
//! dynamic loader's lock.

use stacksnap_common::Module;

/// Source of module descriptors for instruction pointers
pub trait ModuleLoader {
    /// The loaded image containing `address`, or `None` if no image owns it
    /// (JIT code, unmapped memory, an image unloaded since capture)
    fn module_for_address(&self, address: usize) -> Option<Module>;
}

/// Loader over a fixed table of images
///
/// Serves synthetic stacks and profiles replayed against a known layout.
#[derive(Debug, Clone, Default)]
pub struct FixedModuleLoader {
    modules: Vec<Module>,
}

impl FixedModuleLoader {
    #[must_use]
    pub fn new(modules: Vec<Module>) -> Self {
        Self { modules }
    }

    /// Replace the whole table, as if every image had been unloaded and the
    /// new set loaded
    pub fn replace(&mut self, modules: Vec<Module>) {
        self.modules = modules;
    }
}

impl ModuleLoader for FixedModuleLoader {
    fn module_for_address(&self, address: usize) -> Option<Module> {
        self.modules.iter().find(|module| module.contains(address)).cloned()
    }
}
