//! Module resolution
//!
//! - `loader`: the [`ModuleLoader`] seam and a fixed-table loader
//! - `registry`: per-session cache of resolved ranges
//! - `unique_id`: build-id extraction and formatting
//! - `linux` / `macos` / `windows`: native loaders

pub mod loader;
pub mod registry;
pub mod unique_id;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(windows)]
pub mod windows;

pub use loader::{FixedModuleLoader, ModuleLoader};
pub use registry::ModuleRegistry;

#[cfg(target_os = "linux")]
pub use linux::LinuxModuleLoader as NativeModuleLoader;
#[cfg(target_os = "macos")]
pub use macos::MacModuleLoader as NativeModuleLoader;
#[cfg(windows)]
pub use windows::WindowsModuleLoader as NativeModuleLoader;
