//! Profile export
//!
//! Writes a finished [`CallStackProfile`](crate::profile::CallStackProfile)
//! as JSON for inspection or for offline symbolization.

pub mod profile_json;

pub use profile_json::ProfileJsonExporter;
